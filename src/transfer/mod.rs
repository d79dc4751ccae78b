//! Upload and download orchestration against the relay.
//!
//! # Overview
//!
//! [`TransferOrchestrator`] composes the [`Uploader`] and [`Downloader`]
//! with the pieces they share:
//!
//! - the forbidden set, consulted by [`strip_forbidden`](TransferOrchestrator::strip_forbidden)
//!   before any outgoing payload is used;
//! - the [`DownloadSlots`] throttle;
//! - the [`HaltGate`]: a batch waits for unrelated halts to clear, then
//!   holds a `transfer:*` halt on scanning while it runs;
//! - one [`OperationSlot`] per direction, so starting a batch cancels the
//!   previous batch in that direction.
//!
//! The relay itself is reached through the [`RelayClient`] trait.

pub mod codec;
pub mod download;
pub mod progress;
pub mod relay;
pub mod slots;
pub mod upload;

#[cfg(test)]
pub(crate) mod testing;

use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

pub use download::{
    copy_buffer_size, DownloadReport, DownloadRequest, Downloader, ReadySignals,
    DEFAULT_READY_POLL, INCOMING_DIR,
};
pub use progress::{Direction, TransferGroup, TransferLedger, TransferProgress, TransferRecord};
pub use relay::{FileSizeInfo, Payload, RelayClient, Ticket, UploadIntent};
pub use slots::{DownloadSlots, DEFAULT_PARALLEL_DOWNLOADS};
pub use upload::{UploadReport, Uploader, DEFAULT_VERIFICATION_WINDOW};

use crate::cancel::OperationSlot;
use crate::governor::CompactionHook;
use crate::halt::{HaltGate, TRANSFER_REASON_PREFIX};
use crate::index::HashIndex;

/// Halt reason held while an upload batch runs.
pub const UPLOAD_HALT_REASON: &str = "transfer:upload";
/// Halt reason held while a download batch runs.
pub const DOWNLOAD_HALT_REASON: &str = "transfer:download";

/// Errors from the transfer pipeline.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// The relay reported a failure.
    #[error("Relay error: {0}")]
    Relay(String),

    /// The relay (or the local index) does not know the hash.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The relay refused access.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Local filesystem failure.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// The path involved
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Compression or decompression failed.
    #[error("Codec error: {0}")]
    Codec(#[source] std::io::Error),

    /// Downloads need a cache root.
    #[error("No cache root configured")]
    NoCacheRoot,

    /// A placed file could not be registered in the index.
    #[error("Could not register {0} in the index")]
    Register(PathBuf),

    /// The batch was cancelled.
    #[error("Transfer cancelled")]
    Cancelled,
}

impl TransferError {
    /// Whether this error is the cancellation class (unwinds quietly).
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Run `future`, giving up with [`TransferError::Cancelled`] once `cancel` fires.
pub(crate) async fn with_cancel<T, F>(
    cancel: &CancellationToken,
    future: F,
) -> Result<T, TransferError>
where
    F: Future<Output = Result<T, TransferError>>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(TransferError::Cancelled),
        result = future => result,
    }
}

/// Hashes the relay refused, stored lowercase.
#[derive(Debug, Default)]
pub struct ForbiddenSet {
    hashes: RwLock<HashSet<String>>,
}

impl ForbiddenSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a forbidden hash.
    pub fn insert(&self, hash: &str) {
        self.hashes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(hash.to_ascii_lowercase());
    }

    /// Whether `hash` is forbidden.
    #[must_use]
    pub fn contains(&self, hash: &str) -> bool {
        self.hashes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&hash.to_ascii_lowercase())
    }

    /// Remove forbidden hashes from `hashes`. Returns how many were removed.
    pub fn strip(&self, hashes: &mut Vec<String>) -> usize {
        let before = hashes.len();
        hashes.retain(|hash| !self.contains(hash));
        before - hashes.len()
    }

    /// All forbidden hashes, sorted.
    #[must_use]
    pub fn snapshot(&self) -> Vec<String> {
        let mut hashes: Vec<String> = self
            .hashes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();
        hashes.sort();
        hashes
    }
}

/// Tunables for the transfer pipeline.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Simultaneous downloads.
    pub parallel_downloads: usize,
    /// How long a verified upload stays verified.
    pub verification_window: Duration,
    /// Rolling timeout between live status checks while waiting for "ready".
    pub ready_poll_interval: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            parallel_downloads: DEFAULT_PARALLEL_DOWNLOADS,
            verification_window: DEFAULT_VERIFICATION_WINDOW,
            ready_poll_interval: DEFAULT_READY_POLL,
        }
    }
}

/// Entry point for uploads and downloads.
pub struct TransferOrchestrator {
    uploader: Uploader,
    downloader: Downloader,
    forbidden: Arc<ForbiddenSet>,
    ledger: Arc<TransferLedger>,
    slots: Arc<DownloadSlots>,
    ready: Arc<ReadySignals>,
    gate: Arc<HaltGate>,
    uploads: OperationSlot,
    downloads: OperationSlot,
    desired_parallel: std::sync::atomic::AtomicUsize,
}

impl TransferOrchestrator {
    /// Wire up a pipeline over `relay` and `index`.
    #[must_use]
    pub fn new(
        relay: Arc<dyn RelayClient>,
        index: Arc<HashIndex>,
        gate: Arc<HaltGate>,
        config: &TransferConfig,
    ) -> Self {
        let forbidden = Arc::new(ForbiddenSet::new());
        let ledger = Arc::new(TransferLedger::new());
        let slots = Arc::new(DownloadSlots::new(config.parallel_downloads));
        let ready = Arc::new(ReadySignals::new());

        let uploader = Uploader::new(
            Arc::clone(&relay),
            Arc::clone(&index),
            Arc::clone(&forbidden),
            Arc::clone(&ledger),
        )
        .with_window(config.verification_window);
        let downloader = Downloader::new(
            relay,
            index,
            Arc::clone(&gate),
            Arc::clone(&slots),
            Arc::clone(&forbidden),
            Arc::clone(&ledger),
        )
        .with_ready_signals(Arc::clone(&ready))
        .with_poll_interval(config.ready_poll_interval);

        Self {
            uploader,
            downloader,
            forbidden,
            ledger,
            slots,
            ready,
            gate,
            uploads: OperationSlot::new("upload batch"),
            downloads: OperationSlot::new("download batch"),
            desired_parallel: std::sync::atomic::AtomicUsize::new(config.parallel_downloads),
        }
    }

    /// Report progress of both directions to `progress`.
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn TransferProgress>) -> Self {
        self.uploader = self.uploader.with_progress(Arc::clone(&progress));
        self.downloader = self.downloader.with_progress(progress);
        self
    }

    /// Run `hook` on every downloaded file.
    #[must_use]
    pub fn with_compaction(mut self, hook: Arc<dyn CompactionHook>) -> Self {
        self.downloader = self.downloader.with_compaction(hook);
        self
    }

    /// Cancel every batch when `shutdown` fires.
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.uploads = OperationSlot::new("upload batch").with_parent(shutdown.clone());
        self.downloads = OperationSlot::new("download batch").with_parent(shutdown);
        self
    }

    /// Make sure the relay holds every hash, uploading what it lacks.
    ///
    /// Replaces (cancels) any upload batch already running.
    ///
    /// # Errors
    ///
    /// [`TransferError::Cancelled`] if the batch was cancelled or superseded;
    /// the relay error if the batch query failed.
    pub async fn upload(&self, hashes: &[String]) -> Result<UploadReport, TransferError> {
        let (_, token) = self.uploads.renew();
        if !self
            .gate
            .wait_clear_except(TRANSFER_REASON_PREFIX, &token)
            .await
        {
            return Err(TransferError::Cancelled);
        }
        let _hold = self.gate.hold(UPLOAD_HALT_REASON);
        self.uploader.verify_files(hashes, &token).await
    }

    /// Fetch hashes from the relay into the cache root.
    ///
    /// Replaces (cancels) any download batch already running.
    ///
    /// # Errors
    ///
    /// See [`Downloader::download`]. Cancellation is reported through
    /// [`DownloadReport::cancelled`].
    pub async fn download(
        &self,
        requests: &[DownloadRequest],
    ) -> Result<DownloadReport, TransferError> {
        let (_, token) = self.downloads.renew();
        if !self
            .gate
            .wait_clear_except(TRANSFER_REASON_PREFIX, &token)
            .await
        {
            return Ok(DownloadReport {
                cancelled: true,
                ..Default::default()
            });
        }
        let _hold = self.gate.hold(DOWNLOAD_HALT_REASON);
        self.apply_parallel_setting();
        self.downloader.download(requests, &token).await
    }

    /// Cancel the running upload batch, if any.
    pub fn cancel_uploads(&self) {
        self.uploads.cancel();
    }

    /// Cancel the running download batch, if any.
    pub fn cancel_downloads(&self) {
        self.downloads.cancel();
    }

    /// Deliver the relay's "ready" push notification for `ticket`.
    pub fn notify_ready(&self, ticket: &str) -> bool {
        self.ready.notify(ticket)
    }

    /// Whether the relay refused `hash`.
    #[must_use]
    pub fn is_forbidden(&self, hash: &str) -> bool {
        self.forbidden.contains(hash)
    }

    /// Drop forbidden hashes from an outgoing payload. Returns how many were removed.
    pub fn strip_forbidden(&self, hashes: &mut Vec<String>) -> usize {
        let removed = self.forbidden.strip(hashes);
        if removed > 0 {
            log::info!("Stripped {} forbidden hash(es) from payload", removed);
        }
        removed
    }

    /// Every hash the relay has refused so far.
    #[must_use]
    pub fn forbidden_hashes(&self) -> Vec<String> {
        self.forbidden.snapshot()
    }

    /// Whether an upload of `hash` was verified within the window.
    #[must_use]
    pub fn is_verified(&self, hash: &str) -> bool {
        self.uploader.is_verified(hash)
    }

    /// Change the number of simultaneous downloads. Applied immediately when
    /// no download is in flight, otherwise at the start of the next batch.
    pub fn set_parallel_downloads(&self, parallel: usize) {
        self.desired_parallel
            .store(parallel.max(1), std::sync::atomic::Ordering::SeqCst);
        self.apply_parallel_setting();
    }

    /// Current download slot capacity.
    #[must_use]
    pub fn parallel_downloads(&self) -> usize {
        self.slots.capacity()
    }

    /// Records of every transfer in flight.
    #[must_use]
    pub fn transfers(&self) -> Vec<TransferRecord> {
        self.ledger.snapshot()
    }

    fn apply_parallel_setting(&self) {
        let desired = self
            .desired_parallel
            .load(std::sync::atomic::Ordering::SeqCst);
        if !self.slots.resize(desired) {
            log::debug!(
                "Download slots busy; resize to {} deferred to next batch",
                desired
            );
        }
    }
}
