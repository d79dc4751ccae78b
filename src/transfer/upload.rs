//! Upload side: verify, compress, send.
//!
//! [`Uploader::verify_files`] skips hashes verified within the trailing
//! window, asks the relay about the rest in one call, records forbidden
//! hashes, and streams every file the relay lacks one at a time. A hash is
//! marked verified once the relay holds it, whether or not bytes were sent.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use super::progress::{Direction, TransferGroup, TransferLedger, TransferProgress};
use super::relay::RelayClient;
use super::{codec, with_cancel, ForbiddenSet, TransferError};
use crate::index::HashIndex;

/// Default trailing validity of a verification.
pub const DEFAULT_VERIFICATION_WINDOW: Duration = Duration::from_secs(600);

/// Outcome of one upload batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    /// Sent to the relay.
    pub uploaded: Vec<String>,
    /// The relay already had them.
    pub already_present: Vec<String>,
    /// Verified within the window; no network call made.
    pub recently_verified: Vec<String>,
    /// Refused by the relay.
    pub forbidden: Vec<String>,
    /// No local file, no answer from the relay, or the upload failed.
    pub failed: Vec<String>,
}

/// Upload pipeline.
pub struct Uploader {
    relay: Arc<dyn RelayClient>,
    index: Arc<HashIndex>,
    forbidden: Arc<ForbiddenSet>,
    ledger: Arc<TransferLedger>,
    progress: Option<Arc<dyn TransferProgress>>,
    window: Duration,
    verified: Mutex<HashMap<String, Instant>>,
}

impl Uploader {
    /// Create an uploader.
    #[must_use]
    pub fn new(
        relay: Arc<dyn RelayClient>,
        index: Arc<HashIndex>,
        forbidden: Arc<ForbiddenSet>,
        ledger: Arc<TransferLedger>,
    ) -> Self {
        Self {
            relay,
            index,
            forbidden,
            ledger,
            progress: None,
            window: DEFAULT_VERIFICATION_WINDOW,
            verified: Mutex::new(HashMap::new()),
        }
    }

    /// Set the verification window.
    #[must_use]
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Report progress to `progress`.
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn TransferProgress>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Whether `hash` was verified within the window.
    #[must_use]
    pub fn is_verified(&self, hash: &str) -> bool {
        self.lock()
            .get(&hash.to_ascii_lowercase())
            .is_some_and(|at| at.elapsed() < self.window)
    }

    /// Split into `(recently_verified, unverified)`, deduplicated and lowercased.
    #[must_use]
    pub fn partition(&self, hashes: &[String]) -> (Vec<String>, Vec<String>) {
        let unique: BTreeSet<String> = hashes.iter().map(|h| h.to_ascii_lowercase()).collect();
        let verified = self.lock();
        unique.into_iter().partition(|hash| {
            verified
                .get(hash)
                .is_some_and(|at| at.elapsed() < self.window)
        })
    }

    /// Make sure the relay holds every hash in `hashes`.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Cancelled`] if `cancel` fires, or the relay
    /// error if the batch query fails. Per-file failures land in
    /// [`UploadReport::failed`].
    pub async fn verify_files(
        &self,
        hashes: &[String],
        cancel: &CancellationToken,
    ) -> Result<UploadReport, TransferError> {
        let (recent, unverified) = self.partition(hashes);
        let mut report = UploadReport {
            recently_verified: recent,
            ..Default::default()
        };
        if unverified.is_empty() {
            log::debug!(
                "All {} hash(es) verified recently; nothing to upload",
                report.recently_verified.len()
            );
            return Ok(report);
        }

        let intents = with_cancel(cancel, self.relay.query_upload_intent(&unverified)).await?;
        let mut unanswered: BTreeSet<&String> = unverified.iter().collect();
        let mut queue: Vec<(String, String)> = Vec::new();
        for intent in intents {
            let hash = intent.hash.to_ascii_lowercase();
            if !unanswered.remove(&hash) {
                continue;
            }
            if intent.forbidden {
                log::warn!("Relay refused {}; it will be stripped from payloads", hash);
                self.forbidden.insert(&hash);
                report.forbidden.push(hash);
                continue;
            }
            match intent.upload_endpoint {
                Some(endpoint) => queue.push((hash, endpoint)),
                None => {
                    self.mark_verified(&hash);
                    report.already_present.push(hash);
                }
            }
        }

        for hash in unanswered {
            log::warn!("Relay returned no upload intent for {}", hash);
            report.failed.push(hash.clone());
        }

        let hashes: Vec<String> = queue.iter().map(|(hash, _)| hash.clone()).collect();
        for hash in &hashes {
            self.ledger.begin(Direction::Upload, hash, 0, false);
        }
        let group = TransferGroup::new("", hashes.clone(), 0);
        if let Some(progress) = &self.progress {
            progress.on_group_start(Direction::Upload, &group);
        }

        let mut result = Ok(());
        for (hash, endpoint) in &queue {
            if cancel.is_cancelled() {
                result = Err(TransferError::Cancelled);
                break;
            }
            match self.upload_one(hash, endpoint, &group, cancel).await {
                Ok(()) => {
                    self.mark_verified(hash);
                    report.uploaded.push(hash.clone());
                }
                Err(e) if e.is_cancellation() => {
                    result = Err(e);
                    break;
                }
                Err(e) => {
                    log::warn!("Upload of {} failed: {}", hash, e);
                    report.failed.push(hash.clone());
                }
            }
            group.file_done();
        }

        if let Some(progress) = &self.progress {
            progress.on_group_end(Direction::Upload, &group);
        }
        self.ledger.clear(Direction::Upload, &hashes);
        result?;

        log::info!(
            "Upload batch: {} sent, {} already present, {} recent, {} forbidden, {} failed",
            report.uploaded.len(),
            report.already_present.len(),
            report.recently_verified.len(),
            report.forbidden.len(),
            report.failed.len()
        );
        Ok(report)
    }

    async fn upload_one(
        &self,
        hash: &str,
        endpoint: &str,
        group: &TransferGroup,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        let path = self
            .index
            .resolve_hash(hash)
            .ok_or_else(|| TransferError::NotFound(hash.to_string()))?;

        let source = path.clone();
        let payload = tokio::task::spawn_blocking(move || codec::compress_file(&source))
            .await
            .map_err(|e| TransferError::Relay(format!("compression task failed: {e}")))?
            .map_err(|source| TransferError::Io { path, source })?;

        let total = payload.len() as u64;
        self.ledger.begin(Direction::Upload, hash, total, false);
        let reported = std::sync::atomic::AtomicU64::new(0);
        let on_bytes = |sent: u64| {
            let previous = reported.swap(sent, std::sync::atomic::Ordering::Relaxed);
            group.add_bytes(sent.saturating_sub(previous));
            self.ledger.set_progress(Direction::Upload, hash, sent);
            if let Some(progress) = &self.progress {
                progress.on_bytes(Direction::Upload, hash, sent, total);
            }
        };

        let sent = with_cancel(
            cancel,
            self.relay.upload(endpoint, hash, payload, &on_bytes),
        )
        .await;
        if let Some(progress) = &self.progress {
            progress.on_file_done(Direction::Upload, hash, sent.is_ok());
        }
        sent?;
        log::debug!("Uploaded {} ({} compressed bytes)", hash, total);
        Ok(())
    }

    fn mark_verified(&self, hash: &str) {
        self.lock().insert(hash.to_string(), Instant::now());
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.verified.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
