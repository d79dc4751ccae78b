//! Download side: query, group, fetch, place, register.
//!
//! # Pipeline
//!
//! 1. One batch size query. Hashes the relay marks forbidden, lacks, or
//!    reports with a non-positive size go to the forbidden set and are never
//!    fetched.
//! 2. The rest are grouped by relay endpoint; groups run concurrently, one
//!    stream per endpoint, and each sends a single enqueue hint up front.
//! 3. Per file, in group order: take a download slot, request a ticket, wait
//!    for "ready" (push notification, or a live status check every
//!    [`DEFAULT_READY_POLL`]), stream to a partial file, release the slot,
//!    decompress, place under `<cache_root>/<hash>[.ext]` with a randomized
//!    historical modification time, and register the entry.
//!
//! Cancellation aborts the whole group, deletes partial files and abandons
//! the ticket. Any other failure is logged and the group moves on.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use filetime::FileTime;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::progress::{Direction, TransferGroup, TransferLedger, TransferProgress};
use super::relay::{FileSizeInfo, RelayClient, Ticket};
use super::slots::DownloadSlots;
use super::{codec, with_cancel, ForbiddenSet, TransferError};
use crate::governor::{CompactionHook, NoCompaction};
use crate::halt::{HaltGate, TRANSFER_REASON_PREFIX};
use crate::index::{CacheEntry, HashIndex};

/// Rolling local timeout between live status checks.
pub const DEFAULT_READY_POLL: Duration = Duration::from_secs(5);

/// Payloads above this declared length use the large copy buffer.
pub const LARGE_PAYLOAD_THRESHOLD: u64 = 1024 * 1024;

const SMALL_BUFFER: usize = 4 * 1024;
const LARGE_BUFFER: usize = 64 * 1024;

/// Subfolder of the cache root holding in-flight downloads.
pub const INCOMING_DIR: &str = ".incoming";

const DAY_SECS: u64 = 24 * 60 * 60;

/// One hash to fetch, with the extension its cache file should carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    /// Content hash.
    pub hash: String,
    /// File extension without the dot.
    pub extension: Option<String>,
}

impl DownloadRequest {
    /// Request `hash` with an optional extension.
    #[must_use]
    pub fn new(hash: &str, extension: Option<&str>) -> Self {
        Self {
            hash: hash.to_ascii_lowercase(),
            extension: extension
                .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
                .filter(|ext| !ext.is_empty()),
        }
    }

    /// File name in the cache root.
    #[must_use]
    pub fn file_name(&self) -> String {
        match &self.extension {
            Some(ext) => format!("{}.{}", self.hash, ext),
            None => self.hash.clone(),
        }
    }
}

/// Outcome of one download batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadReport {
    /// Fetched and registered.
    pub downloaded: Vec<String>,
    /// Already resolvable locally; not fetched.
    pub already_present: Vec<String>,
    /// Forbidden, missing or empty on the relay.
    pub forbidden: Vec<String>,
    /// Failed for any reason other than cancellation.
    pub failed: Vec<String>,
    /// Whether the batch was cut short by cancellation.
    pub cancelled: bool,
}

/// Copy buffer size for a payload of the declared length.
#[must_use]
pub fn copy_buffer_size(content_length: Option<u64>) -> usize {
    match content_length {
        Some(len) if len > LARGE_PAYLOAD_THRESHOLD => LARGE_BUFFER,
        _ => SMALL_BUFFER,
    }
}

/// Local "ready" flags keyed by ticket, flipped by push notifications.
#[derive(Debug, Default)]
pub struct ReadySignals {
    flags: Mutex<HashMap<String, Arc<ReadyFlag>>>,
}

#[derive(Debug, Default)]
struct ReadyFlag {
    ready: AtomicBool,
    notify: Notify,
}

impl ReadySignals {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip the flag for `ticket`. Returns `true` if a transfer is waiting
    /// on it. A notification that arrives before anyone waits is kept.
    pub fn notify(&self, ticket: &str) -> bool {
        let mut flags = self.lock();
        let waiting = flags.contains_key(ticket);
        let flag = flags.entry(ticket.to_string()).or_default();
        flag.ready.store(true, Ordering::SeqCst);
        flag.notify.notify_one();
        waiting
    }

    fn register(&self, ticket: &Ticket) -> Arc<ReadyFlag> {
        Arc::clone(self.lock().entry(ticket.0.clone()).or_default())
    }

    fn forget(&self, ticket: &Ticket) {
        self.lock().remove(&ticket.0);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<ReadyFlag>>> {
        self.flags.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Deletes the file on drop unless [`persist`](Self::persist) was called.
struct PartialFile {
    path: PathBuf,
    keep: bool,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        Self { path, keep: false }
    }

    fn persist(mut self) {
        self.keep = true;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.keep {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::debug!("Could not remove partial {}: {}", self.path.display(), e);
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct GroupOutcome {
    downloaded: Vec<String>,
    failed: Vec<String>,
    cancelled: bool,
}

/// Download pipeline.
pub struct Downloader {
    relay: Arc<dyn RelayClient>,
    index: Arc<HashIndex>,
    gate: Arc<HaltGate>,
    slots: Arc<DownloadSlots>,
    ready: Arc<ReadySignals>,
    forbidden: Arc<ForbiddenSet>,
    ledger: Arc<TransferLedger>,
    hook: Arc<dyn CompactionHook>,
    progress: Option<Arc<dyn TransferProgress>>,
    poll_interval: Duration,
}

impl Downloader {
    /// Create a downloader.
    #[must_use]
    pub fn new(
        relay: Arc<dyn RelayClient>,
        index: Arc<HashIndex>,
        gate: Arc<HaltGate>,
        slots: Arc<DownloadSlots>,
        forbidden: Arc<ForbiddenSet>,
        ledger: Arc<TransferLedger>,
    ) -> Self {
        Self {
            relay,
            index,
            gate,
            slots,
            ready: Arc::new(ReadySignals::new()),
            forbidden,
            ledger,
            hook: Arc::new(NoCompaction),
            progress: None,
            poll_interval: DEFAULT_READY_POLL,
        }
    }

    /// Share a ready-signal table with the push notification handler.
    #[must_use]
    pub fn with_ready_signals(mut self, ready: Arc<ReadySignals>) -> Self {
        self.ready = ready;
        self
    }

    /// Run `hook` on every placed file.
    #[must_use]
    pub fn with_compaction(mut self, hook: Arc<dyn CompactionHook>) -> Self {
        self.hook = hook;
        self
    }

    /// Report progress to `progress`.
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn TransferProgress>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Set the rolling ready-wait timeout.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Fetch every requested hash the relay can serve.
    ///
    /// # Errors
    ///
    /// Returns an error if no cache root is configured or the batch size
    /// query fails. Cancellation is reported through
    /// [`DownloadReport::cancelled`].
    pub async fn download(
        &self,
        requests: &[DownloadRequest],
        cancel: &CancellationToken,
    ) -> Result<DownloadReport, TransferError> {
        let cache_root = self
            .index
            .roots()
            .cache_root
            .ok_or(TransferError::NoCacheRoot)?;
        let mut report = DownloadReport::default();

        let mut seen = HashSet::new();
        let mut wanted = Vec::new();
        for request in requests {
            if !seen.insert(request.hash.clone()) {
                continue;
            }
            if self.index.resolve_hash(&request.hash).is_some() {
                report.already_present.push(request.hash.clone());
            } else {
                wanted.push(request.clone());
            }
        }
        if wanted.is_empty() {
            return Ok(report);
        }

        let hashes: Vec<String> = wanted.iter().map(|r| r.hash.clone()).collect();
        let infos: HashMap<String, FileSizeInfo> =
            match with_cancel(cancel, self.relay.query_sizes(&hashes)).await {
                Ok(infos) => infos
                    .into_iter()
                    .map(|info| (info.hash.to_ascii_lowercase(), info))
                    .collect(),
                Err(TransferError::Cancelled) => {
                    report.cancelled = true;
                    return Ok(report);
                }
                Err(e) => return Err(e),
            };

        let mut groups: BTreeMap<String, Vec<(DownloadRequest, u64)>> = BTreeMap::new();
        for request in wanted {
            match infos.get(&request.hash) {
                Some(info) if info.exists && !info.forbidden && info.size > 0 => {
                    let size = info.size.unsigned_abs();
                    self.ledger
                        .begin(Direction::Download, &request.hash, size, false);
                    groups
                        .entry(info.download_endpoint.clone())
                        .or_default()
                        .push((request, size));
                }
                other => {
                    log::warn!(
                        "Not downloading {}: {}",
                        request.hash,
                        match other {
                            Some(info) if info.forbidden => "forbidden by relay",
                            Some(_) => "missing or empty on relay",
                            None => "unknown to relay",
                        }
                    );
                    self.forbidden.insert(&request.hash);
                    self.ledger
                        .begin(Direction::Download, &request.hash, 0, true);
                    report.forbidden.push(request.hash);
                }
            }
        }

        log::info!(
            "Downloading {} file(s) from {} endpoint(s)",
            hashes.len() - report.forbidden.len(),
            groups.len()
        );

        let runs = groups
            .iter()
            .map(|(endpoint, files)| self.run_group(endpoint, files, &cache_root, cancel));
        for outcome in futures::future::join_all(runs).await {
            report.downloaded.extend(outcome.downloaded);
            report.failed.extend(outcome.failed);
            report.cancelled |= outcome.cancelled;
        }
        self.ledger.clear(Direction::Download, &hashes);

        if !report.downloaded.is_empty() {
            if let Err(e) = self.index.flush() {
                log::warn!("Failed to flush index after downloads: {}", e);
            }
        }
        log::info!(
            "Download batch: {} fetched, {} forbidden, {} failed{}",
            report.downloaded.len(),
            report.forbidden.len(),
            report.failed.len(),
            if report.cancelled { ", cancelled" } else { "" }
        );
        Ok(report)
    }

    async fn run_group(
        &self,
        endpoint: &str,
        files: &[(DownloadRequest, u64)],
        cache_root: &Path,
        cancel: &CancellationToken,
    ) -> GroupOutcome {
        let hashes: Vec<String> = files.iter().map(|(r, _)| r.hash.clone()).collect();
        let total = files.iter().map(|(_, size)| size).sum();
        let group = TransferGroup::new(endpoint, hashes.clone(), total);
        if let Some(progress) = &self.progress {
            progress.on_group_start(Direction::Download, &group);
        }

        let relay = Arc::clone(&self.relay);
        let hint_endpoint = endpoint.to_string();
        tokio::spawn(async move {
            if let Err(e) = relay.enqueue(&hint_endpoint, &hashes).await {
                log::debug!("Enqueue hint to {} failed: {}", hint_endpoint, e);
            }
        });

        let mut outcome = GroupOutcome::default();
        for (request, size) in files {
            let result = self
                .download_one(endpoint, request, *size, cache_root, &group, cancel)
                .await;
            group.file_done();
            if let Some(progress) = &self.progress {
                progress.on_file_done(Direction::Download, &request.hash, result.is_ok());
            }
            match result {
                Ok(_) => outcome.downloaded.push(request.hash.clone()),
                Err(e) if e.is_cancellation() => {
                    log::info!("Download group for {} cancelled", endpoint);
                    outcome.cancelled = true;
                    break;
                }
                Err(e) => {
                    log::warn!("Download of {} failed: {}", request.hash, e);
                    outcome.failed.push(request.hash.clone());
                }
            }
        }

        if let Some(progress) = &self.progress {
            progress.on_group_end(Direction::Download, &group);
        }
        outcome
    }

    async fn download_one(
        &self,
        endpoint: &str,
        request: &DownloadRequest,
        size: u64,
        cache_root: &Path,
        group: &TransferGroup,
        cancel: &CancellationToken,
    ) -> Result<CacheEntry, TransferError> {
        if self.gate.is_halted_except(TRANSFER_REASON_PREFIX)
            && !self.gate.wait_clear_except(TRANSFER_REASON_PREFIX, cancel).await
        {
            return Err(TransferError::Cancelled);
        }

        let slot = self.slots.acquire(cancel).await?;
        let ticket = with_cancel(cancel, self.relay.request_ticket(endpoint, &request.hash)).await?;
        log::trace!("Ticket {} issued for {}", ticket, request.hash);

        let incoming = cache_root.join(INCOMING_DIR);
        let partial = PartialFile::new(incoming.join(format!("{}.part", request.hash)));
        let fetched = self
            .fetch(endpoint, &ticket, &request.hash, size, &partial.path, group, cancel)
            .await;
        self.ready.forget(&ticket);
        drop(slot);

        if let Err(e) = fetched {
            self.abandon(endpoint, &ticket).await;
            return Err(e);
        }

        let decoded = PartialFile::new(incoming.join(format!("{}.out", request.hash)));
        let compressed_size = std::fs::metadata(&partial.path)
            .map(|m| m.len())
            .unwrap_or(size);
        let (src, dst) = (partial.path.clone(), decoded.path.clone());
        tokio::task::spawn_blocking(move || codec::decompress_file(&src, &dst))
            .await
            .map_err(|e| TransferError::Relay(format!("decompression task failed: {e}")))?
            .map_err(TransferError::Codec)?;
        drop(partial);

        let target = cache_root.join(request.file_name());
        std::fs::rename(&decoded.path, &target).map_err(|source| TransferError::Io {
            path: target.clone(),
            source,
        })?;
        decoded.persist();

        stamp_historical(&target);
        if self.hook.is_active() {
            if let Err(e) = self.hook.compact(&target) {
                log::warn!("Compaction of {} failed: {}", target.display(), e);
            }
        }

        let mut entry = self
            .index
            .create_entry(&target, Some(&request.hash))
            .ok_or_else(|| TransferError::Register(target.clone()))?;
        entry.compressed_size = Some(compressed_size);
        self.index.update_entry(entry.clone());
        log::debug!("Downloaded {} to {}", request.hash, target.display());
        Ok(entry)
    }

    #[allow(clippy::too_many_arguments)]
    async fn fetch(
        &self,
        endpoint: &str,
        ticket: &Ticket,
        hash: &str,
        size: u64,
        partial: &Path,
        group: &TransferGroup,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        self.wait_ready(endpoint, ticket, cancel).await?;

        let mut payload = with_cancel(cancel, self.relay.download(endpoint, ticket)).await?;
        let total = payload.content_length.unwrap_or(size);
        if let Some(parent) = partial.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| TransferError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        let io_err = |source| TransferError::Io {
            path: partial.to_path_buf(),
            source,
        };
        let mut file = tokio::fs::File::create(partial).await.map_err(io_err)?;

        let mut buffer = vec![0u8; copy_buffer_size(payload.content_length)];
        let mut transferred = 0u64;
        loop {
            let read = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(TransferError::Cancelled),
                read = payload.reader.read(&mut buffer) => read.map_err(io_err)?,
            };
            if read == 0 {
                break;
            }
            file.write_all(&buffer[..read]).await.map_err(io_err)?;
            transferred += read as u64;
            group.add_bytes(read as u64);
            self.ledger
                .set_progress(Direction::Download, hash, transferred);
            if let Some(progress) = &self.progress {
                progress.on_bytes(Direction::Download, hash, transferred, total);
            }
        }
        file.flush().await.map_err(io_err)?;
        file.sync_all().await.map_err(io_err)?;
        Ok(())
    }

    async fn wait_ready(
        &self,
        endpoint: &str,
        ticket: &Ticket,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        let flag = self.ready.register(ticket);
        loop {
            if flag.ready.load(Ordering::SeqCst) {
                return Ok(());
            }
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(TransferError::Cancelled),
                () = flag.notify.notified() => {}
                () = tokio::time::sleep(self.poll_interval) => {
                    match with_cancel(cancel, self.relay.check_status(endpoint, ticket)).await {
                        Ok(true) => return Ok(()),
                        Ok(false) => log::trace!("Ticket {} not ready yet", ticket),
                        Err(e @ (TransferError::Cancelled
                            | TransferError::NotFound(_)
                            | TransferError::Unauthorized(_))) => return Err(e),
                        Err(e) => log::debug!("Status check for {} failed: {}", ticket, e),
                    }
                }
            }
        }
    }

    async fn abandon(&self, endpoint: &str, ticket: &Ticket) {
        let attempt = tokio::time::timeout(
            self.poll_interval,
            self.relay.cancel_ticket(endpoint, ticket),
        )
        .await;
        match attempt {
            Ok(Ok(())) => log::trace!("Ticket {} cancelled", ticket),
            Ok(Err(e)) => log::debug!("Cancelling ticket {} failed: {}", ticket, e),
            Err(_) => log::debug!("Cancelling ticket {} timed out", ticket),
        }
    }
}

/// Give a placed file a random modification time in the past year and
/// mark it accessed now.
fn stamp_historical(path: &Path) {
    let days = rand::thread_rng().gen_range(30..365u64);
    let offset = rand::thread_rng().gen_range(0..DAY_SECS);
    let past = SystemTime::now()
        .checked_sub(Duration::from_secs(days * DAY_SECS + offset))
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let now = FileTime::now();
    if let Err(e) = filetime::set_file_times(path, now, FileTime::from_system_time(past)) {
        log::debug!("Could not set timestamps on {}: {}", path.display(), e);
    }
}
