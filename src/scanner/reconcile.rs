//! Full reconciliation scan.
//!
//! # Overview
//!
//! A full scan brings the index in line with both roots:
//!
//! 1. **Discover**: enumerate candidate files under the mod root (recursive)
//!    and the cache root (flat), each tagged `seen = false`.
//! 2. **Validate**: drain every existing entry through the worker pool. Valid
//!    and updatable entries mark their candidate as seen; updates and
//!    deletions are buffered under a lock.
//! 3. **Apply**: write the buffered updates and deletions, flush once.
//! 4. **Index**: hash and register every candidate nobody claimed.
//!
//! The scan checks its [`CancellationToken`] between steps and inside each
//! worker. A cancelled scan discards the updates and deletions buffered in
//! step 2. Entries already registered in step 4 stay: each one was appended to
//! the index file as it was created, and the next scan simply validates them.
//!
//! Workers are genuine OS threads at the lowest scheduling priority, sized by
//! [`scan_thread_count`], so hashing never competes with the host's own loop.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use rayon::prelude::*;
use tokio_util::sync::CancellationToken;

use super::walker::CandidateWalker;
use super::{ScanError, WalkerConfig};
use crate::index::{CacheEntry, HashIndex, PrefixedPath, Validation};
use crate::progress::ProgressCallback;

/// Worker count for scans: half the logical cores, clamped to `2..=8`.
#[must_use]
pub fn scan_thread_count() -> usize {
    let cores = std::thread::available_parallelism().map_or(2, std::num::NonZeroUsize::get);
    (cores / 2).clamp(2, 8)
}

/// Drop the calling thread to the lowest scheduling priority.
///
/// On Linux `nice` applies to the calling thread only, which is what the scan
/// workers want. Elsewhere this is a no-op.
pub(crate) fn lower_thread_priority() {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: nice() only adjusts the scheduling priority of this thread.
        let _ = unsafe { libc::nice(19) };
    }
}

/// Observable progress of the running scan.
#[derive(Debug, Default)]
pub struct ScanProgress {
    processed: AtomicUsize,
    total: AtomicUsize,
    running: AtomicBool,
}

impl ScanProgress {
    /// `(processed, total)` for the current or last scan.
    #[must_use]
    pub fn snapshot(&self) -> (usize, usize) {
        (
            self.processed.load(Ordering::Relaxed),
            self.total.load(Ordering::Relaxed),
        )
    }

    /// Whether a scan is in progress.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    fn start(&self) {
        self.processed.store(0, Ordering::Relaxed);
        self.total.store(0, Ordering::Relaxed);
        self.running.store(true, Ordering::Relaxed);
    }

    fn add_total(&self, n: usize) {
        self.total.fetch_add(n, Ordering::Relaxed);
    }

    fn advance(&self) -> usize {
        self.processed.fetch_add(1, Ordering::Relaxed) + 1
    }
}

struct RunningGuard<'a>(&'a ScanProgress);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::Relaxed);
    }
}

/// Statistics from a completed full scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummary {
    /// Candidate files found on disk.
    pub candidates: usize,
    /// Existing entries validated.
    pub validated: usize,
    /// Entries whose content changed.
    pub updated: usize,
    /// Entries dropped because their file is gone.
    pub removed: usize,
    /// New entries created from unclaimed candidates.
    pub created: usize,
    /// Entries or candidates skipped after a transient error.
    pub failed: usize,
    /// Wall-clock duration.
    pub duration: Duration,
}

/// Runs full reconciliation scans against one index.
pub struct Reconciler {
    index: Arc<HashIndex>,
    walker: CandidateWalker,
    pool: rayon::ThreadPool,
    progress: Arc<ScanProgress>,
    callback: Option<Arc<dyn ProgressCallback>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("walker", &self.walker)
            .field("threads", &self.pool.current_num_threads())
            .field("progress", &self.progress)
            .field("callback", &self.callback.as_ref().map(|_| "<callback>"))
            .finish()
    }
}

impl Reconciler {
    /// Create a reconciler with a worker pool of [`scan_thread_count`] threads.
    ///
    /// # Errors
    ///
    /// Returns [`ScanError::ThreadPool`] if the worker threads cannot be spawned.
    pub fn new(index: Arc<HashIndex>, config: WalkerConfig) -> Result<Self, ScanError> {
        Self::with_threads(index, config, scan_thread_count())
    }

    /// Create a reconciler with an explicit worker count.
    ///
    /// # Errors
    ///
    /// Returns [`ScanError::ThreadPool`] if the worker threads cannot be spawned.
    pub fn with_threads(
        index: Arc<HashIndex>,
        config: WalkerConfig,
        threads: usize,
    ) -> Result<Self, ScanError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("modcache-scan-{}", i))
            .start_handler(|_| lower_thread_priority())
            .build()
            .map_err(|e| ScanError::ThreadPool(e.to_string()))?;

        Ok(Self {
            index,
            walker: CandidateWalker::new(config),
            pool,
            progress: Arc::new(ScanProgress::default()),
            callback: None,
        })
    }

    /// Report phase progress to `callback`.
    #[must_use]
    pub fn with_progress_callback(mut self, callback: Arc<dyn ProgressCallback>) -> Self {
        self.set_progress_callback(callback);
        self
    }

    /// Replace the phase progress callback.
    pub fn set_progress_callback(&mut self, callback: Arc<dyn ProgressCallback>) {
        self.callback = Some(callback);
    }

    /// Shared progress counters.
    #[must_use]
    pub fn progress(&self) -> Arc<ScanProgress> {
        Arc::clone(&self.progress)
    }

    /// Candidate filters, shared with the watcher event path.
    #[must_use]
    pub fn walker(&self) -> &CandidateWalker {
        &self.walker
    }

    /// Run one full scan.
    ///
    /// # Errors
    ///
    /// - [`ScanError::Cancelled`] if `cancel` fires; buffered updates and
    ///   deletions are discarded, entries created before the cancel are kept
    /// - [`ScanError::Index`] if the index cannot be flushed
    pub fn full_scan(&self, cancel: &CancellationToken) -> Result<ScanSummary, ScanError> {
        let started = Instant::now();
        self.progress.start();
        let _running = RunningGuard(&self.progress);
        let mut summary = ScanSummary::default();

        // Step 1: discover candidates.
        let candidates = self.discover(cancel, &mut summary)?;
        summary.candidates = candidates.len();
        ensure_live(cancel)?;

        // Step 2: validate existing entries in parallel.
        let existing = self.index.entries();
        summary.validated = existing.len();
        self.progress.add_total(existing.len());
        self.phase_start("validate", existing.len());

        let updates: Mutex<Vec<CacheEntry>> = Mutex::new(Vec::new());
        let deletions: Mutex<Vec<PrefixedPath>> = Mutex::new(Vec::new());
        let failed = AtomicUsize::new(0);

        self.pool.install(|| {
            existing.par_iter().for_each(|entry| {
                if cancel.is_cancelled() {
                    return;
                }
                let claim = || {
                    if let Some(flag) = self
                        .index
                        .resolve(&entry.path)
                        .and_then(|p| candidates.get(&p))
                    {
                        flag.store(true, Ordering::Relaxed);
                    }
                };

                match self.index.revalidate(entry) {
                    Ok(Validation::Valid) => claim(),
                    Ok(Validation::Updated(updated)) => {
                        claim();
                        updates
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .push(updated);
                    }
                    Ok(Validation::Missing) => deletions
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(entry.path.clone()),
                    Ok(Validation::Unresolved) => {}
                    Err(e) => {
                        log::warn!("Skipping {} this pass: {}", entry.path, e);
                        failed.fetch_add(1, Ordering::Relaxed);
                        claim();
                    }
                }

                let current = self.progress.advance();
                if let Some(callback) = &self.callback {
                    callback.on_progress(current, entry.path.relative());
                }
            });
        });
        self.phase_end("validate");
        ensure_live(cancel)?;

        // Step 3: apply buffered results, flush once.
        let updates = updates.into_inner().unwrap_or_else(PoisonError::into_inner);
        let deletions = deletions.into_inner().unwrap_or_else(PoisonError::into_inner);
        summary.updated = updates.len();
        summary.removed = deletions.len();
        for key in &deletions {
            self.index.remove_entry(key);
        }
        for entry in updates {
            self.index.update_entry(entry);
        }
        if summary.updated > 0 || summary.removed > 0 {
            self.index.flush()?;
        }
        ensure_live(cancel)?;

        // Step 4: index unclaimed candidates. create_entry appends each record,
        // so a cancel here keeps what was already created.
        let mut unseen: Vec<PathBuf> = candidates
            .into_iter()
            .filter(|(_, seen)| !seen.load(Ordering::Relaxed))
            .map(|(path, _)| path)
            .collect();
        unseen.sort();
        self.progress.add_total(unseen.len());
        self.phase_start("index", unseen.len());

        let created = AtomicUsize::new(0);
        self.pool.install(|| {
            unseen.par_iter().for_each(|path| {
                if cancel.is_cancelled() {
                    return;
                }
                if let Some(entry) = self.index.create_entry(path, None) {
                    created.fetch_add(1, Ordering::Relaxed);
                    if let Some(callback) = &self.callback {
                        callback.on_item_completed(entry.size.unwrap_or(0));
                    }
                } else {
                    failed.fetch_add(1, Ordering::Relaxed);
                }
                let current = self.progress.advance();
                if let Some(callback) = &self.callback {
                    callback.on_progress(current, &path.to_string_lossy());
                }
            });
        });
        self.phase_end("index");
        summary.created = created.into_inner();
        summary.failed += failed.into_inner();

        if summary.created > 0 {
            self.index.flush()?;
        }
        ensure_live(cancel)?;

        summary.duration = started.elapsed();
        log::info!(
            "Full scan: {} candidates, {} validated, {} updated, {} removed, {} created in {:.2?}",
            summary.candidates,
            summary.validated,
            summary.updated,
            summary.removed,
            summary.created,
            summary.duration
        );
        Ok(summary)
    }

    fn discover(
        &self,
        cancel: &CancellationToken,
        summary: &mut ScanSummary,
    ) -> Result<HashMap<PathBuf, AtomicBool>, ScanError> {
        let roots = self.index.roots();
        let walker = self.walker.clone().with_cancel(cancel.clone());
        let mut candidates = HashMap::new();
        self.phase_start("discover", 0);

        if let Some(mod_root) = roots.mod_root.as_deref().filter(|p| p.is_dir()) {
            for result in walker.walk_mod_root(mod_root) {
                match result {
                    Ok(path) => {
                        candidates.insert(path, AtomicBool::new(false));
                    }
                    Err(_) => summary.failed += 1,
                }
            }
            self.message(&format!("Discovered {} mod files", candidates.len()));
        }
        ensure_live(cancel)?;

        if let Some(cache_root) = roots.cache_root.as_deref() {
            match walker.walk_cache_root(cache_root) {
                Ok(paths) => {
                    for path in paths {
                        candidates.insert(path, AtomicBool::new(false));
                    }
                }
                Err(e) => log::warn!("Skipping cache root: {}", e),
            }
        }

        self.phase_end("discover");
        log::debug!("Discovered {} candidate files", candidates.len());
        Ok(candidates)
    }

    fn phase_start(&self, phase: &str, total: usize) {
        if let Some(callback) = &self.callback {
            callback.on_phase_start(phase, total);
        }
    }

    fn phase_end(&self, phase: &str) {
        if let Some(callback) = &self.callback {
            callback.on_phase_end(phase);
        }
    }

    fn message(&self, message: &str) {
        if let Some(callback) = &self.callback {
            callback.on_message(message);
        }
    }
}

fn ensure_live(cancel: &CancellationToken) -> Result<(), ScanError> {
    if cancel.is_cancelled() {
        log::debug!("Full scan cancelled, discarding in-flight work");
        Err(ScanError::Cancelled)
    } else {
        Ok(())
    }
}
