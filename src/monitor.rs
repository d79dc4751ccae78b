//! Top-level coordinator: watchers, debounce, halt gating and scan scheduling.
//!
//! # Overview
//!
//! [`CacheMonitor`] owns:
//!
//! - two `notify` watchers, recursive on the mod root and flat on the cache
//!   root, whose callbacks only record into a per-root [`PendingChanges`];
//! - one Tokio drain task per root that applies a batch once the root has
//!   been quiet for its debounce window and nothing is halted;
//! - a dedicated low-priority OS thread that runs full scans (and quota
//!   enforcement afterwards) on request;
//! - a task that cancels the running scan whenever the [`HaltGate`] closes
//!   and re-queues it once the gate opens again;
//! - an optional periodic full-scan timer.
//!
//! Full scans are requested on startup (when both roots are configured),
//! on [`roots_changed`](CacheMonitor::roots_changed), on
//! [`session_started`](CacheMonitor::session_started), on
//! [`force_rescan`](CacheMonitor::force_rescan) and periodically.
//!
//! # Example
//!
//! ```no_run
//! use modcache::halt::HaltGate;
//! use modcache::index::{HashIndex, Roots};
//! use modcache::monitor::{CacheMonitor, MonitorSettings};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let roots = Roots::new(Some("/games/mods".into()), Some("/games/cache".into()));
//! let index = Arc::new(HashIndex::open(Path::new("/games/cache/index.txt"), roots)?);
//! let monitor = CacheMonitor::new(index, Arc::new(HaltGate::new()), MonitorSettings::default())?;
//! monitor.start()?;
//! monitor.halt("cutscene");
//! monitor.resume("cutscene");
//! monitor.shutdown();
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cancel::OperationSlot;
use crate::governor::SizeGovernor;
use crate::halt::HaltGate;
use crate::index::{HashIndex, RootTag, Roots};
use crate::progress::ProgressCallback;
use crate::scanner::{
    apply_batch, BatchOutcome, ChangeKind, PendingChange, PendingChanges, Reconciler, ScanError,
    ScanProgress, ScanSummary, WalkerConfig,
};

/// Default quiet period for the mod root.
pub const DEFAULT_MOD_DEBOUNCE: Duration = Duration::from_secs(10);
/// Default quiet period for the cache root.
pub const DEFAULT_CACHE_DEBOUNCE: Duration = Duration::from_secs(1);
/// Default interval between periodic full scans.
pub const DEFAULT_FULL_SCAN_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Errors from the monitor.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    /// A watcher could not be created or attached.
    #[error("Filesystem watcher error: {0}")]
    Watch(#[from] notify::Error),

    /// The scanner could not be built.
    #[error(transparent)]
    Scan(#[from] ScanError),

    /// `start` was called outside a Tokio runtime.
    #[error("The monitor must be started from within a Tokio runtime")]
    NoRuntime,

    /// The scan worker thread could not be spawned.
    #[error("Failed to spawn scan worker: {0}")]
    Thread(#[source] std::io::Error),
}

/// Monitor tunables.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Candidate filters.
    pub walker: WalkerConfig,
    /// Quiet period before a mod-root batch is applied.
    pub mod_debounce: Duration,
    /// Quiet period before a cache-root batch is applied.
    pub cache_debounce: Duration,
    /// Interval between periodic full scans; `None` disables them.
    pub full_scan_interval: Option<Duration>,
    /// Scan worker pool size; `None` uses the default.
    pub scan_threads: Option<usize>,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            walker: WalkerConfig::default(),
            mod_debounce: DEFAULT_MOD_DEBOUNCE,
            cache_debounce: DEFAULT_CACHE_DEBOUNCE,
            full_scan_interval: Some(DEFAULT_FULL_SCAN_INTERVAL),
            scan_threads: None,
        }
    }
}

/// Why a full scan was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanTrigger {
    /// Monitor start with both roots configured.
    Startup,
    /// A root directory changed.
    RootsChanged,
    /// Login / session start.
    SessionStarted,
    /// Manual request.
    Forced,
    /// Periodic timer.
    Periodic,
    /// Retry of a scan cancelled or deferred by a halt.
    Resumed,
}

struct Shared {
    index: Arc<HashIndex>,
    gate: Arc<HaltGate>,
    reconciler: Reconciler,
    governor: Option<SizeGovernor>,
    settings: MonitorSettings,
    mod_changes: PendingChanges,
    cache_changes: PendingChanges,
    scan_slot: OperationSlot,
    scan_pending: AtomicBool,
    scans_completed: AtomicU64,
    last_summary: Mutex<Option<ScanSummary>>,
    requests: Mutex<Option<mpsc::Sender<ScanTrigger>>>,
}

impl Shared {
    fn pending(&self, tag: RootTag) -> &PendingChanges {
        match tag {
            RootTag::ModRoot => &self.mod_changes,
            RootTag::CacheRoot => &self.cache_changes,
        }
    }

    fn request_scan(&self, trigger: ScanTrigger) {
        let sent = lock(&self.requests)
            .as_ref()
            .is_some_and(|tx| tx.send(trigger).is_ok());
        if sent {
            log::debug!("Full scan requested ({:?})", trigger);
        } else {
            self.scan_pending.store(true, Ordering::SeqCst);
            log::debug!("Full scan ({:?}) queued until the monitor starts", trigger);
        }
    }

    fn run_scan(&self, trigger: ScanTrigger) {
        if self.index.roots().mod_root.is_none() && self.index.roots().cache_root.is_none() {
            log::debug!("Skipping {:?} scan: no roots configured", trigger);
            return;
        }
        if self.gate.is_halted() {
            log::info!(
                "Scan ({:?}) deferred while halted by {:?}",
                trigger,
                self.gate.reasons()
            );
            self.scan_pending.store(true, Ordering::SeqCst);
            return;
        }

        self.scan_pending.store(false, Ordering::SeqCst);
        let (_, token) = self.scan_slot.renew();
        log::info!("Starting full scan ({:?})", trigger);
        match self.reconciler.full_scan(&token) {
            Ok(summary) => {
                log::info!(
                    "Full scan finished in {:.2?}: {} candidates, {} updated, {} removed, {} created",
                    summary.duration,
                    summary.candidates,
                    summary.updated,
                    summary.removed,
                    summary.created
                );
                *lock(&self.last_summary) = Some(summary);
                self.scans_completed.fetch_add(1, Ordering::SeqCst);
                self.enforce_quota();
            }
            Err(ScanError::Cancelled) => {
                log::info!("Full scan cancelled; it will be retried");
                self.scan_pending.store(true, Ordering::SeqCst);
            }
            Err(e) => log::warn!("Full scan failed: {}", e),
        }
    }

    fn enforce_quota(&self) {
        let Some(governor) = &self.governor else {
            return;
        };
        if self.gate.is_halted() {
            return;
        }
        if let Err(e) = governor.enforce() {
            log::warn!("Quota enforcement failed: {}", e);
        }
    }

    fn handle_event(&self, tag: RootTag, result: notify::Result<Event>) {
        let event = match result {
            Ok(event) => event,
            Err(e) => {
                log::warn!("Watcher error on {:?}: {}", tag, e);
                return;
            }
        };
        let roots = self.index.roots();
        let Some(root) = roots.root_for(tag) else {
            return;
        };
        let record = |path: &Path, kind: ChangeKind| {
            if self.is_relevant(tag, root, path, kind) {
                self.pending(tag).record(path.to_path_buf(), kind);
            }
        };
        let record_all = |kind: ChangeKind| {
            for path in &event.paths {
                record(path.as_path(), kind);
            }
        };

        match event.kind {
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
                let (from, to) = (&event.paths[0], &event.paths[1]);
                let keep_from = self.is_relevant(tag, root, from, ChangeKind::Deleted);
                let keep_to = self.is_relevant(tag, root, to, ChangeKind::Created);
                match (keep_from, keep_to) {
                    (true, true) => self
                        .pending(tag)
                        .record_rename(from.clone(), to.clone()),
                    (true, false) => record(from.as_path(), ChangeKind::Deleted),
                    (false, true) => record(to.as_path(), ChangeKind::Created),
                    (false, false) => {}
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                record_all(ChangeKind::Deleted);
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                record_all(ChangeKind::Created);
            }
            EventKind::Modify(ModifyKind::Name(_)) => {
                for path in &event.paths {
                    let kind = if path.exists() {
                        ChangeKind::Created
                    } else {
                        ChangeKind::Deleted
                    };
                    record(path.as_path(), kind);
                }
            }
            EventKind::Create(_) => record_all(ChangeKind::Created),
            EventKind::Modify(_) => record_all(ChangeKind::Changed),
            EventKind::Remove(_) => record_all(ChangeKind::Deleted),
            EventKind::Access(_) | EventKind::Any | EventKind::Other => {}
        }
    }

    fn is_relevant(&self, tag: RootTag, root: &Path, path: &Path, kind: ChangeKind) -> bool {
        let walker = self.reconciler.walker();
        match tag {
            RootTag::CacheRoot => walker.is_cache_candidate(root, path),
            RootTag::ModRoot if walker.is_mod_candidate(root, path) => true,
            // A removed folder carries no extension; its entries are
            // resolved by prefix when the batch is applied.
            RootTag::ModRoot => {
                kind == ChangeKind::Deleted
                    && path.starts_with(root)
                    && path != root
                    && path.extension().is_none()
            }
        }
    }
}

/// Coordinator over the index, scanner, governor and halt gate.
pub struct CacheMonitor {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    watchers: Mutex<Vec<RecommendedWatcher>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl CacheMonitor {
    /// Build a monitor. Nothing runs until [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns an error if the scan worker pool cannot be created.
    pub fn new(
        index: Arc<HashIndex>,
        gate: Arc<HaltGate>,
        settings: MonitorSettings,
    ) -> Result<Self, MonitorError> {
        let reconciler = match settings.scan_threads {
            Some(threads) => {
                Reconciler::with_threads(Arc::clone(&index), settings.walker.clone(), threads)?
            }
            None => Reconciler::new(Arc::clone(&index), settings.walker.clone())?,
        };
        let shutdown = CancellationToken::new();
        Ok(Self {
            shared: Arc::new(Shared {
                index,
                gate,
                reconciler,
                governor: None,
                settings,
                mod_changes: PendingChanges::new(),
                cache_changes: PendingChanges::new(),
                scan_slot: OperationSlot::new("full scan").with_parent(shutdown.clone()),
                scan_pending: AtomicBool::new(false),
                scans_completed: AtomicU64::new(0),
                last_summary: Mutex::new(None),
                requests: Mutex::new(None),
            }),
            shutdown,
            watchers: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            worker: Mutex::new(None),
        })
    }

    /// Enforce `governor` after every completed full scan.
    ///
    /// Must be called before [`start`](Self::start); later calls are ignored.
    #[must_use]
    pub fn with_governor(mut self, governor: SizeGovernor) -> Self {
        match Arc::get_mut(&mut self.shared) {
            Some(shared) => shared.governor = Some(governor),
            None => log::warn!("Governor attached after start; ignored"),
        }
        self
    }

    /// Report full-scan progress to `callback`.
    ///
    /// Must be called before [`start`](Self::start); later calls are ignored.
    #[must_use]
    pub fn with_scan_callback(mut self, callback: Arc<dyn ProgressCallback>) -> Self {
        match Arc::get_mut(&mut self.shared) {
            Some(shared) => shared.reconciler.set_progress_callback(callback),
            None => log::warn!("Scan callback attached after start; ignored"),
        }
        self
    }

    /// Start the scan worker, drain tasks, timers and watchers.
    ///
    /// # Errors
    ///
    /// Returns an error outside a Tokio runtime, or if the worker thread or
    /// a watcher cannot be created.
    pub fn start(&self) -> Result<(), MonitorError> {
        let handle = Handle::try_current().map_err(|_| MonitorError::NoRuntime)?;
        self.spawn_worker()?;

        let mut tasks = lock(&self.tasks);
        for (tag, window) in [
            (RootTag::ModRoot, self.shared.settings.mod_debounce),
            (RootTag::CacheRoot, self.shared.settings.cache_debounce),
        ] {
            tasks.push(handle.spawn(drain_loop(
                Arc::clone(&self.shared),
                tag,
                window,
                self.shutdown.clone(),
            )));
        }
        tasks.push(handle.spawn(halt_loop(
            Arc::clone(&self.shared),
            self.shutdown.clone(),
        )));
        if let Some(interval) = self.shared.settings.full_scan_interval {
            tasks.push(handle.spawn(periodic_loop(
                Arc::clone(&self.shared),
                interval,
                self.shutdown.clone(),
            )));
        }
        drop(tasks);

        self.attach_watchers()?;

        if self.shared.index.roots().is_complete() {
            self.shared.request_scan(ScanTrigger::Startup);
        } else if self.shared.scan_pending.load(Ordering::SeqCst) {
            self.shared.request_scan(ScanTrigger::Resumed);
        }
        log::info!("Cache monitor started");
        Ok(())
    }

    /// Point the index and watchers at new root directories and rescan.
    ///
    /// # Errors
    ///
    /// Returns an error if a watcher cannot be attached to a new root.
    pub fn roots_changed(&self, roots: Roots) -> Result<(), MonitorError> {
        log::info!("Roots changed; rescanning");
        self.shared.scan_slot.cancel();
        self.shared.mod_changes.clear();
        self.shared.cache_changes.clear();
        self.shared.index.set_roots(roots);
        if lock(&self.worker).is_some() {
            self.attach_watchers()?;
        }
        self.shared.request_scan(ScanTrigger::RootsChanged);
        Ok(())
    }

    /// A user session started; rescan.
    pub fn session_started(&self) {
        self.shared.request_scan(ScanTrigger::SessionStarted);
    }

    /// Rescan now (or as soon as the halt gate opens).
    pub fn force_rescan(&self) {
        self.shared.request_scan(ScanTrigger::Forced);
    }

    /// Add a halt hold for `reason`. A running scan is cancelled.
    pub fn halt(&self, reason: &str) {
        self.shared.gate.halt(reason);
    }

    /// Release one halt hold for `reason`.
    pub fn resume(&self, reason: &str) -> bool {
        self.shared.gate.resume(reason)
    }

    /// Whether any halt is held.
    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.shared.gate.is_halted()
    }

    /// The shared halt gate.
    #[must_use]
    pub fn gate(&self) -> Arc<HaltGate> {
        Arc::clone(&self.shared.gate)
    }

    /// Progress of the current (or last) full scan.
    #[must_use]
    pub fn scan_progress(&self) -> Arc<ScanProgress> {
        self.shared.reconciler.progress()
    }

    /// Summary of the last completed full scan.
    #[must_use]
    pub fn last_scan(&self) -> Option<ScanSummary> {
        lock(&self.shared.last_summary).clone()
    }

    /// Number of full scans completed.
    #[must_use]
    pub fn scans_completed(&self) -> u64 {
        self.shared.scans_completed.load(Ordering::SeqCst)
    }

    /// Whether a scan was cancelled or deferred and awaits a retry.
    #[must_use]
    pub fn scan_pending(&self) -> bool {
        self.shared.scan_pending.load(Ordering::SeqCst)
    }

    /// Pending change counts `(mod_root, cache_root)`.
    #[must_use]
    pub fn pending_changes(&self) -> (usize, usize) {
        (self.shared.mod_changes.len(), self.shared.cache_changes.len())
    }

    /// Stop everything and flush the index.
    ///
    /// Blocks until the scan worker has exited; a running scan is cancelled
    /// first.
    pub fn shutdown(&self) {
        if self.shutdown.is_cancelled() && lock(&self.worker).is_none() {
            return;
        }
        log::info!("Stopping cache monitor");
        self.shutdown.cancel();
        self.shared.scan_slot.cancel();
        lock(&self.watchers).clear();
        lock(&self.shared.requests).take();
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        if let Some(worker) = lock(&self.worker).take() {
            if worker.join().is_err() {
                log::error!("Scan worker panicked");
            }
        }
        if let Err(e) = self.shared.index.flush() {
            log::error!("Failed to flush index on shutdown: {}", e);
        }
    }

    fn spawn_worker(&self) -> Result<(), MonitorError> {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            return Ok(());
        }
        let (tx, rx) = mpsc::channel::<ScanTrigger>();
        let shared = Arc::clone(&self.shared);
        let shutdown = self.shutdown.clone();
        let handle = thread::Builder::new()
            .name("modcache-scan".into())
            .spawn(move || {
                crate::scanner::reconcile::lower_thread_priority();
                while let Ok(mut trigger) = rx.recv() {
                    // Collapse a burst of requests into one scan.
                    while let Ok(next) = rx.try_recv() {
                        trigger = next;
                    }
                    if shutdown.is_cancelled() {
                        break;
                    }
                    shared.run_scan(trigger);
                }
                log::debug!("Scan worker exiting");
            })
            .map_err(MonitorError::Thread)?;
        *lock(&self.shared.requests) = Some(tx);
        *worker = Some(handle);
        Ok(())
    }

    fn attach_watchers(&self) -> Result<(), MonitorError> {
        let roots = self.shared.index.roots();
        let mut watchers = lock(&self.watchers);
        watchers.clear();

        for (tag, mode) in [
            (RootTag::ModRoot, RecursiveMode::Recursive),
            (RootTag::CacheRoot, RecursiveMode::NonRecursive),
        ] {
            let Some(root) = roots.root_for(tag) else {
                continue;
            };
            if !root.is_dir() {
                log::warn!("Not watching {:?}: {} is not a directory", tag, root.display());
                continue;
            }
            let shared = Arc::clone(&self.shared);
            let mut watcher = notify::recommended_watcher(move |result| {
                shared.handle_event(tag, result);
            })?;
            watcher.watch(root, mode)?;
            log::debug!("Watching {:?} at {}", tag, root.display());
            watchers.push(watcher);
        }
        Ok(())
    }
}

impl Drop for CacheMonitor {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.shared.scan_slot.cancel();
        lock(&self.shared.requests).take();
    }
}

async fn drain_loop(
    shared: Arc<Shared>,
    tag: RootTag,
    window: Duration,
    shutdown: CancellationToken,
) {
    let tick = (window / 4).clamp(Duration::from_millis(20), Duration::from_millis(500));
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        if shared.gate.is_halted() || !shared.pending(tag).is_settled(window) {
            continue;
        }

        let batch = shared.pending(tag).take_batch();
        let index = Arc::clone(&shared.index);
        run_batch(shared.pending(tag), tag, batch, move |changes| {
            apply_batch(&index, changes)
        })
        .await;
    }
}

/// Apply `batch` on the blocking pool, then complete it.
///
/// A batch whose apply panicked is completed too: the changes are dropped
/// with an error and left for the next full scan.
async fn run_batch<F>(
    pending: &PendingChanges,
    tag: RootTag,
    batch: Vec<PendingChange>,
    apply: F,
) where
    F: FnOnce(&[PendingChange]) -> BatchOutcome + Send + 'static,
{
    let changes = batch.clone();
    match tokio::task::spawn_blocking(move || apply(&changes)).await {
        Ok(outcome) => log::debug!("{:?} batch applied: {:?}", tag, outcome),
        Err(e) => log::error!(
            "{:?} change batch panicked, dropping {} change(s): {}",
            tag,
            batch.len(),
            e
        ),
    }
    pending.complete(&batch);
}

async fn halt_loop(shared: Arc<Shared>, shutdown: CancellationToken) {
    let mut rx = shared.gate.subscribe();
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        let halted = !rx.borrow_and_update().is_empty();
        if halted {
            shared.scan_slot.cancel();
        } else if shared.scan_pending.load(Ordering::SeqCst) {
            shared.request_scan(ScanTrigger::Resumed);
        }
    }
}

async fn periodic_loop(shared: Arc<Shared>, every: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately; startup has its own trigger.
    interval.tick().await;
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = interval.tick() => {
                if shared.gate.is_halted() {
                    shared.scan_pending.store(true, Ordering::SeqCst);
                } else {
                    shared.request_scan(ScanTrigger::Periodic);
                }
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
