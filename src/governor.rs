//! Quota enforcement for the cache root.
//!
//! # Overview
//!
//! [`SizeGovernor`] measures the cache root and, when it exceeds the
//! configured quota, deletes the least-recently-accessed files (by the OS
//! last-access timestamp) until usage drops to `quota - buffer`, where the
//! buffer is a fraction of the quota (5% by default).
//!
//! Only top-level regular files count: the cache root is flat and anything
//! in subfolders (in-flight downloads, for instance) is not cache content.
//!
//! When a [`CompactionHook`] is active, usage is measured as on-disk
//! allocation instead of logical length, since compacted files occupy less
//! than they report.
//!
//! Eviction deletes files only. Their index entries are left in place and
//! dropped the next time they are validated.
//!
//! # Example
//!
//! ```no_run
//! use modcache::governor::SizeGovernor;
//! use std::path::Path;
//!
//! let governor = SizeGovernor::new(Path::new("/srv/cache"), 10 * 1024 * 1024 * 1024);
//! let report = governor.enforce().unwrap();
//! println!("evicted {} files", report.evicted.len());
//! ```

use std::fs::{self, Metadata};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use filetime::FileTime;
use walkdir::WalkDir;

use crate::halt::{HaltGate, TRANSFER_REASON_PREFIX};

/// Default share of the quota kept free after eviction.
pub const DEFAULT_BUFFER_RATIO: f64 = 0.05;

/// Post-write hook that compacts cached files in place.
///
/// The compaction mechanism itself is external; the cache only calls
/// [`compact`](CompactionHook::compact) after placing a file and switches
/// usage accounting to allocation size while the hook is active.
pub trait CompactionHook: Send + Sync {
    /// Whether compaction is currently enabled.
    fn is_active(&self) -> bool;

    /// Compact one freshly written file.
    ///
    /// # Errors
    ///
    /// Failures are logged by the caller and never undo the write.
    fn compact(&self, path: &Path) -> io::Result<()>;
}

/// No compaction; usage is logical length.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCompaction;

impl CompactionHook for NoCompaction {
    fn is_active(&self) -> bool {
        false
    }

    fn compact(&self, _path: &Path) -> io::Result<()> {
        Ok(())
    }
}

/// Compaction handled outside the process (e.g. a compressing filesystem).
///
/// Placing a file needs no extra work; usage is still measured as
/// allocation size so the quota reflects real disk consumption.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExternalCompaction;

impl CompactionHook for ExternalCompaction {
    fn is_active(&self) -> bool {
        true
    }

    fn compact(&self, path: &Path) -> io::Result<()> {
        log::trace!("Compaction of {} left to the filesystem", path.display());
        Ok(())
    }
}

/// Outcome of one [`SizeGovernor::enforce`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Usage measured before eviction.
    pub usage_before: u64,
    /// Usage after eviction.
    pub usage_after: u64,
    /// Deleted files, oldest access first.
    pub evicted: Vec<PathBuf>,
}

impl EvictionReport {
    /// Bytes released.
    #[must_use]
    pub fn freed(&self) -> u64 {
        self.usage_before.saturating_sub(self.usage_after)
    }
}

struct CachedFile {
    path: PathBuf,
    size: u64,
    accessed: FileTime,
}

/// LRU quota enforcement over the cache root.
pub struct SizeGovernor {
    cache_root: PathBuf,
    quota: u64,
    buffer_ratio: f64,
    hook: Arc<dyn CompactionHook>,
    gate: Option<Arc<HaltGate>>,
}

impl SizeGovernor {
    /// Create a governor with the default buffer and no compaction.
    #[must_use]
    pub fn new(cache_root: &Path, quota: u64) -> Self {
        Self {
            cache_root: cache_root.to_path_buf(),
            quota,
            buffer_ratio: DEFAULT_BUFFER_RATIO,
            hook: Arc::new(NoCompaction),
            gate: None,
        }
    }

    /// Set the share of the quota kept free after eviction (clamped to `0..=1`).
    #[must_use]
    pub fn with_buffer_ratio(mut self, ratio: f64) -> Self {
        self.buffer_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    /// Use `hook` to decide how usage is measured.
    #[must_use]
    pub fn with_compaction(mut self, hook: Arc<dyn CompactionHook>) -> Self {
        self.hook = hook;
        self
    }

    /// Stop evicting as soon as `gate` is halted.
    #[must_use]
    pub fn with_halt_gate(mut self, gate: Arc<HaltGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Configured quota in bytes.
    #[must_use]
    pub fn quota(&self) -> u64 {
        self.quota
    }

    /// Usage eviction aims for: `quota - quota * buffer_ratio`.
    #[must_use]
    pub fn target(&self) -> u64 {
        let buffer = (self.quota as f64 * self.buffer_ratio) as u64;
        self.quota.saturating_sub(buffer)
    }

    /// Total occupied size of the cache root.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache root cannot be listed.
    pub fn usage(&self) -> io::Result<u64> {
        Ok(self.list()?.iter().map(|f| f.size).sum())
    }

    /// Evict least-recently-accessed files until usage is at or below
    /// [`target`](Self::target). Does nothing while usage is within quota.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache root cannot be listed. Individual files
    /// that cannot be deleted are logged and skipped.
    pub fn enforce(&self) -> io::Result<EvictionReport> {
        let mut files = self.list()?;
        let usage_before: u64 = files.iter().map(|f| f.size).sum();
        let mut report = EvictionReport {
            usage_before,
            usage_after: usage_before,
            evicted: Vec::new(),
        };

        if usage_before <= self.quota {
            log::debug!(
                "Cache usage {} within quota {}",
                bytesize::ByteSize::b(usage_before),
                bytesize::ByteSize::b(self.quota)
            );
            return Ok(report);
        }

        files.sort_by(|a, b| a.accessed.cmp(&b.accessed).then_with(|| a.path.cmp(&b.path)));
        let target = self.target();

        for file in files {
            if report.usage_after <= target {
                break;
            }
            if self.is_halted() {
                log::info!(
                    "Eviction paused by halt; {} file(s) evicted so far",
                    report.evicted.len()
                );
                break;
            }
            match fs::remove_file(&file.path) {
                Ok(()) => {
                    log::debug!("Evicted {} ({} bytes)", file.path.display(), file.size);
                    report.usage_after = report.usage_after.saturating_sub(file.size);
                    report.evicted.push(file.path);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    report.usage_after = report.usage_after.saturating_sub(file.size);
                }
                Err(e) => log::warn!("Failed to evict {}: {}", file.path.display(), e),
            }
        }

        log::info!(
            "Evicted {} file(s), cache usage {} -> {} (quota {})",
            report.evicted.len(),
            bytesize::ByteSize::b(report.usage_before),
            bytesize::ByteSize::b(report.usage_after),
            bytesize::ByteSize::b(self.quota)
        );
        Ok(report)
    }

    fn is_halted(&self) -> bool {
        self.gate
            .as_ref()
            .is_some_and(|gate| gate.is_halted_except(TRANSFER_REASON_PREFIX))
    }

    fn list(&self) -> io::Result<Vec<CachedFile>> {
        if !self.cache_root.is_dir() {
            return Ok(Vec::new());
        }
        let allocation = self.hook.is_active();
        let mut files = Vec::new();

        for entry in WalkDir::new(&self.cache_root).min_depth(1).max_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!("Skipping unreadable cache entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    log::warn!("Cannot stat {}: {}", entry.path().display(), e);
                    continue;
                }
            };
            files.push(CachedFile {
                size: occupied_size(&metadata, allocation),
                accessed: FileTime::from_last_access_time(&metadata),
                path: entry.into_path(),
            });
        }
        Ok(files)
    }
}

#[cfg(unix)]
fn occupied_size(metadata: &Metadata, allocation: bool) -> u64 {
    use std::os::unix::fs::MetadataExt;
    if allocation {
        metadata.blocks() * 512
    } else {
        metadata.len()
    }
}

#[cfg(not(unix))]
fn occupied_size(metadata: &Metadata, _allocation: bool) -> u64 {
    metadata.len()
}
