//! Scanner module for filesystem reconciliation.
//!
//! This module keeps the [`HashIndex`](crate::index::HashIndex) consistent
//! with the files actually on disk:
//! - Candidate discovery under the mod root and cache root
//! - Content hashing with BLAKE3
//! - Full reconciliation scans on a bounded, low-priority worker pool
//! - Coalescing and batch application of watcher events
//!
//! # Architecture
//!
//! The scanner is divided into submodules:
//! - [`walker`]: Candidate enumeration and the shared file filters
//! - [`hasher`]: BLAKE3 file hashing (streaming)
//! - [`reconcile`]: The periodic / forced full scan
//! - [`debounce`]: Event coalescing for the filesystem watchers
//!
//! # Example
//!
//! ```no_run
//! use modcache::index::{HashIndex, Roots};
//! use modcache::scanner::{Reconciler, WalkerConfig};
//! use std::path::{Path, PathBuf};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! let roots = Roots::new(Some(PathBuf::from("/mods")), Some(PathBuf::from("/cache")));
//! let index = Arc::new(HashIndex::open(Path::new("/cache/index.txt"), roots).unwrap());
//! let reconciler = Reconciler::new(index, WalkerConfig::default()).unwrap();
//! let summary = reconciler.full_scan(&CancellationToken::new()).unwrap();
//! println!("{} new entries", summary.created);
//! ```

pub mod debounce;
pub mod hasher;
pub mod reconcile;
pub mod walker;

use std::path::PathBuf;

// Re-export main types
pub use debounce::{apply_batch, BatchOutcome, ChangeKind, PendingChange, PendingChanges};
pub use hasher::{is_hash_shaped, Hasher, HASH_HEX_LEN};
pub use reconcile::{scan_thread_count, Reconciler, ScanProgress, ScanSummary};
pub use walker::CandidateWalker;

/// File extensions indexed under the mod root by default.
pub const DEFAULT_EXTENSIONS: &[&str] = &[
    "tex", "atex", "mdl", "mtrl", "avfx", "pap", "tmb", "scd", "sklb", "shpk", "eid", "phyb",
];

/// Mod-root subfolders skipped by default.
pub const DEFAULT_EXCLUDED_FOLDERS: &[&str] = &["backup", "temp", ".git"];

/// Filters applied when discovering candidate files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkerConfig {
    /// Extensions (case-insensitive, with or without a leading dot) that are
    /// indexed under the mod root. Empty accepts every file.
    pub extensions: Vec<String>,

    /// Folder names pruned anywhere under the mod root (case-insensitive).
    pub excluded_folders: Vec<String>,
}

impl Default for WalkerConfig {
    fn default() -> Self {
        Self {
            extensions: DEFAULT_EXTENSIONS.iter().map(|s| (*s).to_string()).collect(),
            excluded_folders: DEFAULT_EXCLUDED_FOLDERS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }
}

impl WalkerConfig {
    /// Create a new filter configuration.
    ///
    /// # Arguments
    ///
    /// * `extensions` - Allowed mod-root file extensions
    /// * `excluded_folders` - Folder names to prune
    #[must_use]
    pub fn new(extensions: Vec<String>, excluded_folders: Vec<String>) -> Self {
        Self {
            extensions,
            excluded_folders,
        }
    }
}

/// Errors that can occur during a reconciliation scan.
#[derive(thiserror::Error, Debug)]
pub enum ScanError {
    /// The scan was cancelled (halted or superseded) before it finished.
    #[error("Scan cancelled")]
    Cancelled,

    /// The specified path is not a directory.
    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),

    /// The worker pool could not be started.
    #[error("Failed to build scan worker pool: {0}")]
    ThreadPool(String),

    /// The index could not be persisted.
    #[error(transparent)]
    Index(#[from] crate::index::IndexError),

    /// An I/O error occurred while accessing a file.
    #[error("I/O error for {path}: {source}")]
    Io {
        /// Path where the error occurred
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },
}

/// Errors that can occur during file hashing.
#[derive(thiserror::Error, Debug)]
pub enum HashError {
    /// The specified file was not found.
    #[error("File not found: {0}")]
    NotFound(PathBuf),

    /// Permission was denied when reading the file.
    #[error("Permission denied: {0}")]
    PermissionDenied(PathBuf),

    /// An I/O error occurred while reading the file.
    #[error("I/O error for {path}: {source}")]
    Io {
        /// Path where the error occurred
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },
}
