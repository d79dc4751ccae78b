//! Content-addressed index of cached asset files.
//!
//! This module provides the durable mapping from root-tagged paths to content
//! hashes that every other component reads and writes.
//!
//! # Architecture
//!
//! * [`path`]: Root tags, prefixed storage keys and their resolution.
//! * [`entry`]: The [`CacheEntry`] record and validation outcomes.
//! * [`persist`]: The flat-file format, crash-safe flush and load recovery.
//! * [`store`]: The in-memory [`HashIndex`] built on the above.
//!
//! # Entry Invalidation
//!
//! Entries are validated lazily against the filesystem:
//! * Missing file: the entry is dropped.
//! * Changed modification time: hash and mtime are recomputed in place.
//!
//! Validation runs on lookup, during full scans and when watcher events
//! arrive, so a stale entry is corrected the next time anything touches it.

pub mod entry;
pub mod path;
pub mod persist;
pub mod store;

use std::path::PathBuf;

pub use entry::{mtime_ticks, system_time_ticks, CacheEntry, ScanResult, Validation};
pub use path::{PrefixedPath, RootTag, Roots};
pub use persist::{IndexFile, LoadOutcome};
pub use store::{HashIndex, IndexStats};

/// Errors raised while loading or persisting the index.
#[derive(thiserror::Error, Debug)]
pub enum IndexError {
    /// An I/O error occurred while accessing the index file.
    #[error("I/O error for {path}: {source}")]
    Io {
        /// Path where the error occurred
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// A persisted record could not be parsed.
    #[error("Malformed index line ({reason}): {line}")]
    Malformed {
        /// The offending line
        line: String,
        /// Why it was rejected
        reason: String,
    },
}
