//! Cache entry definitions.

use std::fs::Metadata;
use std::time::{SystemTime, UNIX_EPOCH};

use super::path::PrefixedPath;

/// A single indexed file: its content digest and where it lives.
///
/// The resolved on-disk location is never stored here; it is derived from
/// [`PrefixedPath`] and the live roots on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Lowercase hex content digest.
    pub hash: String,
    /// Root-tagged storage key.
    pub path: PrefixedPath,
    /// Logical file size, when known.
    pub size: Option<u64>,
    /// Size of the compressed transfer payload, when known.
    pub compressed_size: Option<u64>,
    /// Source modification time in 100ns ticks since the Unix epoch.
    pub last_modified_ticks: i64,
}

impl CacheEntry {
    /// Create an entry, normalizing the hash to lowercase.
    #[must_use]
    pub fn new(hash: &str, path: PrefixedPath, last_modified_ticks: i64) -> Self {
        Self {
            hash: hash.to_ascii_lowercase(),
            path,
            size: None,
            compressed_size: None,
            last_modified_ticks,
        }
    }

    /// Attach the logical and compressed sizes.
    #[must_use]
    pub fn with_sizes(mut self, size: Option<u64>, compressed_size: Option<u64>) -> Self {
        self.size = size;
        self.compressed_size = compressed_size;
        self
    }

    /// Case-insensitive hash comparison.
    #[must_use]
    pub fn has_hash(&self, hash: &str) -> bool {
        self.hash.eq_ignore_ascii_case(hash)
    }
}

/// Outcome of validating an existing entry against the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanResult {
    /// File is present and unchanged.
    Valid,
    /// File changed on disk; hash and mtime were recomputed.
    RequireUpdate,
    /// File is gone; the entry must be dropped.
    RequireDeletion,
}

/// Detailed validation outcome, carrying the refreshed entry when one was built.
///
/// Produced without touching the index so parallel validators can buffer
/// results and apply them in one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    /// Unchanged.
    Valid,
    /// Changed; the refreshed entry replaces the stored one.
    Updated(CacheEntry),
    /// File no longer exists.
    Missing,
    /// The entry's root is not configured, so the file cannot be checked.
    Unresolved,
}

impl Validation {
    /// Collapse to the tri-state [`ScanResult`].
    ///
    /// An unresolvable entry is left alone and reported as valid.
    #[must_use]
    pub fn scan_result(&self) -> ScanResult {
        match self {
            Self::Valid | Self::Unresolved => ScanResult::Valid,
            Self::Updated(_) => ScanResult::RequireUpdate,
            Self::Missing => ScanResult::RequireDeletion,
        }
    }
}

/// Modification-time fingerprint of a file in 100ns ticks since the Unix epoch.
///
/// Platforms without mtime support yield 0, which still compares stably.
#[must_use]
pub fn mtime_ticks(metadata: &Metadata) -> i64 {
    metadata.modified().map(system_time_ticks).unwrap_or(0)
}

/// Convert a [`SystemTime`] to 100ns ticks since the Unix epoch.
#[must_use]
pub fn system_time_ticks(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => i64::try_from(after.as_nanos() / 100).unwrap_or(i64::MAX),
        Err(before) => -i64::try_from(before.duration().as_nanos() / 100).unwrap_or(i64::MAX),
    }
}
