//! Transfer bookkeeping and progress callbacks.
//!
//! A [`TransferRecord`] exists for every hash in a running batch and is
//! dropped when the batch clears. A [`TransferGroup`] aggregates the files
//! bound to one relay endpoint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;

/// Which way bytes flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Local file to relay.
    Upload,
    /// Relay to cache root.
    Download,
}

/// Per-hash transfer state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferRecord {
    /// Content hash.
    pub hash: String,
    /// Direction of the transfer.
    pub direction: Direction,
    /// Bytes moved so far.
    pub transferred_bytes: u64,
    /// Expected bytes (compressed size).
    pub total_bytes: u64,
    /// Whether the relay refused this hash.
    pub forbidden: bool,
}

/// Live records of every batch in flight.
#[derive(Debug, Default)]
pub struct TransferLedger {
    records: Mutex<HashMap<(Direction, String), TransferRecord>>,
}

impl TransferLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `hash`.
    pub fn begin(&self, direction: Direction, hash: &str, total_bytes: u64, forbidden: bool) {
        self.lock().insert(
            (direction, hash.to_string()),
            TransferRecord {
                hash: hash.to_string(),
                direction,
                transferred_bytes: 0,
                total_bytes,
                forbidden,
            },
        );
    }

    /// Set the bytes moved for `hash`.
    pub fn set_progress(&self, direction: Direction, hash: &str, transferred: u64) {
        if let Some(record) = self.lock().get_mut(&(direction, hash.to_string())) {
            record.transferred_bytes = transferred;
            record.total_bytes = record.total_bytes.max(transferred);
        }
    }

    /// Drop the records of a finished batch.
    pub fn clear<'a, I>(&self, direction: Direction, hashes: I)
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut records = self.lock();
        for hash in hashes {
            records.remove(&(direction, hash.clone()));
        }
    }

    /// Snapshot of all live records, sorted by hash.
    #[must_use]
    pub fn snapshot(&self) -> Vec<TransferRecord> {
        let mut records: Vec<TransferRecord> = self.lock().values().cloned().collect();
        records.sort_by(|a, b| a.hash.cmp(&b.hash));
        records
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(Direction, String), TransferRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Files bound to one relay endpoint, with aggregate counters.
#[derive(Debug)]
pub struct TransferGroup {
    /// Relay endpoint serving the group.
    pub endpoint: String,
    /// Hashes in the group, in transfer order.
    pub hashes: Vec<String>,
    /// Sum of expected bytes.
    pub total_bytes: u64,
    transferred_bytes: AtomicU64,
    files_done: AtomicUsize,
}

impl TransferGroup {
    /// Create a group.
    #[must_use]
    pub fn new(endpoint: &str, hashes: Vec<String>, total_bytes: u64) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            hashes,
            total_bytes,
            transferred_bytes: AtomicU64::new(0),
            files_done: AtomicUsize::new(0),
        }
    }

    /// Add bytes moved by any file of the group.
    pub fn add_bytes(&self, bytes: u64) {
        self.transferred_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Count one finished file (successful or not).
    pub fn file_done(&self) {
        self.files_done.fetch_add(1, Ordering::Relaxed);
    }

    /// `(transferred_bytes, total_bytes)`.
    #[must_use]
    pub fn bytes(&self) -> (u64, u64) {
        (self.transferred_bytes.load(Ordering::Relaxed), self.total_bytes)
    }

    /// `(finished_files, total_files)`.
    #[must_use]
    pub fn files(&self) -> (usize, usize) {
        (self.files_done.load(Ordering::Relaxed), self.hashes.len())
    }
}

/// Receives transfer progress.
///
/// All methods default to no-ops.
pub trait TransferProgress: Send + Sync {
    /// A group started.
    fn on_group_start(&self, _direction: Direction, _group: &TransferGroup) {}

    /// Cumulative bytes for one hash changed.
    fn on_bytes(&self, _direction: Direction, _hash: &str, _transferred: u64, _total: u64) {}

    /// One file finished; `ok` is false on failure.
    fn on_file_done(&self, _direction: Direction, _hash: &str, _ok: bool) {}

    /// A group finished or was cancelled.
    fn on_group_end(&self, _direction: Direction, _group: &TransferGroup) {}
}
