//! Coalescing of filesystem watcher events.
//!
//! Watcher callbacks arrive on arbitrary threads and in bursts: an editor
//! saving a texture may emit create, several modify and a rename for the same
//! file within milliseconds. [`PendingChanges`] folds them into one pending
//! change per absolute path ("latest change wins"); a rename becomes a
//! deletion of the old path plus a creation of the new one.
//!
//! A single drain task per root waits until the map has been quiet for its
//! debounce window, takes a [`batch`](PendingChanges::take_batch), resolves it
//! with [`apply_batch`] and then [`completes`](PendingChanges::complete) it.
//! Completion removes exactly the processed events: a path that changed again
//! while the batch was running keeps its newer event for the next round.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::index::{HashIndex, ScanResult};

/// What happened to a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// A file appeared.
    Created,
    /// A file's content or metadata changed.
    Changed,
    /// A file or folder disappeared.
    Deleted,
}

/// One coalesced change, as handed to [`apply_batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChange {
    /// Absolute path of the changed file.
    pub path: PathBuf,
    /// Latest change observed for the path.
    pub kind: ChangeKind,
    seq: u64,
}

#[derive(Debug, Default)]
struct State {
    changes: HashMap<PathBuf, (ChangeKind, u64)>,
    next_seq: u64,
    last_event: Option<Instant>,
}

/// Lock-protected map of pending changes for one watched root.
#[derive(Debug, Default)]
pub struct PendingChanges {
    state: Mutex<State>,
}

impl PendingChanges {
    /// Create an empty pending map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a change, replacing any earlier change to the same path.
    pub fn record(&self, path: PathBuf, kind: ChangeKind) {
        let mut state = self.lock();
        state.next_seq += 1;
        let seq = state.next_seq;
        log::trace!("Pending {:?}: {}", kind, path.display());
        state.changes.insert(path, (kind, seq));
        state.last_event = Some(Instant::now());
    }

    /// Record a rename as removal of `from` plus creation of `to`.
    pub fn record_rename(&self, from: PathBuf, to: PathBuf) {
        self.record(from, ChangeKind::Deleted);
        self.record(to, ChangeKind::Created);
    }

    /// Number of pending paths.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().changes.len()
    }

    /// Whether nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().changes.is_empty()
    }

    /// Time since the last recorded event, or `None` when nothing is pending.
    #[must_use]
    pub fn quiet_for(&self) -> Option<Duration> {
        let state = self.lock();
        if state.changes.is_empty() {
            return None;
        }
        state.last_event.map(|t| t.elapsed())
    }

    /// Whether changes are pending and no event arrived within `window`.
    #[must_use]
    pub fn is_settled(&self, window: Duration) -> bool {
        self.quiet_for().is_some_and(|quiet| quiet >= window)
    }

    /// Snapshot the pending changes without clearing them.
    #[must_use]
    pub fn take_batch(&self) -> Vec<PendingChange> {
        let mut batch: Vec<PendingChange> = self
            .lock()
            .changes
            .iter()
            .map(|(path, (kind, seq))| PendingChange {
                path: path.clone(),
                kind: *kind,
                seq: *seq,
            })
            .collect();
        batch.sort_by_key(|change| change.seq);
        batch
    }

    /// Remove the processed changes, keeping any newer event for the same path.
    pub fn complete(&self, batch: &[PendingChange]) {
        let mut state = self.lock();
        for change in batch {
            if state
                .changes
                .get(&change.path)
                .is_some_and(|(_, seq)| *seq == change.seq)
            {
                state.changes.remove(&change.path);
            }
        }
    }

    /// Drop everything pending.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.changes.clear();
        state.last_event = None;
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Counts from one applied batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// New or re-hashed entries.
    pub indexed: usize,
    /// Entries removed.
    pub removed: usize,
    /// Changes that resolved to nothing (outside roots, vanished, unchanged).
    pub skipped: usize,
}

impl BatchOutcome {
    /// Whether the batch changed the index.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.indexed > 0 || self.removed > 0
    }
}

/// Resolve a batch of coalesced changes into index mutations, then flush once.
///
/// - Created / changed: a known entry is validated, so it is only rehashed
///   when its mtime moved and keeps its recorded sizes otherwise. An unknown
///   file is hashed and registered.
/// - Deleted: the matching entry is validated, which drops it if the file is
///   really gone. A deleted folder validates every entry beneath it.
pub fn apply_batch(index: &HashIndex, batch: &[PendingChange]) -> BatchOutcome {
    let mut outcome = BatchOutcome::default();

    for change in batch {
        match change.kind {
            ChangeKind::Created | ChangeKind::Changed if change.path.is_file() => {
                let known = index.prefix(&change.path).and_then(|key| index.get(&key));
                if let Some(mut entry) = known {
                    match index.validate(&mut entry) {
                        ScanResult::Valid => outcome.skipped += 1,
                        ScanResult::RequireUpdate => outcome.indexed += 1,
                        ScanResult::RequireDeletion => outcome.removed += 1,
                    }
                } else if index.create_entry(&change.path, None).is_some() {
                    outcome.indexed += 1;
                } else {
                    outcome.skipped += 1;
                }
            }
            ChangeKind::Created | ChangeKind::Changed | ChangeKind::Deleted => {
                let removed = remove_if_gone(index, &change.path);
                if removed == 0 {
                    outcome.skipped += 1;
                }
                outcome.removed += removed;
            }
        }
    }

    if outcome.is_dirty() {
        if let Err(e) = index.flush() {
            log::warn!("Failed to flush index after change batch: {}", e);
        }
    }
    log::debug!(
        "Applied {} change(s): {} indexed, {} removed, {} skipped",
        batch.len(),
        outcome.indexed,
        outcome.removed,
        outcome.skipped
    );
    outcome
}

fn remove_if_gone(index: &HashIndex, path: &Path) -> usize {
    let Some(key) = index.prefix(path) else {
        return 0;
    };

    if let Some(mut entry) = index.get(&key) {
        return usize::from(index.validate(&mut entry) == ScanResult::RequireDeletion);
    }

    // No exact entry: the path may have been a folder.
    let folder = format!("{}/", key.relative());
    index
        .entries()
        .into_iter()
        .filter(|entry| entry.path.tag() == key.tag() && entry.path.relative().starts_with(&folder))
        .filter_map(|mut entry| {
            (index.validate(&mut entry) == ScanResult::RequireDeletion).then_some(())
        })
        .count()
}
