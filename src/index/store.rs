//! In-memory hash index backed by [`IndexFile`].
//!
//! [`HashIndex`] is an explicitly owned object: there is no process-wide
//! state, so several indexes (one per test, say) can coexist.
//!
//! # Locking
//!
//! The entry map sits behind an `RwLock`; lookups take a read lock, mutators
//! a write lock. Hashing never happens while a lock is held. All writes to
//! disk go through the [`IndexFile`] writer lock, which serializes flushes
//! and appends.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::entry::{mtime_ticks, CacheEntry, ScanResult, Validation};
use super::path::{PrefixedPath, RootTag, Roots};
use super::persist::IndexFile;
use super::IndexError;
use crate::scanner::{HashError, Hasher};

/// Summary counts over the index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexStats {
    /// Total entries.
    pub entries: usize,
    /// Entries under the mod root.
    pub mod_root_entries: usize,
    /// Entries under the cache root.
    pub cache_root_entries: usize,
    /// Sum of known logical sizes.
    pub total_size: u64,
}

/// Persistent map from [`PrefixedPath`] to [`CacheEntry`].
#[derive(Debug)]
pub struct HashIndex {
    entries: RwLock<HashMap<PrefixedPath, CacheEntry>>,
    roots: RwLock<Roots>,
    file: IndexFile,
    hasher: Hasher,
    malformed_on_load: usize,
}

impl HashIndex {
    /// Load the index stored at `path`, recovering from a leftover backup.
    ///
    /// # Errors
    ///
    /// Returns an error if the index file exists but cannot be read.
    pub fn open(path: &Path, roots: Roots) -> Result<Self, IndexError> {
        let file = IndexFile::new(path);
        let outcome = file.load()?;
        if outcome.malformed_lines > 0 {
            log::warn!(
                "Index {} had {} malformed line(s); they were dropped",
                path.display(),
                outcome.malformed_lines
            );
        }
        log::info!(
            "Opened hash index with {} entries from {}",
            outcome.entries.len(),
            path.display()
        );

        Ok(Self {
            entries: RwLock::new(outcome.entries),
            roots: RwLock::new(roots),
            file,
            hasher: Hasher::new(),
            malformed_on_load: outcome.malformed_lines,
        })
    }

    /// Currently configured roots.
    #[must_use]
    pub fn roots(&self) -> Roots {
        self.roots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the live roots. Existing keys resolve against the new directories.
    pub fn set_roots(&self, roots: Roots) {
        *self.roots.write().unwrap_or_else(PoisonError::into_inner) = roots;
    }

    /// Resolve a key to an absolute path against the current roots.
    #[must_use]
    pub fn resolve(&self, key: &PrefixedPath) -> Option<PathBuf> {
        self.roots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .resolve(key)
    }

    /// Turn an absolute path into a key against the current roots.
    #[must_use]
    pub fn prefix(&self, absolute: &Path) -> Option<PrefixedPath> {
        self.roots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .prefix(absolute)
    }

    /// The hasher used for every digest this index computes.
    #[must_use]
    pub fn hasher(&self) -> &Hasher {
        &self.hasher
    }

    /// Number of lines dropped as malformed when the index was loaded.
    #[must_use]
    pub fn malformed_on_load(&self) -> usize {
        self.malformed_on_load
    }

    /// Backing file location.
    #[must_use]
    pub fn file_path(&self) -> &Path {
        self.file.path()
    }

    /// Look up (or create) the entry for an absolute path.
    ///
    /// An existing entry is validated first. A path with no entry is hashed
    /// and registered if the file exists under a configured root.
    pub fn lookup_by_path(&self, absolute: &Path) -> Option<CacheEntry> {
        let key = self.prefix(absolute)?;
        match self.get(&key) {
            Some(mut entry) => match self.validate(&mut entry) {
                ScanResult::RequireDeletion => None,
                ScanResult::Valid | ScanResult::RequireUpdate => Some(entry),
            },
            None => self.create_entry(absolute, None),
        }
    }

    /// Look up an entry by content hash.
    ///
    /// When several entries share the hash the winner is chosen by
    /// [`tie_break`]. If the winner's file turns out to be gone it is dropped
    /// and the next candidate is tried.
    pub fn lookup_by_hash(&self, hash: &str) -> Option<CacheEntry> {
        let mut candidates: Vec<CacheEntry> = self
            .read()
            .values()
            .filter(|entry| entry.has_hash(hash))
            .cloned()
            .collect();
        candidates.sort_by(tie_break);

        for mut candidate in candidates {
            match self.validate(&mut candidate) {
                ScanResult::Valid => return Some(candidate),
                // Content changed underneath us; it may no longer match.
                ScanResult::RequireUpdate if candidate.has_hash(hash) => return Some(candidate),
                ScanResult::RequireUpdate | ScanResult::RequireDeletion => {}
            }
        }
        None
    }

    /// Resolve a hash to the local file currently holding that content.
    #[must_use]
    pub fn resolve_hash(&self, hash: &str) -> Option<PathBuf> {
        let entry = self.lookup_by_hash(hash)?;
        self.resolve(&entry.path)
    }

    /// Hash and register a file, appending one record to the persisted log.
    ///
    /// Returns `None` if the file does not exist, lies outside both roots or
    /// cannot be hashed.
    pub fn create_entry(&self, absolute: &Path, explicit_hash: Option<&str>) -> Option<CacheEntry> {
        let key = self.prefix(absolute)?;
        let metadata = match fs::metadata(absolute) {
            Ok(m) if m.is_file() => m,
            Ok(_) => return None,
            Err(e) => {
                log::debug!("Cannot index {}: {}", absolute.display(), e);
                return None;
            }
        };

        let hash = match explicit_hash {
            Some(hash) => hash.to_string(),
            None => match self.hasher.hash_file(absolute) {
                Ok(hash) => hash,
                Err(e) => {
                    log::warn!("Failed to hash {}: {}", absolute.display(), e);
                    return None;
                }
            },
        };

        let entry = CacheEntry::new(&hash, key, mtime_ticks(&metadata))
            .with_sizes(Some(metadata.len()), None);

        self.write().insert(entry.path.clone(), entry.clone());
        if let Err(e) = self.file.append(&entry) {
            log::warn!("Failed to append index record for {}: {}", entry.path, e);
        }
        log::debug!("Indexed {} as {}", entry.path, entry.hash);
        Some(entry)
    }

    /// Check an entry against the filesystem without mutating the index.
    ///
    /// # Errors
    ///
    /// Returns a [`HashError`] for transient failures (file locked, vanished
    /// mid-read); callers skip the entry for this pass.
    pub fn revalidate(&self, entry: &CacheEntry) -> Result<Validation, HashError> {
        let Some(resolved) = self.resolve(&entry.path) else {
            return Ok(Validation::Unresolved);
        };

        let metadata = match fs::metadata(&resolved) {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Ok(Validation::Missing),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Validation::Missing),
            Err(e) => {
                return Err(HashError::Io {
                    path: resolved,
                    source: e,
                })
            }
        };

        let ticks = mtime_ticks(&metadata);
        if ticks == entry.last_modified_ticks {
            return Ok(Validation::Valid);
        }

        let hash = match self.hasher.hash_file(&resolved) {
            Ok(hash) => hash,
            Err(HashError::NotFound(_)) => return Ok(Validation::Missing),
            Err(e) => return Err(e),
        };
        let mut updated = CacheEntry::new(&hash, entry.path.clone(), ticks);
        updated.size = Some(metadata.len());
        updated.compressed_size = if hash == entry.hash {
            entry.compressed_size
        } else {
            None
        };
        Ok(Validation::Updated(updated))
    }

    /// Validate an entry and apply the outcome to the index.
    ///
    /// On [`ScanResult::RequireUpdate`] `entry` is rewritten in place with the
    /// new hash and mtime. Transient errors leave everything untouched and
    /// report [`ScanResult::Valid`].
    pub fn validate(&self, entry: &mut CacheEntry) -> ScanResult {
        match self.revalidate(entry) {
            Ok(Validation::Valid | Validation::Unresolved) => ScanResult::Valid,
            Ok(Validation::Updated(updated)) => {
                *entry = updated.clone();
                self.update_entry(updated);
                ScanResult::RequireUpdate
            }
            Ok(Validation::Missing) => {
                self.remove_entry(&entry.path);
                ScanResult::RequireDeletion
            }
            Err(e) => {
                log::warn!("Skipping validation of {}: {}", entry.path, e);
                ScanResult::Valid
            }
        }
    }

    /// Fetch a stored entry without validating it.
    #[must_use]
    pub fn get(&self, key: &PrefixedPath) -> Option<CacheEntry> {
        self.read().get(key).cloned()
    }

    /// Drop an entry. Returns the removed entry, if any.
    pub fn remove_entry(&self, key: &PrefixedPath) -> Option<CacheEntry> {
        let removed = self.write().remove(key);
        if removed.is_some() {
            log::debug!("Removed index entry {}", key);
        }
        removed
    }

    /// Insert or replace an entry wholesale.
    pub fn update_entry(&self, entry: CacheEntry) {
        self.write().insert(entry.path.clone(), entry);
    }

    /// Persist the full index, sorted by path.
    ///
    /// The snapshot is taken under the file's writer lock, so a record that
    /// [`create_entry`](Self::create_entry) appends concurrently either makes
    /// it into the rewrite or is appended after it.
    ///
    /// # Errors
    ///
    /// Returns an error if the primary file could not be written (the content
    /// is preserved in the backup file in that case).
    pub fn flush(&self) -> Result<(), IndexError> {
        let written = self.file.write_with(|| self.entries())?;
        log::debug!("Flushed {} index entries", written);
        Ok(())
    }

    /// Snapshot of every entry.
    #[must_use]
    pub fn entries(&self) -> Vec<CacheEntry> {
        self.read().values().cloned().collect()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether the index holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Summary counts.
    #[must_use]
    pub fn stats(&self) -> IndexStats {
        let entries = self.read();
        let mut stats = IndexStats {
            entries: entries.len(),
            ..Default::default()
        };
        for entry in entries.values() {
            match entry.path.tag() {
                RootTag::ModRoot => stats.mod_root_entries += 1,
                RootTag::CacheRoot => stats.cache_root_entries += 1,
            }
            stats.total_size += entry.size.unwrap_or(0);
        }
        stats
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<PrefixedPath, CacheEntry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<PrefixedPath, CacheEntry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Ordering used to pick one entry among several sharing a hash.
///
/// The longest prefixed-path string sorts first; equal lengths fall back to
/// lexicographic order so the choice never depends on map iteration order.
#[must_use]
pub fn tie_break(a: &CacheEntry, b: &CacheEntry) -> std::cmp::Ordering {
    let (a, b) = (a.path.to_string(), b.path.to_string());
    b.len().cmp(&a.len()).then_with(|| a.cmp(&b))
}
