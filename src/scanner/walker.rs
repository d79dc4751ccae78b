//! Candidate discovery for the mod root and the cache root.
//!
//! # Overview
//!
//! The two roots are enumerated differently:
//!
//! - **Mod root**: walked recursively with [`jwalk`]. Only files whose
//!   extension is on the allow-list are candidates, and any subfolder whose
//!   name is on the exclusion list is pruned (gitignore-style matching via the
//!   `ignore` crate, case-insensitive).
//! - **Cache root**: read one level deep with [`walkdir`]. Only files whose
//!   stem has the shape of a content hash are candidates.
//!
//! The same predicates are used to filter watcher events, so a file that a
//! full scan would skip is also ignored when it changes.
//!
//! # Example
//!
//! ```no_run
//! use modcache::scanner::{CandidateWalker, WalkerConfig};
//! use std::path::Path;
//!
//! let walker = CandidateWalker::new(WalkerConfig::default());
//! for path in walker.walk_mod_root(Path::new("/games/mods")).filter_map(Result::ok) {
//!     println!("{}", path.display());
//! }
//! ```

use std::path::{Path, PathBuf};

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use jwalk::WalkDir;
use tokio_util::sync::CancellationToken;

use super::hasher::is_hash_shaped;
use super::{ScanError, WalkerConfig};

/// Enumerates candidate files under both roots.
#[derive(Debug, Clone)]
pub struct CandidateWalker {
    config: WalkerConfig,
    excluded: Option<Gitignore>,
    cancel: Option<CancellationToken>,
}

impl CandidateWalker {
    /// Create a walker from a filter configuration.
    #[must_use]
    pub fn new(config: WalkerConfig) -> Self {
        let excluded = build_exclusions(&config.excluded_folders);
        Self {
            config,
            excluded,
            cancel: None,
        }
    }

    /// Stop iteration as soon as `token` is cancelled.
    #[must_use]
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Filter configuration in use.
    #[must_use]
    pub fn config(&self) -> &WalkerConfig {
        &self.config
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    /// Whether a path under `mod_root` is an indexable mod file.
    ///
    /// Checks the extension allow-list and that no ancestor folder between
    /// the root and the file is excluded. The file itself need not exist,
    /// so deletions can be filtered too.
    #[must_use]
    pub fn is_mod_candidate(&self, mod_root: &Path, path: &Path) -> bool {
        let Ok(relative) = path.strip_prefix(mod_root) else {
            return false;
        };
        if relative.as_os_str().is_empty() || !self.has_allowed_extension(path) {
            return false;
        }
        match &self.excluded {
            Some(gi) => !gi.matched_path_or_any_parents(relative, false).is_ignore(),
            None => true,
        }
    }

    /// Whether a path is a cache file: directly inside `cache_root` and named
    /// by a content hash (any extension).
    #[must_use]
    pub fn is_cache_candidate(&self, cache_root: &Path, path: &Path) -> bool {
        if path.parent() != Some(cache_root) {
            return false;
        }
        path.file_stem()
            .and_then(|stem| stem.to_str())
            .is_some_and(is_hash_shaped)
    }

    fn has_allowed_extension(&self, path: &Path) -> bool {
        if self.config.extensions.is_empty() {
            return true;
        }
        let Some(extension) = path.extension().and_then(|e| e.to_str()) else {
            return false;
        };
        self.config
            .extensions
            .iter()
            .any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(extension))
    }

    /// Walk the mod root recursively, yielding candidate files.
    ///
    /// Errors are yielded as [`ScanError`] values rather than stopping iteration.
    pub fn walk_mod_root<'a>(
        &'a self,
        mod_root: &'a Path,
    ) -> impl Iterator<Item = Result<PathBuf, ScanError>> + 'a {
        let excluded = self.excluded.clone();
        let root = mod_root.to_path_buf();

        let walk_dir = WalkDir::new(mod_root)
            .skip_hidden(false)
            .process_read_dir(move |_depth, dir_path, _state, children| {
                // Prune excluded folders before jwalk descends into them.
                if let Some(gi) = &excluded {
                    children.retain(|child| match child {
                        Ok(entry) if entry.file_type().is_dir() => {
                            let path = dir_path.join(entry.file_name());
                            let relative = path.strip_prefix(&root).unwrap_or(&path);
                            !gi.matched(relative, true).is_ignore()
                        }
                        _ => true,
                    });
                }
                children.sort_by(|a, b| match (a, b) {
                    (Ok(a), Ok(b)) => a.file_name().cmp(b.file_name()),
                    (Ok(_), Err(_)) => std::cmp::Ordering::Less,
                    (Err(_), Ok(_)) => std::cmp::Ordering::Greater,
                    (Err(_), Err(_)) => std::cmp::Ordering::Equal,
                });
            });

        walk_dir.into_iter().filter_map(move |entry_result| {
            if self.is_cancelled() {
                log::debug!("Walker: cancellation requested, stopping iteration");
                return None;
            }

            match entry_result {
                Ok(entry) => {
                    if !entry.file_type().is_file() {
                        return None;
                    }
                    let path = entry.path();
                    if self.is_mod_candidate(mod_root, &path) {
                        Some(Ok(path))
                    } else {
                        log::trace!("Skipping non-candidate: {}", path.display());
                        None
                    }
                }
                Err(e) => {
                    let path = e
                        .path()
                        .map_or_else(|| mod_root.to_path_buf(), std::borrow::ToOwned::to_owned);
                    log::warn!("Walker error for {}: {}", path.display(), e);
                    Some(Err(ScanError::Io {
                        path,
                        source: std::io::Error::other(e.to_string()),
                    }))
                }
            }
        })
    }

    /// List candidate files directly inside the cache root.
    ///
    /// # Errors
    ///
    /// Returns [`ScanError::NotADirectory`] if the cache root is not a
    /// directory. Unreadable individual entries are logged and skipped.
    pub fn walk_cache_root(&self, cache_root: &Path) -> Result<Vec<PathBuf>, ScanError> {
        if !cache_root.is_dir() {
            return Err(ScanError::NotADirectory(cache_root.to_path_buf()));
        }

        let mut files = Vec::new();
        for entry in walkdir::WalkDir::new(cache_root)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            if self.is_cancelled() {
                break;
            }
            match entry {
                Ok(entry) if entry.file_type().is_file() => {
                    let path = entry.into_path();
                    if self.is_cache_candidate(cache_root, &path) {
                        files.push(path);
                    }
                }
                Ok(_) => {}
                Err(e) => log::warn!("Cache walk error: {}", e),
            }
        }
        Ok(files)
    }
}

fn build_exclusions(folders: &[String]) -> Option<Gitignore> {
    if folders.is_empty() {
        return None;
    }
    let mut builder = GitignoreBuilder::new("");
    if let Err(e) = builder.case_insensitive(true) {
        log::warn!("Case-insensitive folder matching unavailable: {}", e);
    }
    for folder in folders {
        let pattern = format!("{}/", folder.trim_matches(['/', '\\']));
        if let Err(e) = builder.add_line(None, &pattern) {
            log::warn!("Invalid excluded folder '{}': {}", folder, e);
        }
    }
    match builder.build() {
        Ok(gi) if !gi.is_empty() => Some(gi),
        Ok(_) => None,
        Err(e) => {
            log::warn!("Failed to build folder exclusions: {}", e);
            None
        }
    }
}
