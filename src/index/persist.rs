//! Flat-file persistence for the hash index.
//!
//! One record per line:
//!
//! ```text
//! <hash>|<prefixedPath>|<mtimeTicks>[|<size>|<compressedSize>]
//! ```
//!
//! A path may itself contain `|`. Such records are always written in the long
//! form, and the reader takes the hash from the left and the three numeric
//! fields from the right, so the path is everything in between.
//!
//! Flushes render the whole index into `<index>.tmp` and rename it over the
//! primary, so a crash mid-write leaves the previous primary intact. If the
//! replace fails, the new content is written to `<index>.bak` instead. At load
//! time that backup is promoted unless the primary is strictly newer, in which
//! case it is a leftover and is discarded.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::entry::CacheEntry;
use super::path::PrefixedPath;
use super::IndexError;

const FIELD_SEPARATOR: char = '|';

/// Result of loading the persisted index.
#[derive(Debug, Default)]
pub struct LoadOutcome {
    /// Entries keyed by path; later lines win over earlier ones.
    pub entries: HashMap<PrefixedPath, CacheEntry>,
    /// Number of lines skipped as malformed.
    pub malformed_lines: usize,
    /// Whether a leftover backup was promoted over the primary.
    pub recovered_from_backup: bool,
}

/// The on-disk index file and its single writer lock.
#[derive(Debug)]
pub struct IndexFile {
    path: PathBuf,
    writer: Mutex<()>,
}

impl IndexFile {
    /// Bind to an index file path. Nothing is read or created yet.
    #[must_use]
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            writer: Mutex::new(()),
        }
    }

    /// Primary file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Backup sibling path (`<primary>.bak`).
    #[must_use]
    pub fn backup_path(&self) -> PathBuf {
        self.sibling(".bak")
    }

    fn temp_path(&self) -> PathBuf {
        self.sibling(".tmp")
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(suffix);
        PathBuf::from(name)
    }

    /// Load every well-formed record, promoting a leftover backup first.
    ///
    /// # Errors
    ///
    /// Returns an error only if the primary exists but cannot be opened or the
    /// backup cannot be promoted. Malformed lines, including lines that are not
    /// valid UTF-8, are skipped with a warning.
    pub fn load(&self) -> Result<LoadOutcome, IndexError> {
        let _guard = self.lock();
        let mut outcome = LoadOutcome::default();

        let temp = self.temp_path();
        if temp.exists() {
            log::debug!("Removing unfinished index write {}", temp.display());
            if let Err(e) = fs::remove_file(&temp) {
                log::warn!("Failed to remove {}: {}", temp.display(), e);
            }
        }

        let backup = self.backup_path();
        if backup.is_file() {
            if self.backup_supersedes_primary(&backup) {
                log::warn!(
                    "Found index backup {} not older than the primary, promoting it",
                    backup.display()
                );
                fs::rename(&backup, &self.path).map_err(|source| IndexError::Io {
                    path: backup.clone(),
                    source,
                })?;
                outcome.recovered_from_backup = true;
            } else {
                log::warn!("Discarding stale index backup {}", backup.display());
                if let Err(e) = fs::remove_file(&backup) {
                    log::warn!("Failed to remove {}: {}", backup.display(), e);
                }
            }
        }

        if !self.path.exists() {
            log::debug!("No index at {}, starting empty", self.path.display());
            return Ok(outcome);
        }

        let file = File::open(&self.path).map_err(|source| IndexError::Io {
            path: self.path.clone(),
            source,
        })?;

        let mut reader = BufReader::new(file);
        let mut buffer = Vec::new();
        let mut number = 0usize;
        loop {
            buffer.clear();
            match reader.read_until(b'\n', &mut buffer) {
                Ok(0) => break,
                Ok(_) => number += 1,
                Err(e) => {
                    log::warn!(
                        "Stopped reading {} after line {}: {}",
                        self.path.display(),
                        number,
                        e
                    );
                    outcome.malformed_lines += 1;
                    break;
                }
            }

            let Ok(line) = std::str::from_utf8(&buffer) else {
                log::warn!("Skipping index line {}: not valid UTF-8", number);
                outcome.malformed_lines += 1;
                continue;
            };
            let line = line.trim_end_matches(['\n', '\r']);
            if line.trim().is_empty() {
                continue;
            }
            match parse_line(line) {
                Ok(entry) => {
                    outcome.entries.insert(entry.path.clone(), entry);
                }
                Err(e) => {
                    log::warn!("Skipping index line {}: {}", number, e);
                    outcome.malformed_lines += 1;
                }
            }
        }

        log::debug!(
            "Loaded {} index entries from {} ({} malformed)",
            outcome.entries.len(),
            self.path.display(),
            outcome.malformed_lines
        );
        Ok(outcome)
    }

    /// A backup wins unless the primary is strictly newer.
    fn backup_supersedes_primary(&self, backup: &Path) -> bool {
        if !self.path.is_file() {
            return true;
        }
        let modified = |path: &Path| fs::metadata(path).and_then(|m| m.modified()).ok();
        match (modified(backup), modified(&self.path)) {
            (Some(backup), Some(primary)) => backup >= primary,
            _ => false,
        }
    }

    /// Rewrite the whole index, sorted by path.
    ///
    /// # Errors
    ///
    /// Returns an error if the primary could not be replaced. In that case the
    /// new content is written to the backup file instead, so the next load
    /// promotes it.
    pub fn write_all<'a, I>(&self, entries: I) -> Result<(), IndexError>
    where
        I: IntoIterator<Item = &'a CacheEntry>,
    {
        let content = render(entries);
        let _guard = self.lock();
        self.replace(&content)
    }

    /// Rewrite the whole index from a snapshot taken while holding the writer
    /// lock, so no record appended concurrently can be lost by the rewrite.
    ///
    /// Returns the number of records written.
    ///
    /// # Errors
    ///
    /// Same as [`write_all`](Self::write_all).
    pub fn write_with<F>(&self, snapshot: F) -> Result<usize, IndexError>
    where
        F: FnOnce() -> Vec<CacheEntry>,
    {
        let _guard = self.lock();
        let entries = snapshot();
        self.replace(&render(entries.iter()))?;
        Ok(entries.len())
    }

    /// Callers hold the writer lock.
    fn replace(&self, content: &str) -> Result<(), IndexError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| IndexError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let temp = self.temp_path();
        let written = write_synced(&temp, content.as_bytes())
            .map_err(|source| (temp.clone(), source))
            .and_then(|()| {
                fs::rename(&temp, &self.path).map_err(|source| (self.path.clone(), source))
            });

        match written {
            Ok(()) => {
                let backup = self.backup_path();
                if backup.exists() {
                    if let Err(e) = fs::remove_file(&backup) {
                        log::warn!("Failed to remove index backup {}: {}", backup.display(), e);
                    }
                }
                Ok(())
            }
            Err((path, source)) => {
                log::warn!(
                    "Failed to write index {}: {}; saving to backup instead",
                    path.display(),
                    source
                );
                let _ = fs::remove_file(&temp);
                let backup = self.backup_path();
                if let Err(e) = write_synced(&backup, content.as_bytes()) {
                    log::error!("Failed to write index backup {}: {}", backup.display(), e);
                }
                Err(IndexError::Io { path, source })
            }
        }
    }

    /// Append a single record to the primary file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened for append or written.
    pub fn append(&self, entry: &CacheEntry) -> Result<(), IndexError> {
        let _guard = self.lock();
        let io_err = |source| IndexError::Io {
            path: self.path.clone(),
            source,
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        writeln!(file, "{}", encode_line(entry)).map_err(io_err)?;
        file.sync_data().map_err(io_err)
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn write_synced(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(content)?;
    file.sync_all()
}

fn render<'a, I>(entries: I) -> String
where
    I: IntoIterator<Item = &'a CacheEntry>,
{
    let mut lines: Vec<(String, String)> = entries
        .into_iter()
        .map(|entry| (entry.path.to_string(), encode_line(entry)))
        .collect();
    lines.sort_by(|a, b| a.0.cmp(&b.0));

    let mut content = String::with_capacity(lines.iter().map(|(_, l)| l.len() + 1).sum());
    for (_, line) in lines {
        content.push_str(&line);
        content.push('\n');
    }
    content
}

/// Encode one entry as a persisted line (without trailing newline).
#[must_use]
pub fn encode_line(entry: &CacheEntry) -> String {
    let mut line = format!(
        "{}{sep}{}{sep}{}",
        entry.hash,
        entry.path,
        entry.last_modified_ticks,
        sep = FIELD_SEPARATOR
    );
    let ambiguous_path = entry.path.to_string().contains(FIELD_SEPARATOR);
    if ambiguous_path || entry.size.is_some() || entry.compressed_size.is_some() {
        let size = entry.size.map(|s| s.to_string()).unwrap_or_default();
        let compressed = entry
            .compressed_size
            .map(|s| s.to_string())
            .unwrap_or_default();
        line.push(FIELD_SEPARATOR);
        line.push_str(&size);
        line.push(FIELD_SEPARATOR);
        line.push_str(&compressed);
    }
    line
}

/// Parse one persisted line.
///
/// # Errors
///
/// Returns [`IndexError::Malformed`] for a wrong field count, an empty or
/// non-hex hash, an unknown root prefix or unparsable numbers.
pub fn parse_line(line: &str) -> Result<CacheEntry, IndexError> {
    let malformed = |reason: &str| IndexError::Malformed {
        line: line.to_string(),
        reason: reason.to_string(),
    };

    let fields: Vec<&str> = line.trim_end_matches('\r').split(FIELD_SEPARATOR).collect();
    let n = fields.len();
    // Short form has exactly three fields. Anything longer is the long form,
    // whose path takes whatever lies between the hash and the last three.
    let (path_field, ticks_field, sizes) = match n {
        3 => (fields[1].to_string(), fields[2], None),
        n if n >= 5 => (
            fields[1..n - 3].join("|"),
            fields[n - 3],
            Some((fields[n - 2], fields[n - 1])),
        ),
        _ => return Err(malformed("expected 3 or 5 fields")),
    };

    let hash = fields[0].trim();
    if hash.is_empty() || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(malformed("hash is not hex"));
    }

    let path: PrefixedPath = path_field
        .parse()
        .map_err(|e: super::path::UnknownRootError| malformed(&e.to_string()))?;

    let ticks: i64 = ticks_field
        .trim()
        .parse()
        .map_err(|_| malformed("mtime is not an integer"))?;

    let mut entry = CacheEntry::new(hash, path, ticks);
    if let Some((size, compressed)) = sizes {
        entry.size = parse_optional_size(size).map_err(|_| malformed("bad size"))?;
        entry.compressed_size =
            parse_optional_size(compressed).map_err(|_| malformed("bad compressed size"))?;
    }
    Ok(entry)
}

fn parse_optional_size(field: &str) -> Result<Option<u64>, std::num::ParseIntError> {
    let field = field.trim();
    if field.is_empty() {
        Ok(None)
    } else {
        field.parse().map(Some)
    }
}
