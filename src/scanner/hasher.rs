//! BLAKE3 file hasher with streaming support.
//!
//! # Overview
//! [`Hasher`] computes lowercase hex BLAKE3 digests of file contents. Small
//! files are streamed through a buffered reader; large files are memory-mapped
//! and hashed across the rayon pool the caller is running on.
//!
//! The hasher counts how many files it has digested, which the scanner reports
//! in its summary and tests use to check that no file is hashed twice.

use std::fs::File;
use std::io::{BufReader, ErrorKind};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use super::HashError;

/// Length of a hex-encoded content hash.
pub const HASH_HEX_LEN: usize = 64;

/// Files at or above this size are memory-mapped instead of streamed.
const MMAP_THRESHOLD: u64 = 16 * 1024 * 1024;

/// Streaming BLAKE3 content hasher.
#[derive(Debug, Default)]
pub struct Hasher {
    files_hashed: AtomicU64,
    bytes_hashed: AtomicU64,
}

impl Hasher {
    /// Create a new hasher with zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hash a file's full content.
    ///
    /// # Errors
    ///
    /// - [`HashError::NotFound`] if the file is missing
    /// - [`HashError::PermissionDenied`] if it cannot be read
    /// - [`HashError::Io`] for any other read failure
    pub fn hash_file(&self, path: &Path) -> Result<String, HashError> {
        let map_err = |e: std::io::Error| match e.kind() {
            ErrorKind::NotFound => HashError::NotFound(path.to_path_buf()),
            ErrorKind::PermissionDenied => HashError::PermissionDenied(path.to_path_buf()),
            _ => HashError::Io {
                path: path.to_path_buf(),
                source: e,
            },
        };

        let file = File::open(path).map_err(map_err)?;
        let len = file.metadata().map_err(map_err)?.len();

        let mut hasher = blake3::Hasher::new();
        if len >= MMAP_THRESHOLD {
            hasher.update_mmap_rayon(path).map_err(map_err)?;
        } else {
            hasher
                .update_reader(BufReader::new(file))
                .map_err(map_err)?;
        }

        self.files_hashed.fetch_add(1, Ordering::Relaxed);
        self.bytes_hashed.fetch_add(len, Ordering::Relaxed);
        log::trace!("Hashed {} ({} bytes)", path.display(), len);
        Ok(hasher.finalize().to_hex().to_string())
    }

    /// Hash an in-memory buffer. Not counted as a file.
    #[must_use]
    pub fn hash_bytes(data: &[u8]) -> String {
        blake3::hash(data).to_hex().to_string()
    }

    /// Number of files hashed so far.
    #[must_use]
    pub fn files_hashed(&self) -> u64 {
        self.files_hashed.load(Ordering::Relaxed)
    }

    /// Number of bytes hashed so far.
    #[must_use]
    pub fn bytes_hashed(&self) -> u64 {
        self.bytes_hashed.load(Ordering::Relaxed)
    }
}

/// Whether `s` has the shape of a content hash: [`HASH_HEX_LEN`] hex digits.
#[must_use]
pub fn is_hash_shaped(s: &str) -> bool {
    s.len() == HASH_HEX_LEN && s.bytes().all(|b| b.is_ascii_hexdigit())
}
