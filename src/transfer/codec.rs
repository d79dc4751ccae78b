//! Payload compression.
//!
//! Uploads are compressed in memory before sending; downloads are
//! decompressed file-to-file so large assets never sit in memory twice.
//! Both directions block and run under `spawn_blocking`.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;

/// zstd level used for uploads.
pub const COMPRESSION_LEVEL: i32 = 3;

/// Compress a file's content.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn compress_file(path: &Path) -> io::Result<Vec<u8>> {
    let reader = BufReader::new(File::open(path)?);
    zstd::encode_all(reader, COMPRESSION_LEVEL)
}

/// Compress a byte slice.
///
/// # Errors
///
/// Returns an error if the encoder fails.
pub fn compress(data: &[u8]) -> io::Result<Vec<u8>> {
    zstd::encode_all(data, COMPRESSION_LEVEL)
}

/// Decompress `src` into a new file at `dst`. Returns the decompressed size.
///
/// # Errors
///
/// Returns an error on corrupt input or I/O failure; a partly written `dst`
/// is removed.
pub fn decompress_file(src: &Path, dst: &Path) -> io::Result<u64> {
    let result = (|| {
        let reader = BufReader::new(File::open(src)?);
        let mut writer = BufWriter::new(File::create(dst)?);
        zstd::stream::copy_decode(reader, &mut writer)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(std::fs::metadata(dst)?.len())
    })();
    if result.is_err() {
        let _ = std::fs::remove_file(dst);
    }
    result
}
