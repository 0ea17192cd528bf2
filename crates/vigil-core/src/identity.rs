//! Content identity: streaming SHA-256 and MD5, and the cache key.
//!
//! Both digests are computed in a single pass over the file so a scan never
//! reads the same bytes twice. Hex output is lowercase everywhere; callers
//! comparing hashes are expected to lowercase their inputs.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use md5::Context as Md5Context;
use sha2::{Digest, Sha256};

use crate::error::{Result, VigilError};

const READ_BUF_SIZE: usize = 64 * 1024;

/// SHA-256 and MD5 of one file's contents, lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHashes {
    /// SHA-256 digest.
    pub sha256: String,
    /// MD5 digest, kept for signature-database compatibility.
    pub md5: String,
}

/// Hashes a file in one streaming pass.
///
/// # Errors
///
/// Returns [`VigilError::Io`] if the file cannot be opened or read.
pub fn hash_file(path: impl AsRef<Path>) -> Result<FileHashes> {
    let path = path.as_ref();
    let mut file = File::open(path).map_err(|e| VigilError::io(path, e))?;

    let mut sha = Sha256::new();
    let mut md5 = Md5Context::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];

    loop {
        let n = file.read(&mut buf).map_err(|e| VigilError::io(path, e))?;
        if n == 0 {
            break;
        }
        sha.update(&buf[..n]);
        md5.consume(&buf[..n]);
    }

    Ok(FileHashes {
        sha256: hex::encode(sha.finalize()),
        md5: hex::encode(md5.compute().0),
    })
}

/// Hashes an in-memory buffer.
#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> FileHashes {
    FileHashes {
        sha256: hex::encode(Sha256::digest(bytes)),
        md5: hex::encode(md5::compute(bytes).0),
    }
}

/// SHA-256 of a buffer, lowercase hex.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Cache key over content identity: `{sha256}:{size}:{mtime_ticks}`.
///
/// Any differing field is a cache miss, so touching a file's mtime forces a
/// full re-scan even when contents are unchanged.
#[must_use]
pub fn cache_key(sha256: &str, size: u64, mtime_ticks: i64) -> String {
    format!("{sha256}:{size}:{mtime_ticks}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // Published digests of the empty input.
    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
    const EMPTY_MD5: &str = "d41d8cd98f00b204e9800998ecf8427e";

    #[test]
    fn test_hash_empty_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty");
        std::fs::write(&path, b"").unwrap();

        let hashes = hash_file(&path).unwrap();
        assert_eq!(hashes.sha256, EMPTY_SHA256);
        assert_eq!(hashes.md5, EMPTY_MD5);
    }

    #[test]
    fn test_hash_bytes_matches_hash_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        let contents = b"vigil content identity";
        std::fs::write(&path, contents).unwrap();

        assert_eq!(hash_file(&path).unwrap(), hash_bytes(contents));
    }

    #[test]
    fn test_hash_spans_buffer_boundary() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.bin");
        let contents = vec![0xabu8; READ_BUF_SIZE * 2 + 17];
        std::fs::write(&path, &contents).unwrap();

        assert_eq!(hash_file(&path).unwrap(), hash_bytes(&contents));
    }

    #[test]
    fn test_cache_key_shape() {
        let key = cache_key("deadbeef", 42, 1_700_000_000_000_000_000);
        assert_eq!(key, "deadbeef:42:1700000000000000000");
    }

    #[test]
    fn test_missing_file_errors() {
        assert!(hash_file("/no/such/file").is_err());
    }
}
