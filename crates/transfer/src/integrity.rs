//! Whole-file SHA-256 digests.

use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::TransferError;

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Computes SHA-256 of an entire file on a blocking worker.
pub async fn calculate_file_checksum(path: &Path) -> Result<String, TransferError> {
    let path: PathBuf = path.to_path_buf();
    tokio::task::spawn_blocking(move || checksum_file_blocking(&path))
        .await
        .map_err(|e| TransferError::Io(std::io::Error::other(e)))?
}

fn checksum_file_blocking(path: &Path) -> Result<String, TransferError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Incremental digest fed as chunks are reassembled.
#[derive(Default)]
pub struct Verifier {
    hasher: Sha256,
    len: u64,
}

impl Verifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.len += data.len() as u64;
    }

    /// Bytes hashed so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Hex digest of everything fed in.
    pub fn finalize(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

/// Compares two hex digests, ignoring case. Empty digests never match.
pub fn verify_hash(expected: &str, actual: &str) -> bool {
    !expected.is_empty() && !actual.is_empty() && expected.eq_ignore_ascii_case(actual)
}
