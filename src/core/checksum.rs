/*!
 * Streaming SHA-512 checksums for end-to-end integrity
 */

use crate::error::Result;
use sha2::{Digest, Sha512};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Incremental SHA-512 over plaintext as it streams through the engine
#[derive(Clone)]
pub struct StreamingHasher {
    hasher: Sha512,
    bytes: u64,
}

impl StreamingHasher {
    pub fn new() -> Self {
        Self {
            hasher: Sha512::new(),
            bytes: 0,
        }
    }

    /// Feed the next slice of plaintext
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes += data.len() as u64;
    }

    /// Bytes hashed so far
    pub fn bytes_hashed(&self) -> u64 {
        self.bytes
    }

    /// Finish and return the lowercase hex digest
    pub fn finalize_hex(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl Default for StreamingHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// SHA-512 of a whole file, hex encoded
pub fn checksum_file(path: &Path) -> Result<String> {
    let mut file = BufReader::new(File::open(path)?);
    let mut hasher = StreamingHasher::new();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finalize_hex())
}

/// Compare two hex digests case-insensitively
pub fn checksums_match(expected: &str, actual: &str) -> bool {
    expected.eq_ignore_ascii_case(actual)
}
