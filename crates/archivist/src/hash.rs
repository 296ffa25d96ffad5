//! Sha256Hex: a full SHA-256 digest rendered as 64 lowercase hex chars.
//!
//! Every payload and every chunk in the manifest is identified by one of
//! these. Hashing is always streamed; nothing here needs the whole payload
//! in memory.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Read block size used for every streamed hash and copy.
pub const READ_BLOCK_BYTES: usize = 64 * 1024;

/// A SHA-256 digest - 256 bits (32 bytes, 64 hex chars).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Sha256Hex(String);

/// Errors that can occur when parsing a digest string.
#[derive(Debug, Error)]
pub enum HashError {
    #[error("invalid sha256 length: expected 64 hex chars, got {0}")]
    InvalidLength(usize),

    #[error("invalid hex character in sha256")]
    InvalidHex,
}

impl Sha256Hex {
    /// Hash an in-memory buffer.
    pub fn from_data(data: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(data)))
    }

    /// Hash a file by streaming it in fixed-size blocks.
    pub fn from_file(path: &Path) -> io::Result<(Self, u64)> {
        let mut file = File::open(path)?;
        let mut hasher = StreamingHasher::new();
        let mut buf = vec![0u8; READ_BLOCK_BYTES];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let size = hasher.bytes();
        Ok((hasher.finish(), size))
    }

    /// Create from an existing hex string (validates format).
    pub fn from_str_checked(s: &str) -> Result<Self, HashError> {
        if s.len() != 64 {
            return Err(HashError::InvalidLength(s.len()));
        }
        if !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(HashError::InvalidHex);
        }
        Ok(Self(s.to_lowercase()))
    }

    /// First 16 hex chars, used as the chunk-name prefix.
    pub fn short(&self) -> &str {
        &self.0[..16]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Sha256Hex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Sha256Hex {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str_checked(s)
    }
}

impl TryFrom<String> for Sha256Hex {
    type Error = HashError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_str_checked(&value)
    }
}

impl From<Sha256Hex> for String {
    fn from(hash: Sha256Hex) -> Self {
        hash.0
    }
}

impl AsRef<str> for Sha256Hex {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Running SHA-256 that also counts the bytes it has seen.
#[derive(Debug, Clone, Default)]
pub struct StreamingHasher {
    inner: Sha256,
    bytes: u64,
}

impl StreamingHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
        self.bytes += data.len() as u64;
    }

    /// Bytes hashed so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn finish(self) -> Sha256Hex {
        Sha256Hex(hex::encode(self.inner.finalize()))
    }
}
