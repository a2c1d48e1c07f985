use crate::core::source::{ImageSource, SourceError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Read;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("IO error while hashing: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("Hash task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl HashError {
    pub fn is_permanent(&self) -> bool {
        match self {
            HashError::Source(e) => e.is_permanent(),
            _ => false,
        }
    }
}

/// Lowercase hex SHA-256 digest of an asset's original bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl ContentHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Computes content hashes used for exact duplicate detection
pub struct ContentHasher;

impl ContentHasher {
    pub fn new() -> Self {
        Self
    }

    /// Stream a reader through SHA-256 without holding the whole file in memory
    pub fn hash_reader<R: Read>(&self, mut reader: R) -> Result<ContentHash, HashError> {
        let mut hasher = Sha256::new();
        let mut buffer = [0; 8192];

        loop {
            let bytes_read = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(HashError::Io(e)),
            };
            hasher.update(&buffer[..bytes_read]);
        }

        Ok(ContentHash(format!("{:x}", hasher.finalize())))
    }

    pub fn hash_bytes(&self, bytes: &[u8]) -> ContentHash {
        ContentHash(format!("{:x}", Sha256::digest(bytes)))
    }

    /// Hash the canonical original bytes of an asset.
    ///
    /// Read failures after the stream was opened are reported as transfer errors,
    /// so the caller treats them as retryable.
    pub async fn hash_asset(
        &self,
        source: &dyn ImageSource,
        identifier: &str,
    ) -> Result<ContentHash, HashError> {
        let reader = source.open_original(identifier).await?;
        let identifier = identifier.to_string();

        let result = tokio::task::spawn_blocking(move || ContentHasher.hash_reader(reader)).await?;
        result.map_err(|e| match e {
            HashError::Io(io) => HashError::Source(SourceError::Transfer {
                identifier,
                message: io.to_string(),
            }),
            other => other,
        })
    }
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}
