pub mod duplicate;
pub mod embedding;
pub mod exif;
pub mod hash;
pub mod image;
pub mod perceptual;
pub mod source;

use thiserror::Error;

/// Why a single asset could not be analyzed.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error(transparent)]
    Hash(#[from] hash::HashError),

    #[error(transparent)]
    Source(#[from] source::SourceError),

    #[error(transparent)]
    Fingerprint(#[from] perceptual::FingerprintError),

    #[error(transparent)]
    Embedding(#[from] embedding::EmbeddingError),

    #[error("Analysis task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Analysis cancelled")]
    Cancelled,
}

impl AnalysisError {
    /// Permanent failures skip the remaining retry budget.
    pub fn is_permanent(&self) -> bool {
        match self {
            AnalysisError::Hash(e) => e.is_permanent(),
            AnalysisError::Source(e) => e.is_permanent(),
            AnalysisError::Fingerprint(_) | AnalysisError::Embedding(_) => false,
            AnalysisError::Task(_) | AnalysisError::Cancelled => false,
        }
    }
}
