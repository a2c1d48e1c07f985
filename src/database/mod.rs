pub mod connection;
pub mod models;
pub mod predicate;
pub mod repositories;

use models::{Asset, AssetUpdate, NewAsset};
use predicate::Predicate;
use thiserror::Error;

pub use repositories::AssetRepository;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database query error: {0}")]
    Query(#[from] rusqlite::Error),

    #[error("Database connection error: {0}")]
    Connection(String),

    #[error("Database task failed: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for DatabaseError {
    fn from(e: tokio::task::JoinError) -> Self {
        DatabaseError::Task(e.to_string())
    }
}

/// Queryable, transactionally-updatable table of assets.
///
/// Results are always ordered by `added_order`. Each call observes committed data
/// only; `upsert_batch` applies all updates or none.
pub trait AssetStore: Send + Sync {
    /// Insert unseen assets and refresh the source-owned fields of known ones.
    fn register_assets(&self, assets: &[NewAsset]) -> Result<usize, DatabaseError>;

    fn fetch(&self, predicate: &Predicate, limit: Option<usize>)
        -> Result<Vec<Asset>, DatabaseError>;

    fn fetch_identifiers(
        &self,
        predicate: &Predicate,
        limit: Option<usize>,
    ) -> Result<Vec<String>, DatabaseError>;

    fn count(&self, predicate: &Predicate) -> Result<usize, DatabaseError>;

    /// Write analysis results in one transaction. Unknown identifiers are skipped.
    fn upsert_batch(&self, updates: &[AssetUpdate]) -> Result<usize, DatabaseError>;

    /// Clear derived fields and retry state back to `Pending`.
    fn reset_analysis(&self, predicate: &Predicate) -> Result<usize, DatabaseError>;

    fn remove(&self, identifiers: &[String]) -> Result<usize, DatabaseError>;

    fn fetch_by_ids(&self, identifiers: &[String]) -> Result<Vec<Asset>, DatabaseError> {
        if identifiers.is_empty() {
            return Ok(Vec::new());
        }
        self.fetch(&Predicate::ids(identifiers.iter().cloned()), None)
    }

    fn find(&self, identifier: &str) -> Result<Option<Asset>, DatabaseError> {
        Ok(self
            .fetch(&Predicate::ids([identifier]), Some(1))?
            .into_iter()
            .next())
    }
}
