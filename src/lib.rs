//! Duplicate and visual-similarity engine for personal media collections.
//!
//! Exact duplicates are found by SHA-256 content hash, near duplicates by a
//! 64-bit difference hash, and "more like this" by embedding distance. The
//! [`Indexer`] keeps that analysis current in an [`AssetStore`]; the
//! [`QueryService`] answers questions over it.

pub mod config;
pub mod core;
pub mod database;
pub mod schema;
pub mod services;

#[cfg(test)]
pub(crate) mod testing;

pub use config::EngineConfig;
pub use crate::core::embedding::{EmbeddingBackend, HistogramEmbedder, SimilarityFilters};
pub use crate::core::source::{FsImageSource, ImageSource, SourceError};
pub use database::{AssetRepository, AssetStore, DatabaseError};
pub use services::{Indexer, Page, QueryService, RunOptions};
