use crate::config::EngineConfig;
use crate::core::duplicate::{
    cluster_fingerprints, group_exact_duplicates, ExactDuplicateGroup, NearDuplicateCluster,
};
use crate::core::embedding::{
    Candidate, EmbeddingBackend, SimilarityFilters, SimilarityMatch, SimilarityScorer,
};
use crate::core::perceptual::Fingerprint;
use crate::database::models::Asset;
use crate::database::predicate::{Field, Predicate};
use crate::database::{AssetStore, DatabaseError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Store error: {0}")]
    Store(#[from] DatabaseError),
}

/// Zero-based page over a fully ranked result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub index: usize,
    pub size: usize,
}

impl Page {
    pub fn new(index: usize, size: usize) -> Self {
        Self { index, size }
    }

    pub fn first(size: usize) -> Self {
        Self::new(0, size)
    }

    pub fn all() -> Self {
        Self::new(0, usize::MAX)
    }

    pub fn apply<T>(&self, items: Vec<T>) -> Vec<T> {
        items
            .into_iter()
            .skip(self.index.saturating_mul(self.size))
            .take(self.size)
            .collect()
    }
}

/// Read-only duplicate and similarity queries over the analyzed assets.
///
/// Store access is synchronous; async hosts call these from a blocking task.
pub struct QueryService {
    store: Arc<dyn AssetStore>,
    backend: Arc<dyn EmbeddingBackend>,
    config: EngineConfig,
}

impl QueryService {
    pub fn new(
        store: Arc<dyn AssetStore>,
        backend: Arc<dyn EmbeddingBackend>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            backend,
            config,
        }
    }

    pub fn find_exact_duplicate_groups(
        &self,
        page: Page,
    ) -> Result<Vec<ExactDuplicateGroup>, QueryError> {
        let assets = self
            .store
            .fetch(&Predicate::images().and(Predicate::NotNull(Field::ContentHash)), None)?;

        let groups = group_exact_duplicates(
            assets
                .into_iter()
                .filter_map(|a| a.content_hash.map(|hash| (a.identifier, hash))),
        );
        Ok(page.apply(groups))
    }

    /// Near-duplicate clusters using `max_distance`, or the configured threshold.
    pub fn find_near_duplicate_groups(
        &self,
        max_distance: Option<u32>,
        page: Page,
    ) -> Result<Vec<NearDuplicateCluster>, QueryError> {
        let threshold = max_distance.unwrap_or(self.config.near_duplicate_threshold);
        let assets = self.store.fetch(
            &Predicate::images().and(Predicate::NotNull(Field::PerceptualFingerprint)),
            None,
        )?;

        let entries: Vec<(String, Fingerprint)> = assets
            .into_iter()
            .filter_map(|asset| {
                let raw = asset.perceptual_fingerprint?;
                match Fingerprint::from_hex(&raw) {
                    Ok(fingerprint) => Some((asset.identifier, fingerprint)),
                    Err(e) => {
                        log::warn!("Ignoring fingerprint of {}: {}", asset.identifier, e);
                        None
                    }
                }
            })
            .collect();

        let clusters = cluster_fingerprints(&entries, threshold);
        log::debug!(
            "{} near-duplicate clusters from {} fingerprints at threshold {}",
            clusters.len(),
            entries.len(),
            threshold
        );
        Ok(page.apply(clusters))
    }

    /// Assets most visually similar to `seed`, best first.
    ///
    /// Returns an empty list when the seed is unknown or has no current embedding.
    pub fn find_similar_assets(
        &self,
        seed: &str,
        top_k: Option<usize>,
        filters: &SimilarityFilters,
        page: Page,
    ) -> Result<Vec<SimilarityMatch>, QueryError> {
        let revision = self.backend.revision().to_string();
        let Some(seed_asset) = self.store.find(seed)? else {
            log::debug!("Similarity seed {} not found", seed);
            return Ok(Vec::new());
        };
        let Some(query) = self.current_embedding(&seed_asset, &revision) else {
            return Ok(Vec::new());
        };

        let candidates: Vec<Candidate> = self
            .store
            .fetch(
                &Predicate::images()
                    .and(Predicate::NotNull(Field::Embedding))
                    .and(Predicate::eq(Field::EmbeddingVersion, revision.as_str())),
                None,
            )?
            .into_iter()
            .filter_map(|asset| {
                Some(Candidate {
                    blob: asset.embedding?,
                    identifier: asset.identifier,
                    created_at: asset.created_at,
                    width: asset.width,
                    height: asset.height,
                })
            })
            .collect();

        let filters = self.effective_filters(filters);
        let top_k = top_k.unwrap_or(self.config.similarity_top_k);
        let matches = SimilarityScorer::new(self.backend.as_ref()).rank(
            seed,
            &query,
            &candidates,
            &filters,
            top_k,
        );
        Ok(page.apply(matches))
    }

    fn current_embedding(
        &self,
        asset: &Asset,
        revision: &str,
    ) -> Option<crate::core::embedding::Embedding> {
        if asset.embedding_version.as_deref() != Some(revision) {
            log::debug!("Similarity seed {} has no current embedding", asset.identifier);
            return None;
        }
        let blob = asset.embedding.as_ref()?;
        match self.backend.deserialize(blob) {
            Ok(embedding) => Some(embedding),
            Err(e) => {
                log::warn!("Unreadable embedding for seed {}: {}", asset.identifier, e);
                None
            }
        }
    }

    // Configured defaults apply where the caller left a filter unset
    fn effective_filters(&self, filters: &SimilarityFilters) -> SimilarityFilters {
        let mut effective = filters.clone();
        if !self.config.date_range_filter {
            effective.created_after = None;
            effective.created_before = None;
        }
        if effective.min_longest_edge.is_none() {
            effective.min_longest_edge = self.config.min_longest_edge;
        }
        effective
    }
}
