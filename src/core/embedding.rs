use chrono::{DateTime, Utc};
use image::{imageops::FilterType, DynamicImage, GenericImageView};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("Embedding unavailable: {message}")]
    Unavailable { message: String },

    #[error("Invalid embedding data: {message}")]
    InvalidData { message: String },
}

/// Feature vector plus the extractor revision that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub vector: Vec<f32>,
    pub revision: String,
}

/// Pluggable feature extractor.
///
/// Stored blobs are opaque to the rest of the engine; only the backend that wrote
/// them knows how to read them back and compare them.
pub trait EmbeddingBackend: Send + Sync {
    /// Stored alongside each embedding; a change invalidates older embeddings.
    fn revision(&self) -> &str;

    fn extract(&self, bitmap: &DynamicImage) -> Result<Embedding, EmbeddingError>;

    fn serialize(&self, embedding: &Embedding) -> Vec<u8> {
        let mut out = Vec::with_capacity(embedding.vector.len() * 4);
        for v in &embedding.vector {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    fn deserialize(&self, data: &[u8]) -> Result<Embedding, EmbeddingError> {
        if data.is_empty() || data.len() % 4 != 0 {
            return Err(EmbeddingError::InvalidData {
                message: format!("blob of {} bytes is not a f32 vector", data.len()),
            });
        }
        let vector: Vec<f32> = data
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(EmbeddingError::InvalidData {
                message: "non-finite component".to_string(),
            });
        }
        Ok(Embedding {
            vector,
            revision: self.revision().to_string(),
        })
    }

    /// Cosine distance in `[0, 2]`.
    fn distance(&self, a: &Embedding, b: &Embedding) -> Result<f32, EmbeddingError> {
        cosine_distance(&a.vector, &b.vector)
    }
}

pub fn cosine_distance(a: &[f32], b: &[f32]) -> Result<f32, EmbeddingError> {
    if a.len() != b.len() {
        return Err(EmbeddingError::InvalidData {
            message: format!("dimension mismatch: {} vs {}", a.len(), b.len()),
        });
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return Err(EmbeddingError::InvalidData {
            message: "zero-length vector".to_string(),
        });
    }
    let cosine = dot / (norm_a.sqrt() * norm_b.sqrt());
    Ok((1.0 - cosine).clamp(0.0, 2.0))
}

pub fn normalize(vec: &mut [f32]) {
    let norm = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vec.iter_mut() {
            *v /= norm;
        }
    }
}

/// Colour histogram plus a coarse luminance layout.
///
/// 16 bins per RGB channel (48 values) followed by an 8x8 luminance grid (64 values),
/// L2-normalized.
#[derive(Debug, Clone, Default)]
pub struct HistogramEmbedder;

impl HistogramEmbedder {
    pub const REVISION: &'static str = "histogram-v1";
    pub const BINS: usize = 16;
    pub const GRID: u32 = 8;

    pub fn new() -> Self {
        Self
    }

    pub fn dimensions() -> usize {
        Self::BINS * 3 + (Self::GRID * Self::GRID) as usize
    }
}

impl EmbeddingBackend for HistogramEmbedder {
    fn revision(&self) -> &str {
        Self::REVISION
    }

    fn extract(&self, bitmap: &DynamicImage) -> Result<Embedding, EmbeddingError> {
        let (width, height) = bitmap.dimensions();
        if width == 0 || height == 0 {
            return Err(EmbeddingError::Unavailable {
                message: "empty bitmap".to_string(),
            });
        }

        let rgb = image::imageops::resize(&bitmap.to_rgb8(), 64, 64, FilterType::Triangle);
        let bins = Self::BINS;
        let mut hist = vec![0f32; bins * 3];
        for pixel in rgb.pixels() {
            let r = (pixel[0] as usize * bins) / 256;
            let g = (pixel[1] as usize * bins) / 256;
            let b = (pixel[2] as usize * bins) / 256;
            hist[r] += 1.0;
            hist[bins + g] += 1.0;
            hist[2 * bins + b] += 1.0;
        }
        normalize(&mut hist);

        let grid = image::imageops::resize(
            &bitmap.to_luma8(),
            Self::GRID,
            Self::GRID,
            FilterType::Triangle,
        );
        let mut layout: Vec<f32> = grid.pixels().map(|p| p.0[0] as f32 / 255.0 + 0.05).collect();
        normalize(&mut layout);

        let mut vector = hist;
        vector.extend(layout);
        normalize(&mut vector);

        Ok(Embedding {
            vector,
            revision: Self::REVISION.to_string(),
        })
    }
}

/// A stored embedding waiting to be ranked, with the attributes prefilters look at.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub identifier: String,
    pub blob: Vec<u8>,
    pub created_at: Option<DateTime<Utc>>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl Candidate {
    fn longest_edge(&self) -> Option<u32> {
        match (self.width, self.height) {
            (Some(w), Some(h)) => Some(w.max(h)),
            (Some(edge), None) | (None, Some(edge)) => Some(edge),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimilarityFilters {
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub min_longest_edge: Option<u32>,
}

impl SimilarityFilters {
    /// Candidates with unknown dates or sizes fail an active filter.
    pub fn accepts(&self, candidate: &Candidate) -> bool {
        if self.created_after.is_some() || self.created_before.is_some() {
            let Some(created) = candidate.created_at else {
                return false;
            };
            if self.created_after.is_some_and(|after| created < after) {
                return false;
            }
            if self.created_before.is_some_and(|before| created > before) {
                return false;
            }
        }
        if let Some(min_edge) = self.min_longest_edge {
            if candidate.longest_edge().map_or(true, |edge| edge < min_edge) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityMatch {
    pub identifier: String,
    pub distance: f32,
    /// `1 / (1 + distance)`
    pub score: f32,
}

pub struct SimilarityScorer<'a> {
    backend: &'a dyn EmbeddingBackend,
}

impl<'a> SimilarityScorer<'a> {
    pub fn new(backend: &'a dyn EmbeddingBackend) -> Self {
        Self { backend }
    }

    pub fn score(distance: f32) -> f32 {
        1.0 / (1.0 + distance)
    }

    /// Rank candidates against the query embedding and keep the best `top_k`.
    pub fn rank(
        &self,
        query_identifier: &str,
        query: &Embedding,
        candidates: &[Candidate],
        filters: &SimilarityFilters,
        top_k: usize,
    ) -> Vec<SimilarityMatch> {
        let mut matches: Vec<SimilarityMatch> = candidates
            .iter()
            .filter(|c| c.identifier != query_identifier)
            .filter(|c| filters.accepts(c))
            .filter_map(|c| {
                let embedding = match self.backend.deserialize(&c.blob) {
                    Ok(e) => e,
                    Err(e) => {
                        log::warn!("Skipping {}: {}", c.identifier, e);
                        return None;
                    }
                };
                match self.backend.distance(query, &embedding) {
                    Ok(distance) => Some(SimilarityMatch {
                        identifier: c.identifier.clone(),
                        distance,
                        score: Self::score(distance),
                    }),
                    Err(e) => {
                        log::warn!("Skipping {}: {}", c.identifier, e);
                        None
                    }
                }
            })
            .collect();

        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.identifier.cmp(&b.identifier))
        });
        matches.truncate(top_k);
        matches
    }
}
