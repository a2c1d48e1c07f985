use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

// Asset record: source-owned fields first, then the analysis fields this engine writes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub identifier: String,
    pub media_type: MediaType,
    pub modified_at: DateTime<Utc>,
    pub created_at: Option<DateTime<Utc>>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Stable addition-order key
    pub added_order: i64,
    pub content_hash: Option<String>,
    pub perceptual_fingerprint: Option<String>, // 16 hex chars
    pub embedding: Option<Vec<u8>>,
    pub embedding_version: Option<String>,
    pub analysis_updated_at: Option<DateTime<Utc>>,
    pub analysis_status: AnalysisStatus,
    pub analysis_attempt_count: u32,
    pub analysis_next_retry_at: Option<DateTime<Utc>>,
    pub analysis_error_message: Option<String>,
}

/// Source-owned fields of an asset as observed in the collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAsset {
    pub identifier: String,
    pub media_type: MediaType,
    pub modified_at: DateTime<Utc>,
    pub created_at: Option<DateTime<Utc>>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl NewAsset {
    pub fn image(identifier: impl Into<String>, modified_at: DateTime<Utc>) -> Self {
        Self {
            identifier: identifier.into(),
            media_type: MediaType::Image,
            modified_at,
            created_at: Some(modified_at),
            width: None,
            height: None,
        }
    }
}

/// Result of one analysis attempt. `None` derived fields leave the stored value untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetUpdate {
    pub identifier: String,
    /// `modified_at` the attempt observed; the write is dropped if the asset changed since
    pub source_modified_at: DateTime<Utc>,
    pub content_hash: Option<String>,
    pub perceptual_fingerprint: Option<String>,
    pub embedding: Option<Vec<u8>>,
    pub embedding_version: Option<String>,
    pub analysis_status: AnalysisStatus,
    pub analysis_attempt_count: u32,
    pub analysis_next_retry_at: Option<DateTime<Utc>>,
    pub analysis_error_message: Option<String>,
    pub analysis_updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaType {
    Image,
    Video,
    Audio,
    Other,
}

impl MediaType {
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        match ext.as_str() {
            "jpg" | "jpeg" | "png" | "gif" | "bmp" | "tiff" | "tif" | "webp" | "heic" | "heif"
            | "avif" | "dng" | "cr2" | "cr3" | "nef" | "arw" | "raf" => MediaType::Image,
            "mp4" | "mov" | "m4v" | "avi" | "mkv" | "3gp" | "webm" => MediaType::Video,
            "mp3" | "m4a" | "aac" | "wav" | "flac" | "ogg" => MediaType::Audio,
            _ => MediaType::Other,
        }
    }
}

impl From<String> for MediaType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "image" => MediaType::Image,
            "video" => MediaType::Video,
            "audio" => MediaType::Audio,
            _ => MediaType::Other,
        }
    }
}

impl From<MediaType> for String {
    fn from(media_type: MediaType) -> Self {
        match media_type {
            MediaType::Image => "image".to_string(),
            MediaType::Video => "video".to_string(),
            MediaType::Audio => "audio".to_string(),
            MediaType::Other => "other".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnalysisStatus {
    Pending,
    Success,
    Failed,
}

impl From<String> for AnalysisStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "success" => AnalysisStatus::Success,
            "failed" => AnalysisStatus::Failed,
            _ => AnalysisStatus::Pending,
        }
    }
}

impl From<AnalysisStatus> for String {
    fn from(status: AnalysisStatus) -> Self {
        match status {
            AnalysisStatus::Pending => "pending".to_string(),
            AnalysisStatus::Success => "success".to_string(),
            AnalysisStatus::Failed => "failed".to_string(),
        }
    }
}

pub(crate) fn to_millis(timestamp: DateTime<Utc>) -> i64 {
    timestamp.timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}
