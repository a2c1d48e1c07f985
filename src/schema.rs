// SQLite layout of the asset table. Timestamps are unix milliseconds.

use crate::database::predicate::Field;

pub const CREATE_ASSETS: &str = "CREATE TABLE IF NOT EXISTS assets (
    added_order INTEGER PRIMARY KEY AUTOINCREMENT,
    identifier TEXT NOT NULL UNIQUE,
    media_type TEXT NOT NULL,
    modified_at INTEGER NOT NULL,
    created_at INTEGER,
    width INTEGER,
    height INTEGER,
    content_hash TEXT,
    perceptual_fingerprint TEXT,
    embedding BLOB,
    embedding_version TEXT,
    analysis_updated_at INTEGER,
    analysis_status TEXT NOT NULL DEFAULT 'pending',
    analysis_attempt_count INTEGER NOT NULL DEFAULT 0,
    analysis_next_retry_at INTEGER,
    analysis_error_message TEXT
);

CREATE INDEX IF NOT EXISTS idx_assets_content_hash ON assets(content_hash);
CREATE INDEX IF NOT EXISTS idx_assets_status ON assets(analysis_status, analysis_next_retry_at);";

/// Column order used by every SELECT that materializes an `Asset`
pub const ASSET_COLUMNS: &str = "identifier, media_type, modified_at, created_at, width, height, \
    added_order, content_hash, perceptual_fingerprint, embedding, embedding_version, \
    analysis_updated_at, analysis_status, analysis_attempt_count, analysis_next_retry_at, \
    analysis_error_message";

pub fn column(field: Field) -> &'static str {
    match field {
        Field::Identifier => "identifier",
        Field::MediaType => "media_type",
        Field::ModifiedAt => "modified_at",
        Field::CreatedAt => "created_at",
        Field::AddedOrder => "added_order",
        Field::Width => "width",
        Field::Height => "height",
        Field::ContentHash => "content_hash",
        Field::PerceptualFingerprint => "perceptual_fingerprint",
        Field::Embedding => "embedding",
        Field::EmbeddingVersion => "embedding_version",
        Field::AnalysisUpdatedAt => "analysis_updated_at",
        Field::AnalysisStatus => "analysis_status",
        Field::AnalysisAttemptCount => "analysis_attempt_count",
        Field::AnalysisNextRetryAt => "analysis_next_retry_at",
        Field::AnalysisErrorMessage => "analysis_error_message",
    }
}
