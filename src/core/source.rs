use crate::config::{EngineConfig, RetryPolicy};
use crate::core::exif::ExifService;
use crate::core::image::BitmapNormalizer;
use crate::database::models::{MediaType, NewAsset};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use image::DynamicImage;
use std::fs::File;
use std::future::Future;
use std::io::{BufReader, ErrorKind, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error, Clone)]
pub enum SourceError {
    #[error("Asset unavailable: {identifier}")]
    AssetUnavailable { identifier: String },

    #[error("Transfer failed for {identifier}: {message}")]
    Transfer { identifier: String, message: String },

    #[error("Could not decode {identifier}: {message}")]
    Decode { identifier: String, message: String },
}

impl SourceError {
    /// Permanent errors will not go away by retrying.
    pub fn is_permanent(&self) -> bool {
        !matches!(self, SourceError::Transfer { .. })
    }
}

/// Supplies original bytes and normalized bitmaps for assets.
#[async_trait]
pub trait ImageSource: Send + Sync {
    /// Canonical original byte stream, full resolution over any derived rendition.
    async fn open_original(&self, identifier: &str)
        -> Result<Box<dyn Read + Send>, SourceError>;

    /// Orientation-corrected bitmap of `target_size` x `target_size` pixels.
    async fn fetch_normalized_bitmap(
        &self,
        identifier: &str,
        target_size: u32,
    ) -> Result<DynamicImage, SourceError>;
}

/// Sleep for `duration`, waking early if `cancelled` is set. Returns false when cancelled.
pub async fn sleep_unless_cancelled(duration: Duration, cancelled: &AtomicBool) -> bool {
    const SLICE: Duration = Duration::from_millis(25);

    let mut remaining = duration;
    while !remaining.is_zero() {
        if cancelled.load(Ordering::Relaxed) {
            return false;
        }
        let step = remaining.min(SLICE);
        tokio::time::sleep(step).await;
        remaining -= step;
    }
    !cancelled.load(Ordering::Relaxed)
}

/// Run `operation` until it succeeds, fails permanently, runs out of attempts or
/// the cancellation flag is raised.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: RetryPolicy,
    cancelled: &AtomicBool,
    label: &str,
    mut operation: F,
) -> Result<T, SourceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SourceError>>,
{
    let mut attempt = 1u32;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_permanent() && attempt < policy.max_attempts => {
                let backoff = policy.delay_for(attempt);
                log::warn!(
                    "{} attempt {} failed ({}), retrying in {:?}",
                    label,
                    attempt,
                    e,
                    backoff
                );
                if !sleep_unless_cancelled(backoff, cancelled).await {
                    return Err(e);
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Serves a directory tree. Identifiers are `/`-separated paths relative to the root.
#[derive(Clone)]
pub struct FsImageSource {
    root: PathBuf,
    retry: RetryPolicy,
    cancellation_token: Arc<AtomicBool>,
    normalizer: BitmapNormalizer,
    exif_service: ExifService,
}

impl FsImageSource {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: root.into(),
            retry: RetryPolicy::default(),
            cancellation_token: Arc::new(AtomicBool::new(false)),
            normalizer: BitmapNormalizer::new(),
            exif_service: ExifService::new(),
        }
    }

    /// Source wired to an engine: transfer retries follow `config` and stop as soon
    /// as `token` is raised. Pass the indexer's token here.
    pub fn for_engine<P: Into<PathBuf>>(
        root: P,
        config: &EngineConfig,
        token: Arc<AtomicBool>,
    ) -> Self {
        Self::new(root)
            .with_retry_policy(config.transfer_retry())
            .with_cancellation_token(token)
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Share a cancellation flag so retry sleeps end when a run is cancelled.
    pub fn with_cancellation_token(mut self, token: Arc<AtomicBool>) -> Self {
        self.cancellation_token = token;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve an identifier, refusing anything that escapes the root.
    pub fn resolve(&self, identifier: &str) -> Result<PathBuf, SourceError> {
        let relative = Path::new(identifier);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if identifier.is_empty() || escapes {
            return Err(SourceError::AssetUnavailable {
                identifier: identifier.to_string(),
            });
        }
        Ok(self.root.join(relative))
    }

    /// Walk the root and describe every file as an asset for the store.
    pub fn discover(&self) -> Result<Vec<NewAsset>, SourceError> {
        if !self.root.is_dir() {
            return Err(SourceError::AssetUnavailable {
                identifier: self.root.to_string_lossy().to_string(),
            });
        }

        let mut assets = Vec::new();
        for entry in WalkDir::new(&self.root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(identifier) = self.identifier_for(path) else {
                continue;
            };
            let media_type = MediaType::from_path(path);
            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    log::warn!("Skipping {}: {}", path.display(), e);
                    continue;
                }
            };
            let modified_at: DateTime<Utc> = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());

            let (width, height, created_at) = if media_type == MediaType::Image {
                let dimensions = image::image_dimensions(path).ok();
                let taken_at = self.exif_service.capture_date(path);
                (
                    dimensions.map(|d| d.0),
                    dimensions.map(|d| d.1),
                    taken_at.or(Some(modified_at)),
                )
            } else {
                (None, None, Some(modified_at))
            };

            assets.push(NewAsset {
                identifier,
                media_type,
                modified_at,
                created_at,
                width,
                height,
            });
        }

        Ok(assets)
    }

    fn identifier_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("/"))
        }
    }

    fn io_error(identifier: &str, e: std::io::Error) -> SourceError {
        match e.kind() {
            ErrorKind::NotFound | ErrorKind::PermissionDenied => SourceError::AssetUnavailable {
                identifier: identifier.to_string(),
            },
            _ => SourceError::Transfer {
                identifier: identifier.to_string(),
                message: e.to_string(),
            },
        }
    }

    fn load_bitmap(&self, identifier: &str, target_size: u32) -> Result<DynamicImage, SourceError> {
        let path = self.resolve(identifier)?;
        let bytes = std::fs::read(&path).map_err(|e| Self::io_error(identifier, e))?;
        let decoded = image::load_from_memory(&bytes).map_err(|e| SourceError::Decode {
            identifier: identifier.to_string(),
            message: e.to_string(),
        })?;
        let orientation = self.exif_service.orientation_from_bytes(&bytes);
        Ok(self.normalizer.normalize(decoded, orientation, target_size))
    }
}

#[async_trait]
impl ImageSource for FsImageSource {
    async fn open_original(
        &self,
        identifier: &str,
    ) -> Result<Box<dyn Read + Send>, SourceError> {
        let path = self.resolve(identifier)?;
        let label = format!("open {}", identifier);
        retry_with_backoff(self.retry, &self.cancellation_token, &label, || {
            let path = path.clone();
            async move {
                let file = File::open(&path).map_err(|e| Self::io_error(identifier, e))?;
                Ok(Box::new(BufReader::new(file)) as Box<dyn Read + Send>)
            }
        })
        .await
    }

    async fn fetch_normalized_bitmap(
        &self,
        identifier: &str,
        target_size: u32,
    ) -> Result<DynamicImage, SourceError> {
        let label = format!("bitmap {}", identifier);
        retry_with_backoff(self.retry, &self.cancellation_token, &label, || {
            let source = self.clone();
            let identifier = identifier.to_string();
            async move {
                let id = identifier.clone();
                tokio::task::spawn_blocking(move || source.load_bitmap(&id, target_size))
                    .await
                    .map_err(|e| SourceError::Transfer {
                        identifier,
                        message: e.to_string(),
                    })?
            }
        })
        .await
    }
}
