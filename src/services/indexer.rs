use crate::config::EngineConfig;
use crate::core::embedding::EmbeddingBackend;
use crate::core::hash::ContentHasher;
use crate::core::perceptual::Fingerprint;
use crate::core::source::ImageSource;
use crate::core::AnalysisError;
use crate::database::models::{AnalysisStatus, Asset, AssetUpdate};
use crate::database::predicate::{Field, Predicate};
use crate::database::{AssetStore, DatabaseError};
use crate::services::query::{Page, QueryError, QueryService};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Store error: {0}")]
    Store(#[from] DatabaseError),

    #[error("Index task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Indexing cancelled")]
    Cancelled,

    #[error("An index run is already active")]
    AlreadyRunning,
}

impl From<QueryError> for IndexError {
    fn from(e: QueryError) -> Self {
        match e {
            QueryError::Store(e) => IndexError::Store(e),
        }
    }
}

/// Source of "now" for retry scheduling and analysis timestamps.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Cancel and await an active run instead of leaving it alone
    pub restart: bool,
    /// Reset analysis of every image before selecting candidates
    pub full_reindex: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexProgress {
    pub processed: usize,
    pub total: usize,
    pub hashed: usize,
    pub fingerprinted: usize,
    pub embedded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSummary {
    pub run_id: Uuid,
    pub processed: usize,
    pub hashed: usize,
    pub fingerprinted: usize,
    pub embedded: usize,
    pub failed: usize,
    /// Failed this run, will be retried automatically
    pub failed_retryable: usize,
    /// Failed this run and reached the attempt cap
    pub failed_exhausted: usize,
    pub exact_duplicate_groups: usize,
    pub near_duplicate_groups: usize,
    /// Images with an embedding from the current extractor
    pub embedded_assets: usize,
    /// Failed images still waiting for a retry
    pub pending_retry: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IndexState {
    Idle,
    Indexing(IndexProgress),
    Completed(IndexSummary),
    Failed(String),
}

/// Image assets that still need (re)analysis.
pub fn candidate_predicate(
    embedding_version: &str,
    max_attempts: u32,
    now: DateTime<Utc>,
) -> Predicate {
    Predicate::images().and(Predicate::Or(vec![
        Predicate::eq(Field::AnalysisStatus, AnalysisStatus::Pending),
        Predicate::And(vec![
            Predicate::eq(Field::AnalysisStatus, AnalysisStatus::Failed),
            Predicate::lt(Field::AnalysisAttemptCount, max_attempts),
            Predicate::Or(vec![
                Predicate::IsNull(Field::AnalysisNextRetryAt),
                Predicate::le(Field::AnalysisNextRetryAt, now),
            ]),
        ]),
        Predicate::And(vec![
            Predicate::eq(Field::AnalysisStatus, AnalysisStatus::Success),
            Predicate::Or(vec![
                Predicate::IsNull(Field::ContentHash),
                Predicate::IsNull(Field::PerceptualFingerprint),
                Predicate::IsNull(Field::Embedding),
                Predicate::IsNull(Field::AnalysisUpdatedAt),
                Predicate::FieldLt(Field::AnalysisUpdatedAt, Field::ModifiedAt),
                Predicate::ne(Field::EmbeddingVersion, embedding_version),
            ]),
        ]),
    ]))
}

/// Image assets whose stored analysis no longer describes them.
pub fn stale_predicate(embedding_version: &str) -> Predicate {
    Predicate::images().and(Predicate::Or(vec![
        Predicate::FieldLt(Field::AnalysisUpdatedAt, Field::ModifiedAt),
        Predicate::And(vec![
            Predicate::eq(Field::AnalysisStatus, AnalysisStatus::Success),
            Predicate::ne(Field::EmbeddingVersion, embedding_version),
        ]),
    ]))
}

#[derive(Default)]
struct AssetOutcome {
    content_hash: Option<String>,
    fingerprint: Option<Fingerprint>,
    embedding: Option<Vec<u8>>,
    error: Option<AnalysisError>,
}

#[derive(Default)]
struct RunCounters {
    progress: IndexProgress,
    failed_retryable: usize,
    failed_exhausted: usize,
}

/// Incremental analysis of the asset store: hash, fingerprint and embed every
/// image that needs it, batch by batch, with retry bookkeeping for failures.
#[derive(Clone)]
pub struct Indexer {
    store: Arc<dyn AssetStore>,
    source: Arc<dyn ImageSource>,
    backend: Arc<dyn EmbeddingBackend>,
    config: EngineConfig,
    clock: Clock,
    progress_sender: Option<mpsc::UnboundedSender<IndexProgress>>,
    cancellation_token: Arc<AtomicBool>,
    state: Arc<RwLock<IndexState>>,
    active: Arc<Mutex<Option<JoinHandle<()>>>>,
    /// Held for the whole of every run, background or foreground
    run_lock: Arc<Mutex<()>>,
}

impl Indexer {
    pub fn new(
        store: Arc<dyn AssetStore>,
        source: Arc<dyn ImageSource>,
        backend: Arc<dyn EmbeddingBackend>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            source,
            backend,
            config,
            clock: Arc::new(Utc::now),
            progress_sender: None,
            cancellation_token: Arc::new(AtomicBool::new(false)),
            state: Arc::new(RwLock::new(IndexState::Idle)),
            active: Arc::new(Mutex::new(None)),
            run_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_progress_sender(mut self, sender: mpsc::UnboundedSender<IndexProgress>) -> Self {
        self.progress_sender = Some(sender);
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Share a cancellation token with other components, such as the image source,
    /// so that `cancel` also interrupts their retries.
    pub fn with_cancellation_token(mut self, token: Arc<AtomicBool>) -> Self {
        self.cancellation_token = token;
        self
    }

    pub fn get_cancellation_token(&self) -> Arc<AtomicBool> {
        self.cancellation_token.clone()
    }

    pub fn cancel(&self) {
        self.cancellation_token.store(true, Ordering::Relaxed);
    }

    pub async fn state(&self) -> IndexState {
        self.state.read().await.clone()
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.state.read().await, IndexState::Indexing(_))
    }

    /// Start a background run. Returns false if a run is already active and
    /// `restart` was not requested.
    pub async fn start(&self, options: RunOptions) -> bool {
        let mut active = self.active.lock().await;

        let Some(guard) = self.acquire_run(options.restart).await else {
            log::debug!("Index run already active, ignoring start");
            return false;
        };
        if let Some(handle) = active.take() {
            self.settle(handle).await;
        }

        self.cancellation_token.store(false, Ordering::Relaxed);
        self.set_state(IndexState::Indexing(IndexProgress::default()))
            .await;

        let indexer = self.clone();
        *active = Some(tokio::spawn(async move {
            // Outcome is recorded in the state
            let _ = indexer.execute(options, guard).await;
        }));
        true
    }

    /// Wait for the background run, if any, and return the resulting state.
    pub async fn wait(&self) -> IndexState {
        let mut active = self.active.lock().await;
        if let Some(handle) = active.take() {
            self.settle(handle).await;
        }
        drop(active);
        self.state().await
    }

    /// Run in the caller's task. Fails with `AlreadyRunning` while another run is
    /// active unless `restart` is set, in which case that run is cancelled first.
    pub async fn run(&self, options: RunOptions) -> Result<IndexSummary, IndexError> {
        let guard = self
            .acquire_run(options.restart)
            .await
            .ok_or(IndexError::AlreadyRunning)?;
        self.cancellation_token.store(false, Ordering::Relaxed);
        self.execute(options, guard).await
    }

    /// Reset stale analysis back to `Pending`. Returns the number of assets reset.
    pub async fn invalidate_stale(&self) -> Result<usize, IndexError> {
        let predicate = stale_predicate(self.backend.revision());
        let reset = self
            .with_store(move |store| store.reset_analysis(&predicate))
            .await?;
        if reset > 0 {
            log::info!("Invalidated analysis of {} assets", reset);
        }
        Ok(reset)
    }

    async fn acquire_run(&self, restart: bool) -> Option<OwnedMutexGuard<()>> {
        if let Ok(guard) = self.run_lock.clone().try_lock_owned() {
            return Some(guard);
        }
        if !restart {
            return None;
        }
        log::info!("Restarting active index run");
        self.cancel();
        Some(self.run_lock.clone().lock_owned().await)
    }

    async fn settle(&self, handle: JoinHandle<()>) {
        if let Err(e) = handle.await {
            log::error!("Index task failed: {}", e);
            self.set_state(IndexState::Failed(e.to_string())).await;
        }
    }

    async fn execute(
        &self,
        options: RunOptions,
        _guard: OwnedMutexGuard<()>,
    ) -> Result<IndexSummary, IndexError> {
        let run_id = Uuid::new_v4();
        log::info!("Starting index run {} ({:?})", run_id, options);
        self.set_state(IndexState::Indexing(IndexProgress::default()))
            .await;

        match self.index(run_id, options).await {
            Ok(summary) => {
                log::info!(
                    "Index run {} finished: {} processed, {} failed, {} exact groups, \
                     {} near groups in {}ms",
                    run_id,
                    summary.processed,
                    summary.failed,
                    summary.exact_duplicate_groups,
                    summary.near_duplicate_groups,
                    summary.duration_ms
                );
                self.set_state(IndexState::Completed(summary.clone())).await;
                Ok(summary)
            }
            Err(IndexError::Cancelled) => {
                log::info!("Index run {} cancelled", run_id);
                self.set_state(IndexState::Idle).await;
                Err(IndexError::Cancelled)
            }
            Err(e) => {
                log::error!("Index run {} failed: {}", run_id, e);
                self.set_state(IndexState::Failed(e.to_string())).await;
                Err(e)
            }
        }
    }

    async fn index(&self, run_id: Uuid, options: RunOptions) -> Result<IndexSummary, IndexError> {
        let started = Instant::now();
        let revision = self.backend.revision().to_string();

        if options.full_reindex {
            let reset = self
                .with_store(|store| store.reset_analysis(&Predicate::images()))
                .await?;
            log::info!("Full re-index requested, reset {} assets", reset);
        }
        self.invalidate_stale().await?;
        self.check_cancelled()?;

        let predicate = candidate_predicate(&revision, self.config.max_attempts, self.now());
        let candidates = self
            .with_store(move |store| store.fetch_identifiers(&predicate, None))
            .await?;
        self.check_cancelled()?;

        let mut counters = RunCounters::default();
        counters.progress.total = candidates.len();
        self.publish(&counters.progress).await;
        log::debug!("{} candidates for run {}", candidates.len(), run_id);

        for chunk in candidates.chunks(self.config.effective_batch_size()) {
            self.check_cancelled()?;

            let ids = chunk.to_vec();
            let assets = self.with_store(move |store| store.fetch_by_ids(&ids)).await?;

            let pending: Vec<_> = assets.iter().map(|asset| self.analyze(asset)).collect();
            let outcomes: Vec<AssetOutcome> = stream::iter(pending)
                .buffered(self.config.effective_concurrency())
                .collect()
                .await;

            // The in-flight batch is dropped as a whole
            self.check_cancelled()?;

            let updates: Vec<AssetUpdate> = assets
                .iter()
                .zip(outcomes)
                .map(|(asset, outcome)| self.build_update(asset, outcome, &mut counters))
                .collect();
            let written = self
                .with_store(move |store| store.upsert_batch(&updates))
                .await?;

            // Assets deleted mid-batch still count toward progress
            counters.progress.processed += chunk.len();
            log::debug!(
                "Batch written: {} of {} assets ({}/{})",
                written,
                chunk.len(),
                counters.progress.processed,
                counters.progress.total
            );
            self.publish(&counters.progress).await;
        }

        self.check_cancelled()?;
        self.summarize(run_id, counters, started).await
    }

    async fn analyze(&self, asset: &Asset) -> AssetOutcome {
        let mut outcome = AssetOutcome::default();
        if let Err(e) = self.run_stages(asset, &mut outcome).await {
            outcome.error = Some(e);
        }
        outcome
    }

    async fn run_stages(
        &self,
        asset: &Asset,
        outcome: &mut AssetOutcome,
    ) -> Result<(), AnalysisError> {
        let identifier = asset.identifier.as_str();

        self.check_analysis_cancelled()?;
        let hash = ContentHasher::new()
            .hash_asset(self.source.as_ref(), identifier)
            .await?;
        outcome.content_hash = Some(hash.into_string());

        self.check_analysis_cancelled()?;
        let bitmap = self
            .source
            .fetch_normalized_bitmap(identifier, self.config.bitmap_size)
            .await?;

        self.check_analysis_cancelled()?;
        let backend = self.backend.clone();
        let (fingerprint, embedding) = tokio::task::spawn_blocking(move || {
            let fingerprint = Fingerprint::from_bitmap(&bitmap);
            let embedding = backend
                .extract(&bitmap)
                .map(|embedding| backend.serialize(&embedding));
            (fingerprint, embedding)
        })
        .await?;
        outcome.fingerprint = Some(fingerprint);

        self.check_analysis_cancelled()?;
        outcome.embedding = Some(embedding?);
        Ok(())
    }

    fn build_update(
        &self,
        asset: &Asset,
        outcome: AssetOutcome,
        counters: &mut RunCounters,
    ) -> AssetUpdate {
        let now = self.now();
        let progress = &mut counters.progress;
        if outcome.content_hash.is_some() {
            progress.hashed += 1;
        }
        if outcome.fingerprint.is_some() {
            progress.fingerprinted += 1;
        }
        if outcome.embedding.is_some() {
            progress.embedded += 1;
        }

        let mut update = AssetUpdate {
            identifier: asset.identifier.clone(),
            source_modified_at: asset.modified_at,
            content_hash: outcome.content_hash,
            perceptual_fingerprint: outcome.fingerprint.map(|f| f.to_hex()),
            embedding: None,
            embedding_version: None,
            analysis_status: AnalysisStatus::Success,
            analysis_attempt_count: 0,
            analysis_next_retry_at: None,
            analysis_error_message: None,
            // Never older than the content it describes
            analysis_updated_at: now.max(asset.modified_at),
        };

        match outcome.error {
            None => {
                update.embedding = outcome.embedding;
                update.embedding_version = Some(self.backend.revision().to_string());
            }
            Some(error) => {
                let max_attempts = self.config.max_attempts;
                let attempts = if error.is_permanent() {
                    max_attempts
                } else {
                    asset.analysis_attempt_count.saturating_add(1).min(max_attempts)
                };
                let delay = chrono::Duration::from_std(self.config.retry_delay(attempts))
                    .unwrap_or_else(|_| chrono::Duration::zero());

                progress.failed += 1;
                if attempts >= max_attempts {
                    counters.failed_exhausted += 1;
                    log::warn!(
                        "Giving up on {} after {} attempts: {}",
                        asset.identifier,
                        attempts,
                        error
                    );
                } else {
                    counters.failed_retryable += 1;
                    log::warn!(
                        "Analysis of {} failed (attempt {}): {}",
                        asset.identifier,
                        attempts,
                        error
                    );
                }

                update.analysis_status = AnalysisStatus::Failed;
                update.analysis_attempt_count = attempts;
                update.analysis_next_retry_at = Some(now + delay);
                update.analysis_error_message = Some(error.to_string());
            }
        }
        update
    }

    async fn summarize(
        &self,
        run_id: Uuid,
        counters: RunCounters,
        started: Instant,
    ) -> Result<IndexSummary, IndexError> {
        let query = QueryService::new(
            self.store.clone(),
            self.backend.clone(),
            self.config.clone(),
        );
        let revision = self.backend.revision().to_string();
        let max_attempts = self.config.max_attempts;
        let store = self.store.clone();

        let (exact, near, embedded, pending_retry) = tokio::task::spawn_blocking(
            move || -> Result<(usize, usize, usize, usize), IndexError> {
                let exact = query.find_exact_duplicate_groups(Page::all())?.len();
                let near = query.find_near_duplicate_groups(None, Page::all())?.len();
                let embedded = store.count(
                    &Predicate::images()
                        .and(Predicate::NotNull(Field::Embedding))
                        .and(Predicate::eq(Field::EmbeddingVersion, revision.as_str())),
                )?;
                let pending_retry = store.count(
                    &Predicate::images()
                        .and(Predicate::eq(Field::AnalysisStatus, AnalysisStatus::Failed))
                        .and(Predicate::lt(Field::AnalysisAttemptCount, max_attempts)),
                )?;
                Ok((exact, near, embedded, pending_retry))
            },
        )
        .await??;

        let progress = counters.progress;
        Ok(IndexSummary {
            run_id,
            processed: progress.processed,
            hashed: progress.hashed,
            fingerprinted: progress.fingerprinted,
            embedded: progress.embedded,
            failed: progress.failed,
            failed_retryable: counters.failed_retryable,
            failed_exhausted: counters.failed_exhausted,
            exact_duplicate_groups: exact,
            near_duplicate_groups: near,
            embedded_assets: embedded,
            pending_retry,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn with_store<T, F>(&self, f: F) -> Result<T, IndexError>
    where
        F: FnOnce(&dyn AssetStore) -> Result<T, DatabaseError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        let result = tokio::task::spawn_blocking(move || f(store.as_ref())).await?;
        Ok(result?)
    }

    async fn publish(&self, progress: &IndexProgress) {
        if let Some(sender) = &self.progress_sender {
            // Receiver gone is fine
            let _ = sender.send(progress.clone());
        }
        self.set_state(IndexState::Indexing(progress.clone())).await;
    }

    async fn set_state(&self, state: IndexState) {
        *self.state.write().await = state;
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    fn is_cancelled(&self) -> bool {
        self.cancellation_token.load(Ordering::Relaxed)
    }

    fn check_cancelled(&self) -> Result<(), IndexError> {
        if self.is_cancelled() {
            return Err(IndexError::Cancelled);
        }
        Ok(())
    }

    fn check_analysis_cancelled(&self) -> Result<(), AnalysisError> {
        if self.is_cancelled() {
            return Err(AnalysisError::Cancelled);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::core::embedding::{Embedding, EmbeddingError, HistogramEmbedder};
    use crate::database::models::NewAsset;
    use crate::database::AssetRepository;
    use crate::testing::{epoch, pattern, Failure, ManualClock, MemorySource};
    use image::DynamicImage;

    /// Histogram embedder reporting a configurable revision.
    struct Revisioned(&'static str);

    impl EmbeddingBackend for Revisioned {
        fn revision(&self) -> &str {
            self.0
        }

        fn extract(&self, bitmap: &DynamicImage) -> Result<Embedding, EmbeddingError> {
            let mut embedding = HistogramEmbedder::new().extract(bitmap)?;
            embedding.revision = self.0.to_string();
            Ok(embedding)
        }
    }

    /// Store whose candidate lookup can be made to fail, and which can raise a
    /// cancellation token when analysis is reset.
    struct FlakyStore {
        inner: AssetRepository,
        fail: AtomicBool,
        cancel_on_reset: Option<Arc<AtomicBool>>,
    }

    impl AssetStore for FlakyStore {
        fn register_assets(
            &self,
            assets: &[crate::database::models::NewAsset],
        ) -> Result<usize, DatabaseError> {
            self.inner.register_assets(assets)
        }

        fn fetch(
            &self,
            predicate: &Predicate,
            limit: Option<usize>,
        ) -> Result<Vec<Asset>, DatabaseError> {
            self.inner.fetch(predicate, limit)
        }

        fn fetch_identifiers(
            &self,
            predicate: &Predicate,
            limit: Option<usize>,
        ) -> Result<Vec<String>, DatabaseError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(DatabaseError::Connection("disk on fire".to_string()));
            }
            self.inner.fetch_identifiers(predicate, limit)
        }

        fn count(&self, predicate: &Predicate) -> Result<usize, DatabaseError> {
            self.inner.count(predicate)
        }

        fn upsert_batch(&self, updates: &[AssetUpdate]) -> Result<usize, DatabaseError> {
            self.inner.upsert_batch(updates)
        }

        fn reset_analysis(&self, predicate: &Predicate) -> Result<usize, DatabaseError> {
            if let Some(token) = &self.cancel_on_reset {
                token.store(true, Ordering::SeqCst);
            }
            self.inner.reset_analysis(predicate)
        }

        fn remove(&self, identifiers: &[String]) -> Result<usize, DatabaseError> {
            self.inner.remove(identifiers)
        }
    }

    struct Fixture {
        store: Arc<AssetRepository>,
        source: Arc<MemorySource>,
        clock: ManualClock,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Arc::new(AssetRepository::in_memory().unwrap()),
                source: Arc::new(MemorySource::new()),
                clock: ManualClock::starting_at(epoch(1_000)),
            }
        }

        fn add_image(&self, id: &str, seed: u32) {
            self.source.insert_image(id, &pattern(seed));
            self.store
                .register_assets(&[NewAsset::image(id, epoch(0))])
                .unwrap();
        }

        fn indexer(&self, config: EngineConfig) -> Indexer {
            self.indexer_with(config, Arc::new(HistogramEmbedder::new()))
        }

        fn indexer_with(
            &self,
            config: EngineConfig,
            backend: Arc<dyn EmbeddingBackend>,
        ) -> Indexer {
            Indexer::new(self.store.clone(), self.source.clone(), backend, config)
                .with_clock(self.clock.clock())
        }

        fn asset(&self, id: &str) -> Asset {
            self.store.find(id).unwrap().unwrap()
        }
    }

    fn small_batches() -> EngineConfig {
        EngineConfig {
            batch_size: 2,
            max_concurrency: 2,
            bitmap_size: 32,
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn test_run_analyzes_and_summarizes() {
        let fx = Fixture::new();
        fx.add_image("a.jpg", 0);
        fx.add_image("b.jpg", 0);
        fx.add_image("c.jpg", 1);
        fx.add_image("d.jpg", 2);
        fx.store
            .register_assets(&[NewAsset {
                media_type: crate::database::models::MediaType::Video,
                ..NewAsset::image("clip.mov", epoch(0))
            }])
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let indexer = fx.indexer(small_batches()).with_progress_sender(tx);
        let summary = indexer.run(RunOptions::default()).await.unwrap();

        assert_eq!(summary.processed, 4);
        assert_eq!(summary.hashed, 4);
        assert_eq!(summary.fingerprinted, 4);
        assert_eq!(summary.embedded, 4);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.exact_duplicate_groups, 1);
        assert!(summary.near_duplicate_groups >= 1);
        assert_eq!(summary.embedded_assets, 4);
        assert_eq!(summary.pending_retry, 0);
        assert_eq!(indexer.state().await, IndexState::Completed(summary.clone()));

        let a = fx.asset("a.jpg");
        assert_eq!(a.analysis_status, AnalysisStatus::Success);
        assert_eq!(a.content_hash, fx.asset("b.jpg").content_hash);
        assert_eq!(a.perceptual_fingerprint.as_ref().map(|f| f.len()), Some(16));
        assert_eq!(a.embedding_version.as_deref(), Some(HistogramEmbedder::REVISION));
        assert!(a.analysis_updated_at.unwrap() >= a.modified_at);
        assert_eq!(a.analysis_attempt_count, 0);
        assert!(a.embedding.is_some());
        assert!(a.analysis_error_message.is_none());
        assert_eq!(fx.asset("clip.mov").analysis_status, AnalysisStatus::Pending);

        // Progress is published up front and after every batch
        let mut processed = Vec::new();
        while let Ok(progress) = rx.try_recv() {
            assert_eq!(progress.total, 4);
            processed.push(progress.processed);
        }
        assert_eq!(processed, vec![0, 2, 4]);

        // Nothing left to do on a second pass
        let again = indexer.run(RunOptions::default()).await.unwrap();
        assert_eq!(again.processed, 0);
        assert_ne!(again.run_id, summary.run_id);
    }

    #[tokio::test]
    async fn test_transient_failure_backs_off_until_cap() {
        let fx = Fixture::new();
        fx.add_image("flaky.jpg", 0);
        fx.source.fail("flaky.jpg", Failure::AlwaysTransient);
        let indexer = fx.indexer(small_batches());

        let mut retry_times = Vec::new();
        for attempt in 1..=5u32 {
            let summary = indexer.run(RunOptions::default()).await.unwrap();
            assert_eq!(summary.failed, 1);

            let asset = fx.asset("flaky.jpg");
            assert_eq!(asset.analysis_status, AnalysisStatus::Failed);
            assert_eq!(asset.analysis_attempt_count, attempt);
            assert!(asset.analysis_error_message.is_some());
            // Hash succeeded before the bitmap fetch failed
            assert!(asset.content_hash.is_some());
            assert!(asset.perceptual_fingerprint.is_none());

            let next_retry = asset.analysis_next_retry_at.unwrap();
            let delay = (next_retry - fx.clock.now()).num_seconds();
            let expected = [15, 30, 60, 120, 240][attempt as usize - 1];
            assert_eq!(delay, expected);
            retry_times.push(next_retry);

            if attempt < 5 {
                assert_eq!(summary.failed_retryable, 1);
                assert_eq!(summary.pending_retry, 1);
                // Not eligible before the retry time
                let early = indexer.run(RunOptions::default()).await.unwrap();
                assert_eq!(early.processed, 0);
            } else {
                assert_eq!(summary.failed_exhausted, 1);
                assert_eq!(summary.pending_retry, 0);
            }
            fx.clock.set(next_retry);
        }

        assert!(retry_times.windows(2).all(|w| w[0] < w[1]));

        // Exhausted: no further automatic attempts
        fx.clock.advance(chrono::Duration::days(30));
        let summary = indexer.run(RunOptions::default()).await.unwrap();
        assert_eq!(summary.processed, 0);
        assert_eq!(fx.asset("flaky.jpg").analysis_attempt_count, 5);

        // A forced re-index starts over
        fx.source.heal("flaky.jpg");
        let summary = indexer
            .run(RunOptions {
                full_reindex: true,
                ..RunOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(summary.processed, 1);
        let asset = fx.asset("flaky.jpg");
        assert_eq!(asset.analysis_status, AnalysisStatus::Success);
        assert_eq!(asset.analysis_attempt_count, 0);
        assert!(asset.analysis_next_retry_at.is_none());
        assert!(asset.analysis_error_message.is_none());
    }

    #[tokio::test]
    async fn test_transient_failure_recovers_on_retry() {
        let fx = Fixture::new();
        fx.add_image("a.jpg", 0);
        fx.source.fail("a.jpg", Failure::Transient(1));
        let indexer = fx.indexer(small_batches());

        indexer.run(RunOptions::default()).await.unwrap();
        let failed = fx.asset("a.jpg");
        assert_eq!(failed.analysis_attempt_count, 1);

        fx.clock.set(failed.analysis_next_retry_at.unwrap());
        let summary = indexer.run(RunOptions::default()).await.unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(fx.asset("a.jpg").analysis_status, AnalysisStatus::Success);
    }

    #[tokio::test]
    async fn test_permanent_failure_exhausts_attempts() {
        let fx = Fixture::new();
        fx.add_image("gone.jpg", 0);
        fx.add_image("broken.jpg", 1);
        fx.source.remove("gone.jpg");
        fx.source.fail("broken.jpg", Failure::Undecodable);

        let summary = fx.indexer(small_batches()).run(RunOptions::default()).await.unwrap();
        assert_eq!(summary.failed_exhausted, 2);

        let gone = fx.asset("gone.jpg");
        assert_eq!(gone.analysis_attempt_count, 5);
        assert!(gone.content_hash.is_none());
        let broken = fx.asset("broken.jpg");
        assert_eq!(broken.analysis_attempt_count, 5);
        assert!(broken.content_hash.is_some());
    }

    #[tokio::test]
    async fn test_cancel_discards_in_flight_batch() {
        let fx = Fixture::new();
        for i in 1..=4 {
            fx.add_image(&format!("img-{}.jpg", i), i);
        }
        let indexer = fx.indexer(EngineConfig {
            max_concurrency: 1,
            ..small_batches()
        });

        let token = indexer.get_cancellation_token();
        let fired = AtomicBool::new(false);
        fx.source.on_fetch(move |id| {
            if id == "img-3.jpg" && !fired.swap(true, Ordering::SeqCst) {
                token.store(true, Ordering::SeqCst);
            }
        });

        let result = indexer.run(RunOptions::default()).await;
        assert!(matches!(result, Err(IndexError::Cancelled)));
        assert_eq!(indexer.state().await, IndexState::Idle);

        for id in ["img-1.jpg", "img-2.jpg"] {
            assert_eq!(fx.asset(id).analysis_status, AnalysisStatus::Success);
        }
        for id in ["img-3.jpg", "img-4.jpg"] {
            let asset = fx.asset(id);
            assert_eq!(asset.analysis_status, AnalysisStatus::Pending);
            assert_eq!(asset.analysis_attempt_count, 0);
            assert!(asset.analysis_error_message.is_none());
        }

        // The next run picks up where the cancelled one stopped
        let summary = indexer.run(RunOptions::default()).await.unwrap();
        assert_eq!(summary.processed, 2);
    }

    #[tokio::test]
    async fn test_embedding_revision_change_reindexes() {
        let fx = Fixture::new();
        fx.add_image("a.jpg", 0);
        fx.add_image("b.jpg", 1);

        let v1 = fx.indexer_with(small_batches(), Arc::new(Revisioned("v1")));
        v1.run(RunOptions::default()).await.unwrap();
        assert_eq!(fx.asset("a.jpg").embedding_version.as_deref(), Some("v1"));

        let v2 = fx.indexer_with(small_batches(), Arc::new(Revisioned("v2")));
        let summary = v2.run(RunOptions::default()).await.unwrap();
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.embedded_assets, 2);
        for id in ["a.jpg", "b.jpg"] {
            let asset = fx.asset(id);
            assert_eq!(asset.embedding_version.as_deref(), Some("v2"));
            assert_eq!(asset.analysis_status, AnalysisStatus::Success);
        }
    }

    #[tokio::test]
    async fn test_modified_asset_is_reanalyzed() {
        let fx = Fixture::new();
        fx.add_image("a.jpg", 0);
        fx.add_image("b.jpg", 1);
        let indexer = fx.indexer(small_batches());
        indexer.run(RunOptions::default()).await.unwrap();
        let before = fx.asset("a.jpg");

        // Content edited after the last analysis; re-registering drops the old results
        fx.source.insert_image("a.jpg", &pattern(3));
        fx.store
            .register_assets(&[NewAsset::image("a.jpg", epoch(2_000))])
            .unwrap();
        fx.clock.set(epoch(3_000));

        let reset = fx.asset("a.jpg");
        assert_eq!(reset.analysis_status, AnalysisStatus::Pending);
        assert!(reset.content_hash.is_none());
        assert!(reset.perceptual_fingerprint.is_none());
        assert!(reset.embedding.is_none());
        assert_eq!(indexer.invalidate_stale().await.unwrap(), 0);

        let summary = indexer.run(RunOptions::default()).await.unwrap();
        assert_eq!(summary.processed, 1);
        let after = fx.asset("a.jpg");
        assert_ne!(after.content_hash, before.content_hash);
        assert!(after.analysis_updated_at.unwrap() >= after.modified_at);
    }

    #[tokio::test]
    async fn test_start_is_single_flight() {
        let fx = Fixture::new();
        fx.add_image("a.jpg", 0);
        fx.add_image("b.jpg", 1);
        let gate = fx.source.hold_fetches();
        let indexer = fx.indexer(small_batches());

        assert!(indexer.start(RunOptions::default()).await);
        assert!(indexer.is_running().await);
        assert!(!indexer.start(RunOptions::default()).await);

        gate.add_permits(100);
        match indexer.wait().await {
            IndexState::Completed(summary) => assert_eq!(summary.processed, 2),
            other => panic!("unexpected state {:?}", other),
        }
        assert!(!indexer.is_running().await);
        assert_eq!(fx.source.fetch_count("a.jpg"), 1);
    }

    #[tokio::test]
    async fn test_foreground_run_and_start_exclude_each_other() {
        let fx = Fixture::new();
        fx.add_image("a.jpg", 0);
        let gate = fx.source.hold_fetches();
        let indexer = fx.indexer(small_batches());

        // Background run active: a foreground run is refused
        assert!(indexer.start(RunOptions::default()).await);
        assert!(matches!(
            indexer.run(RunOptions::default()).await,
            Err(IndexError::AlreadyRunning)
        ));
        gate.add_permits(100);
        assert!(matches!(indexer.wait().await, IndexState::Completed(_)));
        assert_eq!(fx.source.fetch_count("a.jpg"), 1);

        // Foreground run active: a background start is refused
        fx.add_image("b.jpg", 1);
        let gate = fx.source.hold_fetches();
        let foreground = indexer.clone();
        let handle = tokio::spawn(async move { foreground.run(RunOptions::default()).await });
        while fx.source.fetch_count("b.jpg") == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(!indexer.start(RunOptions::default()).await);

        gate.add_permits(100);
        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(fx.source.fetch_count("b.jpg"), 1);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_source_retries() {
        let fx = Fixture::new();
        fx.add_image("flaky.jpg", 0);
        fx.source.fail("flaky.jpg", Failure::AlwaysTransient);

        let token = Arc::new(AtomicBool::new(false));
        let slow = RetryPolicy {
            max_attempts: 10,
            base_delay: std::time::Duration::from_secs(60),
            max_delay: std::time::Duration::from_secs(60),
        };
        fx.source.retry_transfers(slow, token.clone());
        let indexer = fx.indexer(small_batches()).with_cancellation_token(token);

        assert!(indexer.start(RunOptions::default()).await);
        while fx.source.fetch_count("flaky.jpg") == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        indexer.cancel();

        let state = tokio::time::timeout(std::time::Duration::from_secs(5), indexer.wait())
            .await
            .unwrap();
        assert_eq!(state, IndexState::Idle);
        assert_eq!(fx.source.fetch_count("flaky.jpg"), 1);
        let asset = fx.asset("flaky.jpg");
        assert_eq!(asset.analysis_status, AnalysisStatus::Pending);
        assert_eq!(asset.analysis_attempt_count, 0);
    }

    #[tokio::test]
    async fn test_cancel_before_first_batch_skips_analysis() {
        let token = Arc::new(AtomicBool::new(false));
        let store = Arc::new(FlakyStore {
            inner: AssetRepository::in_memory().unwrap(),
            fail: AtomicBool::new(false),
            cancel_on_reset: Some(token.clone()),
        });
        let source = Arc::new(MemorySource::new());
        let indexer = Indexer::new(
            store.clone(),
            source.clone(),
            Arc::new(HistogramEmbedder::new()),
            small_batches(),
        )
        .with_cancellation_token(token);

        // Nothing to analyze still reports the cancellation
        let result = indexer.run(RunOptions::default()).await;
        assert!(matches!(result, Err(IndexError::Cancelled)));
        assert_eq!(indexer.state().await, IndexState::Idle);

        source.insert_image("a.jpg", &pattern(0));
        store
            .register_assets(&[NewAsset::image("a.jpg", epoch(0))])
            .unwrap();
        let result = indexer
            .run(RunOptions {
                full_reindex: true,
                ..RunOptions::default()
            })
            .await;
        assert!(matches!(result, Err(IndexError::Cancelled)));
        assert_eq!(indexer.state().await, IndexState::Idle);
        assert_eq!(source.fetch_count("a.jpg"), 0);
        assert_eq!(
            store.find("a.jpg").unwrap().unwrap().analysis_status,
            AnalysisStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_restart_replaces_active_run() {
        let fx = Fixture::new();
        fx.add_image("a.jpg", 0);
        fx.add_image("b.jpg", 1);
        let gate = fx.source.hold_fetches();
        let indexer = fx.indexer(small_batches());

        assert!(indexer.start(RunOptions::default()).await);
        gate.add_permits(100);
        assert!(
            indexer
                .start(RunOptions {
                    restart: true,
                    ..RunOptions::default()
                })
                .await
        );

        assert!(matches!(indexer.wait().await, IndexState::Completed(_)));
        for id in ["a.jpg", "b.jpg"] {
            assert_eq!(fx.asset(id).analysis_status, AnalysisStatus::Success);
        }
    }

    #[tokio::test]
    async fn test_store_failure_marks_run_failed() {
        let store = Arc::new(FlakyStore {
            inner: AssetRepository::in_memory().unwrap(),
            fail: AtomicBool::new(true),
            cancel_on_reset: None,
        });
        let source = Arc::new(MemorySource::new());
        source.insert_image("a.jpg", &pattern(0));
        store
            .register_assets(&[NewAsset::image("a.jpg", epoch(0))])
            .unwrap();

        let indexer = Indexer::new(
            store.clone(),
            source,
            Arc::new(HistogramEmbedder::new()),
            small_batches(),
        );

        assert!(indexer.start(RunOptions::default()).await);
        match indexer.wait().await {
            IndexState::Failed(message) => assert!(message.contains("disk on fire")),
            other => panic!("unexpected state {:?}", other),
        }

        store.fail.store(false, Ordering::SeqCst);
        assert!(indexer.start(RunOptions::default()).await);
        assert!(matches!(indexer.wait().await, IndexState::Completed(_)));
    }

    #[test]
    fn test_candidate_predicate_selection() {
        let store = AssetRepository::in_memory().unwrap();
        let now = epoch(1_000);
        store
            .register_assets(&[
                NewAsset::image("pending", epoch(0)),
                NewAsset::image("retry-due", epoch(0)),
                NewAsset::image("retry-later", epoch(0)),
                NewAsset::image("exhausted", epoch(0)),
                NewAsset::image("done", epoch(0)),
                NewAsset::image("old-version", epoch(0)),
            ])
            .unwrap();

        let failed = |id: &str, attempts: u32, retry: i64| AssetUpdate {
            identifier: id.to_string(),
            source_modified_at: epoch(0),
            content_hash: None,
            perceptual_fingerprint: None,
            embedding: None,
            embedding_version: None,
            analysis_status: AnalysisStatus::Failed,
            analysis_attempt_count: attempts,
            analysis_next_retry_at: Some(epoch(retry)),
            analysis_error_message: Some("boom".to_string()),
            analysis_updated_at: epoch(10),
        };
        let success = |id: &str, version: &str| AssetUpdate {
            identifier: id.to_string(),
            source_modified_at: epoch(0),
            content_hash: Some("h".to_string()),
            perceptual_fingerprint: Some("0000000000000000".to_string()),
            embedding: Some(vec![0, 0, 128, 63]),
            embedding_version: Some(version.to_string()),
            analysis_status: AnalysisStatus::Success,
            analysis_attempt_count: 0,
            analysis_next_retry_at: None,
            analysis_error_message: None,
            analysis_updated_at: epoch(10),
        };
        store
            .upsert_batch(&[
                failed("retry-due", 2, 500),
                failed("retry-later", 2, 5_000),
                failed("exhausted", 5, 500),
                success("done", "v1"),
                success("old-version", "v0"),
            ])
            .unwrap();

        let selected = store
            .fetch_identifiers(&candidate_predicate("v1", 5, now), None)
            .unwrap();
        assert_eq!(selected, vec!["pending", "retry-due", "old-version"]);

        let stale = store.fetch_identifiers(&stale_predicate("v1"), None).unwrap();
        assert_eq!(stale, vec!["old-version"]);
    }
}
