use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for indexing and querying.
///
/// Every field has a default, so a host can deserialize a partial document and
/// only override what it cares about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Max Hamming distance (of 64 bits) for two fingerprints to be near-duplicates.
    pub near_duplicate_threshold: u32,
    pub similarity_top_k: usize,
    pub batch_size: usize,
    /// Attempts before an asset is excluded from automatic retry.
    pub max_attempts: u32,
    pub retry_base_secs: u64,
    pub retry_cap_secs: u64,
    /// Edge length of the square bitmap requested from the image source.
    pub bitmap_size: u32,
    pub max_concurrency: usize,
    pub min_longest_edge: Option<u32>,
    pub date_range_filter: bool,
    pub transfer_attempts: u32,
    pub transfer_base_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            near_duplicate_threshold: 6,
            similarity_top_k: 24,
            batch_size: 30,
            max_attempts: 5,
            retry_base_secs: 15,
            retry_cap_secs: 3600,
            bitmap_size: 256,
            max_concurrency: num_cpus::get(),
            min_longest_edge: None,
            date_range_filter: true,
            transfer_attempts: 3,
            transfer_base_delay_ms: 250,
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Delay before an asset that has failed `failures` times becomes eligible again:
    /// `min(2^(failures - 1) * base, cap)`, so the first failure waits `base`.
    pub fn retry_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1);
        let multiplier = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        let secs = self
            .retry_base_secs
            .saturating_mul(multiplier)
            .min(self.retry_cap_secs);
        Duration::from_secs(secs)
    }

    pub fn transfer_retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.transfer_attempts.max(1),
            base_delay: Duration::from_millis(self.transfer_base_delay_ms),
            max_delay: Duration::from_secs(30),
        }
    }

    pub(crate) fn effective_batch_size(&self) -> usize {
        self.batch_size.max(1)
    }

    pub(crate) fn effective_concurrency(&self) -> usize {
        self.max_concurrency.max(1)
    }
}

/// Bounded exponential backoff used for transient transfer failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay after the given (1-based) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        EngineConfig::default().transfer_retry()
    }
}
