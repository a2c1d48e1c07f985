// Shared fixtures for unit tests: an in-memory image source with scripted
// failures and a manually advanced clock.

use crate::config::RetryPolicy;
use crate::core::source::{retry_with_backoff, ImageSource, SourceError};
use crate::services::indexer::Clock;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use image::{imageops::FilterType, DynamicImage, ImageBuffer, ImageFormat, Rgb};
use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// `Transfer` error on the next `n` bitmap fetches
    Transient(u32),
    /// `Transfer` error on every bitmap fetch
    AlwaysTransient,
    /// `Decode` error on every bitmap fetch
    Undecodable,
}

type FetchHook = Box<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
pub struct MemorySource {
    originals: Mutex<HashMap<String, Vec<u8>>>,
    bitmaps: Mutex<HashMap<String, DynamicImage>>,
    failures: Mutex<HashMap<String, Failure>>,
    fetches: Mutex<HashMap<String, u32>>,
    on_fetch: Mutex<Option<FetchHook>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    retry: Mutex<Option<(RetryPolicy, Arc<AtomicBool>)>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_bytes(&self, identifier: &str, bytes: Vec<u8>) {
        self.originals
            .lock()
            .unwrap()
            .insert(identifier.to_string(), bytes);
    }

    /// Store `image` as PNG bytes and serve it as the bitmap.
    pub fn insert_image(&self, identifier: &str, image: &DynamicImage) {
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        self.insert_bytes(identifier, bytes);
        self.bitmaps
            .lock()
            .unwrap()
            .insert(identifier.to_string(), image.clone());
    }

    pub fn remove(&self, identifier: &str) {
        self.originals.lock().unwrap().remove(identifier);
        self.bitmaps.lock().unwrap().remove(identifier);
    }

    pub fn fail(&self, identifier: &str, failure: Failure) {
        self.failures
            .lock()
            .unwrap()
            .insert(identifier.to_string(), failure);
    }

    pub fn heal(&self, identifier: &str) {
        self.failures.lock().unwrap().remove(identifier);
    }

    pub fn fetch_count(&self, identifier: &str) -> u32 {
        self.fetches
            .lock()
            .unwrap()
            .get(identifier)
            .copied()
            .unwrap_or(0)
    }

    /// Called with the identifier at the start of every bitmap fetch.
    pub fn on_fetch(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        *self.on_fetch.lock().unwrap() = Some(Box::new(hook));
    }

    /// Block bitmap fetches until permits are added to the returned semaphore.
    pub fn hold_fetches(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// Retry failed bitmap fetches the way `FsImageSource` does.
    pub fn retry_transfers(&self, policy: RetryPolicy, token: Arc<AtomicBool>) {
        *self.retry.lock().unwrap() = Some((policy, token));
    }

    async fn fetch_once(
        &self,
        identifier: &str,
        target_size: u32,
    ) -> Result<DynamicImage, SourceError> {
        *self
            .fetches
            .lock()
            .unwrap()
            .entry(identifier.to_string())
            .or_insert(0) += 1;
        if let Some(hook) = self.on_fetch.lock().unwrap().as_ref() {
            hook(identifier);
        }
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await.unwrap();
        }
        if let Some(err) = self.scripted_failure(identifier) {
            return Err(err);
        }

        let bitmap = self.bitmaps.lock().unwrap().get(identifier).cloned();
        match bitmap {
            Some(bitmap) => Ok(bitmap.resize_exact(target_size, target_size, FilterType::Triangle)),
            None => Err(SourceError::AssetUnavailable {
                identifier: identifier.to_string(),
            }),
        }
    }

    fn scripted_failure(&self, identifier: &str) -> Option<SourceError> {
        let mut failures = self.failures.lock().unwrap();
        let transfer = SourceError::Transfer {
            identifier: identifier.to_string(),
            message: "scripted transfer failure".to_string(),
        };
        match failures.get(identifier).copied() {
            None => None,
            Some(Failure::AlwaysTransient) => Some(transfer),
            Some(Failure::Undecodable) => Some(SourceError::Decode {
                identifier: identifier.to_string(),
                message: "scripted decode failure".to_string(),
            }),
            Some(Failure::Transient(remaining)) => {
                if remaining <= 1 {
                    failures.remove(identifier);
                } else {
                    failures.insert(identifier.to_string(), Failure::Transient(remaining - 1));
                }
                Some(transfer)
            }
        }
    }
}

#[async_trait]
impl ImageSource for MemorySource {
    async fn open_original(
        &self,
        identifier: &str,
    ) -> Result<Box<dyn Read + Send>, SourceError> {
        let bytes = self.originals.lock().unwrap().get(identifier).cloned();
        match bytes {
            Some(bytes) => Ok(Box::new(Cursor::new(bytes))),
            None => Err(SourceError::AssetUnavailable {
                identifier: identifier.to_string(),
            }),
        }
    }

    async fn fetch_normalized_bitmap(
        &self,
        identifier: &str,
        target_size: u32,
    ) -> Result<DynamicImage, SourceError> {
        let retry = self.retry.lock().unwrap().clone();
        match retry {
            Some((policy, token)) => {
                let label = format!("bitmap {}", identifier);
                retry_with_backoff(policy, &token, &label, || {
                    self.fetch_once(identifier, target_size)
                })
                .await
            }
            None => self.fetch_once(identifier, target_size).await,
        }
    }
}

/// Clock that only moves when told to.
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }

    pub fn clock(&self) -> Clock {
        let now = self.now.clone();
        Arc::new(move || *now.lock().unwrap())
    }
}

pub fn epoch(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

/// Structured test image: a diagonal gradient whose direction and texture depend on `seed`.
pub fn pattern(seed: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(ImageBuffer::from_fn(64, 64, |x, y| {
        let v = match seed % 4 {
            0 => x * 4,
            1 => 255 - x * 4,
            2 => y * 4,
            _ => ((x / 8 + y / 8) % 2) * 255,
        };
        let tint = (seed * 37 % 200) as u8;
        Rgb([v as u8, (v as u8).wrapping_add(tint), tint])
    }))
}
