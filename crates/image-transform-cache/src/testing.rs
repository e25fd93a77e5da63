//! Instrumented collaborators for exercising the cache in tests

use crate::asset::{AssetStore, FsAssetStore};
use crate::cache::ImageCache;
use crate::config::CacheConfig;
use crate::error::{ImageCacheError, Result};
use crate::key::CacheKey;
use crate::metadata::{MetadataStore, SqliteMetadataStore};
use crate::origin::OriginFetcher;
use crate::transform::Transformer;
use crate::types::{CacheEntry, NewCacheEntry, TransformOptions};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Default)]
pub struct CountingOrigin {
    pub calls: AtomicUsize,
    pub fail: AtomicBool,
}

#[async_trait]
impl OriginFetcher for CountingOrigin {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(ImageCacheError::OriginUnavailable(format!(
                "origin returned status 503 for {}",
                url
            )));
        }
        Ok(format!("source:{}", url).into_bytes())
    }
}

/// Echoes its options into the output so tests can tell payloads apart
#[derive(Default)]
pub struct CountingTransformer {
    pub calls: AtomicUsize,
    pub fail: AtomicBool,
    pub delay: Mutex<Option<Duration>>,
    pub seen: Mutex<Vec<TransformOptions>>,
}

impl CountingTransformer {
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl Transformer for CountingTransformer {
    async fn transform(&self, bytes: Vec<u8>, options: &TransformOptions) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(*options);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(ImageCacheError::TransformationFailed(
                "unsupported image header".to_string(),
            ));
        }
        let mut out = format!("{:?}|", options).into_bytes();
        out.extend_from_slice(&bytes);
        Ok(out)
    }
}

/// SQLite store with insert counting, insert faults and hooks that refresh
/// an entry while a sweep is scanning or stall the next `get`
pub struct FlakyMetadata {
    pub inner: SqliteMetadataStore,
    pub inserts: AtomicUsize,
    pub fail_inserts: AtomicBool,
    pub touch_during_scan: Mutex<Option<i64>>,
    /// One-shot: the next `get` reads its row, signals `get_stalled`, then
    /// sleeps this long before returning
    pub stall_next_get: Mutex<Option<Duration>>,
    pub get_stalled: Arc<Notify>,
}

#[async_trait]
impl MetadataStore for FlakyMetadata {
    async fn find(
        &self,
        source_url: &str,
        options: &TransformOptions,
    ) -> Result<Option<CacheEntry>> {
        self.inner.find(source_url, options).await
    }

    async fn find_by_key(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        self.inner.find_by_key(key).await
    }

    async fn get(&self, id: i64) -> Result<Option<CacheEntry>> {
        let row = self.inner.get(id).await?;
        let stall = self.stall_next_get.lock().unwrap().take();
        if let Some(stall) = stall {
            self.get_stalled.notify_one();
            tokio::time::sleep(stall).await;
        }
        Ok(row)
    }

    async fn insert(&self, entry: NewCacheEntry) -> Result<CacheEntry> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(sqlx::Error::PoolTimedOut.into());
        }
        self.inner.insert(entry).await
    }

    async fn touch(&self, id: i64, now: DateTime<Utc>) -> Result<()> {
        self.inner.touch(id, now).await
    }

    async fn list_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<CacheEntry>> {
        let expired = self.inner.list_expired(cutoff).await?;
        let refreshed = self.touch_during_scan.lock().unwrap().take();
        if let Some(id) = refreshed {
            self.inner.touch(id, Utc::now()).await?;
        }
        Ok(expired)
    }

    async fn list_by_source(&self, source_url: &str) -> Result<Vec<CacheEntry>> {
        self.inner.list_by_source(source_url).await
    }

    async fn delete(&self, id: i64) -> Result<bool> {
        self.inner.delete(id).await
    }

    async fn count(&self) -> Result<u64> {
        self.inner.count().await
    }
}

/// Filesystem store with write counting and per-path delete faults
pub struct CountingAssets {
    pub inner: FsAssetStore,
    pub writes: AtomicUsize,
    pub fail_delete: Mutex<Option<String>>,
}

#[async_trait]
impl AssetStore for CountingAssets {
    async fn write(&self, path: &str, bytes: &[u8]) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.write(path, bytes).await
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.inner.read(path).await
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        if self.fail_delete.lock().unwrap().as_deref() == Some(path) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "permission denied",
            )
            .into());
        }
        self.inner.delete(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.inner.exists(path).await
    }

    async fn list(&self) -> Result<Vec<String>> {
        self.inner.list().await
    }
}

pub struct Harness {
    pub cache: ImageCache,
    pub origin: Arc<CountingOrigin>,
    pub transformer: Arc<CountingTransformer>,
    pub metadata: Arc<FlakyMetadata>,
    pub assets: Arc<CountingAssets>,
}

impl Harness {
    pub async fn new(dir: &Path) -> Self {
        let config = CacheConfig {
            cache_dir: dir.join("assets"),
            database_url: format!("sqlite://{}", dir.join("meta.db").display()),
            ..CacheConfig::default()
        };

        let store = SqliteMetadataStore::connect(&config.database_url)
            .await
            .unwrap();
        store.migrate().await.unwrap();
        let metadata = Arc::new(FlakyMetadata {
            inner: store,
            inserts: AtomicUsize::new(0),
            fail_inserts: AtomicBool::new(false),
            touch_during_scan: Mutex::new(None),
            stall_next_get: Mutex::new(None),
            get_stalled: Arc::new(Notify::new()),
        });

        let fs = FsAssetStore::new(config.cache_dir.clone());
        fs.init().await.unwrap();
        let assets = Arc::new(CountingAssets {
            inner: fs,
            writes: AtomicUsize::new(0),
            fail_delete: Mutex::new(None),
        });

        let origin = Arc::new(CountingOrigin::default());
        let transformer = Arc::new(CountingTransformer::default());

        let cache = ImageCache::new(
            config,
            metadata.clone(),
            assets.clone(),
            origin.clone(),
            transformer.clone(),
        );

        Self {
            cache,
            origin,
            transformer,
            metadata,
            assets,
        }
    }

    pub fn fetches(&self) -> usize {
        self.origin.calls.load(Ordering::SeqCst)
    }

    pub fn transforms(&self) -> usize {
        self.transformer.calls.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.assets.writes.load(Ordering::SeqCst)
    }

    pub fn inserts(&self) -> usize {
        self.metadata.inserts.load(Ordering::SeqCst)
    }

    /// Register an entry directly, as if it had been filled at `at`
    pub async fn seed(&self, url: &str, options: TransformOptions, at: DateTime<Utc>) -> CacheEntry {
        let key = CacheKey::derive(url, &options);
        let storage_path = key.storage_path(&options);
        self.assets.inner.write(&storage_path, b"seeded").await.unwrap();
        self.metadata
            .inner
            .insert(NewCacheEntry {
                cache_key: key.to_string(),
                source_url: url.to_string(),
                storage_path,
                options,
                created_at: at,
            })
            .await
            .unwrap()
    }
}
