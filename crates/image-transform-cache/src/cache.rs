//! Cache orchestrator
//!
//! Coordinates lookup, single-flight miss fills and access-time refresh.
//! A fill writes the asset before registering metadata, so no reader ever
//! sees a row that points at bytes which do not exist yet.

use crate::asset::{AssetStore, FsAssetStore};
use crate::config::CacheConfig;
use crate::error::{ImageCacheError, Result};
use crate::key::CacheKey;
use crate::locks::KeyLocks;
use crate::metadata::{MetadataStore, SqliteMetadataStore};
use crate::origin::{HttpOriginFetcher, OriginFetcher};
use crate::sweeper::EvictionSweeper;
use crate::transform::{ImageTransformer, Transformer};
use crate::types::{CacheEntry, CacheStats, NewCacheEntry, TransformOptions};
use chrono::Utc;
use futures::future::try_join_all;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

/// Result of a lookup: where the asset lives and whether it was already cached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedImage {
    pub storage_path: String,
    pub hit: bool,
}

pub struct ImageCache {
    config: CacheConfig,
    metadata: Arc<dyn MetadataStore>,
    assets: Arc<dyn AssetStore>,
    origin: Arc<dyn OriginFetcher>,
    transformer: Arc<dyn Transformer>,
    locks: KeyLocks,
    sweeper: Arc<EvictionSweeper>,
    sweeper_task: OnceLock<JoinHandle<()>>,
    hits: AtomicU64,
    misses: AtomicU64,
    fills: AtomicU64,
    coalesced: AtomicU64,
}

impl ImageCache {
    pub fn new(
        config: CacheConfig,
        metadata: Arc<dyn MetadataStore>,
        assets: Arc<dyn AssetStore>,
        origin: Arc<dyn OriginFetcher>,
        transformer: Arc<dyn Transformer>,
    ) -> Self {
        let locks = KeyLocks::new();
        let sweeper = Arc::new(EvictionSweeper::new(
            metadata.clone(),
            assets.clone(),
            locks.clone(),
            config.retention,
            config.sweep_interval,
        ));
        Self {
            config,
            metadata,
            assets,
            origin,
            transformer,
            locks,
            sweeper,
            sweeper_task: OnceLock::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            fills: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
        }
    }

    /// Build a cache over SQLite metadata, the filesystem, HTTP origins and
    /// the `image` pipeline, applying migrations and preparing the cache dir
    pub async fn connect(config: CacheConfig) -> Result<Self> {
        let metadata = SqliteMetadataStore::connect(&config.database_url).await?;
        metadata.migrate().await?;

        let assets = FsAssetStore::new(config.cache_dir.clone());
        assets.init().await?;

        let origin = HttpOriginFetcher::new(config.origin_timeout)?;

        Ok(Self::new(
            config,
            Arc::new(metadata),
            Arc::new(assets),
            Arc::new(origin),
            Arc::new(ImageTransformer::new()),
        ))
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn sweeper(&self) -> &Arc<EvictionSweeper> {
        &self.sweeper
    }

    /// Start the background sweeper if it is not running yet. Called on
    /// first use; the task is aborted when the cache is dropped.
    pub fn start_sweeper(&self) {
        self.sweeper_task
            .get_or_init(|| self.sweeper.clone().spawn());
    }

    /// Options carrying the configured default format and quality
    pub fn default_options(&self) -> TransformOptions {
        TransformOptions::new(self.config.default_format, self.config.default_quality)
    }

    /// Return the storage path of the transformed asset, filling on a miss
    pub async fn get_or_create(&self, source_url: &str, options: TransformOptions) -> Result<String> {
        Ok(self.resolve(source_url, options).await?.storage_path)
    }

    /// Like [`get_or_create`](Self::get_or_create), also reporting whether
    /// the asset was already cached
    pub async fn resolve(&self, source_url: &str, options: TransformOptions) -> Result<CachedImage> {
        validate_source_url(source_url)?;
        options.validate()?;
        self.start_sweeper();

        let key = CacheKey::derive(source_url, &options);

        // Hits take the key lock too, so the lookup and access-time refresh
        // cannot interleave with a sweep's re-check and delete of this key
        let contended = self.locks.is_locked(&key);
        let guard = self.locks.lock(&key).await;

        if let Some(entry) = self.lookup_live(&key, source_url, &options).await? {
            if contended {
                self.coalesced.fetch_add(1, Ordering::Relaxed);
            }
            self.record_hit(&key, &entry).await;
            return Ok(CachedImage {
                storage_path: entry.storage_path,
                hit: true,
            });
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let storage_path = self.fill(source_url, &key, options).await?;
        drop(guard);

        Ok(CachedImage {
            storage_path,
            hit: false,
        })
    }

    /// One `get_or_create` per width in the default format, in input order.
    /// The first failure aborts the whole set.
    pub async fn get_responsive_set(&self, source_url: &str, widths: &[u32]) -> Result<Vec<String>> {
        validate_source_url(source_url)?;
        let base = self.default_options();
        try_join_all(
            widths
                .iter()
                .map(|&width| self.get_or_create(source_url, base.with_width(width))),
        )
        .await
    }

    /// `srcset` attribute value for the responsive set of `source_url`
    pub async fn src_set(&self, source_url: &str, widths: &[u32]) -> Result<String> {
        let paths = self.get_responsive_set(source_url, widths).await?;
        Ok(self.format_src_set(&paths, widths))
    }

    /// Render already-resolved storage paths as a `srcset` value
    pub fn format_src_set(&self, paths: &[String], widths: &[u32]) -> String {
        paths
            .iter()
            .zip(widths)
            .map(|(path, width)| format!("{}/{} {}w", self.config.public_path, path, width))
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub async fn read(&self, storage_path: &str) -> Result<Vec<u8>> {
        self.assets.read(storage_path).await
    }

    /// Remove every cached variant of `source_url`. Returns how many entries
    /// were deleted.
    pub async fn purge(&self, source_url: &str) -> Result<usize> {
        let mut removed = 0;
        for entry in self.metadata.list_by_source(source_url).await? {
            let key = CacheKey::derive(&entry.source_url, &entry.options());
            let _guard = self.locks.lock(&key).await;
            self.assets.delete(&entry.storage_path).await?;
            if self.metadata.delete(entry.id).await? {
                removed += 1;
            }
        }
        info!(source_url, removed, "Purged cached variants");
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        Ok(CacheStats {
            entries: self.metadata.count().await?,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            fills: self.fills.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
        })
    }

    /// Find the entry for `options` whose asset is present. A row whose
    /// asset has gone missing is deleted so the fill can replace it. Caller
    /// must hold the key lock.
    async fn lookup_live(
        &self,
        key: &CacheKey,
        source_url: &str,
        options: &TransformOptions,
    ) -> Result<Option<CacheEntry>> {
        let Some(entry) = self.metadata.find(source_url, options).await? else {
            return Ok(None);
        };
        if self.assets.exists(&entry.storage_path).await? {
            return Ok(Some(entry));
        }

        warn!(key = %key, path = %entry.storage_path, "Cached asset missing, refilling");
        self.metadata.delete(entry.id).await?;
        Ok(None)
    }

    async fn record_hit(&self, key: &CacheKey, entry: &CacheEntry) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, "Cache hit");
        if let Err(e) = self.metadata.touch(entry.id, Utc::now()).await {
            warn!(key = %key, error = %e, "Failed to refresh access time");
        }
    }

    /// Fetch, transform, write, register. Caller must hold the key lock.
    async fn fill(&self, source_url: &str, key: &CacheKey, options: TransformOptions) -> Result<String> {
        let storage_path = key.storage_path(&options);
        info!(key = %key, source_url, "Cache miss, filling");

        let source = self.origin.fetch(source_url).await?;
        let bytes = self.transformer.transform(source, &options).await?;

        if let Err(e) = self.assets.write(&storage_path, &bytes).await {
            self.discard(key, &storage_path).await;
            return Err(e);
        }

        let entry = NewCacheEntry {
            cache_key: key.to_string(),
            source_url: source_url.to_string(),
            storage_path: storage_path.clone(),
            options,
            created_at: Utc::now(),
        };
        match self.metadata.insert(entry).await {
            Ok(entry) => {
                self.fills.fetch_add(1, Ordering::Relaxed);
                info!(key = %key, path = %entry.storage_path, size = bytes.len(), "Cached transformed image");
                Ok(entry.storage_path)
            }
            Err(e) => {
                self.discard(key, &storage_path).await;
                Err(e)
            }
        }
    }

    async fn discard(&self, key: &CacheKey, storage_path: &str) {
        if let Err(e) = self.assets.delete(storage_path).await {
            warn!(key = %key, path = storage_path, error = %e, "Failed to discard unregistered asset");
        }
    }
}

impl Drop for ImageCache {
    fn drop(&mut self) {
        if let Some(task) = self.sweeper_task.get() {
            task.abort();
        }
    }
}

/// Accept only absolute http(s) URLs with a host
fn validate_source_url(raw: &str) -> Result<()> {
    let url = Url::parse(raw)
        .map_err(|e| ImageCacheError::InvalidInput(format!("invalid source URL {}: {}", raw, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ImageCacheError::InvalidInput(format!(
            "unsupported URL scheme: {}",
            url.scheme()
        )));
    }
    if url.host_str().is_none() {
        return Err(ImageCacheError::InvalidInput(format!(
            "source URL has no host: {}",
            raw
        )));
    }
    Ok(())
}
