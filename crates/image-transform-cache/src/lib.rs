//! Durable transformation cache for remotely-sourced images
//!
//! Given a source URL and transformation options (width, height, quality,
//! output format), returns the storage path of the transformed asset,
//! fetching and transforming it on first request only. Concurrent requests
//! for the same key are coalesced into a single fill, and a background sweeper
//! evicts entries that have not been accessed within the retention window.

mod asset;
mod cache;
mod config;
mod error;
mod key;
mod locks;
mod metadata;
mod origin;
mod sweeper;
mod transform;
mod types;

#[cfg(test)]
mod testing;

pub use asset::{AssetStore, FsAssetStore};
pub use cache::{CachedImage, ImageCache};
pub use config::{
    parse_breakpoints, retention_from_days, CacheConfig, DEFAULT_BREAKPOINTS, DEFAULT_FORMAT,
    DEFAULT_QUALITY,
};
pub use error::{ImageCacheError, Result};
pub use key::CacheKey;
pub use locks::{KeyGuard, KeyLocks};
pub use metadata::{MetadataStore, SqliteMetadataStore};
pub use origin::{HttpOriginFetcher, OriginFetcher};
pub use sweeper::{retention_cutoff, EvictionSweeper, SweepReport, SweepState};
pub use transform::{plan_resize, ImageTransformer, ResizePlan, Transformer};
pub use types::{CacheEntry, CacheStats, ImageFormat, NewCacheEntry, TransformOptions};
