//! Asset store: transformed payloads on disk, addressed by storage path
//!
//! Writes go to a temporary file under `.tmp/` and are renamed into place,
//! so a canonical path only ever holds complete bytes.

use crate::error::{ImageCacheError, Result};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const TMP_DIR: &str = ".tmp";

#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Atomically place `bytes` at `path`
    async fn write(&self, path: &str, bytes: &[u8]) -> Result<()>;

    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Remove the payload. Succeeds when it is already absent; returns
    /// whether a file was actually removed.
    async fn delete(&self, path: &str) -> Result<bool>;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// Storage paths of every committed payload
    async fn list(&self) -> Result<Vec<String>>;
}

/// Filesystem-backed asset store rooted at the cache directory
pub struct FsAssetStore {
    root: PathBuf,
    tmp_counter: AtomicU64,
}

impl FsAssetStore {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            tmp_counter: AtomicU64::new(0),
        }
    }

    /// Ensure the cache directory exists and discard temp files left by
    /// interrupted writes
    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.root).await?;
        let tmp = self.root.join(TMP_DIR);
        match fs::remove_dir_all(&tmp).await {
            Ok(()) => debug!(tmp = ?tmp, "Cleared stale temp directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::create_dir_all(&tmp).await?;
        info!(cache_dir = ?self.root, "Asset store initialized");
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute location of a storage path
    pub fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let mut components = relative.components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(name)), None) if name != TMP_DIR => Ok(self.root.join(name)),
            _ => Err(ImageCacheError::InvalidInput(format!(
                "storage path must be a bare filename: {}",
                path
            ))),
        }
    }

    fn temp_path(&self, path: &str) -> PathBuf {
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        self.root
            .join(TMP_DIR)
            .join(format!("{}.{}.{}", path, std::process::id(), n))
    }

    async fn write_temp(tmp: &Path, bytes: &[u8]) -> std::io::Result<()> {
        let mut file = fs::File::create(tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        Ok(())
    }
}

#[async_trait]
impl AssetStore for FsAssetStore {
    async fn write(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let target = self.resolve(path)?;
        let tmp = self.temp_path(path);
        if let Some(parent) = tmp.parent() {
            fs::create_dir_all(parent).await?;
        }

        let written = match Self::write_temp(&tmp, bytes).await {
            Ok(()) => fs::rename(&tmp, &target).await,
            Err(e) => Err(e),
        };

        if let Err(e) = written {
            if let Err(cleanup) = fs::remove_file(&tmp).await {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    warn!(tmp = ?tmp, error = %cleanup, "Failed to remove temp file");
                }
            }
            return Err(e.into());
        }

        debug!(path, size = bytes.len(), "Wrote asset");
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.resolve(path)?).await?)
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        match fs::remove_file(self.resolve(path)?).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(fs::try_exists(self.resolve(path)?).await?)
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut paths = Vec::new();
        let mut dir = fs::read_dir(&self.root).await?;
        while let Some(item) = dir.next_entry().await? {
            if !item.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = item.file_name().to_str() {
                paths.push(name.to_string());
            }
        }
        paths.sort();
        Ok(paths)
    }
}
