//! Core types for the image transformation cache

use crate::error::{ImageCacheError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Output encoding of a transformed asset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Jpeg,
    Webp,
    Avif,
    Png,
}

impl ImageFormat {
    /// File extension used for the on-disk asset
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::Webp => "webp",
            ImageFormat::Avif => "avif",
            ImageFormat::Png => "png",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Webp => "image/webp",
            ImageFormat::Avif => "image/avif",
            ImageFormat::Png => "image/png",
        }
    }

    /// Format of a stored asset path, from its extension
    pub fn from_path(path: &str) -> Option<Self> {
        let (_, ext) = path.rsplit_once('.')?;
        ext.parse().ok()
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ImageFormat {
    type Err = ImageCacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(ImageFormat::Jpeg),
            "webp" => Ok(ImageFormat::Webp),
            "avif" => Ok(ImageFormat::Avif),
            "png" => Ok(ImageFormat::Png),
            other => Err(ImageCacheError::InvalidInput(format!(
                "unsupported image format: {}",
                other
            ))),
        }
    }
}

/// Fully resolved transformation parameters.
///
/// `None` on an axis means the natural dimension. Two option sets that
/// compare equal always derive the same cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransformOptions {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub quality: u8,
    pub format: ImageFormat,
}

impl TransformOptions {
    pub fn new(format: ImageFormat, quality: u8) -> Self {
        Self {
            width: None,
            height: None,
            quality,
            format,
        }
    }

    pub fn with_width(mut self, width: u32) -> Self {
        self.width = Some(width);
        self
    }

    pub fn with_height(mut self, height: u32) -> Self {
        self.height = Some(height);
        self
    }

    /// Reject zero dimensions and quality outside 1..=100
    pub fn validate(&self) -> Result<()> {
        if !(1..=100).contains(&self.quality) {
            return Err(ImageCacheError::InvalidInput(format!(
                "quality must be in 1..=100, got {}",
                self.quality
            )));
        }
        if self.width == Some(0) || self.height == Some(0) {
            return Err(ImageCacheError::InvalidInput(
                "width and height must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// A persisted cache record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub id: i64,
    pub cache_key: String,
    pub source_url: String,
    pub storage_path: String,
    pub format: ImageFormat,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub quality: u8,
    pub created_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn options(&self) -> TransformOptions {
        TransformOptions {
            width: self.width,
            height: self.height,
            quality: self.quality,
            format: self.format,
        }
    }
}

/// Insert payload; the store assigns `id` and sets `accessed_at = created_at`
#[derive(Debug, Clone)]
pub struct NewCacheEntry {
    pub cache_key: String,
    pub source_url: String,
    pub storage_path: String,
    pub options: TransformOptions,
    pub created_at: DateTime<Utc>,
}

/// Statistics about the cache
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: u64,
    pub hits: u64,
    pub misses: u64,
    pub fills: u64,
    /// Hits that waited behind another caller holding the same key
    pub coalesced: u64,
}
