//! Cache key derivation
//!
//! A key is the SHA-256 of the source URL and a fixed-order rendering of the
//! transform options. It is both the lookup index and the asset filename stem.

use crate::types::TransformOptions;
use sha2::{Digest, Sha256};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive the key for a (source URL, options) pair
    pub fn derive(source_url: &str, options: &TransformOptions) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(source_url.as_bytes());
        hasher.update(b"\n");
        hasher.update(canonical_options(options).as_bytes());
        CacheKey(hex::encode(hasher.finalize()))
    }

    /// Wrap an existing key string, e.g. a filename stem found on disk
    pub fn from_stem(stem: &str) -> Option<Self> {
        if stem.len() == 64 && stem.chars().all(|c| c.is_ascii_hexdigit()) {
            Some(CacheKey(stem.to_ascii_lowercase()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Asset filename: `<key>.<format extension>`
    pub fn storage_path(&self, options: &TransformOptions) -> String {
        format!("{}.{}", self.0, options.format.extension())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn canonical_options(options: &TransformOptions) -> String {
    fn axis(v: Option<u32>) -> String {
        v.map(|n| n.to_string()).unwrap_or_default()
    }
    format!(
        "format={};width={};height={};quality={}",
        options.format.extension(),
        axis(options.width),
        axis(options.height),
        options.quality
    )
}
