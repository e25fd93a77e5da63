//! Request and response types for the image cache server

use image_transform_cache::{CacheConfig, CacheStats, SweepState};
use serde::{Deserialize, Serialize};

/// Configuration for the server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub cache: CacheConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3005,
            cache: CacheConfig::default(),
        }
    }
}

/// Query for a transformed image: `?url=...&w=320&h=240&q=80&format=webp`
#[derive(Debug, Deserialize)]
pub struct ImageQuery {
    pub url: String,
    pub w: Option<u32>,
    pub h: Option<u32>,
    pub q: Option<u8>,
    pub format: Option<String>,
}

/// Query for a responsive set; `widths` falls back to the configured breakpoints
#[derive(Debug, Deserialize)]
pub struct SrcSetQuery {
    pub url: String,
    pub widths: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PurgeQuery {
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct SrcSetResponse {
    pub srcset: String,
    pub paths: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct PurgeResponse {
    pub removed: usize,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub cache: CacheStats,
    pub sweeper: SweepState,
}
