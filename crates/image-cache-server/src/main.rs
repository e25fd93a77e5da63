//! Image Cache Server - HTTP host for the image transformation cache
//!
//! Serves transformed variants of remote images, srcset descriptors and the
//! stored assets themselves, and runs the background eviction sweeper.

mod error;
mod server;
mod types;

use crate::error::Result;
use crate::server::{start_server, ServerState, SharedState};
use crate::types::ServerConfig;
use image_transform_cache::{CacheConfig, ImageCache};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let env_filter = EnvFilter::from_default_env()
        .add_directive("image_cache_server=info".parse()?)
        .add_directive("image_transform_cache=info".parse()?);

    // Use JSON format for GCP Cloud Logging when LOG_FORMAT=json
    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    };

    info!("Starting image cache server...");

    let config = load_config();
    info!("Port: {}", config.port);
    info!("Cache dir: {:?}", config.cache.cache_dir);
    info!("Default output: {} q{}", config.cache.default_format, config.cache.default_quality);
    info!("Retention: {} days", config.cache.retention.as_secs() / (24 * 60 * 60));
    info!("Sweep interval: {} seconds", config.cache.sweep_interval.as_secs());

    let cache = ImageCache::connect(config.cache).await?;
    cache.start_sweeper();

    let state: SharedState = Arc::new(ServerState::new(cache));

    // Start HTTP server (blocking)
    start_server(state, config.port).await?;

    Ok(())
}

fn load_config() -> ServerConfig {
    let defaults = ServerConfig::default();

    let port = std::env::var("PORT")
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(defaults.port);

    ServerConfig {
        port,
        cache: CacheConfig::from_env(),
    }
}
