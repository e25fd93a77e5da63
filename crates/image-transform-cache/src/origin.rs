//! Origin fetching

use crate::error::{ImageCacheError, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_USER_AGENT: &str = "image-transform-cache/0.1";

/// Retrieves raw source bytes for a URL. Implementations apply their own
/// timeout; the cache never retries on their behalf.
#[async_trait]
pub trait OriginFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// HTTP client for fetching source images
pub struct HttpOriginFetcher {
    client: Client,
}

impl HttpOriginFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(DEFAULT_USER_AGENT)
            .build()
            .map_err(|e| {
                ImageCacheError::OriginUnavailable(format!("failed to build HTTP client: {}", e))
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl OriginFetcher for HttpOriginFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        debug!(url, "Fetching origin image");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ImageCacheError::OriginUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            warn!(status = %response.status(), url, "Origin returned error status");
            return Err(ImageCacheError::OriginUnavailable(format!(
                "origin returned status {}",
                response.status()
            )));
        }

        let data = response
            .bytes()
            .await
            .map_err(|e| ImageCacheError::OriginUnavailable(e.to_string()))?
            .to_vec();

        debug!(url, size = data.len(), "Fetched origin image");
        Ok(data)
    }
}
