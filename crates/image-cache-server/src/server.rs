//! HTTP server for the image cache
//!
//! Provides /health, /image, /srcset and the static route serving stored
//! assets under the configured public path.

use crate::error::{Result, ServerError};
use crate::types::{
    HealthResponse, ImageQuery, PurgeQuery, PurgeResponse, SrcSetQuery, SrcSetResponse,
};
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderName},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use image_transform_cache::{
    parse_breakpoints, ImageCache, ImageCacheError, ImageFormat, TransformOptions,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

const CACHE_CONTROL: &str = "public, max-age=86400";
const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

/// Shared state for the HTTP server
pub struct ServerState {
    pub cache: ImageCache,
    pub started_at: DateTime<Utc>,
}

impl ServerState {
    pub fn new(cache: ImageCache) -> Self {
        Self {
            cache,
            started_at: Utc::now(),
        }
    }
}

pub type SharedState = Arc<ServerState>;

/// Create the HTTP router
pub fn create_router(state: SharedState) -> Router {
    let asset_route = format!("{}/{{file}}", state.cache.config().public_path);
    Router::new()
        .route("/health", get(health))
        .route("/image", get(get_image).delete(purge_image))
        .route("/srcset", get(get_srcset))
        .route(&asset_route, get(get_asset))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server
pub async fn start_server(state: SharedState, port: u16) -> std::io::Result<()> {
    let router = create_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await
}

/// Health check endpoint
async fn health(State(state): State<SharedState>) -> Result<Json<HealthResponse>> {
    let cache_stats = state.cache.stats().await?;
    let uptime_secs = (Utc::now() - state.started_at).num_seconds().max(0) as u64;

    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs,
        cache: cache_stats,
        sweeper: state.cache.sweeper().state(),
    }))
}

fn options_from_query(cache: &ImageCache, query: &ImageQuery) -> Result<TransformOptions> {
    let mut options = cache.default_options();
    if let Some(format) = &query.format {
        options.format = format.parse::<ImageFormat>()?;
    }
    if let Some(quality) = query.q {
        options.quality = quality;
    }
    options.width = query.w;
    options.height = query.h;
    Ok(options)
}

/// Transformed image for `?url=`, filled on first request
async fn get_image(
    State(state): State<SharedState>,
    Query(query): Query<ImageQuery>,
) -> Result<Response> {
    let options = options_from_query(&state.cache, &query)?;
    let resolved = state.cache.resolve(&query.url, options).await?;
    let data = state.cache.read(&resolved.storage_path).await?;
    let cache_header = if resolved.hit { "HIT" } else { "MISS" };

    Ok((
        [
            (header::CONTENT_TYPE, options.format.content_type()),
            (header::CACHE_CONTROL, CACHE_CONTROL),
            (X_CACHE, cache_header),
        ],
        data,
    )
        .into_response())
}

/// Responsive set for `?url=`, at `widths` or the configured breakpoints
async fn get_srcset(
    State(state): State<SharedState>,
    Query(query): Query<SrcSetQuery>,
) -> Result<Json<SrcSetResponse>> {
    let widths = match &query.widths {
        Some(raw) => parse_breakpoints(raw).ok_or_else(|| {
            ImageCacheError::InvalidInput(format!("invalid widths: {}", raw))
        })?,
        None => state.cache.config().breakpoints.clone(),
    };

    let paths = state.cache.get_responsive_set(&query.url, &widths).await?;
    let srcset = state.cache.format_src_set(&paths, &widths);
    Ok(Json(SrcSetResponse { srcset, paths }))
}

/// Drop every cached variant of `?url=`
async fn purge_image(
    State(state): State<SharedState>,
    Query(query): Query<PurgeQuery>,
) -> Result<Json<PurgeResponse>> {
    let removed = state.cache.purge(&query.url).await?;
    Ok(Json(PurgeResponse { removed }))
}

/// Serve a stored asset by its storage path
async fn get_asset(
    State(state): State<SharedState>,
    Path(file): Path<String>,
) -> Result<Response> {
    let format =
        ImageFormat::from_path(&file).ok_or_else(|| ServerError::NotFound(file.clone()))?;

    let data = match state.cache.read(&file).await {
        Ok(data) => data,
        Err(ImageCacheError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ServerError::NotFound(file));
        }
        Err(ImageCacheError::InvalidInput(_)) => {
            warn!(file = %file, "Rejected asset path");
            return Err(ServerError::NotFound(file));
        }
        Err(e) => return Err(e.into()),
    };

    Ok((
        [
            (header::CONTENT_TYPE, format.content_type()),
            (header::CACHE_CONTROL, CACHE_CONTROL),
        ],
        data,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use image_transform_cache::{
        CacheConfig, FsAssetStore, OriginFetcher, SqliteMetadataStore, Transformer,
    };
    use std::path::Path as FsPath;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::tempdir;
    use tower::ServiceExt;

    const SOURCE: &str = "https://example.com/a.jpg";

    #[derive(Default)]
    struct StubOrigin {
        calls: AtomicUsize,
        fail: AtomicBool,
    }

    #[async_trait]
    impl OriginFetcher for StubOrigin {
        async fn fetch(&self, url: &str) -> image_transform_cache::Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(ImageCacheError::OriginUnavailable(format!(
                    "origin returned status 404 for {}",
                    url
                )));
            }
            Ok(b"source".to_vec())
        }
    }

    /// Tags the payload with the requested width
    struct StubTransformer;

    #[async_trait]
    impl Transformer for StubTransformer {
        async fn transform(
            &self,
            bytes: Vec<u8>,
            options: &TransformOptions,
        ) -> image_transform_cache::Result<Vec<u8>> {
            let mut out = format!("w={:?};", options.width).into_bytes();
            out.extend_from_slice(&bytes);
            Ok(out)
        }
    }

    async fn create_test_state(dir: &FsPath, origin: Arc<StubOrigin>) -> SharedState {
        let config = CacheConfig {
            cache_dir: dir.join("assets"),
            database_url: format!("sqlite://{}", dir.join("meta.db").display()),
            ..CacheConfig::default()
        };

        let metadata = SqliteMetadataStore::connect(&config.database_url)
            .await
            .unwrap();
        metadata.migrate().await.unwrap();
        let assets = FsAssetStore::new(config.cache_dir.clone());
        assets.init().await.unwrap();

        let cache = ImageCache::new(
            config,
            Arc::new(metadata),
            Arc::new(assets),
            origin,
            Arc::new(StubTransformer),
        );
        Arc::new(ServerState::new(cache))
    }

    async fn get(router: Router, uri: &str) -> Response {
        router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        serde_json::from_slice(&body_bytes(response).await).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let dir = tempdir().unwrap();
        let state = create_test_state(dir.path(), Arc::default()).await;
        let router = create_router(state);

        let response = get(router, "/health").await;

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert!(json["uptime_secs"].as_u64().is_some());
        assert_eq!(json["cache"]["entries"], 0);
        assert_eq!(json["sweeper"], "idle");
    }

    #[tokio::test]
    async fn test_image_miss_then_hit() {
        let dir = tempdir().unwrap();
        let origin = Arc::new(StubOrigin::default());
        let state = create_test_state(dir.path(), origin.clone()).await;
        let router = create_router(state);
        let uri = format!("/image?url={}&w=320", SOURCE);

        let first = get(router.clone(), &uri).await;
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.headers()["x-cache"], "MISS");
        assert_eq!(first.headers()[header::CONTENT_TYPE], "image/webp");
        assert_eq!(body_bytes(first).await, b"w=Some(320);source");

        let second = get(router, &uri).await;
        assert_eq!(second.headers()["x-cache"], "HIT");
        assert_eq!(origin.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_image_format_from_query() {
        let dir = tempdir().unwrap();
        let state = create_test_state(dir.path(), Arc::default()).await;
        let router = create_router(state);

        let response = get(router, &format!("/image?url={}&format=avif&q=50", SOURCE)).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/avif");
    }

    #[tokio::test]
    async fn test_image_invalid_input() {
        let dir = tempdir().unwrap();
        let origin = Arc::new(StubOrigin::default());
        let state = create_test_state(dir.path(), origin.clone()).await;
        let router = create_router(state);

        let bad_url = get(router.clone(), "/image?url=ftp://example.com/a.jpg").await;
        assert_eq!(bad_url.status(), StatusCode::BAD_REQUEST);

        let bad_format = get(router.clone(), &format!("/image?url={}&format=gif", SOURCE)).await;
        assert_eq!(bad_format.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(bad_format).await["error"]
            .as_str()
            .unwrap()
            .contains("gif"));

        let bad_quality = get(router, &format!("/image?url={}&q=0", SOURCE)).await;
        assert_eq!(bad_quality.status(), StatusCode::BAD_REQUEST);

        assert_eq!(origin.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_image_origin_unavailable() {
        let dir = tempdir().unwrap();
        let origin = Arc::new(StubOrigin::default());
        origin.fail.store(true, Ordering::SeqCst);
        let state = create_test_state(dir.path(), origin).await;
        let router = create_router(state);

        let response = get(router, &format!("/image?url={}", SOURCE)).await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_srcset_endpoint() {
        let dir = tempdir().unwrap();
        let state = create_test_state(dir.path(), Arc::default()).await;
        let router = create_router(state);

        let response = get(router, &format!("/srcset?url={}&widths=320,640", SOURCE)).await;

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        let paths = json["paths"].as_array().unwrap();
        assert_eq!(paths.len(), 2);
        assert_eq!(
            json["srcset"],
            format!(
                "/image-cache/{} 320w, /image-cache/{} 640w",
                paths[0].as_str().unwrap(),
                paths[1].as_str().unwrap()
            )
        );
    }

    #[tokio::test]
    async fn test_srcset_default_breakpoints() {
        let dir = tempdir().unwrap();
        let state = create_test_state(dir.path(), Arc::default()).await;
        let router = create_router(state);

        let response = get(router, &format!("/srcset?url={}", SOURCE)).await;

        let json = body_json(response).await;
        assert_eq!(json["paths"].as_array().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_srcset_invalid_widths() {
        let dir = tempdir().unwrap();
        let state = create_test_state(dir.path(), Arc::default()).await;
        let router = create_router(state);

        let response = get(router, &format!("/srcset?url={}&widths=320,big", SOURCE)).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_asset_route_serves_stored_file() {
        let dir = tempdir().unwrap();
        let state = create_test_state(dir.path(), Arc::default()).await;
        let path = state
            .cache
            .get_or_create(SOURCE, TransformOptions::new(ImageFormat::Png, 80))
            .await
            .unwrap();
        let router = create_router(state);

        let response = get(router.clone(), &format!("/image-cache/{}", path)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
        assert_eq!(body_bytes(response).await, b"w=None;source");

        let missing = get(router.clone(), "/image-cache/deadbeef.webp").await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let unknown = get(router, "/image-cache/notes.txt").await;
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_purge_endpoint() {
        let dir = tempdir().unwrap();
        let state = create_test_state(dir.path(), Arc::default()).await;
        state
            .cache
            .get_responsive_set(SOURCE, &[320, 640])
            .await
            .unwrap();
        let router = create_router(state.clone());

        let response = router
            .oneshot(
                Request::builder()
                    .method(Method::DELETE)
                    .uri(format!("/image?url={}", SOURCE))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["removed"], 2);
        assert_eq!(state.cache.stats().await.unwrap().entries, 0);
    }

    #[tokio::test]
    async fn test_server_state_new() {
        let dir = tempdir().unwrap();
        let state = create_test_state(dir.path(), Arc::default()).await;

        let diff = (Utc::now() - state.started_at).num_seconds();
        assert!((0..5).contains(&diff));
    }
}
