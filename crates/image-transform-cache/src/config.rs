use crate::types::ImageFormat;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_QUALITY: u8 = 80;
pub const DEFAULT_FORMAT: ImageFormat = ImageFormat::Webp;
pub const DEFAULT_RETENTION_DAYS: u64 = 7;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_BREAKPOINTS: [u32; 5] = [320, 640, 768, 1024, 1280];

/// Cache configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub cache_dir: PathBuf,
    pub database_url: String,
    pub default_quality: u8,
    pub default_format: ImageFormat,
    /// Entries unaccessed for longer than this are evicted
    pub retention: Duration,
    pub sweep_interval: Duration,
    pub breakpoints: Vec<u32>,
    /// URL prefix under which stored assets are served, used for srcset output
    pub public_path: String,
    pub origin_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("./cache/images"),
            database_url: "sqlite://./cache/image-cache.db".to_string(),
            default_quality: DEFAULT_QUALITY,
            default_format: DEFAULT_FORMAT,
            retention: Duration::from_secs(DEFAULT_RETENTION_DAYS * 24 * 60 * 60),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            breakpoints: DEFAULT_BREAKPOINTS.to_vec(),
            public_path: "/image-cache".to_string(),
            origin_timeout: Duration::from_secs(30),
        }
    }
}

fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// Retention window for a day count, `None` if it does not fit a `Duration`
pub fn retention_from_days(days: u64) -> Option<Duration> {
    days.checked_mul(24 * 60 * 60).map(Duration::from_secs)
}

/// Parse a comma-separated list of positive widths
pub fn parse_breakpoints(raw: &str) -> Option<Vec<u32>> {
    let widths: Vec<u32> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().ok().filter(|w: &u32| *w > 0))
        .collect::<Option<_>>()?;
    if widths.is_empty() {
        None
    } else {
        Some(widths)
    }
}

impl CacheConfig {
    /// Parse configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let cache_dir = env::var("CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.cache_dir);

        let database_url = env::var("CACHE_DATABASE_URL").unwrap_or(defaults.database_url);

        let default_quality = parse_var::<u8>("CACHE_DEFAULT_QUALITY")
            .map(|q| q.clamp(1, 100))
            .unwrap_or(defaults.default_quality);

        let default_format =
            parse_var::<ImageFormat>("CACHE_DEFAULT_FORMAT").unwrap_or(defaults.default_format);

        let retention = parse_var::<u64>("CACHE_RETENTION_DAYS")
            .and_then(retention_from_days)
            .unwrap_or(defaults.retention);

        let sweep_interval = parse_var::<u64>("CACHE_SWEEP_INTERVAL_SECS")
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.sweep_interval);

        let breakpoints = env::var("CACHE_BREAKPOINTS")
            .ok()
            .and_then(|raw| parse_breakpoints(&raw))
            .unwrap_or(defaults.breakpoints);

        let public_path = env::var("CACHE_PUBLIC_PATH")
            .map(|p| p.trim_end_matches('/').to_string())
            .unwrap_or(defaults.public_path);

        let origin_timeout = parse_var::<u64>("ORIGIN_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.origin_timeout);

        Self {
            cache_dir,
            database_url,
            default_quality,
            default_format,
            retention,
            sweep_interval,
            breakpoints,
            public_path,
            origin_timeout,
        }
    }
}
