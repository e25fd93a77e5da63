//! Error types for the image transformation cache

use std::fmt;

#[derive(Debug)]
pub enum ImageCacheError {
    /// Malformed source URL or transform options
    InvalidInput(String),
    /// Origin fetch failed; never cached as a negative result
    OriginUnavailable(String),
    /// The pipeline rejected otherwise valid bytes
    TransformationFailed(String),
    Database(Box<sqlx::Error>),
    Io(Box<std::io::Error>),
}

impl ImageCacheError {
    /// True for metadata or asset persistence failures
    pub fn is_storage_failure(&self) -> bool {
        matches!(self, ImageCacheError::Database(_) | ImageCacheError::Io(_))
    }
}

impl fmt::Display for ImageCacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageCacheError::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            ImageCacheError::OriginUnavailable(msg) => write!(f, "Origin unavailable: {}", msg),
            ImageCacheError::TransformationFailed(msg) => {
                write!(f, "Transformation failed: {}", msg)
            }
            ImageCacheError::Database(err) => write!(f, "Storage failure (database): {}", err),
            ImageCacheError::Io(err) => write!(f, "Storage failure (io): {}", err),
        }
    }
}

impl std::error::Error for ImageCacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ImageCacheError::Database(err) => Some(err.as_ref()),
            ImageCacheError::Io(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for ImageCacheError {
    fn from(err: sqlx::Error) -> Self {
        ImageCacheError::Database(Box::new(err))
    }
}

impl From<sqlx::migrate::MigrateError> for ImageCacheError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        ImageCacheError::Database(Box::new(sqlx::Error::Migrate(Box::new(err))))
    }
}

impl From<std::io::Error> for ImageCacheError {
    fn from(err: std::io::Error) -> Self {
        ImageCacheError::Io(Box::new(err))
    }
}

impl From<image::ImageError> for ImageCacheError {
    fn from(err: image::ImageError) -> Self {
        ImageCacheError::TransformationFailed(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ImageCacheError>;
