//! Error types for the image cache server

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use image_transform_cache::ImageCacheError;
use serde_json::json;
use std::fmt;

#[derive(Debug)]
pub enum ServerError {
    Cache(ImageCacheError),
    NotFound(String),
    Io(Box<std::io::Error>),
    Config(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Cache(err) => write!(f, "Cache error: {}", err),
            ServerError::NotFound(msg) => write!(f, "Not found: {}", msg),
            ServerError::Io(err) => write!(f, "IO error: {}", err),
            ServerError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Cache(err) => Some(err),
            ServerError::Io(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<ImageCacheError> for ServerError {
    fn from(err: ImageCacheError) -> Self {
        ServerError::Cache(err)
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        ServerError::Io(Box::new(err))
    }
}

impl From<tracing_subscriber::filter::ParseError> for ServerError {
    fn from(err: tracing_subscriber::filter::ParseError) -> Self {
        ServerError::Config(err.to_string())
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ServerError::Cache(ImageCacheError::InvalidInput(msg)) => {
                (StatusCode::BAD_REQUEST, msg)
            }
            ServerError::Cache(ImageCacheError::OriginUnavailable(msg)) => {
                tracing::warn!(error = %msg, "Origin unavailable");
                (StatusCode::BAD_GATEWAY, "Origin unavailable".into())
            }
            ServerError::Cache(ImageCacheError::TransformationFailed(msg)) => {
                (StatusCode::UNPROCESSABLE_ENTITY, msg)
            }
            ServerError::NotFound(_) => (StatusCode::NOT_FOUND, "Not found".into()),
            other => {
                tracing::error!(error = %other, "Internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".into(),
                )
            }
        };

        (status, axum::Json(json!({ "error": message }))).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
