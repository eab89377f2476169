//! API error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use shroud_core::DetectError;

/// API errors.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Models have not been loaded yet.
    #[error("models are not loaded")]
    ModelsNotLoaded,

    /// The request image could not be decoded.
    #[error("invalid image: {0}")]
    InvalidImage(String),

    /// Bad request.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Model loading failed.
    #[error("model load failed: {0}")]
    ModelLoad(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<DetectError> for ApiError {
    fn from(e: DetectError) -> Self {
        match e {
            DetectError::ModelsNotLoaded => ApiError::ModelsNotLoaded,
            DetectError::InvalidImage(msg) => ApiError::InvalidImage(msg),
            DetectError::ModelLoad(e) => ApiError::ModelLoad(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::ModelsNotLoaded => (StatusCode::SERVICE_UNAVAILABLE, "models_not_loaded"),
            ApiError::InvalidImage(_) => (StatusCode::BAD_REQUEST, "invalid_image"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::ModelLoad(_) => (StatusCode::INTERNAL_SERVER_ERROR, "model_load_error"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let body = ErrorResponse {
            error: self.to_string(),
            code: code.to_string(),
        };

        (status, axum::Json(body)).into_response()
    }
}

/// Result type for API operations.
pub type Result<T> = std::result::Result<T, ApiError>;
