use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::AcquireError;

#[derive(Debug, Clone, Error)]
pub enum ScreenshotError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Blocked: {0}")]
    Blocked(String),

    #[error("Rate limit exceeded, retry after {0:?}")]
    RateLimited(Duration),

    #[error("Screenshot not cached")]
    NotCached,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Method not allowed")]
    MethodNotAllowed,

    #[error("Render timed out after {0:?}")]
    RenderTimeout(Duration),

    #[error("Render failed: {0}")]
    RenderFailed(String),

    #[error("Image encoding failed: {0}")]
    EncodeFailed(String),

    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Browser instance unavailable")]
    BrowserUnavailable,

    #[error("Browser launch failed: {0}")]
    BrowserLaunchFailed(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Semaphore acquire error: {0}")]
    SemaphoreError(String),
}

impl ScreenshotError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ScreenshotError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ScreenshotError::Blocked(_) => StatusCode::FORBIDDEN,
            ScreenshotError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            ScreenshotError::NotCached | ScreenshotError::NotFound(_) => StatusCode::NOT_FOUND,
            ScreenshotError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short machine-readable label used in JSON error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            ScreenshotError::InvalidInput(_) => "invalid_input",
            ScreenshotError::Blocked(_) => "blocked",
            ScreenshotError::RateLimited(_) => "rate_limited",
            ScreenshotError::NotCached => "not_cached",
            ScreenshotError::NotFound(_) => "not_found",
            ScreenshotError::MethodNotAllowed => "method_not_allowed",
            ScreenshotError::RenderTimeout(_) => "render_timeout",
            ScreenshotError::RenderFailed(_) => "render_failed",
            ScreenshotError::EncodeFailed(_) => "encode_failed",
            ScreenshotError::UploadFailed(_) => "upload_failed",
            ScreenshotError::BrowserUnavailable | ScreenshotError::BrowserLaunchFailed(_) => {
                "browser_unavailable"
            }
            ScreenshotError::StorageError(_) => "storage_error",
            _ => "internal_error",
        }
    }

    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }
}

impl IntoResponse for ScreenshotError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": self.kind(),
            "message": self.to_string(),
        }));

        let mut response = (status, body).into_response();
        if let ScreenshotError::RateLimited(retry_after) = &self {
            let secs = retry_after.as_secs().max(1);
            if let Ok(value) = axum::http::HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(axum::http::header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<AcquireError> for ScreenshotError {
    fn from(err: AcquireError) -> Self {
        ScreenshotError::SemaphoreError(err.to_string())
    }
}

impl From<std::io::Error> for ScreenshotError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            ScreenshotError::NotFound(err.to_string())
        } else {
            ScreenshotError::StorageError(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ScreenshotError {
    fn from(err: serde_json::Error) -> Self {
        ScreenshotError::SerializationError(err.to_string())
    }
}
