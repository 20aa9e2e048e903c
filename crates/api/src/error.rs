use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use sketchforge_core::error::CoreError;
use sketchforge_providers::ProviderError;
use sketchforge_worker::QueueError;

/// Application-level error type for HTTP handlers.
///
/// Wraps the domain errors of the crates below and adds HTTP-specific
/// variants. Implements [`IntoResponse`] to produce consistent JSON error
/// responses.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// A bad request with a human-readable message.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// An internal error with a human-readable message.
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Convenience type alias for handler return values.
pub type AppResult<T> = Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            // --- CoreError variants ---
            AppError::Core(core) => match core {
                CoreError::NotFound { .. } => {
                    (StatusCode::NOT_FOUND, "NOT_FOUND", core.to_string())
                }
                CoreError::InvalidInput(msg) => {
                    (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
                }
                CoreError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
                CoreError::Internal(msg) => internal(msg),
            },

            // --- Queue errors ---
            AppError::Queue(queue) => match queue {
                QueueError::NotFound(_) => {
                    (StatusCode::NOT_FOUND, "NOT_FOUND", queue.to_string())
                }
                QueueError::InvalidInput(msg) => {
                    (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
                }
                QueueError::NotReady { .. } => {
                    (StatusCode::BAD_REQUEST, "NOT_READY", queue.to_string())
                }
                QueueError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
                QueueError::QueueFull { .. } => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "QUEUE_FULL",
                    queue.to_string(),
                ),
            },

            // --- Provider errors ---
            AppError::Provider(provider) => match provider {
                ProviderError::NotFound(_) => {
                    (StatusCode::NOT_FOUND, "NOT_FOUND", provider.to_string())
                }
                ProviderError::Duplicate(_) => {
                    (StatusCode::CONFLICT, "CONFLICT", provider.to_string())
                }
                ProviderError::InvalidConfig { .. } => {
                    (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", provider.to_string())
                }
                ProviderError::NoProviderAvailable => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "NO_PROVIDER_AVAILABLE",
                    provider.to_string(),
                ),
                ProviderError::RateLimited { .. } => (
                    StatusCode::TOO_MANY_REQUESTS,
                    "RATE_LIMITED",
                    provider.to_string(),
                ),
            },

            // --- HTTP-specific errors ---
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            AppError::InternalError(msg) => internal(msg),
        };

        let body = json!({
            "error": message,
            "code": code,
        });

        (status, axum::Json(body)).into_response()
    }
}

/// Log the detail, hand the client a sanitized message.
fn internal(detail: &str) -> (StatusCode, &'static str, String) {
    tracing::error!(error = %detail, "Internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_ERROR",
        "An internal error occurred".to_string(),
    )
}
