//! The pluggable generation capability.
//!
//! A backend knows how to talk to one kind of inference service. It does no
//! rate limiting, cost accounting or status tracking; the invoker wraps it
//! with all of that.

use std::time::Duration;

use async_trait::async_trait;
use sketchforge_core::generation::{GeneratedImage, GenerationParams, ImageFormat};

/// Everything a backend needs to produce one image.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub model: String,
    /// Prompt with any style modifier already applied.
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub sketch: Vec<u8>,
    pub sketch_format: ImageFormat,
    /// Width and height are always filled in.
    pub params: GenerationParams,
    pub output_format: ImageFormat,
}

#[derive(Debug, Clone)]
pub struct BackendOutput {
    pub image: GeneratedImage,
    /// Model the service reports having used, when it says.
    pub model: Option<String>,
    pub quality_score: Option<f32>,
}

/// Raw failure from a backend, before provider context is attached.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },

    /// The service refused the request itself (4xx other than 429).
    #[error("Request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// Network failure or 5xx.
    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Request timed out")]
    Timeout,

    /// The service answered 2xx but the body was unusable.
    #[error("Malformed response: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn generate(&self, request: &BackendRequest) -> Result<BackendOutput, BackendError>;

    /// Lightweight reachability check used by health checks.
    async fn probe(&self) -> bool;
}
