//! Generic JSON-over-HTTP generation backend.
//!
//! Speaks a small image-to-image protocol:
//!
//! - `POST {api_url}/v1/generate` with the prompt, parameters and the
//!   base64-encoded sketch; answers `{"image": "<base64>", "model": ...,
//!   "quality_score": ...}`.
//! - `GET {api_url}/health` for reachability probes.
//!
//! Hosted providers authenticate with a bearer token.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sketchforge_core::generation::{probe_header, GeneratedImage};

use crate::backend::{BackendError, BackendOutput, BackendRequest, GenerationBackend};
use crate::descriptor::ProviderConfig;

/// Timeout applied to health probes.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP client for one provider endpoint.
pub struct HttpBackend {
    client: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

#[derive(Debug, Serialize)]
struct GenerateBody<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    negative_prompt: Option<&'a str>,
    init_image: String,
    init_image_format: &'static str,
    strength: f32,
    steps: u32,
    guidance: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    width: Option<u32>,
    height: Option<u32>,
    output_format: &'static str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    image: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    quality_score: Option<f32>,
}

impl HttpBackend {
    pub fn new(api_url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Self {
        Self::with_client(reqwest::Client::new(), api_url, api_key, timeout)
    }

    /// Reuse an existing [`reqwest::Client`] so providers share a
    /// connection pool.
    pub fn with_client(
        client: reqwest::Client,
        api_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            api_key,
            timeout,
        }
    }

    /// Backend for a registered provider configuration.
    pub fn from_config(client: reqwest::Client, config: &ProviderConfig) -> Self {
        Self::with_client(
            client,
            config.api_url(),
            config.api_key().map(str::to_string),
            config.timeout(),
        )
    }

    // ---- private helpers ----

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// Map a non-2xx response onto a [`BackendError`].
    async fn classify_failure(response: reqwest::Response) -> BackendError {
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            return BackendError::RateLimited { retry_after };
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        if status.is_client_error() {
            BackendError::Rejected {
                status: status.as_u16(),
                message: body,
            }
        } else {
            BackendError::Unavailable(format!("{status}: {body}"))
        }
    }
}

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn map_transport_error(e: reqwest::Error) -> BackendError {
    if e.is_timeout() {
        BackendError::Timeout
    } else {
        BackendError::Unavailable(e.to_string())
    }
}

#[async_trait]
impl GenerationBackend for HttpBackend {
    async fn generate(&self, request: &BackendRequest) -> Result<BackendOutput, BackendError> {
        let body = GenerateBody {
            model: &request.model,
            prompt: &request.prompt,
            negative_prompt: request.negative_prompt.as_deref(),
            init_image: BASE64.encode(&request.sketch),
            init_image_format: request.sketch_format.as_str(),
            strength: request.params.strength,
            steps: request.params.steps,
            guidance: request.params.guidance,
            seed: request.params.seed,
            width: request.params.width,
            height: request.params.height,
            output_format: request.output_format.as_str(),
        };

        let response = self
            .authorize(self.client.post(format!("{}/v1/generate", self.api_url)))
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;

        if !response.status().is_success() {
            return Err(Self::classify_failure(response).await);
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Malformed(e.to_string()))?;
        let bytes = BASE64
            .decode(parsed.image.as_bytes())
            .map_err(|e| BackendError::Malformed(format!("image is not base64: {e}")))?;
        let (format, width, height) =
            probe_header(&bytes).map_err(|e| BackendError::Malformed(e.to_string()))?;

        Ok(BackendOutput {
            image: GeneratedImage {
                bytes,
                format,
                width,
                height,
            },
            model: parsed.model,
            quality_score: parsed.quality_score,
        })
    }

    async fn probe(&self) -> bool {
        let result = self
            .authorize(self.client.get(format!("{}/health", self.api_url)))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await;

        match result {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(api_url = %self.api_url, error = %e, "Provider probe failed");
                false
            }
        }
    }
}
