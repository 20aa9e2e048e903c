//! Turns a [`GenerationRequest`] into one classified provider call.
//!
//! The invoker never touches the cache. It checks the request against the
//! provider's declared capabilities, takes a rate-limit permit, runs the
//! backend under the provider's timeout and normalizes the outcome.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use sketchforge_core::generation::{
    GenerationRequest, GenerationResult, ImageFormat, ResultStatus,
};

use crate::backend::{BackendError, BackendRequest};
use crate::descriptor::ProviderStatus;
use crate::error::InvokeError;
use crate::registry::{ProviderEntry, ProviderRegistry};

pub struct ProviderInvoker {
    registry: Arc<ProviderRegistry>,
}

impl ProviderInvoker {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Generate `request` on `provider_id`.
    pub async fn invoke(
        &self,
        provider_id: &str,
        request: &GenerationRequest,
    ) -> Result<GenerationResult, InvokeError> {
        let entry = self
            .registry
            .entry(provider_id)
            .map_err(|_| InvokeError::NotFound(provider_id.to_string()))?;

        match entry.status() {
            ProviderStatus::Online => {}
            ProviderStatus::Offline if entry.tripped() => {}
            ProviderStatus::RateLimited => {
                return Err(InvokeError::RateLimited {
                    provider_id: provider_id.to_string(),
                    retry_after: entry
                        .rate_limited_for()
                        .unwrap_or(self.registry.windows().minute),
                });
            }
            status @ (ProviderStatus::Offline | ProviderStatus::Maintenance) => {
                return Err(InvokeError::ProviderUnavailable {
                    provider_id: provider_id.to_string(),
                    message: format!("provider is {}", status_label(status)),
                });
            }
        }

        let backend_request = check_capabilities(&entry, request)?;

        let _permit =
            entry
                .limiter
                .try_acquire()
                .map_err(|retry_after| InvokeError::RateLimited {
                    provider_id: provider_id.to_string(),
                    retry_after,
                })?;

        let timeout = entry.config.timeout();
        let started = Instant::now();
        tracing::debug!(
            job_id = %request.id,
            provider_id,
            model = %backend_request.model,
            "Invoking provider",
        );

        let outcome =
            tokio::time::timeout(timeout, entry.backend.generate(&backend_request)).await;
        let elapsed = started.elapsed();

        let output = match outcome {
            Err(_) => {
                return Err(InvokeError::Timeout {
                    provider_id: provider_id.to_string(),
                    elapsed,
                })
            }
            Ok(Err(e)) => return Err(self.classify(provider_id, e, elapsed)),
            Ok(Ok(output)) => output,
        };

        self.registry.mark_recovered(provider_id);
        let cost = entry.charge();
        tracing::info!(
            job_id = %request.id,
            provider_id,
            elapsed_ms = elapsed.as_millis() as u64,
            cost,
            "Provider generation succeeded",
        );

        Ok(GenerationResult {
            request_id: request.id,
            status: ResultStatus::Completed,
            image: Some(output.image),
            failure: None,
            provider_id: Some(provider_id.to_string()),
            model: Some(output.model.unwrap_or(backend_request.model)),
            parameters: Some(backend_request.params),
            processing_time_ms: elapsed.as_millis() as u64,
            cost,
            cache_hit: false,
            quality_score: output.quality_score,
            completed_at: Utc::now(),
        })
    }

    /// Attach provider context to a backend failure and update the
    /// provider's status where the failure says something about it.
    fn classify(
        &self,
        provider_id: &str,
        error: BackendError,
        elapsed: std::time::Duration,
    ) -> InvokeError {
        tracing::warn!(provider_id, error = %error, "Provider call failed");
        match error {
            BackendError::RateLimited { retry_after } => {
                let retry_after = retry_after.unwrap_or(self.registry.windows().minute);
                self.registry.mark_rate_limited(provider_id, retry_after);
                InvokeError::RateLimited {
                    provider_id: provider_id.to_string(),
                    retry_after,
                }
            }
            BackendError::Rejected { status, message } => InvokeError::InvalidRequest {
                provider_id: provider_id.to_string(),
                message: format!("provider rejected the request ({status}): {message}"),
                remediation: Some(
                    "Check the prompt and parameters against the provider's limits".to_string(),
                ),
            },
            BackendError::Unavailable(message) | BackendError::Malformed(message) => {
                self.registry.mark_offline(provider_id, &message);
                InvokeError::ProviderUnavailable {
                    provider_id: provider_id.to_string(),
                    message,
                }
            }
            BackendError::Timeout => InvokeError::Timeout {
                provider_id: provider_id.to_string(),
                elapsed,
            },
        }
    }
}

fn status_label(status: ProviderStatus) -> &'static str {
    match status {
        ProviderStatus::Online => "online",
        ProviderStatus::Offline => "offline",
        ProviderStatus::Maintenance => "in maintenance",
        ProviderStatus::RateLimited => "rate limited",
    }
}

/// Check the request against the provider's declared limits and build the
/// backend request.
fn check_capabilities(
    entry: &ProviderEntry,
    request: &GenerationRequest,
) -> Result<BackendRequest, InvokeError> {
    let config = &entry.config;
    let caps = config.capabilities();
    let invalid = |message: String, remediation: String| InvokeError::InvalidRequest {
        provider_id: config.id().to_string(),
        message,
        remediation: Some(remediation),
    };

    if !caps.image_to_image {
        return Err(invalid(
            "provider does not support image-to-image generation".to_string(),
            "Choose a provider that supports image-to-image".to_string(),
        ));
    }

    let prompt = request.effective_prompt();
    let prompt_len = prompt.chars().count();
    if prompt_len > caps.max_prompt_length {
        return Err(invalid(
            format!(
                "prompt is {prompt_len} characters; provider accepts at most {}",
                caps.max_prompt_length
            ),
            format!(
                "Shorten the prompt to {} characters or fewer",
                caps.max_prompt_length
            ),
        ));
    }

    let (width, height) = request.output_size();
    if width > caps.max_width || height > caps.max_height {
        return Err(invalid(
            format!(
                "requested {width}x{height}; provider supports at most {}x{}",
                caps.max_width, caps.max_height
            ),
            format!(
                "Request an output size of at most {}x{}",
                caps.max_width, caps.max_height
            ),
        ));
    }

    if let Some(max_cost) = request.max_cost {
        let cost = entry.quoted_cost();
        if cost > max_cost {
            return Err(invalid(
                format!("generation costs {cost:.4}, above the ceiling of {max_cost:.4}"),
                format!("Raise max_cost to at least {cost:.4} or choose a cheaper provider"),
            ));
        }
    }

    let output_format = if caps.supported_formats.contains(&ImageFormat::Png) {
        ImageFormat::Png
    } else {
        caps.supported_formats
            .first()
            .copied()
            .unwrap_or(ImageFormat::Png)
    };

    Ok(BackendRequest {
        model: config.model().to_string(),
        prompt,
        negative_prompt: request.negative_prompt().map(str::to_string),
        sketch: request.sketch.bytes.clone(),
        sketch_format: request.sketch.format,
        params: request.effective_params(),
        output_format,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
