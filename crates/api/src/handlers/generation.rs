//! Handlers for submitting, tracking and cancelling generations.

use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sketchforge_core::generation::{
    CompositionHints, GenerationParams, GenerationRequest, SketchImage, StylePreset,
};
use sketchforge_core::scheduling::{JobState, Priority};
use sketchforge_core::types::JobId;

use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// DTOs
// ---------------------------------------------------------------------------

/// Request body for POST /generate and POST /estimate-cost.
#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    /// Base64-encoded sketch, optionally as a `data:` URL.
    pub sketch: String,
    pub prompt: String,
    #[serde(default)]
    pub palette: Vec<String>,
    pub style: Option<StylePreset>,
    #[serde(default)]
    pub hints: CompositionHints,
    #[serde(default)]
    pub params: GenerationParams,
    pub provider_id: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    pub max_cost: Option<f64>,
}

impl GenerateRequest {
    fn into_request(self) -> AppResult<GenerationRequest> {
        let encoded = match self.sketch.split_once(',') {
            Some((prefix, data)) if prefix.starts_with("data:") => data,
            _ => self.sketch.as_str(),
        };
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| AppError::BadRequest(format!("Sketch is not valid base64: {e}")))?;
        let sketch = SketchImage::from_bytes(bytes, self.palette)?;

        let mut request = GenerationRequest::new(sketch, self.prompt)
            .with_hints(self.hints)
            .with_params(self.params)
            .with_priority(self.priority);
        if let Some(style) = self.style {
            request = request.with_style(style);
        }
        if let Some(provider_id) = self.provider_id {
            request = request.with_provider(provider_id);
        }
        if let Some(max_cost) = self.max_cost {
            request = request.with_max_cost(max_cost);
        }
        Ok(request)
    }
}

/// Response for POST /generate.
#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub job_id: JobId,
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_wait_secs: Option<u64>,
}

/// Response for DELETE /generation/{job_id}.
#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub job_id: JobId,
    pub cancelled: bool,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST /generate
///
/// Validate and queue a generation. Returns 202 with the job id; progress
/// arrives over `/ws` and `/status/{job_id}`.
pub async fn generate(
    State(state): State<AppState>,
    Json(input): Json<GenerateRequest>,
) -> AppResult<impl IntoResponse> {
    let request = input.into_request()?;
    let job_id = state.queue.enqueue(request)?;
    let status = state.queue.status(job_id)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(DataResponse {
            data: GenerateResponse {
                job_id,
                state: status.state,
                position: status.position,
                estimated_wait_secs: status.estimated_wait_secs,
            },
        }),
    ))
}

/// GET /status/{job_id}
pub async fn get_status(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<impl IntoResponse> {
    let status = state.queue.status(job_id)?;
    Ok(Json(DataResponse { data: status }))
}

/// GET /result/{job_id}
///
/// The generated image bytes with their content type. 400 until the job
/// has completed.
pub async fn get_result(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<impl IntoResponse> {
    let image = state.queue.result_image(job_id)?;
    Ok(([(CONTENT_TYPE, image.format.mime_type())], image.bytes))
}

/// DELETE /generation/{job_id}
///
/// `cancelled` is false when the job had already finished.
pub async fn cancel_generation(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<impl IntoResponse> {
    let cancelled = state.queue.cancel(job_id)?;
    Ok(Json(DataResponse {
        data: CancelResponse { job_id, cancelled },
    }))
}

/// POST /estimate-cost
///
/// Quote the request on its target provider (or the default) without
/// queueing anything.
pub async fn estimate_cost(
    State(state): State<AppState>,
    Json(input): Json<GenerateRequest>,
) -> AppResult<impl IntoResponse> {
    let request = input.into_request()?;
    request.validate()?;
    let estimate = state.registry.estimate_cost(None, &request)?;
    Ok(Json(DataResponse { data: estimate }))
}
