//! Handlers for provider discovery and on-demand health probes.

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use sketchforge_providers::{ProviderDescriptor, ProviderStatus};

use crate::error::AppResult;
use crate::response::DataResponse;
use crate::state::AppState;

/// Response for GET /providers.
#[derive(Debug, Serialize)]
pub struct ProviderListResponse {
    pub providers: Vec<ProviderDescriptor>,
    pub default_provider: Option<String>,
}

/// Response for POST /health-check/{provider_id}.
#[derive(Debug, Serialize)]
pub struct HealthCheckResponse {
    pub provider_id: String,
    pub healthy: bool,
    pub status: ProviderStatus,
}

/// GET /providers
pub async fn list_providers(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    Ok(Json(DataResponse {
        data: ProviderListResponse {
            providers: state.registry.list(),
            default_provider: state.registry.default_provider_id(),
        },
    }))
}

/// POST /health-check/{provider_id}
///
/// Probe one provider now and report its resulting status.
pub async fn check_provider_health(
    State(state): State<AppState>,
    Path(provider_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let healthy = state.registry.check_health(&provider_id).await?;
    let status = state.registry.get(&provider_id)?.status;

    tracing::info!(provider_id = %provider_id, healthy, ?status, "Manual health check");

    Ok(Json(DataResponse {
        data: HealthCheckResponse {
            provider_id,
            healthy,
            status,
        },
    }))
}
