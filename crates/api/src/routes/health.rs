use axum::extract::State;
use axum::{routing::get, Json, Router};
use serde::Serialize;
use sketchforge_providers::ProviderStatus;

use crate::state::AppState;

/// Health check response payload.
#[derive(Serialize)]
pub struct HealthResponse {
    /// `ok` while at least one provider is online, `degraded` otherwise.
    pub status: &'static str,
    /// Crate version from Cargo.toml.
    pub version: &'static str,
    pub providers_online: usize,
    pub providers_total: usize,
}

/// GET /health -- liveness plus a summary of provider availability.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let providers = state.registry.list();
    let providers_online = providers
        .iter()
        .filter(|p| p.status == ProviderStatus::Online)
        .count();

    let status = if providers_online > 0 { "ok" } else { "degraded" };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        providers_online,
        providers_total: providers.len(),
    })
}

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
