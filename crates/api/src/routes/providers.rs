use axum::routing::{get, post};
use axum::Router;

use crate::handlers::providers;
use crate::state::AppState;

/// ```text
/// GET  /providers                     -> list_providers
/// POST /health-check/{provider_id}    -> check_provider_health
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/providers", get(providers::list_providers))
        .route(
            "/health-check/{provider_id}",
            post(providers::check_provider_health),
        )
}
