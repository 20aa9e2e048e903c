use axum::routing::{get, post};
use axum::Router;

use crate::handlers::system;
use crate::state::AppState;

/// ```text
/// GET  /stats     -> get_stats
/// POST /cleanup   -> cleanup
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/stats", get(system::get_stats))
        .route("/cleanup", post(system::cleanup))
}
