//! Route definitions for generation jobs.

use axum::routing::{delete, get, post};
use axum::Router;

use crate::handlers::generation;
use crate::state::AppState;

/// ```text
/// POST   /generate               -> generate
/// GET    /status/{job_id}        -> get_status
/// GET    /result/{job_id}        -> get_result
/// DELETE /generation/{job_id}    -> cancel_generation
/// POST   /estimate-cost          -> estimate_cost
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/generate", post(generation::generate))
        .route("/status/{job_id}", get(generation::get_status))
        .route("/result/{job_id}", get(generation::get_result))
        .route("/generation/{job_id}", delete(generation::cancel_generation))
        .route("/estimate-cost", post(generation::estimate_cost))
}
