pub mod generation;
pub mod health;
pub mod providers;
pub mod system;

use axum::routing::get;
use axum::Router;

use crate::state::AppState;
use crate::ws;

/// Build the API route tree.
///
/// ```text
/// /ws                              WebSocket progress stream
///
/// /generate                        submit (POST)
/// /status/{job_id}                 job status
/// /result/{job_id}                 generated image bytes
/// /generation/{job_id}             cancel (DELETE)
/// /estimate-cost                   quote without queueing (POST)
///
/// /providers                       descriptors + default provider
/// /health-check/{provider_id}      on-demand probe (POST)
///
/// /stats                           queue, cache and subscriber stats
/// /cleanup                         prune jobs and cache (POST)
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .merge(generation::router())
        .merge(providers::router())
        .merge(system::router())
}
