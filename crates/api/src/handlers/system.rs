//! Handlers for aggregate statistics and housekeeping.

use axum::body::Bytes;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use sketchforge_cache::CacheStats;
use sketchforge_worker::{CleanupReport, QueueStats};

use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// DTOs
// ---------------------------------------------------------------------------

/// Response for GET /stats.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub queue: QueueStats,
    /// `None` when the cache did not answer in time.
    pub cache: Option<CacheStats>,
    pub subscribers: usize,
}

/// Optional body for POST /cleanup.
#[derive(Debug, Default, Deserialize)]
pub struct CleanupRequest {
    /// Cache entries carrying any of these tags are dropped as well.
    #[serde(default)]
    pub invalidate_tags: Vec<String>,
}

/// Response for POST /cleanup.
#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub queue: CleanupReport,
    pub cache_swept: usize,
    pub cache_invalidated: usize,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /stats
pub async fn get_stats(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let cache = match state.cache.stats().await {
        Ok(stats) => Some(stats),
        Err(e) => {
            tracing::warn!(error = %e, "Cache stats unavailable");
            None
        }
    };

    Ok(Json(DataResponse {
        data: StatsResponse {
            queue: state.queue.stats(),
            cache,
            subscribers: state.events.subscriber_count(),
        },
    }))
}

/// POST /cleanup
///
/// Prune finished jobs, sweep expired cache entries and optionally
/// invalidate tagged ones. The body may be empty.
pub async fn cleanup(State(state): State<AppState>, body: Bytes) -> AppResult<impl IntoResponse> {
    let input: CleanupRequest = if body.is_empty() {
        CleanupRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AppError::BadRequest(format!("Invalid cleanup body: {e}")))?
    };

    let queue = state.queue.cleanup();
    let cache_swept = state.cache.sweep().await.unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Cache sweep skipped");
        0
    });
    let cache_invalidated = state
        .cache
        .invalidate(&input.invalidate_tags)
        .await
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Cache invalidation skipped");
            0
        });

    Ok(Json(DataResponse {
        data: CleanupResponse {
            queue,
            cache_swept,
            cache_invalidated,
        },
    }))
}
