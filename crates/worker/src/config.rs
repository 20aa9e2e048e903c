//! Queue manager tuning.

use std::time::Duration;

use sketchforge_core::scheduling::RetryPolicy;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Size of the worker pool.
    pub max_concurrent_jobs: usize,
    pub retry: RetryPolicy,
    /// Waiting jobs allowed before `enqueue` starts rejecting.
    pub max_queue_depth: usize,
    /// An active job whose heartbeat is older than this is requeued.
    pub stall_timeout: Duration,
    /// How long completed and cancelled jobs stay queryable.
    pub completed_retention: Duration,
    /// How long failed jobs stay queryable.
    pub failed_retention: Duration,
    /// Cap on finished (completed or cancelled) jobs kept after retention.
    pub max_completed_history: usize,
    /// Cap on failed jobs kept after retention.
    pub max_failed_history: usize,
    /// How often stall recovery and cleanup run.
    pub maintenance_interval: Duration,
    /// Processing time assumed for wait estimates before any job finished.
    pub default_processing_estimate: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 3,
            retry: RetryPolicy::default(),
            max_queue_depth: 100,
            stall_timeout: Duration::from_secs(300),
            completed_retention: Duration::from_secs(24 * 60 * 60),
            failed_retention: Duration::from_secs(7 * 24 * 60 * 60),
            max_completed_history: 1000,
            max_failed_history: 500,
            maintenance_interval: Duration::from_secs(30),
            default_processing_estimate: Duration::from_secs(30),
        }
    }
}

impl QueueConfig {
    /// How often an active job refreshes its heartbeat.
    pub(crate) fn heartbeat_interval(&self) -> Duration {
        (self.stall_timeout / 4).max(Duration::from_millis(10))
    }
}
