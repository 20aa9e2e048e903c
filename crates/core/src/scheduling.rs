//! Job priorities, the job state machine and retry backoff.
//!
//! This module lives in `core` (zero internal deps) so the worker, the API
//! and their tests share one definition of every legal transition.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Scheduling tier. Ordering is `Low < Normal < High`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something that happened to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    /// A worker took the job off the queue.
    Dispatch,
    /// The job produced a result (fresh or cached).
    Complete,
    /// The job failed and will not be retried.
    Fail,
    /// The job failed transiently and goes back to the queue.
    Retry,
    /// The job missed its liveness heartbeat while active.
    Stall,
    Cancel,
}

/// Apply `event` to a job in state `from`.
///
/// Terminal states accept no events.
pub fn transition(from: JobState, event: JobEvent) -> Result<JobState, CoreError> {
    use JobEvent::*;
    use JobState::*;

    match (from, event) {
        (Queued, Dispatch) => Ok(Active),
        (Active, Complete) => Ok(Completed),
        (Active, Fail) => Ok(Failed),
        (Active, Retry) | (Active, Stall) => Ok(Queued),
        (Queued, Cancel) | (Active, Cancel) => Ok(Cancelled),
        _ => Err(CoreError::Conflict(format!(
            "Invalid transition: {from} on {event:?}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Exponential backoff for retryable failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt that follows failed attempt number
    /// `attempt` (1-based): `base * 2^(attempt - 1)`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Whether a failure on attempt `attempt` should be retried.
    pub fn should_retry(&self, attempt: u32, retryable: bool) -> bool {
        retryable && attempt < self.max_attempts
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
