//! The job table: every job the queue manager knows about, plus the ready
//! heap workers pull from.
//!
//! Only the queue manager mutates the table, and only under its mutex. All
//! state changes go through [`transition`] so illegal moves surface as
//! conflicts instead of silently corrupting a job.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use sketchforge_core::error::CoreError;
use sketchforge_core::failure::JobFailure;
use sketchforge_core::generation::{GenerationRequest, GenerationResult};
use sketchforge_core::scheduling::{transition, JobEvent, JobState, Priority};
use sketchforge_core::types::{JobId, Timestamp};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Job record
// ---------------------------------------------------------------------------

pub(crate) struct QueueJob {
    pub(crate) request: Arc<GenerationRequest>,
    pub(crate) fingerprint: String,
    pub(crate) state: JobState,
    /// Attempts started so far.
    pub(crate) attempt: u32,
    pub(crate) max_attempts: u32,
    pub(crate) progress: u8,
    pub(crate) message: String,
    /// Incremented every time a worker takes the job.
    pub(crate) lease: u64,
    /// Ready-heap sequence number of the job's current queue entry.
    pub(crate) seq: u64,
    pub(crate) heartbeat: Option<Instant>,
    /// Cancels the attempt currently running, if any.
    pub(crate) cancel: Option<CancellationToken>,
    /// Delay used for the most recent retry.
    pub(crate) last_delay: Duration,
    /// Set while the job waits out a retry delay.
    pub(crate) retry_at: Option<Timestamp>,
    pub(crate) result: Option<GenerationResult>,
    pub(crate) failure: Option<JobFailure>,
    pub(crate) created_at: Timestamp,
    pub(crate) started_at: Option<Timestamp>,
    pub(crate) finished_at: Option<Timestamp>,
}

impl QueueJob {
    pub(crate) fn new(request: GenerationRequest, fingerprint: String, max_attempts: u32) -> Self {
        Self {
            request: Arc::new(request),
            fingerprint,
            state: JobState::Queued,
            attempt: 0,
            max_attempts,
            progress: 0,
            message: "queued".to_string(),
            lease: 0,
            seq: 0,
            heartbeat: None,
            cancel: None,
            last_delay: Duration::ZERO,
            retry_at: None,
            result: None,
            failure: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub(crate) fn id(&self) -> JobId {
        self.request.id
    }

    pub(crate) fn priority(&self) -> Priority {
        self.request.priority
    }

    /// Move to the state `event` leads to.
    pub(crate) fn apply(&mut self, event: JobEvent) -> Result<JobState, CoreError> {
        let next = transition(self.state, event)?;
        self.state = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
            self.heartbeat = None;
            self.cancel = None;
            self.retry_at = None;
        }
        Ok(next)
    }

    /// Raise progress, never lowering it.
    pub(crate) fn advance(&mut self, progress: u8, message: &str) {
        self.progress = self.progress.max(progress);
        self.message = message.to_string();
    }

    /// Whether `lease` is the job's current, still-running attempt.
    pub(crate) fn holds(&self, lease: u64) -> bool {
        self.state == JobState::Active && self.lease == lease
    }
}

// ---------------------------------------------------------------------------
// Ready heap
// ---------------------------------------------------------------------------

/// Higher priority first, then lower sequence number (FIFO within a tier).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReadyEntry {
    pub(crate) priority: Priority,
    pub(crate) seq: u64,
    pub(crate) id: JobId,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// What a worker gets when it takes a job.
pub(crate) struct Claim {
    pub(crate) id: JobId,
    pub(crate) lease: u64,
    pub(crate) attempt: u32,
    pub(crate) request: Arc<GenerationRequest>,
    pub(crate) fingerprint: String,
    pub(crate) cancel: CancellationToken,
}

#[derive(Default)]
pub(crate) struct JobTable {
    pub(crate) jobs: HashMap<JobId, QueueJob>,
    ready: BinaryHeap<ReadyEntry>,
    next_seq: u64,
    /// Processing time of finished attempts, for wait estimates.
    processed_ms: u64,
    processed_count: u64,
}

impl JobTable {
    /// Put a queued job on the ready heap behind everything of equal or
    /// higher priority.
    pub(crate) fn push_ready(&mut self, id: JobId) {
        let Some(job) = self.jobs.get_mut(&id) else {
            return;
        };
        self.next_seq += 1;
        job.seq = self.next_seq;
        self.ready.push(ReadyEntry {
            priority: job.priority(),
            seq: job.seq,
            id,
        });
    }

    fn is_live(&self, entry: &ReadyEntry) -> bool {
        self.jobs.get(&entry.id).is_some_and(|job| {
            job.state == JobState::Queued && job.retry_at.is_none() && job.seq == entry.seq
        })
    }

    /// Take the highest-priority ready job and mark it active.
    pub(crate) fn claim_next(&mut self) -> Option<Claim> {
        while let Some(entry) = self.ready.pop() {
            if !self.is_live(&entry) {
                continue;
            }
            let job = self.jobs.get_mut(&entry.id)?;
            if let Err(e) = job.apply(JobEvent::Dispatch) {
                tracing::error!(job_id = %entry.id, error = %e, "Ready job could not be dispatched");
                continue;
            }

            let cancel = CancellationToken::new();
            job.attempt += 1;
            job.lease += 1;
            job.heartbeat = Some(Instant::now());
            job.cancel = Some(cancel.clone());
            job.started_at.get_or_insert_with(Utc::now);

            return Some(Claim {
                id: entry.id,
                lease: job.lease,
                attempt: job.attempt,
                request: Arc::clone(&job.request),
                fingerprint: job.fingerprint.clone(),
                cancel,
            });
        }
        None
    }

    pub(crate) fn has_ready(&self) -> bool {
        self.ready.iter().any(|entry| self.is_live(entry))
    }

    /// Count of ready jobs that will be taken before `id`.
    pub(crate) fn position(&self, id: JobId) -> Option<usize> {
        let job = self.jobs.get(&id)?;
        let mine = ReadyEntry {
            priority: job.priority(),
            seq: job.seq,
            id,
        };
        if !self.is_live(&mine) {
            return None;
        }
        Some(
            self.ready
                .iter()
                .filter(|entry| entry.id != id && self.is_live(entry) && **entry > mine)
                .count(),
        )
    }

    /// Jobs queued or waiting out a retry delay.
    pub(crate) fn waiting(&self) -> usize {
        self.count(JobState::Queued)
    }

    pub(crate) fn count(&self, state: JobState) -> usize {
        self.jobs.values().filter(|job| job.state == state).count()
    }

    pub(crate) fn record_processing(&mut self, elapsed: Duration) {
        self.processed_ms += elapsed.as_millis() as u64;
        self.processed_count += 1;
    }

    pub(crate) fn average_processing(&self) -> Option<Duration> {
        (self.processed_count > 0)
            .then(|| Duration::from_millis(self.processed_ms / self.processed_count))
    }

    /// Drop heap entries whose job has gone or moved on.
    pub(crate) fn compact_ready(&mut self) {
        let ready = std::mem::take(&mut self.ready);
        self.ready = ready.into_iter().filter(|e| self.is_live(e)).collect();
    }
}

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

/// Everything a caller may know about one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusView {
    pub job_id: JobId,
    pub state: JobState,
    pub priority: Priority,
    pub progress: u8,
    pub message: String,
    pub attempt: u32,
    pub max_attempts: u32,
    /// Ready jobs ahead of this one; present only while queued.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_wait_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<Timestamp>,
    /// Result metadata; the image itself is served separately.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<GenerationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
    pub created_at: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<Timestamp>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// What one cleanup pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub removed_completed: usize,
    pub removed_failed: usize,
    pub removed_cancelled: usize,
    pub remaining: usize,
}

impl CleanupReport {
    pub fn total_removed(&self) -> usize {
        self.removed_completed + self.removed_failed + self.removed_cancelled
    }
}
