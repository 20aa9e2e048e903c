//! Stall recovery and bounded-retention cleanup.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use sketchforge_core::failure::{FailureKind, JobFailure};
use sketchforge_core::scheduling::{JobEvent, JobState};
use sketchforge_core::types::{JobId, Timestamp};
use sketchforge_events::ProgressEvent;

use crate::job::CleanupReport;
use crate::manager::Inner;

/// Whether a job that finished at `finished_at` is older than `retention`.
fn outlived(finished_at: Option<Timestamp>, retention: Duration, now: Timestamp) -> bool {
    finished_at.is_some_and(|at| {
        now.signed_duration_since(at)
            .to_std()
            .is_ok_and(|age| age >= retention)
    })
}

impl Inner {
    /// Requeue active jobs whose heartbeat is older than the stall timeout.
    ///
    /// The stale attempt's token is cancelled and its lease is superseded,
    /// so whatever it eventually produces is discarded. A job that stalls on
    /// its last attempt fails with a timeout instead.
    pub(crate) fn recover_stalled(&self) -> usize {
        let now = Instant::now();
        let stall_timeout = self.config.stall_timeout;
        let mut requeued: Vec<JobId> = Vec::new();
        let mut failed: Vec<(JobId, JobFailure)> = Vec::new();

        {
            let mut table = self.table();
            let stalled: Vec<JobId> = table
                .jobs
                .iter()
                .filter(|(_, job)| {
                    job.state == JobState::Active
                        && job
                            .heartbeat
                            .is_some_and(|hb| now.duration_since(hb) >= stall_timeout)
                })
                .map(|(id, _)| *id)
                .collect();

            for id in stalled {
                let Some(job) = table.jobs.get_mut(&id) else {
                    continue;
                };
                if let Some(token) = job.cancel.take() {
                    token.cancel();
                }

                if job.attempt >= job.max_attempts {
                    let failure = JobFailure::new(
                        FailureKind::Timeout,
                        format!(
                            "job stopped responding on attempt {} of {}",
                            job.attempt, job.max_attempts
                        ),
                    );
                    if job.apply(JobEvent::Fail).is_ok() {
                        job.message = failure.message.clone();
                        job.failure = Some(failure.clone());
                        failed.push((id, failure));
                    }
                } else if job.apply(JobEvent::Stall).is_ok() {
                    job.heartbeat = None;
                    job.message = "requeued after stall".to_string();
                    table.push_ready(id);
                    requeued.push(id);
                }
            }
        }

        for id in &requeued {
            tracing::warn!(job_id = %id, "Recovered stalled job");
            self.notify_ready();
        }
        for (id, failure) in &failed {
            tracing::error!(job_id = %id, "Stalled job out of attempts");
            self.events.publish(ProgressEvent::error(*id, failure.clone()));
        }
        requeued.len() + failed.len()
    }

    /// Remove finished jobs past their retention window, then trim what is
    /// left to the history caps, oldest first.
    pub(crate) fn cleanup(&self) -> CleanupReport {
        let now = Utc::now();
        let config = &self.config;
        let mut report = CleanupReport::default();
        let mut table = self.table();

        let mut doomed: Vec<JobId> = table
            .jobs
            .iter()
            .filter(|(_, job)| match job.state {
                JobState::Completed | JobState::Cancelled => {
                    outlived(job.finished_at, config.completed_retention, now)
                }
                JobState::Failed => outlived(job.finished_at, config.failed_retention, now),
                JobState::Queued | JobState::Active => false,
            })
            .map(|(id, _)| *id)
            .collect();

        let over_cap = |states: &[JobState], cap: usize, doomed: &mut Vec<JobId>| {
            let mut kept: Vec<(Option<Timestamp>, JobId)> = table
                .jobs
                .iter()
                .filter(|(id, job)| states.contains(&job.state) && !doomed.contains(id))
                .map(|(id, job)| (job.finished_at, *id))
                .collect();
            if kept.len() > cap {
                kept.sort();
                let excess = kept.len() - cap;
                doomed.extend(kept.into_iter().take(excess).map(|(_, id)| id));
            }
        };
        over_cap(
            &[JobState::Completed, JobState::Cancelled],
            config.max_completed_history,
            &mut doomed,
        );
        over_cap(&[JobState::Failed], config.max_failed_history, &mut doomed);

        for id in doomed {
            if let Some(job) = table.jobs.remove(&id) {
                match job.state {
                    JobState::Completed => report.removed_completed += 1,
                    JobState::Failed => report.removed_failed += 1,
                    JobState::Cancelled => report.removed_cancelled += 1,
                    JobState::Queued | JobState::Active => {}
                }
            }
        }
        table.compact_ready();
        report.remaining = table.jobs.len();

        if report.total_removed() > 0 {
            tracing::info!(
                removed_completed = report.removed_completed,
                removed_failed = report.removed_failed,
                removed_cancelled = report.removed_cancelled,
                remaining = report.remaining,
                "Cleaned up finished jobs",
            );
        }
        report
    }

    /// Periodic stall recovery, job cleanup and cache sweep.
    pub(crate) async fn maintenance_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.maintenance_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            interval_secs = self.config.maintenance_interval.as_secs(),
            "Queue maintenance started",
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Queue maintenance shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.recover_stalled();
                    self.cleanup();
                    match self.cache.sweep().await {
                        Ok(0) => {}
                        Ok(swept) => tracing::debug!(swept, "Swept expired cache entries"),
                        Err(e) => tracing::warn!(error = %e, "Cache sweep skipped"),
                    }
                }
            }
        }
    }
}
