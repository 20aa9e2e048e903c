//! One attempt at one job, from cache lookup to terminal state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use sketchforge_cache::RequestSummary;
use sketchforge_core::failure::JobFailure;
use sketchforge_core::generation::{GenerationRequest, GenerationResult};
use sketchforge_core::job_events::{
    MESSAGE_CHECKING_CACHE, MESSAGE_COMPLETED, MESSAGE_FROM_CACHE, MESSAGE_GENERATING,
    PROGRESS_CHECKING_CACHE, PROGRESS_DONE, PROGRESS_GENERATING,
};
use sketchforge_core::scheduling::{JobEvent, JobState, RetryPolicy};
use sketchforge_core::types::JobId;
use sketchforge_events::ProgressEvent;

use crate::job::Claim;
use crate::manager::Inner;

enum Outcome {
    Completed {
        result: GenerationResult,
        message: &'static str,
    },
    Failed {
        failure: JobFailure,
        retry_after: Option<Duration>,
    },
    Cancelled,
}

/// Delay before retrying after failed attempt `attempt`.
///
/// Exponential backoff from the policy, raised to the provider's hint when
/// that is longer, and never shorter than the previous delay.
pub fn next_retry_delay(
    policy: &RetryPolicy,
    attempt: u32,
    hint: Option<Duration>,
    previous: Duration,
) -> Duration {
    policy
        .delay_for(attempt)
        .max(hint.unwrap_or(Duration::ZERO))
        .max(previous)
}

/// Tags written next to a cache entry, usable for invalidation.
fn cache_tags(request: &GenerationRequest, result: &GenerationResult) -> Vec<String> {
    let mut tags = Vec::new();
    if let Some(provider_id) = &result.provider_id {
        tags.push(format!("provider:{provider_id}"));
    }
    if let Some(model) = &result.model {
        tags.push(format!("model:{model}"));
    }
    if let Some(style) = &request.style {
        tags.push(format!("style:{}", style.id));
    }
    tags
}

impl Inner {
    pub(crate) async fn process(self: &Arc<Self>, claim: Claim) {
        let started = Instant::now();
        tracing::info!(
            job_id = %claim.id,
            attempt = claim.attempt,
            lease = claim.lease,
            "Job started",
        );
        self.report(
            &claim,
            ProgressEvent::started(claim.id, PROGRESS_CHECKING_CACHE, MESSAGE_CHECKING_CACHE),
        );

        match self.run_attempt(&claim, started).await {
            Outcome::Completed { result, message } => {
                self.complete(&claim, result, message, started.elapsed())
            }
            Outcome::Failed {
                failure,
                retry_after,
            } => self.fail_or_retry(&claim, failure, retry_after),
            Outcome::Cancelled => self.abandon(&claim),
        }
    }

    async fn run_attempt(&self, claim: &Claim, started: Instant) -> Outcome {
        // Waiting on an identical job counts as progress: keep the lease
        // alive so stall recovery leaves this attempt alone.
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());

        // Held across lookup, generation and put so identical jobs wait for
        // this one and then hit the cache.
        let lock = self.locks.lock(&claim.fingerprint);
        tokio::pin!(lock);
        let _flight = loop {
            tokio::select! {
                guard = &mut lock => break guard,
                _ = claim.cancel.cancelled() => return Outcome::Cancelled,
                _ = heartbeat.tick() => self.touch(claim),
            }
        };
        self.touch(claim);

        match self.cache.lookup(&claim.fingerprint).await {
            Ok(Some(entry)) => {
                tracing::info!(job_id = %claim.id, hits = entry.hit_count, "Cache hit");
                return Outcome::Completed {
                    result: entry.to_result(claim.id, started.elapsed()),
                    message: MESSAGE_FROM_CACHE,
                };
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(job_id = %claim.id, error = %e, "Cache unavailable, treating as miss");
            }
        }

        self.report(
            claim,
            ProgressEvent::progress(claim.id, PROGRESS_GENERATING, MESSAGE_GENERATING),
        );

        let request = &claim.request;
        let provider_id = match self
            .registry
            .select(request.provider_id.as_deref(), request.max_cost)
        {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(job_id = %claim.id, error = %e, "Provider selection failed");
                return Outcome::Failed {
                    failure: e.to_failure(),
                    retry_after: e.retry_after(),
                };
            }
        };

        let invoke = self.invoker.invoke(&provider_id, request);
        tokio::pin!(invoke);
        let outcome = loop {
            tokio::select! {
                outcome = &mut invoke => break outcome,
                _ = claim.cancel.cancelled() => return Outcome::Cancelled,
                _ = heartbeat.tick() => self.touch(claim),
            }
        };

        match outcome {
            Ok(result) => {
                if claim.cancel.is_cancelled() {
                    return Outcome::Cancelled;
                }
                let summary = RequestSummary::from(&**request);
                let tags = cache_tags(request, &result);
                if let Err(e) = self
                    .cache
                    .put(&claim.fingerprint, summary, &result, None, tags)
                    .await
                {
                    tracing::warn!(job_id = %claim.id, error = %e, "Failed to cache result");
                }
                Outcome::Completed {
                    result,
                    message: MESSAGE_COMPLETED,
                }
            }
            Err(e) => Outcome::Failed {
                failure: e.to_failure(),
                retry_after: e.retry_after(),
            },
        }
    }

    // ---- job table updates ----

    /// Record progress for a running attempt and broadcast it.
    fn report(&self, claim: &Claim, event: ProgressEvent) {
        {
            let mut table = self.table();
            match table.jobs.get_mut(&claim.id) {
                Some(job) if job.holds(claim.lease) => {
                    job.advance(event.progress, &event.message);
                    job.heartbeat = Some(Instant::now());
                }
                _ => return,
            }
        }
        self.events.publish(event);
    }

    fn touch(&self, claim: &Claim) {
        let mut table = self.table();
        if let Some(job) = table.jobs.get_mut(&claim.id) {
            if job.holds(claim.lease) {
                job.heartbeat = Some(Instant::now());
            }
        }
    }

    fn complete(
        &self,
        claim: &Claim,
        result: GenerationResult,
        message: &'static str,
        elapsed: Duration,
    ) {
        let cache_hit = result.cache_hit;
        let size_bytes = result.image.as_ref().map_or(0, |image| image.size_bytes());
        {
            let mut table = self.table();
            let Some(job) = table.jobs.get_mut(&claim.id) else {
                return;
            };
            if !job.holds(claim.lease) {
                tracing::debug!(
                    job_id = %claim.id,
                    lease = claim.lease,
                    state = %job.state,
                    "Discarding result of superseded attempt",
                );
                return;
            }
            if let Err(e) = job.apply(JobEvent::Complete) {
                tracing::error!(job_id = %claim.id, error = %e, "Could not complete job");
                return;
            }
            job.advance(PROGRESS_DONE, message);
            job.result = Some(result);
            table.record_processing(elapsed);
        }

        tracing::info!(
            job_id = %claim.id,
            cache_hit,
            size_bytes,
            elapsed_ms = elapsed.as_millis() as u64,
            "Job completed",
        );
        self.events.publish(ProgressEvent::completed(claim.id, message));
    }

    fn fail_or_retry(
        self: &Arc<Self>,
        claim: &Claim,
        failure: JobFailure,
        retry_after: Option<Duration>,
    ) {
        let retry = self
            .config
            .retry
            .should_retry(claim.attempt, failure.retryable);

        let event = {
            let mut table = self.table();
            let Some(job) = table.jobs.get_mut(&claim.id) else {
                return;
            };
            if !job.holds(claim.lease) {
                tracing::debug!(job_id = %claim.id, "Discarding failure of superseded attempt");
                return;
            }

            if retry {
                let delay = next_retry_delay(
                    &self.config.retry,
                    claim.attempt,
                    retry_after,
                    job.last_delay,
                );
                if let Err(e) = job.apply(JobEvent::Retry) {
                    tracing::error!(job_id = %claim.id, error = %e, "Could not requeue job");
                    return;
                }
                job.last_delay = delay;
                job.retry_at = chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|d| Utc::now().checked_add_signed(d));
                job.message = format!(
                    "{} failure, retrying in {} ms",
                    failure.kind.as_str(),
                    delay.as_millis()
                );
                job.heartbeat = None;
                job.cancel = None;

                tracing::warn!(
                    job_id = %claim.id,
                    attempt = claim.attempt,
                    max_attempts = job.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %failure,
                    "Job attempt failed, retrying",
                );
                self.schedule_requeue(claim.id, claim.lease, delay);
                ProgressEvent::progress(claim.id, job.progress, job.message.clone())
            } else {
                if let Err(e) = job.apply(JobEvent::Fail) {
                    tracing::error!(job_id = %claim.id, error = %e, "Could not fail job");
                    return;
                }
                job.message = failure.message.clone();
                job.failure = Some(failure.clone());

                tracing::error!(
                    job_id = %claim.id,
                    attempt = claim.attempt,
                    kind = failure.kind.as_str(),
                    error = %failure,
                    "Job failed",
                );
                ProgressEvent::error(claim.id, failure)
            }
        };
        self.events.publish(event);
    }

    /// The attempt stopped because its token fired. Whoever fired it has
    /// already moved the job on; only an attempt that still holds the job
    /// needs closing out here.
    fn abandon(&self, claim: &Claim) {
        let mut table = self.table();
        let Some(job) = table.jobs.get_mut(&claim.id) else {
            return;
        };
        if job.holds(claim.lease) {
            if let Err(e) = job.apply(JobEvent::Cancel) {
                tracing::error!(job_id = %claim.id, error = %e, "Could not cancel job");
                return;
            }
            drop(table);
            self.events.publish(ProgressEvent::cancelled(claim.id));
        }
        tracing::debug!(job_id = %claim.id, lease = claim.lease, "Attempt abandoned");
    }

    fn schedule_requeue(self: &Arc<Self>, id: JobId, lease: u64, delay: Duration) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => inner.requeue(id, lease),
                _ = inner.shutdown.cancelled() => {}
            }
        });
    }

    /// Put a job whose retry delay elapsed back on the ready heap, unless it
    /// was cancelled or otherwise moved on in the meantime.
    fn requeue(&self, id: JobId, lease: u64) {
        {
            let mut table = self.table();
            let Some(job) = table.jobs.get_mut(&id) else {
                return;
            };
            if job.state != JobState::Queued || job.lease != lease || job.retry_at.is_none() {
                return;
            }
            job.retry_at = None;
            table.push_ready(id);
        }
        tracing::debug!(job_id = %id, "Retry delay elapsed, job ready");
        self.notify_ready();
    }
}
