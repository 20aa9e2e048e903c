//! The queue manager: public face of the job table and owner of the worker
//! pool.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use sketchforge_cache::{CacheStore, KeyedLocks};
use sketchforge_core::fingerprint::fingerprint;
use sketchforge_core::generation::{GeneratedImage, GenerationRequest};
use sketchforge_core::scheduling::{JobEvent, JobState};
use sketchforge_core::types::JobId;
use sketchforge_events::{ProgressBroadcaster, ProgressEvent};
use sketchforge_providers::{ProviderInvoker, ProviderRegistry};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::job::{Claim, CleanupReport, JobStatusView, JobTable, QueueJob, QueueStats};

/// State shared between the manager handle, the workers and the
/// maintenance loop.
pub(crate) struct Inner {
    pub(crate) config: QueueConfig,
    table: Mutex<JobTable>,
    ready: Notify,
    pub(crate) cache: Arc<CacheStore>,
    pub(crate) locks: KeyedLocks,
    pub(crate) registry: Arc<ProviderRegistry>,
    pub(crate) invoker: ProviderInvoker,
    pub(crate) events: Arc<ProgressBroadcaster>,
    pub(crate) shutdown: CancellationToken,
}

impl Inner {
    pub(crate) fn table(&self) -> MutexGuard<'_, JobTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wake one idle worker.
    pub(crate) fn notify_ready(&self) {
        self.ready.notify_one();
    }

    /// Wait until a job can be claimed.
    async fn next_job(&self) -> Claim {
        loop {
            let claimed = {
                let mut table = self.table();
                let claim = table.claim_next();
                // Pass the wake-up along if more work is waiting.
                if claim.is_some() && table.has_ready() {
                    self.ready.notify_one();
                }
                claim
            };
            if let Some(claim) = claimed {
                return claim;
            }
            self.ready.notified().await;
        }
    }

    async fn worker_loop(self: Arc<Self>, worker: usize) {
        tracing::debug!(worker, "Queue worker started");
        loop {
            let claim = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                claim = self.next_job() => claim,
            };
            self.process(claim).await;
        }
        tracing::debug!(worker, "Queue worker stopped");
    }
}

/// Accepts generation requests and runs them on a bounded worker pool.
///
/// Designed to be shared via `Arc<QueueManager>`.
pub struct QueueManager {
    inner: Arc<Inner>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl QueueManager {
    pub fn new(
        config: QueueConfig,
        cache: Arc<CacheStore>,
        registry: Arc<ProviderRegistry>,
        events: Arc<ProgressBroadcaster>,
    ) -> Self {
        let invoker = ProviderInvoker::new(Arc::clone(&registry));
        Self {
            inner: Arc::new(Inner {
                config,
                table: Mutex::new(JobTable::default()),
                ready: Notify::new(),
                cache,
                locks: KeyedLocks::new(),
                registry,
                invoker,
                events,
                shutdown: CancellationToken::new(),
            }),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Spawn the worker pool and the maintenance loop. They run until
    /// `cancel` fires or [`QueueManager::shutdown`] is called.
    pub fn start(&self, cancel: CancellationToken) {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        if !handles.is_empty() {
            tracing::warn!("Queue manager already started");
            return;
        }

        let workers = self.inner.config.max_concurrent_jobs.max(1);
        for worker in 0..workers {
            handles.push(tokio::spawn(Arc::clone(&self.inner).worker_loop(worker)));
        }
        handles.push(tokio::spawn(Arc::clone(&self.inner).maintenance_loop()));

        let shutdown = self.inner.shutdown.clone();
        handles.push(tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => shutdown.cancel(),
                _ = shutdown.cancelled() => {}
            }
        }));

        tracing::info!(
            workers,
            max_queue_depth = self.inner.config.max_queue_depth,
            max_attempts = self.inner.config.retry.max_attempts,
            "Queue manager started",
        );
    }

    /// Stop taking jobs and wait up to `grace` for running jobs to finish.
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = self
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        if tokio::time::timeout(grace, futures::future::join_all(handles))
            .await
            .is_err()
        {
            tracing::warn!(
                grace_secs = grace.as_secs(),
                "Queue workers did not stop in time, aborting",
            );
            for abort in aborts {
                abort.abort();
            }
        }
        tracing::info!("Queue manager stopped");
    }

    /// Validate, fingerprint and queue a request.
    pub fn enqueue(&self, request: GenerationRequest) -> Result<JobId, QueueError> {
        request.validate()?;
        if let Some(provider_id) = &request.provider_id {
            if !self.inner.registry.contains(provider_id) {
                return Err(QueueError::InvalidInput(format!(
                    "Unknown provider {provider_id}"
                )));
            }
        }
        let fingerprint = fingerprint(&request)?;
        let id = request.id;
        let priority = request.priority;

        {
            let mut table = self.inner.table();
            if table.jobs.contains_key(&id) {
                return Err(QueueError::Conflict(format!("Job {id} already exists")));
            }
            let depth = table.waiting();
            if depth >= self.inner.config.max_queue_depth {
                tracing::warn!(depth, "Rejecting job: queue full");
                return Err(QueueError::QueueFull { depth });
            }
            let job = QueueJob::new(request, fingerprint, self.inner.config.retry.max_attempts);
            table.jobs.insert(id, job);
            table.push_ready(id);
        }
        self.inner.notify_ready();

        tracing::info!(job_id = %id, priority = priority.as_str(), "Job queued");
        Ok(id)
    }

    pub fn status(&self, id: JobId) -> Result<JobStatusView, QueueError> {
        let table = self.inner.table();
        let job = table.jobs.get(&id).ok_or(QueueError::NotFound(id))?;

        let position = table.position(id);
        let estimated_wait_secs = position.map(|pos| {
            let per_job = table
                .average_processing()
                .unwrap_or(self.inner.config.default_processing_estimate);
            let workers = self.inner.config.max_concurrent_jobs.max(1);
            let rounds = pos.div_ceil(workers) as u32;
            per_job.saturating_mul(rounds).as_secs()
        });

        Ok(JobStatusView {
            job_id: id,
            state: job.state,
            priority: job.priority(),
            progress: job.progress,
            message: job.message.clone(),
            attempt: job.attempt,
            max_attempts: job.max_attempts,
            position,
            estimated_wait_secs,
            retry_at: job.retry_at,
            result: job.result.clone(),
            error: job.failure.clone(),
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
        })
    }

    /// Cancel a job. Queued jobs leave the queue at once; an active job's
    /// in-flight call is abandoned and its outcome discarded. Returns
    /// `false` for jobs that already finished.
    pub fn cancel(&self, id: JobId) -> Result<bool, QueueError> {
        let was = {
            let mut table = self.inner.table();
            let job = table.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
            if job.state.is_terminal() {
                return Ok(false);
            }
            let was = job.state;
            let token = job.cancel.take();
            job.apply(JobEvent::Cancel)?;
            job.message = "cancelled".to_string();
            if let Some(token) = token {
                token.cancel();
            }
            was
        };

        tracing::info!(job_id = %id, was = %was, "Job cancelled");
        self.inner.events.publish(ProgressEvent::cancelled(id));
        Ok(true)
    }

    pub fn stats(&self) -> QueueStats {
        let table = self.inner.table();
        QueueStats {
            waiting: table.waiting(),
            active: table.count(JobState::Active),
            completed: table.count(JobState::Completed),
            failed: table.count(JobState::Failed),
            cancelled: table.count(JobState::Cancelled),
        }
    }

    /// The generated image of a completed job.
    pub fn result_image(&self, id: JobId) -> Result<GeneratedImage, QueueError> {
        let table = self.inner.table();
        let job = table.jobs.get(&id).ok_or(QueueError::NotFound(id))?;
        match (&job.state, job.result.as_ref().and_then(|r| r.image.as_ref())) {
            (JobState::Completed, Some(image)) => Ok(image.clone()),
            (state, _) => Err(QueueError::NotReady { id, state: *state }),
        }
    }

    /// Prune finished jobs by age and history caps.
    pub fn cleanup(&self) -> CleanupReport {
        self.inner.cleanup()
    }

    /// Requeue active jobs whose heartbeat has gone stale. Returns how many
    /// were recovered.
    pub fn recover_stalled(&self) -> usize {
        self.inner.recover_stalled()
    }
}
