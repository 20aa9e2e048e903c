//! Fan-out of [`ProgressEvent`]s to connected subscribers.
//!
//! Each subscriber owns a bounded channel. Publication never waits: a
//! subscriber whose buffer is full or whose receiver is gone is pruned, and
//! delivery to the others continues. New subscribers get a `connected`
//! welcome and nothing older; late subscribers poll job status to catch up.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use sketchforge_core::types::JobId;
use tokio::sync::mpsc;

use crate::event::ProgressEvent;

/// Default per-subscriber buffer.
const DEFAULT_CAPACITY: usize = 256;

pub type SubscriberId = u64;

/// The receiving side handed to a new subscriber.
pub struct Subscription {
    pub id: SubscriberId,
    pub receiver: mpsc::Receiver<ProgressEvent>,
}

/// Explicit publish/subscribe hub for job lifecycle events.
///
/// Designed to be shared via `Arc<ProgressBroadcaster>`.
pub struct ProgressBroadcaster {
    subscribers: Mutex<HashMap<SubscriberId, mpsc::Sender<ProgressEvent>>>,
    /// Highest progress published so far for each running job.
    progress: Mutex<HashMap<JobId, u8>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl ProgressBroadcaster {
    /// Create a broadcaster whose subscribers each buffer up to `capacity`
    /// undelivered events before being pruned.
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            progress: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
        }
    }

    /// Register a subscriber. Its first message is the welcome event.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let _ = tx.try_send(ProgressEvent::connected());
        self.lock_subscribers().insert(id, tx);
        tracing::debug!(subscriber_id = id, "Progress subscriber added");

        Subscription { id, receiver: rx }
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        if self.lock_subscribers().remove(&id).is_some() {
            tracing::debug!(subscriber_id = id, "Progress subscriber removed");
        }
    }

    /// Publish an event to every subscriber.
    ///
    /// Job progress is clamped so it never goes backwards for a job; a
    /// terminal event ends tracking for that job. Returns the number of
    /// subscribers the event reached.
    pub fn publish(&self, mut event: ProgressEvent) -> usize {
        if let Some(job_id) = event.job_id {
            let mut progress = self.progress.lock().unwrap_or_else(|e| e.into_inner());
            if event.event_type.is_terminal() {
                let seen = progress.remove(&job_id).unwrap_or(0);
                event.progress = event.progress.max(seen);
            } else {
                let seen = progress.entry(job_id).or_insert(0);
                event.progress = event.progress.max(*seen);
                *seen = event.progress;
            }
        }

        let mut subscribers = self.lock_subscribers();
        let mut pruned = Vec::new();
        for (id, tx) in subscribers.iter() {
            if let Err(e) = tx.try_send(event.clone()) {
                tracing::debug!(subscriber_id = id, error = %e, "Pruning progress subscriber");
                pruned.push(*id);
            }
        }
        for id in &pruned {
            subscribers.remove(id);
        }
        subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock_subscribers().len()
    }

    /// Drop every subscriber; their receivers observe the channel closing.
    pub fn shutdown_all(&self) {
        let mut subscribers = self.lock_subscribers();
        let count = subscribers.len();
        subscribers.clear();
        tracing::info!(count, "Closed all progress subscribers");
    }

    fn lock_subscribers(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<SubscriberId, mpsc::Sender<ProgressEvent>>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use sketchforge_core::failure::{FailureKind, JobFailure};

    use super::*;
    use crate::event::ProgressEventType;

    #[tokio::test]
    async fn new_subscriber_gets_welcome_only() {
        let bus = ProgressBroadcaster::default();
        let job = uuid::Uuid::new_v4();
        bus.publish(ProgressEvent::started(job, 10, "checking cache"));

        let mut sub = bus.subscribe();
        let first = sub.receiver.recv().await.expect("welcome");
        assert_eq!(first.event_type, ProgressEventType::Connected);
        assert!(sub.receiver.try_recv().is_err(), "no history replay");
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() {
        let bus = ProgressBroadcaster::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        let job = uuid::Uuid::new_v4();

        assert_eq!(bus.publish(ProgressEvent::progress(job, 25, "generating")), 2);

        for sub in [&mut a, &mut b] {
            let _welcome = sub.receiver.recv().await.unwrap();
            let event = sub.receiver.recv().await.unwrap();
            assert_eq!(event.job_id, Some(job));
            assert_eq!(event.progress, 25);
        }
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = ProgressBroadcaster::default();
        assert_eq!(
            bus.publish(ProgressEvent::progress(uuid::Uuid::new_v4(), 10, "x")),
            0
        );
    }

    #[tokio::test]
    async fn closed_subscriber_is_pruned() {
        let bus = ProgressBroadcaster::default();
        let dropped = bus.subscribe();
        let mut kept = bus.subscribe();
        drop(dropped);

        let delivered = bus.publish(ProgressEvent::progress(uuid::Uuid::new_v4(), 10, "x"));
        assert_eq!(delivered, 1);
        assert_eq!(bus.subscriber_count(), 1);

        let _welcome = kept.receiver.recv().await.unwrap();
        assert!(kept.receiver.recv().await.is_some());
    }

    #[tokio::test]
    async fn slow_subscriber_is_pruned_without_blocking_others() {
        let bus = ProgressBroadcaster::new(2);
        let _slow = bus.subscribe(); // never reads; welcome already uses a slot
        let mut fast = bus.subscribe();
        let job = uuid::Uuid::new_v4();

        let _welcome = fast.receiver.recv().await.unwrap();
        for pct in [10, 20, 30] {
            bus.publish(ProgressEvent::progress(job, pct, "x"));
            let event = fast.receiver.recv().await.unwrap();
            assert_eq!(event.progress, pct);
        }

        assert_eq!(bus.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn progress_never_goes_backwards() {
        let bus = ProgressBroadcaster::default();
        let mut sub = bus.subscribe();
        let job = uuid::Uuid::new_v4();

        bus.publish(ProgressEvent::progress(job, 25, "generating"));
        bus.publish(ProgressEvent::started(job, 10, "checking cache (retry)"));
        bus.publish(ProgressEvent::error(
            job,
            JobFailure::new(FailureKind::Timeout, "gave up"),
        ));

        let _welcome = sub.receiver.recv().await.unwrap();
        let seen: Vec<u8> = [
            sub.receiver.recv().await.unwrap(),
            sub.receiver.recv().await.unwrap(),
            sub.receiver.recv().await.unwrap(),
        ]
        .iter()
        .map(|e| e.progress)
        .collect();
        assert_eq!(seen, vec![25, 25, 25]);
    }

    #[tokio::test]
    async fn shutdown_closes_receivers() {
        let bus = ProgressBroadcaster::default();
        let mut sub = bus.subscribe();
        bus.shutdown_all();

        let _welcome = sub.receiver.recv().await.unwrap();
        assert!(sub.receiver.recv().await.is_none());
        assert_eq!(bus.subscriber_count(), 0);
    }
}
