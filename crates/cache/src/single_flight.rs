//! Per-key async locks for single-flight generation.
//!
//! A worker holds the fingerprint's lock across cache lookup, provider call
//! and cache put. A second job with the same fingerprint waits on the lock
//! and then finds the first job's result in the cache instead of paying for
//! another provider call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, OwnedMutexGuard};

type Slot = Arc<Mutex<()>>;

#[derive(Default)]
pub struct KeyedLocks {
    slots: StdMutex<HashMap<String, Slot>>,
}

/// Held while a key is locked. Dropping it releases the key and removes the
/// slot when nobody else is waiting for it.
pub struct KeyGuard<'a> {
    key: String,
    owner: &'a KeyedLocks,
    _guard: OwnedMutexGuard<()>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until `key` is free, then hold it.
    pub async fn lock(&self, key: &str) -> KeyGuard<'_> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(slots.entry(key.to_string()).or_default())
        };

        let guard = slot.lock_owned().await;
        KeyGuard {
            key: key.to_string(),
            owner: self,
            _guard: guard,
        }
    }

    /// Number of keys currently held or waited on.
    pub fn in_flight(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        let mut slots = self.owner.slots.lock().unwrap_or_else(|e| e.into_inner());
        // One reference lives in the map, one in our own guard. Anything
        // more means another task is waiting on this key.
        let idle = slots
            .get(&self.key)
            .is_some_and(|slot| Arc::strong_count(slot) <= 2);
        if idle {
            slots.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn slot_is_removed_after_release() {
        let locks = KeyedLocks::new();
        {
            let _guard = locks.lock("fp").await;
            assert_eq!(locks.in_flight(), 1);
        }
        assert_eq!(locks.in_flight(), 0);
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let _a = locks.lock("a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock("b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn same_key_is_serialized() {
        let locks = Arc::new(KeyedLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let inside = Arc::clone(&inside);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock("fp").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(locks.in_flight(), 0);
    }
}
