//! Sliding-window rate limiting per provider.
//!
//! Every successful [`RateLimiter::try_acquire`] records one call in the
//! minute and hour windows and holds one concurrency slot until the returned
//! [`RateLimitPermit`] is dropped.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::descriptor::RateLimits;

/// Suggested wait when only the concurrency limit is exhausted.
const CONCURRENCY_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Lengths of the short and long windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitWindows {
    pub minute: Duration,
    pub hour: Duration,
}

impl Default for RateLimitWindows {
    fn default() -> Self {
        Self {
            minute: Duration::from_secs(60),
            hour: Duration::from_secs(3600),
        }
    }
}

/// Current consumption, reported alongside the provider descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RateLimitUsage {
    pub minute_used: u32,
    pub hour_used: u32,
    pub in_flight: u32,
}

pub struct RateLimiter {
    limits: RateLimits,
    windows: RateLimitWindows,
    calls: Mutex<VecDeque<Instant>>,
    in_flight: Arc<AtomicU32>,
}

/// One admitted call. Releases its concurrency slot on drop.
#[derive(Debug)]
pub struct RateLimitPermit {
    in_flight: Arc<AtomicU32>,
}

impl Drop for RateLimitPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

impl RateLimiter {
    pub fn new(limits: RateLimits, windows: RateLimitWindows) -> Self {
        Self {
            limits,
            windows,
            calls: Mutex::new(VecDeque::new()),
            in_flight: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Admit one call, or report how long until a slot frees up.
    pub fn try_acquire(&self) -> Result<RateLimitPermit, Duration> {
        let now = Instant::now();
        let mut calls = self.lock_calls();
        self.prune(&mut calls, now);

        if let Some(wait) = self.window_wait(&calls, now) {
            return Err(wait);
        }

        let admitted = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.limits.concurrent).then_some(n + 1)
            });
        if admitted.is_err() {
            return Err(CONCURRENCY_RETRY_AFTER);
        }

        calls.push_back(now);
        Ok(RateLimitPermit {
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    /// Whether a call would be admitted right now. Does not reserve.
    pub fn has_capacity(&self) -> bool {
        self.wait_time().is_none()
    }

    /// Time until a call would be admitted, `None` when one would be now.
    pub fn wait_time(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut calls = self.lock_calls();
        self.prune(&mut calls, now);

        self.window_wait(&calls, now).or_else(|| {
            (self.in_flight.load(Ordering::Acquire) >= self.limits.concurrent)
                .then_some(CONCURRENCY_RETRY_AFTER)
        })
    }

    pub fn snapshot(&self) -> RateLimitUsage {
        let now = Instant::now();
        let mut calls = self.lock_calls();
        self.prune(&mut calls, now);

        let minute_used = calls
            .iter()
            .filter(|at| now.duration_since(**at) < self.windows.minute)
            .count();
        RateLimitUsage {
            minute_used: u32::try_from(minute_used).unwrap_or(u32::MAX),
            hour_used: u32::try_from(calls.len()).unwrap_or(u32::MAX),
            in_flight: self.in_flight.load(Ordering::Acquire),
        }
    }

    // ---- private helpers ----

    /// Drop calls older than the longest window.
    fn prune(&self, calls: &mut VecDeque<Instant>, now: Instant) {
        let horizon = self.windows.minute.max(self.windows.hour);
        while calls
            .front()
            .is_some_and(|at| now.duration_since(*at) >= horizon)
        {
            calls.pop_front();
        }
    }

    fn window_wait(&self, calls: &VecDeque<Instant>, now: Instant) -> Option<Duration> {
        let minute = Self::wait_for(calls, now, self.windows.minute, self.limits.per_minute);
        let hour = Self::wait_for(calls, now, self.windows.hour, self.limits.per_hour);
        match (minute, hour) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    /// If `limit` calls already happened inside `window`, how long until the
    /// oldest of them leaves it.
    fn wait_for(
        calls: &VecDeque<Instant>,
        now: Instant,
        window: Duration,
        limit: u32,
    ) -> Option<Duration> {
        let inside: Vec<&Instant> = calls
            .iter()
            .filter(|at| now.duration_since(**at) < window)
            .collect();
        if inside.len() < limit as usize {
            return None;
        }
        // The call whose expiry brings us back under the limit.
        let idx = inside.len() - limit as usize;
        let oldest = *inside[idx];
        Some((oldest + window).saturating_duration_since(now))
    }

    fn lock_calls(&self) -> std::sync::MutexGuard<'_, VecDeque<Instant>> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }
}
