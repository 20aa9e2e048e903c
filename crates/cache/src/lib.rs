//! Result cache for generation jobs.
//!
//! - [`CacheStore`]: fingerprint-addressed store with TTL expiry, LRU +
//!   hit-count eviction and tag invalidation.
//! - [`KeyedLocks`]: per-fingerprint async locks so concurrent identical
//!   jobs share one provider call.

pub mod error;
pub mod single_flight;
pub mod store;

pub use error::CacheError;
pub use single_flight::{KeyGuard, KeyedLocks};
pub use store::{CacheConfig, CacheEntry, CacheStats, CacheStore, RequestSummary};
