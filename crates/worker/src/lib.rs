//! Generation job queue.
//!
//! The [`QueueManager`] owns an explicit job table, a priority-ordered ready
//! heap and a fixed pool of tokio workers. Each worker runs one attempt at a
//! time: single-flight cache lookup, provider selection and invocation,
//! cache write, then a terminal transition or a delayed retry. A
//! maintenance loop recovers stalled jobs and prunes finished ones.

pub mod config;
pub mod error;
pub mod job;
mod maintenance;
pub mod manager;
pub mod processor;

pub use config::QueueConfig;
pub use error::QueueError;
pub use job::{CleanupReport, JobStatusView, QueueStats};
pub use manager::QueueManager;
pub use processor::next_retry_delay;
