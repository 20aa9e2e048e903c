//! Real-time progress notification for generation jobs.
//!
//! - [`ProgressEvent`]: the lifecycle event envelope sent to clients.
//! - [`ProgressBroadcaster`]: explicit publish/subscribe hub with
//!   best-effort delivery and pruning of slow or closed subscribers.

pub mod broadcaster;
pub mod event;

pub use broadcaster::{ProgressBroadcaster, Subscription};
pub use event::{ProgressEvent, ProgressEventType};
