//! Real-time message types and progress checkpoints for generation jobs.
//!
//! Used by the worker when publishing lifecycle events and by the WebSocket
//! layer when serializing them.

/// Welcome acknowledgment sent once to each new subscriber.
pub const MSG_TYPE_CONNECTED: &str = "connected";

/// Job left the queue and a worker started on it.
pub const MSG_TYPE_STARTED: &str = "started";

/// Intermediate progress update.
pub const MSG_TYPE_PROGRESS: &str = "progress";

/// Job completed successfully (fresh or from cache).
pub const MSG_TYPE_COMPLETED: &str = "completed";

/// Job failed terminally.
pub const MSG_TYPE_ERROR: &str = "error";

/// Job was cancelled by a caller.
pub const MSG_TYPE_CANCELLED: &str = "cancelled";

pub const PROGRESS_CHECKING_CACHE: u8 = 10;
pub const PROGRESS_GENERATING: u8 = 25;
pub const PROGRESS_DONE: u8 = 100;

pub const MESSAGE_CHECKING_CACHE: &str = "checking cache";
pub const MESSAGE_GENERATING: &str = "generating";
pub const MESSAGE_FROM_CACHE: &str = "retrieved from cache";
pub const MESSAGE_COMPLETED: &str = "generation complete";
