//! WebSocket progress stream.
//!
//! Every connection is one broadcaster subscription: it receives every job
//! event as JSON and filters by `job_id` on its own side.

mod handler;

pub use handler::ws_handler;
