//! Shared domain types for the SketchForge generation orchestrator.
//!
//! This crate has zero internal dependencies so that the cache, provider,
//! worker and API crates can all build on the same request/result model,
//! failure taxonomy and job state machine.

pub mod error;
pub mod failure;
pub mod fingerprint;
pub mod generation;
pub mod job_events;
pub mod scheduling;
pub mod types;
