//! Generation provider integration.
//!
//! Provides tagged provider configuration, the [`ProviderRegistry`]
//! (descriptors, health, selection, rate limits, cost estimates), the
//! [`ProviderInvoker`] that turns a request into a classified provider call,
//! and the pluggable [`GenerationBackend`] capability with a generic
//! JSON-over-HTTP implementation.

pub mod backend;
pub mod descriptor;
pub mod error;
pub mod health;
pub mod http;
pub mod invoker;
pub mod rate_limit;
pub mod registry;

pub use backend::{BackendError, BackendOutput, BackendRequest, GenerationBackend};
pub use descriptor::{
    Capabilities, Pricing, ProviderConfig, ProviderDescriptor, ProviderKind, ProviderStatus,
    RateLimits,
};
pub use error::{InvokeError, ProviderError};
pub use http::HttpBackend;
pub use invoker::ProviderInvoker;
pub use rate_limit::{RateLimitPermit, RateLimitWindows, RateLimiter};
pub use registry::{CostEstimate, ProviderRegistry};
