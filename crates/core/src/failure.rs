//! Failure taxonomy shared by every component.
//!
//! Component-local errors are classified into a [`FailureKind`] at the queue
//! boundary; only the classification, a human-readable message and a
//! remediation hint reach the job's terminal state.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The caller sent something unusable (corrupt sketch, blank prompt).
    InvalidInput,
    /// The selected provider cannot serve this request as-is.
    InvalidRequest,
    RateLimited,
    ProviderUnavailable,
    Timeout,
    NoProviderAvailable,
    CacheUnavailable,
    Cancelled,
    Internal,
}

impl FailureKind {
    /// Whether the queue retries a job that failed with this kind.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FailureKind::RateLimited | FailureKind::ProviderUnavailable | FailureKind::Timeout
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::InvalidInput => "invalid_input",
            FailureKind::InvalidRequest => "invalid_request",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::ProviderUnavailable => "provider_unavailable",
            FailureKind::Timeout => "timeout",
            FailureKind::NoProviderAvailable => "no_provider_available",
            FailureKind::CacheUnavailable => "cache_unavailable",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Internal => "internal",
        }
    }

    /// Generic advice for the user when nothing more specific is known.
    pub fn default_remediation(self) -> Option<&'static str> {
        match self {
            FailureKind::InvalidInput => Some("Check the sketch and prompt, then resubmit"),
            FailureKind::InvalidRequest => {
                Some("Adjust the request to fit the provider's limits or choose another provider")
            }
            FailureKind::RateLimited => Some("Wait a minute and try again"),
            FailureKind::ProviderUnavailable => {
                Some("Try again later or choose a different provider")
            }
            FailureKind::Timeout => Some("Try again, or lower the step count or resolution"),
            FailureKind::NoProviderAvailable => {
                Some("All providers are offline; try again once one recovers")
            }
            FailureKind::CacheUnavailable | FailureKind::Cancelled | FailureKind::Internal => None,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User-visible failure detail attached to a terminal job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
    pub retryable: bool,
    pub remediation: Option<String>,
}

impl JobFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.is_retryable(),
            remediation: kind.default_remediation().map(str::to_string),
        }
    }

    /// Replace the generic remediation with a more specific one.
    pub fn with_remediation(mut self, remediation: impl Into<String>) -> Self {
        self.remediation = Some(remediation.into());
        self
    }
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}
