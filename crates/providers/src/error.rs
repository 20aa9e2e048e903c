use std::time::Duration;

use sketchforge_core::failure::{FailureKind, JobFailure};

/// Errors from the provider registry.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Provider {0} not found")]
    NotFound(String),

    #[error("Provider {0} is already registered")]
    Duplicate(String),

    #[error("Invalid configuration for provider {provider_id}: {message}")]
    InvalidConfig { provider_id: String, message: String },

    /// Every eligible provider is offline or in maintenance.
    #[error("No provider available")]
    NoProviderAvailable,

    /// Providers are online but every one is out of rate-limit budget.
    #[error("All providers are rate limited; retry after {} ms", retry_after.as_millis())]
    RateLimited { retry_after: Duration },
}

impl ProviderError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ProviderError::NotFound(_) | ProviderError::NoProviderAvailable => {
                FailureKind::NoProviderAvailable
            }
            ProviderError::Duplicate(_) | ProviderError::InvalidConfig { .. } => {
                FailureKind::Internal
            }
            ProviderError::RateLimited { .. } => FailureKind::RateLimited,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    pub fn to_failure(&self) -> JobFailure {
        JobFailure::new(self.kind(), self.to_string())
    }
}

/// Classified failure of one provider invocation.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("Provider {0} not found")]
    NotFound(String),

    /// Local or remote rate limit exhausted. Retryable.
    #[error("Provider {provider_id} is rate limited; retry after {} ms", retry_after.as_millis())]
    RateLimited {
        provider_id: String,
        retry_after: Duration,
    },

    /// The provider cannot serve this request as-is. Not retryable.
    #[error("Invalid request for provider {provider_id}: {message}")]
    InvalidRequest {
        provider_id: String,
        message: String,
        remediation: Option<String>,
    },

    /// Network failure, 5xx, malformed response, offline status. Retryable.
    #[error("Provider {provider_id} unavailable: {message}")]
    ProviderUnavailable { provider_id: String, message: String },

    /// The call exceeded the provider's timeout. Retryable.
    #[error("Provider {provider_id} timed out after {} ms", elapsed.as_millis())]
    Timeout {
        provider_id: String,
        elapsed: Duration,
    },
}

impl InvokeError {
    pub fn kind(&self) -> FailureKind {
        match self {
            InvokeError::NotFound(_) => FailureKind::NoProviderAvailable,
            InvokeError::RateLimited { .. } => FailureKind::RateLimited,
            InvokeError::InvalidRequest { .. } => FailureKind::InvalidRequest,
            InvokeError::ProviderUnavailable { .. } => FailureKind::ProviderUnavailable,
            InvokeError::Timeout { .. } => FailureKind::Timeout,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Backoff hint supplied by the provider, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            InvokeError::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// User-visible failure detail.
    pub fn to_failure(&self) -> JobFailure {
        let failure = JobFailure::new(self.kind(), self.to_string());
        match self {
            InvokeError::InvalidRequest {
                remediation: Some(remediation),
                ..
            } => failure.with_remediation(remediation.clone()),
            _ => failure,
        }
    }
}
