//! Provider configuration and descriptors.
//!
//! Each provider type is a tagged [`ProviderConfig`] variant sharing one
//! capability interface. Configurations are validated once, at
//! registration, so the invoker can trust them at call time.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sketchforge_core::generation::ImageFormat;

use crate::error::ProviderError;
use crate::rate_limit::RateLimitUsage;

/// Maximum length of a provider id.
const MAX_ID_LEN: usize = 64;

/// Default upper bound on one generation call.
const DEFAULT_TIMEOUT_SECS: u64 = 120;

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

// ---------------------------------------------------------------------------
// Shared parts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Largest output width the provider accepts.
    pub max_width: u32,
    /// Largest output height the provider accepts.
    pub max_height: u32,
    pub supported_formats: Vec<ImageFormat>,
    pub max_prompt_length: usize,
    pub image_to_image: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub cost_per_generation: f64,
    pub currency: String,
    /// Generations per process lifetime that are not billed.
    #[serde(default)]
    pub free_quota: u64,
}

impl Pricing {
    pub fn free() -> Self {
        Self {
            cost_per_generation: 0.0,
            currency: "USD".to_string(),
            free_quota: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimits {
    pub per_minute: u32,
    pub per_hour: u32,
    pub concurrent: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Online,
    Offline,
    Maintenance,
    RateLimited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Hosted,
    Local,
}

// ---------------------------------------------------------------------------
// Tagged configuration
// ---------------------------------------------------------------------------

/// A commercial API billed per generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostedProvider {
    pub id: String,
    pub name: String,
    pub api_url: String,
    pub model: String,
    /// Filled from the environment; never serialized back out.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    pub capabilities: Capabilities,
    pub pricing: Pricing,
    pub rate_limits: RateLimits,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// A self-hosted inference server. Never billed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalProvider {
    pub id: String,
    pub name: String,
    pub api_url: String,
    pub model: String,
    pub capabilities: Capabilities,
    pub rate_limits: RateLimits,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderConfig {
    Hosted(HostedProvider),
    Local(LocalProvider),
}

impl ProviderConfig {
    pub fn id(&self) -> &str {
        match self {
            ProviderConfig::Hosted(p) => &p.id,
            ProviderConfig::Local(p) => &p.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ProviderConfig::Hosted(p) => &p.name,
            ProviderConfig::Local(p) => &p.name,
        }
    }

    pub fn kind(&self) -> ProviderKind {
        match self {
            ProviderConfig::Hosted(_) => ProviderKind::Hosted,
            ProviderConfig::Local(_) => ProviderKind::Local,
        }
    }

    pub fn api_url(&self) -> &str {
        match self {
            ProviderConfig::Hosted(p) => &p.api_url,
            ProviderConfig::Local(p) => &p.api_url,
        }
    }

    pub fn api_key(&self) -> Option<&str> {
        match self {
            ProviderConfig::Hosted(p) => p.api_key.as_deref(),
            ProviderConfig::Local(_) => None,
        }
    }

    pub fn model(&self) -> &str {
        match self {
            ProviderConfig::Hosted(p) => &p.model,
            ProviderConfig::Local(p) => &p.model,
        }
    }

    pub fn capabilities(&self) -> &Capabilities {
        match self {
            ProviderConfig::Hosted(p) => &p.capabilities,
            ProviderConfig::Local(p) => &p.capabilities,
        }
    }

    pub fn pricing(&self) -> Pricing {
        match self {
            ProviderConfig::Hosted(p) => p.pricing.clone(),
            ProviderConfig::Local(_) => Pricing::free(),
        }
    }

    pub fn rate_limits(&self) -> RateLimits {
        match self {
            ProviderConfig::Hosted(p) => p.rate_limits,
            ProviderConfig::Local(p) => p.rate_limits,
        }
    }

    pub fn timeout(&self) -> Duration {
        let secs = match self {
            ProviderConfig::Hosted(p) => p.timeout_secs,
            ProviderConfig::Local(p) => p.timeout_secs,
        };
        Duration::from_secs(secs)
    }

    /// Attach an API key to a hosted provider. Local providers ignore it.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        if let ProviderConfig::Hosted(p) = &mut self {
            p.api_key = Some(key.into());
        }
        self
    }

    /// Environment variable holding this provider's credential,
    /// e.g. `stability-xl` -> `STABILITY_XL_API_KEY`.
    pub fn credential_env_var(&self) -> String {
        let id: String = self
            .id()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{id}_API_KEY")
    }

    /// Check the configuration before the provider is registered.
    ///
    /// Rules:
    /// - Id is non-empty, at most `MAX_ID_LEN` chars, lowercase
    ///   alphanumeric, hyphen or underscore.
    /// - API URL is http(s).
    /// - Capabilities, rate limits and timeout are positive.
    /// - Hosted providers have a credential and a non-negative price.
    pub fn validate(&self) -> Result<(), ProviderError> {
        let id = self.id();
        let invalid = |msg: String| ProviderError::InvalidConfig {
            provider_id: id.to_string(),
            message: msg,
        };

        if id.is_empty() || id.len() > MAX_ID_LEN {
            return Err(invalid(format!(
                "Provider id must be 1-{MAX_ID_LEN} characters"
            )));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            return Err(invalid(
                "Provider id may only contain lowercase alphanumeric, hyphen or underscore"
                    .to_string(),
            ));
        }

        let url = self.api_url();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(invalid(format!("API URL must be http(s), got \"{url}\"")));
        }
        if self.model().trim().is_empty() {
            return Err(invalid("Model must not be empty".to_string()));
        }

        let caps = self.capabilities();
        if caps.max_width == 0 || caps.max_height == 0 {
            return Err(invalid("Max resolution must be positive".to_string()));
        }
        if caps.supported_formats.is_empty() {
            return Err(invalid("At least one output format is required".to_string()));
        }
        if caps.max_prompt_length == 0 {
            return Err(invalid("Max prompt length must be positive".to_string()));
        }

        let limits = self.rate_limits();
        if limits.per_minute == 0 || limits.per_hour == 0 || limits.concurrent == 0 {
            return Err(invalid("Rate limits must be positive".to_string()));
        }
        if self.timeout().is_zero() {
            return Err(invalid("Timeout must be positive".to_string()));
        }

        if let ProviderConfig::Hosted(p) = self {
            if p.api_key.as_deref().map_or(true, |k| k.trim().is_empty()) {
                return Err(invalid(format!(
                    "Missing credential; set {}",
                    self.credential_env_var()
                )));
            }
            if !p.pricing.cost_per_generation.is_finite() || p.pricing.cost_per_generation < 0.0
            {
                return Err(invalid("Cost must be a non-negative number".to_string()));
            }
        }

        Ok(())
    }
}

/// Parse a JSON array of provider configurations.
pub fn parse_provider_configs(json: &str) -> Result<Vec<ProviderConfig>, ProviderError> {
    serde_json::from_str(json).map_err(|e| ProviderError::InvalidConfig {
        provider_id: "*".to_string(),
        message: format!("Unparseable provider list: {e}"),
    })
}

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// Read-only view of a registered provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderDescriptor {
    pub id: String,
    pub name: String,
    pub kind: ProviderKind,
    pub model: String,
    pub capabilities: Capabilities,
    pub pricing: Pricing,
    pub rate_limits: RateLimits,
    pub status: ProviderStatus,
    pub usage: RateLimitUsage,
    pub timeout_secs: u64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
