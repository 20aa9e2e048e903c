//! Environment-driven configuration for the server and the orchestration
//! core.
//!
//! Both loaders read through a lookup function so tests can feed a plain map
//! instead of mutating the process environment.

use std::str::FromStr;
use std::time::Duration;

use sketchforge_cache::CacheConfig;
use sketchforge_core::generation::ImageFormat;
use sketchforge_core::scheduling::RetryPolicy;
use sketchforge_providers::descriptor::{parse_provider_configs, LocalProvider};
use sketchforge_providers::{Capabilities, ProviderConfig, RateLimitWindows, RateLimits};
use sketchforge_worker::QueueConfig;

/// The only queue store this build ships.
pub const MEMORY_STORE_URL: &str = "memory://";

/// Id of the provider registered when no `PROVIDERS_FILE` is given.
pub const DEFAULT_LOCAL_PROVIDER_ID: &str = "local-sd";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} has an invalid value {value:?}")]
    Invalid { key: &'static str, value: String },

    #[error("{key} must be greater than zero")]
    Zero { key: &'static str },

    #[error("Unsupported QUEUE_STORE_URL {0:?}; only {MEMORY_STORE_URL} is available")]
    UnsupportedStore(String),

    #[error("Cannot read providers file {path}: {source}")]
    ProvidersFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Providers(#[from] sketchforge_providers::ProviderError),
}

/// Server configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `3000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS`.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `30`).
    pub request_timeout_secs: u64,
    /// How long running jobs get to finish on shutdown (default: `30`).
    pub shutdown_timeout_secs: u64,
}

impl ServerConfig {
    /// Load configuration from the process environment.
    ///
    /// | Env Var                | Default                    |
    /// |------------------------|----------------------------|
    /// | `HOST`                 | `0.0.0.0`                  |
    /// | `PORT`                 | `3000`                     |
    /// | `CORS_ORIGINS`         | `http://localhost:5173`    |
    /// | `REQUEST_TIMEOUT_SECS` | `30`                       |
    /// | `SHUTDOWN_TIMEOUT_SECS`| `30`                       |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(vars: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let host = vars("HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port = parse_or(&vars, "PORT", 3000u16)?;

        let cors_origins: Vec<String> = vars("CORS_ORIGINS")
            .unwrap_or_else(|| "http://localhost:5173".into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let request_timeout_secs = positive(&vars, "REQUEST_TIMEOUT_SECS", 30u64)?;
        let shutdown_timeout_secs = parse_or(&vars, "SHUTDOWN_TIMEOUT_SECS", 30u64)?;

        Ok(Self {
            host,
            port,
            cors_origins,
            request_timeout_secs,
            shutdown_timeout_secs,
        })
    }
}

/// Tuning for the queue, cache and provider registry.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub queue: QueueConfig,
    pub cache: CacheConfig,
    pub rate_limit_windows: RateLimitWindows,
    pub health_check_interval: Duration,
    /// Overrides the first-registered default when set.
    pub default_provider: Option<String>,
    /// Provider list with credentials already attached.
    pub providers: Vec<ProviderConfig>,
}

impl OrchestratorConfig {
    /// Load configuration from the process environment.
    ///
    /// | Env Var                        | Default                  |
    /// |--------------------------------|--------------------------|
    /// | `QUEUE_STORE_URL`              | `memory://`              |
    /// | `MAX_CONCURRENT_JOBS`          | `3`                      |
    /// | `MAX_ATTEMPTS`                 | `3`                      |
    /// | `BACKOFF_BASE_MS`              | `2000`                   |
    /// | `BACKOFF_CAP_MS`               | `60000`                  |
    /// | `MAX_QUEUE_DEPTH`              | `100`                    |
    /// | `STALL_TIMEOUT_SECS`           | `300`                    |
    /// | `COMPLETED_RETENTION_SECS`     | `86400`                  |
    /// | `FAILED_RETENTION_SECS`        | `604800`                 |
    /// | `CACHE_TTL_SECS`               | `86400`                  |
    /// | `CACHE_CAPACITY`               | `1000`                   |
    /// | `RATE_LIMIT_MINUTE_WINDOW_SECS`| `60`                     |
    /// | `RATE_LIMIT_HOUR_WINDOW_SECS`  | `3600`                   |
    /// | `HEALTH_CHECK_INTERVAL_SECS`   | `60`                     |
    /// | `DEFAULT_PROVIDER`             | first registered         |
    /// | `PROVIDERS_FILE`               | built-in local provider  |
    /// | `LOCAL_PROVIDER_URL`           | `http://localhost:7860`  |
    /// | `<PROVIDER_ID>_API_KEY`        | none                     |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(vars: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let store = vars("QUEUE_STORE_URL").unwrap_or_else(|| MEMORY_STORE_URL.into());
        if store != MEMORY_STORE_URL {
            return Err(ConfigError::UnsupportedStore(store));
        }

        let queue_defaults = QueueConfig::default();
        let cache_defaults = CacheConfig::default();
        let retry_defaults = RetryPolicy::default();

        let retry = RetryPolicy {
            max_attempts: positive(&vars, "MAX_ATTEMPTS", retry_defaults.max_attempts)?,
            base_delay: millis(&vars, "BACKOFF_BASE_MS", retry_defaults.base_delay)?,
            max_delay: millis(&vars, "BACKOFF_CAP_MS", retry_defaults.max_delay)?,
        };
        if retry.max_delay < retry.base_delay {
            return Err(ConfigError::Invalid {
                key: "BACKOFF_CAP_MS",
                value: format!("{} (below BACKOFF_BASE_MS)", retry.max_delay.as_millis()),
            });
        }

        let queue = QueueConfig {
            max_concurrent_jobs: positive(
                &vars,
                "MAX_CONCURRENT_JOBS",
                queue_defaults.max_concurrent_jobs,
            )?,
            retry,
            max_queue_depth: positive(&vars, "MAX_QUEUE_DEPTH", queue_defaults.max_queue_depth)?,
            stall_timeout: secs(&vars, "STALL_TIMEOUT_SECS", queue_defaults.stall_timeout)?,
            completed_retention: secs_allow_zero(
                &vars,
                "COMPLETED_RETENTION_SECS",
                queue_defaults.completed_retention,
            )?,
            failed_retention: secs_allow_zero(
                &vars,
                "FAILED_RETENTION_SECS",
                queue_defaults.failed_retention,
            )?,
            ..queue_defaults
        };

        let cache = CacheConfig {
            capacity: parse_or(&vars, "CACHE_CAPACITY", cache_defaults.capacity)?,
            default_ttl: secs_allow_zero(&vars, "CACHE_TTL_SECS", cache_defaults.default_ttl)?,
            ..cache_defaults
        };

        let window_defaults = RateLimitWindows::default();
        let rate_limit_windows = RateLimitWindows {
            minute: secs(&vars, "RATE_LIMIT_MINUTE_WINDOW_SECS", window_defaults.minute)?,
            hour: secs(&vars, "RATE_LIMIT_HOUR_WINDOW_SECS", window_defaults.hour)?,
        };

        let health_check_interval = secs(
            &vars,
            "HEALTH_CHECK_INTERVAL_SECS",
            Duration::from_secs(60),
        )?;

        let configs = match vars("PROVIDERS_FILE") {
            Some(path) => {
                let json = std::fs::read_to_string(&path)
                    .map_err(|source| ConfigError::ProvidersFile { path, source })?;
                parse_provider_configs(&json)?
            }
            None => vec![default_local_provider(
                vars("LOCAL_PROVIDER_URL").unwrap_or_else(|| "http://localhost:7860".into()),
            )],
        };
        let providers = configs
            .into_iter()
            .map(|config| match vars(&config.credential_env_var()) {
                Some(key) if !key.trim().is_empty() => config.with_api_key(key.trim()),
                _ => config,
            })
            .collect();

        Ok(Self {
            queue,
            cache,
            rate_limit_windows,
            health_check_interval,
            default_provider: vars("DEFAULT_PROVIDER").filter(|s| !s.trim().is_empty()),
            providers,
        })
    }
}

/// The self-hosted Stable Diffusion endpoint used when no provider list is
/// configured.
pub fn default_local_provider(api_url: String) -> ProviderConfig {
    ProviderConfig::Local(LocalProvider {
        id: DEFAULT_LOCAL_PROVIDER_ID.to_string(),
        name: "Local Stable Diffusion".to_string(),
        api_url,
        model: "stable-diffusion-xl".to_string(),
        capabilities: Capabilities {
            max_width: 1024,
            max_height: 1024,
            supported_formats: vec![ImageFormat::Png, ImageFormat::Jpeg],
            max_prompt_length: 1000,
            image_to_image: true,
        },
        rate_limits: RateLimits {
            per_minute: 30,
            per_hour: 1000,
            concurrent: 1,
        },
        timeout_secs: 120,
    })
}

// ---- private helpers ----

fn parse_or<T: FromStr>(
    vars: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match vars(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}

fn positive<T: FromStr + PartialOrd + Default>(
    vars: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    let value = parse_or(vars, key, default)?;
    if value <= T::default() {
        return Err(ConfigError::Zero { key });
    }
    Ok(value)
}

fn secs(
    vars: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    positive(vars, key, default.as_secs()).map(Duration::from_secs)
}

fn secs_allow_zero(
    vars: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    parse_or(vars, key, default.as_secs()).map(Duration::from_secs)
}

fn millis(
    vars: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    positive(vars, key, ms).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn server_defaults() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.cors_origins, vec!["http://localhost:5173"]);
        assert_eq!(config.request_timeout_secs, 30);
    }

    #[test]
    fn server_parses_origins_and_rejects_bad_port() {
        let config = ServerConfig::from_lookup(lookup(&[(
            "CORS_ORIGINS",
            "http://a.test, ,http://b.test",
        )]))
        .unwrap();
        assert_eq!(config.cors_origins, vec!["http://a.test", "http://b.test"]);

        assert_matches!(
            ServerConfig::from_lookup(lookup(&[("PORT", "eighty")])),
            Err(ConfigError::Invalid { key: "PORT", .. })
        );
    }

    #[test]
    fn orchestrator_defaults_register_local_provider() {
        let config = OrchestratorConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.queue.max_concurrent_jobs, 3);
        assert_eq!(config.queue.retry.max_attempts, 3);
        assert_eq!(config.providers.len(), 1);
        assert_eq!(config.providers[0].id(), DEFAULT_LOCAL_PROVIDER_ID);
        assert_eq!(config.providers[0].api_url(), "http://localhost:7860");
        assert!(config.default_provider.is_none());
    }

    #[test]
    fn orchestrator_reads_overrides() {
        let config = OrchestratorConfig::from_lookup(lookup(&[
            ("MAX_CONCURRENT_JOBS", "8"),
            ("MAX_ATTEMPTS", "5"),
            ("BACKOFF_BASE_MS", "250"),
            ("BACKOFF_CAP_MS", "4000"),
            ("CACHE_TTL_SECS", "0"),
            ("CACHE_CAPACITY", "10"),
            ("LOCAL_PROVIDER_URL", "http://gpu-box:7860"),
            ("DEFAULT_PROVIDER", "local-sd"),
        ]))
        .unwrap();

        assert_eq!(config.queue.max_concurrent_jobs, 8);
        assert_eq!(config.queue.retry.max_attempts, 5);
        assert_eq!(config.queue.retry.base_delay, Duration::from_millis(250));
        assert_eq!(config.queue.retry.max_delay, Duration::from_secs(4));
        assert_eq!(config.cache.default_ttl, Duration::ZERO);
        assert_eq!(config.cache.capacity, 10);
        assert_eq!(config.providers[0].api_url(), "http://gpu-box:7860");
        assert_eq!(config.default_provider.as_deref(), Some("local-sd"));
    }

    #[test]
    fn zero_intervals_are_rejected() {
        for key in [
            "MAX_CONCURRENT_JOBS",
            "MAX_ATTEMPTS",
            "STALL_TIMEOUT_SECS",
            "HEALTH_CHECK_INTERVAL_SECS",
            "RATE_LIMIT_MINUTE_WINDOW_SECS",
        ] {
            assert_matches!(
                OrchestratorConfig::from_lookup(lookup(&[(key, "0")])),
                Err(ConfigError::Zero { .. }),
                "{key}"
            );
        }
    }

    #[test]
    fn only_memory_store_is_accepted() {
        assert_matches!(
            OrchestratorConfig::from_lookup(lookup(&[("QUEUE_STORE_URL", "redis://localhost")])),
            Err(ConfigError::UnsupportedStore(_))
        );
    }

    #[test]
    fn backoff_cap_below_base_is_invalid() {
        assert_matches!(
            OrchestratorConfig::from_lookup(lookup(&[
                ("BACKOFF_BASE_MS", "5000"),
                ("BACKOFF_CAP_MS", "1000"),
            ])),
            Err(ConfigError::Invalid {
                key: "BACKOFF_CAP_MS",
                ..
            })
        );
    }

    #[test]
    fn providers_file_gets_credentials_from_env() {
        let path = std::env::temp_dir().join(format!("providers-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            r#"[{
                "type": "hosted",
                "id": "stability-xl",
                "name": "Stability",
                "api_url": "https://api.stability.test",
                "model": "sdxl",
                "capabilities": {
                    "max_width": 1024, "max_height": 1024,
                    "supported_formats": ["png"],
                    "max_prompt_length": 2000, "image_to_image": true
                },
                "pricing": {"cost_per_generation": 0.04, "currency": "USD"},
                "rate_limits": {"per_minute": 150, "per_hour": 5000, "concurrent": 4}
            }]"#,
        )
        .unwrap();
        let path_str = path.to_string_lossy().to_string();

        let config = OrchestratorConfig::from_lookup(lookup(&[
            ("PROVIDERS_FILE", path_str.as_str()),
            ("STABILITY_XL_API_KEY", " sk-test "),
        ]))
        .unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.providers.len(), 1);
        assert_eq!(config.providers[0].api_key(), Some("sk-test"));
    }

    #[test]
    fn missing_providers_file_is_reported() {
        assert_matches!(
            OrchestratorConfig::from_lookup(lookup(&[(
                "PROVIDERS_FILE",
                "/nonexistent/providers.json"
            )])),
            Err(ConfigError::ProvidersFile { .. })
        );
    }
}
