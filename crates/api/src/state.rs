use std::sync::Arc;

use sketchforge_cache::CacheStore;
use sketchforge_events::ProgressBroadcaster;
use sketchforge_providers::{HttpBackend, ProviderError, ProviderRegistry};
use sketchforge_worker::QueueManager;

use crate::config::{OrchestratorConfig, ServerConfig};

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheaply cloneable; every component sits behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub queue: Arc<QueueManager>,
    pub registry: Arc<ProviderRegistry>,
    pub cache: Arc<CacheStore>,
    pub events: Arc<ProgressBroadcaster>,
}

impl AppState {
    /// Wire the cache, broadcaster and queue around an already populated
    /// registry. The queue's workers are not started.
    pub fn new(
        config: ServerConfig,
        orchestrator: &OrchestratorConfig,
        registry: Arc<ProviderRegistry>,
    ) -> Self {
        let cache = Arc::new(CacheStore::new(orchestrator.cache.clone()));
        let events = Arc::new(ProgressBroadcaster::default());
        let queue = Arc::new(QueueManager::new(
            orchestrator.queue.clone(),
            Arc::clone(&cache),
            Arc::clone(&registry),
            Arc::clone(&events),
        ));
        Self {
            config: Arc::new(config),
            queue,
            registry,
            cache,
            events,
        }
    }
}

/// Register every configured provider behind the generic HTTP backend,
/// sharing one connection pool.
pub fn build_registry(
    config: &OrchestratorConfig,
    client: reqwest::Client,
) -> Result<ProviderRegistry, ProviderError> {
    let registry = ProviderRegistry::new(config.rate_limit_windows);
    for provider in &config.providers {
        let backend = Arc::new(HttpBackend::from_config(client.clone(), provider));
        registry.register(provider.clone(), backend)?;
    }
    if let Some(default) = &config.default_provider {
        registry.set_default(default)?;
    }
    Ok(registry)
}
