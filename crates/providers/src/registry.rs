//! Registered providers, their health, rate limits and selection.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use sketchforge_core::generation::GenerationRequest;

use crate::backend::GenerationBackend;
use crate::descriptor::{ProviderConfig, ProviderDescriptor, ProviderStatus};
use crate::error::ProviderError;
use crate::rate_limit::{RateLimitWindows, RateLimiter};

/// Upper bound on a single health probe, regardless of what the backend
/// does internally.
pub const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Quote for one generation on one provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostEstimate {
    pub provider_id: String,
    /// What this request would be billed right now.
    pub cost: f64,
    /// Declared price per generation, before any free quota.
    pub cost_per_generation: f64,
    pub currency: String,
    pub within_free_quota: bool,
    pub max_cost: Option<f64>,
    pub within_budget: bool,
}

struct Health {
    status: ProviderStatus,
    /// Set while `status` is `RateLimited`; the status reverts to online
    /// once this passes.
    rate_limited_until: Option<Instant>,
    /// Offline because a generation call failed, not because a probe did.
    tripped: bool,
}

pub(crate) struct ProviderEntry {
    pub(crate) config: ProviderConfig,
    pub(crate) backend: Arc<dyn GenerationBackend>,
    pub(crate) limiter: RateLimiter,
    health: Mutex<Health>,
    /// Billable generations so far, used against the free quota.
    generations: AtomicU64,
}

impl ProviderEntry {
    pub(crate) fn status(&self) -> ProviderStatus {
        let mut health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        if health.status == ProviderStatus::RateLimited
            && health
                .rate_limited_until
                .is_some_and(|until| until <= Instant::now())
        {
            health.status = ProviderStatus::Online;
            health.rate_limited_until = None;
        }
        health.status
    }

    /// Remaining time in a provider-imposed rate limit.
    pub(crate) fn rate_limited_for(&self) -> Option<Duration> {
        if self.status() != ProviderStatus::RateLimited {
            return None;
        }
        let health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        health
            .rate_limited_until
            .map(|until| until.saturating_duration_since(Instant::now()))
    }

    fn set_status(&self, status: ProviderStatus, until: Option<Instant>) {
        let mut health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        health.status = status;
        health.rate_limited_until = until;
        health.tripped = false;
    }

    /// Offline only through a failed call. Such a provider stays a last
    /// resort for selection until a probe confirms it is down.
    pub(crate) fn tripped(&self) -> bool {
        let health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        health.tripped && health.status == ProviderStatus::Offline
    }

    fn in_free_quota(&self) -> bool {
        self.generations.load(Ordering::Acquire) < self.config.pricing().free_quota
    }

    /// Cost the next generation would be billed.
    pub(crate) fn quoted_cost(&self) -> f64 {
        if self.in_free_quota() {
            0.0
        } else {
            self.config.pricing().cost_per_generation
        }
    }

    /// Record one billable generation and return what it cost.
    pub(crate) fn charge(&self) -> f64 {
        let previous = self.generations.fetch_add(1, Ordering::AcqRel);
        let pricing = self.config.pricing();
        if previous < pricing.free_quota {
            0.0
        } else {
            pricing.cost_per_generation
        }
    }

    fn descriptor(&self) -> ProviderDescriptor {
        let config = &self.config;
        ProviderDescriptor {
            id: config.id().to_string(),
            name: config.name().to_string(),
            kind: config.kind(),
            model: config.model().to_string(),
            capabilities: config.capabilities().clone(),
            pricing: config.pricing(),
            rate_limits: config.rate_limits(),
            status: self.status(),
            usage: self.limiter.snapshot(),
            timeout_secs: config.timeout().as_secs(),
        }
    }
}

/// All known providers.
///
/// Designed to be shared via `Arc<ProviderRegistry>`.
pub struct ProviderRegistry {
    providers: RwLock<BTreeMap<String, Arc<ProviderEntry>>>,
    default_id: RwLock<Option<String>>,
    windows: RateLimitWindows,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("windows", &self.windows)
            .finish_non_exhaustive()
    }
}

impl ProviderRegistry {
    pub fn new(windows: RateLimitWindows) -> Self {
        Self {
            providers: RwLock::new(BTreeMap::new()),
            default_id: RwLock::new(None),
            windows,
        }
    }

    /// Validate and add a provider. The first provider registered becomes
    /// the default until [`ProviderRegistry::set_default`] says otherwise.
    pub fn register(
        &self,
        config: ProviderConfig,
        backend: Arc<dyn GenerationBackend>,
    ) -> Result<(), ProviderError> {
        config.validate()?;
        let id = config.id().to_string();

        let mut providers = self.providers.write().unwrap_or_else(|e| e.into_inner());
        if providers.contains_key(&id) {
            return Err(ProviderError::Duplicate(id));
        }

        let limiter = RateLimiter::new(config.rate_limits(), self.windows);
        tracing::info!(
            provider_id = %id,
            kind = ?config.kind(),
            model = config.model(),
            "Registered provider",
        );
        providers.insert(
            id.clone(),
            Arc::new(ProviderEntry {
                config,
                backend,
                limiter,
                health: Mutex::new(Health {
                    status: ProviderStatus::Online,
                    rate_limited_until: None,
                    tripped: false,
                }),
                generations: AtomicU64::new(0),
            }),
        );
        drop(providers);

        let mut default_id = self.default_id.write().unwrap_or_else(|e| e.into_inner());
        if default_id.is_none() {
            *default_id = Some(id);
        }
        Ok(())
    }

    pub fn set_default(&self, id: &str) -> Result<(), ProviderError> {
        self.entry(id)?;
        *self.default_id.write().unwrap_or_else(|e| e.into_inner()) = Some(id.to_string());
        Ok(())
    }

    pub fn default_provider_id(&self) -> Option<String> {
        self.default_id
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read_providers().contains_key(id)
    }

    pub fn is_empty(&self) -> bool {
        self.read_providers().is_empty()
    }

    pub fn list(&self) -> Vec<ProviderDescriptor> {
        self.read_providers()
            .values()
            .map(|entry| entry.descriptor())
            .collect()
    }

    pub fn get(&self, id: &str) -> Result<ProviderDescriptor, ProviderError> {
        self.entry(id).map(|entry| entry.descriptor())
    }

    pub fn set_status(&self, id: &str, status: ProviderStatus) -> Result<(), ProviderError> {
        let entry = self.entry(id)?;
        entry.set_status(status, None);
        tracing::info!(provider_id = %id, status = ?status, "Provider status changed");
        Ok(())
    }

    /// Probe one provider and record the outcome.
    ///
    /// A successful probe brings an offline provider back online; a failed
    /// one takes it offline. Providers in maintenance keep that status.
    pub async fn check_health(&self, id: &str) -> Result<bool, ProviderError> {
        let entry = self.entry(id)?;
        let healthy = tokio::time::timeout(HEALTH_PROBE_TIMEOUT, entry.backend.probe())
            .await
            .unwrap_or(false);

        match (entry.status(), healthy) {
            (ProviderStatus::Maintenance, _) => {}
            (ProviderStatus::Offline, true) => {
                entry.set_status(ProviderStatus::Online, None);
                tracing::info!(provider_id = %id, "Provider back online");
            }
            (ProviderStatus::Offline, false) => {
                if entry.tripped() {
                    entry.set_status(ProviderStatus::Offline, None);
                    tracing::warn!(provider_id = %id, "Provider confirmed offline");
                }
            }
            (_, false) => {
                entry.set_status(ProviderStatus::Offline, None);
                tracing::warn!(provider_id = %id, "Provider failed health check");
            }
            (_, true) => {}
        }
        Ok(healthy)
    }

    /// Probe every provider concurrently.
    pub async fn check_all(&self) -> Vec<(String, bool)> {
        let ids: Vec<String> = self.read_providers().keys().cloned().collect();
        let probes = ids.iter().map(|id| async move {
            let healthy = self.check_health(id).await.unwrap_or(false);
            (id.clone(), healthy)
        });
        futures::future::join_all(probes).await
    }

    /// Pick a provider: `requested`, then the default, then the cheapest,
    /// taking the first that is online and within its rate limits. When
    /// nothing is online, providers taken offline by a failed call are
    /// still candidates so retries can reach them.
    pub fn select_default(&self, requested: Option<&str>) -> Result<String, ProviderError> {
        self.select(requested, None)
    }

    /// Like [`ProviderRegistry::select_default`], preferring providers whose
    /// quoted cost fits under `max_cost`. When none fits, selection ignores
    /// the ceiling so the invoker can report it with a remediation.
    pub fn select(
        &self,
        requested: Option<&str>,
        max_cost: Option<f64>,
    ) -> Result<String, ProviderError> {
        let providers = self.read_providers();
        let default_id = self.default_provider_id();

        let mut available: Vec<&Arc<ProviderEntry>> = providers
            .values()
            .filter(|e| e.status() == ProviderStatus::Online && e.limiter.has_capacity())
            .collect();
        if available.is_empty() {
            available = providers
                .values()
                .filter(|e| e.tripped() && e.limiter.has_capacity())
                .collect();
        }

        let affordable: Vec<&Arc<ProviderEntry>> = available
            .iter()
            .copied()
            .filter(|e| max_cost.map_or(true, |max| e.quoted_cost() <= max))
            .collect();
        let pool = if affordable.is_empty() {
            &available
        } else {
            &affordable
        };

        let preferred = [requested, default_id.as_deref()];
        for id in preferred.into_iter().flatten() {
            if let Some(entry) = pool.iter().find(|e| e.config.id() == id) {
                return Ok(entry.config.id().to_string());
            }
        }

        let cheapest = pool.iter().min_by(|a, b| {
            a.quoted_cost()
                .partial_cmp(&b.quoted_cost())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        if let Some(entry) = cheapest {
            return Ok(entry.config.id().to_string());
        }

        // Nothing usable. Distinguish "everything is down" from "everything
        // is busy" so the caller knows whether to retry.
        let soonest = providers
            .values()
            .filter_map(|e| match e.status() {
                ProviderStatus::Online => e.limiter.wait_time(),
                ProviderStatus::RateLimited => e.rate_limited_for(),
                ProviderStatus::Offline | ProviderStatus::Maintenance => None,
            })
            .min();
        match soonest {
            Some(retry_after) => Err(ProviderError::RateLimited { retry_after }),
            None => Err(ProviderError::NoProviderAvailable),
        }
    }

    /// Quote a request on `provider_id`, or on the default provider.
    pub fn estimate_cost(
        &self,
        provider_id: Option<&str>,
        request: &GenerationRequest,
    ) -> Result<CostEstimate, ProviderError> {
        let id = match provider_id.or(request.provider_id.as_deref()) {
            Some(id) => id.to_string(),
            None => self
                .default_provider_id()
                .ok_or(ProviderError::NoProviderAvailable)?,
        };
        let entry = self.entry(&id)?;
        let pricing = entry.config.pricing();
        let cost = entry.quoted_cost();

        Ok(CostEstimate {
            provider_id: id,
            cost,
            cost_per_generation: pricing.cost_per_generation,
            currency: pricing.currency,
            within_free_quota: entry.in_free_quota(),
            max_cost: request.max_cost,
            within_budget: request.max_cost.map_or(true, |max| cost <= max),
        })
    }

    // ---- crate-internal ----

    pub(crate) fn entry(&self, id: &str) -> Result<Arc<ProviderEntry>, ProviderError> {
        self.read_providers()
            .get(id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(id.to_string()))
    }

    /// Record a provider-imposed rate limit.
    pub(crate) fn mark_rate_limited(&self, id: &str, retry_after: Duration) {
        if let Ok(entry) = self.entry(id) {
            entry.set_status(
                ProviderStatus::RateLimited,
                Some(Instant::now() + retry_after),
            );
            tracing::warn!(
                provider_id = %id,
                retry_after_ms = retry_after.as_millis() as u64,
                "Provider rate limited",
            );
        }
    }

    /// Take a provider offline after a failed call.
    pub(crate) fn mark_offline(&self, id: &str, reason: &str) {
        if let Ok(entry) = self.entry(id) {
            let mut health = entry.health.lock().unwrap_or_else(|e| e.into_inner());
            if health.status != ProviderStatus::Maintenance {
                health.status = ProviderStatus::Offline;
                health.rate_limited_until = None;
                health.tripped = true;
                tracing::warn!(provider_id = %id, reason, "Provider marked offline");
            }
        }
    }

    /// Bring a provider back after a successful call while it was tripped.
    pub(crate) fn mark_recovered(&self, id: &str) {
        if let Ok(entry) = self.entry(id) {
            if entry.tripped() {
                entry.set_status(ProviderStatus::Online, None);
                tracing::info!(provider_id = %id, "Provider recovered");
            }
        }
    }

    pub(crate) fn windows(&self) -> RateLimitWindows {
        self.windows
    }

    fn read_providers(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Arc<ProviderEntry>>> {
        self.providers.read().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new(RateLimitWindows::default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::AtomicBool;

    use assert_matches::assert_matches;
    use async_trait::async_trait;

    use super::*;
    use crate::backend::{BackendError, BackendOutput, BackendRequest};
    use crate::descriptor::tests::{hosted, local};
    use crate::descriptor::{Pricing, ProviderConfig};

    /// Backend whose probe result can be flipped; never generates.
    pub(crate) struct ProbeOnly(pub(crate) AtomicBool);

    #[async_trait]
    impl GenerationBackend for ProbeOnly {
        async fn generate(&self, _: &BackendRequest) -> Result<BackendOutput, BackendError> {
            Err(BackendError::Unavailable("probe-only backend".into()))
        }

        async fn probe(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn healthy() -> Arc<dyn GenerationBackend> {
        Arc::new(ProbeOnly(AtomicBool::new(true)))
    }

    fn sample_request() -> GenerationRequest {
        let sketch = sketchforge_core::generation::SketchImage {
            bytes: vec![1, 2, 3],
            format: sketchforge_core::generation::ImageFormat::Png,
            width: 64,
            height: 64,
            palette: Vec::new(),
        };
        GenerationRequest::new(sketch, "a lighthouse at dusk")
    }

    #[test]
    fn register_rejects_duplicates_and_invalid_configs() {
        let registry = ProviderRegistry::default();
        registry.register(local("local-sd"), healthy()).unwrap();

        assert_matches!(
            registry.register(local("local-sd"), healthy()),
            Err(ProviderError::Duplicate(_))
        );
        assert_matches!(
            registry.register(local("Bad Id"), healthy()),
            Err(ProviderError::InvalidConfig { .. })
        );
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn first_registered_is_default() {
        let registry = ProviderRegistry::default();
        registry.register(hosted("pricey", 0.10), healthy()).unwrap();
        registry.register(local("local-sd"), healthy()).unwrap();
        assert_eq!(registry.default_provider_id().as_deref(), Some("pricey"));

        registry.set_default("local-sd").unwrap();
        assert_eq!(registry.default_provider_id().as_deref(), Some("local-sd"));
        assert_matches!(registry.set_default("nope"), Err(ProviderError::NotFound(_)));
    }

    #[test]
    fn selection_prefers_requested_then_default_then_cheapest() {
        let registry = ProviderRegistry::default();
        registry.register(hosted("pricey", 0.10), healthy()).unwrap();
        registry.register(hosted("cheap", 0.01), healthy()).unwrap();
        registry.register(hosted("mid", 0.05), healthy()).unwrap();

        assert_eq!(registry.select_default(Some("mid")).unwrap(), "mid");
        assert_eq!(registry.select_default(None).unwrap(), "pricey");

        registry.set_status("pricey", ProviderStatus::Offline).unwrap();
        assert_eq!(registry.select_default(Some("pricey")).unwrap(), "cheap");
    }

    #[test]
    fn selection_honours_cost_ceiling_when_possible() {
        let registry = ProviderRegistry::default();
        registry.register(hosted("pricey", 0.10), healthy()).unwrap();
        registry.register(hosted("cheap", 0.01), healthy()).unwrap();

        assert_eq!(registry.select(None, Some(0.02)).unwrap(), "cheap");
        // Nothing fits: fall back to the normal order.
        assert_eq!(registry.select(None, Some(0.001)).unwrap(), "pricey");
    }

    #[test]
    fn all_offline_is_no_provider_available() {
        let registry = ProviderRegistry::default();
        registry.register(local("a"), healthy()).unwrap();
        registry.set_status("a", ProviderStatus::Maintenance).unwrap();

        assert_matches!(
            registry.select_default(None),
            Err(ProviderError::NoProviderAvailable)
        );
        assert_matches!(
            ProviderRegistry::default().select_default(None),
            Err(ProviderError::NoProviderAvailable)
        );
    }

    #[tokio::test]
    async fn provider_tripped_by_a_call_stays_selectable_until_probe_confirms() {
        let registry = ProviderRegistry::default();
        let backend = Arc::new(ProbeOnly(AtomicBool::new(false)));
        registry.register(local("a"), backend.clone()).unwrap();
        registry.register(local("b"), healthy()).unwrap();

        registry.mark_offline("a", "502 from upstream");
        assert_eq!(registry.get("a").unwrap().status, ProviderStatus::Offline);
        // An online provider still wins.
        assert_eq!(registry.select_default(Some("a")).unwrap(), "b");

        registry.set_status("b", ProviderStatus::Maintenance).unwrap();
        assert_eq!(registry.select_default(None).unwrap(), "a");

        assert!(!registry.check_health("a").await.unwrap());
        assert_matches!(
            registry.select_default(None),
            Err(ProviderError::NoProviderAvailable)
        );
    }

    #[test]
    fn successful_call_recovers_tripped_provider() {
        let registry = ProviderRegistry::default();
        registry.register(local("a"), healthy()).unwrap();

        registry.mark_offline("a", "connection reset");
        registry.mark_recovered("a");
        assert_eq!(registry.get("a").unwrap().status, ProviderStatus::Online);

        // A provider taken down by hand is not revived by a call.
        registry.set_status("a", ProviderStatus::Offline).unwrap();
        registry.mark_recovered("a");
        assert_eq!(registry.get("a").unwrap().status, ProviderStatus::Offline);
    }

    #[test]
    fn exhausted_rate_limit_is_reported_with_wait() {
        let registry = ProviderRegistry::default();
        let mut config = local("solo");
        if let ProviderConfig::Local(p) = &mut config {
            p.rate_limits.per_minute = 1;
        }
        registry.register(config, healthy()).unwrap();

        let entry = registry.entry("solo").unwrap();
        let _permit = entry.limiter.try_acquire().unwrap();

        let err = registry.select_default(None).unwrap_err();
        assert_matches!(err, ProviderError::RateLimited { retry_after } if retry_after > Duration::ZERO);
    }

    #[test]
    fn provider_rate_limit_expires() {
        let registry = ProviderRegistry::default();
        registry.register(local("a"), healthy()).unwrap();

        registry.mark_rate_limited("a", Duration::from_secs(60));
        assert_eq!(registry.get("a").unwrap().status, ProviderStatus::RateLimited);
        assert_matches!(
            registry.select_default(None),
            Err(ProviderError::RateLimited { .. })
        );

        registry.mark_rate_limited("a", Duration::ZERO);
        assert_eq!(registry.get("a").unwrap().status, ProviderStatus::Online);
    }

    #[tokio::test]
    async fn health_check_updates_status() {
        let registry = ProviderRegistry::default();
        let backend = Arc::new(ProbeOnly(AtomicBool::new(false)));
        registry.register(local("a"), backend.clone()).unwrap();

        assert!(!registry.check_health("a").await.unwrap());
        assert_eq!(registry.get("a").unwrap().status, ProviderStatus::Offline);

        backend.0.store(true, Ordering::SeqCst);
        assert!(registry.check_health("a").await.unwrap());
        assert_eq!(registry.get("a").unwrap().status, ProviderStatus::Online);

        assert_matches!(
            registry.check_health("missing").await,
            Err(ProviderError::NotFound(_))
        );
    }

    #[tokio::test]
    async fn maintenance_survives_health_checks() {
        let registry = ProviderRegistry::default();
        registry.register(local("a"), healthy()).unwrap();
        registry.set_status("a", ProviderStatus::Maintenance).unwrap();

        let results = registry.check_all().await;
        assert_eq!(results, vec![("a".to_string(), true)]);
        assert_eq!(registry.get("a").unwrap().status, ProviderStatus::Maintenance);
    }

    #[test]
    fn free_quota_makes_first_generations_free() {
        let registry = ProviderRegistry::default();
        let mut config = hosted("trial", 0.05);
        if let ProviderConfig::Hosted(p) = &mut config {
            p.pricing = Pricing {
                cost_per_generation: 0.05,
                currency: "USD".into(),
                free_quota: 1,
            };
        }
        registry.register(config, healthy()).unwrap();
        let request = sample_request().with_max_cost(0.01);

        let estimate = registry.estimate_cost(Some("trial"), &request).unwrap();
        assert!(estimate.within_free_quota);
        assert_eq!(estimate.cost, 0.0);
        assert!(estimate.within_budget);

        let entry = registry.entry("trial").unwrap();
        assert_eq!(entry.charge(), 0.0);
        assert_eq!(entry.charge(), 0.05);

        let estimate = registry.estimate_cost(Some("trial"), &request).unwrap();
        assert!(!estimate.within_free_quota);
        assert!(!estimate.within_budget);
    }

    #[test]
    fn estimate_defaults_to_default_provider() {
        let registry = ProviderRegistry::default();
        assert_matches!(
            registry.estimate_cost(None, &sample_request()),
            Err(ProviderError::NoProviderAvailable)
        );

        registry.register(local("local-sd"), healthy()).unwrap();
        let estimate = registry.estimate_cost(None, &sample_request()).unwrap();
        assert_eq!(estimate.provider_id, "local-sd");
        assert_eq!(estimate.cost, 0.0);
    }
}
