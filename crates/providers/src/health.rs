//! Periodic provider health checks.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::registry::ProviderRegistry;

impl ProviderRegistry {
    /// Probe every provider each `interval` until `cancel` fires.
    ///
    /// The first tick fires immediately, so providers that are down at
    /// startup are marked offline before the first job is dispatched.
    pub async fn run_health_checks(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            interval_secs = interval.as_secs(),
            "Provider health checks started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Provider health checks shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let results = self.check_all().await;
                    let unhealthy = results.iter().filter(|(_, ok)| !ok).count();
                    tracing::debug!(
                        checked = results.len(),
                        unhealthy,
                        "Provider health check cycle complete",
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::descriptor::tests::local;
    use crate::descriptor::ProviderStatus;
    use crate::registry::tests::ProbeOnly;

    #[tokio::test]
    async fn loop_marks_unhealthy_provider_offline_and_stops_on_cancel() {
        let registry = Arc::new(ProviderRegistry::default());
        let backend = Arc::new(ProbeOnly(AtomicBool::new(false)));
        registry.register(local("a"), backend.clone()).unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(
            Arc::clone(&registry).run_health_checks(Duration::from_millis(10), cancel.clone()),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.get("a").unwrap().status, ProviderStatus::Offline);

        backend.0.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.get("a").unwrap().status, ProviderStatus::Online);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop exits on cancel")
            .unwrap();
    }
}
