//! Public entry point.

use crate::driver::{Driver, HandleContext};
use crate::guard::{HandleLease, SharedResourceGuard};
use crate::metrics::DiscoveryMetrics;
use crate::session::SessionRegistry;
use crate::stream::DiscoveryStream;
use bonjour_core::{
    normalize_service_type, BroadcastConfig, DiscoveryConfig, DiscoveryError, Result,
};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Service discovery and advertisement on top of one [`Driver`].
///
/// All sessions and broadcasts created through the same `Bonjour` share one
/// driver handle.
///
/// # Examples
///
/// ```no_run
/// use bonjour_core::DiscoveryConfig;
/// use bonjour_discovery::{Bonjour, MdnsDriver};
/// use futures::StreamExt;
/// use tokio_util::sync::CancellationToken;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let bonjour = Bonjour::new(MdnsDriver::new(), DiscoveryConfig::default());
///     let context = CancellationToken::new();
///
///     let mut events = bonjour.start_discovery("_http._tcp", &context)?;
///     while let Some(event) = events.next().await {
///         println!("{:?}", event?);
///     }
///     Ok(())
/// }
/// ```
pub struct Bonjour<D: Driver> {
    driver: Arc<D>,
    guard: Arc<SharedResourceGuard<D>>,
    registry: Arc<SessionRegistry<D>>,
    runtime: Handle,
    metrics: Arc<DiscoveryMetrics>,
}

impl<D: Driver> Bonjour<D> {
    /// Creates a facade bound to the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new(driver: D, config: DiscoveryConfig) -> Self {
        Self::with_runtime(driver, config, Handle::current())
    }

    /// Creates a facade whose background work runs on `runtime`.
    pub fn with_runtime(driver: D, config: DiscoveryConfig, runtime: Handle) -> Self {
        let driver = Arc::new(driver);
        let metrics = Arc::new(DiscoveryMetrics::new());
        let guard = Arc::new(SharedResourceGuard::new(
            driver.clone(),
            HandleContext::from(&config),
            runtime.clone(),
            metrics.clone(),
        ));
        let registry = Arc::new(SessionRegistry::new(
            driver.clone(),
            guard.clone(),
            config.backlog_capacity,
            runtime.clone(),
            metrics.clone(),
        ));

        info!(
            driver = driver.name(),
            backlog_capacity = config.backlog_capacity,
            "Bonjour created"
        );

        Self {
            driver,
            guard,
            registry,
            runtime,
            metrics,
        }
    }

    /// Starts (or joins) discovery of `service_type`.
    ///
    /// Fails synchronously with [`DiscoveryError::TypeMalformed`]. A cancelled
    /// `context` yields a stream whose only item is
    /// [`DiscoveryError::StaleContext`]. Dropping the stream stops discovery.
    pub fn start_discovery(
        &self,
        service_type: &str,
        context: &CancellationToken,
    ) -> Result<DiscoveryStream> {
        let normalized = normalize_service_type(service_type)?;
        Ok(self.registry.subscribe(&normalized, context))
    }

    /// Advertises a service until the returned [`Broadcast`] is dropped.
    pub async fn start_broadcast(
        &self,
        config: BroadcastConfig,
        context: &CancellationToken,
    ) -> Result<Broadcast<D>> {
        let service_type = normalize_service_type(&config.service_type)?;
        if context.is_cancelled() {
            return Err(DiscoveryError::StaleContext);
        }

        let guard = self.guard.clone();
        let lease = self
            .runtime
            .spawn_blocking(move || guard.acquire())
            .await
            .map_err(|e| DiscoveryError::resource_unavailable(self.driver.name(), e.to_string()))??;

        let config = BroadcastConfig {
            service_type,
            ..config
        };
        if let Err(e) = self.driver.register(lease.handle(), &config) {
            self.guard.release(lease);
            warn!(
                driver = self.driver.name(),
                service_type = %config.service_type,
                error = %e,
                "Service registration failed"
            );
            return Err(DiscoveryError::broadcast_failed(
                self.driver.name(),
                config.service_type,
                e.code,
            ));
        }

        info!(
            driver = self.driver.name(),
            name = %config.name,
            service_type = %config.service_type,
            port = config.port,
            "Broadcast started"
        );

        Ok(Broadcast {
            driver: self.driver.clone(),
            guard: self.guard.clone(),
            lease: Some(lease),
            config,
        })
    }

    /// Waits for torn-down sessions and pending handle closes to finish.
    pub async fn shutdown(&self) {
        self.registry.wait_retired().await;
        self.guard.flush().await;
        debug!(driver = self.driver.name(), "Bonjour shut down");
    }

    /// Normalised service types with a running session.
    pub fn active_sessions(&self) -> Vec<String> {
        self.registry.active_service_types()
    }

    /// Number of subscribers of the session for `service_type`.
    pub fn subscriber_count(&self, service_type: &str) -> usize {
        normalize_service_type(service_type)
            .ok()
            .and_then(|normalized| self.registry.session(&normalized))
            .map(|session| session.subscriber_count())
            .unwrap_or(0)
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn guard(&self) -> &SharedResourceGuard<D> {
        &self.guard
    }

    pub fn metrics(&self) -> &DiscoveryMetrics {
        &self.metrics
    }
}

/// An advertised service. Dropping it withdraws the advertisement.
pub struct Broadcast<D: Driver> {
    driver: Arc<D>,
    guard: Arc<SharedResourceGuard<D>>,
    lease: Option<HandleLease<D::Handle>>,
    config: BroadcastConfig,
}

impl<D: Driver> Broadcast<D> {
    /// The advertised configuration, with its normalised service type.
    pub fn config(&self) -> &BroadcastConfig {
        &self.config
    }

    /// Withdraws the advertisement. Same as dropping it.
    pub fn stop(self) {}
}

impl<D: Driver> Drop for Broadcast<D> {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };

        if let Err(e) = self.driver.unregister(lease.handle(), &self.config) {
            debug!(name = %self.config.name, error = %e, "Ignoring unregister error");
        }
        self.guard.release(lease);
        info!(name = %self.config.name, service_type = %self.config.service_type, "Broadcast stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::memory::MemoryDriver;
    use bonjour_core::DriverError;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_malformed_type_fails_synchronously() {
        let bonjour = Bonjour::new(MemoryDriver::new(), DiscoveryConfig::default());
        let err = bonjour
            .start_discovery("http._tcp", &CancellationToken::new())
            .unwrap_err();

        assert!(matches!(err, DiscoveryError::TypeMalformed { .. }));
        assert!(bonjour.active_sessions().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_broadcast_lifecycle() {
        let bonjour = Bonjour::new(MemoryDriver::new(), DiscoveryConfig::default());
        let broadcast = bonjour
            .start_broadcast(BroadcastConfig::new("_http._tcp"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(broadcast.config().service_type, "_http._tcp.local.");
        assert!(bonjour.driver().is_published("Bonjour Service", "_http._tcp"));
        assert_eq!(bonjour.guard().reference_count(), 1);

        broadcast.stop();
        assert!(!bonjour.driver().is_published("Bonjour Service", "_http._tcp"));
        assert_eq!(bonjour.guard().reference_count(), 0);

        bonjour.shutdown().await;
        assert_eq!(bonjour.driver().stats().handles_closed, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_broadcast_failure_releases_handle() {
        let bonjour = Bonjour::new(MemoryDriver::new(), DiscoveryConfig::default());
        bonjour.driver().fail_next_register(DriverError::MAX_LIMIT);

        let err = bonjour
            .start_broadcast(BroadcastConfig::new("_ipp._tcp"), &CancellationToken::new())
            .await
            .err()
            .unwrap();

        assert_eq!(
            err,
            DiscoveryError::broadcast_failed("memory", "_ipp._tcp.local.", DriverError::MAX_LIMIT)
        );
        assert_eq!(bonjour.guard().reference_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_broadcast_with_stale_context() {
        let bonjour = Bonjour::new(MemoryDriver::new(), DiscoveryConfig::default());
        let context = CancellationToken::new();
        context.cancel();

        let err = bonjour
            .start_broadcast(BroadcastConfig::new("_http._tcp"), &context)
            .await
            .err()
            .unwrap();
        assert_eq!(err, DiscoveryError::StaleContext);
        assert_eq!(bonjour.driver().stats().handles_acquired, 0);
    }
}
