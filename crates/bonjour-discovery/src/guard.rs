//! Reference-counted owner of a driver's shared handle.
//!
//! The handle is created lazily by the first [`SharedResourceGuard::acquire`]
//! and closed once the last lease is released. Closing blocks, so it runs on
//! the runtime's blocking pool; the permit held alongside the handle is
//! released synchronously before that close is scheduled.
//!
//! Every handle carries a generation. A handle found closing or closed by the
//! platform is replaced by a fresh generation with a fresh reference count;
//! leases of the old generation are ignored when released.

use crate::driver::{Driver, HandleContext, Permit};
use crate::metrics::DiscoveryMetrics;
use bonjour_core::{DiscoveryError, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// A counted reference to the shared handle.
#[derive(Debug)]
#[must_use = "a lease must be returned with SharedResourceGuard::release"]
pub struct HandleLease<H> {
    handle: Arc<H>,
    generation: u64,
}

impl<H> HandleLease<H> {
    pub fn handle(&self) -> &Arc<H> {
        &self.handle
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

struct Slot<H> {
    handle: Arc<H>,
    generation: u64,
    closing: bool,
}

struct GuardState<H> {
    slot: Option<Slot<H>>,
    refs: usize,
    permit: Option<Permit>,
    next_generation: u64,
}

/// Lazily creates, shares and tears down one driver handle.
pub struct SharedResourceGuard<D: Driver> {
    driver: Arc<D>,
    context: HandleContext,
    state: Arc<Mutex<GuardState<D::Handle>>>,
    runtime: Handle,
    closes: TaskTracker,
    metrics: Arc<DiscoveryMetrics>,
}

impl<D: Driver> SharedResourceGuard<D> {
    pub fn new(
        driver: Arc<D>,
        context: HandleContext,
        runtime: Handle,
        metrics: Arc<DiscoveryMetrics>,
    ) -> Self {
        Self {
            driver,
            context,
            state: Arc::new(Mutex::new(GuardState {
                slot: None,
                refs: 0,
                permit: None,
                next_generation: 1,
            })),
            runtime,
            closes: TaskTracker::new(),
            metrics,
        }
    }

    /// Returns a lease on the shared handle, creating it if there is none or
    /// the current one is closing or closed. May block while the driver
    /// creates the handle.
    pub fn acquire(&self) -> Result<HandleLease<D::Handle>> {
        let mut state = self.state.lock();

        let stale = match &state.slot {
            Some(slot) => slot.closing || self.driver.is_handle_closed(&slot.handle),
            None => true,
        };

        if stale {
            if let Some(old) = state.slot.take() {
                debug!(
                    driver = self.driver.name(),
                    generation = old.generation,
                    closing = old.closing,
                    "Discarding stale handle"
                );
            }
            state.refs = 0;

            if state.permit.is_none() {
                state.permit = self
                    .driver
                    .acquire_permit(&self.context)
                    .map_err(|e| self.unavailable(e.message))?;
            }

            let handle = match self.driver.acquire_handle(&self.context) {
                Ok(handle) => handle,
                Err(e) => {
                    state.permit = None;
                    return Err(self.unavailable(e.message));
                }
            };

            let generation = state.next_generation;
            state.next_generation += 1;
            state.slot = Some(Slot {
                handle: Arc::new(handle),
                generation,
                closing: false,
            });

            self.metrics.record_handle_created();
            info!(driver = self.driver.name(), generation, "Shared handle created");
        }

        state.refs += 1;
        let slot = state
            .slot
            .as_ref()
            .ok_or_else(|| self.unavailable("handle slot empty after creation"))?;

        Ok(HandleLease {
            handle: slot.handle.clone(),
            generation: slot.generation,
        })
    }

    /// Returns a lease. Releasing the last lease of the current generation
    /// drops the permit and schedules the handle close without blocking.
    pub fn release(&self, lease: HandleLease<D::Handle>) {
        let (handle, permit) = {
            let mut state = self.state.lock();

            let current = match state.slot.as_ref() {
                Some(slot) if slot.generation == lease.generation && !slot.closing => {
                    slot.generation
                }
                _ => {
                    debug!(
                        driver = self.driver.name(),
                        generation = lease.generation,
                        "Released lease of a retired handle"
                    );
                    return;
                }
            };

            state.refs = state.refs.saturating_sub(1);
            if state.refs > 0 {
                return;
            }

            let permit = state.permit.take();
            let Some(slot) = state.slot.as_mut() else {
                return;
            };
            slot.closing = true;
            debug!(driver = self.driver.name(), generation = current, "Last lease released");
            (slot.handle.clone(), permit)
        };

        drop(permit);
        self.schedule_close(handle, lease.generation);
    }

    fn schedule_close(&self, handle: Arc<D::Handle>, generation: u64) {
        let driver = self.driver.clone();
        let state = self.state.clone();
        let metrics = self.metrics.clone();

        self.closes.spawn_blocking_on(
            move || {
                driver.close_handle(&handle);
                metrics.record_handle_closed();

                let mut state = state.lock();
                if matches!(&state.slot, Some(slot) if slot.generation == generation) {
                    state.slot = None;
                }
                info!(driver = driver.name(), generation, "Shared handle closed");
            },
            &self.runtime,
        );
    }

    /// Waits for every scheduled handle close to finish.
    pub async fn flush(&self) {
        self.closes.close();
        self.closes.wait().await;
        self.closes.reopen();
    }

    /// Number of leases outstanding on the current handle.
    pub fn reference_count(&self) -> usize {
        self.state.lock().refs
    }

    /// Returns true if a handle exists and is neither closing nor closed.
    pub fn is_live(&self) -> bool {
        let state = self.state.lock();
        match &state.slot {
            Some(slot) => !slot.closing && !self.driver.is_handle_closed(&slot.handle),
            None => false,
        }
    }

    /// Returns true while a handle close is still running.
    pub fn has_pending_close(&self) -> bool {
        !self.closes.is_empty()
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    fn unavailable(&self, reason: impl Into<String>) -> DiscoveryError {
        let reason = reason.into();
        warn!(driver = self.driver.name(), reason = %reason, "Shared handle unavailable");
        DiscoveryError::resource_unavailable(self.driver.name(), reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::memory::MemoryDriver;

    fn guard(driver: &Arc<MemoryDriver>) -> SharedResourceGuard<MemoryDriver> {
        SharedResourceGuard::new(
            driver.clone(),
            HandleContext::default(),
            Handle::current(),
            Arc::new(DiscoveryMetrics::new()),
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_handle_shared_between_leases() {
        let driver = Arc::new(MemoryDriver::new());
        let guard = guard(&driver);

        let first = guard.acquire().unwrap();
        let second = guard.acquire().unwrap();

        assert!(Arc::ptr_eq(first.handle(), second.handle()));
        assert_eq!(guard.reference_count(), 2);
        assert_eq!(driver.stats().handles_acquired, 1);

        guard.release(first);
        assert!(guard.is_live());
        guard.release(second);
        guard.flush().await;

        assert!(!guard.is_live());
        assert_eq!(driver.stats().handles_closed, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_recreates_after_last_release() {
        let driver = Arc::new(MemoryDriver::new());
        let guard = guard(&driver);

        let lease = guard.acquire().unwrap();
        let first_generation = lease.generation();
        guard.release(lease);

        // Acquire before the close has finished: the closing handle is not reused
        let lease = guard.acquire().unwrap();
        assert_ne!(lease.generation(), first_generation);
        assert_eq!(guard.reference_count(), 1);
        assert_eq!(driver.stats().handles_acquired, 2);

        guard.flush().await;
        assert!(guard.is_live());
        guard.release(lease);
        guard.flush().await;
        assert_eq!(driver.stats().handles_closed, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_replaces_handle_closed_by_platform() {
        let driver = Arc::new(MemoryDriver::new());
        let guard = guard(&driver);

        let old = guard.acquire().unwrap();
        driver.close_externally(old.handle());
        assert!(!guard.is_live());

        let fresh = guard.acquire().unwrap();
        assert_ne!(fresh.generation(), old.generation());
        assert_eq!(guard.reference_count(), 1);

        // The old lease belongs to a retired generation and does not count
        guard.release(old);
        assert_eq!(guard.reference_count(), 1);
        assert!(guard.is_live());

        guard.release(fresh);
        guard.flush().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_permit_released_before_close() {
        let driver = Arc::new(MemoryDriver::new().with_permit());
        let guard = guard(&driver);

        let lease = guard.acquire().unwrap();
        assert_eq!(driver.permits_held(), 1);

        guard.release(lease);
        assert_eq!(driver.permits_held(), 0);
        guard.flush().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_acquire_failure_is_resource_unavailable() {
        let driver = Arc::new(MemoryDriver::new().with_permit());
        driver.fail_next_acquire("no usable network address");
        let guard = guard(&driver);

        let err = guard.acquire().unwrap_err();
        assert!(matches!(err, DiscoveryError::ResourceUnavailable { .. }));
        assert_eq!(guard.reference_count(), 0);
        assert_eq!(driver.permits_held(), 0);

        // Not retried automatically, but the next acquire succeeds
        let lease = guard.acquire().unwrap();
        guard.release(lease);
        guard.flush().await;
    }
}
