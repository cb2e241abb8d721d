//! Platform driver abstraction.
//!
//! A [`Driver`] wraps one service-discovery implementation (the embedded mDNS
//! responder, the in-process memory network, ...). Drivers report asynchronous
//! results through a [`DriverSink`] or a [`ResolveReply`]; both only push a
//! signal into the owning session's channel and never block the calling
//! thread, so drivers may invoke them from any callback thread.

use crate::session::SessionSignal;
use bonjour_core::{BroadcastConfig, DiscoveryConfig, DriverError, ServiceRecord};
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;
use tracing::trace;

/// Settings a driver needs to create its shared handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleContext {
    /// Address the handle should bind to, all interfaces if `None`
    pub interface_address: Option<IpAddr>,

    /// Upper bound on how long `close_handle` may wait for the platform
    pub close_timeout: Duration,
}

impl From<&DiscoveryConfig> for HandleContext {
    fn from(config: &DiscoveryConfig) -> Self {
        Self {
            interface_address: config.interface_address,
            close_timeout: config.close_timeout(),
        }
    }
}

impl Default for HandleContext {
    fn default() -> Self {
        Self::from(&DiscoveryConfig::default())
    }
}

/// An exclusive platform resource held alongside the shared handle, such as a
/// multicast permission. The release action runs exactly once, on drop.
pub struct Permit {
    release: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl Permit {
    pub fn new<F>(release: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for Permit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Permit")
            .field("released", &self.release.is_none())
            .finish()
    }
}

/// A platform service-discovery implementation.
///
/// The handle is the expensive, process-wide object shared by every session
/// of this driver. The core guarantees that at most one `resolve` is
/// outstanding per session at any time.
pub trait Driver: Send + Sync + 'static {
    /// Shared handle type
    type Handle: Send + Sync + 'static;

    /// Identity used in session keys and error reports
    fn name(&self) -> &str;

    /// Creates the shared handle. May block.
    fn acquire_handle(&self, context: &HandleContext) -> Result<Self::Handle, DriverError>;

    /// Returns true if the handle was closed, possibly by the platform itself.
    fn is_handle_closed(&self, handle: &Self::Handle) -> bool;

    /// Closes the handle. May block for up to `HandleContext::close_timeout`.
    fn close_handle(&self, handle: &Self::Handle);

    /// Acquires the exclusive resource the handle needs, if any.
    fn acquire_permit(&self, _context: &HandleContext) -> Result<Option<Permit>, DriverError> {
        Ok(None)
    }

    /// Starts discovery of `service_type`. Found, lost and failure
    /// notifications are delivered through `sink`, possibly from another
    /// thread and after this call returns.
    fn start(
        &self,
        handle: &Self::Handle,
        service_type: &str,
        sink: DriverSink,
    ) -> Result<(), DriverError>;

    /// Stops discovery of `service_type`.
    fn stop(&self, handle: &Self::Handle, service_type: &str) -> Result<(), DriverError>;

    /// Resolves a found service. The outcome must be reported through `reply`;
    /// dropping it unanswered counts as a failed resolve.
    fn resolve(&self, handle: &Self::Handle, service: ServiceRecord, reply: ResolveReply);

    /// Advertises a service.
    fn register(&self, handle: &Self::Handle, config: &BroadcastConfig) -> Result<(), DriverError>;

    /// Withdraws a service previously advertised with `register`.
    fn unregister(&self, handle: &Self::Handle, config: &BroadcastConfig)
        -> Result<(), DriverError>;
}

/// Callback endpoint handed to [`Driver::start`].
#[derive(Debug, Clone)]
pub struct DriverSink {
    signals: async_channel::Sender<SessionSignal>,
}

impl DriverSink {
    pub(crate) fn new(signals: async_channel::Sender<SessionSignal>) -> Self {
        Self { signals }
    }

    /// A service became visible. It will be queued for resolution.
    pub fn found(&self, service: ServiceRecord) {
        self.push(SessionSignal::Found(service));
    }

    /// A service disappeared.
    pub fn lost(&self, service: ServiceRecord) {
        self.push(SessionSignal::Lost(service));
    }

    pub fn start_failed(&self, code: i32) {
        self.push(SessionSignal::StartFailed(code));
    }

    pub fn stop_failed(&self, code: i32) {
        self.push(SessionSignal::StopFailed(code));
    }

    /// Returns true once the session behind this sink has ended.
    pub fn is_closed(&self) -> bool {
        self.signals.is_closed()
    }

    fn push(&self, signal: SessionSignal) {
        if self.signals.try_send(signal).is_err() {
            trace!("Session ended, dropping driver notification");
        }
    }
}

/// One-shot completion for a single [`Driver::resolve`] call.
#[derive(Debug)]
pub struct ResolveReply {
    signals: Option<async_channel::Sender<SessionSignal>>,
}

impl ResolveReply {
    pub(crate) fn new(signals: async_channel::Sender<SessionSignal>) -> Self {
        Self {
            signals: Some(signals),
        }
    }

    /// Completes the resolve with the full service details.
    pub fn resolved(mut self, service: ServiceRecord) {
        self.complete(SessionSignal::Resolved(service));
    }

    /// Completes the resolve with a platform error code.
    pub fn failed(mut self, code: i32) {
        self.complete(SessionSignal::ResolveFailed(code));
    }

    fn complete(&mut self, signal: SessionSignal) {
        if let Some(signals) = self.signals.take() {
            let _ = signals.try_send(signal);
        }
    }
}

impl Drop for ResolveReply {
    fn drop(&mut self) {
        self.complete(SessionSignal::ResolveFailed(DriverError::INTERNAL_ERROR));
    }
}
