//! In-process discovery network.
//!
//! [`MemoryDriver`] behaves like a platform driver without touching the
//! network. Services can be published on it (directly or through
//! `register`), and every driver callback can be triggered by hand: found,
//! lost, start/stop failures and resolve completions. It records every call
//! so tests can assert exactly how the core drove it.

use crate::driver::{Driver, DriverSink, HandleContext, Permit, ResolveReply};
use bonjour_core::{
    normalize_service_type, BroadcastConfig, DriverError, HostAddresses, ServiceRecord,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Identity reported by [`MemoryDriver`].
pub const MEMORY_DRIVER_NAME: &str = "memory";

/// Shared handle issued by [`MemoryDriver`].
#[derive(Debug)]
pub struct MemoryHandle {
    id: u64,
    closed: Arc<AtomicBool>,
}

impl MemoryHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Call counters recorded by [`MemoryDriver`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverStats {
    pub handles_acquired: usize,
    pub handles_closed: usize,
    pub starts: usize,
    pub stops: usize,
    pub resolves: usize,
    pub registrations: usize,
    pub unregistrations: usize,
}

#[derive(Default)]
struct Network {
    browsers: HashMap<String, DriverSink>,
    published: HashMap<(String, String), ServiceRecord>,
    pending_resolves: VecDeque<(ServiceRecord, ResolveReply)>,
    starts_by_type: HashMap<String, usize>,
    stops_by_type: HashMap<String, usize>,
    issued: Vec<Arc<AtomicBool>>,
    fail_next_acquire: Option<String>,
    fail_next_start: Option<i32>,
    fail_next_stop: Option<i32>,
    fail_next_register: Option<i32>,
}

/// Scripted in-process driver.
pub struct MemoryDriver {
    network: Mutex<Network>,
    stats: Mutex<DriverStats>,
    auto_resolve: AtomicBool,
    use_permit: bool,
    permits_held: Arc<AtomicUsize>,
    close_delay: Duration,
    next_handle_id: AtomicU64,
}

impl MemoryDriver {
    /// Creates a driver that resolves published services automatically.
    pub fn new() -> Self {
        Self {
            network: Mutex::new(Network::default()),
            stats: Mutex::new(DriverStats::default()),
            auto_resolve: AtomicBool::new(true),
            use_permit: false,
            permits_held: Arc::new(AtomicUsize::new(0)),
            close_delay: Duration::ZERO,
            next_handle_id: AtomicU64::new(1),
        }
    }

    /// Requires a permit alongside each handle, like a multicast lock.
    pub fn with_permit(mut self) -> Self {
        self.use_permit = true;
        self
    }

    /// Makes `close_handle` block for `delay`.
    pub fn with_close_delay(mut self, delay: Duration) -> Self {
        self.close_delay = delay;
        self
    }

    /// Parks every resolve until it is completed with `complete_resolve` or
    /// `fail_resolve`.
    pub fn with_manual_resolve(self) -> Self {
        self.auto_resolve.store(false, Ordering::SeqCst);
        self
    }

    // ---- network scripting ----

    /// Publishes a service. Browsers of its type see it as found.
    pub fn publish(&self, service: ServiceRecord) {
        let service_type = canonical(service.service_type());
        let key = (service_type.clone(), service.name().to_string());
        let found = ServiceRecord::new(service.name(), service_type.clone());

        let mut network = self.network.lock();
        network.published.insert(key, service);
        if let Some(sink) = network.browsers.get(&service_type) {
            sink.found(found);
        }
    }

    /// Withdraws a published service. Browsers of its type see it as lost.
    pub fn withdraw(&self, name: &str, service_type: &str) -> bool {
        let service_type = canonical(service_type);
        let mut network = self.network.lock();
        let removed = network
            .published
            .remove(&(service_type.clone(), name.to_string()));

        if let (Some(service), Some(sink)) = (&removed, network.browsers.get(&service_type)) {
            sink.lost(service.clone());
        }
        removed.is_some()
    }

    /// Delivers a found notification to the browser of `service_type`.
    pub fn emit_found(&self, service_type: &str, service: ServiceRecord) -> bool {
        self.with_sink(service_type, |sink| sink.found(service))
    }

    /// Delivers a lost notification to the browser of `service_type`.
    pub fn emit_lost(&self, service_type: &str, service: ServiceRecord) -> bool {
        self.with_sink(service_type, |sink| sink.lost(service))
    }

    pub fn emit_start_failed(&self, service_type: &str, code: i32) -> bool {
        self.with_sink(service_type, |sink| sink.start_failed(code))
    }

    pub fn emit_stop_failed(&self, service_type: &str, code: i32) -> bool {
        self.with_sink(service_type, |sink| sink.stop_failed(code))
    }

    /// Completes the oldest parked resolve with `service`.
    pub fn complete_resolve(&self, service: ServiceRecord) -> bool {
        match self.network.lock().pending_resolves.pop_front() {
            Some((_, reply)) => {
                reply.resolved(service);
                true
            }
            None => false,
        }
    }

    /// Fails the oldest parked resolve with `code`.
    pub fn fail_resolve(&self, code: i32) -> bool {
        match self.network.lock().pending_resolves.pop_front() {
            Some((_, reply)) => {
                reply.failed(code);
                true
            }
            None => false,
        }
    }

    /// Names of services whose resolve is parked, oldest first.
    pub fn pending_resolves(&self) -> Vec<String> {
        self.network
            .lock()
            .pending_resolves
            .iter()
            .map(|(service, _)| service.name().to_string())
            .collect()
    }

    pub fn fail_next_acquire(&self, reason: impl Into<String>) {
        self.network.lock().fail_next_acquire = Some(reason.into());
    }

    pub fn fail_next_start(&self, code: i32) {
        self.network.lock().fail_next_start = Some(code);
    }

    /// Makes the next `stop` report an error. The browse is still removed.
    pub fn fail_next_stop(&self, code: i32) {
        self.network.lock().fail_next_stop = Some(code);
    }

    pub fn fail_next_register(&self, code: i32) {
        self.network.lock().fail_next_register = Some(code);
    }

    /// Marks a handle closed, as a platform does on network loss.
    pub fn close_externally(&self, handle: &MemoryHandle) {
        handle.closed.store(true, Ordering::SeqCst);
    }

    /// Marks every handle issued so far closed.
    pub fn close_all_externally(&self) {
        for closed in &self.network.lock().issued {
            closed.store(true, Ordering::SeqCst);
        }
    }

    // ---- inspection ----

    pub fn stats(&self) -> DriverStats {
        self.stats.lock().clone()
    }

    pub fn starts(&self, service_type: &str) -> usize {
        let service_type = canonical(service_type);
        self.network
            .lock()
            .starts_by_type
            .get(&service_type)
            .copied()
            .unwrap_or(0)
    }

    pub fn stops(&self, service_type: &str) -> usize {
        let service_type = canonical(service_type);
        self.network
            .lock()
            .stops_by_type
            .get(&service_type)
            .copied()
            .unwrap_or(0)
    }

    pub fn is_browsing(&self, service_type: &str) -> bool {
        let service_type = canonical(service_type);
        self.network.lock().browsers.contains_key(&service_type)
    }

    pub fn is_published(&self, name: &str, service_type: &str) -> bool {
        let key = (canonical(service_type), name.to_string());
        self.network.lock().published.contains_key(&key)
    }

    pub fn permits_held(&self) -> usize {
        self.permits_held.load(Ordering::SeqCst)
    }

    /// Polls `condition` until it holds or five seconds pass.
    pub async fn wait_until<F>(&self, condition: F) -> bool
    where
        F: Fn(&Self) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        condition(self)
    }

    fn with_sink<F: FnOnce(&DriverSink)>(&self, service_type: &str, f: F) -> bool {
        let service_type = canonical(service_type);
        match self.network.lock().browsers.get(&service_type) {
            Some(sink) => {
                f(sink);
                true
            }
            None => false,
        }
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for MemoryDriver {
    type Handle = MemoryHandle;

    fn name(&self) -> &str {
        MEMORY_DRIVER_NAME
    }

    fn acquire_handle(&self, _context: &HandleContext) -> Result<MemoryHandle, DriverError> {
        let mut network = self.network.lock();
        if let Some(reason) = network.fail_next_acquire.take() {
            return Err(DriverError::internal(reason));
        }

        let closed = Arc::new(AtomicBool::new(false));
        network.issued.push(closed.clone());
        self.stats.lock().handles_acquired += 1;

        let id = self.next_handle_id.fetch_add(1, Ordering::SeqCst);
        debug!(handle = id, "Memory handle acquired");
        Ok(MemoryHandle { id, closed })
    }

    fn is_handle_closed(&self, handle: &MemoryHandle) -> bool {
        handle.is_closed()
    }

    fn close_handle(&self, handle: &MemoryHandle) {
        if !self.close_delay.is_zero() {
            std::thread::sleep(self.close_delay);
        }
        handle.closed.store(true, Ordering::SeqCst);
        self.stats.lock().handles_closed += 1;
        debug!(handle = handle.id, "Memory handle closed");
    }

    fn acquire_permit(&self, _context: &HandleContext) -> Result<Option<Permit>, DriverError> {
        if !self.use_permit {
            return Ok(None);
        }

        self.permits_held.fetch_add(1, Ordering::SeqCst);
        let held = self.permits_held.clone();
        Ok(Some(Permit::new(move || {
            held.fetch_sub(1, Ordering::SeqCst);
        })))
    }

    fn start(
        &self,
        handle: &MemoryHandle,
        service_type: &str,
        sink: DriverSink,
    ) -> Result<(), DriverError> {
        if handle.is_closed() {
            return Err(DriverError::internal("handle is closed"));
        }

        let service_type = canonical(service_type);
        let mut network = self.network.lock();
        if let Some(code) = network.fail_next_start.take() {
            return Err(DriverError::new(code, "scripted start failure"));
        }
        if network.browsers.contains_key(&service_type) {
            return Err(DriverError::new(
                DriverError::ALREADY_ACTIVE,
                format!("already browsing {service_type}"),
            ));
        }

        *network.starts_by_type.entry(service_type.clone()).or_default() += 1;
        self.stats.lock().starts += 1;

        for (key, service) in &network.published {
            if key.0 == service_type {
                sink.found(ServiceRecord::new(service.name(), service_type.clone()));
            }
        }
        network.browsers.insert(service_type, sink);
        Ok(())
    }

    fn stop(&self, _handle: &MemoryHandle, service_type: &str) -> Result<(), DriverError> {
        let service_type = canonical(service_type);
        let mut network = self.network.lock();

        *network.stops_by_type.entry(service_type.clone()).or_default() += 1;
        self.stats.lock().stops += 1;

        network
            .pending_resolves
            .retain(|(service, _)| canonical(service.service_type()) != service_type);

        let browsing = network.browsers.remove(&service_type).is_some();
        if let Some(code) = network.fail_next_stop.take() {
            return Err(DriverError::new(code, "scripted stop failure"));
        }

        if !browsing {
            return Err(DriverError::internal(format!("not browsing {service_type}")));
        }
        Ok(())
    }

    fn resolve(&self, _handle: &MemoryHandle, service: ServiceRecord, reply: ResolveReply) {
        self.stats.lock().resolves += 1;

        if !self.auto_resolve.load(Ordering::SeqCst) {
            self.network.lock().pending_resolves.push_back((service, reply));
            return;
        }

        let key = (canonical(service.service_type()), service.name().to_string());
        let resolved = self.network.lock().published.get(&key).cloned();
        match resolved {
            Some(resolved) => reply.resolved(resolved),
            None => reply.failed(DriverError::INTERNAL_ERROR),
        }
    }

    fn register(&self, handle: &MemoryHandle, config: &BroadcastConfig) -> Result<(), DriverError> {
        if handle.is_closed() {
            return Err(DriverError::internal("handle is closed"));
        }
        if let Some(code) = self.network.lock().fail_next_register.take() {
            return Err(DriverError::new(code, "scripted register failure"));
        }

        let address = config
            .address
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let addresses: HostAddresses = std::iter::once(address).collect();
        let service = ServiceRecord::new(&config.name, &config.service_type)
            .with_addresses(addresses)
            .with_port(config.port)
            .with_txt_records(config.txt_records.clone());

        self.stats.lock().registrations += 1;
        self.publish(service);
        Ok(())
    }

    fn unregister(&self, _handle: &MemoryHandle, config: &BroadcastConfig) -> Result<(), DriverError> {
        self.stats.lock().unregistrations += 1;
        if self.withdraw(&config.name, &config.service_type) {
            Ok(())
        } else {
            Err(DriverError::internal(format!("{} is not registered", config.name)))
        }
    }
}

fn canonical(service_type: &str) -> String {
    normalize_service_type(service_type).unwrap_or_else(|_| service_type.to_string())
}
