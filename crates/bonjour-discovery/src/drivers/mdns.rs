//! Embedded mDNS responder driver.
//!
//! Uses the `mdns-sd` crate. The daemon handle is the shared resource; each
//! browsed type gets a thread that translates daemon events into driver
//! callbacks. `mdns-sd` resolves services on its own, so resolved details are
//! cached per type and handed out when the core asks for them.

use crate::driver::{Driver, DriverSink, HandleContext, ResolveReply};
use bonjour_core::{BroadcastConfig, DriverError, HostAddresses, ServiceRecord};
use mdns_sd::{DaemonStatus, IfKind, ServiceDaemon, ServiceEvent, ServiceInfo};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Identity reported by [`MdnsDriver`].
pub const MDNS_DRIVER_NAME: &str = "mdns";

/// Resolution state of one browsed type.
#[derive(Default)]
struct BrowseBook {
    resolved: HashMap<String, ServiceRecord>,
    waiting: Option<(String, ResolveReply)>,
}

type SharedBook = Arc<Mutex<BrowseBook>>;

/// A running `mdns-sd` daemon.
pub struct MdnsHandle {
    daemon: ServiceDaemon,
    host_name: String,
    close_timeout: Duration,
    closed: Arc<AtomicBool>,
    browses: Mutex<HashMap<String, SharedBook>>,
}

impl MdnsHandle {
    pub fn host_name(&self) -> &str {
        &self.host_name
    }
}

/// Driver backed by the embedded `mdns-sd` responder.
#[derive(Debug, Default)]
pub struct MdnsDriver;

impl MdnsDriver {
    pub fn new() -> Self {
        Self
    }
}

impl Driver for MdnsDriver {
    type Handle = MdnsHandle;

    fn name(&self) -> &str {
        MDNS_DRIVER_NAME
    }

    fn acquire_handle(&self, context: &HandleContext) -> Result<MdnsHandle, DriverError> {
        let daemon = ServiceDaemon::new().map_err(mdns_error)?;

        if let Some(address) = context.interface_address {
            // The daemon thread only exits on an explicit shutdown
            undo_on_error(
                || {
                    daemon.disable_interface(IfKind::All)?;
                    daemon.enable_interface(IfKind::Addr(address))
                },
                || {
                    let _ = daemon.shutdown();
                },
            )
            .map_err(mdns_error)?;
        }

        let host = hostname::get()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|_| "localhost".to_string());

        info!(interface = ?context.interface_address, host = %host, "mDNS daemon started");

        Ok(MdnsHandle {
            daemon,
            host_name: format!("{host}.local."),
            close_timeout: context.close_timeout,
            closed: Arc::new(AtomicBool::new(false)),
            browses: Mutex::new(HashMap::new()),
        })
    }

    fn is_handle_closed(&self, handle: &MdnsHandle) -> bool {
        handle.closed.load(Ordering::SeqCst)
    }

    fn close_handle(&self, handle: &MdnsHandle) {
        handle.closed.store(true, Ordering::SeqCst);
        handle.browses.lock().clear();

        match handle.daemon.shutdown() {
            Ok(status) => match status.recv_timeout(handle.close_timeout) {
                Ok(DaemonStatus::Shutdown) => debug!("mDNS daemon shut down"),
                Ok(other) => debug!(status = ?other, "mDNS daemon reported status on shutdown"),
                Err(e) => warn!(error = %e, "mDNS daemon did not confirm shutdown"),
            },
            Err(e) => warn!(error = %e, "Failed to shut down mDNS daemon"),
        }
    }

    fn start(
        &self,
        handle: &MdnsHandle,
        service_type: &str,
        sink: DriverSink,
    ) -> Result<(), DriverError> {
        if self.is_handle_closed(handle) {
            return Err(DriverError::internal("mDNS daemon is closed"));
        }

        let mut browses = handle.browses.lock();
        if browses.contains_key(service_type) {
            return Err(DriverError::new(
                DriverError::ALREADY_ACTIVE,
                format!("already browsing {service_type}"),
            ));
        }

        let receiver = handle.daemon.browse(service_type).map_err(mdns_error)?;
        let book = SharedBook::default();

        let worker = BrowseWorker {
            service_type: service_type.to_string(),
            book: book.clone(),
            sink,
            closed: handle.closed.clone(),
        };
        thread::Builder::new()
            .name(format!("mdns-browse-{service_type}"))
            .spawn(move || worker.run(receiver))
            .map_err(|e| {
                let _ = handle.daemon.stop_browse(service_type);
                DriverError::from(e)
            })?;

        browses.insert(service_type.to_string(), book);
        debug!(service_type, "Browsing");
        Ok(())
    }

    fn stop(&self, handle: &MdnsHandle, service_type: &str) -> Result<(), DriverError> {
        handle.browses.lock().remove(service_type);
        handle.daemon.stop_browse(service_type).map_err(mdns_error)
    }

    fn resolve(&self, handle: &MdnsHandle, service: ServiceRecord, reply: ResolveReply) {
        let book = handle.browses.lock().get(service.service_type()).cloned();
        let Some(book) = book else {
            reply.failed(DriverError::INTERNAL_ERROR);
            return;
        };

        let full_name = full_name(service.name(), service.service_type());
        let mut book = book.lock();
        match book.resolved.get(&full_name) {
            Some(resolved) => reply.resolved(resolved.clone()),
            None => {
                trace!(service = %full_name, "Waiting for mDNS resolution");
                book.waiting = Some((full_name, reply));
            }
        }
    }

    fn register(&self, handle: &MdnsHandle, config: &BroadcastConfig) -> Result<(), DriverError> {
        let properties: HashMap<String, String> = config
            .txt_records
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        let address = config
            .address
            .map(|address| address.to_string())
            .unwrap_or_default();

        let mut info = ServiceInfo::new(
            &config.service_type,
            &config.name,
            &handle.host_name,
            address.as_str(),
            config.port,
            properties,
        )
        .map_err(mdns_error)?;
        if config.address.is_none() {
            info = info.enable_addr_auto();
        }

        handle.daemon.register(info).map_err(mdns_error)
    }

    fn unregister(&self, handle: &MdnsHandle, config: &BroadcastConfig) -> Result<(), DriverError> {
        let _status = handle
            .daemon
            .unregister(&full_name(&config.name, &config.service_type))
            .map_err(mdns_error)?;
        Ok(())
    }
}

/// Translates daemon events for one browsed type into driver callbacks.
struct BrowseWorker {
    service_type: String,
    book: SharedBook,
    sink: DriverSink,
    closed: Arc<AtomicBool>,
}

impl BrowseWorker {
    fn run(self, events: mdns_sd::Receiver<ServiceEvent>) {
        loop {
            let event = match events.recv() {
                Ok(event) => event,
                Err(_) => {
                    // The daemon went away without stopping this browse
                    if !self.closed.swap(true, Ordering::SeqCst) {
                        warn!(service_type = %self.service_type, "mDNS daemon disconnected");
                    }
                    return;
                }
            };

            match event {
                ServiceEvent::ServiceFound(_, full_name) => {
                    let name = instance_name(&full_name, &self.service_type);
                    self.sink
                        .found(ServiceRecord::new(name, self.service_type.clone()));
                }
                ServiceEvent::ServiceResolved(info) => self.on_resolved(&info),
                ServiceEvent::ServiceRemoved(_, full_name) => self.on_removed(&full_name),
                ServiceEvent::SearchStopped(_) => break,
                _ => {}
            }

            if self.sink.is_closed() {
                break;
            }
        }

        trace!(service_type = %self.service_type, "Browse worker exiting");
    }

    fn on_resolved(&self, info: &ServiceInfo) {
        let record = to_record(info, &self.service_type);
        let full_name = info.get_fullname().to_string();

        let mut book = self.book.lock();
        book.resolved.insert(full_name.clone(), record.clone());
        if let Some(reply) = take_waiting(&mut book, &full_name) {
            reply.resolved(record);
        }
    }

    fn on_removed(&self, full_name: &str) {
        let record = {
            let mut book = self.book.lock();
            if let Some(reply) = take_waiting(&mut book, full_name) {
                reply.failed(DriverError::INTERNAL_ERROR);
            }
            book.resolved.remove(full_name)
        };

        let record = record.unwrap_or_else(|| {
            ServiceRecord::new(
                instance_name(full_name, &self.service_type),
                self.service_type.clone(),
            )
        });
        self.sink.lost(record);
    }
}

/// Runs `setup`, running `undo` before handing back its error.
fn undo_on_error<T, E>(
    setup: impl FnOnce() -> Result<T, E>,
    undo: impl FnOnce(),
) -> Result<T, E> {
    setup().map_err(|e| {
        undo();
        e
    })
}

fn take_waiting(book: &mut BrowseBook, full_name: &str) -> Option<ResolveReply> {
    match &book.waiting {
        Some((waiting, _)) if waiting == full_name => book.waiting.take().map(|(_, reply)| reply),
        _ => None,
    }
}

fn full_name(name: &str, service_type: &str) -> String {
    format!("{name}.{service_type}")
}

/// "Office Printer._http._tcp.local." -> "Office Printer"
fn instance_name(full_name: &str, service_type: &str) -> String {
    full_name
        .strip_suffix(service_type)
        .map(|name| name.trim_end_matches('.'))
        .unwrap_or(full_name)
        .to_string()
}

fn to_record(info: &ServiceInfo, service_type: &str) -> ServiceRecord {
    let addresses: HostAddresses = info.get_addresses().iter().copied().collect();
    let txt_records = info
        .get_properties()
        .iter()
        .map(|property| (property.key().to_string(), property.val_str().to_string()))
        .collect();

    ServiceRecord::new(instance_name(info.get_fullname(), service_type), service_type)
        .with_addresses(addresses)
        .with_port(info.get_port())
        .with_txt_records(txt_records)
}

fn mdns_error(err: mdns_sd::Error) -> DriverError {
    DriverError::internal(err.to_string())
}
