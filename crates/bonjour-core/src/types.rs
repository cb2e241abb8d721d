//! Core value types for service discovery.
//!
//! A [`ServiceRecord`] is built once per resolved snapshot and never mutated
//! afterwards; a [`DiscoveryEvent`] wraps one for delivery to subscribers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// TXT record key/value pairs attached to a service. Keys are unique.
pub type TxtRecords = BTreeMap<String, String>;

/// Default instance name used when advertising without an explicit name.
pub const DEFAULT_BROADCAST_NAME: &str = "Bonjour Service";

/// Default port used when advertising without an explicit port.
pub const DEFAULT_BROADCAST_PORT: u16 = 80;

/// Resolved host addresses of a service, at most one per address family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostAddresses {
    /// IPv4 address, if the service resolved one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v4: Option<Ipv4Addr>,

    /// IPv6 address, if the service resolved one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v6: Option<Ipv6Addr>,
}

impl HostAddresses {
    /// Creates an empty address set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an address, replacing any previous address of the same family.
    pub fn insert(&mut self, address: IpAddr) {
        match address {
            IpAddr::V4(v4) => self.v4 = Some(v4),
            IpAddr::V6(v6) => self.v6 = Some(v6),
        }
    }

    /// Returns the preferred address: IPv4 when present, IPv6 otherwise.
    pub fn primary(&self) -> Option<IpAddr> {
        self.v4
            .map(IpAddr::V4)
            .or_else(|| self.v6.map(IpAddr::V6))
    }

    /// Returns true if no address is known for either family.
    pub fn is_empty(&self) -> bool {
        self.v4.is_none() && self.v6.is_none()
    }

    /// Iterates over the known addresses, IPv4 first.
    pub fn iter(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.v4
            .map(IpAddr::V4)
            .into_iter()
            .chain(self.v6.map(IpAddr::V6))
    }
}

/// Keeps the first address seen for each family.
impl FromIterator<IpAddr> for HostAddresses {
    fn from_iter<I: IntoIterator<Item = IpAddr>>(iter: I) -> Self {
        let mut addresses = HostAddresses::new();
        for address in iter {
            match address {
                IpAddr::V4(v4) if addresses.v4.is_none() => addresses.v4 = Some(v4),
                IpAddr::V6(v6) if addresses.v6.is_none() => addresses.v6 = Some(v6),
                _ => {}
            }
        }
        addresses
    }
}

/// A resolved DNS-SD service detected on the local network.
///
/// Identity is the service `name` alone: two records that differ only in
/// address, port or TXT records compare equal and hash identically, so
/// consumers can treat added/removed events as replace-by-name set updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRecord {
    name: String,
    service_type: String,
    #[serde(default)]
    addresses: HostAddresses,
    #[serde(default)]
    port: u16,
    #[serde(default)]
    txt_records: TxtRecords,
}

impl ServiceRecord {
    /// Creates a record with no addresses, port 0 and no TXT records.
    pub fn new(name: impl Into<String>, service_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            service_type: service_type.into(),
            addresses: HostAddresses::default(),
            port: 0,
            txt_records: TxtRecords::new(),
        }
    }

    /// Adds an address, replacing any previous one of the same family.
    pub fn with_address(mut self, address: IpAddr) -> Self {
        self.addresses.insert(address);
        self
    }

    /// Replaces the address set.
    pub fn with_addresses(mut self, addresses: HostAddresses) -> Self {
        self.addresses = addresses;
        self
    }

    /// Sets the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Adds a single TXT record.
    pub fn with_txt_record(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.txt_records.insert(key.into(), value.into());
        self
    }

    /// Replaces all TXT records.
    pub fn with_txt_records(mut self, txt_records: TxtRecords) -> Self {
        self.txt_records = txt_records;
        self
    }

    /// The service's display name, e.g. "Office Printer".
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The service's type, e.g. "_http._tcp.local.".
    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    pub fn addresses(&self) -> &HostAddresses {
        &self.addresses
    }

    /// Host address of the service. IPv4 takes precedence over IPv6.
    pub fn host(&self) -> Option<IpAddr> {
        self.addresses.primary()
    }

    pub fn v4_host(&self) -> Option<Ipv4Addr> {
        self.addresses.v4
    }

    pub fn v6_host(&self) -> Option<Ipv6Addr> {
        self.addresses.v6
    }

    /// The port on which the service is advertised.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn txt_records(&self) -> &TxtRecords {
        &self.txt_records
    }

    /// Returns the TXT record with the given key, if present.
    pub fn txt_record(&self, key: &str) -> Option<&str> {
        self.txt_records.get(key).map(String::as_str)
    }

    /// Returns the TXT record with the given key, or `default` if absent.
    pub fn txt_record_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.txt_record(key).unwrap_or(default)
    }

    pub fn txt_record_count(&self) -> usize {
        self.txt_records.len()
    }

    pub fn txt_record_keys(&self) -> impl Iterator<Item = &str> {
        self.txt_records.keys().map(String::as_str)
    }
}

impl PartialEq for ServiceRecord {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for ServiceRecord {}

impl Hash for ServiceRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Display for ServiceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.host() {
            Some(host) => write!(
                f,
                "{} ({}) at {}",
                self.name,
                self.service_type,
                std::net::SocketAddr::new(host, self.port)
            ),
            None => write!(f, "{} ({})", self.name, self.service_type),
        }
    }
}

/// Notification delivered to discovery subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "service", rename_all = "snake_case")]
pub enum DiscoveryEvent {
    /// A service was found and resolved
    Added(ServiceRecord),

    /// A service disappeared from the network
    Removed(ServiceRecord),
}

impl DiscoveryEvent {
    /// Returns the service carried by this event.
    pub fn service(&self) -> &ServiceRecord {
        match self {
            DiscoveryEvent::Added(service) | DiscoveryEvent::Removed(service) => service,
        }
    }

    pub fn into_service(self) -> ServiceRecord {
        match self {
            DiscoveryEvent::Added(service) | DiscoveryEvent::Removed(service) => service,
        }
    }

    pub fn is_added(&self) -> bool {
        matches!(self, DiscoveryEvent::Added(_))
    }

    pub fn is_removed(&self) -> bool {
        matches!(self, DiscoveryEvent::Removed(_))
    }
}

/// Description of a service to advertise on the local network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// Service type, e.g. "_http._tcp"
    pub service_type: String,

    /// Instance name
    #[serde(default = "default_broadcast_name")]
    pub name: String,

    /// Port the service listens on
    #[serde(default = "default_broadcast_port")]
    pub port: u16,

    /// Address to advertise; detected by the driver when absent
    #[serde(default)]
    pub address: Option<IpAddr>,

    /// TXT records to publish
    #[serde(default)]
    pub txt_records: TxtRecords,
}

impl BroadcastConfig {
    /// Creates a broadcast description with the default name and port.
    pub fn new(service_type: impl Into<String>) -> Self {
        Self {
            service_type: service_type.into(),
            name: default_broadcast_name(),
            port: default_broadcast_port(),
            address: None,
            txt_records: TxtRecords::new(),
        }
    }
}

fn default_broadcast_name() -> String {
    DEFAULT_BROADCAST_NAME.to_string()
}

fn default_broadcast_port() -> u16 {
    DEFAULT_BROADCAST_PORT
}
