//! # Bonjour Core
//!
//! Value types, error handling, and configuration shared by the Bonjour
//! discovery crates.
//!
//! This crate provides the foundational building blocks:
//!
//! - **Types**: `ServiceRecord`, `DiscoveryEvent`, `HostAddresses` and
//!   `BroadcastConfig`, the immutable values that flow from drivers to callers.
//! - **Service types**: the DNS-SD type grammar (`_name._tcp` / `_name._udp`,
//!   optionally followed by a domain such as `.local.`) and its normalisation
//!   into session keys.
//! - **Errors**: the discovery error taxonomy using `thiserror`, cloneable so a
//!   single failure can be delivered to every subscriber of a session.
//! - **Configuration**: YAML files plus `BONJOUR__*` environment overrides.
//!
//! ## Example
//!
//! ```
//! use bonjour_core::service_type::{is_valid_service_type, normalize_service_type};
//!
//! assert!(is_valid_service_type("_http._tcp"));
//! assert!(!is_valid_service_type("http._tcp"));
//! assert_eq!(normalize_service_type("_HTTP._tcp").unwrap(), "_http._tcp.local.");
//! ```

pub mod config;
pub mod error;
pub mod service_type;
pub mod types;

// Re-export commonly used types for convenience
pub use config::{AppConfig, DiscoveryConfig, DriverKind, LoggingConfig};
pub use error::{ConfigError, DiscoveryError, DriverError, Result};
pub use service_type::{is_valid_service_type, normalize_service_type};
pub use types::{BroadcastConfig, DiscoveryEvent, HostAddresses, ServiceRecord, TxtRecords};
