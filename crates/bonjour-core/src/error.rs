//! Error types for Bonjour discovery and advertisement.
//!
//! [`DiscoveryError`] is what callers see, either synchronously or as the last
//! item of a discovery stream. It is `Clone` because one driver failure is
//! delivered to every subscriber of the affected session. [`DriverError`] is
//! what driver implementations report back to the core.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using DiscoveryError as the error type.
pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Errors surfaced to discovery and broadcast callers.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "details")]
pub enum DiscoveryError {
    /// Input did not match the DNS-SD type grammar
    #[error("Not a valid DNS-SD service type: {service_type}")]
    TypeMalformed { service_type: String },

    /// The caller's context was already cancelled when it subscribed
    #[error("Caller context was no longer valid at subscribe time")]
    StaleContext,

    /// The driver reported a start or stop failure for a discovery
    #[error("Discovery driver '{driver}' failed for type {service_type} with error code {code}")]
    DiscoveryFailed {
        driver: String,
        service_type: String,
        code: i32,
    },

    /// The driver rejected a service registration
    #[error("Broadcast driver '{driver}' failed for type {service_type} with error code {code}")]
    BroadcastFailed {
        driver: String,
        service_type: String,
        code: i32,
    },

    /// The shared driver handle could not be created
    #[error("Driver '{driver}' could not create its shared handle: {reason}")]
    ResourceUnavailable { driver: String, reason: String },

    /// The resolve backlog rejected an item because it is full
    #[error("Resolve backlog is full (capacity {capacity}), newest item dropped")]
    QueueSaturated { capacity: usize },

    /// The resolve backlog was already stopped
    #[error("Resolve backlog has been stopped")]
    BacklogStopped,
}

impl DiscoveryError {
    /// Creates a malformed type error.
    pub fn type_malformed(service_type: impl Into<String>) -> Self {
        Self::TypeMalformed {
            service_type: service_type.into(),
        }
    }

    /// Creates a discovery failed error.
    pub fn discovery_failed(
        driver: impl Into<String>,
        service_type: impl Into<String>,
        code: i32,
    ) -> Self {
        Self::DiscoveryFailed {
            driver: driver.into(),
            service_type: service_type.into(),
            code,
        }
    }

    /// Creates a broadcast failed error.
    pub fn broadcast_failed(
        driver: impl Into<String>,
        service_type: impl Into<String>,
        code: i32,
    ) -> Self {
        Self::BroadcastFailed {
            driver: driver.into(),
            service_type: service_type.into(),
            code,
        }
    }

    /// Creates a resource unavailable error.
    pub fn resource_unavailable(driver: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ResourceUnavailable {
            driver: driver.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if this error ends a discovery stream.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DiscoveryError::QueueSaturated { .. })
    }
}

/// Failure reported by a platform driver.
///
/// Codes follow the platform service-discovery API convention: 0 is an
/// internal error, 3 means the operation is already active, 4 means the
/// platform's concurrent request limit was hit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("driver error (code={code}): {message}")]
pub struct DriverError {
    pub code: i32,
    pub message: String,
}

impl DriverError {
    pub const INTERNAL_ERROR: i32 = 0;
    pub const ALREADY_ACTIVE: i32 = 3;
    pub const MAX_LIMIT: i32 = 4;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Creates an internal driver error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Self::INTERNAL_ERROR, message)
    }
}

impl From<std::io::Error> for DriverError {
    fn from(err: std::io::Error) -> Self {
        Self::internal(err.to_string())
    }
}

/// Errors related to configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {reason}")]
    LoadFailed { path: String, reason: String },

    /// Invalid configuration format
    #[error("Invalid configuration format: {reason}")]
    InvalidFormat { reason: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

impl ConfigError {
    /// Creates an invalid value error.
    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
