//! Configuration management for Bonjour discovery.
//!
//! Supports:
//! - Loading from YAML files
//! - Environment variable overrides (`BONJOUR__DISCOVERY__DRIVER=memory`)
//! - Validation of all settings

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// Capacity of the per-session resolve backlog.
pub const DEFAULT_BACKLOG_CAPACITY: usize = 32;

/// Main application configuration.
///
/// # Examples
///
/// ```no_run
/// use bonjour_core::config::AppConfig;
///
/// let config = AppConfig::from_file("bonjour.yaml").unwrap();
/// config.validate().unwrap();
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Discovery engine settings
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Loads configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        Self::from_yaml(&contents)
    }

    /// Loads configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::InvalidFormat {
            reason: e.to_string(),
        })
    }

    /// Loads configuration using the `config` crate: an optional YAML file,
    /// overridden by `BONJOUR__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let origin = path
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<environment>".to_string());

        let config = builder
            .add_source(
                config::Environment::with_prefix("BONJOUR")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigError::LoadFailed {
                path: origin,
                reason: e.to_string(),
            })?;

        config
            .try_deserialize()
            .map_err(|e| ConfigError::InvalidFormat {
                reason: e.to_string(),
            })
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.discovery.validate()?;
        self.logging.parse_level()?;
        Ok(())
    }
}

/// Which platform driver backs discovery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// Embedded mDNS responder
    #[default]
    Mdns,
    /// In-process network, for tests and offline demos
    Memory,
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverKind::Mdns => write!(f, "mdns"),
            DriverKind::Memory => write!(f, "memory"),
        }
    }
}

impl FromStr for DriverKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mdns" => Ok(DriverKind::Mdns),
            "memory" => Ok(DriverKind::Memory),
            other => Err(ConfigError::invalid_value(
                "discovery.driver",
                format!("unknown driver '{other}' (expected mdns or memory)"),
            )),
        }
    }
}

/// Settings for sessions, the resolve backlog and the shared driver handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Driver implementation
    #[serde(default)]
    pub driver: DriverKind,

    /// Maximum number of found services waiting to be resolved per session
    #[serde(default = "default_backlog_capacity")]
    pub backlog_capacity: usize,

    /// Network address the shared handle binds to (all interfaces if unset)
    #[serde(default)]
    pub interface_address: Option<IpAddr>,

    /// Upper bound on the blocking handle close (milliseconds)
    #[serde(default = "default_close_timeout")]
    pub close_timeout_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            driver: DriverKind::default(),
            backlog_capacity: default_backlog_capacity(),
            interface_address: None,
            close_timeout_ms: default_close_timeout(),
        }
    }
}

impl DiscoveryConfig {
    /// Returns the close timeout as a Duration
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backlog_capacity == 0 {
            return Err(ConfigError::invalid_value(
                "discovery.backlog_capacity",
                "cannot be 0",
            ));
        }

        if self.close_timeout_ms == 0 {
            return Err(ConfigError::invalid_value(
                "discovery.close_timeout_ms",
                "cannot be 0",
            ));
        }

        Ok(())
    }
}

fn default_backlog_capacity() -> usize {
    DEFAULT_BACKLOG_CAPACITY
}

fn default_close_timeout() -> u64 {
    3_000
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "text" or "json"
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
        }
    }
}

impl LoggingConfig {
    /// Parses the log level string to a tracing Level.
    pub fn parse_level(&self) -> Result<Level, ConfigError> {
        self.level.parse().map_err(|_| {
            ConfigError::invalid_value("logging.level", format!("Invalid log level: {}", self.level))
        })
    }
}

/// Log format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format
    #[default]
    Text,
    /// JSON format for structured logging
    Json,
}
