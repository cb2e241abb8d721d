//! DNS-SD service type grammar.
//!
//! A service type is one service label (letters, digits, hyphen, underscore)
//! prefixed with `_`, followed by `._tcp` or `._udp`, optionally followed by a
//! domain suffix such as `.local.`.

use crate::error::{DiscoveryError, Result};
use regex::Regex;
use std::sync::OnceLock;

/// Domain appended to types that carry no domain of their own.
pub const LOCAL_DOMAIN_SUFFIX: &str = ".local.";

fn type_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^_[a-zA-Z0-9\-_]+\.(_tcp|_udp)(\.[a-zA-Z0-9\-]+\.)?$")
            .expect("service type pattern is a valid regex")
    })
}

/// Returns true if `service_type` matches the DNS-SD type grammar.
///
/// Callers handling untrusted input should check this before starting a
/// discovery or broadcast.
pub fn is_valid_service_type(service_type: &str) -> bool {
    type_pattern().is_match(service_type)
}

/// Validates `service_type` and returns its canonical session-key form:
/// lower-case, always ending in a domain suffix (`.local.` when none was given).
pub fn normalize_service_type(service_type: &str) -> Result<String> {
    if !is_valid_service_type(service_type) {
        return Err(DiscoveryError::type_malformed(service_type));
    }

    let lowered = service_type.to_ascii_lowercase();
    if lowered.ends_with("._tcp") || lowered.ends_with("._udp") {
        Ok(format!("{lowered}{LOCAL_DOMAIN_SUFFIX}"))
    } else {
        Ok(lowered)
    }
}
