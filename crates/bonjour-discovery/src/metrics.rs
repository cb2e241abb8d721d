//! Metrics Collection
//!
//! Counters for the discovery core:
//! - Sessions started/stopped/failed
//! - Resolves completed/failed and backlog rejections
//! - Shared handles created/closed
//!
//! Values are reported through the `metrics` facade; no exporter is
//! installed here.

use metrics::{counter, describe_counter, describe_gauge, gauge};
use std::sync::atomic::{AtomicU64, Ordering};

/// Discovery metrics collector
#[derive(Debug)]
pub struct DiscoveryMetrics {
    sessions_started: AtomicU64,
    sessions_stopped: AtomicU64,
    resolves_completed: AtomicU64,
    resolves_failed: AtomicU64,
    backlog_rejections: AtomicU64,
    handles_created: AtomicU64,
    handles_closed: AtomicU64,
}

impl DiscoveryMetrics {
    pub fn new() -> Self {
        describe_counter!(
            "bonjour_sessions_started_total",
            "Discovery sessions that issued a driver start"
        );
        describe_counter!(
            "bonjour_sessions_stopped_total",
            "Discovery sessions torn down"
        );
        describe_counter!(
            "bonjour_sessions_failed_total",
            "Discovery sessions terminated by a driver or resource error"
        );
        describe_counter!("bonjour_resolves_completed_total", "Successful resolves");
        describe_counter!("bonjour_resolves_failed_total", "Failed resolves");
        describe_counter!(
            "bonjour_backlog_rejections_total",
            "Found services dropped because the resolve backlog was full"
        );
        describe_counter!("bonjour_handles_created_total", "Shared driver handles created");
        describe_counter!("bonjour_handles_closed_total", "Shared driver handles closed");
        describe_gauge!("bonjour_active_sessions", "Currently running discovery sessions");

        Self {
            sessions_started: AtomicU64::new(0),
            sessions_stopped: AtomicU64::new(0),
            resolves_completed: AtomicU64::new(0),
            resolves_failed: AtomicU64::new(0),
            backlog_rejections: AtomicU64::new(0),
            handles_created: AtomicU64::new(0),
            handles_closed: AtomicU64::new(0),
        }
    }

    pub fn record_session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
        counter!("bonjour_sessions_started_total").increment(1);
        gauge!("bonjour_active_sessions").increment(1.0);
    }

    pub fn record_session_stopped(&self) {
        self.sessions_stopped.fetch_add(1, Ordering::Relaxed);
        counter!("bonjour_sessions_stopped_total").increment(1);
        gauge!("bonjour_active_sessions").decrement(1.0);
    }

    pub fn record_session_failed(&self, driver: &str) {
        counter!("bonjour_sessions_failed_total", "driver" => driver.to_string()).increment(1);
    }

    pub fn record_resolve_completed(&self) {
        self.resolves_completed.fetch_add(1, Ordering::Relaxed);
        counter!("bonjour_resolves_completed_total").increment(1);
    }

    pub fn record_resolve_failed(&self) {
        self.resolves_failed.fetch_add(1, Ordering::Relaxed);
        counter!("bonjour_resolves_failed_total").increment(1);
    }

    pub fn record_backlog_rejection(&self) {
        self.backlog_rejections.fetch_add(1, Ordering::Relaxed);
        counter!("bonjour_backlog_rejections_total").increment(1);
    }

    pub fn record_handle_created(&self) {
        self.handles_created.fetch_add(1, Ordering::Relaxed);
        counter!("bonjour_handles_created_total").increment(1);
    }

    pub fn record_handle_closed(&self) {
        self.handles_closed.fetch_add(1, Ordering::Relaxed);
        counter!("bonjour_handles_closed_total").increment(1);
    }

    pub fn get_sessions_started(&self) -> u64 {
        self.sessions_started.load(Ordering::Relaxed)
    }

    pub fn get_sessions_stopped(&self) -> u64 {
        self.sessions_stopped.load(Ordering::Relaxed)
    }

    pub fn get_resolves_completed(&self) -> u64 {
        self.resolves_completed.load(Ordering::Relaxed)
    }

    pub fn get_resolves_failed(&self) -> u64 {
        self.resolves_failed.load(Ordering::Relaxed)
    }

    pub fn get_backlog_rejections(&self) -> u64 {
        self.backlog_rejections.load(Ordering::Relaxed)
    }

    pub fn get_handles_created(&self) -> u64 {
        self.handles_created.load(Ordering::Relaxed)
    }

    pub fn get_handles_closed(&self) -> u64 {
        self.handles_closed.load(Ordering::Relaxed)
    }
}

impl Default for DiscoveryMetrics {
    fn default() -> Self {
        Self::new()
    }
}
