//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define gateway metrics (requests, latency, pool occupancy, notifications)
//! - Expose Prometheus-compatible metrics endpoint
//! - Track per-target and aggregate metrics
//!
//! # Metrics
//! - `pgw_requests_total` (counter): requests by route, status
//! - `pgw_request_duration_seconds` (histogram): latency distribution by route
//! - `pgw_pool_acquire_total` (counter): acquire outcomes by target
//! - `pgw_pool_sessions` (gauge): active/saved/free/queued by target
//! - `pgw_sessions_destroyed_total` (counter): destroyed sessions by target, reason
//! - `pgw_notifications_total` (counter): relayed notifications by outcome
//!
//! # Design Decisions
//! - Macros are no-ops until a recorder is installed, so tests need no setup
//! - Labels for route, target, status code

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::upstream::pool::PoolStats;

/// Install the Prometheus recorder and its HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Prometheus metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

/// Record a completed HTTP request.
pub fn record_request(route: &str, status: u16, start: Instant) {
    counter!("pgw_requests_total", "route" => route.to_string(), "status" => status.to_string()).increment(1);
    histogram!("pgw_request_duration_seconds", "route" => route.to_string()).record(start.elapsed().as_secs_f64());
}

/// `result` is one of reused / connecting / deferred / rejected.
pub fn record_pool_acquire(target: &str, result: &'static str) {
    counter!("pgw_pool_acquire_total", "target" => target.to_string(), "result" => result).increment(1);
}

pub fn record_session_destroyed(target: &str, reason: &'static str) {
    counter!("pgw_sessions_destroyed_total", "target" => target.to_string(), "reason" => reason).increment(1);
}

pub fn update_pool_gauges(target: &str, stats: &PoolStats) {
    let sets = [
        ("active", stats.active),
        ("saved", stats.saved),
        ("free", stats.free),
        ("queued", stats.queued),
    ];
    for (set, value) in sets {
        gauge!("pgw_pool_sessions", "target" => target.to_string(), "set" => set).set(value as f64);
    }
}

pub fn record_notification(outcome: &'static str) {
    counter!("pgw_notifications_total", "outcome" => outcome).increment(1);
}
