//! Metrics collection and export for Parley.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use parley_core::DeliveryReport;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "parley_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "parley_connections_active";
    pub const EVENTS_TOTAL: &str = "parley_events_total";
    pub const EVENT_BYTES_TOTAL: &str = "parley_event_bytes_total";
    pub const ROOMS_ACTIVE: &str = "parley_rooms_active";
    pub const MESSAGES_PERSISTED_TOTAL: &str = "parley_messages_persisted_total";
    pub const DELIVERIES_DROPPED_TOTAL: &str = "parley_deliveries_dropped_total";
    pub const LATENCY_SECONDS: &str = "parley_latency_seconds";
    pub const ERRORS_TOTAL: &str = "parley_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of live connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of live connections"
    );
    metrics::describe_counter!(names::EVENTS_TOTAL, "Total number of live-channel events");
    metrics::describe_counter!(
        names::EVENT_BYTES_TOTAL,
        "Total bytes of live-channel events"
    );
    metrics::describe_gauge!(names::ROOMS_ACTIVE, "Current number of rooms");
    metrics::describe_counter!(
        names::MESSAGES_PERSISTED_TOTAL,
        "Total number of messages persisted"
    );
    metrics::describe_counter!(
        names::DELIVERIES_DROPPED_TOTAL,
        "Events dropped because a connection's outbound queue was full or closed"
    );
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Message send latency (persist and fan-out) in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a live-channel event in `direction` ("in" or "out").
pub fn record_event(bytes: usize, direction: &'static str) {
    counter!(names::EVENTS_TOTAL, "direction" => direction).increment(1);
    counter!(names::EVENT_BYTES_TOTAL, "direction" => direction).increment(bytes as u64);
}

pub fn record_persisted() {
    counter!(names::MESSAGES_PERSISTED_TOTAL).increment(1);
}

/// Record the dropped part of a fan-out.
pub fn record_delivery(report: DeliveryReport) {
    if report.dropped > 0 {
        counter!(names::DELIVERIES_DROPPED_TOTAL).increment(report.dropped as u64);
    }
}

/// Record message send latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Update active room count.
pub fn set_active_rooms(count: usize) {
    gauge!(names::ROOMS_ACTIVE).set(count as f64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_without_recorder() {
        // No recorder installed: every call is a no-op.
        let _guard = ConnectionMetricsGuard::new();
        record_event(128, "in");
        record_delivery(DeliveryReport {
            delivered: 1,
            dropped: 2,
        });
        record_error("decode");
    }
}
