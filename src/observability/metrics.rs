//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gateway_requests_total` (counter): finished requests by outcome, status
//! - `gateway_denials_total` (counter): pipeline denials by stage, rule
//! - `gateway_bytes_transferred_total` (counter): body bytes relayed to clients
//! - `gateway_stream_duration_seconds` (histogram): relay duration
//! - `gateway_active_streams` (gauge): relays currently running
//! - `gateway_events_dropped_total` (counter): events lost to a full sink buffer
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade and is a no-op until a
//!   recorder is installed, so tests need no setup
//! - The Prometheus exporter serves its own listener, separate from `/stream`

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder and its scrape listener.
pub fn init_metrics(address: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new()
        .with_http_listener(address)
        .install()?;
    tracing::info!(address = %address, "Metrics endpoint listening");
    Ok(())
}

pub fn record_request(outcome: &'static str, status: u16) {
    counter!(
        "gateway_requests_total",
        "outcome" => outcome,
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_denial(stage: &'static str, rule: &str) {
    counter!(
        "gateway_denials_total",
        "stage" => stage,
        "rule" => rule.to_string()
    )
    .increment(1);
}

pub fn record_stream_started() {
    gauge!("gateway_active_streams").increment(1.0);
}

pub fn record_stream_finished(bytes: u64, duration: Duration) {
    gauge!("gateway_active_streams").decrement(1.0);
    counter!("gateway_bytes_transferred_total").increment(bytes);
    histogram!("gateway_stream_duration_seconds").record(duration.as_secs_f64());
}

pub fn record_event_dropped() {
    counter!("gateway_events_dropped_total").increment(1);
}
