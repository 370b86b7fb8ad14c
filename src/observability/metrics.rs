//! Metrics collection and exposition.
//!
//! # Metrics
//! - `tether_connection_state` (gauge): numeric `ConnectionState` per connection
//! - `tether_health_check_duration_seconds` (histogram): probe latency
//! - `tether_circuit_breaker_state` (gauge): 0=closed, 1=half_open, 2=open
//! - `tether_transport_attempts_total` (counter): physical attempts per upstream
//! - `tether_transport_outcomes_total` (counter): logical call outcomes
//!
//! # Design Decisions
//! - Recording is a no-op until a recorder is installed, so library users
//!   pay nothing unless they opt in
//! - Labels are connection / upstream names, never per-request values

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;

use crate::connection::ConnectionState;
use crate::resilience::CircuitState;

/// Install the Prometheus recorder with its own scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_connection_state(name: &str, protocol: &'static str, state: ConnectionState) {
    gauge!(
        "tether_connection_state",
        "connection" => name.to_string(),
        "protocol" => protocol
    )
    .set(state as u8 as f64);
}

pub fn record_health_check(name: &str, latency: Duration) {
    histogram!("tether_health_check_duration_seconds", "connection" => name.to_string())
        .record(latency.as_secs_f64());
}

pub fn record_circuit_state(upstream: &str, state: CircuitState) {
    let value = match state {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 1.0,
        CircuitState::Open => 2.0,
    };
    gauge!("tether_circuit_breaker_state", "upstream" => upstream.to_string()).set(value);
}

pub fn record_transport_attempt(upstream: &str) {
    counter!("tether_transport_attempts_total", "upstream" => upstream.to_string()).increment(1);
}

pub fn record_transport_outcome(upstream: &str, outcome: &'static str) {
    counter!(
        "tether_transport_outcomes_total",
        "upstream" => upstream.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}
