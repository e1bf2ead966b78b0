//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define control plane metrics (requests, connections, frames, RPC, peers)
//! - Expose a Prometheus-compatible metrics endpoint when enabled
//!
//! # Metrics
//! - `netplane_http_requests_total` (counter): requests by method (verb), status
//! - `netplane_http_request_duration_seconds` (histogram): latency distribution
//! - `netplane_active_connections` (gauge): current connection count
//! - `netplane_ws_frames_total` (counter): frames by direction, opcode
//! - `netplane_ws_closes_total` (counter): close frames sent by code
//! - `netplane_rpc_requests_total` (counter): outbound calls by outcome
//! - `netplane_rpc_pending` (gauge): outstanding calls awaiting a reply
//! - `netplane_peers` (gauge): known peers, by connected state
//! - `netplane_auth_failures_total` (counter): rejected credentials
//!
//! # Design Decisions
//! - Recording is a no-op until a recorder is installed
//! - Labels are low-cardinality (no paths, no uuids)

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(verb: &str, status: u16, start: Instant) {
    metrics::counter!(
        "netplane_http_requests_total",
        "method" => verb.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!("netplane_http_request_duration_seconds", "method" => verb.to_string())
        .record(start.elapsed().as_secs_f64());
}

pub fn record_active_connections(count: u64) {
    metrics::gauge!("netplane_active_connections").set(count as f64);
}

pub fn record_frame(direction: &'static str, opcode: &'static str) {
    metrics::counter!(
        "netplane_ws_frames_total",
        "direction" => direction,
        "opcode" => opcode
    )
    .increment(1);
}

pub fn record_close(code: u16) {
    metrics::counter!("netplane_ws_closes_total", "code" => code.to_string()).increment(1);
}

pub fn record_rpc(outcome: &'static str) {
    metrics::counter!("netplane_rpc_requests_total", "outcome" => outcome).increment(1);
}

/// Adjust the outstanding call gauge; shared by every connection's correlator.
pub fn record_rpc_pending(delta: f64) {
    metrics::gauge!("netplane_rpc_pending").increment(delta);
}

pub fn record_peers(known: usize, connected: usize) {
    metrics::gauge!("netplane_peers", "state" => "known").set(known as f64);
    metrics::gauge!("netplane_peers", "state" => "connected").set(connected as f64);
}

pub fn record_auth_failure(method: &'static str) {
    metrics::counter!("netplane_auth_failures_total", "method" => method).increment(1);
}
