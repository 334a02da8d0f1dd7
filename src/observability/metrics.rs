//! Metrics collection and exposition.
//!
//! # Metrics
//! - `replay_proxy_requests_total` (counter): requests by mode, source, status
//! - `replay_proxy_request_duration_seconds` (histogram): dispatch latency
//! - `replay_proxy_cache_lookups_total` (counter): lookups by serving tier
//! - `replay_proxy_live_fetches_total` (counter): origin fetches by outcome
//! - `replay_proxy_coalesced_waits_total` (counter): requests that joined a fetch
//! - `replay_proxy_mode_changes_total` (counter): mode mutations by scope
//!
//! # Design Decisions
//! - Recording is a no-op until an exporter is installed
//! - The Prometheus listener is optional and separate from the proxy port

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::cache::Tier;
use crate::mode::Mode;

/// Install the Prometheus exporter with its own HTTP listener.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

/// Record one dispatched request.
pub fn record_request(mode: Mode, source: &str, status: u16, start: Instant) {
    counter!(
        "replay_proxy_requests_total",
        "mode" => mode.as_str(),
        "source" => source.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("replay_proxy_request_duration_seconds", "mode" => mode.as_str())
        .record(start.elapsed().as_secs_f64());
}

/// Record which tier served a lookup.
pub fn record_lookup(tier: Tier) {
    counter!("replay_proxy_cache_lookups_total", "tier" => tier.as_str()).increment(1);
}
