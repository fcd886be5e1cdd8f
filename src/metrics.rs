// src/metrics.rs

#[cfg(feature = "observability")]
pub use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};

// NOTE: When observability feature is disabled, provide stub implementations
#[cfg(not(feature = "observability"))]
pub enum Unit {}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! counter {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! gauge {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! histogram {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_counter {
    ($name:expr, $unit:expr, $desc:expr) => {};
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_gauge {
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_histogram {
    ($name:expr, $unit:expr, $desc:expr) => {};
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
use crate::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

use once_cell::sync::OnceCell;
use std::time::Duration;

static DESCRIBED: OnceCell<()> = OnceCell::new();

/// Registers descriptions for every metric the crate emits. Only the first
/// call has an effect, so install the exporter before starting services.
pub fn describe_metrics() {
    DESCRIBED.get_or_init(register_descriptions);
}

fn register_descriptions() {
    // Cache
    describe_counter!("read_cache_hits_total", Unit::Count, "Cache hits, labeled by layer (memory, persistent).");
    describe_counter!("read_cache_miss_total", Unit::Count, "Cache misses, labeled by store.");
    describe_counter!(
        "read_cache_persistent_errors_total",
        Unit::Count,
        "Persistent cache operations that failed and were degraded to a miss."
    );
    describe_gauge!("read_cache_memory_entries", "Entries held in the in-memory cache layer.");

    // Coordination
    describe_counter!(
        "read_dedup_hits_total",
        Unit::Count,
        "Requests that joined an identical in-flight request."
    );
    describe_counter!(
        "read_swr_stale_served_total",
        Unit::Count,
        "Stale-while-revalidate reads answered from cache."
    );
    describe_counter!(
        "read_swr_refresh_failures_total",
        Unit::Count,
        "Background refreshes that failed after a stale value was served."
    );

    // Batching
    describe_histogram!("read_multicall_batch_size", "Calls per aggregate multicall.");
    describe_counter!(
        "read_multicall_decode_failures_total",
        Unit::Count,
        "Sub-calls whose return data did not decode."
    );

    // RPC
    describe_counter!("read_rpc_requests_total", Unit::Count, "RPC attempts, labeled by chain and outcome.");
    describe_histogram!("read_rpc_latency_ms", Unit::Milliseconds, "Successful RPC latency in milliseconds.");
    describe_gauge!("read_rpc_endpoint_healthy", "Endpoint health (1=healthy, 0=unhealthy).");
}

pub fn increment_cache_hit(layer: &str) {
    counter!("read_cache_hits_total", 1, "layer" => layer.to_string());
}

pub fn increment_cache_miss(store: &str) {
    counter!("read_cache_miss_total", 1, "store" => store.to_string());
}

pub fn increment_cache_persistent_error(operation: &str) {
    counter!("read_cache_persistent_errors_total", 1, "operation" => operation.to_string());
}

pub fn set_cache_size(size: usize) {
    gauge!("read_cache_memory_entries", size as f64);
}

pub fn increment_dedup_hit(identifier: &str) {
    counter!("read_dedup_hits_total", 1, "identifier" => identifier.to_string());
}

pub fn increment_swr_stale_served(store: &str) {
    counter!("read_swr_stale_served_total", 1, "store" => store.to_string());
}

pub fn increment_swr_refresh_failure(store: &str) {
    counter!("read_swr_refresh_failures_total", 1, "store" => store.to_string());
}

pub fn record_multicall_batch_size(size: usize) {
    histogram!("read_multicall_batch_size", size as f64);
}

pub fn increment_multicall_decode_failure(function: &str) {
    counter!("read_multicall_decode_failures_total", 1, "function" => function.to_string());
}

pub fn record_rpc_success(chain_id: u64, latency: Duration) {
    counter!("read_rpc_requests_total", 1, "chain" => chain_id.to_string(), "outcome" => "success");
    histogram!("read_rpc_latency_ms", latency.as_secs_f64() * 1000.0, "chain" => chain_id.to_string());
}

pub fn record_rpc_failure(chain_id: u64) {
    counter!("read_rpc_requests_total", 1, "chain" => chain_id.to_string(), "outcome" => "failure");
}

pub fn set_endpoint_health(url: &str, healthy: bool) {
    gauge!("read_rpc_endpoint_healthy", if healthy { 1.0 } else { 0.0 }, "endpoint" => url.to_string());
}

/// Installs the Prometheus exporter listening on `addr`.
#[cfg(feature = "observability")]
pub fn install_prometheus_exporter(addr: std::net::SocketAddr) -> anyhow::Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    describe_metrics();
    Ok(())
}
