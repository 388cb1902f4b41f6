//! Prometheus metrics for the volume watcher
//!
//! Provides metrics for monitoring watcher lifecycles, unpublish steps and
//! claim update batching.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Metric names
pub mod names {
    /// Gauge: Volume watchers in the registry, running or dormant
    pub const WATCHERS_REGISTERED: &str = "volume_watcher_watchers_registered";
    /// Counter: Volume watcher task starts
    pub const WATCHER_STARTS_TOTAL: &str = "volume_watcher_starts_total";
    /// Counter: Volume watcher task exits by reason
    pub const WATCHER_STOPS_TOTAL: &str = "volume_watcher_stops_total";
    /// Counter: Unpublish steps by step and status
    pub const UNPUBLISH_STEPS_TOTAL: &str = "volume_watcher_unpublish_steps_total";
    /// Histogram: Duration of unpublish steps in seconds
    pub const UNPUBLISH_STEP_DURATION_SECONDS: &str = "volume_watcher_unpublish_step_duration_seconds";
    /// Histogram: Claim updates per batched write
    pub const CLAIM_BATCH_SIZE: &str = "volume_watcher_claim_batch_size";
    /// Counter: Number of retried RPCs
    pub const RETRIES_TOTAL: &str = "volume_watcher_retries_total";
}

/// Initialize the Prometheus metrics exporter
///
/// Starts an HTTP server on the specified address that serves metrics
/// at the `/metrics` endpoint.
pub fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on http://{}/metrics", addr);
    Ok(())
}

/// Record an unpublish step with its result
pub fn record_step(step: &str, status: &str, duration_secs: f64) {
    counter!(names::UNPUBLISH_STEPS_TOTAL, "step" => step.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!(names::UNPUBLISH_STEP_DURATION_SECONDS, "step" => step.to_string())
        .record(duration_secs);
}

pub fn set_watchers_registered(count: usize) {
    gauge!(names::WATCHERS_REGISTERED).set(count as f64);
}

pub fn record_watcher_start() {
    counter!(names::WATCHER_STARTS_TOTAL).increment(1);
}

pub fn record_watcher_stop(reason: &str) {
    counter!(names::WATCHER_STOPS_TOTAL, "reason" => reason.to_string()).increment(1);
}

pub fn record_batch(size: usize) {
    histogram!(names::CLAIM_BATCH_SIZE).record(size as f64);
}

/// Record a retry attempt
pub fn record_retry(operation: &str) {
    counter!(names::RETRIES_TOTAL, "operation" => operation.to_string()).increment(1);
}

/// Helper for timing unpublish steps and other operations
pub struct OperationTimer {
    step: &'static str,
    start: Instant,
}

impl OperationTimer {
    pub fn new(step: &'static str) -> Self {
        Self {
            step,
            start: Instant::now(),
        }
    }

    pub fn success(self) {
        record_step(self.step, "success", self.start.elapsed().as_secs_f64());
    }

    pub fn failure(self, status: &str) {
        record_step(self.step, status, self.start.elapsed().as_secs_f64());
    }
}
