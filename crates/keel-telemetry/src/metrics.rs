//! Prometheus metrics for Keel.
//!
//! Every Keel crate records through the `metrics` facade. This module
//! describes the standard metrics once and installs the Prometheus recorder
//! whose handle renders the text exposition format.
//!
//! # Standard Metrics
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `keel_requests_total` | Counter | `method`, `status` | Finished requests |
//! | `keel_request_duration_seconds` | Histogram | `method` | Request latency |
//! | `keel_in_flight_requests` | Gauge | - | Requests being processed |
//! | `keel_request_errors_total` | Counter | `stage`, `outcome` | Error events |
//! | `keel_pipeline_cache_hits_total` | Counter | - | Compiled-pipeline cache hits |
//! | `keel_pipeline_stages_elided_total` | Counter | - | Duplicate stages elided |
//! | `keel_pool_hits_total` | Counter | `class` | Pool acquisitions served idle |
//! | `keel_pool_misses_total` | Counter | `class` | Pool acquisitions that allocated |
//! | `keel_memory_pressure_level` | Gauge | - | 0=LOW .. 3=CRITICAL |
//! | `keel_gc_runs_total` | Counter | `level` | Governor collections |
//! | `keel_profile_switches_total` | Counter | `to`, `reason` | Profile changes |
//! | `keel_circuit_transitions_total` | Counter | `to` | Breaker transitions |
//! | `keel_rate_limited_total` | Counter | `window` | Rejected by the rate limiter |

use std::sync::OnceLock;
use std::time::Duration;

use http::Method;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::error::TelemetryError;
use crate::TelemetryResult;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Renders the installed recorder's metrics.
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    handle: PrometheusHandle,
}

impl MetricsRegistry {
    /// Wraps a Prometheus handle.
    #[must_use]
    pub fn new(handle: PrometheusHandle) -> Self {
        Self { handle }
    }

    /// Renders all metrics in Prometheus text format.
    #[must_use]
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Installs the Prometheus recorder and describes the standard metrics.
///
/// Rendering is left to the caller; no listener is started.
///
/// # Errors
///
/// Returns `TelemetryError::MetricsInit` if a global recorder is already
/// installed.
pub fn init_metrics() -> TelemetryResult<MetricsRegistry> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;

    let _ = METRICS_HANDLE.set(handle.clone());
    describe_metrics();

    Ok(MetricsRegistry::new(handle))
}

/// Returns the global metrics handle if initialized.
pub fn metrics_handle() -> Option<&'static PrometheusHandle> {
    METRICS_HANDLE.get()
}

/// Renders metrics in Prometheus format, or `None` before [`init_metrics`].
#[must_use]
pub fn render_metrics() -> Option<String> {
    METRICS_HANDLE.get().map(PrometheusHandle::render)
}

fn describe_metrics() {
    describe_counter!("keel_requests_total", "Total number of requests finished by the pipeline");
    describe_histogram!(
        "keel_request_duration_seconds",
        "Pipeline request duration in seconds"
    );
    describe_gauge!(
        "keel_in_flight_requests",
        "Number of requests currently inside a pipeline"
    );
    describe_counter!(
        "keel_request_errors_total",
        "Error events by originating stage and outcome"
    );

    describe_counter!(
        "keel_pipeline_cache_hits_total",
        "Compiled-pipeline cache hits"
    );
    describe_counter!(
        "keel_pipeline_stages_elided_total",
        "Duplicate stages removed at compile time"
    );

    describe_counter!("keel_pool_hits_total", "Pool acquisitions served from the idle set");
    describe_counter!("keel_pool_misses_total", "Pool acquisitions that built a new value");
    describe_gauge!(
        "keel_memory_pressure_level",
        "Last sampled memory pressure (0=LOW, 1=MEDIUM, 2=HIGH, 3=CRITICAL)"
    );
    describe_counter!("keel_gc_runs_total", "Memory governor collection runs");
    describe_counter!("keel_profile_switches_total", "Performance profile changes");

    describe_counter!(
        "keel_circuit_transitions_total",
        "Circuit breaker state transitions"
    );
    describe_counter!("keel_rate_limited_total", "Requests rejected by the rate limiter");
}

/// Records a finished request.
pub fn record_request(method: &Method, status_code: u16, duration: Duration) {
    counter!(
        "keel_requests_total",
        "method" => method.to_string(),
        "status" => status_code.to_string()
    )
    .increment(1);

    histogram!(
        "keel_request_duration_seconds",
        "method" => method.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Records an error event.
pub fn record_error(stage: Option<&str>, outcome: &'static str) {
    counter!(
        "keel_request_errors_total",
        "stage" => stage.unwrap_or("none").to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Increments the in-flight requests gauge.
pub fn increment_in_flight() {
    gauge!("keel_in_flight_requests").increment(1.0);
}

/// Decrements the in-flight requests gauge.
pub fn decrement_in_flight() {
    gauge!("keel_in_flight_requests").decrement(1.0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_functions_without_recorder() {
        record_request(&Method::GET, 200, Duration::from_millis(10));
        record_error(Some("auth"), "responded");
        record_error(None, "cancelled");
        increment_in_flight();
        decrement_in_flight();
    }

    #[test]
    fn test_render_without_init() {
        // Another test in this binary may have installed the recorder.
        let _ = render_metrics();
    }
}
