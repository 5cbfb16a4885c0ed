//! Prometheus export of monitor and runtime metrics.
//!
//! Installs the global recorder, so this binary holds a single test.

use std::sync::Arc;
use std::time::Duration;

use http::{Method, StatusCode};
use keel_config::KeelConfig;
use keel_core::ManualClock;
use keel_runtime::{ManualProbe, Runtime};
use keel_telemetry::{init_metrics, render_metrics, PerformanceMonitor, TelemetryError};

#[test]
fn monitor_and_runtime_metrics_are_rendered() {
    let registry = init_metrics().unwrap();
    assert!(matches!(init_metrics(), Err(TelemetryError::MetricsInit(_))));

    let mut config = KeelConfig::default();
    config.memory.limit_bytes = 1024;
    config.monitor.sample_every_requests = 2;

    let probe = Arc::new(ManualProbe::new(512, 0));
    let clock = Arc::new(ManualClock::new(Duration::ZERO));
    let runtime = Runtime::with_parts(&config, probe, clock.clone()).unwrap();
    let monitor = PerformanceMonitor::new(&config.monitor, runtime.clone());

    let ok = monitor.request_started(&Method::GET, "/health");
    clock.advance(Duration::from_millis(5));
    ok.finish(StatusCode::OK, None);
    monitor
        .request_started(&Method::POST, "/orders")
        .finish(StatusCode::SERVICE_UNAVAILABLE, Some("circuit_breaker"));
    assert!(monitor.run_pending_tick().is_some());

    let lease = runtime.buffers().acquire_for(8 * 1024);
    runtime.buffers().release(lease);

    let text = registry.render();
    assert!(text.contains("keel_requests_total"));
    assert!(text.contains("keel_request_duration_seconds"));
    assert!(text.contains("keel_request_errors_total"));
    assert!(text.contains("stage=\"circuit_breaker\""));
    assert!(text.contains("keel_memory_pressure_level"));
    assert!(text.contains("keel_pool_misses_total"));
    assert!(render_metrics().is_some_and(|t| t.contains("keel_requests_total")));
}
