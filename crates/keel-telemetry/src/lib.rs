//! Observability for Keel.
//!
//! - **Logging**: structured JSON or pretty output through `tracing-subscriber`
//! - **Metrics**: Prometheus exposition through the `metrics` facade
//! - **Performance monitor**: request latency, live load, aggregates and the
//!   governor loop that switches performance profiles
//!
//! Logging and metrics install process-global state, so they are opt-in
//! through [`init_telemetry`]. The [`PerformanceMonitor`] is an ordinary
//! value built from a [`keel_runtime::Runtime`].
//!
//! # Example
//!
//! ```rust,ignore
//! use keel_config::KeelConfig;
//! use keel_runtime::Runtime;
//! use keel_telemetry::{init_telemetry, PerformanceMonitor};
//!
//! let config = KeelConfig::production();
//! let registry = init_telemetry(&config.logging)?;
//!
//! let runtime = Runtime::start(&config)?;
//! let monitor = PerformanceMonitor::new(&config.monitor, runtime);
//! let governor = monitor.spawn_configured_governor();
//!
//! println!("{}", registry.render());
//! ```

#![warn(missing_docs)]

pub mod error;
pub mod logging;
pub mod metrics;
pub mod monitor;

use keel_config::LoggingConfig;

pub use error::TelemetryError;
pub use logging::init_logging;
pub use metrics::{init_metrics, render_metrics, MetricsRegistry};
pub use monitor::{
    AggregateMetrics, ErrorEvent, GovernorHandle, InFlightRequest, LiveMetrics, PerformanceMonitor,
    RequestOutcome, TickReport,
};

/// Result type for telemetry operations.
pub type TelemetryResult<T> = Result<T, TelemetryError>;

/// Installs the log subscriber and the metrics recorder.
///
/// Call once at process start.
///
/// # Errors
///
/// Returns `TelemetryError` if either global is already installed.
pub fn init_telemetry(logging: &LoggingConfig) -> TelemetryResult<MetricsRegistry> {
    init_logging(logging)?;
    init_metrics()
}
