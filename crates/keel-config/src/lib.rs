//! Typed configuration for Keel.
//!
//! The configuration system is built around [`KeelConfig`], whose sections
//! tune each part of the engine:
//!
//! - [`LoggingConfig`] - log level and output format
//! - [`PoolConfig`] - capacity classes and the serialization threshold
//! - [`MemoryConfig`] - pressure bands and collection strategy
//! - [`MonitorConfig`] - latency window, load ceiling, governor cadence
//! - [`ProfileConfig`] - initial performance profile
//! - [`CircuitBreakerConfig`] / [`RateLimitConfig`] - resilience defaults
//!
//! # Example
//!
//! ```no_run
//! use keel_config::ConfigLoader;
//!
//! # fn main() -> Result<(), keel_config::ConfigError> {
//! let config = ConfigLoader::new()
//!     .with_file("keel.toml")?
//!     .with_env_prefix("KEEL")
//!     .load()?;
//!
//! println!("breaker opens after {} failures", config.circuit_breaker.failure_threshold);
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration File Format
//!
//! ```toml
//! [logging]
//! level = "info"
//! format = "json"
//!
//! [pool]
//! serialize_threshold_bytes = 256
//!
//! [memory]
//! limit_bytes = 536870912
//! strategy = "adaptive"
//!
//! [profile]
//! initial = "high"
//!
//! [circuit_breaker]
//! failure_threshold = 5
//! recovery_timeout_secs = 30
//!
//! [rate_limit]
//! max_attempts = 60
//! decay_minutes = 1
//! burst_max = 10
//! burst_window_secs = 5
//! ```
//!
//! # Environment Variable Overrides
//!
//! Any field can be overridden with `PREFIX__SECTION__KEY`, e.g.
//! `KEEL__RATE_LIMIT__MAX_ATTEMPTS=120` or `KEEL__PROFILE__INITIAL=extreme`.

#![warn(missing_docs)]

mod config;
mod error;
mod loader;
mod schema;

pub use config::KeelConfig;
pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use schema::*;
