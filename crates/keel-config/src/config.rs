//! Root configuration type.

use keel_core::PerformanceProfile;
use serde::{Deserialize, Serialize};

use crate::{
    CircuitBreakerConfig, ConfigError, LogFormat, LoggingConfig, MemoryConfig, MonitorConfig,
    PoolConfig, ProfileConfig, RateLimitConfig,
};

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Complete Keel engine configuration.
///
/// # Example
///
/// ```
/// use keel_config::KeelConfig;
///
/// let config = KeelConfig::default();
/// assert_eq!(config.circuit_breaker.failure_threshold, 5);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct KeelConfig {
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Object pool configuration.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Memory governor configuration.
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Performance monitor configuration.
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Performance profile configuration.
    #[serde(default)]
    pub profile: ProfileConfig,

    /// Circuit breaker defaults.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Rate limiter defaults.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

impl KeelConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !LOG_LEVELS.contains(&self.logging.level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::invalid_value(
                "logging.level",
                format!("unknown level '{}'", self.logging.level),
            ));
        }

        if self.pool.small_max_bytes == 0 {
            return Err(ConfigError::invalid_value(
                "pool.small_max_bytes",
                "must be at least 1",
            ));
        }
        if self.pool.medium_max_bytes <= self.pool.small_max_bytes {
            return Err(ConfigError::invalid_value(
                "pool.medium_max_bytes",
                "must exceed pool.small_max_bytes",
            ));
        }

        let m = &self.memory;
        let bands_ok = m.medium_ratio > 0.0
            && m.medium_ratio < m.high_ratio
            && m.high_ratio < m.critical_ratio
            && m.critical_ratio <= 1.0;
        if !bands_ok {
            return Err(ConfigError::invalid_value(
                "memory",
                "ratios must satisfy 0 < medium_ratio < high_ratio < critical_ratio <= 1",
            ));
        }
        if m.trend_window < 2 {
            return Err(ConfigError::invalid_value(
                "memory.trend_window",
                "must be at least 2",
            ));
        }
        if m.trend_escalation <= 0.0 {
            return Err(ConfigError::invalid_value(
                "memory.trend_escalation",
                "must be positive",
            ));
        }

        let mon = &self.monitor;
        if mon.latency_window == 0 {
            return Err(ConfigError::invalid_value(
                "monitor.latency_window",
                "must be at least 1",
            ));
        }
        if mon.max_concurrency == 0 {
            return Err(ConfigError::invalid_value(
                "monitor.max_concurrency",
                "must be at least 1",
            ));
        }
        if mon.governor_interval_ms == 0 {
            return Err(ConfigError::invalid_value(
                "monitor.governor_interval_ms",
                "must be at least 1",
            ));
        }
        if !(mon.high_load_ratio > 0.0
            && mon.high_load_ratio < mon.extreme_load_ratio
            && mon.extreme_load_ratio <= 1.0)
        {
            return Err(ConfigError::invalid_value(
                "monitor",
                "load ratios must satisfy 0 < high_load_ratio < extreme_load_ratio <= 1",
            ));
        }

        let cb = &self.circuit_breaker;
        if cb.failure_threshold == 0 {
            return Err(ConfigError::invalid_value(
                "circuit_breaker.failure_threshold",
                "must be at least 1",
            ));
        }
        if cb.success_threshold == 0 {
            return Err(ConfigError::invalid_value(
                "circuit_breaker.success_threshold",
                "must be at least 1",
            ));
        }
        if !(100..=599).contains(&cb.failure_status_min) {
            return Err(ConfigError::invalid_value(
                "circuit_breaker.failure_status_min",
                "must be an HTTP status code",
            ));
        }

        self.validate_rate_limit()
    }

    fn validate_rate_limit(&self) -> Result<(), ConfigError> {
        let rl = &self.rate_limit;
        if rl.max_attempts == 0 {
            return Err(ConfigError::invalid_value(
                "rate_limit.max_attempts",
                "must be at least 1",
            ));
        }
        if rl.decay_minutes == 0 {
            return Err(ConfigError::invalid_value(
                "rate_limit.decay_minutes",
                "must be at least 1",
            ));
        }
        match (rl.burst_max, rl.burst_window_secs) {
            (None, None) => {}
            (Some(max), Some(window)) => {
                if max == 0 || window == 0 {
                    return Err(ConfigError::invalid_value(
                        "rate_limit.burst_max",
                        "burst limit and window must be at least 1",
                    ));
                }
                if window >= rl.decay_minutes.saturating_mul(60) {
                    return Err(ConfigError::invalid_value(
                        "rate_limit.burst_window_secs",
                        "must be shorter than the decay window",
                    ));
                }
            }
            _ => {
                return Err(ConfigError::invalid_value(
                    "rate_limit.burst_max",
                    "burst_max and burst_window_secs must be set together",
                ))
            }
        }
        Ok(())
    }

    /// Development preset: pretty debug logs, fixed profile.
    ///
    /// ```
    /// use keel_config::{KeelConfig, LogFormat};
    ///
    /// let config = KeelConfig::development();
    /// assert_eq!(config.logging.format, LogFormat::Pretty);
    /// ```
    #[must_use]
    pub fn development() -> Self {
        let mut config = Self::default();
        config.logging.level = "debug".to_string();
        config.logging.format = LogFormat::Pretty;
        config.monitor.auto_profile = false;
        config
    }

    /// Production preset: JSON logs, HIGH profile with automatic switching.
    #[must_use]
    pub fn production() -> Self {
        let mut config = Self::default();
        config.logging.level = "info".to_string();
        config.logging.format = LogFormat::Json;
        config.logging.include_target = false;
        config.profile.initial = PerformanceProfile::High;
        config.monitor.auto_profile = true;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(KeelConfig::default().validate().is_ok());
        assert!(KeelConfig::development().validate().is_ok());
        assert!(KeelConfig::production().validate().is_ok());
    }

    #[test]
    fn test_bands_must_increase() {
        let mut config = KeelConfig::default();
        config.memory.high_ratio = 0.4;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("memory"));
    }

    #[test]
    fn test_unknown_log_level() {
        let mut config = KeelConfig::default();
        config.logging.level = "loud".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_burst_requires_both_fields() {
        let mut config = KeelConfig::default();
        config.rate_limit.burst_max = Some(5);
        assert!(config.validate().is_err());

        config.rate_limit.burst_window_secs = Some(10);
        assert!(config.validate().is_ok());

        config.rate_limit.burst_window_secs = Some(60);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_thresholds_rejected() {
        let mut config = KeelConfig::default();
        config.circuit_breaker.failure_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = KeelConfig::default();
        config.rate_limit.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_production_preset() {
        let config = KeelConfig::production();
        assert_eq!(config.profile.initial, PerformanceProfile::High);
        assert_eq!(config.logging.format, LogFormat::Json);
    }
}
