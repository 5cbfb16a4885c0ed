//! Configuration schema types.
//!
//! Every section rejects unknown fields and defaults every field, so a
//! partial file only has to name what it changes.

use keel_core::{GcStrategy, PerformanceProfile};
use serde::{Deserialize, Serialize};

/// Log output format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Structured JSON, one object per line.
    #[default]
    Json,
    /// Human-readable multi-line output.
    Pretty,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Enable log output.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Minimum level: trace, debug, info, warn or error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format.
    #[serde(default)]
    pub format: LogFormat,

    /// Include the module target in each line.
    #[serde(default = "default_true")]
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: default_log_level(),
            format: LogFormat::Json,
            include_target: true,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Object pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    /// Largest footprint that still counts as the small class.
    #[serde(default = "default_small_max")]
    pub small_max_bytes: usize,

    /// Largest footprint that still counts as the medium class.
    #[serde(default = "default_medium_max")]
    pub medium_max_bytes: usize,

    /// Serialized payloads below this size bypass the buffer pool.
    #[serde(default = "default_serialize_threshold")]
    pub serialize_threshold_bytes: usize,

    /// Idle entries kept per class after an emergency shrink.
    #[serde(default = "default_idle_floor")]
    pub idle_floor: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            small_max_bytes: default_small_max(),
            medium_max_bytes: default_medium_max(),
            serialize_threshold_bytes: default_serialize_threshold(),
            idle_floor: default_idle_floor(),
        }
    }
}

fn default_small_max() -> usize {
    4 * 1024
}

fn default_medium_max() -> usize {
    64 * 1024
}

fn default_serialize_threshold() -> usize {
    256
}

fn default_idle_floor() -> usize {
    2
}

/// Memory governor configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MemoryConfig {
    /// Memory budget in bytes. `0` uses the machine's total memory.
    #[serde(default)]
    pub limit_bytes: u64,

    /// Utilisation at which pressure becomes MEDIUM.
    #[serde(default = "default_medium_ratio")]
    pub medium_ratio: f64,

    /// Utilisation at which pressure becomes HIGH.
    #[serde(default = "default_high_ratio")]
    pub high_ratio: f64,

    /// Utilisation at which pressure becomes CRITICAL.
    #[serde(default = "default_critical_ratio")]
    pub critical_ratio: f64,

    /// Samples considered when computing the pressure trend.
    #[serde(default = "default_trend_window")]
    pub trend_window: usize,

    /// Utilisation growth per sample that makes the adaptive strategy
    /// collect at MEDIUM.
    #[serde(default = "default_trend_escalation")]
    pub trend_escalation: f64,

    /// Force a strategy instead of deriving it from the profile.
    #[serde(default)]
    pub strategy: Option<GcStrategy>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            limit_bytes: 0,
            medium_ratio: default_medium_ratio(),
            high_ratio: default_high_ratio(),
            critical_ratio: default_critical_ratio(),
            trend_window: default_trend_window(),
            trend_escalation: default_trend_escalation(),
            strategy: None,
        }
    }
}

fn default_medium_ratio() -> f64 {
    0.50
}

fn default_high_ratio() -> f64 {
    0.75
}

fn default_critical_ratio() -> f64 {
    0.90
}

fn default_trend_window() -> usize {
    8
}

fn default_trend_escalation() -> f64 {
    0.05
}

/// Performance monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MonitorConfig {
    /// Latency samples retained for percentile computation.
    #[serde(default = "default_latency_window")]
    pub latency_window: usize,

    /// Error events retained for inspection.
    #[serde(default = "default_error_log_capacity")]
    pub error_log_capacity: usize,

    /// In-flight requests that count as full load.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u64,

    /// Period of the background governor loop.
    #[serde(default = "default_governor_interval")]
    pub governor_interval_ms: u64,

    /// Run a governor tick every N finished requests. `0` disables.
    #[serde(default = "default_sample_every")]
    pub sample_every_requests: u64,

    /// Let the governor switch profiles on its own.
    #[serde(default = "default_true")]
    pub auto_profile: bool,

    /// Load ratio that escalates BALANCED to HIGH.
    #[serde(default = "default_high_load")]
    pub high_load_ratio: f64,

    /// Load ratio that escalates to EXTREME.
    #[serde(default = "default_extreme_load")]
    pub extreme_load_ratio: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            latency_window: default_latency_window(),
            error_log_capacity: default_error_log_capacity(),
            max_concurrency: default_max_concurrency(),
            governor_interval_ms: default_governor_interval(),
            sample_every_requests: default_sample_every(),
            auto_profile: true,
            high_load_ratio: default_high_load(),
            extreme_load_ratio: default_extreme_load(),
        }
    }
}

fn default_latency_window() -> usize {
    1024
}

fn default_error_log_capacity() -> usize {
    256
}

fn default_max_concurrency() -> u64 {
    1024
}

fn default_governor_interval() -> u64 {
    1000
}

fn default_sample_every() -> u64 {
    64
}

fn default_high_load() -> f64 {
    0.60
}

fn default_extreme_load() -> f64 {
    0.85
}

/// Performance profile configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ProfileConfig {
    /// Profile active at startup.
    #[serde(default)]
    pub initial: PerformanceProfile,

    /// When disabled, every component behaves as BALANCED.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            initial: PerformanceProfile::Balanced,
            enabled: true,
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Consecutive trial successes that close it again.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Time an open circuit waits before admitting a trial.
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_secs: u64,

    /// Lowest response status counted as a failure.
    #[serde(default = "default_failure_status_min")]
    pub failure_status_min: u16,

    /// Prefix for breaker keys in the state store.
    #[serde(default = "default_circuit_prefix")]
    pub key_prefix: String,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            recovery_timeout_secs: default_recovery_timeout(),
            failure_status_min: default_failure_status_min(),
            key_prefix: default_circuit_prefix(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_recovery_timeout() -> u64 {
    30
}

fn default_failure_status_min() -> u16 {
    500
}

fn default_circuit_prefix() -> String {
    "circuit:".to_string()
}

/// Rate limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Attempts allowed per decay window.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Length of the primary window in minutes.
    #[serde(default = "default_decay_minutes")]
    pub decay_minutes: u64,

    /// Attempts allowed per burst window. Unset disables burst limiting.
    #[serde(default)]
    pub burst_max: Option<u32>,

    /// Length of the burst window in seconds.
    #[serde(default)]
    pub burst_window_secs: Option<u64>,

    /// Prefix for rate window keys in the state store.
    #[serde(default = "default_rate_prefix")]
    pub key_prefix: String,

    /// Header carrying the window limit.
    #[serde(default = "default_limit_header")]
    pub limit_header: String,

    /// Header carrying the remaining attempts.
    #[serde(default = "default_remaining_header")]
    pub remaining_header: String,

    /// Header carrying the seconds until the window resets.
    #[serde(default = "default_reset_header")]
    pub reset_header: String,

    /// Header carrying retry guidance on rejection.
    #[serde(default = "default_retry_after_header")]
    pub retry_after_header: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            decay_minutes: default_decay_minutes(),
            burst_max: None,
            burst_window_secs: None,
            key_prefix: default_rate_prefix(),
            limit_header: default_limit_header(),
            remaining_header: default_remaining_header(),
            reset_header: default_reset_header(),
            retry_after_header: default_retry_after_header(),
        }
    }
}

fn default_max_attempts() -> u32 {
    60
}

fn default_decay_minutes() -> u64 {
    1
}

fn default_rate_prefix() -> String {
    "rate:".to_string()
}

fn default_limit_header() -> String {
    "x-ratelimit-limit".to_string()
}

fn default_remaining_header() -> String {
    "x-ratelimit-remaining".to_string()
}

fn default_reset_header() -> String {
    "x-ratelimit-reset".to_string()
}

fn default_retry_after_header() -> String {
    "retry-after".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_defaults() {
        let pool = PoolConfig::default();
        assert_eq!(pool.small_max_bytes, 4096);
        assert_eq!(pool.medium_max_bytes, 65536);
        assert_eq!(pool.serialize_threshold_bytes, 256);
    }

    #[test]
    fn test_partial_section_keeps_defaults() {
        let memory: MemoryConfig = toml::from_str("high_ratio = 0.8").unwrap();
        assert!((memory.high_ratio - 0.8).abs() < f64::EPSILON);
        assert!((memory.medium_ratio - 0.5).abs() < f64::EPSILON);
        assert_eq!(memory.strategy, None);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result: Result<PoolConfig, _> = toml::from_str("max_idle = 3");
        assert!(result.is_err());
    }

    #[test]
    fn test_strategy_and_profile_parse() {
        let memory: MemoryConfig = toml::from_str("strategy = \"aggressive\"").unwrap();
        assert_eq!(memory.strategy, Some(GcStrategy::Aggressive));

        let profile: ProfileConfig = toml::from_str("initial = \"extreme\"").unwrap();
        assert_eq!(profile.initial, PerformanceProfile::Extreme);
    }

    #[test]
    fn test_rate_limit_header_defaults() {
        let rate = RateLimitConfig::default();
        assert_eq!(rate.remaining_header, "x-ratelimit-remaining");
        assert_eq!(rate.retry_after_header, "retry-after");
        assert!(rate.burst_max.is_none());
    }
}
