//! Configuration loader with layered approach.
//!
//! Layers apply in order, later ones winning:
//! 1. Default values (or a preset)
//! 2. Configuration file or string (TOML or JSON)
//! 3. Environment variables (`PREFIX__SECTION__KEY`)

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use crate::{ConfigError, KeelConfig, LogFormat};

/// Configuration loader.
///
/// # Example
///
/// ```no_run
/// use keel_config::ConfigLoader;
///
/// # fn main() -> Result<(), keel_config::ConfigError> {
/// let config = ConfigLoader::new()
///     .with_defaults()
///     .with_optional_file("keel.toml")?
///     .with_env_prefix("KEEL")
///     .load()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ConfigLoader {
    config: KeelConfig,
    env_prefix: Option<String>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Create a new loader starting from defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: KeelConfig::default(),
            env_prefix: None,
        }
    }

    /// Reset to default values.
    #[must_use]
    pub fn with_defaults(mut self) -> Self {
        self.config = KeelConfig::default();
        self
    }

    /// Start from the development preset.
    #[must_use]
    pub fn with_development(mut self) -> Self {
        self.config = KeelConfig::development();
        self
    }

    /// Start from the production preset.
    #[must_use]
    pub fn with_production(mut self) -> Self {
        self.config = KeelConfig::production();
        self
    }

    /// Load configuration from a file. The format follows the extension
    /// (`.toml` or `.json`).
    ///
    /// # Errors
    ///
    /// Fails if the file is missing, unreadable, malformed or contains
    /// unknown fields.
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::file_not_found(path));
        }

        let content = fs::read_to_string(path).map_err(|e| ConfigError::read_error(path, e))?;

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase);

        self.config = match extension.as_deref() {
            Some("toml") => toml::from_str(&content)?,
            Some("json") => serde_json::from_str(&content)?,
            _ => {
                return Err(ConfigError::UnsupportedFormat(
                    path.display().to_string(),
                ))
            }
        };

        Ok(self)
    }

    /// Load configuration from a file if it exists.
    ///
    /// # Errors
    ///
    /// Fails if the file exists but cannot be loaded.
    pub fn with_optional_file<P: AsRef<Path>>(self, path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            self.with_file(path)
        } else {
            Ok(self)
        }
    }

    /// Load configuration from a string in `format` (`"toml"` or `"json"`).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if parsing fails.
    ///
    /// # Example
    ///
    /// ```
    /// use keel_config::ConfigLoader;
    ///
    /// let toml = r#"
    ///     [rate_limit]
    ///     max_attempts = 3
    /// "#;
    ///
    /// let config = ConfigLoader::new()
    ///     .with_string(toml, "toml")
    ///     .unwrap()
    ///     .load()
    ///     .unwrap();
    ///
    /// assert_eq!(config.rate_limit.max_attempts, 3);
    /// ```
    pub fn with_string(mut self, content: &str, format: &str) -> Result<Self, ConfigError> {
        self.config = match format.to_lowercase().as_str() {
            "toml" => toml::from_str(content)?,
            "json" => serde_json::from_str(content)?,
            other => return Err(ConfigError::UnsupportedFormat(other.to_string())),
        };
        Ok(self)
    }

    /// Set the environment variable prefix for overrides.
    #[must_use]
    pub fn with_env_prefix(mut self, prefix: &str) -> Self {
        self.env_prefix = Some(prefix.to_uppercase());
        self
    }

    /// Load a `.env` file into the process environment, if one exists.
    ///
    /// # Errors
    ///
    /// Fails if a `.env` file exists but cannot be parsed.
    pub fn with_dotenv(self) -> Result<Self, ConfigError> {
        match dotenvy::dotenv() {
            Ok(_) => Ok(self),
            Err(e) if e.not_found() => Ok(self),
            Err(e) => Err(ConfigError::env_parse_error(".env", e.to_string())),
        }
    }

    /// Apply environment overrides and validate.
    ///
    /// # Errors
    ///
    /// Fails on an unparsable override or an invalid final configuration.
    pub fn load(mut self) -> Result<KeelConfig, ConfigError> {
        if let Some(prefix) = self.env_prefix.take() {
            self.apply_env_overrides(&prefix)?;
        }

        self.config.validate()?;

        Ok(self.config)
    }

    /// Return the configuration without environment overrides or
    /// validation.
    #[must_use]
    pub fn load_unvalidated(self) -> KeelConfig {
        self.config
    }

    fn apply_env_overrides(&mut self, prefix: &str) -> Result<(), ConfigError> {
        let env_vars: HashMap<String, String> = env::vars()
            .filter(|(k, _)| k.starts_with(prefix))
            .collect();

        for (key, value) in env_vars {
            self.apply_env_var(&key, &value, prefix)?;
        }

        Ok(())
    }

    fn apply_env_var(&mut self, key: &str, value: &str, prefix: &str) -> Result<(), ConfigError> {
        let Some(rest) = key.strip_prefix(prefix).and_then(|k| k.strip_prefix("__")) else {
            return Ok(());
        };

        let parts: Vec<&str> = rest.split("__").collect();
        let c = &mut self.config;

        match parts.as_slice() {
            ["LOGGING", "ENABLED"] => c.logging.enabled = parse_bool(key, value)?,
            ["LOGGING", "LEVEL"] => c.logging.level = value.to_lowercase(),
            ["LOGGING", "FORMAT"] => {
                c.logging.format = match value.to_lowercase().as_str() {
                    "json" => LogFormat::Json,
                    "pretty" => LogFormat::Pretty,
                    _ => {
                        return Err(ConfigError::env_parse_error(
                            key,
                            "expected 'json' or 'pretty'",
                        ))
                    }
                };
            }
            ["LOGGING", "INCLUDE_TARGET"] => c.logging.include_target = parse_bool(key, value)?,

            ["POOL", "SMALL_MAX_BYTES"] => c.pool.small_max_bytes = parse(key, value)?,
            ["POOL", "MEDIUM_MAX_BYTES"] => c.pool.medium_max_bytes = parse(key, value)?,
            ["POOL", "SERIALIZE_THRESHOLD_BYTES"] => {
                c.pool.serialize_threshold_bytes = parse(key, value)?;
            }
            ["POOL", "IDLE_FLOOR"] => c.pool.idle_floor = parse(key, value)?,

            ["MEMORY", "LIMIT_BYTES"] => c.memory.limit_bytes = parse(key, value)?,
            ["MEMORY", "MEDIUM_RATIO"] => c.memory.medium_ratio = parse(key, value)?,
            ["MEMORY", "HIGH_RATIO"] => c.memory.high_ratio = parse(key, value)?,
            ["MEMORY", "CRITICAL_RATIO"] => c.memory.critical_ratio = parse(key, value)?,
            ["MEMORY", "TREND_WINDOW"] => c.memory.trend_window = parse(key, value)?,
            ["MEMORY", "TREND_ESCALATION"] => c.memory.trend_escalation = parse(key, value)?,
            ["MEMORY", "STRATEGY"] => {
                c.memory.strategy = if value.is_empty() || value.eq_ignore_ascii_case("none") {
                    None
                } else {
                    Some(parse(key, value)?)
                };
            }

            ["MONITOR", "LATENCY_WINDOW"] => c.monitor.latency_window = parse(key, value)?,
            ["MONITOR", "ERROR_LOG_CAPACITY"] => c.monitor.error_log_capacity = parse(key, value)?,
            ["MONITOR", "MAX_CONCURRENCY"] => c.monitor.max_concurrency = parse(key, value)?,
            ["MONITOR", "GOVERNOR_INTERVAL_MS"] => {
                c.monitor.governor_interval_ms = parse(key, value)?;
            }
            ["MONITOR", "SAMPLE_EVERY_REQUESTS"] => {
                c.monitor.sample_every_requests = parse(key, value)?;
            }
            ["MONITOR", "AUTO_PROFILE"] => c.monitor.auto_profile = parse_bool(key, value)?,
            ["MONITOR", "HIGH_LOAD_RATIO"] => c.monitor.high_load_ratio = parse(key, value)?,
            ["MONITOR", "EXTREME_LOAD_RATIO"] => c.monitor.extreme_load_ratio = parse(key, value)?,

            ["PROFILE", "INITIAL"] => c.profile.initial = parse(key, value)?,
            ["PROFILE", "ENABLED"] => c.profile.enabled = parse_bool(key, value)?,

            ["CIRCUIT_BREAKER", "FAILURE_THRESHOLD"] => {
                c.circuit_breaker.failure_threshold = parse(key, value)?;
            }
            ["CIRCUIT_BREAKER", "SUCCESS_THRESHOLD"] => {
                c.circuit_breaker.success_threshold = parse(key, value)?;
            }
            ["CIRCUIT_BREAKER", "RECOVERY_TIMEOUT_SECS"] => {
                c.circuit_breaker.recovery_timeout_secs = parse(key, value)?;
            }
            ["CIRCUIT_BREAKER", "FAILURE_STATUS_MIN"] => {
                c.circuit_breaker.failure_status_min = parse(key, value)?;
            }
            ["CIRCUIT_BREAKER", "KEY_PREFIX"] => c.circuit_breaker.key_prefix = value.to_string(),

            ["RATE_LIMIT", "MAX_ATTEMPTS"] => c.rate_limit.max_attempts = parse(key, value)?,
            ["RATE_LIMIT", "DECAY_MINUTES"] => c.rate_limit.decay_minutes = parse(key, value)?,
            ["RATE_LIMIT", "BURST_MAX"] => c.rate_limit.burst_max = parse_optional(key, value)?,
            ["RATE_LIMIT", "BURST_WINDOW_SECS"] => {
                c.rate_limit.burst_window_secs = parse_optional(key, value)?;
            }
            ["RATE_LIMIT", "KEY_PREFIX"] => c.rate_limit.key_prefix = value.to_string(),
            ["RATE_LIMIT", "LIMIT_HEADER"] => c.rate_limit.limit_header = value.to_lowercase(),
            ["RATE_LIMIT", "REMAINING_HEADER"] => {
                c.rate_limit.remaining_header = value.to_lowercase();
            }
            ["RATE_LIMIT", "RESET_HEADER"] => c.rate_limit.reset_header = value.to_lowercase(),
            ["RATE_LIMIT", "RETRY_AFTER_HEADER"] => {
                c.rate_limit.retry_after_header = value.to_lowercase();
            }

            // Unknown keys are ignored so unrelated variables sharing the
            // prefix do not break startup.
            _ => {}
        }

        Ok(())
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| {
        ConfigError::env_parse_error(
            key,
            format!("expected {}", std::any::type_name::<T>().rsplit("::").next().unwrap_or("value")),
        )
    })
}

fn parse_optional<T: FromStr>(key: &str, value: &str) -> Result<Option<T>, ConfigError> {
    if value.is_empty() || value.eq_ignore_ascii_case("none") {
        Ok(None)
    } else {
        parse(key, value).map(Some)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::env_parse_error(key, "expected boolean")),
    }
}
