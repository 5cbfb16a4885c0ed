//! Loading configuration files from disk.

use std::io::Write;

use keel_config::{ConfigError, ConfigLoader, LogFormat};
use keel_core::PerformanceProfile;

fn write_temp(suffix: &str, content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("create temp file");
    file.write_all(content.as_bytes()).expect("write temp file");
    file
}

#[test]
fn loads_toml_file() {
    let file = write_temp(
        ".toml",
        r#"
            [logging]
            format = "pretty"

            [profile]
            initial = "high"

            [rate_limit]
            max_attempts = 3
            burst_max = 2
            burst_window_secs = 5
        "#,
    );

    let config = ConfigLoader::new().with_file(file.path()).unwrap().load().unwrap();

    assert_eq!(config.logging.format, LogFormat::Pretty);
    assert_eq!(config.profile.initial, PerformanceProfile::High);
    assert_eq!(config.rate_limit.max_attempts, 3);
    assert_eq!(config.rate_limit.burst_max, Some(2));
    assert_eq!(config.circuit_breaker.failure_threshold, 5);
}

#[test]
fn loads_json_file() {
    let file = write_temp(".json", r#"{"pool": {"serialize_threshold_bytes": 1024}}"#);

    let config = ConfigLoader::new().with_file(file.path()).unwrap().load().unwrap();

    assert_eq!(config.pool.serialize_threshold_bytes, 1024);
}

#[test]
fn rejects_unknown_extension() {
    let file = write_temp(".ini", "x=1");

    let result = ConfigLoader::new().with_file(file.path());

    assert!(matches!(result, Err(ConfigError::UnsupportedFormat(_))));
}

#[test]
fn rejects_malformed_toml() {
    let file = write_temp(".toml", "[pool\nidle_floor = ");

    let result = ConfigLoader::new().with_file(file.path());

    assert!(matches!(result, Err(ConfigError::TomlError(_))));
}
