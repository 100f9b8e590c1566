//! Configuration loading and validation tests
//!
//! Tests focus on BEHAVIOR of configuration loading, validation, and error handling.

use celery_worker::config::{ConfigError, WorkerConfig};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[broker]
url = "mqtt://broker.internal:1883"
queue = "media"
exchange = "production"
max_retries = 10
retry_delay_ms = 2500

[broker.options]
client_id = "worker-1"
topic_prefix = "jobs"

[worker]
drain_timeout_secs = 5
"#
    )
    .unwrap();

    let config = WorkerConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.broker.url, "mqtt://broker.internal:1883");
    assert_eq!(config.broker.queue, "media");
    assert_eq!(config.broker.exchange, "production");
    assert_eq!(config.broker.max_retries, 10);
    assert_eq!(config.broker.retry_delay(), Duration::from_millis(2500));
    assert_eq!(config.broker.options.client_id.as_deref(), Some("worker-1"));
    assert_eq!(config.broker.options.topic_prefix, "jobs");
    assert_eq!(config.drain_timeout(), Duration::from_secs(5));
}

#[test]
fn test_empty_file_uses_defaults() {
    let temp_file = NamedTempFile::new().unwrap();

    let config = WorkerConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config, WorkerConfig::default());
    assert_eq!(config.broker.max_retries, 600);
    assert_eq!(config.broker.retry_delay(), Duration::from_secs(60));
    assert_eq!(config.broker.queue, "celery");
}

#[test]
fn test_missing_file_is_read_error() {
    let result = WorkerConfig::load_from_file(std::path::Path::new("/nonexistent/worker.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_malformed_toml_is_parse_error() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "[broker\nurl = ").unwrap();

    let result = WorkerConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_unsupported_scheme_is_rejected() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[broker]
url = "http://localhost:8080"
"#
    )
    .unwrap();

    let result = WorkerConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::InvalidBrokerUrl(_))));
}

#[test]
fn test_zero_retries_is_rejected() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[broker]
max_retries = 0
"#
    )
    .unwrap();

    let result = WorkerConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_config_round_trips_through_toml() {
    let config = WorkerConfig::default();
    let rendered = toml::to_string_pretty(&config).unwrap();
    assert_eq!(WorkerConfig::from_toml_str(&rendered).unwrap(), config);
}
