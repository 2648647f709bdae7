use std::io::Write;

use conductor::{ConductorError, EngineConfig};

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
max_retries = 5
default_timeout_secs = 60
max_output_chars = 4000
truncation_suffix_chars = 500
max_recursion_depth = 3
max_concurrency = 2
initial_backoff_ms = 250
max_backoff_ms = 4000

[log]
enabled = true
log_dir = "/tmp/conductor-logs"
level = 3
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = EngineConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.max_retries, 5);
    assert_eq!(config.default_timeout_secs, 60);
    assert_eq!(config.max_output_chars, 4000);
    assert_eq!(config.truncation_suffix_chars, 500);
    assert_eq!(config.max_recursion_depth, 3);
    assert_eq!(config.max_concurrency, 2);
    assert_eq!(config.initial_backoff_ms, 250);
    assert_eq!(config.max_backoff_ms, 4000);

    let log = config.log.expect("log section");
    assert!(log.enabled);
    assert_eq!(log.level, 3);
    assert_eq!(log.log_dir().to_str(), Some("/tmp/conductor-logs"));
}

#[test]
fn test_partial_config_keeps_defaults() {
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(b"max_retries = 1\n").unwrap();

    let config = EngineConfig::load(tmp.path()).unwrap();

    assert_eq!(config.max_retries, 1);
    assert_eq!(config.default_timeout_secs, 300);
    assert_eq!(config.max_concurrency, 8);
    assert!(config.log.is_none());
}

#[test]
fn test_env_var_expansion_in_file() {
    std::env::set_var("CONDUCTOR_TEST_LOG_DIR", "/var/log/conductor");
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(b"[log]\nlog_dir = \"${CONDUCTOR_TEST_LOG_DIR}\"\n")
        .unwrap();

    let config = EngineConfig::load(tmp.path()).unwrap();
    std::env::remove_var("CONDUCTOR_TEST_LOG_DIR");

    assert_eq!(config.log.unwrap().log_dir, "/var/log/conductor");
}

#[test]
fn test_invalid_toml_is_a_config_error() {
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(b"max_retries = \"many\"\n").unwrap();

    let err = EngineConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, ConductorError::Config(_)));
}

#[test]
fn test_home_relative_log_dir() {
    let config = EngineConfig::from_toml_str("[log]\nlog_dir = \"~/conductor/logs\"\n").unwrap();
    let dir = config.log.unwrap().log_dir();
    if std::env::var("HOME").is_ok() {
        assert!(dir.ends_with("conductor/logs"));
        assert!(!dir.starts_with("~"));
    }
}
