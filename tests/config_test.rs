use run_gate::config::*;
use run_gate::error::GateError;

// --- Defaults ---

#[test]
fn defaults_are_valid() {
    let config = GateConfig::default();
    assert_eq!(config.queue.batch_length, 20);
    assert_eq!(config.queue.workers, 1);
    assert_eq!(config.queue.retry_delay_ms, 1000);
    assert_eq!(config.coordinator.channel_capacity, 32);
    assert_eq!(config.limits.max_name_len, 255);
    assert_eq!(config.log.level, "info");
    assert!(validate(&config).is_ok());
}

#[test]
fn missing_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = load_config(&dir.path().join("run-gate.toml")).unwrap();
    assert_eq!(config, GateConfig::default());
}

// --- Parsing ---

#[test]
fn partial_file_keeps_other_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run-gate.toml");
    std::fs::write(
        &path,
        r#"
[queue]
workers = 4
retry_delay_ms = 250

[log]
level = "debug"
"#,
    )
    .unwrap();

    let config = load_config(&path).unwrap();
    assert_eq!(config.queue.workers, 4);
    assert_eq!(config.queue.retry_delay().as_millis(), 250);
    assert_eq!(config.queue.batch_length, 20);
    assert_eq!(config.log.level, "debug");
    assert_eq!(config.limits, LimitsConfig::default());
}

#[test]
fn malformed_toml_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run-gate.toml");
    std::fs::write(&path, "[queue\nworkers = 2").unwrap();

    let err = load_config(&path).unwrap_err();
    assert!(matches!(err, GateError::Config(ref msg) if msg.contains("Failed to parse")));
}

#[test]
fn wrong_value_type_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run-gate.toml");
    std::fs::write(&path, "[queue]\nworkers = \"many\"\n").unwrap();

    assert!(matches!(load_config(&path), Err(GateError::Config(_))));
}

// --- Validation ---

#[test]
fn validate_collects_every_problem() {
    let mut config = GateConfig::default();
    config.queue.batch_length = 0;
    config.queue.workers = 0;
    config.coordinator.channel_capacity = 0;
    config.limits.max_name_len = 2;
    config.log.level = "loud".to_string();

    let errors = validate(&config).unwrap_err();
    assert_eq!(errors.len(), 5);
    assert!(errors.iter().any(|e| e.contains("queue.batch_length")));
    assert!(errors.iter().any(|e| e.contains("queue.workers")));
    assert!(errors.iter().any(|e| e.contains("coordinator.channel_capacity")));
    assert!(errors.iter().any(|e| e.contains("limits.max_name_len")));
    assert!(errors.iter().any(|e| e.starts_with("log.level")));
}

#[test]
fn invalid_file_reports_validation_failures() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run-gate.toml");
    std::fs::write(&path, "[queue]\nworkers = 0\n").unwrap();

    let err = load_config(&path).unwrap_err().to_string();
    assert!(err.contains("Config validation failed"));
    assert!(err.contains("queue.workers must be >= 1"));
}
