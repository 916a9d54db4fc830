use std::env;
use std::fs;

use serial_test::serial;
use soulbridge_cli::config::{DEFAULT_TIMEOUT_ENV, MAX_IN_FLIGHT_ENV};
use soulbridge_cli::load_config;
use tempfile::tempdir;

#[tokio::test]
#[serial]
async fn loads_yaml_from_explicit_path() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bridge.yaml");
    let yaml = "\
bind: 127.0.0.1:8800
metrics_port: 0
log_json: true
bridge:
  default_timeout_ms: 5000
  heartbeat_interval_ms: 0
";
    fs::write(&path, yaml).unwrap();

    let loaded = load_config(Some(path.as_path())).await.unwrap();
    assert!(loaded.from_file);
    assert_eq!(loaded.path, path);
    assert_eq!(loaded.config.bind.port(), 8800);
    assert_eq!(loaded.config.metrics_port, 0);
    assert!(loaded.config.log_json);
    assert_eq!(loaded.config.bridge.default_timeout_ms, 5000);
    assert_eq!(loaded.config.bridge.heartbeat_interval_ms, 0);
    assert_eq!(loaded.config.bridge.max_in_flight_per_tenant, 64);
}

#[tokio::test]
#[serial]
async fn missing_file_falls_back_to_defaults() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("absent.yaml");

    let loaded = load_config(Some(path.as_path())).await.unwrap();
    assert!(!loaded.from_file);
    assert_eq!(loaded.config, soulbridge_cli::Config::default());
}

#[tokio::test]
#[serial]
async fn environment_overrides_file_values() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bridge.yaml");
    fs::write(&path, "bridge:\n  max_in_flight_per_tenant: 8\n").unwrap();

    env::set_var(MAX_IN_FLIGHT_ENV, "2");
    env::set_var(DEFAULT_TIMEOUT_ENV, "1200");
    let loaded = load_config(Some(path.as_path())).await;
    env::remove_var(MAX_IN_FLIGHT_ENV);
    env::remove_var(DEFAULT_TIMEOUT_ENV);

    let config = loaded.unwrap().config;
    assert_eq!(config.bridge.max_in_flight_per_tenant, 2);
    assert_eq!(config.bridge.default_timeout_ms, 1200);
}

#[tokio::test]
#[serial]
async fn invalid_yaml_is_an_error() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bridge.yaml");
    fs::write(&path, "bind: [not, an, address]\n").unwrap();

    let err = load_config(Some(path.as_path())).await.err().unwrap();
    assert!(err.to_string().contains("Failed to parse config file"));
}

#[tokio::test]
#[serial]
async fn inconsistent_bridge_settings_are_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bridge.yaml");
    fs::write(
        &path,
        "bridge:\n  heartbeat_interval_ms: 10000\n  idle_timeout_ms: 5000\n",
    )
    .unwrap();

    assert!(load_config(Some(path.as_path())).await.is_err());
}
