use logship::config::{generate::generate_starter_config, load_config, ConfigError};
use logship::destination::{ArchiveSettings, LogDestinationSettings};
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_generated_config_is_valid() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yml");

    fs::write(&config_path, generate_starter_config()).unwrap();

    let config = load_config(&config_path).expect("Generated config should be valid");
    assert_eq!(config.destinations.len(), 1);
    assert!(config.destinations.contains_key("app"));
    assert!(config.archives.is_empty());
}

#[test]
fn test_full_config_maps_to_runtime_settings() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yml");

    let config_yaml = r#"
destinations:
  audit:
    endpoint: https://logs.example.com
    group: audit/events
    stream: node-1
    store_path: /var/lib/logship/audit.duckdb
    send_interval_seconds: 15
    max_batch_size_bytes: 4096
    max_batch_count: 50
    retention_days: 30
    create_group_if_missing: false

archives:
  access:
    path: /var/log/nginx/access.log
    endpoint: http://minio:9000
    bucket: access-logs
    key_pattern: "nginx/@%Y/%m/%d@/access-@%H%M%S@.log"
    max_file_size_bytes: 1048576
    rotation_check_interval_seconds: 60
    max_file_age_seconds: 3600
"#;
    fs::write(&config_path, config_yaml).unwrap();

    let config = load_config(&config_path).unwrap();

    let destination = LogDestinationSettings::from_config(&config.destinations["audit"]);
    assert_eq!(destination.engine.send_interval, Duration::from_secs(15));
    assert_eq!(destination.engine.limits.max_size, 4096);
    assert_eq!(destination.engine.limits.max_count, 50);
    assert_eq!(destination.controller.target.group, "audit/events");
    assert_eq!(destination.controller.target.stream, "node-1");
    assert_eq!(destination.controller.retention_days, 30);
    assert!(!destination.controller.create_group_if_missing);
    assert!(destination.controller.create_stream_if_missing);

    let archive = ArchiveSettings::from_config(&config.archives["access"]);
    assert_eq!(archive.policy.max_file_size_bytes, 1_048_576);
    assert_eq!(archive.policy.rotation_check_interval, Duration::from_secs(60));
    assert_eq!(archive.policy.max_file_age, Duration::from_secs(3600));
}

#[test]
fn test_unsupported_retention_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yml");

    let config_yaml = r#"
destinations:
  app:
    endpoint: https://logs.example.com
    group: app
    store_path: /tmp/app.duckdb
    retention_days: 42
"#;
    fs::write(&config_path, config_yaml).unwrap();

    let err = load_config(&config_path).unwrap_err();
    assert!(matches!(err, ConfigError::YamlParse(_)));
    assert!(err.to_string().contains("retention_days"));
}

#[test]
fn test_shared_archive_path_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yml");

    let config_yaml = r#"
archives:
  first:
    path: /var/log/app.log
    endpoint: http://minio:9000
    bucket: a
  second:
    path: /var/log/app.log
    endpoint: http://minio:9000
    bucket: b
"#;
    fs::write(&config_path, config_yaml).unwrap();

    match load_config(&config_path) {
        Err(ConfigError::ValidationList(errors)) => {
            assert_eq!(errors.len(), 1);
            assert!(errors[0].contains("already used by archive 'first'"));
        }
        other => panic!("expected validation error, got {:?}", other),
    }
}

#[test]
fn test_env_var_in_endpoint() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yml");

    std::env::set_var("LOGSHIP_IT_ENDPOINT", "https://logs.internal");
    let config_yaml = r#"
destinations:
  app:
    endpoint: $env{LOGSHIP_IT_ENDPOINT}
    group: app
    store_path: /tmp/app.duckdb
"#;
    fs::write(&config_path, config_yaml).unwrap();

    let config = load_config(&config_path).unwrap();
    assert_eq!(config.destinations["app"].endpoint, "https://logs.internal");
    std::env::remove_var("LOGSHIP_IT_ENDPOINT");
}
