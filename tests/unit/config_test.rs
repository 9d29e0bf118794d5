//! Tests for configuration validation

use std::time::Duration;

use prometheus_task_pool::config::TaskPoolConfig;

#[test]
fn test_config_builder() {
    let config = TaskPoolConfig::new()
        .with_size(4)
        .with_soft_timeout(Duration::from_secs(5))
        .with_hard_timeout(Duration::from_secs(10))
        .with_max_tasks_per_child(100)
        .with_max_queue_depth(16);
    assert_eq!(config.size, 4);
    assert_eq!(config.max_tasks_per_child, Some(100));
    assert_eq!(config.max_queue_depth, 16);
    assert!(config.validate().is_ok());
}

#[test]
fn test_config_invalid_size() {
    assert!(TaskPoolConfig::new().with_size(0).validate().is_err());
}

#[test]
fn test_config_invalid_queue_depth() {
    assert!(TaskPoolConfig::new().with_max_queue_depth(0).validate().is_err());
}

#[test]
fn test_config_invalid_task_limit() {
    assert!(TaskPoolConfig::new().with_max_tasks_per_child(0).validate().is_err());
}

#[test]
fn test_config_invalid_tick() {
    assert!(TaskPoolConfig::new().with_supervisor_tick(Duration::ZERO).validate().is_err());
}

#[test]
fn test_config_from_json() {
    let json = r#"{
        "size": 3,
        "soft_timeout": 2.5,
        "hard_timeout": 5,
        "max_tasks_per_child": 50
    }"#;
    let config = TaskPoolConfig::from_json_str(json).unwrap();
    assert_eq!(config.size, 3);
    assert_eq!(config.soft_timeout, Some(Duration::from_millis(2500)));
    assert_eq!(config.hard_timeout, Some(Duration::from_secs(5)));
    assert_eq!(config.max_tasks_per_child, Some(50));
    assert_eq!(config.max_queue_depth, TaskPoolConfig::default().max_queue_depth);
}

#[test]
fn test_config_from_json_rejects_invalid() {
    assert!(TaskPoolConfig::from_json_str(r#"{"size": 0}"#).is_err());
    assert!(TaskPoolConfig::from_json_str(r#"{"hard_timeout": -1}"#).is_err());
    assert!(TaskPoolConfig::from_json_str("not json").unwrap_err().starts_with("parse error"));
}

#[test]
fn test_config_json_round_trip() {
    let config = TaskPoolConfig::new()
        .with_size(2)
        .with_hard_timeout(Duration::from_millis(1500));
    let json = serde_json::to_string(&config).unwrap();
    assert_eq!(TaskPoolConfig::from_json_str(&json).unwrap(), config);
}
