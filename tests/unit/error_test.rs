//! Tests for error types

use prometheus_task_pool::core::{Lifecycle, PoolError, TaskError};

#[test]
fn test_not_running_error() {
    let err = PoolError::NotRunning(Lifecycle::Closing);
    assert_eq!(format!("{err}"), "pool is not running (state: CLOSING)");
}

#[test]
fn test_startup_error() {
    let err = PoolError::Startup("no such file".to_string());
    assert_eq!(format!("{err}"), "failed to start worker: no such file");
}

#[test]
fn test_invalid_config_error() {
    let err = PoolError::InvalidConfig("size must be greater than 0".to_string());
    assert_eq!(format!("{err}"), "invalid configuration: size must be greater than 0");
}

#[test]
fn test_task_errors_are_comparable() {
    assert_eq!(TaskError::Terminated, TaskError::Terminated.clone());
    assert_ne!(TaskError::Terminated, TaskError::Revoked);
    assert_eq!(format!("{}", TaskError::Revoked), "task revoked");
    assert_eq!(
        format!("{}", TaskError::UnknownTarget("x".into())),
        "unknown task target: x"
    );
}

#[test]
fn test_task_error_round_trips_through_json() {
    let err = TaskError::WorkerLost { pid: 7, exit_code: None };
    let json = serde_json::to_string(&err).unwrap();
    assert_eq!(json, r#"{"worker_lost":{"pid":7,"exit_code":null}}"#);
}
