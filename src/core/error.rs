//! Error types for pool operations and task outcomes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::state::Lifecycle;

/// Errors returned synchronously by pool-management operations.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A worker could not be spawned (resource exhaustion, missing binary, ...).
    #[error("failed to start worker: {0}")]
    Startup(String),
    /// Dispatch or resize attempted while the pool is not running.
    #[error("pool is not running (state: {0})")]
    NotRunning(Lifecycle),
    /// The pending queue stayed full for the whole put timeout.
    #[error("task queue is full")]
    QueueFull,
    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A shrink would leave the pool without workers.
    #[error("cannot shrink pool of {size} workers by {requested}")]
    InvalidResize {
        /// Current target size.
        size: usize,
        /// Requested decrement.
        requested: usize,
    },
    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Errors delivered as a task's outcome rather than returned to the submitter.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskError {
    /// The target returned an application error.
    #[error("task failed: {0}")]
    Failed(String),
    /// The worker runtime has no target registered under this name.
    #[error("unknown task target: {0}")]
    UnknownTarget(String),
    /// The task observed its soft deadline and aborted.
    #[error("soft time limit exceeded")]
    SoftTimeLimitExceeded,
    /// The target panicked inside the worker.
    #[error("task panicked: {0}")]
    Panicked(String),
    /// The supervisor killed the worker after the hard deadline.
    #[error("hard time limit ({timeout_ms}ms) exceeded")]
    HardTimeout {
        /// Hard timeout that was enforced, in milliseconds.
        timeout_ms: u64,
    },
    /// The worker died mid-task for a reason other than a timeout.
    #[error("worker {pid} exited prematurely (exit code: {exit_code:?})")]
    WorkerLost {
        /// Pid of the lost worker.
        pid: u32,
        /// Exit code, if the process exited normally.
        exit_code: Option<i32>,
    },
    /// The pool was terminated before the task finished.
    #[error("pool terminated")]
    Terminated,
    /// The task was revoked with `terminate_job`.
    #[error("task revoked")]
    Revoked,
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_error_display() {
        assert_eq!(PoolError::QueueFull.to_string(), "task queue is full");
        assert_eq!(
            PoolError::NotRunning(Lifecycle::Terminated).to_string(),
            "pool is not running (state: TERMINATED)"
        );
        assert_eq!(
            PoolError::InvalidResize { size: 2, requested: 2 }.to_string(),
            "cannot shrink pool of 2 workers by 2"
        );
    }

    #[test]
    fn test_task_error_display() {
        assert_eq!(
            TaskError::HardTimeout { timeout_ms: 1000 }.to_string(),
            "hard time limit (1000ms) exceeded"
        );
        assert_eq!(
            TaskError::WorkerLost { pid: 42, exit_code: Some(3) }.to_string(),
            "worker 42 exited prematurely (exit code: Some(3))"
        );
    }

    #[test]
    fn test_task_error_wire_format() {
        let json = serde_json::to_string(&TaskError::Failed("boom".into())).unwrap();
        assert_eq!(json, r#"{"failed":"boom"}"#);
        let back: TaskError = serde_json::from_str(r#""soft_time_limit_exceeded""#).unwrap();
        assert_eq!(back, TaskError::SoftTimeLimitExceeded);
    }
}
