//! Messages exchanged between the manager and its workers.
//!
//! The manager never shares memory with a worker. Every interaction is one of
//! the messages below: [`Inbound`] travels manager → worker, [`Outbound`]
//! travels worker → manager. On the process backend each message is a single
//! JSON object per line.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::TaskError;

/// Manager-assigned task identifier.
pub type TaskId = u64;

/// Positional task arguments.
pub type Args = Vec<Value>;

/// Keyword task arguments.
pub type Kwargs = Map<String, Value>;

/// Result of one task: the target's return value or the reason it has none.
pub type TaskOutcome = Result<Value, TaskError>;

/// Manager-side identity of a worker slot. Stable across the worker's life;
/// pids are only meaningful to the backend that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// A unit of work as seen by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Correlation id echoed back in every [`Outbound`] message.
    pub task_id: TaskId,
    /// Name the worker runtime resolves to a callable.
    pub target: String,
    /// Positional arguments.
    #[serde(default)]
    pub args: Args,
    /// Keyword arguments.
    #[serde(default)]
    pub kwargs: Kwargs,
}

/// Manager → worker messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    /// Execute a task.
    Run(TaskRequest),
    /// Ask the running task to abort cooperatively.
    SoftTimeout {
        /// Task the signal is meant for; ignored if it is no longer running.
        task_id: TaskId,
    },
    /// Finish the current task (if any) and exit.
    Shutdown,
}

/// Worker → manager messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    /// The worker picked the task up.
    Accepted {
        /// Accepted task.
        task_id: TaskId,
        /// Pid of the executing worker.
        pid: u32,
    },
    /// The task finished, successfully or not.
    Finished {
        /// Finished task.
        task_id: TaskId,
        /// Return value or error.
        outcome: TaskOutcome,
    },
}

/// Events the backends feed into the manager's shared outbound queue.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// A worker accepted a task.
    Accepted {
        /// Reporting worker.
        worker: WorkerId,
        /// Accepted task.
        task_id: TaskId,
    },
    /// A worker produced a result.
    Finished {
        /// Reporting worker.
        worker: WorkerId,
        /// Finished task.
        task_id: TaskId,
        /// Return value or error.
        outcome: TaskOutcome,
    },
    /// A worker is gone. Reported exactly once per worker.
    Exited {
        /// Exited worker.
        worker: WorkerId,
        /// Exit code; `None` when killed by a signal or unknown.
        code: Option<i32>,
    },
}

impl WorkerEvent {
    /// Tag a worker message with the worker it came from.
    #[must_use]
    pub fn from_outbound(worker: WorkerId, message: Outbound) -> Self {
        match message {
            Outbound::Accepted { task_id, .. } => Self::Accepted { worker, task_id },
            Outbound::Finished { task_id, outcome } => Self::Finished {
                worker,
                task_id,
                outcome,
            },
        }
    }

    /// Worker the event refers to.
    #[must_use]
    pub const fn worker(&self) -> WorkerId {
        match self {
            Self::Accepted { worker, .. }
            | Self::Finished { worker, .. }
            | Self::Exited { worker, .. } => *worker,
        }
    }
}
