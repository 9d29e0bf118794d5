//! Tasks as the manager tracks them.

use std::fmt;
use std::time::{Duration, Instant};

use crate::worker::{Args, Kwargs, TaskId, TaskOutcome, TaskRequest};

/// Completion callback. Invoked exactly once, without any pool lock held.
pub type Callback = Box<dyn FnOnce(TaskOutcome) + Send + 'static>;

/// Per-call overrides for [`TaskPool::apply_async_with`](super::TaskPool::apply_async_with).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOptions {
    /// Soft timeout replacing the pool default.
    pub soft_timeout: Option<Duration>,
    /// Hard timeout replacing the pool default.
    pub hard_timeout: Option<Duration>,
}

impl ApplyOptions {
    /// No overrides.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            soft_timeout: None,
            hard_timeout: None,
        }
    }

    /// Override the soft timeout.
    #[must_use]
    pub const fn with_soft_timeout(mut self, timeout: Duration) -> Self {
        self.soft_timeout = Some(timeout);
        self
    }

    /// Override the hard timeout.
    #[must_use]
    pub const fn with_hard_timeout(mut self, timeout: Duration) -> Self {
        self.hard_timeout = Some(timeout);
        self
    }
}

/// A submitted unit of work. Timeouts are the effective ones: per-call
/// overrides already applied over the pool defaults.
#[derive(Clone)]
pub struct Task {
    /// Manager-assigned id.
    pub id: TaskId,
    /// Target name resolved by the worker.
    pub target: String,
    /// Positional arguments.
    pub args: Args,
    /// Keyword arguments.
    pub kwargs: Kwargs,
    /// When `apply_async` accepted the task. Only used to report queue
    /// wait; timeouts run from dispatch to a worker, not from here.
    pub submitted_at: Instant,
    /// Effective soft timeout.
    pub soft_timeout: Option<Duration>,
    /// Effective hard timeout.
    pub hard_timeout: Option<Duration>,
}

impl Task {
    /// Message sent to the worker that runs this task.
    #[must_use]
    pub fn request(&self) -> TaskRequest {
        TaskRequest {
            task_id: self.id,
            target: self.target.clone(),
            args: self.args.clone(),
            kwargs: self.kwargs.clone(),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("soft_timeout", &self.soft_timeout)
            .field("hard_timeout", &self.hard_timeout)
            .finish_non_exhaustive()
    }
}
