//! Result correlation: one pending entry per task, resolved exactly once.
//!
//! Waiters block on a per-task `Condvar`; nothing polls. Resolution removes
//! the entry from the registry, so a second result for the same task is
//! detected and dropped.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use super::error::PoolError;
use super::task::Callback;
use crate::worker::{TaskId, TaskOutcome};

/// Result entry state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResultState {
    /// Waiting for the outcome.
    Pending,
    /// Outcome is available.
    Ready,
}

#[derive(Debug)]
struct PendingResult {
    state: ResultState,
    outcome: Option<TaskOutcome>,
    worker_pid: Option<u32>,
}

#[derive(Debug)]
struct ResultSlot {
    result: Mutex<PendingResult>,
    ready: Condvar,
}

struct Entry {
    slot: Arc<ResultSlot>,
    callback: Option<Callback>,
}

/// Handle to a submitted task's eventual outcome.
///
/// Cloning is cheap; every clone observes the same outcome.
#[derive(Debug, Clone)]
pub struct AsyncResult {
    task_id: TaskId,
    slot: Arc<ResultSlot>,
}

impl AsyncResult {
    /// Id the pool assigned to the task.
    #[must_use]
    pub const fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Whether the outcome is available.
    #[must_use]
    pub fn ready(&self) -> bool {
        self.slot.result.lock().state == ResultState::Ready
    }

    /// Whether a worker has acknowledged the task.
    #[must_use]
    pub fn accepted(&self) -> bool {
        self.slot.result.lock().worker_pid.is_some()
    }

    /// Pid of the worker that accepted the task.
    #[must_use]
    pub fn worker_pid(&self) -> Option<u32> {
        self.slot.result.lock().worker_pid
    }

    /// The outcome, if ready.
    #[must_use]
    pub fn get(&self) -> Option<TaskOutcome> {
        self.slot.result.lock().outcome.clone()
    }

    /// Block until the outcome is available or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Timeout`] if the task is still pending.
    pub fn wait(&self, timeout: Duration) -> Result<TaskOutcome, PoolError> {
        let deadline = Instant::now().checked_add(timeout);
        let mut result = self.slot.result.lock();
        while result.state == ResultState::Pending {
            match deadline {
                Some(deadline) => {
                    if self.slot.ready.wait_until(&mut result, deadline).timed_out() {
                        break;
                    }
                }
                None => self.slot.ready.wait(&mut result),
            }
        }
        result.outcome.clone().ok_or(PoolError::Timeout)
    }

    /// Async variant of [`wait`](Self::wait). The blocking wait runs on
    /// tokio's blocking thread pool.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Timeout`] if the task is still pending.
    #[cfg(feature = "tokio-runtime")]
    pub async fn wait_async(&self, timeout: Duration) -> Result<TaskOutcome, PoolError> {
        let waiter = self.clone();
        let blocking = tokio::task::spawn_blocking(move || waiter.wait(timeout));
        match tokio::time::timeout(timeout, blocking).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => Err(PoolError::Internal(format!("result waiter failed: {e}"))),
            Err(_) => self.get().ok_or(PoolError::Timeout),
        }
    }
}

/// Pending results keyed by task id.
#[derive(Default)]
pub struct ResultRegistry {
    entries: Mutex<HashMap<TaskId, Entry>>,
}

impl ResultRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the pending entry for `task_id`.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Internal`] if the id is already pending.
    pub fn register(&self, task_id: TaskId, callback: Option<Callback>) -> Result<AsyncResult, PoolError> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&task_id) {
            return Err(PoolError::Internal(format!("task {task_id} is already pending")));
        }
        let slot = Arc::new(ResultSlot {
            result: Mutex::new(PendingResult {
                state: ResultState::Pending,
                outcome: None,
                worker_pid: None,
            }),
            ready: Condvar::new(),
        });
        entries.insert(
            task_id,
            Entry {
                slot: Arc::clone(&slot),
                callback,
            },
        );
        Ok(AsyncResult { task_id, slot })
    }

    /// Record that worker `pid` picked the task up.
    pub fn mark_accepted(&self, task_id: TaskId, pid: u32) {
        let entries = self.entries.lock();
        match entries.get(&task_id) {
            Some(entry) => entry.slot.result.lock().worker_pid = Some(pid),
            None => debug!(task_id, pid, "acceptance for task that is no longer pending"),
        }
    }

    /// Resolve `task_id`: store the outcome, wake waiters and run the
    /// callback. Returns `false`, logging a warning, if the task is unknown
    /// or already resolved.
    ///
    /// Must be called without any pool lock held.
    pub fn resolve(&self, task_id: TaskId, outcome: TaskOutcome) -> bool {
        let Some(entry) = self.entries.lock().remove(&task_id) else {
            warn!(task_id, "dropping result for unknown or already resolved task");
            return false;
        };

        {
            let mut result = entry.slot.result.lock();
            result.state = ResultState::Ready;
            result.outcome = Some(outcome.clone());
        }
        entry.slot.ready.notify_all();

        if let Some(callback) = entry.callback {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(outcome))).is_err() {
                error!(task_id, "task callback panicked");
            }
        }
        true
    }

    /// Number of pending tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no task is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl std::fmt::Debug for ResultRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultRegistry").field("pending", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TaskError;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_resolve_wakes_waiter_and_runs_callback_once() {
        let registry = Arc::new(ResultRegistry::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let result = registry
            .register(1, Some(Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })))
            .unwrap();

        let resolver = Arc::clone(&registry);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            assert!(resolver.resolve(1, Ok(json!(2))));
        });

        assert_eq!(result.wait(Duration::from_secs(5)).unwrap(), Ok(json!(2)));
        handle.join().unwrap();
        assert!(result.ready());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // duplicate delivery is rejected
        assert!(!registry.resolve(1, Ok(json!(3))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.get(), Some(Ok(json!(2))));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_wait_times_out_while_pending() {
        let registry = ResultRegistry::new();
        let result = registry.register(1, None).unwrap();
        assert!(matches!(result.wait(Duration::from_millis(10)), Err(PoolError::Timeout)));
        assert!(!result.ready());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = ResultRegistry::new();
        registry.register(7, None).unwrap();
        assert!(matches!(registry.register(7, None), Err(PoolError::Internal(_))));
        assert!(registry.resolve(7, Ok(serde_json::Value::Null)));
        assert!(registry.register(7, None).is_ok());
    }

    #[test]
    fn test_mark_accepted_records_pid() {
        let registry = ResultRegistry::new();
        let result = registry.register(1, None).unwrap();
        assert!(!result.accepted());
        registry.mark_accepted(1, 4242);
        assert!(result.accepted());
        assert_eq!(result.worker_pid(), Some(4242));
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let registry = ResultRegistry::new();
        let result = registry
            .register(1, Some(Box::new(|_| panic!("callback exploded"))))
            .unwrap();
        assert!(registry.resolve(1, Err(TaskError::Terminated)));
        assert_eq!(result.get(), Some(Err(TaskError::Terminated)));
    }
}
