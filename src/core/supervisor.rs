//! Timeout supervisor.
//!
//! Every tick, each in-flight task is classified by the time elapsed since it
//! was dispatched. Soft expiry asks the task to abort (once). Hard expiry
//! kills the worker and fails the task.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::error::TaskError;
use super::pool::Shared;
use crate::util::duration_ms;
use crate::worker::{Inbound, ProcessBackend, TaskId, WorkerHandle, WorkerId};

/// Timeout state of one in-flight task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeoutState {
    /// Within all limits.
    Running,
    /// Past the soft limit.
    SoftExpired,
    /// Past the hard limit.
    HardExpired,
}

/// Classify a task that has been running for `elapsed`. The hard limit wins
/// when both have passed.
#[must_use]
pub fn classify(elapsed: Duration, soft: Option<Duration>, hard: Option<Duration>) -> TimeoutState {
    if hard.is_some_and(|limit| elapsed >= limit) {
        TimeoutState::HardExpired
    } else if soft.is_some_and(|limit| elapsed >= limit) {
        TimeoutState::SoftExpired
    } else {
        TimeoutState::Running
    }
}

pub(crate) fn spawn<B: ProcessBackend>(shared: Arc<Shared<B>>, stop: Receiver<()>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("taskpool-supervisor".into())
        .spawn(move || run(&shared, &stop))
}

fn run<B: ProcessBackend>(shared: &Shared<B>, stop: &Receiver<()>) {
    debug!(tick_ms = duration_ms(shared.config.supervisor_tick), "timeout supervisor started");
    loop {
        match stop.recv_timeout(shared.config.supervisor_tick) {
            Err(RecvTimeoutError::Timeout) => check(shared, Instant::now()),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("timeout supervisor stopped");
}

/// One supervisor pass.
fn check<B: ProcessBackend>(shared: &Shared<B>, now: Instant) {
    let mut expired: Vec<(TaskId, u64)> = Vec::new();
    {
        let mut state = shared.state.lock();
        let due: Vec<(WorkerId, TimeoutState)> = state
            .workers
            .values()
            .filter(|w| w.alive)
            .filter_map(|w| {
                let in_flight = w.current.as_ref()?;
                let elapsed = now.saturating_duration_since(in_flight.dispatched_at);
                match classify(elapsed, in_flight.task.soft_timeout, in_flight.task.hard_timeout) {
                    TimeoutState::Running => None,
                    TimeoutState::SoftExpired if in_flight.soft_signalled => None,
                    expiry => Some((w.id, expiry)),
                }
            })
            .collect();
        if due.is_empty() {
            return;
        }

        for (worker, timeout) in due {
            let Some(slot) = state.workers.get_mut(&worker) else {
                continue;
            };
            match timeout {
                TimeoutState::SoftExpired => {
                    let Some(in_flight) = slot.current.as_mut() else {
                        continue;
                    };
                    in_flight.soft_signalled = true;
                    let task_id = in_flight.task.id;
                    match slot.handle.send(&Inbound::SoftTimeout { task_id }) {
                        Ok(()) => info!(%worker, pid = slot.pid, task_id, "soft time limit exceeded"),
                        Err(e) => warn!(%worker, pid = slot.pid, task_id, error = %e, "failed to signal soft timeout"),
                    }
                }
                TimeoutState::HardExpired => {
                    let Some(in_flight) = slot.release() else {
                        continue;
                    };
                    let timeout_ms = in_flight.task.hard_timeout.map_or(0, duration_ms);
                    warn!(%worker, pid = slot.pid, task_id = in_flight.task.id, timeout_ms, "hard time limit exceeded, killing worker");
                    slot.kill();
                    expired.push((in_flight.task.id, timeout_ms));
                }
                TimeoutState::Running => {}
            }
        }

        if !expired.is_empty() {
            state.request_reconcile();
            shared.changed.notify_all();
        }
    }

    for (task_id, timeout_ms) in expired {
        shared.registry.resolve(task_id, Err(TaskError::HardTimeout { timeout_ms }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const fn secs(n: u64) -> Option<Duration> {
        Some(Duration::from_secs(n))
    }

    #[test]
    fn test_classify_without_limits_never_expires() {
        assert_eq!(classify(Duration::from_secs(3600), None, None), TimeoutState::Running);
    }

    #[test]
    fn test_classify_soft_then_hard() {
        assert_eq!(classify(Duration::from_secs(1), secs(2), secs(4)), TimeoutState::Running);
        assert_eq!(classify(Duration::from_secs(2), secs(2), secs(4)), TimeoutState::SoftExpired);
        assert_eq!(classify(Duration::from_secs(5), secs(2), secs(4)), TimeoutState::HardExpired);
    }

    #[test]
    fn test_classify_hard_only() {
        assert_eq!(classify(Duration::from_secs(3), None, secs(4)), TimeoutState::Running);
        assert_eq!(classify(Duration::from_secs(4), None, secs(4)), TimeoutState::HardExpired);
    }
}
