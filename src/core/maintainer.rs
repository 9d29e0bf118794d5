//! Maintainer loop: reaps exited workers and keeps the pool at its target size.
//!
//! Requests arrive from the result handler (worker exits) and from any code
//! that kills or retires a worker (reconcile). A periodic pass catches
//! anything those requests missed.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{select, Receiver};
use tracing::{debug, error, info, warn};

use super::error::{PoolError, TaskError};
use super::pool::Shared;
use super::state::{Lifecycle, PoolState, WorkerState};
use crate::worker::{ProcessBackend, WorkerHandle, WorkerId};

/// Work items for the maintainer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Maintenance {
    /// The backend reported a worker gone.
    WorkerExited {
        worker: WorkerId,
        code: Option<i32>,
    },
    /// Bring the pool back to its target size.
    Reconcile,
}

pub(crate) fn spawn<B: ProcessBackend>(
    shared: Arc<Shared<B>>,
    requests: Receiver<Maintenance>,
    stop: Receiver<()>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("taskpool-maintainer".into())
        .spawn(move || run(&shared, &requests, &stop))
}

fn run<B: ProcessBackend>(shared: &Shared<B>, requests: &Receiver<Maintenance>, stop: &Receiver<()>) {
    debug!("maintainer started");
    let interval = shared.config.maintain_interval;
    loop {
        select! {
            recv(requests) -> request => match request {
                Ok(Maintenance::WorkerExited { worker, code }) => worker_exited(shared, worker, code),
                Ok(Maintenance::Reconcile) => maintain(shared),
                Err(_) => break,
            },
            recv(stop) -> _ => break,
            default(interval) => maintain(shared),
        }
    }
    debug!("maintainer stopped");
}

fn maintain<B: ProcessBackend>(shared: &Shared<B>) {
    let mut state = shared.state.lock();
    if let Err(e) = reconcile(shared, &mut state) {
        error!(error = %e, "failed to replace workers");
    }
}

/// Remove an exited worker. A worker that was neither retiring nor killed by
/// the pool died unexpectedly; its task, if any, is lost.
fn worker_exited<B: ProcessBackend>(shared: &Shared<B>, worker: WorkerId, code: Option<i32>) {
    let (mut slot, lost) = {
        let mut state = shared.state.lock();
        let Some(mut slot) = state.workers.remove(&worker) else {
            debug!(%worker, ?code, "exit of untracked worker");
            return;
        };
        if slot.state() != WorkerState::Dead && !slot.retiring {
            warn!(%worker, pid = slot.pid, ?code, "worker exited prematurely");
        } else {
            debug!(%worker, pid = slot.pid, ?code, "worker exited");
        }
        slot.alive = false;
        let lost = slot.release().map(|in_flight| in_flight.task.id);

        if let Err(e) = reconcile(shared, &mut state) {
            error!(error = %e, "failed to replace exited worker");
        }
        shared.changed.notify_all();
        (slot, lost)
    };

    if let Some(task_id) = lost {
        shared.registry.resolve(
            task_id,
            Err(TaskError::WorkerLost {
                pid: slot.pid,
                exit_code: code,
            }),
        );
    }
    if !slot.handle.join(Duration::ZERO) {
        slot.handle.kill();
    }
}

/// Spawn replacements until the live count reaches the target, then hand
/// queued tasks to idle workers. Workers are only replaced while running, or
/// while closing with tasks still queued. Returns how many were spawned.
pub(crate) fn reconcile<B: ProcessBackend>(
    shared: &Shared<B>,
    state: &mut PoolState<B::Worker>,
) -> Result<usize, PoolError> {
    let wanted = match state.lifecycle {
        Lifecycle::Running => true,
        Lifecycle::Closing => !state.pending.is_empty(),
        Lifecycle::Init | Lifecycle::Terminated => false,
    };

    let mut spawned = 0;
    let mut outcome = Ok(());
    while wanted && state.live_count() < state.target_size {
        match shared.spawn_worker(state) {
            Ok(_) => spawned += 1,
            Err(e) => {
                outcome = Err(e);
                break;
            }
        }
    }
    state.pump();

    if spawned > 0 {
        info!(spawned, live = state.live_count(), target = state.target_size, "workers replaced");
        shared.changed.notify_all();
    }
    outcome.map(|()| spawned)
}
