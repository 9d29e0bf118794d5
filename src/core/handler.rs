//! Result handler loop.
//!
//! Drains the event queue all workers report into. A finished task frees its
//! worker first; the result is resolved and the callback invoked only after
//! the state lock is released.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{select, Receiver, Sender};
use tracing::{debug, info, warn};

use super::maintainer::Maintenance;
use super::pool::Shared;
use crate::worker::{ProcessBackend, TaskId, TaskOutcome, WorkerEvent, WorkerId};

pub(crate) fn spawn<B: ProcessBackend>(
    shared: Arc<Shared<B>>,
    events: Receiver<WorkerEvent>,
    maintenance: Sender<Maintenance>,
    stop: Receiver<()>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("taskpool-results".into())
        .spawn(move || run(&shared, &events, &maintenance, &stop))
}

fn run<B: ProcessBackend>(
    shared: &Shared<B>,
    events: &Receiver<WorkerEvent>,
    maintenance: &Sender<Maintenance>,
    stop: &Receiver<()>,
) {
    debug!("result handler started");
    loop {
        select! {
            recv(events) -> event => match event {
                Ok(event) => handle_event(shared, maintenance, event),
                Err(_) => break,
            },
            recv(stop) -> _ => break,
        }
    }
    debug!("result handler stopped");
}

fn handle_event<B: ProcessBackend>(shared: &Shared<B>, maintenance: &Sender<Maintenance>, event: WorkerEvent) {
    match event {
        WorkerEvent::Accepted { worker, task_id } => {
            let pid = shared.state.lock().workers.get(&worker).map(|w| w.pid);
            match pid {
                Some(pid) => shared.registry.mark_accepted(task_id, pid),
                None => debug!(%worker, task_id, "acceptance from untracked worker"),
            }
        }
        WorkerEvent::Finished {
            worker,
            task_id,
            outcome,
        } => finished(shared, worker, task_id, outcome),
        WorkerEvent::Exited { worker, code } => {
            if maintenance.send(Maintenance::WorkerExited { worker, code }).is_err() {
                debug!(%worker, "maintainer gone, exit not forwarded");
            }
        }
    }
}

fn finished<B: ProcessBackend>(shared: &Shared<B>, worker: WorkerId, task_id: TaskId, outcome: TaskOutcome) {
    {
        let mut state = shared.state.lock();
        let Some(slot) = state.workers.get_mut(&worker) else {
            warn!(%worker, task_id, "dropping result from untracked worker");
            return;
        };
        let holds_task = slot
            .current
            .as_ref()
            .is_some_and(|in_flight| in_flight.task.id == task_id);
        if !slot.alive || !holds_task {
            warn!(%worker, task_id, "dropping result that does not match the worker's current task");
            return;
        }

        slot.release();
        slot.tasks_completed += 1;
        let exhausted = shared
            .config
            .max_tasks_per_child
            .is_some_and(|limit| slot.tasks_completed >= limit);

        if slot.retiring {
            slot.request_shutdown();
        } else if exhausted {
            info!(%worker, pid = slot.pid, tasks = slot.tasks_completed, "worker reached its task limit, recycling");
            slot.retire();
            state.request_reconcile();
        }

        state.pump();
        shared.changed.notify_all();
    }

    shared.registry.resolve(task_id, outcome);
}
