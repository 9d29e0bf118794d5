//! Mutable pool state guarded by the pool's single state lock.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::ops::Bound;
use std::time::Instant;

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::maintainer::Maintenance;
use super::task::Task;
use crate::util::duration_ms;
use crate::worker::{Inbound, TaskId, WorkerEvent, WorkerHandle, WorkerId};

/// Pool lifecycle. Moves forward only, except `Closing -> Running` through
/// [`TaskPool::start`](super::TaskPool::start).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Lifecycle {
    /// Created, never started.
    Init,
    /// Accepting tasks.
    Running,
    /// Draining; new tasks are rejected.
    Closing,
    /// All workers killed. Final.
    Terminated,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Init => "INIT",
            Self::Running => "RUNNING",
            Self::Closing => "CLOSING",
            Self::Terminated => "TERMINATED",
        })
    }
}

/// Observable state of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    /// Waiting for work.
    Idle,
    /// Executing a task.
    Busy,
    /// Exited or killed; waiting to be reaped.
    Dead,
}

/// Task currently held by a worker.
#[derive(Debug)]
pub(crate) struct InFlight {
    pub task: Task,
    pub dispatched_at: Instant,
    pub soft_signalled: bool,
}

/// Manager-side record of one worker.
#[derive(Debug)]
pub(crate) struct WorkerSlot<H> {
    pub id: WorkerId,
    pub pid: u32,
    pub handle: H,
    pub alive: bool,
    pub current: Option<InFlight>,
    /// Shut down once idle and not replaced.
    pub retiring: bool,
    pub tasks_completed: u64,
}

impl<H: WorkerHandle> WorkerSlot<H> {
    pub fn new(id: WorkerId, handle: H) -> Self {
        Self {
            id,
            pid: handle.pid(),
            handle,
            alive: true,
            current: None,
            retiring: false,
            tasks_completed: 0,
        }
    }

    /// Busy iff a task is held, so the two can never disagree.
    pub const fn state(&self) -> WorkerState {
        if !self.alive {
            WorkerState::Dead
        } else if self.current.is_some() {
            WorkerState::Busy
        } else {
            WorkerState::Idle
        }
    }

    /// Counts towards the pool size.
    pub const fn is_live(&self) -> bool {
        self.alive && !self.retiring
    }

    pub const fn is_dispatchable(&self) -> bool {
        self.is_live() && self.current.is_none()
    }

    /// Hand `task` to the worker. On a write failure the worker is killed and
    /// the task is given back.
    pub fn assign(&mut self, task: Task) -> Result<(), Task> {
        match self.handle.send(&Inbound::Run(task.request())) {
            Ok(()) => {
                let queued_ms = duration_ms(task.submitted_at.elapsed());
                debug!(worker = %self.id, pid = self.pid, task_id = task.id, queued_ms, "task dispatched");
                self.current = Some(InFlight {
                    task,
                    dispatched_at: Instant::now(),
                    soft_signalled: false,
                });
                Ok(())
            }
            Err(e) => {
                warn!(worker = %self.id, pid = self.pid, error = %e, "failed to dispatch task, killing worker");
                self.kill();
                Err(task)
            }
        }
    }

    pub fn release(&mut self) -> Option<InFlight> {
        self.current.take()
    }

    /// Stop handing work to this worker; it exits after its current task.
    pub fn retire(&mut self) {
        self.retiring = true;
        if self.current.is_none() {
            self.request_shutdown();
        }
    }

    pub fn request_shutdown(&mut self) {
        if let Err(e) = self.handle.send(&Inbound::Shutdown) {
            debug!(worker = %self.id, pid = self.pid, error = %e, "shutdown not delivered, killing worker");
            self.kill();
        }
    }

    pub fn kill(&mut self) {
        self.alive = false;
        self.handle.kill();
    }
}

/// Everything the pool mutates, behind one lock.
#[derive(Debug)]
pub(crate) struct PoolState<H> {
    pub lifecycle: Lifecycle,
    pub target_size: usize,
    pub workers: BTreeMap<WorkerId, WorkerSlot<H>>,
    pub pending: VecDeque<Task>,
    /// Shared outbound queue handed to every spawned worker. `None` when the
    /// pool is not running its loops.
    pub events: Option<Sender<WorkerEvent>>,
    pub maintenance: Option<Sender<Maintenance>>,
    cursor: Option<WorkerId>,
    next_task_id: TaskId,
    next_worker_id: u64,
}

impl<H: WorkerHandle> PoolState<H> {
    pub const fn new(target_size: usize) -> Self {
        Self {
            lifecycle: Lifecycle::Init,
            target_size,
            workers: BTreeMap::new(),
            pending: VecDeque::new(),
            events: None,
            maintenance: None,
            cursor: None,
            next_task_id: 1,
            next_worker_id: 1,
        }
    }

    pub fn next_task_id(&mut self) -> TaskId {
        let id = self.next_task_id;
        self.next_task_id += 1;
        id
    }

    pub fn next_worker_id(&mut self) -> WorkerId {
        let id = WorkerId(self.next_worker_id);
        self.next_worker_id += 1;
        id
    }

    pub fn live_count(&self) -> usize {
        self.workers.values().filter(|w| w.is_live()).count()
    }

    pub fn in_flight(&self) -> usize {
        self.workers.values().filter(|w| w.current.is_some()).count()
    }

    pub fn is_drained(&self) -> bool {
        self.pending.is_empty() && self.in_flight() == 0
    }

    pub fn live_pids(&self) -> Vec<u32> {
        self.workers
            .values()
            .filter(|w| w.is_live())
            .map(|w| w.pid)
            .collect()
    }

    /// Worker holding `task_id`, if it is in flight.
    pub fn holder_of(&self, task_id: TaskId) -> Option<WorkerId> {
        self.workers
            .values()
            .find(|w| w.current.as_ref().is_some_and(|f| f.task.id == task_id))
            .map(|w| w.id)
    }

    /// Next idle worker after the round-robin cursor, wrapping around.
    fn next_dispatchable(&self) -> Option<WorkerId> {
        let after = self.cursor.map_or(Bound::Unbounded, Bound::Excluded);
        self.workers
            .range((after, Bound::Unbounded))
            .chain(self.workers.iter())
            .find(|(_, w)| w.is_dispatchable())
            .map(|(id, _)| *id)
    }

    pub fn has_dispatchable(&self) -> bool {
        self.workers.values().any(WorkerSlot::is_dispatchable)
    }

    /// Send `task` to an idle worker. Gives the task back when none is idle.
    pub fn dispatch(&mut self, mut task: Task) -> Option<Task> {
        while let Some(id) = self.next_dispatchable() {
            self.cursor = Some(id);
            let Some(slot) = self.workers.get_mut(&id) else {
                break;
            };
            match slot.assign(task) {
                Ok(()) => return None,
                Err(returned) => {
                    task = returned;
                    self.request_reconcile();
                }
            }
        }
        Some(task)
    }

    /// Move queued tasks onto idle workers, oldest first.
    pub fn pump(&mut self) {
        while self.has_dispatchable() {
            let Some(task) = self.pending.pop_front() else {
                return;
            };
            if let Some(task) = self.dispatch(task) {
                self.pending.push_front(task);
                return;
            }
        }
    }

    /// Ask the maintainer to bring the pool back to its target size.
    pub fn request_reconcile(&self) {
        if let Some(maintenance) = &self.maintenance {
            let _ = maintenance.send(Maintenance::Reconcile);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use crate::worker::Kwargs;

    #[derive(Debug, Default)]
    struct FakeHandle {
        pid: u32,
        broken: bool,
        sent: Arc<AtomicUsize>,
    }

    impl WorkerHandle for FakeHandle {
        fn pid(&self) -> u32 {
            self.pid
        }

        fn send(&mut self, _message: &Inbound) -> io::Result<()> {
            if self.broken {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken"));
            }
            self.sent.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn kill(&mut self) {
            self.broken = true;
        }

        fn join(&mut self, _timeout: Duration) -> bool {
            true
        }
    }

    fn task(id: TaskId) -> Task {
        Task {
            id,
            target: "identity".into(),
            args: Vec::new(),
            kwargs: Kwargs::new(),
            submitted_at: Instant::now(),
            soft_timeout: None,
            hard_timeout: None,
        }
    }

    fn state_with(workers: u32) -> PoolState<FakeHandle> {
        let mut state = PoolState::new(workers as usize);
        for pid in 1..=workers {
            let id = state.next_worker_id();
            let handle = FakeHandle { pid, ..FakeHandle::default() };
            state.workers.insert(id, WorkerSlot::new(id, handle));
        }
        state
    }

    #[test]
    fn test_lifecycle_display() {
        assert_eq!(Lifecycle::Init.to_string(), "INIT");
        assert_eq!(Lifecycle::Terminated.to_string(), "TERMINATED");
        assert_eq!(serde_json::to_string(&Lifecycle::Closing).unwrap(), "\"CLOSING\"");
    }

    #[test]
    fn test_dispatch_is_round_robin() {
        let mut state = state_with(3);
        assert!(state.dispatch(task(1)).is_none());
        assert!(state.dispatch(task(2)).is_none());
        assert_eq!(state.holder_of(1), Some(WorkerId(1)));
        assert_eq!(state.holder_of(2), Some(WorkerId(2)));

        state.workers.get_mut(&WorkerId(1)).unwrap().release();
        assert!(state.dispatch(task(3)).is_none());
        assert_eq!(state.holder_of(3), Some(WorkerId(3)));

        // wraps around to the freed worker
        assert!(state.dispatch(task(4)).is_none());
        assert_eq!(state.holder_of(4), Some(WorkerId(1)));
        assert_eq!(state.dispatch(task(5)).map(|t| t.id), Some(5));
    }

    #[test]
    fn test_busy_iff_task_held() {
        let mut state = state_with(1);
        let slot = state.workers.get(&WorkerId(1)).unwrap();
        assert_eq!(slot.state(), WorkerState::Idle);
        state.dispatch(task(1));
        let slot = state.workers.get_mut(&WorkerId(1)).unwrap();
        assert_eq!(slot.state(), WorkerState::Busy);
        slot.release();
        assert_eq!(slot.state(), WorkerState::Idle);
        slot.kill();
        assert_eq!(slot.state(), WorkerState::Dead);
    }

    #[test]
    fn test_failed_send_kills_worker_and_tries_next() {
        let mut state = state_with(2);
        state.workers.get_mut(&WorkerId(1)).unwrap().handle.broken = true;
        assert!(state.dispatch(task(1)).is_none());
        assert_eq!(state.holder_of(1), Some(WorkerId(2)));
        assert_eq!(state.live_count(), 1);
    }

    #[test]
    fn test_pump_keeps_fifo_order() {
        let mut state = state_with(1);
        state.pending.extend([task(1), task(2)]);
        state.pump();
        assert_eq!(state.holder_of(1), Some(WorkerId(1)));
        assert_eq!(state.pending.front().map(|t| t.id), Some(2));
        assert!(!state.is_drained());
    }

    #[test]
    fn test_retiring_worker_is_not_live() {
        let mut state = state_with(2);
        state.dispatch(task(1));
        let busy = state.workers.get_mut(&WorkerId(1)).unwrap();
        busy.retire();
        assert!(busy.alive);
        assert_eq!(state.live_count(), 1);
        assert_eq!(state.live_pids(), vec![2]);
    }
}
