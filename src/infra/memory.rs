//! In-memory worker backend for development and testing.
//!
//! Each "process" is a named OS thread running the regular
//! [`WorkerRuntime`] over crossbeam channels, so the pool exercises the same
//! message protocol as with real processes. Pids are synthetic. Threads cannot
//! be killed, so [`WorkerHandle::kill`] detaches the thread and silences it;
//! the exit is reported immediately, as the OS would.
//!
//! Test hooks: [`InMemoryBackend::crash`] simulates an unexpected worker death
//! and [`InMemoryBackend::with_max_spawns`] simulates resource exhaustion.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::core::PoolError;
use crate::util::{deadline_after, is_past};
use crate::worker::{
    Inbound, ProcessBackend, TaskRegistry, WorkerEvent, WorkerHandle, WorkerId, WorkerRuntime,
};

/// First synthetic pid handed out.
const FIRST_PID: u32 = 10_000;

type LiveWorkers = Arc<Mutex<HashMap<u32, Arc<WorkerControl>>>>;

/// Shared liveness record of one in-memory worker.
#[derive(Debug)]
struct WorkerControl {
    worker: WorkerId,
    pid: u32,
    events: Sender<WorkerEvent>,
    killed: AtomicBool,
    exited: AtomicBool,
    live: LiveWorkers,
}

impl WorkerControl {
    /// Report the exit unless it was already reported.
    fn report_exit(&self, code: Option<i32>) {
        if !self.exited.swap(true, Ordering::AcqRel) {
            self.live.lock().remove(&self.pid);
            debug!(worker = %self.worker, pid = self.pid, ?code, "in-memory worker exited");
            let _ = self.events.send(WorkerEvent::Exited {
                worker: self.worker,
                code,
            });
        }
    }

    fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }
}

/// Backend running workers as threads in the current process.
#[derive(Debug)]
pub struct InMemoryBackend {
    registry: Arc<TaskRegistry>,
    next_pid: AtomicU32,
    spawn_budget: Mutex<Option<usize>>,
    live: LiveWorkers,
}

impl InMemoryBackend {
    /// Create a backend whose workers resolve targets from `registry`.
    #[must_use]
    pub fn new(registry: TaskRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            next_pid: AtomicU32::new(FIRST_PID),
            spawn_budget: Mutex::new(None),
            live: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Allow at most `spawns` further worker spawns; later spawns fail with
    /// [`PoolError::Startup`].
    #[must_use]
    pub fn with_max_spawns(self, spawns: usize) -> Self {
        *self.spawn_budget.lock() = Some(spawns);
        self
    }

    /// Simulate the worker `pid` dying with exit `code`. Returns `false` if
    /// no such worker is alive.
    pub fn crash(&self, pid: u32, code: i32) -> bool {
        let Some(control) = self.live.lock().get(&pid).cloned() else {
            return false;
        };
        warn!(pid, code, "simulating worker crash");
        control.killed.store(true, Ordering::Release);
        control.report_exit(Some(code));
        true
    }

    /// Pids of workers that have not exited.
    #[must_use]
    pub fn live_pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.live.lock().keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    fn take_spawn_permit(&self) -> Result<(), PoolError> {
        let mut budget = self.spawn_budget.lock();
        match budget.as_mut() {
            None => Ok(()),
            Some(0) => Err(PoolError::Startup("in-memory spawn budget exhausted".into())),
            Some(left) => {
                *left -= 1;
                Ok(())
            }
        }
    }
}

impl ProcessBackend for InMemoryBackend {
    type Worker = InMemoryWorker;

    fn spawn(&self, worker: WorkerId, events: Sender<WorkerEvent>) -> Result<InMemoryWorker, PoolError> {
        self.take_spawn_permit()?;

        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        let control = Arc::new(WorkerControl {
            worker,
            pid,
            events,
            killed: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            live: Arc::clone(&self.live),
        });
        let (inbound_tx, inbound_rx) = unbounded::<Inbound>();
        let runtime = WorkerRuntime::new(Arc::clone(&self.registry), pid);

        self.live.lock().insert(pid, Arc::clone(&control));

        let thread_control = Arc::clone(&control);
        let spawned = thread::Builder::new()
            .name(format!("taskpool-worker-{pid}"))
            .spawn(move || {
                let sink_control = Arc::clone(&thread_control);
                let served = runtime.serve(inbound_rx, |message| {
                    if sink_control.is_killed() {
                        return false;
                    }
                    sink_control
                        .events
                        .send(WorkerEvent::from_outbound(sink_control.worker, message))
                        .is_ok()
                });
                if let Err(e) = served {
                    error!(pid, error = %e, "in-memory worker failed");
                    thread_control.report_exit(Some(1));
                } else {
                    thread_control.report_exit(Some(0));
                }
            });
        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                self.live.lock().remove(&pid);
                return Err(PoolError::Startup(format!("failed to spawn worker thread: {e}")));
            }
        };
        debug!(%worker, pid, "in-memory worker started");

        Ok(InMemoryWorker {
            pid,
            inbound: Some(inbound_tx),
            control,
            thread: Some(thread),
        })
    }
}

/// Handle to an in-memory worker thread.
#[derive(Debug)]
pub struct InMemoryWorker {
    pid: u32,
    inbound: Option<Sender<Inbound>>,
    control: Arc<WorkerControl>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle for InMemoryWorker {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn send(&mut self, message: &Inbound) -> io::Result<()> {
        if self.control.is_killed() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "worker is dead"));
        }
        let inbound = self
            .inbound
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "inbound channel closed"))?;
        inbound
            .send(message.clone())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "inbound channel closed"))
    }

    fn kill(&mut self) {
        self.control.killed.store(true, Ordering::Release);
        self.inbound = None;
        // Detached: a thread stuck in a task cannot be interrupted.
        self.thread = None;
        self.control.report_exit(None);
    }

    fn join(&mut self, timeout: Duration) -> bool {
        self.inbound = None;
        let Some(thread) = self.thread.take() else {
            return true;
        };
        let deadline = deadline_after(timeout);
        while !thread.is_finished() {
            if is_past(deadline) {
                self.thread = Some(thread);
                return false;
            }
            thread::sleep(Duration::from_millis(2));
        }
        if thread.join().is_err() {
            warn!(pid = self.pid, "in-memory worker thread panicked");
        }
        true
    }
}
