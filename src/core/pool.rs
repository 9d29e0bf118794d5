//! The task pool façade.
//!
//! # Locking
//!
//! All pool state sits behind one `parking_lot::Mutex`. The result registry
//! has its own lock, which may be taken while holding the state lock but
//! never the other way round. Results are resolved, and callbacks run, only
//! after the state lock is released. Lifecycle transitions additionally
//! serialize on a control mutex so `start`, `stop`, `terminate` and `restart`
//! never interleave.

use std::fmt;
use std::io;
use std::mem;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use super::error::{PoolError, TaskError};
use super::info::PoolInfo;
use super::maintainer::Maintenance;
use super::result::{AsyncResult, ResultRegistry};
use super::state::{Lifecycle, PoolState, WorkerSlot};
use super::task::{ApplyOptions, Task};
use super::{handler, maintainer, scaler, supervisor};
use crate::config::TaskPoolConfig;
use crate::util::deadline_after;
use crate::worker::{
    Args, Kwargs, ProcessBackend, TaskId, TaskOutcome, WorkerEvent, WorkerHandle, WorkerId,
};

/// State shared between the façade and its background loops.
pub(crate) struct Shared<B: ProcessBackend> {
    pub config: TaskPoolConfig,
    pub backend: B,
    pub state: Mutex<PoolState<B::Worker>>,
    /// Signalled on queue space, task completion and worker exit.
    pub changed: Condvar,
    pub registry: ResultRegistry,
}

impl<B: ProcessBackend> Shared<B> {
    /// Spawn one worker into `state`.
    pub fn spawn_worker(&self, state: &mut PoolState<B::Worker>) -> Result<WorkerId, PoolError> {
        let events = state
            .events
            .clone()
            .ok_or_else(|| PoolError::Internal("worker event channel is closed".into()))?;
        let id = state.next_worker_id();
        let handle = self.backend.spawn(id, events)?;
        let slot = WorkerSlot::new(id, handle);
        info!(worker = %id, pid = slot.pid, "worker spawned");
        state.workers.insert(id, slot);
        Ok(id)
    }

    fn resolve_all(&self, tasks: Vec<TaskId>, error: &TaskError) {
        for task_id in tasks {
            self.registry.resolve(task_id, Err(error.clone()));
        }
    }
}

/// Handles of the background loops.
struct Loops {
    stop: Sender<()>,
    threads: Vec<JoinHandle<()>>,
}

impl Loops {
    /// Dropping the stop sender wakes every loop.
    fn shutdown(self) {
        drop(self.stop);
        for thread in self.threads {
            if thread.join().is_err() {
                error!("pool background thread panicked");
            }
        }
    }
}

/// A pool of worker processes executing tasks asynchronously.
///
/// ```rust,ignore
/// use prometheus_task_pool::{TaskPool, TaskPoolConfig, ProcessSpawner};
///
/// let pool = TaskPool::new(TaskPoolConfig::new().with_size(4), ProcessSpawner::new("taskpool-worker"))?;
/// pool.start()?;
/// let result = pool.apply_async("add", vec![1.into(), 2.into()], Default::default(), |_| {})?;
/// assert_eq!(result.wait(Duration::from_secs(5))?, Ok(3.into()));
/// pool.stop();
/// ```
pub struct TaskPool<B: ProcessBackend> {
    shared: Arc<Shared<B>>,
    control: Mutex<Option<Loops>>,
}

impl<B: ProcessBackend> TaskPool<B> {
    /// Create a pool in the `Init` state. No worker is spawned yet.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidConfig`] if `config` does not validate.
    pub fn new(config: TaskPoolConfig, backend: B) -> Result<Self, PoolError> {
        config.validate().map_err(PoolError::InvalidConfig)?;
        let state = PoolState::new(config.size);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                backend,
                state: Mutex::new(state),
                changed: Condvar::new(),
                registry: ResultRegistry::new(),
            }),
            control: Mutex::new(None),
        })
    }

    /// The backend workers are spawned from.
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.shared.backend
    }

    /// Pool configuration.
    #[must_use]
    pub fn config(&self) -> &TaskPoolConfig {
        &self.shared.config
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        self.shared.state.lock().lifecycle
    }

    /// Start the workers and the background loops.
    ///
    /// Valid from `Init` and `Closing`; a no-op when already running. On
    /// failure every worker spawned so far is killed and the lifecycle is
    /// left unchanged.
    ///
    /// # Errors
    ///
    /// - [`PoolError::NotRunning`] if the pool was terminated
    /// - [`PoolError::Startup`] if a worker or loop thread cannot be started
    pub fn start(&self) -> Result<(), PoolError> {
        let mut control = self.control.lock();
        let mut state = self.shared.state.lock();
        match state.lifecycle {
            Lifecycle::Running => return Ok(()),
            Lifecycle::Terminated => return Err(PoolError::NotRunning(Lifecycle::Terminated)),
            Lifecycle::Init | Lifecycle::Closing => {}
        }

        let (events_tx, events_rx) = unbounded();
        let (maintenance_tx, maintenance_rx) = unbounded();
        let loops = self.spawn_loops(events_rx, maintenance_tx.clone(), maintenance_rx)?;
        state.events = Some(events_tx);
        state.maintenance = Some(maintenance_tx);

        for _ in 0..state.target_size {
            if let Err(e) = self.shared.spawn_worker(&mut state) {
                error!(error = %e, "failed to start pool");
                let workers = mem::take(&mut state.workers);
                state.events = None;
                state.maintenance = None;
                drop(state);
                loops.shutdown();
                self.reap(workers, true);
                return Err(e);
            }
        }

        state.lifecycle = Lifecycle::Running;
        info!(worker_count = state.workers.len(), "task pool started");
        drop(state);
        *control = Some(loops);
        Ok(())
    }

    fn spawn_loops(
        &self,
        events: Receiver<WorkerEvent>,
        maintenance_tx: Sender<Maintenance>,
        maintenance_rx: Receiver<Maintenance>,
    ) -> Result<Loops, PoolError> {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let mut loops = Loops {
            stop: stop_tx,
            threads: Vec::with_capacity(3),
        };
        let spawned = start_threads(
            &self.shared,
            &mut loops.threads,
            events,
            maintenance_tx,
            maintenance_rx,
            &stop_rx,
        );
        match spawned {
            Ok(()) => Ok(loops),
            Err(e) => {
                loops.shutdown();
                Err(PoolError::Startup(format!("failed to spawn pool thread: {e}")))
            }
        }
    }

    /// Submit `target(*args, **kwargs)` for execution. `callback` receives
    /// the outcome exactly once; the returned [`AsyncResult`] observes the
    /// same outcome.
    ///
    /// Never waits for the task to run. It only blocks, up to the configured
    /// put timeout, while the pending queue is full.
    ///
    /// # Errors
    ///
    /// - [`PoolError::NotRunning`] unless the pool is running
    /// - [`PoolError::QueueFull`] if no queue space frees up in time
    pub fn apply_async<F>(
        &self,
        target: impl Into<String>,
        args: Args,
        kwargs: Kwargs,
        callback: F,
    ) -> Result<AsyncResult, PoolError>
    where
        F: FnOnce(TaskOutcome) + Send + 'static,
    {
        self.apply_async_with(target, args, kwargs, ApplyOptions::default(), callback)
    }

    /// [`apply_async`](Self::apply_async) with per-task timeout overrides.
    ///
    /// # Errors
    ///
    /// Same as [`apply_async`](Self::apply_async).
    pub fn apply_async_with<F>(
        &self,
        target: impl Into<String>,
        args: Args,
        kwargs: Kwargs,
        options: ApplyOptions,
        callback: F,
    ) -> Result<AsyncResult, PoolError>
    where
        F: FnOnce(TaskOutcome) + Send + 'static,
    {
        let config = &self.shared.config;
        let mut state = self.shared.state.lock();
        ensure_running(state.lifecycle)?;

        if state.pending.len() >= config.max_queue_depth {
            let deadline = deadline_after(config.put_timeout);
            while state.pending.len() >= config.max_queue_depth {
                let timed_out = match deadline {
                    Some(deadline) => self.shared.changed.wait_until(&mut state, deadline).timed_out(),
                    None => {
                        self.shared.changed.wait(&mut state);
                        false
                    }
                };
                ensure_running(state.lifecycle)?;
                if timed_out && state.pending.len() >= config.max_queue_depth {
                    warn!(depth = state.pending.len(), "task queue full, rejecting task");
                    return Err(PoolError::QueueFull);
                }
            }
        }

        let task = Task {
            id: state.next_task_id(),
            target: target.into(),
            args,
            kwargs,
            submitted_at: Instant::now(),
            soft_timeout: options.soft_timeout.or(config.soft_timeout),
            hard_timeout: options.hard_timeout.or(config.hard_timeout),
        };
        let result = self.shared.registry.register(task.id, Some(Box::new(callback)))?;
        debug!(task_id = task.id, target = %task.target, "task submitted");
        state.pending.push_back(task);
        state.pump();
        Ok(result)
    }

    /// Stop accepting tasks, wait for outstanding ones, then shut the
    /// workers down gracefully.
    ///
    /// Outstanding tasks get the configured drain timeout; after that the
    /// remaining workers are killed and their tasks, like any still queued,
    /// fail with [`TaskError::Terminated`]. A no-op unless running.
    pub fn stop(&self) {
        let mut control = self.control.lock();
        let (workers, abandoned) = {
            let mut state = self.shared.state.lock();
            if state.lifecycle != Lifecycle::Running {
                debug!(lifecycle = %state.lifecycle, "stop ignored");
                return;
            }
            state.lifecycle = Lifecycle::Closing;
            info!(pending = state.pending.len(), in_flight = state.in_flight(), "stopping task pool");
            self.shared.changed.notify_all();

            let deadline = deadline_after(self.shared.config.drain_timeout);
            while !state.is_drained() {
                match deadline {
                    Some(deadline) => {
                        if self.shared.changed.wait_until(&mut state, deadline).timed_out() {
                            break;
                        }
                    }
                    None => self.shared.changed.wait(&mut state),
                }
            }

            let abandoned = if state.is_drained() {
                Vec::new()
            } else {
                warn!(
                    pending = state.pending.len(),
                    in_flight = state.in_flight(),
                    "drain timeout exceeded, terminating outstanding tasks"
                );
                abandon_all(&mut state)
            };
            (mem::take(&mut state.workers), abandoned)
        };

        if let Some(loops) = control.take() {
            loops.shutdown();
        }
        self.shared.resolve_all(abandoned, &TaskError::Terminated);
        self.reap(workers, false);

        let mut state = self.shared.state.lock();
        state.events = None;
        state.maintenance = None;
        info!("task pool stopped");
    }

    /// Kill every worker and fail all outstanding tasks with
    /// [`TaskError::Terminated`]. Idempotent.
    pub fn terminate(&self) {
        let mut control = self.control.lock();
        let (workers, abandoned) = {
            let mut state = self.shared.state.lock();
            if state.lifecycle == Lifecycle::Terminated {
                return;
            }
            let previous = state.lifecycle;
            state.lifecycle = Lifecycle::Terminated;
            self.shared.changed.notify_all();
            let abandoned = abandon_all(&mut state);
            state.events = None;
            state.maintenance = None;
            info!(%previous, abandoned = abandoned.len(), "terminating task pool");
            (mem::take(&mut state.workers), abandoned)
        };

        if let Some(loops) = control.take() {
            loops.shutdown();
        }
        self.shared.resolve_all(abandoned, &TaskError::Terminated);
        self.reap(workers, true);
        info!("task pool terminated");
    }

    /// Add `n` workers.
    ///
    /// # Errors
    ///
    /// - [`PoolError::NotRunning`] if the pool was terminated
    /// - [`PoolError::Startup`] if a worker cannot be spawned; workers
    ///   spawned before the failure are kept
    pub fn grow(&self, n: usize) -> Result<(), PoolError> {
        scaler::grow(&self.shared, n)
    }

    /// Remove `n` workers. Idle workers go first; busy ones finish their
    /// current task.
    ///
    /// # Errors
    ///
    /// - [`PoolError::InvalidResize`] if fewer than one worker would remain
    /// - [`PoolError::NotRunning`] if the pool was terminated
    pub fn shrink(&self, n: usize) -> Result<(), PoolError> {
        scaler::shrink(&self.shared, n)
    }

    /// Replace every worker with a fresh one. In-flight tasks finish on their
    /// old workers.
    ///
    /// # Errors
    ///
    /// - [`PoolError::NotRunning`] unless running
    /// - [`PoolError::Startup`] if a replacement cannot be spawned
    pub fn restart(&self) -> Result<(), PoolError> {
        let _control = self.control.lock();
        scaler::restart(&self.shared)
    }

    /// Revoke a task. A queued task is dropped; a running task's worker is
    /// killed and replaced. The task resolves with [`TaskError::Revoked`].
    /// Returns `false` if the task is not outstanding.
    pub fn terminate_job(&self, task_id: TaskId) -> bool {
        {
            let mut state = self.shared.state.lock();
            if let Some(position) = state.pending.iter().position(|t| t.id == task_id) {
                state.pending.remove(position);
                info!(task_id, "queued task revoked");
            } else if let Some(worker) = state.holder_of(task_id) {
                let Some(slot) = state.workers.get_mut(&worker) else {
                    return false;
                };
                slot.release();
                slot.kill();
                info!(task_id, %worker, pid = slot.pid, "running task revoked, worker killed");
                state.request_reconcile();
            } else {
                return false;
            }
            self.shared.changed.notify_all();
        }
        self.shared.registry.resolve(task_id, Err(TaskError::Revoked))
    }

    /// Snapshot of pool statistics.
    #[must_use]
    pub fn info(&self) -> PoolInfo {
        let config = &self.shared.config;
        let state = self.shared.state.lock();
        PoolInfo {
            max_concurrency: state.target_size,
            max_tasks_per_child: config.max_tasks_per_child.into(),
            timeouts: (config.soft_timeout, config.hard_timeout),
            processes: state.live_pids(),
            lifecycle: state.lifecycle,
            pending: state.pending.len(),
            in_flight: state.in_flight(),
        }
    }

    /// Number of live workers, not counting ones being retired.
    #[must_use]
    pub fn num_processes(&self) -> usize {
        self.shared.state.lock().live_count()
    }

    /// Wait for workers taken out of the pool. Graceful reaping asks each
    /// live worker to exit and kills it after the join timeout.
    fn reap(&self, workers: impl IntoIterator<Item = (WorkerId, WorkerSlot<B::Worker>)>, kill: bool) {
        let join_timeout = self.shared.config.join_timeout;
        let mut slots: Vec<WorkerSlot<B::Worker>> = workers.into_iter().map(|(_, s)| s).collect();
        for slot in &mut slots {
            if !slot.alive {
                continue;
            }
            if kill {
                slot.kill();
            } else {
                slot.request_shutdown();
            }
        }
        for slot in &mut slots {
            if !slot.handle.join(join_timeout) {
                warn!(worker = %slot.id, pid = slot.pid, "worker did not exit in time, killing");
                slot.handle.kill();
            }
        }
        debug!(worker_count = slots.len(), "workers reaped");
    }
}

impl<B: ProcessBackend> fmt::Debug for TaskPool<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("TaskPool")
            .field("lifecycle", &state.lifecycle)
            .field("target_size", &state.target_size)
            .field("processes", &state.live_pids())
            .field("pending", &state.pending.len())
            .finish_non_exhaustive()
    }
}

impl<B: ProcessBackend> Drop for TaskPool<B> {
    fn drop(&mut self) {
        if self.control.lock().is_some() {
            debug!("task pool dropped while running, terminating");
            self.terminate();
        }
    }
}

fn start_threads<B: ProcessBackend>(
    shared: &Arc<Shared<B>>,
    threads: &mut Vec<JoinHandle<()>>,
    events: Receiver<WorkerEvent>,
    maintenance_tx: Sender<Maintenance>,
    maintenance_rx: Receiver<Maintenance>,
    stop: &Receiver<()>,
) -> io::Result<()> {
    threads.push(handler::spawn(Arc::clone(shared), events, maintenance_tx, stop.clone())?);
    threads.push(supervisor::spawn(Arc::clone(shared), stop.clone())?);
    threads.push(maintainer::spawn(Arc::clone(shared), maintenance_rx, stop.clone())?);
    Ok(())
}

fn ensure_running(lifecycle: Lifecycle) -> Result<(), PoolError> {
    match lifecycle {
        Lifecycle::Running => Ok(()),
        other => Err(PoolError::NotRunning(other)),
    }
}

/// Kill every worker and empty the queue. Returns the ids of all tasks that
/// were in flight or queued, to be resolved once the lock is released.
fn abandon_all<H: WorkerHandle>(state: &mut PoolState<H>) -> Vec<TaskId> {
    let mut abandoned = Vec::new();
    for slot in state.workers.values_mut() {
        if let Some(in_flight) = slot.release() {
            abandoned.push(in_flight.task.id);
        }
        if slot.alive {
            slot.kill();
        }
    }
    abandoned.extend(state.pending.drain(..).map(|t| t.id));
    abandoned
}
