//! Code that runs inside a worker.
//!
//! A worker resolves [`TaskRequest::target`] against its [`TaskRegistry`],
//! executes one task at a time and reports back through [`Outbound`]
//! messages. A separate control thread keeps reading the inbound channel
//! while a task runs so that a soft-timeout signal can reach it.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, BufRead, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::protocol::{Args, Inbound, Kwargs, Outbound, TaskId, TaskOutcome, TaskRequest};
use crate::core::{AppResult, TaskError};
use crate::util::deadline_after;

/// Granularity of [`TaskContext::sleep`].
const SLEEP_SLICE: Duration = Duration::from_millis(5);

/// Callable registered under a target name.
pub type TaskFn = Arc<dyn Fn(&TaskContext, &Args, &Kwargs) -> Result<Value, TaskError> + Send + Sync>;

/// Named callables a worker can execute.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    targets: HashMap<String, TaskFn>,
}

impl TaskRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `f` under `name`, replacing any previous registration.
    pub fn register<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&TaskContext, &Args, &Kwargs) -> Result<Value, TaskError> + Send + Sync + 'static,
    {
        self.targets.insert(name.into(), Arc::new(f));
        self
    }

    /// Builder-style [`register`](Self::register).
    #[must_use]
    pub fn with<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&TaskContext, &Args, &Kwargs) -> Result<Value, TaskError> + Send + Sync + 'static,
    {
        self.register(name, f);
        self
    }

    /// Look up a target.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&TaskFn> {
        self.targets.get(name)
    }

    /// Whether `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.targets.contains_key(name)
    }

    /// Number of registered targets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Whether no target is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.targets.keys().collect();
        names.sort();
        f.debug_struct("TaskRegistry").field("targets", &names).finish()
    }
}

/// Per-task view of the worker handed to the target.
///
/// Soft timeouts are cooperative: the supervisor only raises a flag, and the
/// target notices it through [`check`](Self::check) or
/// [`sleep`](Self::sleep), which then return
/// [`TaskError::SoftTimeLimitExceeded`]. A target may handle that error
/// (clean up, return a partial result) or propagate it with `?`.
#[derive(Debug, Clone)]
pub struct TaskContext {
    task_id: TaskId,
    pid: u32,
    soft_timeout: Arc<AtomicBool>,
}

impl TaskContext {
    /// Create a context for `task_id` executing in worker `pid`.
    #[must_use]
    pub fn new(task_id: TaskId, pid: u32) -> Self {
        Self {
            task_id,
            pid,
            soft_timeout: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Task being executed.
    #[must_use]
    pub const fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Pid of the executing worker.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether the soft deadline has been signalled.
    #[must_use]
    pub fn soft_timeout_signalled(&self) -> bool {
        self.soft_timeout.load(Ordering::Acquire)
    }

    /// Raise [`TaskError::SoftTimeLimitExceeded`] if the soft deadline passed.
    ///
    /// # Errors
    ///
    /// Returns the soft-timeout error once signalled.
    pub fn check(&self) -> Result<(), TaskError> {
        if self.soft_timeout_signalled() {
            Err(TaskError::SoftTimeLimitExceeded)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, waking early if the soft deadline is signalled.
    ///
    /// # Errors
    ///
    /// Returns the soft-timeout error if signalled before or during the sleep.
    pub fn sleep(&self, duration: Duration) -> Result<(), TaskError> {
        let deadline = deadline_after(duration);
        loop {
            self.check()?;
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(());
                    }
                    SLEEP_SLICE.min(deadline - now)
                }
                None => SLEEP_SLICE,
            };
            thread::sleep(slice);
        }
    }

    /// Signal the soft deadline.
    pub fn signal_soft_timeout(&self) {
        self.soft_timeout.store(true, Ordering::Release);
    }
}

/// Soft-timeout bookkeeping shared by the control thread and the executor.
/// A signal that arrives before its task starts is held for that task.
#[derive(Debug, Default)]
struct SoftSignals {
    current: Option<TaskContext>,
    early: Option<TaskId>,
}

impl SoftSignals {
    /// Signal `task_id`. Returns `false` if it is not running yet.
    fn signal(&mut self, task_id: TaskId) -> bool {
        match &self.current {
            Some(ctx) if ctx.task_id() == task_id => {
                ctx.signal_soft_timeout();
                true
            }
            _ => {
                self.early = Some(task_id);
                false
            }
        }
    }

    /// Context for the task about to run. A held signal for another task
    /// is stale and discarded.
    fn begin(&mut self, task_id: TaskId, pid: u32) -> TaskContext {
        let ctx = TaskContext::new(task_id, pid);
        if self.early.take() == Some(task_id) {
            ctx.signal_soft_timeout();
        }
        self.current = Some(ctx.clone());
        ctx
    }

    fn finish(&mut self) {
        self.current = None;
    }
}

/// Executes tasks for one worker.
#[derive(Debug, Clone)]
pub struct WorkerRuntime {
    registry: Arc<TaskRegistry>,
    pid: u32,
}

impl WorkerRuntime {
    /// Create a runtime resolving targets from `registry`.
    #[must_use]
    pub const fn new(registry: Arc<TaskRegistry>, pid: u32) -> Self {
        Self { registry, pid }
    }

    /// Pid this runtime reports.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Execute one request. Panics inside the target are contained and
    /// reported as [`TaskError::Panicked`].
    #[must_use]
    pub fn execute(&self, ctx: &TaskContext, request: &TaskRequest) -> TaskOutcome {
        let Some(target) = self.registry.get(&request.target) else {
            warn!(target = %request.target, task_id = request.task_id, "unknown task target");
            return Err(TaskError::UnknownTarget(request.target.clone()));
        };
        match panic::catch_unwind(AssertUnwindSafe(|| {
            target(ctx, &request.args, &request.kwargs)
        })) {
            Ok(outcome) => outcome,
            Err(payload) => Err(TaskError::Panicked(panic_message(payload.as_ref()))),
        }
    }

    /// Serve tasks from `inbound` until it closes or a `Shutdown` arrives,
    /// reporting through `sink`. The loop also ends when `sink` returns
    /// `false` (the manager stopped listening).
    ///
    /// # Errors
    ///
    /// Fails if the control thread cannot be spawned.
    pub fn serve<S>(&self, inbound: Receiver<Inbound>, mut sink: S) -> io::Result<()>
    where
        S: FnMut(Outbound) -> bool,
    {
        let signals: Arc<Mutex<SoftSignals>> = Arc::new(Mutex::new(SoftSignals::default()));
        let (jobs_tx, jobs_rx) = unbounded::<TaskRequest>();
        let pid = self.pid;

        let control_signals = Arc::clone(&signals);
        thread::Builder::new()
            .name(format!("taskpool-control-{pid}"))
            .spawn(move || {
                for message in &inbound {
                    match message {
                        Inbound::Run(request) => {
                            if jobs_tx.send(request).is_err() {
                                break;
                            }
                        }
                        Inbound::SoftTimeout { task_id } => {
                            if control_signals.lock().signal(task_id) {
                                debug!(pid, task_id, "soft timeout signalled");
                            } else {
                                debug!(pid, task_id, "soft timeout held for task not yet running");
                            }
                        }
                        Inbound::Shutdown => {
                            debug!(pid, "shutdown requested");
                            break;
                        }
                    }
                }
            })?;

        for request in &jobs_rx {
            let task_id = request.task_id;
            let ctx = signals.lock().begin(task_id, pid);

            if !sink(Outbound::Accepted { task_id, pid }) {
                break;
            }
            debug!(pid, task_id, target = %request.target, "executing task");
            let outcome = self.execute(&ctx, &request);
            signals.lock().finish();

            if !sink(Outbound::Finished { task_id, outcome }) {
                break;
            }
        }

        debug!(pid, "worker loop finished");
        Ok(())
    }
}

/// Run a worker over stdin/stdout: JSON lines in, JSON lines out.
///
/// This is the body of a worker process; it returns when the manager closes
/// stdin or asks the worker to shut down.
///
/// # Errors
///
/// Fails if the stdin reader thread cannot be spawned.
pub fn run_stdio(registry: TaskRegistry) -> AppResult<()> {
    let pid = std::process::id();
    let runtime = WorkerRuntime::new(Arc::new(registry), pid);
    let (inbound_tx, inbound_rx) = unbounded::<Inbound>();

    thread::Builder::new()
        .name("taskpool-stdin".into())
        .spawn(move || {
            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        error!(error = %e, "failed to read from manager");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Inbound>(&line) {
                    Ok(message) => {
                        if inbound_tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "ignoring malformed message from manager"),
                }
            }
        })?;

    info!(pid, "worker process ready");
    let stdout = io::stdout();
    let mut out = stdout.lock();
    runtime.serve(inbound_rx, |message| match write_line(&mut out, &message) {
        Ok(()) => true,
        Err(e) => {
            error!(error = %e, "failed to write to manager");
            false
        }
    })?;
    info!(pid, "worker process exiting");
    Ok(())
}

/// Write `value` as one JSON line and flush.
pub(crate) fn write_line<W: Write, T: Serialize>(writer: &mut W, value: &T) -> io::Result<()> {
    serde_json::to_writer(&mut *writer, value)?;
    writer.write_all(b"\n")?;
    writer.flush()
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> TaskRegistry {
        TaskRegistry::new()
            .with("identity", |_, args, _| Ok(args.first().cloned().unwrap_or(Value::Null)))
            .with("boom", |_, _, _| panic!("exploded"))
            .with("wait_soft", |ctx, _, _| {
                ctx.sleep(Duration::from_secs(5))?;
                Ok(json!("finished"))
            })
    }

    fn request(task_id: TaskId, target: &str, args: Args) -> TaskRequest {
        TaskRequest {
            task_id,
            target: target.into(),
            args,
            kwargs: Kwargs::new(),
        }
    }

    #[test]
    fn test_soft_timeout_before_task_start_is_held() {
        let mut signals = SoftSignals::default();
        assert!(!signals.signal(7));
        let ctx = signals.begin(7, 1);
        assert!(ctx.soft_timeout_signalled());
        signals.finish();

        let next = signals.begin(8, 1);
        assert!(!next.soft_timeout_signalled());
        assert!(signals.signal(8));
        assert!(next.soft_timeout_signalled());
    }

    #[test]
    fn test_stale_held_signal_is_discarded() {
        let mut signals = SoftSignals::default();
        signals.signal(3);
        assert!(!signals.begin(4, 1).soft_timeout_signalled());
        signals.finish();
        assert!(!signals.begin(3, 1).soft_timeout_signalled());
    }

    #[test]
    fn test_execute_known_and_unknown_targets() {
        let runtime = WorkerRuntime::new(Arc::new(registry()), 1);
        let ctx = TaskContext::new(1, 1);
        assert_eq!(runtime.execute(&ctx, &request(1, "identity", vec![json!(2)])), Ok(json!(2)));
        assert_eq!(
            runtime.execute(&ctx, &request(1, "missing", vec![])),
            Err(TaskError::UnknownTarget("missing".into()))
        );
    }

    #[test]
    fn test_execute_contains_panics() {
        let runtime = WorkerRuntime::new(Arc::new(registry()), 1);
        let ctx = TaskContext::new(1, 1);
        assert_eq!(
            runtime.execute(&ctx, &request(1, "boom", vec![])),
            Err(TaskError::Panicked("exploded".into()))
        );
    }

    #[test]
    fn test_context_sleep_interrupted_by_soft_timeout() {
        let ctx = TaskContext::new(3, 1);
        ctx.signal_soft_timeout();
        assert!(ctx.soft_timeout_signalled());
        assert_eq!(ctx.sleep(Duration::from_secs(5)), Err(TaskError::SoftTimeLimitExceeded));
        assert_eq!(TaskContext::new(4, 1).sleep(Duration::from_millis(1)), Ok(()));
    }

    #[test]
    fn test_serve_runs_tasks_and_honours_soft_timeout() {
        let runtime = WorkerRuntime::new(Arc::new(registry()), 42);
        let (inbound_tx, inbound_rx) = unbounded();
        let (out_tx, out_rx) = unbounded();

        let server = thread::spawn(move || {
            runtime
                .serve(inbound_rx, |message| out_tx.send(message).is_ok())
                .unwrap();
        });

        inbound_tx.send(Inbound::Run(request(1, "identity", vec![json!("a")]))).unwrap();
        assert_eq!(out_rx.recv().unwrap(), Outbound::Accepted { task_id: 1, pid: 42 });
        assert_eq!(
            out_rx.recv().unwrap(),
            Outbound::Finished { task_id: 1, outcome: Ok(json!("a")) }
        );

        inbound_tx.send(Inbound::Run(request(2, "wait_soft", vec![]))).unwrap();
        assert_eq!(out_rx.recv().unwrap(), Outbound::Accepted { task_id: 2, pid: 42 });
        inbound_tx.send(Inbound::SoftTimeout { task_id: 2 }).unwrap();
        assert_eq!(
            out_rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            Outbound::Finished { task_id: 2, outcome: Err(TaskError::SoftTimeLimitExceeded) }
        );

        inbound_tx.send(Inbound::Shutdown).unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_write_line_appends_newline() {
        let mut buf = Vec::new();
        write_line(&mut buf, &Outbound::Accepted { task_id: 1, pid: 2 }).unwrap();
        assert_eq!(
            String::from_utf8(buf).unwrap(),
            "{\"type\":\"accepted\",\"task_id\":1,\"pid\":2}\n"
        );
    }

    #[test]
    fn test_registry_debug_lists_names() {
        let registry = registry();
        assert_eq!(registry.len(), 3);
        assert!(registry.contains("boom"));
        assert!(format!("{registry:?}").contains("identity"));
    }
}
