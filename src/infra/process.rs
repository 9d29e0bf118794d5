//! Child-process worker backend.
//!
//! Every worker is a separate OS process started from a worker program (see
//! the bundled `taskpool-worker` binary). The manager writes [`Inbound`]
//! messages to the child's stdin and a reader thread per child turns its
//! stdout lines into [`WorkerEvent`]s. The child's stderr is inherited so its
//! logs end up next to the manager's.

use std::ffi::OsString;
use std::io::{self, BufRead, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::core::PoolError;
use crate::util::{deadline_after, is_past};
use crate::worker::runtime::write_line;
use crate::worker::{Inbound, Outbound, ProcessBackend, WorkerEvent, WorkerHandle, WorkerId};

/// How long the reader waits for the exit status after stdout closes.
const REAP_TIMEOUT: Duration = Duration::from_secs(1);
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Environment variable carrying the manager-side worker id into the child.
pub const WORKER_ID_ENV: &str = "TASKPOOL_WORKER_ID";

/// Backend spawning worker processes from a program on disk.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl ProcessSpawner {
    /// Spawn workers by executing `program`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// Append a command-line argument passed to every worker.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set an environment variable for every worker.
    #[must_use]
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Worker program.
    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl ProcessBackend for ProcessSpawner {
    type Worker = ChildWorker;

    fn spawn(&self, worker: WorkerId, events: Sender<WorkerEvent>) -> Result<ChildWorker, PoolError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .env(WORKER_ID_ENV, worker.0.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = command.spawn().map_err(|e| {
            PoolError::Startup(format!("failed to spawn {}: {e}", self.program.display()))
        })?;
        let pid = child.id();

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(PoolError::Startup(format!("worker {pid} has no stdio pipes")));
        };

        let child = Arc::new(Mutex::new(child));
        let reader_child = Arc::clone(&child);
        let reader = thread::Builder::new()
            .name(format!("taskpool-reader-{pid}"))
            .spawn(move || read_worker(worker, pid, stdout, &reader_child, &events));
        let reader = match reader {
            Ok(reader) => reader,
            Err(e) => {
                let mut child = child.lock();
                let _ = child.kill();
                let _ = child.wait();
                return Err(PoolError::Startup(format!("failed to spawn reader for worker {pid}: {e}")));
            }
        };

        debug!(%worker, pid, program = %self.program.display(), "worker process started");
        Ok(ChildWorker {
            worker,
            pid,
            child,
            stdin: Some(BufWriter::new(stdin)),
            reader: Some(reader),
            killed: false,
        })
    }
}

/// Forward a child's stdout to the manager until EOF, then report its exit.
fn read_worker(
    worker: WorkerId,
    pid: u32,
    stdout: ChildStdout,
    child: &Mutex<Child>,
    events: &Sender<WorkerEvent>,
) {
    for line in BufReader::new(stdout).lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(%worker, pid, error = %e, "failed to read from worker");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Outbound>(&line) {
            Ok(message) => {
                if events.send(WorkerEvent::from_outbound(worker, message)).is_err() {
                    debug!(%worker, pid, "manager stopped listening");
                }
            }
            Err(e) => warn!(%worker, pid, error = %e, "ignoring malformed message from worker"),
        }
    }

    let code = reap(pid, child);
    debug!(%worker, pid, ?code, "worker process exited");
    let _ = events.send(WorkerEvent::Exited { worker, code });
}

/// Exit code of a child whose stdout closed, if it terminates in time.
fn reap(pid: u32, child: &Mutex<Child>) -> Option<i32> {
    let deadline = Instant::now() + REAP_TIMEOUT;
    loop {
        match child.lock().try_wait() {
            Ok(Some(status)) => return status.code(),
            Ok(None) => {}
            Err(e) => {
                error!(pid, error = %e, "failed to query worker exit status");
                return None;
            }
        }
        if Instant::now() >= deadline {
            warn!(pid, "worker closed stdout but did not exit");
            return None;
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Handle to one worker process.
#[derive(Debug)]
pub struct ChildWorker {
    worker: WorkerId,
    pid: u32,
    child: Arc<Mutex<Child>>,
    stdin: Option<BufWriter<ChildStdin>>,
    reader: Option<JoinHandle<()>>,
    killed: bool,
}

impl ChildWorker {
    fn has_exited(&self) -> bool {
        matches!(self.child.lock().try_wait(), Ok(Some(_)) | Err(_))
    }

    fn join_reader(&mut self) {
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                warn!(worker = %self.worker, pid = self.pid, "worker reader thread panicked");
            }
        }
    }
}

impl WorkerHandle for ChildWorker {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn send(&mut self, message: &Inbound) -> io::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "worker stdin closed"))?;
        write_line(stdin, message)
    }

    fn kill(&mut self) {
        self.stdin = None;
        self.killed = true;
        let mut child = self.child.lock();
        if let Err(e) = child.kill() {
            debug!(worker = %self.worker, pid = self.pid, error = %e, "kill failed, worker already gone");
        }
    }

    fn join(&mut self, timeout: Duration) -> bool {
        self.stdin = None;
        let deadline = deadline_after(timeout);
        while !self.has_exited() {
            if is_past(deadline) {
                return false;
            }
            thread::sleep(POLL_INTERVAL);
        }
        self.join_reader();
        true
    }
}

impl Drop for ChildWorker {
    fn drop(&mut self) {
        self.stdin = None;
        if !self.has_exited() {
            if !self.killed {
                warn!(worker = %self.worker, pid = self.pid, "killing orphaned worker process");
            }
            let mut child = self.child.lock();
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
