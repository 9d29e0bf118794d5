//! Seam between the pool and whatever actually runs workers.
//!
//! [`ProcessBackend`] creates workers; [`WorkerHandle`] is the manager's only
//! grip on one. The production implementation spawns OS processes
//! ([`crate::infra::ProcessSpawner`]); tests use the thread-backed
//! [`crate::infra::InMemoryBackend`].

use std::io;
use std::time::Duration;

use crossbeam_channel::Sender;

use super::protocol::{Inbound, WorkerEvent, WorkerId};
use crate::core::PoolError;

/// Manager-side handle to one live worker.
pub trait WorkerHandle: Send + 'static {
    /// Backend pid of the worker.
    fn pid(&self) -> u32;

    /// Write a message to the worker's inbound channel.
    ///
    /// # Errors
    ///
    /// Fails when the channel is closed, usually because the worker died.
    fn send(&mut self, message: &Inbound) -> io::Result<()>;

    /// Forcibly stop the worker. Must cause exactly one
    /// [`WorkerEvent::Exited`] to be reported, if none was reported yet.
    fn kill(&mut self);

    /// Wait up to `timeout` for the worker to exit. Returns `true` once it
    /// has exited (or has been killed and detached).
    fn join(&mut self, timeout: Duration) -> bool;
}

/// Factory for workers.
pub trait ProcessBackend: Send + Sync + 'static {
    /// Handle type produced by this backend.
    type Worker: WorkerHandle;

    /// Start a worker that reports into `events`.
    ///
    /// Every [`WorkerEvent`] the worker causes must carry `worker`, and the
    /// backend must report [`WorkerEvent::Exited`] once the worker is gone.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Startup`] when the worker cannot be created.
    fn spawn(&self, worker: WorkerId, events: Sender<WorkerEvent>) -> Result<Self::Worker, PoolError>;
}
