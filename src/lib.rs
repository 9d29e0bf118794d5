//! # Prometheus Task Pool
//!
//! A supervised pool of worker processes for CPU-bound or crash-prone work.
//!
//! The manager owns a set of OS-level worker processes, dispatches tasks to
//! them without blocking the caller, correlates results back to callbacks,
//! enforces per-task soft and hard timeouts, replaces workers that crash and
//! resizes the pool while it runs.
//!
//! ## Core Problem Solved
//!
//! Some work cannot safely run on threads of the calling process:
//!
//! - **Crashes**: a segfault or `abort` in native code must not take the application down
//! - **Runaway tasks**: a task stuck in a tight loop has to be killed, not just abandoned
//! - **Resource leaks**: long-lived workers that leak memory need periodic recycling
//! - **Elastic load**: the number of workers should follow demand at runtime
//!
//! ## Key Features
//!
//! - **Asynchronous dispatch**: `apply_async` returns an [`AsyncResult`] immediately
//! - **Exactly-once callbacks**: every accepted task resolves once, success or failure
//! - **Soft timeouts**: the task is asked to abort and can clean up ([`worker::TaskContext::check`])
//! - **Hard timeouts**: the worker is killed and replaced
//! - **Crash recovery**: lost tasks fail with [`TaskError::WorkerLost`]; the worker is replaced
//! - **Live resizing**: `grow`, `shrink` and `restart` while tasks are running
//! - **Pluggable backends**: real child processes ([`ProcessSpawner`]) or an in-memory
//!   fake ([`InMemoryBackend`]) for tests
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use prometheus_task_pool::{builtin_registry, TaskPoolBuilder, TaskPoolConfig};
//! use serde_json::json;
//!
//! let pool = TaskPoolBuilder::new(
//!     TaskPoolConfig::new()
//!         .with_size(4)
//!         .with_hard_timeout(Duration::from_secs(30)),
//! )
//! .build_process_pool("target/release/taskpool-worker")?;
//! pool.start()?;
//!
//! let result = pool.apply_async("add", vec![json!(1), json!(2)], Default::default(), |outcome| {
//!     println!("callback: {outcome:?}");
//! })?;
//! assert_eq!(result.wait(Duration::from_secs(5))?, Ok(json!(3)));
//!
//! pool.stop();
//! ```
//!
//! Worker programs are ordinary binaries that register their targets and
//! hand control to [`worker::run_stdio`]; see `src/bin/taskpool-worker.rs`.
//!
//! For complete examples, see:
//! - `tests/task_pool_test.rs` - Pool behaviour against the in-memory backend
//! - `tests/process_backend_test.rs` - Real child processes

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Pool manager: lifecycle, dispatch, results, timeouts and maintenance.
pub mod core;
/// Configuration models for task pools.
pub mod config;
/// Builders assembling pools from configuration.
pub mod builders;
/// Worker backends: child processes and the in-memory fake.
pub mod infra;
/// Worker-side protocol and runtime.
pub mod worker;
/// Shared utilities.
pub mod util;

pub use crate::builders::TaskPoolBuilder;
pub use crate::config::TaskPoolConfig;
pub use crate::core::{
    ApplyOptions, AsyncResult, Lifecycle, PoolError, PoolInfo, TaskError, TaskLimit, TaskPool,
};
pub use crate::infra::{InMemoryBackend, ProcessSpawner};
pub use crate::worker::{builtin_registry, TaskContext, TaskOutcome, TaskRegistry};
