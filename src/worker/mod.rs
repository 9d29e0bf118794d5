//! Worker side of the pool: wire protocol, backend seam and the runtime that
//! executes tasks inside a worker.

pub mod backend;
pub mod builtin;
pub mod protocol;
pub mod runtime;

pub use backend::{ProcessBackend, WorkerHandle};
pub use builtin::builtin_registry;
pub use protocol::{
    Args, Inbound, Kwargs, Outbound, TaskId, TaskOutcome, TaskRequest, WorkerEvent, WorkerId,
};
pub use runtime::{run_stdio, TaskContext, TaskFn, TaskRegistry, WorkerRuntime};
