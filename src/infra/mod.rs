//! Worker backends: real child processes and an in-memory fake.

pub mod memory;
pub mod process;

pub use memory::{InMemoryBackend, InMemoryWorker};
pub use process::{ChildWorker, ProcessSpawner};
