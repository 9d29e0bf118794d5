//! Configuration models for task pools.

pub mod pool;

pub use pool::{TaskPoolConfig, ENV_PREFIX};
