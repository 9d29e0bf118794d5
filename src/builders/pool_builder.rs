//! Builders to construct task pools from configuration.

use std::path::PathBuf;

use crate::config::TaskPoolConfig;
use crate::core::{PoolError, TaskPool};
use crate::infra::{InMemoryBackend, ProcessSpawner};
use crate::worker::{ProcessBackend, TaskRegistry};

/// Assembles a [`TaskPool`] from a configuration and a backend.
#[derive(Debug, Clone, Default)]
pub struct TaskPoolBuilder {
    config: TaskPoolConfig,
}

impl TaskPoolBuilder {
    /// Start from `config`.
    #[must_use]
    pub const fn new(config: TaskPoolConfig) -> Self {
        Self { config }
    }

    /// Start from the `TASKPOOL_*` environment.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidConfig`] on unparsable or invalid values.
    pub fn from_env() -> Result<Self, PoolError> {
        TaskPoolConfig::from_env()
            .map(Self::new)
            .map_err(PoolError::InvalidConfig)
    }

    /// Configuration the pool will be built with.
    #[must_use]
    pub const fn config(&self) -> &TaskPoolConfig {
        &self.config
    }

    /// Build a pool over any backend.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidConfig`] if the configuration is invalid.
    pub fn build<B: ProcessBackend>(self, backend: B) -> Result<TaskPool<B>, PoolError> {
        TaskPool::new(self.config, backend)
    }

    /// Build a pool of child processes running `program`.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidConfig`] if the configuration is invalid.
    pub fn build_process_pool(self, program: impl Into<PathBuf>) -> Result<TaskPool<ProcessSpawner>, PoolError> {
        self.build(ProcessSpawner::new(program))
    }

    /// Build a pool of in-memory workers resolving targets from `registry`.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidConfig`] if the configuration is invalid.
    pub fn build_in_memory_pool(self, registry: TaskRegistry) -> Result<TaskPool<InMemoryBackend>, PoolError> {
        self.build(InMemoryBackend::new(registry))
    }
}
