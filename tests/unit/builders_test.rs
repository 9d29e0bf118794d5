//! Tests for builder modules

use prometheus_task_pool::builders::TaskPoolBuilder;
use prometheus_task_pool::config::TaskPoolConfig;
use prometheus_task_pool::core::{Lifecycle, PoolError};
use prometheus_task_pool::worker::builtin_registry;

#[test]
fn test_builder_keeps_config() {
    let builder = TaskPoolBuilder::new(TaskPoolConfig::new().with_size(3));
    assert_eq!(builder.config().size, 3);
}

#[test]
fn test_builder_in_memory_pool() {
    let pool = TaskPoolBuilder::new(TaskPoolConfig::new().with_size(2))
        .build_in_memory_pool(builtin_registry())
        .unwrap();
    assert_eq!(pool.lifecycle(), Lifecycle::Init);
    assert_eq!(pool.info().max_concurrency, 2);
}

#[test]
fn test_builder_process_pool_is_lazy() {
    let pool = TaskPoolBuilder::new(TaskPoolConfig::new().with_size(1))
        .build_process_pool("/nonexistent/taskpool-worker")
        .unwrap();
    assert!(matches!(pool.start(), Err(PoolError::Startup(_))));
    assert_eq!(pool.lifecycle(), Lifecycle::Init);
}

#[test]
fn test_builder_rejects_invalid_config() {
    let err = TaskPoolBuilder::new(TaskPoolConfig::new().with_size(0))
        .build_in_memory_pool(builtin_registry())
        .unwrap_err();
    assert!(matches!(err, PoolError::InvalidConfig(_)));
}
