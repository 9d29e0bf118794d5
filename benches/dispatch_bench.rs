//! Benchmarks for the task pool.
//!
//! Benchmarks cover:
//! - Round trip of a single task through an in-memory pool
//! - Throughput of a batch of tasks at several pool sizes
//! - Timeout classification

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::time::Duration;

use prometheus_task_pool::config::TaskPoolConfig;
use prometheus_task_pool::core::{classify, AsyncResult, TaskPool};
use prometheus_task_pool::infra::InMemoryBackend;
use prometheus_task_pool::worker::{builtin_registry, Kwargs};
use serde_json::json;

const WAIT: Duration = Duration::from_secs(10);

// ============================================================================
// Helper Functions
// ============================================================================

fn started_pool(size: usize) -> TaskPool<InMemoryBackend> {
    let config = TaskPoolConfig::new().with_size(size).with_max_queue_depth(100_000);
    let pool = TaskPool::new(config, InMemoryBackend::new(builtin_registry())).unwrap();
    pool.start().unwrap();
    pool
}

// ============================================================================
// Benchmarks
// ============================================================================

fn bench_round_trip(c: &mut Criterion) {
    let pool = started_pool(1);
    c.bench_function("round_trip_identity", |b| {
        b.iter(|| {
            let result = pool
                .apply_async("identity", vec![json!(1)], Kwargs::new(), |_| {})
                .unwrap();
            black_box(result.wait(WAIT).unwrap())
        });
    });
    pool.stop();
}

fn bench_batch_throughput(c: &mut Criterion) {
    const BATCH: u64 = 256;
    let mut group = c.benchmark_group("batch_throughput");
    group.throughput(Throughput::Elements(BATCH));

    for size in [1_usize, 4, 8] {
        let pool = started_pool(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                let results: Vec<AsyncResult> = (0..BATCH)
                    .map(|i| {
                        pool.apply_async("add", vec![json!(i), json!(1)], Kwargs::new(), |_| {})
                            .unwrap()
                    })
                    .collect();
                for result in &results {
                    black_box(result.wait(WAIT).unwrap()).unwrap();
                }
            });
        });
        pool.stop();
    }
    group.finish();
}

fn bench_classify(c: &mut Criterion) {
    let soft = Some(Duration::from_secs(5));
    let hard = Some(Duration::from_secs(10));
    c.bench_function("classify_timeouts", |b| {
        b.iter(|| {
            for ms in (0..12_000).step_by(500) {
                black_box(classify(black_box(Duration::from_millis(ms)), soft, hard));
            }
        });
    });
}

criterion_group!(benches, bench_round_trip, bench_batch_throughput, bench_classify);
criterion_main!(benches);
