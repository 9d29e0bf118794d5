//! Stock worker process for `prometheus_task_pool`.
//!
//! Serves the built-in targets over stdin/stdout. On top of those it offers
//! `crash`, which exits the process immediately with the given code
//! (default 3), for exercising crash recovery.

use prometheus_task_pool::core::AppResult;
use prometheus_task_pool::util::init_worker_tracing;
use prometheus_task_pool::worker::{builtin_registry, run_stdio};
use serde_json::Value;

/// Exit code used by `crash` when none is given.
const DEFAULT_CRASH_CODE: i32 = 3;

fn main() -> AppResult<()> {
    init_worker_tracing();

    let registry = builtin_registry().with("crash", |_, args, _| {
        let code = args
            .first()
            .and_then(Value::as_i64)
            .and_then(|c| i32::try_from(c).ok())
            .unwrap_or(DEFAULT_CRASH_CODE);
        tracing::warn!(code, "crash requested");
        std::process::exit(code)
    });

    run_stdio(registry)
}
