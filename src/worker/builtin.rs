//! Built-in targets shipped with every worker.
//!
//! Handy for smoke tests, benchmarks and the bundled `taskpool-worker`
//! binary. Durations are given in seconds, either as the first positional
//! argument or as the `secs` keyword.

use std::thread;
use std::time::Duration;

use serde_json::{json, Value};

use super::protocol::{Args, Kwargs};
use super::runtime::{TaskContext, TaskRegistry};
use crate::core::TaskError;
use crate::util::{deadline_after, is_past};

/// Registry with the built-in targets:
///
/// | target | behaviour |
/// |---|---|
/// | `identity` | returns its first argument |
/// | `add` | sums numeric arguments |
/// | `kwargs` | returns its keyword arguments |
/// | `pid` | returns the executing worker's pid |
/// | `sleep` | sleeps `secs`, aborting on soft timeout |
/// | `spin` | busy loop for `secs`, checking the soft deadline |
/// | `hang` | sleeps `secs` (default 60) ignoring soft timeouts |
/// | `fail` | returns an application error |
/// | `panic` | panics |
#[must_use]
pub fn builtin_registry() -> TaskRegistry {
    TaskRegistry::new()
        .with("identity", |_, args, _| Ok(args.first().cloned().unwrap_or(Value::Null)))
        .with("add", |_, args, _| add(args))
        .with("kwargs", |_, _, kwargs| Ok(Value::Object(kwargs.clone())))
        .with("pid", |ctx, _, _| Ok(json!(ctx.pid())))
        .with("sleep", |ctx, args, kwargs| {
            let duration = seconds(args, kwargs, 0.0)?;
            ctx.sleep(duration)?;
            Ok(json!(duration.as_secs_f64()))
        })
        .with("spin", spin)
        .with("hang", |_, args, kwargs| {
            thread::sleep(seconds(args, kwargs, 60.0)?);
            Ok(Value::Null)
        })
        .with("fail", |_, args, _| {
            let message = args
                .first()
                .and_then(Value::as_str)
                .unwrap_or("failure requested");
            Err(TaskError::Failed(message.to_string()))
        })
        .with("panic", |_, _, _| panic!("panic requested"))
}

fn add(args: &Args) -> Result<Value, TaskError> {
    if args.iter().all(Value::is_i64) {
        return Ok(json!(args.iter().filter_map(Value::as_i64).sum::<i64>()));
    }
    let mut total = 0.0;
    for arg in args {
        total += arg
            .as_f64()
            .ok_or_else(|| TaskError::Failed(format!("add: not a number: {arg}")))?;
    }
    Ok(json!(total))
}

fn spin(ctx: &TaskContext, args: &Args, kwargs: &Kwargs) -> Result<Value, TaskError> {
    let deadline = deadline_after(seconds(args, kwargs, 1.0)?);
    let mut iterations: u64 = 0;
    while !is_past(deadline) {
        ctx.check()?;
        iterations = iterations.wrapping_add(1);
        thread::yield_now();
    }
    Ok(json!(iterations))
}

fn seconds(args: &Args, kwargs: &Kwargs, default: f64) -> Result<Duration, TaskError> {
    let value = kwargs.get("secs").or_else(|| args.first());
    let secs = match value {
        None => default,
        Some(v) => v
            .as_f64()
            .ok_or_else(|| TaskError::Failed(format!("expected seconds, got {v}")))?,
    };
    Duration::try_from_secs_f64(secs).map_err(|e| TaskError::Failed(format!("invalid duration {secs}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(target: &str, args: Args, kwargs: Kwargs) -> Result<Value, TaskError> {
        let registry = builtin_registry();
        let ctx = TaskContext::new(1, 77);
        registry.get(target).unwrap()(&ctx, &args, &kwargs)
    }

    #[test]
    fn test_identity_and_pid() {
        assert_eq!(call("identity", vec![json!(2)], Kwargs::new()), Ok(json!(2)));
        assert_eq!(call("identity", vec![], Kwargs::new()), Ok(Value::Null));
        assert_eq!(call("pid", vec![], Kwargs::new()), Ok(json!(77)));
    }

    #[test]
    fn test_add_integers_and_floats() {
        assert_eq!(call("add", vec![json!(2), json!(3)], Kwargs::new()), Ok(json!(5)));
        assert_eq!(call("add", vec![json!(1.5), json!(1)], Kwargs::new()), Ok(json!(2.5)));
        assert!(call("add", vec![json!("x")], Kwargs::new()).is_err());
    }

    #[test]
    fn test_sleep_reads_keyword_seconds() {
        let mut kwargs = Kwargs::new();
        kwargs.insert("secs".into(), json!(0.01));
        assert_eq!(call("sleep", vec![], kwargs), Ok(json!(0.01)));
        assert!(call("sleep", vec![json!(-1)], Kwargs::new()).is_err());
        assert!(call("sleep", vec![json!(1e30)], Kwargs::new()).is_err());
    }

    #[test]
    fn test_unbounded_sleep_still_observes_soft_timeout() {
        let ctx = TaskContext::new(1, 1);
        ctx.signal_soft_timeout();
        assert_eq!(ctx.sleep(Duration::MAX), Err(TaskError::SoftTimeLimitExceeded));
    }

    #[test]
    fn test_fail_carries_message() {
        assert_eq!(
            call("fail", vec![json!("nope")], Kwargs::new()),
            Err(TaskError::Failed("nope".into()))
        );
    }

    #[test]
    fn test_spin_aborts_on_soft_timeout() {
        let registry = builtin_registry();
        let ctx = TaskContext::new(1, 1);
        ctx.signal_soft_timeout();
        let outcome = registry.get("spin").unwrap()(&ctx, &vec![json!(5)], &Kwargs::new());
        assert_eq!(outcome, Err(TaskError::SoftTimeLimitExceeded));
    }
}
