//! Task pool configuration.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::util::serde::{opt_secs, secs};

/// Prefix of the environment variables read by [`TaskPoolConfig::from_env`].
pub const ENV_PREFIX: &str = "TASKPOOL_";

/// Pool configuration. Durations are (de)serialized as float seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskPoolConfig {
    /// Number of worker processes.
    pub size: usize,
    /// Default soft timeout; the task is asked to abort cooperatively.
    #[serde(with = "opt_secs")]
    pub soft_timeout: Option<Duration>,
    /// Default hard timeout; the worker is killed.
    #[serde(with = "opt_secs")]
    pub hard_timeout: Option<Duration>,
    /// Tasks a worker runs before it is replaced. `None` means unlimited.
    pub max_tasks_per_child: Option<u64>,
    /// Tasks allowed to wait for a free worker.
    pub max_queue_depth: usize,
    /// How long `apply_async` blocks on a full queue.
    #[serde(with = "secs")]
    pub put_timeout: Duration,
    /// How long `stop` waits for outstanding tasks before killing workers.
    #[serde(with = "secs")]
    pub drain_timeout: Duration,
    /// How long a worker gets to exit after a shutdown request.
    #[serde(with = "secs")]
    pub join_timeout: Duration,
    /// Timeout supervisor resolution.
    #[serde(with = "secs")]
    pub supervisor_tick: Duration,
    /// Interval of the maintainer's periodic reconcile pass.
    #[serde(with = "secs")]
    pub maintain_interval: Duration,
}

impl Default for TaskPoolConfig {
    fn default() -> Self {
        Self {
            size: num_cpus::get().max(1),
            soft_timeout: None,
            hard_timeout: None,
            max_tasks_per_child: None,
            max_queue_depth: 1024,
            put_timeout: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(30),
            join_timeout: Duration::from_secs(2),
            supervisor_tick: Duration::from_millis(100),
            maintain_interval: Duration::from_secs(1),
        }
    }
}

impl TaskPoolConfig {
    /// Defaults: one worker per CPU, no timeouts, unlimited tasks per child.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of workers.
    #[must_use]
    pub const fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Set the default soft timeout.
    #[must_use]
    pub const fn with_soft_timeout(mut self, timeout: Duration) -> Self {
        self.soft_timeout = Some(timeout);
        self
    }

    /// Set the default hard timeout.
    #[must_use]
    pub const fn with_hard_timeout(mut self, timeout: Duration) -> Self {
        self.hard_timeout = Some(timeout);
        self
    }

    /// Recycle workers after `tasks` tasks.
    #[must_use]
    pub const fn with_max_tasks_per_child(mut self, tasks: u64) -> Self {
        self.max_tasks_per_child = Some(tasks);
        self
    }

    /// Set the pending queue bound.
    #[must_use]
    pub const fn with_max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = depth;
        self
    }

    /// Set how long `apply_async` waits for queue space.
    #[must_use]
    pub const fn with_put_timeout(mut self, timeout: Duration) -> Self {
        self.put_timeout = timeout;
        self
    }

    /// Set how long `stop` waits for outstanding work.
    #[must_use]
    pub const fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Set how long a worker gets to exit gracefully.
    #[must_use]
    pub const fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    /// Set the supervisor tick.
    #[must_use]
    pub const fn with_supervisor_tick(mut self, tick: Duration) -> Self {
        self.supervisor_tick = tick;
        self
    }

    /// Set the maintainer's reconcile interval.
    #[must_use]
    pub const fn with_maintain_interval(mut self, interval: Duration) -> Self {
        self.maintain_interval = interval;
        self
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Describes the first invalid value.
    pub fn validate(&self) -> Result<(), String> {
        if self.size == 0 {
            return Err("size must be greater than 0".into());
        }
        if self.max_queue_depth == 0 {
            return Err("max_queue_depth must be greater than 0".into());
        }
        if self.supervisor_tick.is_zero() {
            return Err("supervisor_tick must be greater than 0".into());
        }
        if self.maintain_interval.is_zero() {
            return Err("maintain_interval must be greater than 0".into());
        }
        if self.max_tasks_per_child == Some(0) {
            return Err("max_tasks_per_child must be greater than 0".into());
        }
        if let (Some(soft), Some(hard)) = (self.soft_timeout, self.hard_timeout) {
            if soft >= hard {
                return Err(format!(
                    "soft_timeout ({soft:?}) must be shorter than hard_timeout ({hard:?})"
                ));
            }
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    ///
    /// # Errors
    ///
    /// Fails on malformed JSON or invalid values.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read `TASKPOOL_*` variables from the environment (and a `.env` file,
    /// if present) over the defaults, then validate.
    ///
    /// # Errors
    ///
    /// Fails on unparsable or invalid values.
    pub fn from_env() -> Result<Self, String> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// [`from_env`](Self::from_env) over an arbitrary variable source.
    ///
    /// Recognized keys: `SIZE`, `SOFT_TIMEOUT`, `HARD_TIMEOUT`,
    /// `MAX_TASKS_PER_CHILD`, `MAX_QUEUE_DEPTH`, `PUT_TIMEOUT`,
    /// `DRAIN_TIMEOUT`, `JOIN_TIMEOUT`, `SUPERVISOR_TICK`,
    /// `MAINTAIN_INTERVAL`, each prefixed with [`ENV_PREFIX`]. Durations are
    /// float seconds.
    ///
    /// # Errors
    ///
    /// Fails on unparsable or invalid values.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let mut cfg = Self::default();

        if let Some(v) = get("SIZE") {
            cfg.size = parse("SIZE", &v)?;
        }
        if let Some(v) = get("SOFT_TIMEOUT") {
            cfg.soft_timeout = Some(parse_secs("SOFT_TIMEOUT", &v)?);
        }
        if let Some(v) = get("HARD_TIMEOUT") {
            cfg.hard_timeout = Some(parse_secs("HARD_TIMEOUT", &v)?);
        }
        if let Some(v) = get("MAX_TASKS_PER_CHILD") {
            cfg.max_tasks_per_child = Some(parse("MAX_TASKS_PER_CHILD", &v)?);
        }
        if let Some(v) = get("MAX_QUEUE_DEPTH") {
            cfg.max_queue_depth = parse("MAX_QUEUE_DEPTH", &v)?;
        }
        if let Some(v) = get("PUT_TIMEOUT") {
            cfg.put_timeout = parse_secs("PUT_TIMEOUT", &v)?;
        }
        if let Some(v) = get("DRAIN_TIMEOUT") {
            cfg.drain_timeout = parse_secs("DRAIN_TIMEOUT", &v)?;
        }
        if let Some(v) = get("JOIN_TIMEOUT") {
            cfg.join_timeout = parse_secs("JOIN_TIMEOUT", &v)?;
        }
        if let Some(v) = get("SUPERVISOR_TICK") {
            cfg.supervisor_tick = parse_secs("SUPERVISOR_TICK", &v)?;
        }
        if let Some(v) = get("MAINTAIN_INTERVAL") {
            cfg.maintain_interval = parse_secs("MAINTAIN_INTERVAL", &v)?;
        }

        cfg.validate()?;
        Ok(cfg)
    }
}

fn parse<T>(name: &str, value: &str) -> Result<T, String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| format!("{ENV_PREFIX}{name}: {e}"))
}

fn parse_secs(name: &str, value: &str) -> Result<Duration, String> {
    let secs: f64 = parse(name, value)?;
    Duration::try_from_secs_f64(secs).map_err(|e| format!("{ENV_PREFIX}{name}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = TaskPoolConfig::new();
        assert!(cfg.size >= 1);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_soft_must_precede_hard() {
        let cfg = TaskPoolConfig::new()
            .with_soft_timeout(Duration::from_secs(10))
            .with_hard_timeout(Duration::from_secs(5));
        assert!(cfg.validate().unwrap_err().contains("soft_timeout"));
    }

    #[test]
    fn test_lookup_overrides_defaults() {
        let vars: HashMap<&str, &str> = [
            ("TASKPOOL_SIZE", "3"),
            ("TASKPOOL_HARD_TIMEOUT", "1.5"),
            ("TASKPOOL_MAX_TASKS_PER_CHILD", "10"),
        ]
        .into_iter()
        .collect();
        let cfg = TaskPoolConfig::from_lookup(|k| vars.get(k).map(|v| (*v).to_string())).unwrap();
        assert_eq!(cfg.size, 3);
        assert_eq!(cfg.hard_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(cfg.max_tasks_per_child, Some(10));
    }

    #[test]
    fn test_lookup_rejects_garbage() {
        let err = TaskPoolConfig::from_lookup(|k| (k == "TASKPOOL_SIZE").then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.starts_with("TASKPOOL_SIZE"));
    }
}
