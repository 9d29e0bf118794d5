//! Point-in-time snapshot of a pool.

use std::fmt;
use std::time::Duration;

use serde::{Serialize, Serializer};

use super::state::Lifecycle;

/// Per-worker task limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskLimit {
    /// Workers are never recycled for having run too many tasks.
    Unbounded,
    /// A worker is replaced after this many tasks.
    PerChild(u64),
}

impl From<Option<u64>> for TaskLimit {
    fn from(limit: Option<u64>) -> Self {
        limit.map_or(Self::Unbounded, Self::PerChild)
    }
}

impl fmt::Display for TaskLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unbounded => f.write_str("N/A"),
            Self::PerChild(n) => write!(f, "{n}"),
        }
    }
}

impl Serialize for TaskLimit {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Unbounded => serializer.serialize_str("N/A"),
            Self::PerChild(n) => serializer.serialize_u64(*n),
        }
    }
}

/// Pool statistics as returned by [`TaskPool::info`](super::TaskPool::info).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolInfo {
    /// Target number of workers.
    #[serde(rename = "max-concurrency")]
    pub max_concurrency: usize,
    /// Per-worker task limit.
    #[serde(rename = "max-tasks-per-child")]
    pub max_tasks_per_child: TaskLimit,
    /// Default `(soft, hard)` timeouts.
    #[serde(with = "timeouts")]
    pub timeouts: (Option<Duration>, Option<Duration>),
    /// Pids of live workers, in worker order.
    pub processes: Vec<u32>,
    /// Current lifecycle.
    pub lifecycle: Lifecycle,
    /// Tasks waiting for a worker.
    pub pending: usize,
    /// Tasks currently executing.
    #[serde(rename = "in-flight")]
    pub in_flight: usize,
}

mod timeouts {
    use std::time::Duration;

    use serde::ser::SerializeTuple;
    use serde::Serializer;

    #[allow(clippy::ref_option, clippy::trivially_copy_pass_by_ref)]
    pub fn serialize<S: Serializer>(
        value: &(Option<Duration>, Option<Duration>),
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(2)?;
        tuple.serialize_element(&value.0.map(|d| d.as_secs_f64()))?;
        tuple.serialize_element(&value.1.map(|d| d.as_secs_f64()))?;
        tuple.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_limit_display() {
        assert_eq!(TaskLimit::from(None).to_string(), "N/A");
        assert_eq!(TaskLimit::from(Some(3)).to_string(), "3");
    }

    #[test]
    fn test_info_serializes_with_dashed_keys() {
        let info = PoolInfo {
            max_concurrency: 4,
            max_tasks_per_child: TaskLimit::Unbounded,
            timeouts: (Some(Duration::from_secs(5)), None),
            processes: vec![11, 12],
            lifecycle: Lifecycle::Running,
            pending: 0,
            in_flight: 1,
        };
        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["max-concurrency"], json!(4));
        assert_eq!(value["max-tasks-per-child"], json!("N/A"));
        assert_eq!(value["timeouts"], json!([5.0, null]));
        assert_eq!(value["processes"], json!([11, 12]));
        assert_eq!(value["lifecycle"], json!("RUNNING"));
    }
}
