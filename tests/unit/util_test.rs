//! Tests for utility functions

use std::time::Duration;

use prometheus_task_pool::util::{deadline_after, duration_ms, is_past};

#[test]
fn test_duration_ms_truncates() {
    assert_eq!(duration_ms(Duration::from_micros(1_999)), 1);
    assert_eq!(duration_ms(Duration::from_secs(2)), 2_000);
}

#[test]
fn test_huge_timeout_has_no_deadline() {
    let deadline = deadline_after(Duration::from_secs(u64::MAX));
    assert!(deadline.is_none());
    assert!(!is_past(deadline));
}

#[test]
fn test_short_deadline_passes() {
    let deadline = deadline_after(Duration::from_millis(1));
    std::thread::sleep(Duration::from_millis(5));
    assert!(is_past(deadline));
}
