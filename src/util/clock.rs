//! Time helpers.

use std::time::{Duration, Instant};

/// Whole milliseconds in a duration, saturating at `u64::MAX`.
#[must_use]
pub fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Instant `timeout` from now, or `None` when that is too far out to
/// represent. Callers treat `None` as "wait without a deadline".
#[must_use]
pub fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

/// Whether `deadline` has passed. A missing deadline never passes.
#[must_use]
pub fn is_past(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|deadline| Instant::now() >= deadline)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_ms() {
        assert_eq!(duration_ms(Duration::from_millis(1500)), 1500);
        assert_eq!(duration_ms(Duration::MAX), u64::MAX);
    }

    #[test]
    fn test_deadline_after_saturates_to_none() {
        assert!(deadline_after(Duration::MAX).is_none());
        assert!(!is_past(deadline_after(Duration::MAX)));
        assert!(deadline_after(Duration::from_secs(1)).is_some());
        assert!(is_past(deadline_after(Duration::ZERO)));
    }
}
