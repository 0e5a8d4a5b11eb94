//! Backoff policies for broker recovery.
//!
//! Built on `backon`. Two curves share the same shape (start at the
//! configured minimum, double, cap at the maximum): connection recovery
//! retries forever, missing-queue recovery is bounded by an attempt budget.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Unbounded backoff for connection recovery.
///
/// Broker outage is assumed transient; this is the one intentionally
/// unbounded retry in the crate.
pub fn recovery_backoff(min: Duration, max: Duration) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(min)
        .with_max_delay(max)
        .without_max_times()
}

/// Bounded backoff for opening a consumer on a queue that may not exist yet.
///
/// `attempts` counts retries after the first try; exceeding it surfaces the
/// error to the caller instead of waiting forever for a queue that may
/// never appear.
pub fn consume_backoff(min: Duration, max: Duration, attempts: u32) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(min)
        .with_max_delay(max)
        .with_max_times(attempts as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use backon::BackoffBuilder;

    #[test]
    fn test_recovery_backoff_doubles_and_caps() {
        let mut iter = recovery_backoff(Duration::from_secs(1), Duration::from_secs(4)).build();
        assert_eq!(iter.next(), Some(Duration::from_secs(1)));
        assert_eq!(iter.next(), Some(Duration::from_secs(2)));
        assert_eq!(iter.next(), Some(Duration::from_secs(4)));
        // Capped from here on.
        assert_eq!(iter.next(), Some(Duration::from_secs(4)));
        assert_eq!(iter.next(), Some(Duration::from_secs(4)));
    }

    #[test]
    fn test_consume_backoff_is_bounded() {
        let delays: Vec<_> =
            consume_backoff(Duration::from_millis(10), Duration::from_secs(1), 3)
                .build()
                .collect();
        assert_eq!(delays.len(), 3);
        assert_eq!(delays[0], Duration::from_millis(10));
        assert_eq!(delays[1], Duration::from_millis(20));
    }
}
