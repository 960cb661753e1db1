//! Retry utilities: backoff builders for connections and loop error recovery.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};

/// Backoff for establishing store connections at startup.
///
/// - Min delay: 100ms
/// - Max delay: 30s
/// - Max attempts: 30
/// - Jitter enabled
pub fn connection_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(30))
        .with_max_times(30)
        .with_jitter()
}

/// Backoff between failed iterations of a background loop.
///
/// Unbounded: loops retry forever, so callers keep the iterator and rebuild
/// it after a successful iteration.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Jitter enabled
pub fn loop_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .without_max_times()
        .with_jitter()
}

/// Capped delay sequence for a background loop.
///
/// Wraps a backon iterator so a loop can ask for the next delay after each
/// failure and `reset()` once an iteration succeeds.
pub struct LoopBackoff {
    builder: ExponentialBuilder,
    current: backon::ExponentialBackoff,
    max_delay: Duration,
}

impl LoopBackoff {
    pub fn new(builder: ExponentialBuilder, max_delay: Duration) -> Self {
        Self {
            current: builder.clone().build(),
            builder,
            max_delay,
        }
    }

    /// Delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.current.next().unwrap_or(self.max_delay)
    }

    /// The longest pause this backoff produces.
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Start over from the minimum delay.
    pub fn reset(&mut self) {
        self.current = self.builder.clone().build();
    }
}

impl Default for LoopBackoff {
    fn default() -> Self {
        Self::new(loop_backoff(), Duration::from_secs(5))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loop_backoff_is_capped() {
        let mut backoff = LoopBackoff::default();
        for _ in 0..50 {
            // Jitter can at most double the capped delay.
            assert!(backoff.next_delay() <= Duration::from_secs(10));
        }
    }

    #[test]
    fn test_loop_backoff_reset_starts_small() {
        let mut backoff = LoopBackoff::default();
        for _ in 0..20 {
            backoff.next_delay();
        }
        backoff.reset();
        assert!(backoff.next_delay() < Duration::from_secs(1));
    }
}
