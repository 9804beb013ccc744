//! Reconnect backoff.
//!
//! The delay after the N-th consecutive failure is
//! `min(initial * 2^(N-1), max)`. A successful connection resets the count.

use std::time::Duration;

use crate::config::ReconnectConfig;

/// Tracks consecutive connect failures and yields retry delays.
#[derive(Debug, Clone)]
pub struct ReconnectManager {
    config: ReconnectConfig,
    attempts: u32,
}

impl ReconnectManager {
    /// Create a manager with no recorded failures.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    /// Delay to wait after the `attempt`-th consecutive failure (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let max = self.config.max_delay();
        self.config
            .initial_delay()
            .checked_mul(1u32 << exponent)
            .map_or(max, |d| d.min(max))
    }

    /// Record a failed attempt and return the delay before the next one.
    pub fn record_failure(&mut self) -> Duration {
        self.attempts = self.attempts.saturating_add(1);
        self.delay_for(self.attempts)
    }

    /// Forget recorded failures after a successful connection.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Consecutive failed attempts.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Returns true while failures are still within the short-interval phase.
    #[must_use]
    pub const fn in_fast_phase(&self) -> bool {
        self.attempts <= self.config.fast_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(initial_ms: u64, max_ms: u64) -> ReconnectManager {
        ReconnectManager::new(ReconnectConfig {
            initial_delay_ms: initial_ms,
            max_delay_ms: max_ms,
            fast_attempts: 3,
        })
    }

    #[test]
    fn delays_double_until_capped() {
        let m = manager(5_000, 30_000);
        assert_eq!(m.delay_for(1), Duration::from_secs(5));
        assert_eq!(m.delay_for(2), Duration::from_secs(10));
        assert_eq!(m.delay_for(3), Duration::from_secs(20));
        assert_eq!(m.delay_for(4), Duration::from_secs(30));
        assert_eq!(m.delay_for(50), Duration::from_secs(30));
    }

    #[test]
    fn delays_are_monotonic() {
        let m = manager(1_000, 60_000);
        let mut last = Duration::ZERO;
        for attempt in 1..40 {
            let delay = m.delay_for(attempt);
            assert!(delay >= last);
            assert!(delay <= Duration::from_secs(60));
            last = delay;
        }
    }

    #[test]
    fn reset_after_success() {
        let mut m = manager(5_000, 30_000);
        assert_eq!(m.record_failure(), Duration::from_secs(5));
        assert_eq!(m.record_failure(), Duration::from_secs(10));
        assert!(m.in_fast_phase());
        m.record_failure();
        m.record_failure();
        assert!(!m.in_fast_phase());
        assert_eq!(m.attempts(), 4);

        m.reset();
        assert_eq!(m.attempts(), 0);
        assert_eq!(m.record_failure(), Duration::from_secs(5));
    }
}
