//! Reconnect backoff for the control connection.
//!
//! The delay before attempt `n` is `min(5 * 2^n, 60)` seconds. The
//! attempt counter lives in process memory only; a restarted agent starts
//! again at 5 seconds.

use std::time::Duration;

/// Base delay for the first retry.
pub const BASE_DELAY_SECS: u64 = 5;

/// Upper bound for any single delay.
pub const MAX_DELAY_SECS: u64 = 60;

/// Delay to wait before reconnect attempt `attempt` (0-based).
pub fn reconnect_delay(attempt: u32) -> Duration {
    // 5 * 2^4 = 80 already exceeds the cap; clamping the shift also
    // keeps large attempt counts from overflowing.
    let factor = 1u64 << attempt.min(5);
    Duration::from_secs((BASE_DELAY_SECS * factor).min(MAX_DELAY_SECS))
}

/// Attempt counter driven by the agent's main loop.
#[derive(Debug, Clone, Default)]
pub struct ReconnectBackoff {
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay for the upcoming attempt, without consuming it.
    pub fn current_delay(&self) -> Duration {
        reconnect_delay(self.attempt)
    }

    /// Record a failed attempt.
    pub fn record_failure(&mut self) {
        self.attempt = self.attempt.saturating_add(1);
    }

    /// Record a successful reconnect.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_formula_holds() {
        for n in 0..40u32 {
            let expected = (5u128 * 2u128.pow(n)).min(60) as u64;
            assert_eq!(reconnect_delay(n), Duration::from_secs(expected), "attempt {n}");
        }
        assert_eq!(reconnect_delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn failed_sequence_then_reset() {
        let mut backoff = ReconnectBackoff::new();
        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(backoff.current_delay().as_secs());
            backoff.record_failure();
        }
        assert_eq!(seen, vec![5, 10, 20, 40, 60, 60, 60]);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.current_delay(), Duration::from_secs(5));
    }
}
