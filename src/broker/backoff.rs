//! Reconnect backoff.
//!
//! Exponential growth from a base delay, capped, with 50-100% jitter so that
//! a fleet of clients does not reconnect in lockstep after a broker restart.

use std::time::Duration;

/// Exponential backoff state for one reconnect loop.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    min_delay: Duration,
    max_delay: Duration,
    attempt: u32,
}

impl ReconnectBackoff {
    /// Create a backoff between `min_delay` and `max_delay`.
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            min_delay,
            max_delay: max_delay.max(min_delay),
            attempt: 0,
        }
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Forget previous failures after a successful connect.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delay before the next attempt, without jitter.
    pub fn base_delay(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(16));
        self.min_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before the next attempt; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay();
        self.attempt = self.attempt.saturating_add(1);

        let jitter_factor = 0.5 + (rand::random::<f64>() * 0.5);
        base.mul_f64(jitter_factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_delay_doubles_and_caps() {
        let mut backoff = ReconnectBackoff::new(Duration::from_millis(100), Duration::from_millis(1000));
        let mut bases = Vec::new();
        for _ in 0..6 {
            bases.push(backoff.base_delay().as_millis());
            backoff.next_delay();
        }
        assert_eq!(bases, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn test_jitter_stays_within_half_to_full() {
        let mut backoff = ReconnectBackoff::new(Duration::from_millis(200), Duration::from_secs(1));
        for _ in 0..20 {
            let base = backoff.base_delay();
            let delay = backoff.next_delay();
            assert!(delay >= base / 2 && delay <= base);
        }
    }

    #[test]
    fn test_reset() {
        let mut backoff = ReconnectBackoff::new(Duration::from_millis(100), Duration::from_secs(5));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.base_delay(), Duration::from_millis(100));
    }
}
