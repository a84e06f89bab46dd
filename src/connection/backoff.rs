//! Reconnection backoff policy
//!
//! Exponential growth from a configured base, capped, with randomized
//! jitter so a fleet losing its operator does not reconnect in lockstep.

use rand::Rng;
use std::time::Duration;

/// Fraction of the raw delay used as the jitter band (±20%)
const JITTER_FRACTION: f64 = 0.2;

/// Exponential backoff with jitter
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            current: base,
        }
    }

    /// The raw (pre-jitter) delay the next failure will wait
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Consume the current delay and double it for the next failure.
    /// Returns the jittered delay to sleep.
    pub fn next_delay(&mut self) -> Duration {
        let raw = self.current;
        self.current = std::cmp::min(raw.saturating_mul(2), self.cap);
        Self::jitter(raw)
    }

    /// Reset to the base delay after a successful connection
    pub fn reset(&mut self) {
        self.current = self.base;
    }

    fn jitter(raw: Duration) -> Duration {
        let factor = rand::thread_rng().gen_range(1.0 - JITTER_FRACTION..=1.0 + JITTER_FRACTION);
        raw.mul_f64(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubling_sequence() {
        let mut backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(60));

        // Raw delays: 5s, 10s, 20s across three consecutive failures
        for expected in [5, 10, 20] {
            assert_eq!(backoff.current(), Duration::from_secs(expected));
            backoff.next_delay();
        }
    }

    #[test]
    fn test_cap_at_sixty_seconds() {
        let mut backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(60));

        for _ in 0..10 {
            backoff.next_delay();
        }
        assert_eq!(backoff.current(), Duration::from_secs(60));

        // Stays at the cap
        backoff.next_delay();
        assert_eq!(backoff.current(), Duration::from_secs(60));
    }

    #[test]
    fn test_monotonically_non_decreasing() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(60));

        let mut previous = backoff.current();
        for _ in 0..20 {
            backoff.next_delay();
            assert!(backoff.current() >= previous);
            previous = backoff.current();
        }
    }

    #[test]
    fn test_reset_after_success() {
        let mut backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(60));

        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.current(), Duration::from_secs(20));

        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_within_band() {
        let mut backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(60));

        for _ in 0..100 {
            let jittered = backoff.next_delay();
            let raw = Duration::from_secs(5);
            assert!(jittered >= raw.mul_f64(0.8), "jittered delay below band: {jittered:?}");
            assert!(jittered <= raw.mul_f64(1.2), "jittered delay above band: {jittered:?}");
            backoff.reset();
        }
    }
}
