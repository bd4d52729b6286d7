//! Bounded retry with exponential backoff
//!
//! Shared by the distributed lock and the node's dialer. Delays double per
//! attempt (capped at 2^10 times the base), are clamped to `max_delay_ms`
//! and get up to `jitter_ratio` of random spread so contending nodes do not
//! retry in lockstep.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts including the first one
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of the computed delay added at random, 0.0 disables jitter
    pub jitter_ratio: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms: base_delay_ms * 60,
            jitter_ratio: 0.2,
        }
    }

    /// Backoff before retry number `attempt` (0-based), without jitter
    pub fn calculate_delay(&self, attempt: u32) -> u64 {
        let delay = self.base_delay_ms.saturating_mul(2_u64.pow(attempt.min(10)));
        delay.min(self.max_delay_ms)
    }

    /// Backoff before retry number `attempt` with jitter applied
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.calculate_delay(attempt);
        let spread = (base as f64 * self.jitter_ratio.clamp(0.0, 1.0)) as u64;
        let jitter = if spread > 0 {
            rand::thread_rng().gen_range(0..=spread)
        } else {
            0
        };
        Duration::from_millis(base + jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, 100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 20,
            base_delay_ms: 50,
            max_delay_ms: 1_000,
            jitter_ratio: 0.0,
        };
        assert_eq!(policy.calculate_delay(0), 50);
        assert_eq!(policy.calculate_delay(1), 100);
        assert_eq!(policy.calculate_delay(2), 200);
        assert_eq!(policy.calculate_delay(5), 1_000);
        assert_eq!(policy.calculate_delay(40), 1_000);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_stays_within_ratio() {
        let policy = RetryPolicy::new(3, 100);
        for _ in 0..100 {
            let delay = policy.delay_for(0).as_millis() as u64;
            assert!((100..=120).contains(&delay), "delay {delay}");
        }
    }
}
