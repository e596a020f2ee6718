//! Reconnect delay schedule: exponential, capped, with symmetric jitter.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    /// Fraction of the base delay added or removed at random, in `[0, 1)`.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 1_000,
            max_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    /// Delay before reconnect attempt `attempt` (0-based) without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(63) as i32;
        let millis = self.config.initial_ms as f64 * self.config.multiplier.powi(exponent);
        let capped = millis.min(self.config.max_ms as f64);
        Duration::from_millis(capped.round() as u64)
    }

    /// Jittered delay before reconnect attempt `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = self.config.jitter;
        if jitter <= 0.0 {
            return base;
        }
        let factor = 1.0 + rand::rng().random_range(-jitter..=jitter);
        base.mul_f64(factor.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_cap() {
        let backoff = Backoff::new(BackoffConfig::default());
        let expected = [1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000];
        for (attempt, millis) in expected.iter().enumerate() {
            assert_eq!(
                backoff.base_delay(attempt as u32),
                Duration::from_millis(*millis),
                "attempt {attempt}"
            );
        }
        assert_eq!(backoff.base_delay(u32::MAX), Duration::from_millis(30_000));
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        let backoff = Backoff::new(BackoffConfig::default());
        for attempt in 0..8 {
            let base = backoff.base_delay(attempt).as_secs_f64();
            for _ in 0..200 {
                let delay = backoff.delay(attempt).as_secs_f64();
                assert!(
                    delay >= base * 0.8 - 1e-6 && delay <= base * 1.2 + 1e-6,
                    "attempt {attempt}: {delay}s outside ±20% of {base}s"
                );
            }
        }
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let backoff = Backoff::new(BackoffConfig {
            jitter: 0.0,
            ..BackoffConfig::default()
        });
        assert_eq!(backoff.delay(2), Duration::from_secs(4));
    }
}
