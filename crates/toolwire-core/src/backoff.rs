//! Reconnect backoff policy.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential backoff with jitter and a hard attempt limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Maximum reconnect attempts before giving up.
    pub max_attempts: u32,
    /// Delay before the first attempt.
    pub base_delay_ms: u64,
    /// Multiplier applied per attempt.
    pub factor: f64,
    /// Upper bound on any single delay.
    pub max_delay_ms: u64,
    /// Relative jitter in `[0, 1]`; 0.2 spreads a delay over ±20%.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 200,
            factor: 2.0,
            max_delay_ms: 10_000,
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Policy without jitter, for deterministic schedules.
    #[must_use]
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        Self {
            max_attempts,
            base_delay_ms: delay_ms,
            factor: 1.0,
            max_delay_ms: delay_ms,
            jitter: 0.0,
        }
    }

    /// Delay before attempt number `attempt` (zero-based), or `None` once
    /// the attempt budget is spent.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let exponent = attempt.min(62) as i32;
        let raw = (self.base_delay_ms as f64) * self.factor.max(1.0).powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64);

        let jitter = self.jitter.clamp(0.0, 1.0);
        let scaled = if jitter > 0.0 {
            let spread = rand::rng().random_range(-jitter..=jitter);
            capped * (1.0 + spread)
        } else {
            capped
        };
        Some(Duration::from_millis(scaled.max(0.0) as u64))
    }

    /// Iterate over every delay in the schedule.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_attempts).filter_map(|attempt| self.delay_for(attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_grows_and_caps() {
        let policy = BackoffPolicy {
            max_attempts: 6,
            base_delay_ms: 100,
            factor: 2.0,
            max_delay_ms: 1_000,
            jitter: 0.0,
        };
        let delays: Vec<u64> = policy
            .delays()
            .map(|d| u64::try_from(d.as_millis()).unwrap())
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
        assert_eq!(policy.delay_for(6), None);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = BackoffPolicy {
            max_attempts: 1,
            base_delay_ms: 1_000,
            factor: 2.0,
            max_delay_ms: 10_000,
            jitter: 0.2,
        };
        for _ in 0..100 {
            let delay = policy.delay_for(0).unwrap().as_millis();
            assert!((799..=1_200).contains(&delay), "delay {delay} out of range");
        }
    }

    #[test]
    fn test_deserializes_with_defaults() {
        let policy: BackoffPolicy = serde_json::from_str(r#"{"max_attempts": 2}"#).unwrap();
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.base_delay_ms, 200);
    }
}
