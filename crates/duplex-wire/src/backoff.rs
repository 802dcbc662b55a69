//! Reconnect policy for the supervisor.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff with a cap and optional jitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub initial_delay_ms: u64,
    /// Upper bound for a single wait. Default: 30 s.
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Adds up to ±25% jitter to each delay.
    pub jitter: bool,
    /// 0 = retry forever.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
            max_attempts: 0,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_delay_ms as f64;
        let delay = base * self.multiplier.max(1.0).powi(attempt.saturating_sub(1).min(64) as i32);
        let delay = delay.min(self.max_delay_ms as f64);
        let delay = if self.jitter {
            (delay + rand_jitter(delay * 0.25)).clamp(0.0, self.max_delay_ms as f64)
        } else {
            delay
        };
        Duration::from_millis(delay as u64)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt < self.max_attempts
    }
}

/// Attempt counter driven by the supervisor loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay before the next attempt, or `None` once the attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.policy.should_retry(self.attempt) {
            return None;
        }
        self.attempt += 1;
        Some(self.policy.delay_for(self.attempt))
    }

    /// Call after a connection that came up cleanly.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Uniform value in `-range..=range`.
fn rand_jitter(range: f64) -> f64 {
    if range <= 0.0 {
        return 0.0;
    }
    rand::thread_rng().gen_range(-range..=range)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> ReconnectPolicy {
        ReconnectPolicy {
            jitter: false,
            ..Default::default()
        }
    }

    #[test]
    fn delays_grow_and_cap() {
        let policy = no_jitter();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(10), Duration::from_secs(30));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let policy = ReconnectPolicy::default();
        for attempt in 1..8 {
            let d = policy.delay_for(attempt).as_millis() as f64;
            let base = (1000.0 * 2f64.powi(attempt as i32 - 1)).min(30_000.0);
            assert!(d >= base * 0.75 - 1.0 && d <= (base * 1.25).min(30_000.0) + 1.0);
        }
    }

    #[test]
    fn jitter_varies_and_handles_zero_range() {
        assert_eq!(rand_jitter(0.0), 0.0);
        let samples: Vec<f64> = (0..32).map(|_| rand_jitter(250.0)).collect();
        assert!(samples.iter().all(|j| (-250.0..=250.0).contains(j)));
        // Back-to-back calls must not collapse to one value.
        assert!(samples.iter().any(|j| (j - samples[0]).abs() > f64::EPSILON));
    }

    #[test]
    fn backoff_respects_budget_and_reset() {
        let mut backoff = Backoff::new(ReconnectPolicy {
            max_attempts: 2,
            ..no_jitter()
        });
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(2)));
        assert_eq!(backoff.next_delay(), None);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
    }
}
