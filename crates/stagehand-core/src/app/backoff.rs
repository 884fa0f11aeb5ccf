//! Idle backoff: how long the claim loop sleeps when nothing was claimed.

use std::time::Duration;

use serde::Deserialize;

/// Exponential backoff, capped.
///
/// delay = base * multiplier^(idle_rounds - 1), at most `max`
///
/// Example with base=100ms, multiplier=2.0, max=2s:
/// - round 1: 100ms
/// - round 2: 200ms
/// - round 3: 400ms
/// - round 6+: 2s
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub multiplier: f64,
    pub max_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: 100,
            multiplier: 2.0,
            max_ms: 2_000,
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for(&self, idle_rounds: u32) -> Duration {
        let base = self.base_ms as f64;
        let exponent = idle_rounds.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_ms = (base * self.multiplier.powi(exponent)).min(self.max_ms as f64);
        Duration::from_millis(delay_ms as u64)
    }
}

/// Stateful wrapper: counts idle rounds, resets after useful work.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    idle_rounds: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            idle_rounds: 0,
        }
    }

    /// Another idle round; returns how long to sleep.
    pub fn next_delay(&mut self) -> Duration {
        self.idle_rounds = self.idle_rounds.saturating_add(1);
        self.policy.delay_for(self.idle_rounds)
    }

    pub fn reset(&mut self) {
        self.idle_rounds = 0;
    }

    pub fn idle_rounds(&self) -> u32 {
        self.idle_rounds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_has_reasonable_values() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.multiplier, 2.0);
    }

    #[test]
    fn exponential_backoff_increases_then_caps() {
        let mut backoff = Backoff::new(BackoffPolicy {
            base_ms: 100,
            multiplier: 2.0,
            max_ms: 1_000,
        });

        let delays: Vec<Duration> = (0..6).map(|_| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            [100, 200, 400, 800, 1_000, 1_000].map(Duration::from_millis).to_vec()
        );

        backoff.reset();
        assert_eq!(backoff.idle_rounds(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn huge_round_counts_do_not_overflow() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(2_000));
    }
}
