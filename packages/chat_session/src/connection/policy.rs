//! Reconnect backoff.

use rand::Rng;
use std::time::Duration;

use crate::config::ConnectionConfig;

/// Exponential backoff with downward jitter, capped both in delay and in
/// number of attempts.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    base: Duration,
    max: Duration,
    jitter: f64,
    max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(base: Duration, max: Duration, jitter: f64, max_attempts: u32) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter: jitter.clamp(0.0, 1.0),
            max_attempts,
        }
    }

    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self::new(
            config.reconnect_base,
            config.reconnect_max,
            config.reconnect_jitter,
            config.max_reconnect_attempts,
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether another attempt is allowed after `failed` consecutive failures.
    pub fn allows(&self, failed: u32) -> bool {
        failed < self.max_attempts
    }

    /// Un-jittered delay before attempt number `attempt` (0-based).
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Delay before attempt number `attempt`, shortened by a random fraction
    /// of at most `jitter`. Never exceeds [`ceiling`](Self::ceiling).
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        if self.jitter == 0.0 {
            return ceiling;
        }
        let cut = rand::rng().random_range(0.0..=self.jitter);
        ceiling.mul_f64(1.0 - cut)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&ConnectionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceiling_doubles_then_caps() {
        let p = ReconnectPolicy::default();
        assert_eq!(p.ceiling(0), Duration::from_millis(1000));
        assert_eq!(p.ceiling(1), Duration::from_millis(2000));
        assert_eq!(p.ceiling(2), Duration::from_millis(3000));
        assert_eq!(p.ceiling(10), Duration::from_millis(3000));
        assert_eq!(p.ceiling(u32::MAX), Duration::from_millis(3000));
    }

    #[test]
    fn jittered_delay_stays_in_band() {
        let p = ReconnectPolicy::default();
        for attempt in 0..6 {
            for _ in 0..50 {
                let d = p.delay(attempt);
                let ceiling = p.ceiling(attempt);
                assert!(d <= ceiling, "{d:?} > {ceiling:?}");
                assert!(d >= ceiling.mul_f64(0.5), "{d:?} below half of {ceiling:?}");
            }
        }
    }

    #[test]
    fn first_retry_is_within_a_second() {
        let p = ReconnectPolicy::default();
        for _ in 0..100 {
            assert!(p.delay(0) <= Duration::from_secs(1));
        }
    }

    #[test]
    fn attempts_are_bounded() {
        let p = ReconnectPolicy::default();
        assert_eq!(p.max_attempts(), 5);
        assert!(p.allows(4));
        assert!(!p.allows(5));
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let p = ReconnectPolicy::new(
            Duration::from_millis(100),
            Duration::from_millis(250),
            0.0,
            3,
        );
        assert_eq!(p.delay(0), Duration::from_millis(100));
        assert_eq!(p.delay(1), Duration::from_millis(200));
        assert_eq!(p.delay(2), Duration::from_millis(250));
    }
}
