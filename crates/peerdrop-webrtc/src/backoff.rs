//! Exponential backoff for relay reconnects
//!
//! Delays start at `base`, double per attempt and are capped at `max`.
//! After `max_attempts` delays the backoff is exhausted.

use std::time::Duration;

use crate::types::ReconnectPolicy;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max,
            max_attempts,
            attempt: 0,
        }
    }

    /// Delay before the next attempt, or `None` once attempts are used up
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        self.attempt += 1;
        Some(self.base.saturating_mul(factor).min(self.max))
    }

    /// Attempts handed out so far
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl From<&ReconnectPolicy> for Backoff {
    fn from(policy: &ReconnectPolicy) -> Self {
        Self::new(policy.base_delay, policy.max_delay, policy.max_attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double_and_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(3), 6);
        let delays: Vec<u64> = std::iter::from_fn(|| backoff.next_delay())
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![500, 1000, 2000, 3000, 3000, 3000]);
        assert!(backoff.is_exhausted());
        assert_eq!(backoff.next_delay(), None);
    }

    #[test]
    fn test_reset() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1), 2);
        backoff.next_delay();
        backoff.next_delay();
        assert!(backoff.is_exhausted());
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_zero_attempts() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1), 0);
        assert_eq!(backoff.next_delay(), None);
    }

    #[test]
    fn test_large_attempt_count_saturates() {
        let mut backoff = Backoff::new(Duration::from_millis(1), Duration::from_secs(60), 40);
        let last = std::iter::from_fn(|| backoff.next_delay()).last();
        assert_eq!(last, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_from_policy() {
        let backoff = Backoff::from(&ReconnectPolicy::default());
        assert_eq!(backoff.attempt(), 0);
        assert!(!backoff.is_exhausted());
    }
}
