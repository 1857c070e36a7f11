//! Exponential backoff policy.

use std::env::VarError;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use opsbot_core::config::parse_or;
use opsbot_core::ConfigError;

/// Backoff and attempt budget for queued retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    /// Attempts allowed before a record is dead-lettered.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_secs: 60,
            max_delay_secs: 3600,
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(base_delay_secs: u64, max_delay_secs: u64, max_attempts: u32) -> Self {
        Self {
            base_delay_secs,
            max_delay_secs,
            max_attempts,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_reader(|key| std::env::var(key))
    }

    pub fn from_reader<F>(reader: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Result<String, VarError>,
    {
        let defaults = Self::default();
        Ok(Self {
            base_delay_secs: parse_or(&reader, "RETRY_BASE_DELAY_SECONDS", defaults.base_delay_secs)?,
            max_delay_secs: parse_or(&reader, "RETRY_MAX_DELAY_SECONDS", defaults.max_delay_secs)?,
            max_attempts: parse_or(&reader, "RETRY_MAX_ATTEMPTS", defaults.max_attempts)?,
        })
    }

    /// Delay after the given 1-indexed attempt: `min(base * 2^(attempt-1), max)`.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let secs = self
            .base_delay_secs
            .saturating_mul(2u64.saturating_pow(exponent))
            .min(self.max_delay_secs);
        Duration::from_secs(secs)
    }

    /// When to try again after `attempt` failed at `now`.
    #[must_use]
    pub fn next_retry_at(&self, attempt: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let secs = i64::try_from(self.delay(attempt).as_secs()).unwrap_or(i64::MAX);
        let delta = TimeDelta::try_seconds(secs).unwrap_or(TimeDelta::MAX);
        now.checked_add_signed(delta)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// True once `attempts` has used up the budget.
    #[must_use]
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_delays_double_then_cap() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (1..=5).map(|n| policy.delay(n).as_secs()).collect();
        assert_eq!(delays, vec![60, 120, 240, 480, 960]);
        assert_eq!(policy.delay(10).as_secs(), 3600);
    }

    #[test]
    fn test_delay_is_monotonic_and_never_overflows() {
        let policy = RetryPolicy::default();
        let mut previous = Duration::ZERO;
        for attempt in 1..200 {
            let delay = policy.delay(attempt);
            assert!(delay >= previous);
            assert!(delay.as_secs() <= 3600);
            previous = delay;
        }
        assert_eq!(policy.delay(u32::MAX).as_secs(), 3600);
    }

    #[test]
    fn test_attempt_zero_uses_base_delay() {
        assert_eq!(RetryPolicy::default().delay(0).as_secs(), 60);
    }

    #[test]
    fn test_next_retry_at_adds_delay() {
        let policy = RetryPolicy::new(10, 100, 3);
        let now = Utc::now();
        assert_eq!(policy.next_retry_at(2, now), now + TimeDelta::seconds(20));
    }

    #[test]
    fn test_exhaustion() {
        let policy = RetryPolicy::default();
        assert!(!policy.is_exhausted(4));
        assert!(policy.is_exhausted(5));
        assert!(policy.is_exhausted(6));
    }

    #[test]
    fn test_from_reader_overrides() {
        let policy = RetryPolicy::from_reader(|key: &str| match key {
            "RETRY_BASE_DELAY_SECONDS" => Ok("5".to_string()),
            "RETRY_MAX_ATTEMPTS" => Ok("2".to_string()),
            _ => Err(VarError::NotPresent),
        })
        .unwrap();
        assert_eq!(policy, RetryPolicy::new(5, 3600, 2));
    }
}
