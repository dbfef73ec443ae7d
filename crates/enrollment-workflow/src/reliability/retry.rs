//! Retry policy with bounded exponential backoff

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::serde_duration::duration_millis;

/// Bounded retry schedule for a fallible external call
///
/// The delay before retry `n` (1-based) is
/// `min(initial_backoff * multiplier^(n-1), max_backoff)`; `max_backoff` is a
/// hard ceiling and `max_attempts` bounds the loop.
///
/// # Example
///
/// ```
/// use enrollment_workflow::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_attempts(4)
///     .with_initial_backoff(Duration::from_secs(1))
///     .with_max_backoff(Duration::from_secs(3));
///
/// assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(1));
/// assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(2));
/// assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(3));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first call)
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(rename = "initial_backoff_ms", with = "duration_millis")]
    pub initial_backoff: Duration,

    /// Backoff multiplier, at least 1.0
    pub multiplier: f64,

    /// Upper bound for any single delay
    #[serde(rename = "max_backoff_ms", with = "duration_millis")]
    pub max_backoff: Duration,

    /// Jitter factor (0.0-1.0), applied below the ceiling
    #[serde(default)]
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// 3 attempts, 1s initial backoff, doubling, 30s ceiling, no jitter
    pub fn exponential() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(30),
            jitter: 0.0,
        }
    }

    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            multiplier: 1.0,
            max_backoff: Duration::ZERO,
            jitter: 0.0,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay to wait before `attempt` (1-based); the first attempt never waits
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let retry_num = attempt - 1;
        let exponent = i32::try_from(retry_num - 1).unwrap_or(i32::MAX);
        let ceiling = self.max_backoff.as_secs_f64();
        let base = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = if base.is_finite() {
            base.min(ceiling)
        } else {
            ceiling
        };

        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let spread = capped * self.jitter;
            let offset = rand::thread_rng().gen_range(-spread..=spread);
            (capped + offset).clamp(0.0, ceiling)
        } else {
            capped
        };

        Duration::try_from_secs_f64(jittered).unwrap_or(self.max_backoff)
    }

    /// Reject policies that could loop forever or shrink their backoff
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidRetryPolicy(
                "max_attempts must be at least 1".into(),
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::InvalidRetryPolicy(format!(
                "multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(ConfigError::InvalidRetryPolicy(
                "initial_backoff exceeds max_backoff".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::InvalidRetryPolicy(format!(
                "jitter must be within 0.0..=1.0, got {}",
                self.jitter
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_defaults() {
        let policy = RetryPolicy::exponential();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_backoff, Duration::from_secs(1));
        assert_eq!(policy.multiplier, 2.0);
        assert_eq!(policy.max_backoff, Duration::from_secs(30));
    }

    #[test]
    fn test_no_retry() {
        let policy = RetryPolicy::no_retry();
        assert_eq!(policy.max_attempts, 1);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_delay_for_attempt() {
        let policy = RetryPolicy::exponential();

        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(4));
    }

    #[test]
    fn test_ceiling_is_hard() {
        let policy = RetryPolicy::exponential()
            .with_max_backoff(Duration::from_secs(5))
            .with_jitter(1.0);

        for attempt in 2..200 {
            assert!(policy.delay_for_attempt(attempt) <= Duration::from_secs(5));
        }
        assert_eq!(
            policy.clone().with_jitter(0.0).delay_for_attempt(1000),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_validate() {
        assert!(RetryPolicy::exponential().validate().is_ok());
        assert!(RetryPolicy::exponential()
            .with_max_attempts(0)
            .validate()
            .is_err());
        assert!(RetryPolicy::exponential()
            .with_multiplier(0.5)
            .validate()
            .is_err());
    }

    #[test]
    fn test_serialization() {
        let policy = RetryPolicy::exponential();
        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json["initial_backoff_ms"], 1000);
        assert_eq!(json["max_backoff_ms"], 30000);

        let parsed: RetryPolicy = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, policy);
    }
}
