//! Retry policy configuration for tasks.
//!
//! Supports a base delay with exponential backoff, capped at a maximum delay.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy for a task.
///
/// Try numbers start at 1. A task with `max_retries = 2` gets tries 1, 2 and 3;
/// a failure on try 3 is final.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first try (0 = no retries).
    pub max_retries: u32,

    /// Delay before the first retry.
    #[serde(with = "serde_duration")]
    pub delay: Duration,

    /// Factor applied to the delay for every further retry (1.0 = fixed delay).
    pub backoff_multiplier: f64,

    /// Upper bound for the computed delay.
    #[serde(with = "serde_duration")]
    pub max_delay: Duration,

    /// Condition for when to retry.
    pub retry_on: RetryCondition,
}

/// Conditions under which a task should be retried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryCondition {
    /// Retry on any error.
    #[default]
    Always,

    /// Retry only on failures the executor reported as transient.
    TransientOnly,

    /// Never retry, regardless of max_retries.
    Never,
}

const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            max_delay: DEFAULT_MAX_DELAY,
            retry_on: RetryCondition::Never,
        }
    }

    /// Create a policy with fixed delay retries.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            delay,
            backoff_multiplier: 1.0,
            max_delay: DEFAULT_MAX_DELAY,
            retry_on: RetryCondition::Always,
        }
    }

    /// Create a policy whose delay is multiplied by `multiplier` on every retry.
    pub fn exponential(max_retries: u32, delay: Duration, multiplier: f64) -> Self {
        Self {
            backoff_multiplier: multiplier,
            ..Self::fixed(max_retries, delay)
        }
    }

    /// Builder: cap the computed delay.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Builder: set the retry condition.
    pub fn with_condition(mut self, condition: RetryCondition) -> Self {
        self.retry_on = condition;
        self
    }

    /// Check if retries are enabled.
    pub fn is_enabled(&self) -> bool {
        self.max_retries > 0 && self.retry_on != RetryCondition::Never
    }

    /// Check whether a failure on `try_number` should be retried.
    pub fn should_retry(&self, try_number: u32, transient: bool) -> bool {
        match self.retry_on {
            RetryCondition::Never => false,
            RetryCondition::TransientOnly if !transient => false,
            _ => try_number <= self.max_retries,
        }
    }

    /// Delay to wait after a failure on `try_number` before the next try.
    pub fn delay_for(&self, try_number: u32) -> Duration {
        let exponent = try_number.saturating_sub(1).min(64) as i32;
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        let secs = self.delay.as_secs_f64() * factor;

        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }
}

impl Default for RetryPolicy {
    /// Default policy: no retries.
    fn default() -> Self {
        Self::none()
    }
}

/// Serde helper for Duration serialization.
///
/// Serializes Duration as seconds (matching YAML config format).
pub(crate) mod serde_duration {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be a non-negative number"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}
