//! Retry policy for failed fetches.

use std::time::Duration;

use crate::error::ApiError;

/// Bounded exponential backoff.
///
/// `attempt` is the number of retries already made, so the first retry
/// waits `base_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
  /// Maximum number of retries after the first attempt.
  pub max_retries: u32,
  pub base_delay: Duration,
  pub backoff_multiplier: u32,
  pub max_delay: Duration,
}

impl RetryPolicy {
  /// Create a policy with no retries.
  pub fn none() -> Self {
    Self {
      max_retries: 0,
      ..Self::default()
    }
  }

  pub fn should_retry(&self, attempt: u32, error: &ApiError) -> bool {
    attempt < self.max_retries && error.is_retryable()
  }

  pub fn delay_for(&self, attempt: u32) -> Duration {
    let factor = self.backoff_multiplier.saturating_pow(attempt);
    let delay = self.base_delay.saturating_mul(factor);
    delay.min(self.max_delay)
  }
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_retries: 3,
      base_delay: Duration::from_millis(1000),
      backoff_multiplier: 2,
      max_delay: Duration::from_millis(30_000),
    }
  }
}
