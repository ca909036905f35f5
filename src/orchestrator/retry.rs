use std::cmp::min;
use std::time::Duration;

use crate::config::RetryConfig;

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Total attempts, including the first
  pub max_attempts: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 5,
      base_delay: Duration::from_secs(1),
      max_delay: Duration::from_secs(30),
    }
  }
}

impl From<&RetryConfig> for RetryPolicy {
  fn from(config: &RetryConfig) -> Self {
    Self {
      max_attempts: config.discovery_attempts.max(1),
      base_delay: Duration::from_millis(config.base_delay_ms),
      max_delay: Duration::from_millis(config.max_delay_ms),
    }
  }
}

impl RetryPolicy {
  pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
    Self {
      max_attempts,
      base_delay,
      max_delay,
    }
  }

  /// Delay before attempt number `attempt` (zero-based); the first attempt
  /// runs immediately.
  pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
    if attempt == 0 {
      return Duration::ZERO;
    }

    let factor = 2_u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
    let exponential_delay = self.base_delay.saturating_mul(factor);
    min(exponential_delay, self.max_delay)
  }

  pub fn exhausted(&self, failures: u32) -> bool {
    failures >= self.max_attempts
  }
}
