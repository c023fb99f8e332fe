use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryBackoff {
  Constant,
  Linear,
  Exponential,
}

/// Retry policy for activity calls.
///
/// `max_attempts` counts the first call, so `1` disables retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
  pub max_attempts: u32,
  pub initial_backoff_ms: u64,
  pub max_backoff_ms: u64,
  pub backoff: RetryBackoff,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 5,
      initial_backoff_ms: 200,
      max_backoff_ms: 10_000,
      backoff: RetryBackoff::Exponential,
    }
  }
}

impl RetryPolicy {
  /// Delay to wait after the given failed attempt (1-based).
  pub fn delay_after(&self, attempt: u32) -> Duration {
    let base = self.initial_backoff_ms;
    let n = u64::from(attempt.max(1));
    let ms = match self.backoff {
      RetryBackoff::Constant => base,
      RetryBackoff::Linear => base.saturating_mul(n),
      RetryBackoff::Exponential => {
        let shift = (n - 1).min(32) as u32;
        base.saturating_mul(1u64 << shift)
      }
    };
    Duration::from_millis(ms.min(self.max_backoff_ms))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn policy(backoff: RetryBackoff) -> RetryPolicy {
    RetryPolicy {
      max_attempts: 5,
      initial_backoff_ms: 100,
      max_backoff_ms: 1_000,
      backoff,
    }
  }

  #[test]
  fn test_exponential_doubles_and_caps() {
    let p = policy(RetryBackoff::Exponential);
    assert_eq!(p.delay_after(1), Duration::from_millis(100));
    assert_eq!(p.delay_after(2), Duration::from_millis(200));
    assert_eq!(p.delay_after(3), Duration::from_millis(400));
    assert_eq!(p.delay_after(5), Duration::from_millis(1_000));
    assert_eq!(p.delay_after(60), Duration::from_millis(1_000));
  }

  #[test]
  fn test_linear_and_constant() {
    assert_eq!(
      policy(RetryBackoff::Linear).delay_after(3),
      Duration::from_millis(300)
    );
    assert_eq!(
      policy(RetryBackoff::Constant).delay_after(4),
      Duration::from_millis(100)
    );
  }
}
