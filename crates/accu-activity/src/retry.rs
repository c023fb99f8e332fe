//! Bounded retry with backoff.

use std::future::Future;

use accu_config::RetryPolicy;
use tracing::warn;

use crate::error::{ActivityError, RetryError};

/// Run `op` until it succeeds, fails permanently, or `policy.max_attempts`
/// attempts have been made.
pub async fn with_retry<T, F, Fut>(
  policy: &RetryPolicy,
  activity: &str,
  mut op: F,
) -> Result<T, RetryError>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T, ActivityError>>,
{
  let max_attempts = policy.max_attempts.max(1);
  let mut attempt = 0;

  loop {
    attempt += 1;
    match op().await {
      Ok(value) => return Ok(value),
      Err(e) if e.is_retryable() && attempt < max_attempts => {
        let delay = policy.delay_after(attempt);
        warn!(
          activity = %activity,
          attempt,
          delay_ms = delay.as_millis() as u64,
          error = %e,
          "activity_retry"
        );
        tokio::time::sleep(delay).await;
      }
      Err(source) => {
        return Err(RetryError {
          activity: activity.to_string(),
          attempts: attempt,
          source,
        });
      }
    }
  }
}
