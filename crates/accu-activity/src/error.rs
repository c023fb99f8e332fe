//! Activity errors.

/// Errors returned by an [`ActivityGateway`](crate::ActivityGateway) call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActivityError {
  /// Temporary failure (network, timeout, unavailable). Retried.
  #[error("{activity} failed transiently: {message}")]
  Transient { activity: String, message: String },

  /// The collaborator refused the call. Not retried.
  #[error("{activity} rejected: {message}")]
  Rejected { activity: String, message: String },
}

impl ActivityError {
  pub fn transient(activity: impl Into<String>, message: impl Into<String>) -> Self {
    ActivityError::Transient {
      activity: activity.into(),
      message: message.into(),
    }
  }

  pub fn rejected(activity: impl Into<String>, message: impl Into<String>) -> Self {
    ActivityError::Rejected {
      activity: activity.into(),
      message: message.into(),
    }
  }

  pub fn is_retryable(&self) -> bool {
    matches!(self, ActivityError::Transient { .. })
  }
}

/// An activity that failed after its retry budget was spent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{activity} failed after {attempts} attempt(s): {source}")]
pub struct RetryError {
  pub activity: String,
  pub attempts: u32,
  #[source]
  pub source: ActivityError,
}
