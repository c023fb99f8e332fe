use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ActivityError;
use crate::types::{CalendarDeadline, HistoryRecord, Notification, RuleCheck, StatusUpdate};

/// Deterministic identity of one activity call.
///
/// Derived from the instance id, the history sequence number at which the
/// step began, and the index of the call within that step. A step that is
/// re-executed after a crash produces the same keys, so collaborators can
/// drop the duplicate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey {
  pub instance_id: String,
  pub sequence: u64,
  pub call: u32,
}

impl IdempotencyKey {
  pub fn new(instance_id: impl Into<String>, sequence: u64, call: u32) -> Self {
    Self {
      instance_id: instance_id.into(),
      sequence,
      call,
    }
  }

  /// Prefix shared by every key of one step, `{instance}:{sequence}:`.
  pub fn step_prefix(instance_id: &str, sequence: u64) -> String {
    format!("{}:{}:", instance_id, sequence)
  }
}

impl fmt::Display for IdempotencyKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}:{}", self.instance_id, self.sequence, self.call)
  }
}

/// External side effects invoked by workflow steps.
///
/// Every call must be safe to repeat with the same key without duplicating
/// its effect.
#[async_trait]
pub trait ActivityGateway: Send + Sync {
  async fn update_entity_status(
    &self,
    key: &IdempotencyKey,
    update: &StatusUpdate,
  ) -> Result<(), ActivityError>;

  /// Returns the collaborator's id for the new deadline.
  async fn create_calendar_deadline(
    &self,
    key: &IdempotencyKey,
    deadline: &CalendarDeadline,
  ) -> Result<String, ActivityError>;

  async fn send_notification(
    &self,
    key: &IdempotencyKey,
    notification: &Notification,
  ) -> Result<(), ActivityError>;

  async fn validate_business_rules(
    &self,
    key: &IdempotencyKey,
    check: &RuleCheck,
  ) -> Result<bool, ActivityError>;

  async fn record_history_entry(
    &self,
    key: &IdempotencyKey,
    record: &HistoryRecord,
  ) -> Result<(), ActivityError>;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_step_prefix_matches_only_its_step() {
    let prefix = IdempotencyKey::step_prefix("deadline-1", 3);
    assert!(IdempotencyKey::new("deadline-1", 3, 7).to_string().starts_with(&prefix));
    assert!(!IdempotencyKey::new("deadline-1", 30, 0).to_string().starts_with(&prefix));
  }
}
