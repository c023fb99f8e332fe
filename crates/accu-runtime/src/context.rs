//! Per-step handle given to workflow handlers.

use accu_activity::{
  ActivityError, CalendarDeadline, IdempotencyKey, Notification, RuleCheck, StatusUpdate, names,
  with_retry,
};
use accu_config::EngineConfig;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::WorkflowError;
use crate::runtime::Shared;

enum Call<'c> {
  Status(&'c StatusUpdate),
  Calendar(&'c CalendarDeadline),
  Notify(&'c Notification),
  Rules(&'c RuleCheck),
}

impl Call<'_> {
  fn name(&self) -> &'static str {
    match self {
      Call::Status(_) => names::UPDATE_ENTITY_STATUS,
      Call::Calendar(_) => names::CREATE_CALENDAR_DEADLINE,
      Call::Notify(_) => names::SEND_NOTIFICATION,
      Call::Rules(_) => names::VALIDATE_BUSINESS_RULES,
    }
  }
}

/// Everything a handler may touch during one step.
///
/// The step's time is read once when the step begins. Activity calls are
/// keyed `{instance}:{sequence}:{call}`, journaled in the store and retried
/// with the configured policy, so re-running an uncommitted step after a
/// crash does not repeat side effects that already happened. A journaled
/// result is only reused for the activity that recorded it.
///
/// A step that commits nothing has its journal entries discarded, and the
/// number of call indexes it used is journaled for its sequence. The next
/// attempt, including one made after a restart, starts counting from there,
/// so it never reuses a key a collaborator already answered.
pub struct StepContext<'a> {
  workflow_id: &'a str,
  entity_type: &'a str,
  entity_id: &'a str,
  sequence: u64,
  next_call: u32,
  now: DateTime<Utc>,
  performed_by: String,
  shared: &'a Shared,
}

impl<'a> StepContext<'a> {
  pub(crate) fn new(
    workflow_id: &'a str,
    entity_type: &'a str,
    entity_id: &'a str,
    sequence: u64,
    first_call: u32,
    now: DateTime<Utc>,
    performed_by: String,
    shared: &'a Shared,
  ) -> Self {
    Self {
      workflow_id,
      entity_type,
      entity_id,
      sequence,
      next_call: first_call,
      now,
      performed_by,
      shared,
    }
  }

  pub fn workflow_id(&self) -> &str {
    self.workflow_id
  }

  pub fn entity_type(&self) -> &str {
    self.entity_type
  }

  pub fn entity_id(&self) -> &str {
    self.entity_id
  }

  /// Time of this step.
  pub fn now(&self) -> DateTime<Utc> {
    self.now
  }

  pub fn config(&self) -> &EngineConfig {
    &self.shared.config
  }

  pub fn performed_by(&self) -> &str {
    &self.performed_by
  }

  /// Attribute the step's history entries to `actor`.
  pub fn act_as(&mut self, actor: impl Into<String>) {
    self.performed_by = actor.into();
  }

  /// Actor of the step and the next unused call index.
  pub(crate) fn finish(self) -> (String, u32) {
    (self.performed_by, self.next_call)
  }

  /// Set the status of this instance's business entity.
  pub async fn update_entity_status(
    &mut self,
    new_status: &str,
    metadata: Value,
  ) -> Result<(), WorkflowError> {
    let update = StatusUpdate {
      entity_type: self.entity_type.to_string(),
      entity_id: self.entity_id.to_string(),
      new_status: new_status.to_string(),
      metadata,
    };
    self.call(Call::Status(&update)).await?;
    Ok(())
  }

  /// Create a calendar deadline and return its id.
  pub async fn create_calendar_deadline(
    &mut self,
    deadline: &CalendarDeadline,
  ) -> Result<String, WorkflowError> {
    let value = self.call(Call::Calendar(deadline)).await?;
    Ok(value.as_str().unwrap_or_default().to_string())
  }

  pub async fn send_notification(&mut self, notification: &Notification) -> Result<(), WorkflowError> {
    self.call(Call::Notify(notification)).await?;
    Ok(())
  }

  /// Run the named business rules against this instance's entity.
  pub async fn validate_business_rules(&mut self, rules: &[&str]) -> Result<bool, WorkflowError> {
    let check = RuleCheck {
      entity_type: self.entity_type.to_string(),
      entity_id: self.entity_id.to_string(),
      rule_names: rules.iter().map(|r| r.to_string()).collect(),
    };
    let value = self.call(Call::Rules(&check)).await?;
    Ok(value.as_bool().unwrap_or(false))
  }

  async fn call(&mut self, call: Call<'_>) -> Result<Value, WorkflowError> {
    let key = IdempotencyKey::new(self.workflow_id, self.sequence, self.next_call);
    self.next_call += 1;
    let journal_key = key.to_string();
    let activity = call.name();

    if let Some(entry) = self.shared.store.journal_get(&journal_key).await? {
      if entry.activity == activity {
        debug!(workflow_id = %self.workflow_id, key = %key, activity, "activity_replayed");
        return Ok(entry.result);
      }
      warn!(
        workflow_id = %self.workflow_id,
        key = %key,
        activity,
        journaled = %entry.activity,
        "journal_activity_mismatch"
      );
    }

    let gateway = self.shared.gateway.as_ref();
    let key = &key;
    let call = &call;
    let value = with_retry(&self.shared.config.retry, activity, || async move {
      let value: Result<Value, ActivityError> = match call {
        Call::Status(update) => gateway
          .update_entity_status(key, update)
          .await
          .map(|_| Value::Null),
        Call::Calendar(deadline) => gateway
          .create_calendar_deadline(key, deadline)
          .await
          .map(Value::String),
        Call::Notify(notification) => gateway
          .send_notification(key, notification)
          .await
          .map(|_| Value::Null),
        Call::Rules(check) => gateway
          .validate_business_rules(key, check)
          .await
          .map(Value::Bool),
      };
      value
    })
    .await?;

    if let Err(e) = self
      .shared
      .store
      .journal_put(&journal_key, activity, &value)
      .await
    {
      warn!(workflow_id = %self.workflow_id, key = %key, error = %e, "journal_write_failed");
    }
    Ok(value)
  }
}
