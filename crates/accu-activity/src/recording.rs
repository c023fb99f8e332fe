//! In-memory gateway that logs and records every call.
//!
//! Used by tests and by the CLI when no real collaborator is wired in.
//! Calls are deduplicated by idempotency key: a repeated key returns the
//! first result and is not recorded again.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

use crate::error::ActivityError;
use crate::gateway::{ActivityGateway, IdempotencyKey};
use crate::names;
use crate::types::{CalendarDeadline, HistoryRecord, Notification, RuleCheck, StatusUpdate};

/// One recorded activity call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "activity", rename_all = "camelCase")]
pub enum ActivityCall {
  UpdateEntityStatus(StatusUpdate),
  CreateCalendarDeadline(CalendarDeadline),
  SendNotification(Notification),
  ValidateBusinessRules(RuleCheck),
  RecordHistoryEntry(HistoryRecord),
}

struct State {
  calls: Vec<(IdempotencyKey, ActivityCall)>,
  results: HashMap<IdempotencyKey, serde_json::Value>,
  duplicates: usize,
  transient_failures: HashMap<String, u32>,
  always_failing: HashSet<String>,
  rules_valid: bool,
  next_deadline: u64,
}

pub struct RecordingGateway {
  state: Mutex<State>,
}

impl Default for RecordingGateway {
  fn default() -> Self {
    Self::new()
  }
}

impl RecordingGateway {
  pub fn new() -> Self {
    Self {
      state: Mutex::new(State {
        calls: Vec::new(),
        results: HashMap::new(),
        duplicates: 0,
        transient_failures: HashMap::new(),
        always_failing: HashSet::new(),
        rules_valid: true,
        next_deadline: 1,
      }),
    }
  }

  /// Make the next `times` calls of `activity` fail transiently.
  pub fn fail_next(&self, activity: &str, times: u32) {
    let mut state = self.state.lock().unwrap();
    state.transient_failures.insert(activity.to_string(), times);
  }

  /// Make every call of `activity` fail transiently until cleared.
  pub fn fail_always(&self, activity: &str) {
    let mut state = self.state.lock().unwrap();
    state.always_failing.insert(activity.to_string());
  }

  pub fn clear_failures(&self) {
    let mut state = self.state.lock().unwrap();
    state.transient_failures.clear();
    state.always_failing.clear();
  }

  /// Result returned by `validateBusinessRules`.
  pub fn set_rules_valid(&self, valid: bool) {
    self.state.lock().unwrap().rules_valid = valid;
  }

  pub fn calls(&self) -> Vec<ActivityCall> {
    let state = self.state.lock().unwrap();
    state.calls.iter().map(|(_, call)| call.clone()).collect()
  }

  pub fn keyed_calls(&self) -> Vec<(IdempotencyKey, ActivityCall)> {
    self.state.lock().unwrap().calls.clone()
  }

  pub fn notifications(&self) -> Vec<Notification> {
    self
      .calls()
      .into_iter()
      .filter_map(|call| match call {
        ActivityCall::SendNotification(n) => Some(n),
        _ => None,
      })
      .collect()
  }

  pub fn status_updates(&self) -> Vec<StatusUpdate> {
    self
      .calls()
      .into_iter()
      .filter_map(|call| match call {
        ActivityCall::UpdateEntityStatus(u) => Some(u),
        _ => None,
      })
      .collect()
  }

  pub fn calendar_deadlines(&self) -> Vec<CalendarDeadline> {
    self
      .calls()
      .into_iter()
      .filter_map(|call| match call {
        ActivityCall::CreateCalendarDeadline(d) => Some(d),
        _ => None,
      })
      .collect()
  }

  /// Calls answered from the dedupe cache instead of being applied again.
  pub fn duplicate_count(&self) -> usize {
    self.state.lock().unwrap().duplicates
  }

  /// Dedupe, inject failures, then record the call and store its result.
  fn handle(
    &self,
    activity: &str,
    key: &IdempotencyKey,
    call: ActivityCall,
    result: impl FnOnce(&mut State) -> serde_json::Value,
  ) -> Result<serde_json::Value, ActivityError> {
    let mut state = self.state.lock().unwrap();

    if let Some(previous) = state.results.get(key).cloned() {
      state.duplicates += 1;
      return Ok(previous);
    }

    if state.always_failing.contains(activity) {
      return Err(ActivityError::transient(activity, "collaborator unavailable"));
    }
    if let Some(remaining) = state.transient_failures.get_mut(activity) {
      if *remaining > 0 {
        *remaining -= 1;
        return Err(ActivityError::transient(activity, "collaborator unavailable"));
      }
    }

    let value = result(&mut *state);
    info!(activity = %activity, key = %key, "activity_executed");
    state.calls.push((key.clone(), call));
    state.results.insert(key.clone(), value.clone());
    Ok(value)
  }
}

#[async_trait]
impl ActivityGateway for RecordingGateway {
  async fn update_entity_status(
    &self,
    key: &IdempotencyKey,
    update: &StatusUpdate,
  ) -> Result<(), ActivityError> {
    self.handle(
      names::UPDATE_ENTITY_STATUS,
      key,
      ActivityCall::UpdateEntityStatus(update.clone()),
      |_| serde_json::Value::Null,
    )?;
    Ok(())
  }

  async fn create_calendar_deadline(
    &self,
    key: &IdempotencyKey,
    deadline: &CalendarDeadline,
  ) -> Result<String, ActivityError> {
    let value = self.handle(
      names::CREATE_CALENDAR_DEADLINE,
      key,
      ActivityCall::CreateCalendarDeadline(deadline.clone()),
      |state| {
        let id = format!("cal-{}", state.next_deadline);
        state.next_deadline += 1;
        serde_json::Value::String(id)
      },
    )?;
    Ok(value.as_str().unwrap_or_default().to_string())
  }

  async fn send_notification(
    &self,
    key: &IdempotencyKey,
    notification: &Notification,
  ) -> Result<(), ActivityError> {
    self.handle(
      names::SEND_NOTIFICATION,
      key,
      ActivityCall::SendNotification(notification.clone()),
      |_| serde_json::Value::Null,
    )?;
    Ok(())
  }

  async fn validate_business_rules(
    &self,
    key: &IdempotencyKey,
    check: &RuleCheck,
  ) -> Result<bool, ActivityError> {
    let value = self.handle(
      names::VALIDATE_BUSINESS_RULES,
      key,
      ActivityCall::ValidateBusinessRules(check.clone()),
      |state| serde_json::Value::Bool(state.rules_valid),
    )?;
    Ok(value.as_bool().unwrap_or(false))
  }

  async fn record_history_entry(
    &self,
    key: &IdempotencyKey,
    record: &HistoryRecord,
  ) -> Result<(), ActivityError> {
    self.handle(
      names::RECORD_HISTORY_ENTRY,
      key,
      ActivityCall::RecordHistoryEntry(record.clone()),
      |_| serde_json::Value::Null,
    )?;
    Ok(())
  }
}
