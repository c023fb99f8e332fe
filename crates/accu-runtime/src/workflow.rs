//! The contract every workflow definition implements.

use std::fmt::Debug;

use accu_config::EngineConfig;
use accu_store::{InstanceStatus, WorkflowKind};
use accu_timer::TimerReason;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::context::StepContext;
use crate::error::WorkflowError;

/// A conditional wait: wake the instance at `at` unless its state moved on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerRequest {
  pub reason: TimerReason,
  pub at: DateTime<Utc>,
}

impl TimerRequest {
  pub fn wait(name: impl Into<String>, at: DateTime<Utc>) -> Self {
    Self {
      reason: TimerReason::wait(name),
      at,
    }
  }
}

/// A durable, signal and timer driven state machine.
///
/// Handlers never mutate `self`. They validate, call activities through the
/// [`StepContext`] and return the events the step produced; the runtime
/// appends one history entry per event and folds it in with [`apply`].
/// Replaying the history through `apply` from [`Default`] must rebuild the
/// same state, so `apply` may only read the event and the state.
///
/// `Event` is serialized as `{"action": .., "details": ..}` (an adjacently
/// tagged enum) and `Signal` is deserialized from
/// `{"signal": name, "payload": payload}`.
///
/// [`apply`]: Workflow::apply
#[async_trait]
pub trait Workflow: Clone + Default + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
  type Event: Serialize + DeserializeOwned + Debug + Send + Sync;
  type Signal: DeserializeOwned + Debug + Send + Sync;

  const KIND: WorkflowKind;

  /// Signal names accepted by this workflow, including aliases.
  const SIGNALS: &'static [&'static str];

  /// Events recorded when the instance is created.
  async fn start(ctx: &mut StepContext<'_>, input: &Value) -> Result<Vec<Self::Event>, WorkflowError>;

  fn apply(&mut self, event: &Self::Event);

  fn status(&self) -> InstanceStatus;

  /// Business state name (e.g. `under_review`).
  fn state_name(&self) -> String;

  /// Whether `signal` is legal in the current state.
  fn check(&self, signal: &Self::Signal) -> Result<(), WorkflowError>;

  async fn on_signal(
    &self,
    ctx: &mut StepContext<'_>,
    signal: Self::Signal,
  ) -> Result<Vec<Self::Event>, WorkflowError>;

  async fn on_timer(
    &self,
    ctx: &mut StepContext<'_>,
    reason: &TimerReason,
  ) -> Result<Vec<Self::Event>, WorkflowError>;

  /// Conditional waits implied by the current state.
  fn timers(&self, _config: &EngineConfig) -> Vec<TimerRequest> {
    Vec::new()
  }

  /// Whether the periodic monitor runs in the current state.
  fn ticks(&self) -> bool {
    false
  }

  /// Answer a read-only query.
  fn query(&self, name: &str, args: &Value, now: DateTime<Utc>) -> Result<Value, WorkflowError>;
}

/// Decode `name` + `payload` into a workflow's signal type.
pub fn parse_signal<W: Workflow>(name: &str, payload: &Value) -> Result<W::Signal, WorkflowError> {
  if !W::SIGNALS.iter().any(|known| *known == name) {
    return Err(WorkflowError::UnknownSignal {
      signal: name.to_string(),
    });
  }
  let payload = if payload.is_null() {
    json!({})
  } else {
    payload.clone()
  };
  serde_json::from_value(json!({ "signal": name, "payload": payload })).map_err(|e| {
    WorkflowError::InvalidPayload {
      signal: name.to_string(),
      message: e.to_string(),
    }
  })
}

/// Split an event into its history `action` and `details`.
pub(crate) fn encode_event<E: Serialize>(event: &E) -> Result<(String, Value), serde_json::Error> {
  let mut value = serde_json::to_value(event)?;
  let action = value
    .get("action")
    .and_then(Value::as_str)
    .map(str::to_string)
    .ok_or_else(|| {
      <serde_json::Error as serde::ser::Error>::custom("event is not tagged with 'action'")
    })?;
  let details = value
    .as_object_mut()
    .and_then(|obj| obj.remove("details"))
    .unwrap_or(Value::Null);
  Ok((action, details))
}

/// Rebuild an event from a history `action` and `details`.
pub(crate) fn decode_event<E: DeserializeOwned>(action: &str, details: &Value) -> Result<E, serde_json::Error> {
  let value = if details.is_null() {
    json!({ "action": action })
  } else {
    json!({ "action": action, "details": details })
  };
  serde_json::from_value(value)
}

/// Read-only view of a committed workflow state, stored in snapshots.
pub(crate) trait InstanceView: Send + Sync {
  fn check_signal(&self, name: &str, payload: &Value) -> Result<(), WorkflowError>;
  fn query(&self, name: &str, args: &Value, now: DateTime<Utc>) -> Result<Value, WorkflowError>;
  fn state_name(&self) -> String;
  fn state_data(&self) -> Result<Value, serde_json::Error>;
}

impl<W: Workflow> InstanceView for W {
  fn check_signal(&self, name: &str, payload: &Value) -> Result<(), WorkflowError> {
    let signal = parse_signal::<W>(name, payload)?;
    self.check(&signal)
  }

  fn query(&self, name: &str, args: &Value, now: DateTime<Utc>) -> Result<Value, WorkflowError> {
    Workflow::query(self, name, args, now)
  }

  fn state_name(&self) -> String {
    Workflow::state_name(self)
  }

  fn state_data(&self) -> Result<Value, serde_json::Error> {
    serde_json::to_value(self)
  }
}

#[cfg(test)]
mod tests {
  use serde::Deserialize;

  use super::*;

  #[derive(Debug, Serialize, Deserialize, PartialEq)]
  #[serde(tag = "action", content = "details", rename_all = "camelCase")]
  enum Event {
    Created { title: String },
    Closed {},
  }

  #[test]
  fn test_event_split_and_rebuild() {
    let (action, details) = encode_event(&Event::Created {
      title: "Audit".to_string(),
    })
    .unwrap();
    assert_eq!(action, "created");
    assert_eq!(details, json!({ "title": "Audit" }));

    let rebuilt: Event = decode_event(&action, &details).unwrap();
    assert_eq!(
      rebuilt,
      Event::Created {
        title: "Audit".to_string()
      }
    );

    let (action, details) = encode_event(&Event::Closed {}).unwrap();
    let rebuilt: Event = decode_event(&action, &details).unwrap();
    assert_eq!(rebuilt, Event::Closed {});
  }
}
