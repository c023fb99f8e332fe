use accu_runtime::{ListFilter, Runtime, WorkflowError, WorkflowSummary};
use serde_json::{Map, Value};
use tracing::{debug, info, instrument};

use crate::error::OrchestratorError;
use crate::trigger::{Lifecycle, TriggerType};

/// Entry point for the CRUD/API layer.
///
/// Owns no state of its own: every call resolves to a runtime start,
/// signal, query or termination.
#[derive(Clone)]
pub struct Orchestrator {
  runtime: Runtime,
}

impl Orchestrator {
  pub fn new(runtime: Runtime) -> Self {
    Self { runtime }
  }

  pub fn runtime(&self) -> &Runtime {
    &self.runtime
  }

  /// Start the workflow `trigger_type` names for an entity.
  ///
  /// Returns the existing id when the entity already has a live instance
  /// of that type.
  #[instrument(name = "trigger_workflow", skip(self, input), fields(entity_id = %entity_id))]
  pub async fn trigger_workflow(
    &self,
    entity_type: &str,
    entity_id: &str,
    trigger_type: &str,
    input: Value,
    performed_by: &str,
  ) -> Result<String, OrchestratorError> {
    let trigger: TriggerType = trigger_type.parse()?;
    self
      .start(trigger, entity_type, entity_id, input, performed_by)
      .await
  }

  async fn start(
    &self,
    trigger: TriggerType,
    entity_type: &str,
    entity_id: &str,
    input: Value,
    performed_by: &str,
  ) -> Result<String, OrchestratorError> {
    let kind = trigger.kind();
    if let Some(existing) = self.runtime.find_live(kind, entity_id) {
      debug!(workflow_id = %existing, trigger = %trigger, "workflow_already_running");
      return Ok(existing);
    }

    match self
      .runtime
      .start(kind, entity_type, entity_id, input, performed_by)
      .await
    {
      Ok(id) => {
        info!(workflow_id = %id, trigger = %trigger, "workflow_triggered");
        Ok(id)
      }
      // Lost a race against a concurrent trigger that already committed.
      Err(WorkflowError::AlreadyExists { workflow_id, .. }) if workflow_id != "pending" => Ok(workflow_id),
      Err(e) => Err(e.into()),
    }
  }

  /// Deliver a signal and wait until its step has been committed or
  /// rejected.
  pub async fn signal_workflow(&self, workflow_id: &str, signal: &str, payload: Value) -> Result<(), OrchestratorError> {
    self
      .runtime
      .signal(workflow_id, signal, payload)
      .await?
      .outcome()
      .await?;
    Ok(())
  }

  pub fn query_workflow(&self, workflow_id: &str, query: &str, args: &Value) -> Result<Value, OrchestratorError> {
    Ok(self.runtime.query(workflow_id, query, args)?)
  }

  pub fn list_workflows(&self, filter: &ListFilter) -> Vec<WorkflowSummary> {
    self.runtime.list(filter)
  }

  pub async fn terminate_workflow(
    &self,
    workflow_id: &str,
    reason: &str,
    performed_by: &str,
  ) -> Result<(), OrchestratorError> {
    self.runtime.terminate(workflow_id, reason, performed_by).await?;
    Ok(())
  }

  /// Translate a business-entity status change into a workflow signal.
  ///
  /// An entity without a live lifecycle instance gets one first, started
  /// with `payload` as its input. Returns the signalled workflow id, or
  /// `None` when the change has no workflow meaning or the workflow is
  /// already in that state (the echo of its own status update).
  #[instrument(
    name = "handle_status_change",
    skip(self, payload),
    fields(entity_type = %entity_type, entity_id = %entity_id, new_status = %new_status)
  )]
  pub async fn handle_status_change(
    &self,
    entity_type: &str,
    entity_id: &str,
    new_status: &str,
    performed_by: &str,
    payload: Value,
  ) -> Result<Option<String>, OrchestratorError> {
    let Some(lifecycle) = Lifecycle::for_entity(entity_type) else {
      debug!("status_change_ignored");
      return Ok(None);
    };

    let existing = self.runtime.find_live(lifecycle.trigger().kind(), entity_id);
    let current = match &existing {
      Some(id) => self.runtime.describe(id)?.state,
      None => "draft".to_string(),
    };
    if current == new_status {
      debug!("status_already_applied");
      return Ok(None);
    }
    let Some(signal) = lifecycle.signal_for(new_status, &current) else {
      debug!(state = %current, "status_change_ignored");
      return Ok(None);
    };

    let workflow_id = match existing {
      Some(id) => id,
      None => {
        self
          .start(lifecycle.trigger(), entity_type, entity_id, payload.clone(), performed_by)
          .await?
      }
    };

    self
      .signal_workflow(&workflow_id, signal, with_actor(payload, performed_by))
      .await?;
    info!(workflow_id = %workflow_id, signal = %signal, "status_change_applied");
    Ok(Some(workflow_id))
  }
}

/// Signal payload carrying the actor, unless the caller already set one.
fn with_actor(payload: Value, performed_by: &str) -> Value {
  let mut object = match payload {
    Value::Object(map) => map,
    _ => Map::new(),
  };
  object
    .entry("performedBy")
    .or_insert_with(|| Value::String(performed_by.to_string()));
  Value::Object(object)
}
