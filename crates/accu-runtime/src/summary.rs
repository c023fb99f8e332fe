use accu_store::{InstanceStatus, WorkflowKind, WorkflowRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One row of `list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSummary {
  pub id: String,
  pub workflow_type: WorkflowKind,
  pub entity_type: String,
  pub entity_id: String,
  pub status: InstanceStatus,
  /// Business state name of the workflow (e.g. `under_review`).
  pub state: String,
  pub history_length: usize,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl WorkflowSummary {
  pub(crate) fn new(record: &WorkflowRecord, state: String) -> Self {
    Self {
      id: record.id.clone(),
      workflow_type: record.workflow_type,
      entity_type: record.entity_type.clone(),
      entity_id: record.entity_id.clone(),
      status: record.status,
      state,
      history_length: record.history.len(),
      created_at: record.created_at,
      updated_at: record.updated_at,
    }
  }
}

/// Filter for `list`. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ListFilter {
  pub workflow_type: Option<WorkflowKind>,
  pub status: Option<InstanceStatus>,
  pub entity_type: Option<String>,
  pub entity_id: Option<String>,
}

impl ListFilter {
  pub fn matches(&self, summary: &WorkflowSummary) -> bool {
    self.workflow_type.is_none_or(|t| t == summary.workflow_type)
      && self.status.is_none_or(|s| s == summary.status)
      && self
        .entity_type
        .as_deref()
        .is_none_or(|t| t == summary.entity_type)
      && self
        .entity_id
        .as_deref()
        .is_none_or(|id| id == summary.entity_id)
  }
}

/// Outcome of [`Runtime::recover`](crate::Runtime::recover).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
  /// Instances loaded from the store.
  pub restored: usize,
  /// Live instances whose actors were restarted.
  pub resumed: usize,
  /// Instances whose replayed state differed from the stored snapshot.
  pub mismatched: Vec<String>,
}
