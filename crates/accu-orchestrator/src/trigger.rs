//! Trigger types and the status-change table.

use std::fmt;
use std::str::FromStr;

use accu_runtime::WorkflowKind;
use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;

/// What a caller asks the orchestrator to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
  ApplicationLifecycle,
  ProjectLifecycle,
  Deadlines,
}

impl TriggerType {
  pub fn as_str(&self) -> &'static str {
    match self {
      TriggerType::ApplicationLifecycle => "application_lifecycle",
      TriggerType::ProjectLifecycle => "project_lifecycle",
      TriggerType::Deadlines => "deadlines",
    }
  }

  pub fn kind(&self) -> WorkflowKind {
    match self {
      TriggerType::ApplicationLifecycle => WorkflowKind::ApplicationLifecycle,
      TriggerType::ProjectLifecycle => WorkflowKind::ProjectLifecycle,
      TriggerType::Deadlines => WorkflowKind::Deadline,
    }
  }
}

impl fmt::Display for TriggerType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for TriggerType {
  type Err = OrchestratorError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "application_lifecycle" => Ok(TriggerType::ApplicationLifecycle),
      "project_lifecycle" => Ok(TriggerType::ProjectLifecycle),
      "deadlines" => Ok(TriggerType::Deadlines),
      other => Err(OrchestratorError::UnknownTrigger {
        trigger: other.to_string(),
      }),
    }
  }
}

/// Entity families whose status changes drive a lifecycle workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
  Application,
  Project,
}

impl Lifecycle {
  pub(crate) fn for_entity(entity_type: &str) -> Option<Self> {
    match entity_type {
      "accu_application" | "application" => Some(Lifecycle::Application),
      "project" => Some(Lifecycle::Project),
      _ => None,
    }
  }

  pub(crate) fn trigger(&self) -> TriggerType {
    match self {
      Lifecycle::Application => TriggerType::ApplicationLifecycle,
      Lifecycle::Project => TriggerType::ProjectLifecycle,
    }
  }

  /// Signal that moves the workflow to `new_status`, given its current
  /// business state. `None` means the change has no workflow meaning.
  pub(crate) fn signal_for(&self, new_status: &str, current: &str) -> Option<&'static str> {
    match (self, new_status) {
      (Lifecycle::Application, "submitted") => Some("submitApplication"),
      (Lifecycle::Application, "under_review") => Some("assignReviewer"),
      (Lifecycle::Application, "approved") => Some("approveApplication"),
      (Lifecycle::Application, "rejected") => Some("rejectApplication"),
      (Lifecycle::Application, "issued") => Some("issueCertificate"),
      (Lifecycle::Project, "active") if current == "on_hold" => Some("resumeProject"),
      (Lifecycle::Project, "active") => Some("startProject"),
      (Lifecycle::Project, "on_hold") => Some("putOnHold"),
      (Lifecycle::Project, "completed") => Some("completeProject"),
      (Lifecycle::Project, "cancelled") => Some("cancelProject"),
      _ => None,
    }
  }
}
