use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The workflow definitions the engine knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum WorkflowKind {
  Deadline,
  ApplicationLifecycle,
  ProjectLifecycle,
}

impl WorkflowKind {
  pub const ALL: [WorkflowKind; 3] = [
    WorkflowKind::Deadline,
    WorkflowKind::ApplicationLifecycle,
    WorkflowKind::ProjectLifecycle,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      WorkflowKind::Deadline => "deadline",
      WorkflowKind::ApplicationLifecycle => "application_lifecycle",
      WorkflowKind::ProjectLifecycle => "project_lifecycle",
    }
  }
}

impl fmt::Display for WorkflowKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for WorkflowKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    WorkflowKind::ALL
      .into_iter()
      .find(|kind| kind.as_str() == s)
      .ok_or_else(|| format!("unknown workflow type '{}'", s))
  }
}

/// Lifecycle status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum InstanceStatus {
  Active,
  Paused,
  Completed,
  Cancelled,
  Failed,
}

impl InstanceStatus {
  /// Active and paused instances still own a running routine.
  pub fn is_live(&self) -> bool {
    matches!(self, InstanceStatus::Active | InstanceStatus::Paused)
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      InstanceStatus::Active => "active",
      InstanceStatus::Paused => "paused",
      InstanceStatus::Completed => "completed",
      InstanceStatus::Cancelled => "cancelled",
      InstanceStatus::Failed => "failed",
    }
  }
}

impl fmt::Display for InstanceStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for InstanceStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "active" => Ok(InstanceStatus::Active),
      "paused" => Ok(InstanceStatus::Paused),
      "completed" => Ok(InstanceStatus::Completed),
      "cancelled" => Ok(InstanceStatus::Cancelled),
      "failed" => Ok(InstanceStatus::Failed),
      other => Err(format!("unknown workflow status '{}'", other)),
    }
  }
}

/// One append-only entry of an instance's history log.
///
/// `action` and `details` are the tag and content of the event that was
/// committed; replaying them in `sequence` order rebuilds the instance state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
  pub sequence: u64,
  pub timestamp: DateTime<Utc>,
  pub action: String,
  pub performed_by: String,
  #[serde(default)]
  pub details: serde_json::Value,
}

/// The durable record of one workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRecord {
  pub id: String,
  pub workflow_type: WorkflowKind,
  pub entity_type: String,
  pub entity_id: String,
  pub status: InstanceStatus,
  pub state_data: serde_json::Value,
  pub history: Vec<HistoryEntry>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl WorkflowRecord {
  /// Sequence number the next history entry will receive.
  pub fn next_sequence(&self) -> u64 {
    self.history.len() as u64
  }

  /// Whether `other` keeps this record's history as an unchanged prefix.
  pub fn is_extended_by(&self, other: &WorkflowRecord) -> bool {
    other.history.len() >= self.history.len()
      && self
        .history
        .iter()
        .zip(other.history.iter())
        .all(|(a, b)| a == b)
  }
}

/// A completed activity result, stored under its idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
  /// Activity that produced the result (e.g. `sendNotification`).
  pub activity: String,
  pub result: serde_json::Value,
}
