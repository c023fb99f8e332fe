use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Runtime-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
  /// Cadence of the deadline and project monitors.
  pub tick_interval_secs: u64,
  /// Capacity of each instance's signal queue.
  pub signal_buffer: usize,
  /// Terminal instances older than this are removed by garbage collection.
  pub retention_days: i64,
}

impl Default for RuntimeConfig {
  fn default() -> Self {
    Self {
      tick_interval_secs: 30 * 60,
      signal_buffer: 100,
      retention_days: 30,
    }
  }
}

impl RuntimeConfig {
  pub fn tick_interval(&self) -> Duration {
    Duration::from_secs(self.tick_interval_secs)
  }
}

/// ACCU application approval timings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
  /// Days a submitted application may wait for a reviewer.
  pub review_timeout_days: i64,
  /// Days an application may stay under review without a decision.
  pub approval_timeout_days: i64,
  /// Days after approval for the certificate issue deadline.
  pub issue_deadline_days: i64,
  /// Days after approval before the certificate is issued automatically.
  pub auto_issue_days: i64,
  pub auto_issue: bool,
}

impl Default for ApplicationConfig {
  fn default() -> Self {
    Self {
      review_timeout_days: 14,
      approval_timeout_days: 7,
      issue_deadline_days: 3,
      auto_issue_days: 14,
      auto_issue: true,
    }
  }
}

/// Project monitor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
  /// Days without a progress signal before an active project is put on hold.
  pub stall_days: i64,
  /// Hours before a milestone's due date to send the "due soon" reminder.
  pub reminder_hours_before: i64,
}

impl Default for ProjectConfig {
  fn default() -> Self {
    Self {
      stall_days: 30,
      reminder_hours_before: 24,
    }
  }
}
