use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Delivery channel of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
  Email,
  Sms,
  Push,
  InApp,
}

impl fmt::Display for Channel {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Channel::Email => "email",
      Channel::Sms => "sms",
      Channel::Push => "push",
      Channel::InApp => "in_app",
    })
  }
}

/// Deadline priority. Ordered from least to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
  Low,
  Medium,
  High,
  Critical,
}

impl fmt::Display for Priority {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Priority::Low => "low",
      Priority::Medium => "medium",
      Priority::High => "high",
      Priority::Critical => "critical",
    })
  }
}

/// `updateEntityStatus` arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
  pub entity_type: String,
  pub entity_id: String,
  pub new_status: String,
  #[serde(default)]
  pub metadata: serde_json::Value,
}

/// `createCalendarDeadline` arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarDeadline {
  pub owner_entity_id: String,
  pub title: String,
  pub description: String,
  pub due_date: DateTime<Utc>,
  pub priority: Priority,
  pub assignee_id: Option<String>,
}

/// `sendNotification` arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
  pub channel: Channel,
  pub user_id: String,
  pub title: String,
  pub body: String,
  #[serde(default)]
  pub metadata: serde_json::Value,
}

impl Notification {
  pub fn new(
    channel: Channel,
    user_id: impl Into<String>,
    title: impl Into<String>,
    body: impl Into<String>,
  ) -> Self {
    Self {
      channel,
      user_id: user_id.into(),
      title: title.into(),
      body: body.into(),
      metadata: serde_json::Value::Null,
    }
  }

  pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
    self.metadata = metadata;
    self
  }
}

/// `validateBusinessRules` arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleCheck {
  pub entity_type: String,
  pub entity_id: String,
  pub rule_names: Vec<String>,
}

/// `recordHistoryEntry` arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
  pub workflow_id: String,
  pub step: u64,
  pub status: String,
  pub data: serde_json::Value,
}
