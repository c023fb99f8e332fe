//! Priority-tiered reminder and escalation tables.

use accu_activity::{Channel, Priority};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One scheduled reminder of a deadline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReminderEntry {
  pub channel: Channel,
  pub hours_before_due: i64,
  pub sent: bool,
  pub sent_at: Option<DateTime<Utc>>,
  /// Set when a more imminent reminder was sent in its place.
  #[serde(default)]
  pub skipped: bool,
}

impl ReminderEntry {
  fn new(hours_before_due: i64, channel: Channel) -> Self {
    Self {
      channel,
      hours_before_due,
      sent: false,
      sent_at: None,
      skipped: false,
    }
  }

  pub fn reset(&mut self) {
    self.sent = false;
    self.sent_at = None;
    self.skipped = false;
  }
}

/// One tier of a deadline's escalation chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationRule {
  pub level: u32,
  pub trigger_hours_after_due: i64,
  pub target_role: String,
  pub target_user_id: Option<String>,
  pub escalated: bool,
  pub escalated_at: Option<DateTime<Utc>>,
}

impl EscalationRule {
  fn new(level: u32, trigger_hours_after_due: i64, target_role: &str) -> Self {
    Self {
      level,
      trigger_hours_after_due,
      target_role: target_role.to_string(),
      target_user_id: None,
      escalated: false,
      escalated_at: None,
    }
  }

  /// Recipient of the escalation notification.
  pub fn target(&self) -> String {
    match &self.target_user_id {
      Some(user) => user.clone(),
      None => format!("role:{}", self.target_role),
    }
  }
}

/// Reminders for a new deadline, most distant first.
pub fn reminder_schedule(priority: Priority) -> Vec<ReminderEntry> {
  let table: &[(i64, Channel)] = match priority {
    Priority::Critical => &[
      (168, Channel::Email),
      (72, Channel::Email),
      (24, Channel::Email),
      (4, Channel::Sms),
      (1, Channel::Push),
    ],
    Priority::High => &[(72, Channel::Email), (24, Channel::Email), (2, Channel::Push)],
    Priority::Medium => &[(24, Channel::Email), (4, Channel::Push)],
    Priority::Low => &[(8, Channel::Email), (2, Channel::InApp)],
  };
  table
    .iter()
    .map(|(hours, channel)| ReminderEntry::new(*hours, *channel))
    .collect()
}

/// Escalation chain for a new deadline, in level order.
pub fn escalation_rules(priority: Priority) -> Vec<EscalationRule> {
  let table: &[(u32, i64, &str)] = match priority {
    Priority::Critical => &[
      (1, 1, "project_manager"),
      (2, 4, "director"),
      (3, 24, "executive"),
    ],
    Priority::High => &[(1, 4, "project_manager"), (2, 24, "director")],
    Priority::Medium => &[(1, 24, "project_manager"), (2, 72, "director")],
    Priority::Low => &[(1, 72, "project_manager")],
  };
  table
    .iter()
    .map(|(level, hours, role)| EscalationRule::new(*level, *hours, role))
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_critical_schedule() {
    let reminders = reminder_schedule(Priority::Critical);
    let hours: Vec<i64> = reminders.iter().map(|r| r.hours_before_due).collect();
    assert_eq!(hours, vec![168, 72, 24, 4, 1]);
    assert_eq!(reminders[3].channel, Channel::Sms);
    assert_eq!(reminders[4].channel, Channel::Push);
    assert!(reminders.iter().all(|r| !r.sent));
  }

  #[test]
  fn test_escalation_levels_are_ordered() {
    for priority in [Priority::Low, Priority::Medium, Priority::High, Priority::Critical] {
      let rules = escalation_rules(priority);
      assert!(!rules.is_empty());
      assert!(rules.windows(2).all(|w| w[0].level < w[1].level));
      assert!(rules.windows(2).all(|w| w[0].trigger_hours_after_due < w[1].trigger_hours_after_due));
    }
  }

  #[test]
  fn test_escalation_target() {
    let mut rule = escalation_rules(Priority::High).remove(0);
    assert_eq!(rule.target(), "role:project_manager");
    rule.target_user_id = Some("user-9".to_string());
    assert_eq!(rule.target(), "user-9");
  }
}
