//! Deadline (calendar) workflow.
//!
//! Tracks a set of deadlines for one entity. While active, every monitor
//! tick dispatches due reminders, marks deadlines overdue and walks their
//! escalation chains. Reminder and escalation dispatch is best-effort: a
//! failed notification is logged and retried on the next tick.

use accu_activity::{CalendarDeadline, Channel, Notification, Priority};
use accu_runtime::{InstanceStatus, StepContext, TimerReason, Workflow, WorkflowError, WorkflowKind};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::policy::{EscalationRule, ReminderEntry, escalation_rules, reminder_schedule};
use crate::{notify, parse_input};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadlineStatus {
  Pending,
  InProgress,
  Completed,
  Overdue,
  Escalated,
  Cancelled,
}

impl DeadlineStatus {
  pub fn is_open(&self) -> bool {
    !matches!(self, DeadlineStatus::Completed | DeadlineStatus::Cancelled)
  }

  pub fn is_overdue(&self) -> bool {
    matches!(self, DeadlineStatus::Overdue | DeadlineStatus::Escalated)
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      DeadlineStatus::Pending => "pending",
      DeadlineStatus::InProgress => "in_progress",
      DeadlineStatus::Completed => "completed",
      DeadlineStatus::Overdue => "overdue",
      DeadlineStatus::Escalated => "escalated",
      DeadlineStatus::Cancelled => "cancelled",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deadline {
  /// `{workflow_id}-d{n}`, numbered in creation order.
  pub id: String,
  /// Id returned by the calendar collaborator.
  #[serde(default)]
  pub calendar_id: Option<String>,
  pub title: String,
  pub description: String,
  pub due_date: DateTime<Utc>,
  pub priority: Priority,
  pub assignee_id: Option<String>,
  pub status: DeadlineStatus,
  pub reminder_schedule: Vec<ReminderEntry>,
  pub escalation_rules: Vec<EscalationRule>,
  pub overdue_notified: bool,
  pub created_at: DateTime<Utc>,
  pub started_at: Option<DateTime<Utc>>,
  pub completed_at: Option<DateTime<Utc>>,
  pub completed_by: Option<String>,
  pub snooze_count: u32,
}

/// Arguments of `createDeadline`, also accepted in the start input.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDeadline {
  pub title: String,
  #[serde(default)]
  pub description: String,
  pub due_date: DateTime<Utc>,
  #[serde(default = "default_priority")]
  pub priority: Priority,
  #[serde(default)]
  pub assignee_id: Option<String>,
}

fn default_priority() -> Priority {
  Priority::Medium
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct StartInput {
  owner_id: Option<String>,
  deadlines: Vec<NewDeadline>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadlineWorkflowState {
  #[default]
  Active,
  Paused,
  Completed,
  Cancelled,
}

impl DeadlineWorkflowState {
  fn as_str(&self) -> &'static str {
    match self {
      DeadlineWorkflowState::Active => "active",
      DeadlineWorkflowState::Paused => "paused",
      DeadlineWorkflowState::Completed => "completed",
      DeadlineWorkflowState::Cancelled => "cancelled",
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadlineWorkflow {
  pub owner_entity_id: String,
  pub owner_id: Option<String>,
  pub state: DeadlineWorkflowState,
  pub deadlines: Vec<Deadline>,
  pub created_at: Option<DateTime<Utc>>,
  pub cancel_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(
  tag = "signal",
  content = "payload",
  rename_all = "camelCase",
  rename_all_fields = "camelCase"
)]
pub enum DeadlineSignal {
  #[serde(alias = "createDeadlineWorkflow")]
  CreateDeadline(NewDeadline),
  StartDeadline {
    deadline_id: String,
  },
  CompleteDeadline {
    deadline_id: String,
    #[serde(default)]
    completed_by: Option<String>,
  },
  SnoozeDeadline {
    deadline_id: String,
    hours: i64,
  },
  CancelDeadline {
    deadline_id: String,
    #[serde(default)]
    reason: Option<String>,
  },
  PauseWorkflow {},
  ResumeWorkflow {},
  CancelWorkflow {
    #[serde(default)]
    reason: Option<String>,
  },
  CompleteWorkflow {},
}

impl DeadlineSignal {
  fn name(&self) -> &'static str {
    match self {
      DeadlineSignal::CreateDeadline(_) => "createDeadline",
      DeadlineSignal::StartDeadline { .. } => "startDeadline",
      DeadlineSignal::CompleteDeadline { .. } => "completeDeadline",
      DeadlineSignal::SnoozeDeadline { .. } => "snoozeDeadline",
      DeadlineSignal::CancelDeadline { .. } => "cancelDeadline",
      DeadlineSignal::PauseWorkflow {} => "pauseWorkflow",
      DeadlineSignal::ResumeWorkflow {} => "resumeWorkflow",
      DeadlineSignal::CancelWorkflow { .. } => "cancelWorkflow",
      DeadlineSignal::CompleteWorkflow {} => "completeWorkflow",
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
  tag = "action",
  content = "details",
  rename_all = "camelCase",
  rename_all_fields = "camelCase"
)]
pub enum DeadlineEvent {
  WorkflowCreated {
    owner_entity_id: String,
    owner_id: Option<String>,
    at: DateTime<Utc>,
  },
  DeadlineCreated {
    deadline: Deadline,
  },
  DeadlineStarted {
    deadline_id: String,
    at: DateTime<Utc>,
  },
  DeadlineCompleted {
    deadline_id: String,
    completed_by: Option<String>,
    at: DateTime<Utc>,
  },
  DeadlineSnoozed {
    deadline_id: String,
    hours: i64,
    due_date: DateTime<Utc>,
    status: DeadlineStatus,
  },
  DeadlineCancelled {
    deadline_id: String,
    reason: Option<String>,
  },
  ReminderSent {
    deadline_id: String,
    index: usize,
    channel: Channel,
    at: DateTime<Utc>,
  },
  ReminderSkipped {
    deadline_id: String,
    index: usize,
    at: DateTime<Utc>,
  },
  DeadlineOverdue {
    deadline_id: String,
    at: DateTime<Utc>,
  },
  OverdueNotified {
    deadline_id: String,
    at: DateTime<Utc>,
  },
  DeadlineEscalated {
    deadline_id: String,
    level: u32,
    target: String,
    at: DateTime<Utc>,
  },
  WorkflowPaused {
    at: DateTime<Utc>,
  },
  WorkflowResumed {
    at: DateTime<Utc>,
  },
  WorkflowCancelled {
    reason: Option<String>,
    at: DateTime<Utc>,
  },
  WorkflowCompleted {
    at: DateTime<Utc>,
  },
}

impl DeadlineWorkflow {
  pub fn deadline(&self, id: &str) -> Result<&Deadline, WorkflowError> {
    self
      .deadlines
      .iter()
      .find(|d| d.id == id)
      .ok_or_else(|| WorkflowError::NotFound {
        item: "deadline",
        id: id.to_string(),
      })
  }

  fn deadline_mut(&mut self, id: &str) -> Option<&mut Deadline> {
    self.deadlines.iter_mut().find(|d| d.id == id)
  }

  fn is_live(&self) -> bool {
    matches!(
      self.state,
      DeadlineWorkflowState::Active | DeadlineWorkflowState::Paused
    )
  }

  fn open_deadline(&self, signal: &str, id: &str) -> Result<&Deadline, WorkflowError> {
    let deadline = self.deadline(id)?;
    if !deadline.status.is_open() {
      return Err(WorkflowError::invalid_transition(signal, deadline.status.as_str()));
    }
    Ok(deadline)
  }

  fn recipient(&self, deadline: &Deadline) -> String {
    deadline
      .assignee_id
      .clone()
      .or_else(|| self.owner_id.clone())
      .unwrap_or_else(|| format!("entity:{}", self.owner_entity_id))
  }

  /// One monitor pass over every open deadline.
  async fn monitor(&self, ctx: &mut StepContext<'_>) -> Vec<DeadlineEvent> {
    let now = ctx.now();
    let mut events = Vec::new();

    for deadline in self.deadlines.iter().filter(|d| d.status.is_open()) {
      if now <= deadline.due_date {
        self.remind(ctx, deadline, &mut events).await;
        continue;
      }

      if !deadline.status.is_overdue() {
        events.push(DeadlineEvent::DeadlineOverdue {
          deadline_id: deadline.id.clone(),
          at: now,
        });
      }
      if !deadline.overdue_notified {
        let notification = Notification::new(
          Channel::Email,
          self.recipient(deadline),
          format!("Overdue: {}", deadline.title),
          format!("'{}' was due {}", deadline.title, deadline.due_date),
        )
        .with_metadata(json!({ "deadlineId": deadline.id, "priority": deadline.priority }));
        if notify(ctx, &notification).await {
          events.push(DeadlineEvent::OverdueNotified {
            deadline_id: deadline.id.clone(),
            at: now,
          });
        }
      }
      self.escalate(ctx, deadline, &mut events).await;
    }

    events
  }

  /// Send the most imminent due reminder and skip the older ones.
  async fn remind(&self, ctx: &mut StepContext<'_>, deadline: &Deadline, events: &mut Vec<DeadlineEvent>) {
    let now = ctx.now();
    let eligible: Vec<usize> = deadline
      .reminder_schedule
      .iter()
      .enumerate()
      .filter(|(_, r)| {
        !r.sent
          && deadline
            .due_date
            .checked_sub_signed(Duration::hours(r.hours_before_due))
            .is_none_or(|at| at <= now)
      })
      .map(|(index, _)| index)
      .collect();
    let Some(&latest) = eligible
      .iter()
      .min_by_key(|&&index| deadline.reminder_schedule[index].hours_before_due)
    else {
      return;
    };

    let entry = &deadline.reminder_schedule[latest];
    let notification = Notification::new(
      entry.channel,
      self.recipient(deadline),
      format!("Reminder: {}", deadline.title),
      format!("'{}' is due {}", deadline.title, deadline.due_date),
    )
    .with_metadata(json!({
      "deadlineId": deadline.id,
      "hoursBeforeDue": entry.hours_before_due,
      "priority": deadline.priority,
    }));
    if !notify(ctx, &notification).await {
      return;
    }

    events.push(DeadlineEvent::ReminderSent {
      deadline_id: deadline.id.clone(),
      index: latest,
      channel: entry.channel,
      at: now,
    });
    for &index in eligible.iter().filter(|&&index| index != latest) {
      events.push(DeadlineEvent::ReminderSkipped {
        deadline_id: deadline.id.clone(),
        index,
        at: now,
      });
    }
  }

  /// Fire due escalation rules in level order, stopping at the first rule
  /// that is not due yet or could not be dispatched.
  async fn escalate(&self, ctx: &mut StepContext<'_>, deadline: &Deadline, events: &mut Vec<DeadlineEvent>) {
    let now = ctx.now();
    let mut rules: Vec<&EscalationRule> = deadline.escalation_rules.iter().collect();
    rules.sort_by_key(|rule| rule.level);

    for rule in rules.into_iter().filter(|rule| !rule.escalated) {
      let due = deadline
        .due_date
        .checked_add_signed(Duration::hours(rule.trigger_hours_after_due));
      if due.is_none_or(|at| at > now) {
        break;
      }
      let target = rule.target();
      let notification = Notification::new(
        Channel::Email,
        target.clone(),
        format!("Escalation level {}: {}", rule.level, deadline.title),
        format!(
          "'{}' has been overdue since {} and is escalated to {}",
          deadline.title, deadline.due_date, rule.target_role
        ),
      )
      .with_metadata(json!({ "deadlineId": deadline.id, "level": rule.level }));
      if !notify(ctx, &notification).await {
        break;
      }
      events.push(DeadlineEvent::DeadlineEscalated {
        deadline_id: deadline.id.clone(),
        level: rule.level,
        target,
        at: now,
      });
    }
  }

  fn summary(&self) -> Value {
    let open = self.deadlines.iter().filter(|d| d.status.is_open()).count();
    let overdue = self.deadlines.iter().filter(|d| d.status.is_overdue()).count();
    let completed = self
      .deadlines
      .iter()
      .filter(|d| d.status == DeadlineStatus::Completed)
      .count();
    let next_due = self
      .deadlines
      .iter()
      .filter(|d| d.status.is_open())
      .map(|d| d.due_date)
      .min();
    json!({
      "state": self.state.as_str(),
      "ownerEntityId": self.owner_entity_id,
      "total": self.deadlines.len(),
      "open": open,
      "overdue": overdue,
      "completed": completed,
      "nextDue": next_due,
    })
  }
}

/// Id of the `n`th deadline of a workflow, counting from one.
fn deadline_id(workflow_id: &str, n: usize) -> String {
  format!("{}-d{}", workflow_id, n)
}

async fn create_deadline(
  ctx: &mut StepContext<'_>,
  input: &NewDeadline,
  id: String,
) -> Result<Deadline, WorkflowError> {
  let calendar = CalendarDeadline {
    owner_entity_id: ctx.entity_id().to_string(),
    title: input.title.clone(),
    description: input.description.clone(),
    due_date: input.due_date,
    priority: input.priority,
    assignee_id: input.assignee_id.clone(),
  };
  let calendar_id = ctx.create_calendar_deadline(&calendar).await?;

  Ok(Deadline {
    id,
    calendar_id: Some(calendar_id).filter(|id| !id.is_empty()),
    title: input.title.clone(),
    description: input.description.clone(),
    due_date: input.due_date,
    priority: input.priority,
    assignee_id: input.assignee_id.clone(),
    status: DeadlineStatus::Pending,
    reminder_schedule: reminder_schedule(input.priority),
    escalation_rules: escalation_rules(input.priority),
    overdue_notified: false,
    created_at: ctx.now(),
    started_at: None,
    completed_at: None,
    completed_by: None,
    snooze_count: 0,
  })
}

fn snoozed_due_date(deadline: &Deadline, hours: i64) -> Result<DateTime<Utc>, WorkflowError> {
  Duration::try_hours(hours)
    .and_then(|delay| deadline.due_date.checked_add_signed(delay))
    .ok_or_else(|| WorkflowError::precondition(format!("cannot snooze '{}' by {} hours", deadline.id, hours)))
}

#[async_trait]
impl Workflow for DeadlineWorkflow {
  type Event = DeadlineEvent;
  type Signal = DeadlineSignal;

  const KIND: WorkflowKind = WorkflowKind::Deadline;
  const SIGNALS: &'static [&'static str] = &[
    "createDeadline",
    "createDeadlineWorkflow",
    "startDeadline",
    "completeDeadline",
    "snoozeDeadline",
    "cancelDeadline",
    "pauseWorkflow",
    "resumeWorkflow",
    "cancelWorkflow",
    "completeWorkflow",
  ];

  async fn start(ctx: &mut StepContext<'_>, input: &Value) -> Result<Vec<DeadlineEvent>, WorkflowError> {
    let input: StartInput = parse_input(input)?;
    let mut events = vec![DeadlineEvent::WorkflowCreated {
      owner_entity_id: ctx.entity_id().to_string(),
      owner_id: input.owner_id,
      at: ctx.now(),
    }];
    for (index, new) in input.deadlines.iter().enumerate() {
      let id = deadline_id(ctx.workflow_id(), index + 1);
      let deadline = create_deadline(ctx, new, id).await?;
      events.push(DeadlineEvent::DeadlineCreated { deadline });
    }
    Ok(events)
  }

  fn apply(&mut self, event: &DeadlineEvent) {
    match event {
      DeadlineEvent::WorkflowCreated {
        owner_entity_id,
        owner_id,
        at,
      } => {
        self.owner_entity_id = owner_entity_id.clone();
        self.owner_id = owner_id.clone();
        self.state = DeadlineWorkflowState::Active;
        self.created_at = Some(*at);
      }
      DeadlineEvent::DeadlineCreated { deadline } => {
        if self.deadline(&deadline.id).is_err() {
          self.deadlines.push(deadline.clone());
        }
      }
      DeadlineEvent::DeadlineStarted { deadline_id, at } => {
        if let Some(d) = self.deadline_mut(deadline_id) {
          d.status = DeadlineStatus::InProgress;
          d.started_at = Some(*at);
        }
      }
      DeadlineEvent::DeadlineCompleted {
        deadline_id,
        completed_by,
        at,
      } => {
        if let Some(d) = self.deadline_mut(deadline_id) {
          d.status = DeadlineStatus::Completed;
          d.completed_at = Some(*at);
          d.completed_by = completed_by.clone();
        }
      }
      DeadlineEvent::DeadlineSnoozed {
        deadline_id,
        due_date,
        status,
        ..
      } => {
        if let Some(d) = self.deadline_mut(deadline_id) {
          d.due_date = *due_date;
          d.snooze_count += 1;
          for reminder in &mut d.reminder_schedule {
            reminder.reset();
          }
          if !status.is_overdue() {
            d.overdue_notified = false;
          }
          d.status = *status;
        }
      }
      DeadlineEvent::DeadlineCancelled { deadline_id, .. } => {
        if let Some(d) = self.deadline_mut(deadline_id) {
          d.status = DeadlineStatus::Cancelled;
        }
      }
      DeadlineEvent::ReminderSent {
        deadline_id,
        index,
        at,
        ..
      } => {
        if let Some(r) = self
          .deadline_mut(deadline_id)
          .and_then(|d| d.reminder_schedule.get_mut(*index))
        {
          r.sent = true;
          r.sent_at = Some(*at);
        }
      }
      DeadlineEvent::ReminderSkipped {
        deadline_id,
        index,
        at,
      } => {
        if let Some(r) = self
          .deadline_mut(deadline_id)
          .and_then(|d| d.reminder_schedule.get_mut(*index))
        {
          r.sent = true;
          r.sent_at = Some(*at);
          r.skipped = true;
        }
      }
      DeadlineEvent::DeadlineOverdue { deadline_id, .. } => {
        if let Some(d) = self.deadline_mut(deadline_id) {
          d.status = DeadlineStatus::Overdue;
        }
      }
      DeadlineEvent::OverdueNotified { deadline_id, .. } => {
        if let Some(d) = self.deadline_mut(deadline_id) {
          d.overdue_notified = true;
        }
      }
      DeadlineEvent::DeadlineEscalated {
        deadline_id,
        level,
        at,
        ..
      } => {
        if let Some(d) = self.deadline_mut(deadline_id) {
          d.status = DeadlineStatus::Escalated;
          if let Some(rule) = d.escalation_rules.iter_mut().find(|r| r.level == *level) {
            rule.escalated = true;
            rule.escalated_at = Some(*at);
          }
        }
      }
      DeadlineEvent::WorkflowPaused { .. } => self.state = DeadlineWorkflowState::Paused,
      DeadlineEvent::WorkflowResumed { .. } => self.state = DeadlineWorkflowState::Active,
      DeadlineEvent::WorkflowCancelled { reason, .. } => {
        self.state = DeadlineWorkflowState::Cancelled;
        self.cancel_reason = reason.clone();
      }
      DeadlineEvent::WorkflowCompleted { .. } => self.state = DeadlineWorkflowState::Completed,
    }
  }

  fn status(&self) -> InstanceStatus {
    match self.state {
      DeadlineWorkflowState::Active => InstanceStatus::Active,
      DeadlineWorkflowState::Paused => InstanceStatus::Paused,
      DeadlineWorkflowState::Completed => InstanceStatus::Completed,
      DeadlineWorkflowState::Cancelled => InstanceStatus::Cancelled,
    }
  }

  fn state_name(&self) -> String {
    self.state.as_str().to_string()
  }

  fn check(&self, signal: &DeadlineSignal) -> Result<(), WorkflowError> {
    let name = signal.name();
    let state = self.state.as_str();
    match signal {
      DeadlineSignal::PauseWorkflow {} if self.state != DeadlineWorkflowState::Active => {
        return Err(WorkflowError::invalid_transition(name, state));
      }
      DeadlineSignal::ResumeWorkflow {} if self.state != DeadlineWorkflowState::Paused => {
        return Err(WorkflowError::invalid_transition(name, state));
      }
      _ if !self.is_live() => return Err(WorkflowError::invalid_transition(name, state)),
      _ => {}
    }

    match signal {
      DeadlineSignal::CreateDeadline(new) => {
        if new.title.trim().is_empty() {
          return Err(WorkflowError::precondition("deadline title must not be empty"));
        }
      }
      DeadlineSignal::StartDeadline { deadline_id } => {
        let deadline = self.deadline(deadline_id)?;
        if deadline.status != DeadlineStatus::Pending {
          return Err(WorkflowError::invalid_transition(name, deadline.status.as_str()));
        }
      }
      DeadlineSignal::CompleteDeadline { deadline_id, .. }
      | DeadlineSignal::CancelDeadline { deadline_id, .. } => {
        self.open_deadline(name, deadline_id)?;
      }
      DeadlineSignal::SnoozeDeadline { deadline_id, hours } => {
        if *hours <= 0 {
          return Err(WorkflowError::precondition("snooze hours must be positive"));
        }
        let deadline = self.open_deadline(name, deadline_id)?;
        snoozed_due_date(deadline, *hours)?;
      }
      DeadlineSignal::CompleteWorkflow {} => {
        let open: Vec<&str> = self
          .deadlines
          .iter()
          .filter(|d| d.status.is_open())
          .map(|d| d.id.as_str())
          .collect();
        if !open.is_empty() {
          return Err(WorkflowError::precondition(format!(
            "open deadlines remain: {}",
            open.join(", ")
          )));
        }
      }
      DeadlineSignal::PauseWorkflow {}
      | DeadlineSignal::ResumeWorkflow {}
      | DeadlineSignal::CancelWorkflow { .. } => {}
    }
    Ok(())
  }

  async fn on_signal(
    &self,
    ctx: &mut StepContext<'_>,
    signal: DeadlineSignal,
  ) -> Result<Vec<DeadlineEvent>, WorkflowError> {
    let now = ctx.now();
    let events = match signal {
      DeadlineSignal::CreateDeadline(new) => {
        let id = deadline_id(ctx.workflow_id(), self.deadlines.len() + 1);
        if self.deadline(&id).is_ok() {
          return Err(WorkflowError::precondition(format!("deadline {} already exists", id)));
        }
        let deadline = create_deadline(ctx, &new, id).await?;
        vec![DeadlineEvent::DeadlineCreated { deadline }]
      }
      DeadlineSignal::StartDeadline { deadline_id } => {
        vec![DeadlineEvent::DeadlineStarted { deadline_id, at: now }]
      }
      DeadlineSignal::CompleteDeadline {
        deadline_id,
        completed_by,
      } => {
        let deadline = self.deadline(&deadline_id)?;
        let notification = Notification::new(
          Channel::InApp,
          self.recipient(deadline),
          format!("Completed: {}", deadline.title),
          format!("'{}' was marked complete", deadline.title),
        )
        .with_metadata(json!({ "deadlineId": deadline.id }));
        notify(ctx, &notification).await;
        vec![DeadlineEvent::DeadlineCompleted {
          deadline_id,
          completed_by,
          at: now,
        }]
      }
      DeadlineSignal::SnoozeDeadline { deadline_id, hours } => {
        let deadline = self.deadline(&deadline_id)?;
        let due_date = snoozed_due_date(deadline, hours)?;
        let status = if due_date > now && deadline.status.is_overdue() {
          if deadline.started_at.is_some() {
            DeadlineStatus::InProgress
          } else {
            DeadlineStatus::Pending
          }
        } else {
          deadline.status
        };
        vec![DeadlineEvent::DeadlineSnoozed {
          deadline_id,
          hours,
          due_date,
          status,
        }]
      }
      DeadlineSignal::CancelDeadline {
        deadline_id,
        reason,
      } => vec![DeadlineEvent::DeadlineCancelled {
        deadline_id,
        reason,
      }],
      DeadlineSignal::PauseWorkflow {} => vec![DeadlineEvent::WorkflowPaused { at: now }],
      DeadlineSignal::ResumeWorkflow {} => vec![DeadlineEvent::WorkflowResumed { at: now }],
      DeadlineSignal::CancelWorkflow { reason } => {
        vec![DeadlineEvent::WorkflowCancelled { reason, at: now }]
      }
      DeadlineSignal::CompleteWorkflow {} => vec![DeadlineEvent::WorkflowCompleted { at: now }],
    };
    Ok(events)
  }

  async fn on_timer(
    &self,
    ctx: &mut StepContext<'_>,
    reason: &TimerReason,
  ) -> Result<Vec<DeadlineEvent>, WorkflowError> {
    match reason {
      TimerReason::Tick if self.state == DeadlineWorkflowState::Active => Ok(self.monitor(ctx).await),
      _ => Ok(Vec::new()),
    }
  }

  fn ticks(&self) -> bool {
    self.state == DeadlineWorkflowState::Active
  }

  fn query(&self, name: &str, args: &Value, now: DateTime<Utc>) -> Result<Value, WorkflowError> {
    match name {
      "getStatus" => Ok(self.summary()),
      "getDeadlines" => {
        let status = args.get("status").and_then(Value::as_str);
        let deadlines: Vec<&Deadline> = self
          .deadlines
          .iter()
          .filter(|d| status.is_none_or(|s| d.status.as_str() == s))
          .collect();
        Ok(serde_json::to_value(deadlines)?)
      }
      "getDeadline" => {
        let id = args
          .get("deadlineId")
          .and_then(Value::as_str)
          .ok_or_else(|| WorkflowError::InvalidPayload {
            signal: name.to_string(),
            message: "missing deadlineId".to_string(),
          })?;
        Ok(serde_json::to_value(self.deadline(id)?)?)
      }
      "getOverdue" => {
        let overdue: Vec<&Deadline> = self
          .deadlines
          .iter()
          .filter(|d| d.status.is_overdue())
          .collect();
        Ok(serde_json::to_value(overdue)?)
      }
      "getUpcoming" => {
        let hours = args.get("hours").and_then(Value::as_i64).unwrap_or(24);
        let until = Duration::try_hours(hours)
          .and_then(|window| now.checked_add_signed(window))
          .ok_or_else(|| WorkflowError::InvalidPayload {
            signal: name.to_string(),
            message: format!("hours out of range: {}", hours),
          })?;
        let mut upcoming: Vec<&Deadline> = self
          .deadlines
          .iter()
          .filter(|d| d.status.is_open() && d.due_date >= now && d.due_date <= until)
          .collect();
        upcoming.sort_by_key(|d| d.due_date);
        Ok(serde_json::to_value(upcoming)?)
      }
      _ => Err(WorkflowError::UnknownQuery {
        query: name.to_string(),
      }),
    }
  }
}
