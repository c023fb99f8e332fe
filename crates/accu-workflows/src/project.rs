//! Project lifecycle workflow.
//!
//! Tracks milestones with dependencies and task progress. Phases are
//! advisory: they only move forward and never gate a signal. While active,
//! the monitor tick marks overdue milestones, sends "due soon" reminders,
//! puts stalled projects on hold and completes projects whose work is done.

use std::collections::{HashMap, HashSet};

use accu_activity::{CalendarDeadline, Channel, Notification, Priority};
use accu_runtime::{InstanceStatus, StepContext, TimerReason, Workflow, WorkflowError, WorkflowKind};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::warn;

use crate::{notify, parse_input};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectState {
  #[default]
  Draft,
  Active,
  OnHold,
  Completed,
  Cancelled,
}

impl ProjectState {
  pub fn as_str(&self) -> &'static str {
    match self {
      ProjectState::Draft => "draft",
      ProjectState::Active => "active",
      ProjectState::OnHold => "on_hold",
      ProjectState::Completed => "completed",
      ProjectState::Cancelled => "cancelled",
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
  #[default]
  Initiation,
  Planning,
  Execution,
  Closure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
  Pending,
  Overdue,
  Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Milestone {
  pub id: String,
  pub title: String,
  pub due_date: DateTime<Utc>,
  pub dependencies: Vec<String>,
  pub status: MilestoneStatus,
  pub deadline_id: Option<String>,
  pub reminder_sent: bool,
  pub overdue_notified: bool,
  pub completed_at: Option<DateTime<Utc>>,
  pub completed_by: Option<String>,
}

/// A milestone as given in the start input or `addMilestone`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MilestoneSpec {
  pub id: String,
  pub title: String,
  pub due_date: DateTime<Utc>,
  #[serde(default)]
  pub dependencies: Vec<String>,
}

impl MilestoneSpec {
  fn into_milestone(self, deadline_id: Option<String>) -> Milestone {
    Milestone {
      id: self.id,
      title: self.title,
      due_date: self.due_date,
      dependencies: self.dependencies,
      status: MilestoneStatus::Pending,
      deadline_id,
      reminder_sent: false,
      overdue_notified: false,
      completed_at: None,
      completed_by: None,
    }
  }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct StartInput {
  name: String,
  owner_id: Option<String>,
  milestones: Vec<MilestoneSpec>,
  target_end_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectWorkflow {
  pub project_id: String,
  pub name: String,
  pub owner_id: Option<String>,
  pub state: ProjectState,
  pub phase: Phase,
  pub milestones: Vec<Milestone>,
  /// Non-milestone tasks reported through `updateProgress`.
  pub extra_tasks_total: u64,
  pub extra_tasks_completed: u64,
  pub created_at: Option<DateTime<Utc>>,
  pub started_at: Option<DateTime<Utc>>,
  pub target_end_date: Option<DateTime<Utc>>,
  pub last_progress_at: Option<DateTime<Utc>>,
  pub completed_at: Option<DateTime<Utc>>,
  pub hold_reason: Option<String>,
  pub auto_held: bool,
  pub cancel_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(
  tag = "signal",
  content = "payload",
  rename_all = "camelCase",
  rename_all_fields = "camelCase"
)]
pub enum ProjectSignal {
  StartProject {},
  CompleteMilestone {
    milestone_id: String,
  },
  AddMilestone(MilestoneSpec),
  UpdateProgress {
    tasks_total: u64,
    tasks_completed: u64,
  },
  PutOnHold {
    #[serde(default)]
    reason: Option<String>,
  },
  ResumeProject {},
  CompleteProject {},
  CancelProject {
    #[serde(default)]
    reason: Option<String>,
  },
}

impl ProjectSignal {
  fn name(&self) -> &'static str {
    match self {
      ProjectSignal::StartProject {} => "startProject",
      ProjectSignal::CompleteMilestone { .. } => "completeMilestone",
      ProjectSignal::AddMilestone(_) => "addMilestone",
      ProjectSignal::UpdateProgress { .. } => "updateProgress",
      ProjectSignal::PutOnHold { .. } => "putOnHold",
      ProjectSignal::ResumeProject {} => "resumeProject",
      ProjectSignal::CompleteProject {} => "completeProject",
      ProjectSignal::CancelProject { .. } => "cancelProject",
    }
  }

  fn allowed_in(&self) -> &'static [ProjectState] {
    use ProjectState::*;
    match self {
      ProjectSignal::StartProject {} => &[Draft],
      ProjectSignal::CompleteMilestone { .. }
      | ProjectSignal::UpdateProgress { .. }
      | ProjectSignal::PutOnHold { .. }
      | ProjectSignal::CompleteProject {} => &[Active],
      ProjectSignal::AddMilestone(_) | ProjectSignal::CancelProject { .. } => &[Draft, Active, OnHold],
      ProjectSignal::ResumeProject {} => &[OnHold],
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
pub enum ProjectEvent {
  ProjectCreated {
    project_id: String,
    name: String,
    owner_id: Option<String>,
    milestones: Vec<Milestone>,
    target_end_date: Option<DateTime<Utc>>,
    at: DateTime<Utc>,
  },
  ProjectStarted {
    at: DateTime<Utc>,
  },
  MilestoneScheduled {
    milestone_id: String,
    deadline_id: String,
  },
  MilestoneAdded {
    milestone: Milestone,
    at: DateTime<Utc>,
  },
  MilestoneCompleted {
    milestone_id: String,
    completed_by: String,
    at: DateTime<Utc>,
  },
  ProgressUpdated {
    tasks_total: u64,
    tasks_completed: u64,
    at: DateTime<Utc>,
  },
  MilestoneOverdue {
    milestone_id: String,
    at: DateTime<Utc>,
  },
  OverdueNotified {
    milestone_id: String,
  },
  MilestoneReminderSent {
    milestone_id: String,
    at: DateTime<Utc>,
  },
  PhaseAdvanced {
    phase: Phase,
    at: DateTime<Utc>,
  },
  ProjectPutOnHold {
    reason: Option<String>,
    automatic: bool,
    at: DateTime<Utc>,
  },
  ProjectResumed {
    at: DateTime<Utc>,
  },
  ProjectCompleted {
    automatic: bool,
    at: DateTime<Utc>,
  },
  ProjectCancelled {
    reason: Option<String>,
    at: DateTime<Utc>,
  },
}

/// Reject duplicate ids, unknown dependencies and dependency cycles.
fn validate_milestones<'a>(milestones: impl IntoIterator<Item = (&'a str, &'a [String])>) -> Result<(), WorkflowError> {
  let mut graph: HashMap<&str, &[String]> = HashMap::new();
  for (id, deps) in milestones {
    if graph.insert(id, deps).is_some() {
      return Err(WorkflowError::precondition(format!("duplicate milestone id '{}'", id)));
    }
  }
  for (id, deps) in &graph {
    if let Some(missing) = deps.iter().find(|d| !graph.contains_key(d.as_str())) {
      return Err(WorkflowError::precondition(format!(
        "milestone '{}' depends on unknown milestone '{}'",
        id, missing
      )));
    }
  }

  // Depth-first search; a node met again while still on the stack closes a cycle.
  fn visit<'a>(
    id: &'a str,
    graph: &HashMap<&'a str, &'a [String]>,
    done: &mut HashSet<&'a str>,
    stack: &mut HashSet<&'a str>,
  ) -> Result<(), WorkflowError> {
    if done.contains(id) {
      return Ok(());
    }
    if !stack.insert(id) {
      return Err(WorkflowError::precondition(format!(
        "milestone '{}' is part of a dependency cycle",
        id
      )));
    }
    for dep in graph.get(id).copied().unwrap_or_default() {
      visit(dep.as_str(), graph, done, stack)?;
    }
    stack.remove(id);
    done.insert(id);
    Ok(())
  }

  let mut done = HashSet::new();
  let mut stack = HashSet::new();
  let mut ids: Vec<&str> = graph.keys().copied().collect();
  ids.sort_unstable();
  for id in ids {
    visit(id, &graph, &mut done, &mut stack)?;
  }
  Ok(())
}

impl ProjectWorkflow {
  pub fn milestone(&self, id: &str) -> Result<&Milestone, WorkflowError> {
    self
      .milestones
      .iter()
      .find(|m| m.id == id)
      .ok_or_else(|| WorkflowError::NotFound {
        item: "milestone",
        id: id.to_string(),
      })
  }

  fn milestone_mut(&mut self, id: &str) -> Option<&mut Milestone> {
    self.milestones.iter_mut().find(|m| m.id == id)
  }

  pub fn tasks_total(&self) -> u64 {
    (self.milestones.len() as u64).saturating_add(self.extra_tasks_total)
  }

  pub fn tasks_completed(&self) -> u64 {
    let milestones = self
      .milestones
      .iter()
      .filter(|m| m.status == MilestoneStatus::Completed)
      .count() as u64;
    milestones.saturating_add(self.extra_tasks_completed)
  }

  /// Completed share of all tasks, in percent. No tasks counts as done.
  pub fn completion_percentage(&self) -> f64 {
    let total = self.tasks_total();
    if total == 0 {
      return 100.0;
    }
    100.0 * self.tasks_completed() as f64 / total as f64
  }

  fn work_done(&self) -> bool {
    self.milestones.iter().all(|m| m.status == MilestoneStatus::Completed)
      && self.completion_percentage() >= 100.0
  }

  fn owner(&self) -> String {
    self
      .owner_id
      .clone()
      .unwrap_or_else(|| format!("entity:{}", self.project_id))
  }

  /// Phase the heuristic puts the project in at `now`.
  fn target_phase(&self, now: DateTime<Utc>) -> Phase {
    match self.state {
      ProjectState::Draft => Phase::Initiation,
      ProjectState::Completed => Phase::Closure,
      ProjectState::Cancelled => self.phase,
      ProjectState::Active | ProjectState::OnHold => {
        let has_tasks = self.tasks_total() > 0;
        let percent = self.completion_percentage();
        if has_tasks && percent >= 90.0 {
          return Phase::Closure;
        }
        let elapsed = match (self.started_at, self.target_end_date) {
          (Some(start), Some(end)) if end > start => {
            (now - start).num_seconds() as f64 / (end - start).num_seconds() as f64
          }
          _ => 0.0,
        };
        if (has_tasks && percent >= 25.0) || elapsed >= 0.25 {
          Phase::Execution
        } else {
          Phase::Planning
        }
      }
    }
  }

  /// Append a `PhaseAdvanced` event when `events` move the project forward.
  fn with_phase(&self, mut events: Vec<ProjectEvent>, now: DateTime<Utc>) -> Vec<ProjectEvent> {
    let mut next = self.clone();
    for event in &events {
      next.apply(event);
    }
    let phase = next.target_phase(now);
    if phase > next.phase {
      events.push(ProjectEvent::PhaseAdvanced { phase, at: now });
    }
    events
  }

  /// Create the calendar deadline backing a milestone.
  async fn schedule(
    &self,
    ctx: &mut StepContext<'_>,
    id: &str,
    title: &str,
    due_date: DateTime<Utc>,
  ) -> Result<String, WorkflowError> {
    let deadline = CalendarDeadline {
      owner_entity_id: self.project_id.clone(),
      title: format!("{}: {}", self.name, title),
      description: format!("Milestone {} of project {}", id, self.name),
      due_date,
      priority: Priority::Medium,
      assignee_id: self.owner_id.clone(),
    };
    ctx.create_calendar_deadline(&deadline).await
  }

  async fn monitor(&self, ctx: &mut StepContext<'_>) -> Vec<ProjectEvent> {
    let now = ctx.now();
    let reminder_hours = ctx.config().project.reminder_hours_before;
    let stall_days = ctx.config().project.stall_days;
    let mut events = Vec::new();

    for milestone in self.milestones.iter().filter(|m| m.status != MilestoneStatus::Completed) {
      if milestone.due_date < now {
        if milestone.status != MilestoneStatus::Overdue {
          events.push(ProjectEvent::MilestoneOverdue {
            milestone_id: milestone.id.clone(),
            at: now,
          });
        }
        if !milestone.overdue_notified {
          let notice = Notification::new(
            Channel::Email,
            self.owner(),
            format!("Milestone overdue: {}", milestone.title),
            format!("'{}' of {} was due {}", milestone.title, self.name, milestone.due_date),
          )
          .with_metadata(json!({ "projectId": self.project_id, "milestoneId": milestone.id }));
          if notify(ctx, &notice).await {
            events.push(ProjectEvent::OverdueNotified {
              milestone_id: milestone.id.clone(),
            });
          }
        }
      } else if !milestone.reminder_sent
        && milestone
          .due_date
          .checked_sub_signed(Duration::hours(reminder_hours))
          .is_some_and(|at| at <= now)
      {
        let notice = Notification::new(
          Channel::InApp,
          self.owner(),
          format!("Milestone due soon: {}", milestone.title),
          format!("'{}' of {} is due {}", milestone.title, self.name, milestone.due_date),
        )
        .with_metadata(json!({ "projectId": self.project_id, "milestoneId": milestone.id }));
        if notify(ctx, &notice).await {
          events.push(ProjectEvent::MilestoneReminderSent {
            milestone_id: milestone.id.clone(),
            at: now,
          });
        }
      }
    }

    if self.tasks_total() > 0 && self.work_done() {
      match ctx.update_entity_status(ProjectState::Completed.as_str(), json!({ "automatic": true })).await {
        Ok(()) => events.push(ProjectEvent::ProjectCompleted { automatic: true, at: now }),
        Err(e) => warn!(workflow_id = %ctx.workflow_id(), error = %e, "auto_complete_deferred"),
      }
    } else if let Some(last) = self.last_progress_at {
      if now - last >= Duration::days(stall_days) {
        let reason = format!("no progress for {} days", stall_days);
        let metadata = json!({ "reason": reason, "automatic": true });
        match ctx.update_entity_status(ProjectState::OnHold.as_str(), metadata).await {
          Ok(()) => events.push(ProjectEvent::ProjectPutOnHold {
            reason: Some(reason),
            automatic: true,
            at: now,
          }),
          Err(e) => warn!(workflow_id = %ctx.workflow_id(), error = %e, "stall_hold_deferred"),
        }
      }
    }

    self.with_phase(events, now)
  }

  fn progress(&self) -> Value {
    json!({
      "tasksTotal": self.tasks_total(),
      "tasksCompleted": self.tasks_completed(),
      "completionPercentage": self.completion_percentage(),
      "phase": self.phase,
    })
  }
}

#[async_trait]
impl Workflow for ProjectWorkflow {
  type Event = ProjectEvent;
  type Signal = ProjectSignal;

  const KIND: WorkflowKind = WorkflowKind::ProjectLifecycle;
  const SIGNALS: &'static [&'static str] = &[
    "startProject",
    "completeMilestone",
    "addMilestone",
    "updateProgress",
    "putOnHold",
    "resumeProject",
    "completeProject",
    "cancelProject",
  ];

  async fn start(ctx: &mut StepContext<'_>, input: &Value) -> Result<Vec<ProjectEvent>, WorkflowError> {
    let input: StartInput = parse_input(input)?;
    validate_milestones(
      input
        .milestones
        .iter()
        .map(|m| (m.id.as_str(), m.dependencies.as_slice())),
    )?;
    let name = if input.name.is_empty() {
      ctx.entity_id().to_string()
    } else {
      input.name
    };
    Ok(vec![ProjectEvent::ProjectCreated {
      project_id: ctx.entity_id().to_string(),
      name,
      owner_id: input.owner_id,
      milestones: input
        .milestones
        .into_iter()
        .map(|m| m.into_milestone(None))
        .collect(),
      target_end_date: input.target_end_date,
      at: ctx.now(),
    }])
  }

  fn apply(&mut self, event: &ProjectEvent) {
    match event {
      ProjectEvent::ProjectCreated {
        project_id,
        name,
        owner_id,
        milestones,
        target_end_date,
        at,
      } => {
        self.project_id = project_id.clone();
        self.name = name.clone();
        self.owner_id = owner_id.clone();
        self.milestones = milestones.clone();
        self.target_end_date = *target_end_date;
        self.state = ProjectState::Draft;
        self.phase = Phase::Initiation;
        self.created_at = Some(*at);
      }
      ProjectEvent::ProjectStarted { at } => {
        self.state = ProjectState::Active;
        self.started_at = Some(*at);
        self.last_progress_at = Some(*at);
      }
      ProjectEvent::MilestoneScheduled {
        milestone_id,
        deadline_id,
      } => {
        if let Some(m) = self.milestone_mut(milestone_id) {
          m.deadline_id = Some(deadline_id.clone());
        }
      }
      ProjectEvent::MilestoneAdded { milestone, at } => {
        self.milestones.push(milestone.clone());
        if self.state != ProjectState::Draft {
          self.last_progress_at = Some(*at);
        }
      }
      ProjectEvent::MilestoneCompleted {
        milestone_id,
        completed_by,
        at,
      } => {
        if let Some(m) = self.milestone_mut(milestone_id) {
          m.status = MilestoneStatus::Completed;
          m.completed_at = Some(*at);
          m.completed_by = Some(completed_by.clone());
        }
        self.last_progress_at = Some(*at);
      }
      ProjectEvent::ProgressUpdated {
        tasks_total,
        tasks_completed,
        at,
      } => {
        self.extra_tasks_total = *tasks_total;
        self.extra_tasks_completed = *tasks_completed;
        self.last_progress_at = Some(*at);
      }
      ProjectEvent::MilestoneOverdue { milestone_id, .. } => {
        if let Some(m) = self.milestone_mut(milestone_id) {
          m.status = MilestoneStatus::Overdue;
        }
      }
      ProjectEvent::OverdueNotified { milestone_id } => {
        if let Some(m) = self.milestone_mut(milestone_id) {
          m.overdue_notified = true;
        }
      }
      ProjectEvent::MilestoneReminderSent { milestone_id, .. } => {
        if let Some(m) = self.milestone_mut(milestone_id) {
          m.reminder_sent = true;
        }
      }
      ProjectEvent::PhaseAdvanced { phase, .. } => {
        if *phase > self.phase {
          self.phase = *phase;
        }
      }
      ProjectEvent::ProjectPutOnHold { reason, automatic, .. } => {
        self.state = ProjectState::OnHold;
        self.hold_reason = reason.clone();
        self.auto_held = *automatic;
      }
      ProjectEvent::ProjectResumed { at } => {
        self.state = ProjectState::Active;
        self.hold_reason = None;
        self.auto_held = false;
        self.last_progress_at = Some(*at);
      }
      ProjectEvent::ProjectCompleted { at, .. } => {
        self.state = ProjectState::Completed;
        self.completed_at = Some(*at);
      }
      ProjectEvent::ProjectCancelled { reason, .. } => {
        self.state = ProjectState::Cancelled;
        self.cancel_reason = reason.clone();
      }
    }
  }

  fn status(&self) -> InstanceStatus {
    match self.state {
      ProjectState::Draft | ProjectState::Active => InstanceStatus::Active,
      ProjectState::OnHold => InstanceStatus::Paused,
      ProjectState::Completed => InstanceStatus::Completed,
      ProjectState::Cancelled => InstanceStatus::Cancelled,
    }
  }

  fn state_name(&self) -> String {
    self.state.as_str().to_string()
  }

  fn check(&self, signal: &ProjectSignal) -> Result<(), WorkflowError> {
    if !signal.allowed_in().contains(&self.state) {
      return Err(WorkflowError::invalid_transition(signal.name(), self.state.as_str()));
    }

    match signal {
      ProjectSignal::CompleteMilestone { milestone_id } => {
        let milestone = self.milestone(milestone_id)?;
        if milestone.status == MilestoneStatus::Completed {
          return Err(WorkflowError::invalid_transition(signal.name(), "completed"));
        }
        let pending: Vec<String> = milestone
          .dependencies
          .iter()
          .filter(|dep| {
            !self
              .milestone(dep)
              .is_ok_and(|m| m.status == MilestoneStatus::Completed)
          })
          .cloned()
          .collect();
        if !pending.is_empty() {
          return Err(WorkflowError::DependencyNotMet {
            milestone_id: milestone_id.clone(),
            pending,
          });
        }
      }
      ProjectSignal::AddMilestone(spec) => {
        let existing = self
          .milestones
          .iter()
          .map(|m| (m.id.as_str(), m.dependencies.as_slice()));
        validate_milestones(existing.chain([(spec.id.as_str(), spec.dependencies.as_slice())]))?;
      }
      ProjectSignal::UpdateProgress {
        tasks_total,
        tasks_completed,
      } => {
        if tasks_completed > tasks_total {
          return Err(WorkflowError::precondition(format!(
            "tasksCompleted ({}) exceeds tasksTotal ({})",
            tasks_completed, tasks_total
          )));
        }
      }
      ProjectSignal::CompleteProject {} => {
        let open: Vec<&str> = self
          .milestones
          .iter()
          .filter(|m| m.status != MilestoneStatus::Completed)
          .map(|m| m.id.as_str())
          .collect();
        if !open.is_empty() {
          return Err(WorkflowError::precondition(format!(
            "milestones not completed: {}",
            open.join(", ")
          )));
        }
        let percent = self.completion_percentage();
        if percent < 100.0 {
          return Err(WorkflowError::precondition(format!(
            "project is {:.1}% complete",
            percent
          )));
        }
      }
      _ => {}
    }
    Ok(())
  }

  async fn on_signal(&self, ctx: &mut StepContext<'_>, signal: ProjectSignal) -> Result<Vec<ProjectEvent>, WorkflowError> {
    let now = ctx.now();
    let events = match signal {
      ProjectSignal::StartProject {} => {
        ctx
          .update_entity_status(ProjectState::Active.as_str(), json!({ "milestones": self.milestones.len() }))
          .await?;
        let mut events = vec![ProjectEvent::ProjectStarted { at: now }];
        for milestone in &self.milestones {
          let deadline_id = self
            .schedule(ctx, &milestone.id, &milestone.title, milestone.due_date)
            .await?;
          events.push(ProjectEvent::MilestoneScheduled {
            milestone_id: milestone.id.clone(),
            deadline_id,
          });
        }
        events
      }
      ProjectSignal::CompleteMilestone { milestone_id } => vec![ProjectEvent::MilestoneCompleted {
        milestone_id,
        completed_by: ctx.performed_by().to_string(),
        at: now,
      }],
      ProjectSignal::AddMilestone(spec) => {
        let deadline_id = if self.state == ProjectState::Draft {
          None
        } else {
          Some(self.schedule(ctx, &spec.id, &spec.title, spec.due_date).await?)
        };
        vec![ProjectEvent::MilestoneAdded {
          milestone: spec.into_milestone(deadline_id),
          at: now,
        }]
      }
      ProjectSignal::UpdateProgress {
        tasks_total,
        tasks_completed,
      } => vec![ProjectEvent::ProgressUpdated {
        tasks_total,
        tasks_completed,
        at: now,
      }],
      ProjectSignal::PutOnHold { reason } => {
        ctx
          .update_entity_status(ProjectState::OnHold.as_str(), json!({ "reason": reason }))
          .await?;
        vec![ProjectEvent::ProjectPutOnHold {
          reason,
          automatic: false,
          at: now,
        }]
      }
      ProjectSignal::ResumeProject {} => {
        ctx
          .update_entity_status(ProjectState::Active.as_str(), Value::Null)
          .await?;
        vec![ProjectEvent::ProjectResumed { at: now }]
      }
      ProjectSignal::CompleteProject {} => {
        ctx
          .update_entity_status(ProjectState::Completed.as_str(), json!({ "automatic": false }))
          .await?;
        let notice = Notification::new(
          Channel::Email,
          self.owner(),
          format!("Project completed: {}", self.name),
          format!("{} has been completed", self.name),
        )
        .with_metadata(json!({ "projectId": self.project_id }));
        notify(ctx, &notice).await;
        vec![ProjectEvent::ProjectCompleted {
          automatic: false,
          at: now,
        }]
      }
      ProjectSignal::CancelProject { reason } => {
        ctx
          .update_entity_status(ProjectState::Cancelled.as_str(), json!({ "reason": reason }))
          .await?;
        vec![ProjectEvent::ProjectCancelled { reason, at: now }]
      }
    };
    Ok(self.with_phase(events, now))
  }

  async fn on_timer(&self, ctx: &mut StepContext<'_>, reason: &TimerReason) -> Result<Vec<ProjectEvent>, WorkflowError> {
    match reason {
      TimerReason::Tick if self.state == ProjectState::Active => Ok(self.monitor(ctx).await),
      _ => Ok(Vec::new()),
    }
  }

  fn ticks(&self) -> bool {
    self.state == ProjectState::Active
  }

  fn query(&self, name: &str, _args: &Value, _now: DateTime<Utc>) -> Result<Value, WorkflowError> {
    match name {
      "getStatus" => Ok(json!({
        "state": self.state.as_str(),
        "phase": self.phase,
        "name": self.name,
        "completionPercentage": self.completion_percentage(),
        "milestonesTotal": self.milestones.len(),
        "milestonesCompleted": self
          .milestones
          .iter()
          .filter(|m| m.status == MilestoneStatus::Completed)
          .count(),
        "milestonesOverdue": self
          .milestones
          .iter()
          .filter(|m| m.status == MilestoneStatus::Overdue)
          .count(),
        "holdReason": self.hold_reason,
        "lastProgressAt": self.last_progress_at,
      })),
      "getProject" => Ok(serde_json::to_value(self)?),
      "getMilestones" => Ok(serde_json::to_value(&self.milestones)?),
      "getProgress" => Ok(self.progress()),
      _ => Err(WorkflowError::UnknownQuery {
        query: name.to_string(),
      }),
    }
  }
}
