//! ACCU application approval workflow.
//!
//! Every transition is signal-gated except two timer paths: stalled review
//! assignment and approval only record a timeout for manual follow-up, while
//! an approval left untouched for the auto-issue period issues the
//! certificate (when `application.auto_issue` is enabled).

use accu_activity::{CalendarDeadline, Channel, Notification, Priority};
use accu_config::EngineConfig;
use accu_runtime::{
  InstanceStatus, StepContext, TimerReason, TimerRequest, Workflow, WorkflowError, WorkflowKind,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{notify, parse_input};

/// Rules checked by `validateBusinessRules` before approval.
pub const APPROVAL_RULES: &[&str] = &["documents_complete", "methodology_validated", "units_available"];

const REVIEW_ASSIGNMENT_WAIT: &str = "reviewAssignment";
const APPROVAL_WAIT: &str = "approval";
const AUTO_ISSUE_WAIT: &str = "autoIssue";
const ADMIN_ROLE: &str = "role:administrator";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationState {
  #[default]
  Draft,
  Submitted,
  UnderReview,
  Approved,
  Rejected,
  Issued,
}

impl ApplicationState {
  pub fn as_str(&self) -> &'static str {
    match self {
      ApplicationState::Draft => "draft",
      ApplicationState::Submitted => "submitted",
      ApplicationState::UnderReview => "under_review",
      ApplicationState::Approved => "approved",
      ApplicationState::Rejected => "rejected",
      ApplicationState::Issued => "issued",
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationWorkflow {
  pub application_id: String,
  pub project_id: Option<String>,
  pub accu_units: u64,
  pub applicant_id: Option<String>,
  pub state: ApplicationState,
  pub created_at: Option<DateTime<Utc>>,
  pub submission_date: Option<DateTime<Utc>>,
  pub review_deadline: Option<DateTime<Utc>>,
  pub review_deadline_id: Option<String>,
  pub reviewer_id: Option<String>,
  pub review_started_at: Option<DateTime<Utc>>,
  pub approver_id: Option<String>,
  pub approval_date: Option<DateTime<Utc>>,
  pub approval_notes: Option<String>,
  pub issue_deadline: Option<DateTime<Utc>>,
  pub issue_deadline_id: Option<String>,
  pub rejection_reason: Option<String>,
  pub rejected_at: Option<DateTime<Utc>>,
  pub issuer_id: Option<String>,
  pub issued_at: Option<DateTime<Utc>>,
  pub auto_issued: bool,
  pub review_assignment_timed_out: bool,
  pub approval_timed_out: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct StartInput {
  project_id: Option<String>,
  accu_units: u64,
  applicant_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(
  tag = "signal",
  content = "payload",
  rename_all = "camelCase",
  rename_all_fields = "camelCase"
)]
pub enum ApplicationSignal {
  SubmitApplication {},
  AssignReviewer {
    reviewer_id: String,
  },
  ApproveApplication {
    approver_id: String,
    #[serde(default)]
    notes: Option<String>,
  },
  RejectApplication {
    approver_id: String,
    reason: String,
  },
  IssueCertificate {
    issuer_id: String,
  },
}

impl ApplicationSignal {
  fn name(&self) -> &'static str {
    match self {
      ApplicationSignal::SubmitApplication {} => "submitApplication",
      ApplicationSignal::AssignReviewer { .. } => "assignReviewer",
      ApplicationSignal::ApproveApplication { .. } => "approveApplication",
      ApplicationSignal::RejectApplication { .. } => "rejectApplication",
      ApplicationSignal::IssueCertificate { .. } => "issueCertificate",
    }
  }

  /// State the signal is legal in.
  fn source(&self) -> ApplicationState {
    match self {
      ApplicationSignal::SubmitApplication {} => ApplicationState::Draft,
      ApplicationSignal::AssignReviewer { .. } => ApplicationState::Submitted,
      ApplicationSignal::ApproveApplication { .. } | ApplicationSignal::RejectApplication { .. } => {
        ApplicationState::UnderReview
      }
      ApplicationSignal::IssueCertificate { .. } => ApplicationState::Approved,
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
pub enum ApplicationEvent {
  ApplicationCreated {
    application_id: String,
    project_id: Option<String>,
    accu_units: u64,
    applicant_id: Option<String>,
    at: DateTime<Utc>,
  },
  ApplicationSubmitted {
    review_deadline: DateTime<Utc>,
    deadline_id: String,
    at: DateTime<Utc>,
  },
  ReviewerAssigned {
    reviewer_id: String,
    at: DateTime<Utc>,
  },
  ApplicationApproved {
    approver_id: String,
    notes: Option<String>,
    issue_deadline: DateTime<Utc>,
    deadline_id: String,
    at: DateTime<Utc>,
  },
  ApplicationRejected {
    approver_id: String,
    reason: String,
    at: DateTime<Utc>,
  },
  CertificateIssued {
    issuer_id: Option<String>,
    auto_issued: bool,
    at: DateTime<Utc>,
  },
  ReviewAssignmentTimedOut {
    at: DateTime<Utc>,
  },
  ApprovalTimedOut {
    at: DateTime<Utc>,
  },
}

impl ApplicationWorkflow {
  fn applicant(&self) -> String {
    self
      .applicant_id
      .clone()
      .unwrap_or_else(|| format!("entity:{}", self.application_id))
  }

  fn applicant_notice(&self, title: &str, body: String) -> Notification {
    Notification::new(Channel::Email, self.applicant(), title, body)
      .with_metadata(json!({ "applicationId": self.application_id }))
  }

  async fn set_status(
    &self,
    ctx: &mut StepContext<'_>,
    state: ApplicationState,
    metadata: Value,
  ) -> Result<(), WorkflowError> {
    ctx.update_entity_status(state.as_str(), metadata).await
  }

  async fn issue(
    &self,
    ctx: &mut StepContext<'_>,
    issuer_id: Option<String>,
  ) -> Result<Vec<ApplicationEvent>, WorkflowError> {
    let auto_issued = issuer_id.is_none();
    self
      .set_status(
        ctx,
        ApplicationState::Issued,
        json!({ "issuerId": issuer_id, "autoIssued": auto_issued }),
      )
      .await?;
    let notice = self.applicant_notice(
      "ACCU certificate issued",
      format!("{} ACCUs have been issued for application {}", self.accu_units, self.application_id),
    );
    notify(ctx, &notice).await;
    Ok(vec![ApplicationEvent::CertificateIssued {
      issuer_id,
      auto_issued,
      at: ctx.now(),
    }])
  }

  async fn timed_out(&self, ctx: &mut StepContext<'_>, stage: &str) {
    let notice = Notification::new(
      Channel::Email,
      ADMIN_ROLE,
      format!("Application {} needs attention", self.application_id),
      format!("The {} stage of application {} has timed out", stage, self.application_id),
    )
    .with_metadata(json!({ "applicationId": self.application_id, "stage": stage }));
    notify(ctx, &notice).await;
  }

  fn timeline(&self) -> Vec<Value> {
    let stages = [
      ("created", self.created_at),
      ("submitted", self.submission_date),
      ("under_review", self.review_started_at),
      ("approved", self.approval_date),
      ("rejected", self.rejected_at),
      ("issued", self.issued_at),
    ];
    let mut timeline: Vec<(&str, DateTime<Utc>)> = stages
      .into_iter()
      .filter_map(|(stage, at)| at.map(|at| (stage, at)))
      .collect();
    timeline.sort_by_key(|(_, at)| *at);
    timeline
      .into_iter()
      .map(|(stage, at)| json!({ "stage": stage, "at": at }))
      .collect()
  }
}

#[async_trait]
impl Workflow for ApplicationWorkflow {
  type Event = ApplicationEvent;
  type Signal = ApplicationSignal;

  const KIND: WorkflowKind = WorkflowKind::ApplicationLifecycle;
  const SIGNALS: &'static [&'static str] = &[
    "submitApplication",
    "assignReviewer",
    "approveApplication",
    "rejectApplication",
    "issueCertificate",
  ];

  async fn start(ctx: &mut StepContext<'_>, input: &Value) -> Result<Vec<ApplicationEvent>, WorkflowError> {
    let input: StartInput = parse_input(input)?;
    Ok(vec![ApplicationEvent::ApplicationCreated {
      application_id: ctx.entity_id().to_string(),
      project_id: input.project_id,
      accu_units: input.accu_units,
      applicant_id: input.applicant_id,
      at: ctx.now(),
    }])
  }

  fn apply(&mut self, event: &ApplicationEvent) {
    match event {
      ApplicationEvent::ApplicationCreated {
        application_id,
        project_id,
        accu_units,
        applicant_id,
        at,
      } => {
        self.application_id = application_id.clone();
        self.project_id = project_id.clone();
        self.accu_units = *accu_units;
        self.applicant_id = applicant_id.clone();
        self.state = ApplicationState::Draft;
        self.created_at = Some(*at);
      }
      ApplicationEvent::ApplicationSubmitted {
        review_deadline,
        deadline_id,
        at,
      } => {
        self.state = ApplicationState::Submitted;
        self.submission_date = Some(*at);
        self.review_deadline = Some(*review_deadline);
        self.review_deadline_id = Some(deadline_id.clone());
      }
      ApplicationEvent::ReviewerAssigned { reviewer_id, at } => {
        self.state = ApplicationState::UnderReview;
        self.reviewer_id = Some(reviewer_id.clone());
        self.review_started_at = Some(*at);
      }
      ApplicationEvent::ApplicationApproved {
        approver_id,
        notes,
        issue_deadline,
        deadline_id,
        at,
      } => {
        self.state = ApplicationState::Approved;
        self.approver_id = Some(approver_id.clone());
        self.approval_notes = notes.clone();
        self.approval_date = Some(*at);
        self.issue_deadline = Some(*issue_deadline);
        self.issue_deadline_id = Some(deadline_id.clone());
      }
      ApplicationEvent::ApplicationRejected {
        approver_id,
        reason,
        at,
      } => {
        self.state = ApplicationState::Rejected;
        self.approver_id = Some(approver_id.clone());
        self.rejection_reason = Some(reason.clone());
        self.rejected_at = Some(*at);
      }
      ApplicationEvent::CertificateIssued {
        issuer_id,
        auto_issued,
        at,
      } => {
        self.state = ApplicationState::Issued;
        self.issuer_id = issuer_id.clone();
        self.auto_issued = *auto_issued;
        self.issued_at = Some(*at);
      }
      ApplicationEvent::ReviewAssignmentTimedOut { .. } => self.review_assignment_timed_out = true,
      ApplicationEvent::ApprovalTimedOut { .. } => self.approval_timed_out = true,
    }
  }

  fn status(&self) -> InstanceStatus {
    match self.state {
      ApplicationState::Rejected | ApplicationState::Issued => InstanceStatus::Completed,
      _ => InstanceStatus::Active,
    }
  }

  fn state_name(&self) -> String {
    self.state.as_str().to_string()
  }

  fn check(&self, signal: &ApplicationSignal) -> Result<(), WorkflowError> {
    if signal.source() != self.state {
      return Err(WorkflowError::invalid_transition(signal.name(), self.state.as_str()));
    }
    if let ApplicationSignal::RejectApplication { reason, .. } = signal {
      if reason.trim().is_empty() {
        return Err(WorkflowError::precondition("a rejection reason is required"));
      }
    }
    Ok(())
  }

  async fn on_signal(
    &self,
    ctx: &mut StepContext<'_>,
    signal: ApplicationSignal,
  ) -> Result<Vec<ApplicationEvent>, WorkflowError> {
    let now = ctx.now();
    match signal {
      ApplicationSignal::SubmitApplication {} => {
        let review_deadline = now + Duration::days(ctx.config().application.review_timeout_days);
        self
          .set_status(ctx, ApplicationState::Submitted, json!({ "reviewDeadline": review_deadline }))
          .await?;
        let deadline = CalendarDeadline {
          owner_entity_id: self.application_id.clone(),
          title: format!("Review ACCU application {}", self.application_id),
          description: format!("Assign a reviewer for {} ACCUs", self.accu_units),
          due_date: review_deadline,
          priority: Priority::High,
          assignee_id: None,
        };
        let deadline_id = ctx.create_calendar_deadline(&deadline).await?;
        Ok(vec![ApplicationEvent::ApplicationSubmitted {
          review_deadline,
          deadline_id,
          at: now,
        }])
      }
      ApplicationSignal::AssignReviewer { reviewer_id } => {
        self
          .set_status(ctx, ApplicationState::UnderReview, json!({ "reviewerId": reviewer_id }))
          .await?;
        let notice = Notification::new(
          Channel::Email,
          reviewer_id.clone(),
          "ACCU application assigned",
          format!("Application {} is awaiting your review", self.application_id),
        )
        .with_metadata(json!({ "applicationId": self.application_id }));
        notify(ctx, &notice).await;
        Ok(vec![ApplicationEvent::ReviewerAssigned { reviewer_id, at: now }])
      }
      ApplicationSignal::ApproveApplication { approver_id, notes } => {
        if !ctx.validate_business_rules(APPROVAL_RULES).await? {
          return Err(WorkflowError::ValidationFailed {
            entity_id: self.application_id.clone(),
            rules: APPROVAL_RULES.iter().map(|r| r.to_string()).collect(),
          });
        }
        self
          .set_status(
            ctx,
            ApplicationState::Approved,
            json!({ "approverId": approver_id, "notes": notes }),
          )
          .await?;
        let issue_deadline = now + Duration::days(ctx.config().application.issue_deadline_days);
        let deadline = CalendarDeadline {
          owner_entity_id: self.application_id.clone(),
          title: format!("Issue ACCU certificate for {}", self.application_id),
          description: format!("Issue {} ACCUs", self.accu_units),
          due_date: issue_deadline,
          priority: Priority::High,
          assignee_id: None,
        };
        let deadline_id = ctx.create_calendar_deadline(&deadline).await?;
        let notice = self.applicant_notice(
          "ACCU application approved",
          format!("Application {} has been approved", self.application_id),
        );
        notify(ctx, &notice).await;
        Ok(vec![ApplicationEvent::ApplicationApproved {
          approver_id,
          notes,
          issue_deadline,
          deadline_id,
          at: now,
        }])
      }
      ApplicationSignal::RejectApplication { approver_id, reason } => {
        self
          .set_status(
            ctx,
            ApplicationState::Rejected,
            json!({ "approverId": approver_id, "reason": reason }),
          )
          .await?;
        let notice = self.applicant_notice(
          "ACCU application rejected",
          format!("Application {} was rejected: {}", self.application_id, reason),
        );
        notify(ctx, &notice).await;
        Ok(vec![ApplicationEvent::ApplicationRejected {
          approver_id,
          reason,
          at: now,
        }])
      }
      ApplicationSignal::IssueCertificate { issuer_id } => self.issue(ctx, Some(issuer_id)).await,
    }
  }

  async fn on_timer(
    &self,
    ctx: &mut StepContext<'_>,
    reason: &TimerReason,
  ) -> Result<Vec<ApplicationEvent>, WorkflowError> {
    let TimerReason::Wait(name) = reason else {
      return Ok(Vec::new());
    };
    let now = ctx.now();
    match (name.as_str(), self.state) {
      (REVIEW_ASSIGNMENT_WAIT, ApplicationState::Submitted) if !self.review_assignment_timed_out => {
        self.timed_out(ctx, "review assignment").await;
        Ok(vec![ApplicationEvent::ReviewAssignmentTimedOut { at: now }])
      }
      (APPROVAL_WAIT, ApplicationState::UnderReview) if !self.approval_timed_out => {
        self.timed_out(ctx, "approval").await;
        Ok(vec![ApplicationEvent::ApprovalTimedOut { at: now }])
      }
      (AUTO_ISSUE_WAIT, ApplicationState::Approved) if ctx.config().application.auto_issue => {
        self.issue(ctx, None).await
      }
      _ => Ok(Vec::new()),
    }
  }

  fn timers(&self, config: &EngineConfig) -> Vec<TimerRequest> {
    let timing = &config.application;
    let request = match self.state {
      ApplicationState::Submitted if !self.review_assignment_timed_out => self
        .submission_date
        .map(|at| TimerRequest::wait(REVIEW_ASSIGNMENT_WAIT, at + Duration::days(timing.review_timeout_days))),
      ApplicationState::UnderReview if !self.approval_timed_out => self
        .review_started_at
        .map(|at| TimerRequest::wait(APPROVAL_WAIT, at + Duration::days(timing.approval_timeout_days))),
      ApplicationState::Approved if timing.auto_issue => self
        .approval_date
        .map(|at| TimerRequest::wait(AUTO_ISSUE_WAIT, at + Duration::days(timing.auto_issue_days))),
      _ => None,
    };
    request.into_iter().collect()
  }

  fn query(&self, name: &str, _args: &Value, _now: DateTime<Utc>) -> Result<Value, WorkflowError> {
    match name {
      "getStatus" => Ok(json!({
        "state": self.state.as_str(),
        "applicationId": self.application_id,
        "submissionDate": self.submission_date,
        "reviewDeadline": self.review_deadline,
        "reviewerId": self.reviewer_id,
        "approvalDate": self.approval_date,
        "issueDeadline": self.issue_deadline,
        "autoIssued": self.auto_issued,
        "reviewAssignmentTimedOut": self.review_assignment_timed_out,
        "approvalTimedOut": self.approval_timed_out,
      })),
      "getApplication" => Ok(serde_json::to_value(self)?),
      "getTimeline" => Ok(Value::Array(self.timeline())),
      _ => Err(WorkflowError::UnknownQuery {
        query: name.to_string(),
      }),
    }
  }
}
