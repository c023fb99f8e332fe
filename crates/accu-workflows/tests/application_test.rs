mod common;

use accu_activity::names;
use accu_runtime::{InstanceStatus, WorkflowError, WorkflowKind};
use chrono::Duration;
use common::{Harness, fast_config, start_time};
use serde_json::{Value, json};

async fn start_application(h: &Harness) -> String {
  h.start(
    WorkflowKind::ApplicationLifecycle,
    "accu_application",
    "app-1",
    json!({ "projectId": "project-1", "accuUnits": 1200, "applicantId": "user-1" }),
  )
  .await
}

async fn under_review(h: &Harness) -> String {
  let id = start_application(h).await;
  h.send(&id, "submitApplication", json!({})).await.unwrap();
  h.send(&id, "assignReviewer", json!({ "reviewerId": "reviewer-1" }))
    .await
    .unwrap();
  id
}

async fn approved(h: &Harness) -> String {
  let id = under_review(h).await;
  h.send(&id, "approveApplication", json!({ "approverId": "approver-1" }))
    .await
    .unwrap();
  id
}

fn state(h: &Harness, id: &str) -> String {
  h.runtime.describe(id).unwrap().state
}

#[tokio::test]
async fn test_submit_creates_review_deadline() {
  let h = Harness::new();
  let id = start_application(&h).await;
  assert!(id.starts_with("application_lifecycle-"));
  assert_eq!(state(&h, &id), "draft");

  h.send(&id, "submitApplication", json!({})).await.unwrap();
  assert_eq!(state(&h, &id), "submitted");

  let deadlines = h.gateway.calendar_deadlines();
  assert_eq!(deadlines.len(), 1);
  assert_eq!(deadlines[0].due_date, start_time() + Duration::days(14));
  assert_eq!(deadlines[0].owner_entity_id, "app-1");

  let updates = h.gateway.status_updates();
  assert_eq!(updates.len(), 1);
  assert_eq!(updates[0].entity_type, "accu_application");
  assert_eq!(updates[0].new_status, "submitted");

  let status = h.query(&id, "getStatus", Value::Null);
  assert_eq!(status["state"], "submitted");
  assert!(status["submissionDate"].is_string());
}

#[tokio::test]
async fn test_failed_validation_leaves_application_under_review() {
  let h = Harness::new();
  let id = under_review(&h).await;
  h.gateway.set_rules_valid(false);

  let err = h
    .send(&id, "approveApplication", json!({ "approverId": "approver-1" }))
    .await
    .unwrap_err();
  match err {
    WorkflowError::ValidationFailed { entity_id, rules } => {
      assert_eq!(entity_id, "app-1");
      assert!(rules.contains(&"units_available".to_string()));
    }
    other => panic!("expected ValidationFailed, got {:?}", other),
  }
  assert_eq!(state(&h, &id), "under_review");
  assert_eq!(h.runtime.record(&id).unwrap().status, InstanceStatus::Active);

  // A later attempt validates again instead of reusing the rejected result.
  h.gateway.set_rules_valid(true);
  h.send(&id, "approveApplication", json!({ "approverId": "approver-1", "notes": "ok" }))
    .await
    .unwrap();
  assert_eq!(state(&h, &id), "approved");

  let issue = h.gateway.calendar_deadlines().pop().unwrap();
  assert_eq!(issue.due_date, start_time() + Duration::days(3));
}

#[tokio::test]
async fn test_transitions_are_gated() {
  let h = Harness::new();
  let id = start_application(&h).await;

  for (signal, payload) in [
    ("issueCertificate", json!({ "issuerId": "i" })),
    ("assignReviewer", json!({ "reviewerId": "r" })),
    ("approveApplication", json!({ "approverId": "a" })),
  ] {
    let err = h.runtime.signal(&id, signal, payload).await.unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidTransition { .. }), "{}", signal);
  }

  let err = h
    .runtime
    .signal(&id, "assignReviewer", json!({}))
    .await
    .unwrap_err();
  assert!(matches!(err, WorkflowError::InvalidPayload { .. }));
}

#[tokio::test]
async fn test_reject_is_terminal() {
  let h = Harness::new();
  let id = under_review(&h).await;
  h.send(&id, "rejectApplication", json!({ "approverId": "approver-1", "reason": "missing audit" }))
    .await
    .unwrap();

  let record = h.runtime.record(&id).unwrap();
  assert_eq!(record.status, InstanceStatus::Completed);
  assert_eq!(record.state_data["rejectionReason"], "missing audit");
  let notice = h.gateway.notifications().pop().unwrap();
  assert_eq!(notice.user_id, "user-1");

  let err = h
    .runtime
    .signal(&id, "issueCertificate", json!({ "issuerId": "i" }))
    .await
    .unwrap_err();
  assert!(matches!(err, WorkflowError::InvalidTransition { .. }));
}

#[tokio::test]
async fn test_review_timeout_is_recorded_without_transition() {
  let h = Harness::new();
  let id = start_application(&h).await;
  h.send(&id, "submitApplication", json!({})).await.unwrap();

  assert_eq!(h.advance(Duration::days(13)).await, 0);
  assert_eq!(h.advance(Duration::days(1)).await, 1);

  assert_eq!(state(&h, &id), "submitted");
  let status = h.query(&id, "getStatus", Value::Null);
  assert_eq!(status["reviewAssignmentTimedOut"], true);
  let notice = h.gateway.notifications().pop().unwrap();
  assert_eq!(notice.user_id, "role:administrator");

  assert!(h.runtime.timers().pending_for(&id).is_empty());
  assert_eq!(h.advance(Duration::days(30)).await, 0);

  // Assignment still works after the timeout, and arms the approval wait.
  h.send(&id, "assignReviewer", json!({ "reviewerId": "reviewer-1" }))
    .await
    .unwrap();
  assert_eq!(h.runtime.timers().pending_for(&id).len(), 1);
  h.advance(Duration::days(7)).await;
  assert_eq!(h.query(&id, "getStatus", Value::Null)["approvalTimedOut"], true);
  assert_eq!(state(&h, &id), "under_review");
}

#[tokio::test]
async fn test_signal_cancels_pending_timeout() {
  let h = Harness::new();
  let id = start_application(&h).await;
  h.send(&id, "submitApplication", json!({})).await.unwrap();
  h.advance(Duration::days(2)).await;
  h.send(&id, "assignReviewer", json!({ "reviewerId": "reviewer-1" }))
    .await
    .unwrap();

  // Day 14: the approval wait (day 9) fires, the cancelled review wait does not.
  assert_eq!(h.advance(Duration::days(12)).await, 1);
  let status = h.query(&id, "getStatus", Value::Null);
  assert_eq!(status["reviewAssignmentTimedOut"], false);
  assert_eq!(status["approvalTimedOut"], true);
}

#[tokio::test]
async fn test_auto_issue_after_approval_period() {
  let h = Harness::new();
  let id = approved(&h).await;

  assert_eq!(h.advance(Duration::days(13)).await, 0);
  assert_eq!(h.advance(Duration::days(1)).await, 1);

  let record = h.runtime.record(&id).unwrap();
  assert_eq!(record.status, InstanceStatus::Completed);
  assert_eq!(record.state_data["state"], "issued");
  assert_eq!(record.state_data["autoIssued"], true);
  assert_eq!(record.history.last().unwrap().performed_by, "system");

  let issued = h.gateway.status_updates().pop().unwrap();
  assert_eq!(issued.new_status, "issued");
  assert_eq!(issued.metadata["autoIssued"], true);

  let timeline = h.query(&id, "getTimeline", Value::Null);
  let stages: Vec<&str> = timeline
    .as_array()
    .unwrap()
    .iter()
    .map(|entry| entry["stage"].as_str().unwrap())
    .collect();
  assert_eq!(stages, vec!["created", "submitted", "under_review", "approved", "issued"]);
}

#[tokio::test]
async fn test_auto_issue_disabled() {
  let mut config = fast_config();
  config.application.auto_issue = false;
  let h = Harness::with_config(config);
  let id = approved(&h).await;

  assert!(h.runtime.timers().pending_for(&id).is_empty());
  h.advance(Duration::days(30)).await;
  assert_eq!(state(&h, &id), "approved");

  h.send(&id, "issueCertificate", json!({ "issuerId": "issuer-1" }))
    .await
    .unwrap();
  let record = h.runtime.record(&id).unwrap();
  assert_eq!(record.state_data["state"], "issued");
  assert_eq!(record.state_data["autoIssued"], false);
  assert_eq!(record.state_data["issuerId"], "issuer-1");
}

#[tokio::test]
async fn test_status_update_failure_fails_instance() {
  let h = Harness::new();
  let id = start_application(&h).await;
  h.gateway.fail_always(names::UPDATE_ENTITY_STATUS);

  let err = h.send(&id, "submitApplication", json!({})).await.unwrap_err();
  assert!(matches!(err, WorkflowError::ActivityFailure(_)));

  let status = h.query(&id, "getWorkflowStatus", Value::Null);
  assert_eq!(status["status"], "failed");
  assert!(h.gateway.calendar_deadlines().is_empty());
  assert_eq!(state(&h, &id), "draft");
}
