mod common;

use accu_activity::names;
use accu_runtime::{InstanceStatus, WorkflowError, WorkflowKind};
use chrono::Duration;
use common::{Harness, start_time};
use serde_json::{Value, json};

async fn start_project(h: &Harness, milestones: Value) -> String {
  let id = h
    .start(
      WorkflowKind::ProjectLifecycle,
      "project",
      "project-1",
      json!({
        "name": "Savanna burning",
        "ownerId": "owner-1",
        "milestones": milestones,
        "targetEndDate": start_time() + Duration::days(300),
      }),
    )
    .await;
  h.send(&id, "startProject", json!({})).await.unwrap();
  id
}

fn a_then_b(due_in_days: i64) -> Value {
  let due = start_time() + Duration::days(due_in_days);
  json!([
    { "id": "a", "title": "Baseline survey", "dueDate": due },
    { "id": "b", "title": "Offsets report", "dueDate": due, "dependencies": ["a"] },
  ])
}

#[tokio::test]
async fn test_milestone_dependencies_gate_completion() {
  let h = Harness::new();
  let id = start_project(&h, a_then_b(60)).await;

  assert_eq!(h.gateway.calendar_deadlines().len(), 2);
  let milestones = h.query(&id, "getMilestones", Value::Null);
  assert_eq!(milestones[0]["deadlineId"], "cal-1");
  assert_eq!(milestones[1]["deadlineId"], "cal-2");

  let err = h
    .runtime
    .signal(&id, "completeMilestone", json!({ "milestoneId": "b" }))
    .await
    .unwrap_err();
  match err {
    WorkflowError::DependencyNotMet { milestone_id, pending } => {
      assert_eq!(milestone_id, "b");
      assert_eq!(pending, vec!["a".to_string()]);
    }
    other => panic!("expected DependencyNotMet, got {:?}", other),
  }

  h.send(&id, "completeMilestone", json!({ "milestoneId": "a" })).await.unwrap();
  h.send(&id, "completeMilestone", json!({ "milestoneId": "b" })).await.unwrap();

  let progress = h.query(&id, "getProgress", Value::Null);
  assert_eq!(progress["completionPercentage"], 100.0);
  assert_eq!(progress["phase"], "closure");

  h.send(&id, "completeProject", json!({})).await.unwrap();
  let record = h.runtime.record(&id).unwrap();
  assert_eq!(record.status, InstanceStatus::Completed);
  assert_eq!(h.gateway.status_updates().pop().unwrap().new_status, "completed");
}

#[tokio::test]
async fn test_milestone_errors() {
  let h = Harness::new();
  let id = start_project(&h, a_then_b(60)).await;

  let err = h
    .runtime
    .signal(&id, "completeMilestone", json!({ "milestoneId": "zzz" }))
    .await
    .unwrap_err();
  assert!(matches!(err, WorkflowError::NotFound { item: "milestone", .. }));

  h.send(&id, "completeMilestone", json!({ "milestoneId": "a" })).await.unwrap();
  let err = h
    .runtime
    .signal(&id, "completeMilestone", json!({ "milestoneId": "a" }))
    .await
    .unwrap_err();
  assert!(matches!(err, WorkflowError::InvalidTransition { .. }));

  let err = h
    .runtime
    .signal(
      &id,
      "addMilestone",
      json!({ "id": "c", "title": "Verification", "dueDate": start_time(), "dependencies": ["nope"] }),
    )
    .await
    .unwrap_err();
  assert!(matches!(err, WorkflowError::PreconditionFailed { .. }));

  let err = h.runtime.signal(&id, "completeProject", json!({})).await.unwrap_err();
  assert!(matches!(err, WorkflowError::PreconditionFailed { .. }));
}

#[tokio::test]
async fn test_start_rejects_dependency_cycle() {
  let h = Harness::new();
  let due = start_time() + Duration::days(10);
  let err = h
    .runtime
    .start(
      WorkflowKind::ProjectLifecycle,
      "project",
      "project-9",
      json!({
        "name": "Loop",
        "milestones": [
          { "id": "a", "title": "A", "dueDate": due, "dependencies": ["b"] },
          { "id": "b", "title": "B", "dueDate": due, "dependencies": ["a"] },
        ],
      }),
      "tester",
    )
    .await
    .unwrap_err();
  assert!(matches!(err, WorkflowError::PreconditionFailed { .. }));
  assert_eq!(h.runtime.find_live(WorkflowKind::ProjectLifecycle, "project-9"), None);
}

#[tokio::test]
async fn test_progress_accounting_and_phase() {
  let h = Harness::new();
  let id = start_project(&h, a_then_b(60)).await;
  assert_eq!(h.query(&id, "getStatus", Value::Null)["phase"], "planning");

  h.send(&id, "updateProgress", json!({ "tasksTotal": 6, "tasksCompleted": 2 }))
    .await
    .unwrap();
  let progress = h.query(&id, "getProgress", Value::Null);
  assert_eq!(progress["tasksTotal"], 8);
  assert_eq!(progress["tasksCompleted"], 2);
  assert_eq!(progress["completionPercentage"], 25.0);
  assert_eq!(progress["phase"], "execution");

  let err = h
    .runtime
    .signal(&id, "updateProgress", json!({ "tasksTotal": 1, "tasksCompleted": 2 }))
    .await
    .unwrap_err();
  assert!(matches!(err, WorkflowError::PreconditionFailed { .. }));

  // A drop in progress never moves the phase back.
  h.send(&id, "updateProgress", json!({ "tasksTotal": 20, "tasksCompleted": 0 }))
    .await
    .unwrap();
  assert_eq!(h.query(&id, "getProgress", Value::Null)["phase"], "execution");

  h.send(&id, "updateProgress", json!({ "tasksTotal": u64::MAX, "tasksCompleted": 1 }))
    .await
    .unwrap();
  let progress = h.query(&id, "getProgress", Value::Null);
  assert_eq!(progress["tasksTotal"], u64::MAX);
  assert_eq!(progress["tasksCompleted"], 1);
}

#[tokio::test]
async fn test_monitor_reminds_then_marks_overdue() {
  let h = Harness::new();
  let id = start_project(&h, a_then_b(2)).await;

  // 23h before due
  h.advance(Duration::hours(25)).await;
  let reminders = h.gateway.notifications();
  assert_eq!(reminders.len(), 2);
  assert!(reminders.iter().all(|n| n.title.starts_with("Milestone due soon")));

  h.advance(Duration::minutes(30)).await;
  assert_eq!(h.gateway.notifications().len(), 2);

  h.advance(Duration::days(1)).await;
  let milestones = h.query(&id, "getMilestones", Value::Null);
  assert!(milestones.as_array().unwrap().iter().all(|m| m["status"] == "overdue"));
  assert!(milestones.as_array().unwrap().iter().all(|m| m["overdueNotified"] == true));
  assert_eq!(h.gateway.notifications().len(), 4);

  // Overdue milestones can still be completed.
  h.send(&id, "completeMilestone", json!({ "milestoneId": "a" })).await.unwrap();
}

#[tokio::test]
async fn test_stalled_project_is_put_on_hold() {
  let h = Harness::new();
  let id = start_project(&h, a_then_b(200)).await;

  h.advance(Duration::days(29)).await;
  assert_eq!(h.runtime.record(&id).unwrap().status, InstanceStatus::Active);

  h.advance(Duration::days(1)).await;
  let record = h.runtime.record(&id).unwrap();
  assert_eq!(record.status, InstanceStatus::Paused);
  assert_eq!(record.state_data["state"], "on_hold");
  assert_eq!(record.state_data["autoHeld"], true);
  assert_eq!(h.gateway.status_updates().pop().unwrap().new_status, "on_hold");
  assert!(h.runtime.timers().pending_for(&id).is_empty());

  h.send(&id, "resumeProject", json!({})).await.unwrap();
  let record = h.runtime.record(&id).unwrap();
  assert_eq!(record.state_data["state"], "active");
  assert_eq!(h.runtime.timers().pending_for(&id).len(), 1);
}

#[tokio::test]
async fn test_progress_signal_resets_stall_clock() {
  let h = Harness::new();
  let id = start_project(&h, a_then_b(200)).await;

  h.advance(Duration::days(20)).await;
  h.send(&id, "completeMilestone", json!({ "milestoneId": "a" })).await.unwrap();
  h.advance(Duration::days(20)).await;
  assert_eq!(h.runtime.record(&id).unwrap().state_data["state"], "active");
}

#[tokio::test]
async fn test_stall_hold_retries_after_status_failure() {
  let h = Harness::new();
  let id = start_project(&h, a_then_b(200)).await;
  h.gateway.fail_always(names::UPDATE_ENTITY_STATUS);

  h.advance(Duration::days(30)).await;
  let record = h.runtime.record(&id).unwrap();
  assert_eq!(record.status, InstanceStatus::Active);
  assert_eq!(record.state_data["state"], "active");

  h.gateway.clear_failures();
  h.advance(Duration::minutes(30)).await;
  assert_eq!(h.runtime.record(&id).unwrap().state_data["state"], "on_hold");
}

#[tokio::test]
async fn test_finished_work_completes_on_tick() {
  let h = Harness::new();
  let id = start_project(&h, a_then_b(60)).await;
  h.send(&id, "completeMilestone", json!({ "milestoneId": "a" })).await.unwrap();
  h.send(&id, "completeMilestone", json!({ "milestoneId": "b" })).await.unwrap();

  h.advance(Duration::minutes(30)).await;
  let record = h.runtime.record(&id).unwrap();
  assert_eq!(record.status, InstanceStatus::Completed);
  assert_eq!(record.history.last().unwrap().details["automatic"], true);
}

#[tokio::test]
async fn test_hold_and_cancel_signals() {
  let h = Harness::new();
  let id = start_project(&h, a_then_b(60)).await;

  let err = h.runtime.signal(&id, "startProject", json!({})).await.unwrap_err();
  assert!(matches!(err, WorkflowError::InvalidTransition { .. }));

  h.send(&id, "putOnHold", json!({ "reason": "funding review" })).await.unwrap();
  let err = h
    .runtime
    .signal(&id, "completeMilestone", json!({ "milestoneId": "a" }))
    .await
    .unwrap_err();
  assert!(matches!(err, WorkflowError::InvalidTransition { .. }));

  h.send(&id, "cancelProject", json!({ "reason": "withdrawn" })).await.unwrap();
  let record = h.runtime.record(&id).unwrap();
  assert_eq!(record.status, InstanceStatus::Cancelled);
  assert_eq!(record.state_data["cancelReason"], "withdrawn");
}
