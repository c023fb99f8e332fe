mod common;

use std::sync::Arc;

use accu_activity::ActivityCall;
use accu_runtime::{InstanceStatus, Workflow, WorkflowError, WorkflowKind, WorkflowRecord, replay};
use accu_store::{SqliteStore, Store};
use accu_workflows::{ApplicationWorkflow, DeadlineWorkflow, ProjectWorkflow};
use chrono::Duration;
use common::{Harness, fast_config, start_time};
use serde_json::{Value, json};

fn assert_replays<W: Workflow>(record: &WorkflowRecord) {
  let replayed = replay::<W>(&record.id, &record.history).unwrap();
  assert_eq!(serde_json::to_value(&replayed.state).unwrap(), record.state_data);
  assert_eq!(replayed.status, record.status);
}

async fn open(path: &std::path::Path) -> Arc<dyn Store> {
  Arc::new(SqliteStore::open(path).await.expect("failed to open store"))
}

#[tokio::test]
async fn test_history_replays_to_committed_state() {
  let h = Harness::new();

  let deadlines = h
    .start(
      WorkflowKind::Deadline,
      "project",
      "project-1",
      json!({ "deadlines": [{ "title": "Audit", "dueDate": start_time() + Duration::hours(3), "priority": "critical" }] }),
    )
    .await;
  let application = h
    .start(
      WorkflowKind::ApplicationLifecycle,
      "accu_application",
      "app-1",
      json!({ "accuUnits": 40 }),
    )
    .await;
  let project = h
    .start(
      WorkflowKind::ProjectLifecycle,
      "project",
      "project-1",
      json!({ "name": "Reforestation", "milestones": [{ "id": "m1", "title": "Plant", "dueDate": start_time() + Duration::days(1) }] }),
    )
    .await;

  h.send(&application, "submitApplication", json!({})).await.unwrap();
  h.send(&application, "assignReviewer", json!({ "reviewerId": "r" })).await.unwrap();
  h.send(&project, "startProject", json!({})).await.unwrap();
  for _ in 0..12 {
    h.advance(Duration::hours(2)).await;
  }
  h.send(&project, "completeMilestone", json!({ "milestoneId": "m1" })).await.unwrap();

  assert_replays::<DeadlineWorkflow>(&h.runtime.record(&deadlines).unwrap());
  assert_replays::<ApplicationWorkflow>(&h.runtime.record(&application).unwrap());
  assert_replays::<ProjectWorkflow>(&h.runtime.record(&project).unwrap());
}

#[tokio::test]
async fn test_sqlite_restart_resumes_instances() {
  let dir = tempfile::tempdir().expect("failed to create temp dir");
  let path = dir.path().join("accu.db");

  let (deadlines, application) = {
    let first = Harness::with(fast_config(), open(&path).await, start_time());
    let deadlines = first
      .start(
        WorkflowKind::Deadline,
        "project",
        "project-1",
        json!({ "ownerId": "owner-1", "deadlines": [{ "title": "Audit", "dueDate": start_time() + Duration::hours(2), "priority": "high" }] }),
      )
      .await;
    let application = first
      .start(WorkflowKind::ApplicationLifecycle, "accu_application", "app-1", Value::Null)
      .await;
    first.send(&application, "submitApplication", json!({})).await.unwrap();
    first.advance(Duration::minutes(30)).await;
    assert_eq!(first.gateway.notifications().len(), 1);
    first.runtime.shutdown();
    (deadlines, application)
  };

  // The process was down for three hours.
  let second = Harness::with(
    fast_config(),
    open(&path).await,
    start_time() + Duration::hours(3) + Duration::minutes(30),
  );
  let report = second.runtime.recover().await.unwrap();
  assert_eq!(report.restored, 2);
  assert_eq!(report.resumed, 2);
  assert!(report.mismatched.is_empty());

  assert_eq!(second.runtime.describe(&application).unwrap().state, "submitted");
  let deadline = &second.query(&deadlines, "getDeadlines", Value::Null)[0];
  assert_eq!(deadline["status"], "pending");
  assert_eq!(deadline["reminderSchedule"][2]["sent"], true);

  // Catch-up tick: overdue detection runs immediately after recovery.
  assert_eq!(second.runtime.fire_due_timers().await, 1);
  let deadline = &second.query(&deadlines, "getDeadlines", Value::Null)[0];
  assert_eq!(deadline["status"], "overdue");
  assert_eq!(deadline["overdueNotified"], true);

  // The review-assignment wait survives the restart.
  let pending = second.runtime.timers().pending_for(&application);
  assert_eq!(pending.len(), 1);
  assert_eq!(pending[0].1, start_time() + Duration::days(14));

  second
    .send(&application, "assignReviewer", json!({ "reviewerId": "r" }))
    .await
    .unwrap();
  let record = second.runtime.record(&application).unwrap();
  assert_eq!(record.status, InstanceStatus::Active);
  assert_replays::<ApplicationWorkflow>(&record);
  assert_replays::<DeadlineWorkflow>(&second.runtime.record(&deadlines).unwrap());
}

#[tokio::test]
async fn test_rejected_approval_validates_again_after_restart() {
  let dir = tempfile::tempdir().expect("failed to create temp dir");
  let path = dir.path().join("accu.db");

  let id = {
    let first = Harness::with(fast_config(), open(&path).await, start_time());
    let id = first
      .start(
        WorkflowKind::ApplicationLifecycle,
        "accu_application",
        "app-1",
        json!({ "accuUnits": 1200, "applicantId": "user-1" }),
      )
      .await;
    first.send(&id, "submitApplication", json!({})).await.unwrap();
    first
      .send(&id, "assignReviewer", json!({ "reviewerId": "r" }))
      .await
      .unwrap();

    first.gateway.set_rules_valid(false);
    let err = first
      .send(&id, "approveApplication", json!({ "approverId": "a" }))
      .await
      .unwrap_err();
    assert!(matches!(err, WorkflowError::ValidationFailed { .. }));
    first.runtime.shutdown();
    id
  };

  let second = Harness::with(fast_config(), open(&path).await, start_time());
  second.runtime.recover().await.unwrap();
  second
    .send(&id, "approveApplication", json!({ "approverId": "a" }))
    .await
    .unwrap();
  assert_eq!(second.runtime.describe(&id).unwrap().state, "approved");

  let checks = second
    .gateway
    .calls()
    .into_iter()
    .filter(|call| matches!(call, ActivityCall::ValidateBusinessRules(_)))
    .count();
  assert_eq!(checks, 1);
}

#[tokio::test]
async fn test_deadlines_created_in_separate_processes_stay_distinct() {
  let dir = tempfile::tempdir().expect("failed to create temp dir");
  let path = dir.path().join("accu.db");

  let id = {
    let first = Harness::with(fast_config(), open(&path).await, start_time());
    let id = first
      .start(
        WorkflowKind::Deadline,
        "project",
        "project-1",
        json!({ "deadlines": [{ "title": "Audit", "dueDate": start_time() + Duration::days(5) }] }),
      )
      .await;
    first.runtime.shutdown();
    id
  };

  // A fresh calendar adapter hands out `cal-1` again.
  let second = Harness::with(fast_config(), open(&path).await, start_time());
  second.runtime.recover().await.unwrap();
  second
    .send(
      &id,
      "createDeadline",
      json!({ "title": "Report", "dueDate": start_time() + Duration::days(9) }),
    )
    .await
    .unwrap();

  let deadlines = second.query(&id, "getDeadlines", Value::Null);
  let ids: Vec<&str> = deadlines
    .as_array()
    .unwrap()
    .iter()
    .map(|d| d["id"].as_str().unwrap())
    .collect();
  assert_eq!(ids, vec![format!("{}-d1", id), format!("{}-d2", id)]);
  assert_eq!(deadlines[0]["calendarId"], deadlines[1]["calendarId"]);

  second
    .send(&id, "completeDeadline", json!({ "deadlineId": ids[1] }))
    .await
    .unwrap();
  let deadlines = second.query(&id, "getDeadlines", Value::Null);
  assert_eq!(deadlines[0]["status"], "pending");
  assert_eq!(deadlines[1]["status"], "completed");
}
