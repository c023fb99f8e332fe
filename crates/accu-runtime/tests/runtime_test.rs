//! Runtime behaviour against a small counter workflow.

use std::sync::Arc;

use accu_activity::{ActivityCall, Channel, Notification, RecordingGateway, names};
use accu_config::{EngineConfig, RetryBackoff, RetryPolicy};
use accu_runtime::{
  InstanceStatus, ListFilter, Runtime, StepContext, TimerReason, TimerRequest, Workflow,
  WorkflowError, WorkflowKind, replay,
};
use accu_store::{MemoryStore, Store};
use accu_timer::ManualClock;
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Counter {
  owner: String,
  total: u32,
  ticks: u32,
  closed: bool,
  expired: bool,
  started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "action", content = "details", rename_all = "camelCase")]
enum CounterEvent {
  Started { owner: String, at: DateTime<Utc> },
  Incremented { by: u32, total: u32 },
  Ticked {},
  Expired {},
  Closed {},
}

#[derive(Debug, Deserialize)]
#[serde(tag = "signal", content = "payload", rename_all = "camelCase")]
enum CounterSignal {
  Increment { by: u32 },
  Notify {},
  Close {},
}

#[derive(Debug, Deserialize)]
struct StartInput {
  owner: String,
}

#[async_trait]
impl Workflow for Counter {
  type Event = CounterEvent;
  type Signal = CounterSignal;

  const KIND: WorkflowKind = WorkflowKind::Deadline;
  const SIGNALS: &'static [&'static str] = &["increment", "notify", "close"];

  async fn start(ctx: &mut StepContext<'_>, input: &Value) -> Result<Vec<CounterEvent>, WorkflowError> {
    let input: StartInput = serde_json::from_value(input.clone())?;
    Ok(vec![CounterEvent::Started {
      owner: input.owner,
      at: ctx.now(),
    }])
  }

  fn apply(&mut self, event: &CounterEvent) {
    match event {
      CounterEvent::Started { owner, at } => {
        self.owner = owner.clone();
        self.started_at = Some(*at);
      }
      CounterEvent::Incremented { total, .. } => self.total = *total,
      CounterEvent::Ticked {} => self.ticks += 1,
      CounterEvent::Expired {} => self.expired = true,
      CounterEvent::Closed {} => self.closed = true,
    }
  }

  fn status(&self) -> InstanceStatus {
    if self.closed || self.expired {
      InstanceStatus::Completed
    } else {
      InstanceStatus::Active
    }
  }

  fn state_name(&self) -> String {
    let name = if self.closed { "closed" } else { "open" };
    name.to_string()
  }

  fn check(&self, signal: &CounterSignal) -> Result<(), WorkflowError> {
    match signal {
      CounterSignal::Increment { by: 0 } => Err(WorkflowError::precondition("increment must be positive")),
      _ => Ok(()),
    }
  }

  async fn on_signal(
    &self,
    ctx: &mut StepContext<'_>,
    signal: CounterSignal,
  ) -> Result<Vec<CounterEvent>, WorkflowError> {
    match signal {
      CounterSignal::Increment { by } => Ok(vec![CounterEvent::Incremented {
        by,
        total: self.total + by,
      }]),
      CounterSignal::Notify {} => {
        let n = Notification::new(Channel::Email, &self.owner, "Counter", "total changed");
        ctx.send_notification(&n).await?;
        Ok(vec![])
      }
      CounterSignal::Close {} => Ok(vec![CounterEvent::Closed {}]),
    }
  }

  async fn on_timer(
    &self,
    _ctx: &mut StepContext<'_>,
    reason: &TimerReason,
  ) -> Result<Vec<CounterEvent>, WorkflowError> {
    Ok(match reason {
      TimerReason::Tick => vec![CounterEvent::Ticked {}],
      TimerReason::Wait(_) => vec![CounterEvent::Expired {}],
    })
  }

  fn timers(&self, _config: &EngineConfig) -> Vec<TimerRequest> {
    match self.started_at {
      Some(at) if !self.expired => vec![TimerRequest::wait("expire", at + Duration::days(1))],
      _ => vec![],
    }
  }

  fn ticks(&self) -> bool {
    true
  }

  fn query(&self, name: &str, _args: &Value, _now: DateTime<Utc>) -> Result<Value, WorkflowError> {
    match name {
      "getTotal" => Ok(json!(self.total)),
      _ => Err(WorkflowError::UnknownQuery {
        query: name.to_string(),
      }),
    }
  }
}

fn start_time() -> DateTime<Utc> {
  Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

fn fast_config() -> EngineConfig {
  let mut config = EngineConfig::default();
  config.retry = RetryPolicy {
    max_attempts: 2,
    initial_backoff_ms: 1,
    max_backoff_ms: 2,
    backoff: RetryBackoff::Constant,
  };
  config
}

struct Harness {
  runtime: Runtime,
  clock: Arc<ManualClock>,
  gateway: Arc<RecordingGateway>,
  store: Arc<MemoryStore>,
}

fn harness_with_store(store: Arc<MemoryStore>, clock: Arc<ManualClock>) -> Harness {
  let gateway = Arc::new(RecordingGateway::new());
  let runtime = Runtime::builder(fast_config())
    .store(store.clone())
    .gateway(gateway.clone())
    .clock(clock.clone())
    .register::<Counter>()
    .build();
  Harness {
    runtime,
    clock,
    gateway,
    store,
  }
}

fn harness() -> Harness {
  harness_with_store(
    Arc::new(MemoryStore::new()),
    Arc::new(ManualClock::new(start_time())),
  )
}

async fn start_counter(runtime: &Runtime, entity: &str) -> String {
  runtime
    .start(
      WorkflowKind::Deadline,
      "counter",
      entity,
      json!({ "owner": "user-1" }),
      "tester",
    )
    .await
    .unwrap()
}

async fn send(runtime: &Runtime, id: &str, name: &str, payload: Value) -> Result<(), WorkflowError> {
  runtime.signal(id, name, payload).await?.outcome().await
}

#[tokio::test]
async fn test_start_signal_and_query() {
  let h = harness();
  let id = start_counter(&h.runtime, "c-1").await;
  assert!(id.starts_with("deadline-"));

  send(&h.runtime, &id, "increment", json!({ "by": 3 })).await.unwrap();
  send(&h.runtime, &id, "increment", json!({ "by": 4 })).await.unwrap();

  assert_eq!(h.runtime.query(&id, "getTotal", &Value::Null).unwrap(), json!(7));

  let history = h.runtime.query(&id, "getHistory", &Value::Null).unwrap();
  let actions: Vec<&str> = history
    .as_array()
    .unwrap()
    .iter()
    .map(|e| e["action"].as_str().unwrap())
    .collect();
  assert_eq!(actions, vec!["started", "incremented", "incremented"]);
  assert_eq!(history[0]["performedBy"], "tester");

  let status = h.runtime.query(&id, "getWorkflowStatus", &Value::Null).unwrap();
  assert_eq!(status["status"], "active");
  assert_eq!(status["state"], "open");

  let stored = h.store.get(&id).await.unwrap();
  assert_eq!(stored.history.len(), 3);
  assert_eq!(stored.state_data["total"], 7);
}

#[tokio::test]
async fn test_one_live_instance_per_entity() {
  let h = harness();
  let id = start_counter(&h.runtime, "c-1").await;

  let err = h
    .runtime
    .start(WorkflowKind::Deadline, "counter", "c-1", json!({ "owner": "u" }), "t")
    .await
    .unwrap_err();
  assert!(matches!(err, WorkflowError::AlreadyExists { ref workflow_id, .. } if *workflow_id == id));

  send(&h.runtime, &id, "close", Value::Null).await.unwrap();
  let second = start_counter(&h.runtime, "c-1").await;
  assert_ne!(id, second);
  assert_eq!(h.runtime.find_live(WorkflowKind::Deadline, "c-1"), Some(second));
}

#[tokio::test]
async fn test_unregistered_kind() {
  let h = harness();
  let err = h
    .runtime
    .start(WorkflowKind::ProjectLifecycle, "project", "p-1", json!({}), "t")
    .await
    .unwrap_err();
  assert!(matches!(err, WorkflowError::NotRegistered { .. }));
}

#[tokio::test]
async fn test_signal_pre_checks() {
  let h = harness();
  let id = start_counter(&h.runtime, "c-1").await;

  let err = h.runtime.signal(&id, "explode", json!({})).await.unwrap_err();
  assert!(matches!(err, WorkflowError::UnknownSignal { .. }));

  let err = h
    .runtime
    .signal(&id, "increment", json!({ "by": "three" }))
    .await
    .unwrap_err();
  assert!(matches!(err, WorkflowError::InvalidPayload { .. }));

  let err = h.runtime.signal(&id, "increment", json!({ "by": 0 })).await.unwrap_err();
  assert!(matches!(err, WorkflowError::PreconditionFailed { .. }));

  let err = h.runtime.signal("deadline-missing", "close", json!({})).await.unwrap_err();
  assert!(matches!(err, WorkflowError::NoSuchWorkflow { .. }));

  send(&h.runtime, &id, "close", json!({})).await.unwrap();
  let err = h.runtime.signal(&id, "increment", json!({ "by": 1 })).await.unwrap_err();
  assert!(matches!(err, WorkflowError::InvalidTransition { .. }));
  assert_eq!(h.runtime.query(&id, "getTotal", &Value::Null).unwrap(), json!(0));
}

#[tokio::test]
async fn test_signals_apply_in_delivery_order() {
  let h = harness();
  let id = start_counter(&h.runtime, "c-1").await;

  let mut tickets = Vec::new();
  for by in 1..=20 {
    tickets.push(h.runtime.signal(&id, "increment", json!({ "by": by })).await.unwrap());
  }
  for ticket in tickets {
    ticket.outcome().await.unwrap();
  }

  let record = h.runtime.record(&id).unwrap();
  let increments: Vec<u64> = record
    .history
    .iter()
    .filter(|e| e.action == "incremented")
    .map(|e| e.details["by"].as_u64().unwrap())
    .collect();
  assert_eq!(increments, (1..=20).collect::<Vec<u64>>());
  assert_eq!(record.state_data["total"], 210);
}

#[tokio::test]
async fn test_exhausted_activity_fails_instance() {
  let h = harness();
  let id = start_counter(&h.runtime, "c-1").await;
  h.gateway.fail_always(names::SEND_NOTIFICATION);

  let err = send(&h.runtime, &id, "notify", json!({})).await.unwrap_err();
  assert!(matches!(err, WorkflowError::ActivityFailure(ref e) if e.attempts == 2));

  let status = h.runtime.query(&id, "getWorkflowStatus", &Value::Null).unwrap();
  assert_eq!(status["status"], "failed");
  assert!(status["lastError"].as_str().unwrap().contains("sendNotification"));

  let err = h.runtime.signal(&id, "increment", json!({ "by": 1 })).await.unwrap_err();
  assert!(matches!(err, WorkflowError::InvalidTransition { .. }));
  assert!(h.runtime.timers().pending_for(&id).is_empty());

  let stored = h.store.get(&id).await.unwrap();
  assert_eq!(stored.status, InstanceStatus::Failed);
  assert_eq!(stored.history.last().unwrap().action, "workflowFailed");
}

#[tokio::test]
async fn test_terminate() {
  let h = harness();
  let id = start_counter(&h.runtime, "c-1").await;
  assert!(!h.runtime.timers().pending_for(&id).is_empty());

  h.runtime.terminate(&id, "entity deleted", "admin").await.unwrap();

  let record = h.runtime.record(&id).unwrap();
  assert_eq!(record.status, InstanceStatus::Cancelled);
  let last = record.history.last().unwrap();
  assert_eq!(last.action, "workflowTerminated");
  assert_eq!(last.performed_by, "admin");
  assert_eq!(last.details["reason"], "entity deleted");
  assert!(h.runtime.timers().pending_for(&id).is_empty());

  let err = h.runtime.terminate(&id, "again", "admin").await.unwrap_err();
  assert!(matches!(err, WorkflowError::InvalidTransition { .. }));
  let err = h.runtime.signal(&id, "close", json!({})).await.unwrap_err();
  assert!(matches!(err, WorkflowError::InvalidTransition { .. }));
}

#[tokio::test]
async fn test_ticks_and_conditional_wait() {
  let h = harness();
  let id = start_counter(&h.runtime, "c-1").await;

  assert_eq!(h.runtime.fire_due_timers().await, 0);

  h.clock.advance(Duration::minutes(30));
  assert_eq!(h.runtime.fire_due_timers().await, 1);
  assert_eq!(h.runtime.record(&id).unwrap().state_data["ticks"], 1);

  h.clock.advance(Duration::minutes(29));
  assert_eq!(h.runtime.fire_due_timers().await, 0);

  h.clock.advance(Duration::days(1));
  h.runtime.fire_due_timers().await;
  let record = h.runtime.record(&id).unwrap();
  assert_eq!(record.status, InstanceStatus::Completed);
  assert_eq!(record.state_data["expired"], true);
  assert!(h.runtime.timers().pending_for(&id).is_empty());
}

#[tokio::test]
async fn test_history_is_mirrored() {
  let h = harness();
  let id = start_counter(&h.runtime, "c-1").await;
  send(&h.runtime, &id, "increment", json!({ "by": 1 })).await.unwrap();

  let mirrored: Vec<u64> = h
    .gateway
    .calls()
    .into_iter()
    .filter_map(|call| match call {
      ActivityCall::RecordHistoryEntry(record) if record.workflow_id == id => Some(record.step),
      _ => None,
    })
    .collect();
  assert_eq!(mirrored, vec![0, 1]);
}

#[tokio::test]
async fn test_recover_replays_history() {
  let store = Arc::new(MemoryStore::new());
  let clock = Arc::new(ManualClock::new(start_time()));

  let first = harness_with_store(store.clone(), clock.clone());
  let live = start_counter(&first.runtime, "c-1").await;
  send(&first.runtime, &live, "increment", json!({ "by": 5 })).await.unwrap();
  let done = start_counter(&first.runtime, "c-2").await;
  send(&first.runtime, &done, "close", json!({})).await.unwrap();
  first.runtime.shutdown();

  let second = harness_with_store(store.clone(), clock.clone());
  let report = second.runtime.recover().await.unwrap();
  assert_eq!(report.restored, 2);
  assert_eq!(report.resumed, 1);
  assert!(report.mismatched.is_empty());

  assert_eq!(second.runtime.query(&live, "getTotal", &Value::Null).unwrap(), json!(5));
  assert_eq!(second.runtime.describe(&done).unwrap().state, "closed");

  // Recovered live instances catch up with an immediate tick.
  second.runtime.fire_due_timers().await;
  assert_eq!(second.runtime.record(&live).unwrap().state_data["ticks"], 1);

  send(&second.runtime, &live, "increment", json!({ "by": 1 })).await.unwrap();
  assert_eq!(second.runtime.query(&live, "getTotal", &Value::Null).unwrap(), json!(6));

  let again = second.runtime.recover().await.unwrap();
  assert_eq!(again.restored, 0);
}

#[tokio::test]
async fn test_recover_prefers_replayed_state() {
  let store = Arc::new(MemoryStore::new());
  let clock = Arc::new(ManualClock::new(start_time()));

  let first = harness_with_store(store.clone(), clock.clone());
  let id = start_counter(&first.runtime, "c-1").await;
  send(&first.runtime, &id, "increment", json!({ "by": 2 })).await.unwrap();
  first.runtime.shutdown();

  let mut tampered = store.get(&id).await.unwrap();
  tampered.state_data["total"] = json!(99);
  store.save(&tampered).await.unwrap();

  let second = harness_with_store(store, clock);
  let report = second.runtime.recover().await.unwrap();
  assert_eq!(report.mismatched, vec![id.clone()]);
  assert_eq!(second.runtime.query(&id, "getTotal", &Value::Null).unwrap(), json!(2));
}

#[tokio::test]
async fn test_replay_matches_committed_state() {
  let h = harness();
  let id = start_counter(&h.runtime, "c-1").await;
  for by in [1, 2, 3] {
    send(&h.runtime, &id, "increment", json!({ "by": by })).await.unwrap();
  }
  h.clock.advance(Duration::minutes(30));
  h.runtime.fire_due_timers().await;

  let record = h.runtime.record(&id).unwrap();
  let replayed = replay::<Counter>(&id, &record.history).unwrap();
  assert_eq!(serde_json::to_value(&replayed.state).unwrap(), record.state_data);
  assert_eq!(replayed.status, record.status);
}

#[tokio::test]
async fn test_list_and_garbage_collection() {
  let h = harness();
  let open = start_counter(&h.runtime, "c-1").await;
  let closed = start_counter(&h.runtime, "c-2").await;
  send(&h.runtime, &closed, "close", json!({})).await.unwrap();

  let all = h.runtime.list(&ListFilter::default());
  assert_eq!(all.len(), 2);
  let completed = h.runtime.list(&ListFilter {
    status: Some(InstanceStatus::Completed),
    ..Default::default()
  });
  assert_eq!(completed.len(), 1);
  assert_eq!(completed[0].id, closed);

  assert!(h.runtime.collect_garbage().await.unwrap().is_empty());

  h.clock.advance(Duration::days(31));
  let removed = h.runtime.collect_garbage().await.unwrap();
  assert_eq!(removed, vec![closed.clone()]);
  assert!(h.store.get(&closed).await.is_err());
  assert!(h.runtime.describe(&open).is_ok());
  assert!(matches!(
    h.runtime.describe(&closed),
    Err(WorkflowError::NoSuchWorkflow { .. })
  ));
}

#[tokio::test]
async fn test_journaled_activity_is_not_repeated_after_restart() {
  let store = Arc::new(MemoryStore::new());
  let clock = Arc::new(ManualClock::new(start_time()));

  let first = harness_with_store(store.clone(), clock.clone());
  let id = start_counter(&first.runtime, "c-1").await;
  first.runtime.shutdown();

  // The notification went out, then the process died before the step committed.
  let sequence = store.get(&id).await.unwrap().next_sequence();
  store
    .journal_put(&format!("{}:{}:0", id, sequence), names::SEND_NOTIFICATION, &Value::Null)
    .await
    .unwrap();

  let second = harness_with_store(store, clock);
  second.runtime.recover().await.unwrap();
  send(&second.runtime, &id, "notify", json!({})).await.unwrap();

  assert!(second.gateway.notifications().is_empty());
}

#[tokio::test]
async fn test_journal_entry_for_another_activity_is_not_reused() {
  let h = harness();
  let id = start_counter(&h.runtime, "c-1").await;
  let sequence = h.runtime.record(&id).unwrap().next_sequence();
  h.store
    .journal_put(
      &format!("{}:{}:0", id, sequence),
      names::VALIDATE_BUSINESS_RULES,
      &json!(true),
    )
    .await
    .unwrap();

  send(&h.runtime, &id, "notify", json!({})).await.unwrap();

  let notifications = h.gateway.notifications();
  assert_eq!(notifications.len(), 1);
  assert_eq!(notifications[0].user_id, "user-1");
}

#[tokio::test]
async fn test_step_without_events_discards_its_journal() {
  let store = Arc::new(MemoryStore::new());
  let clock = Arc::new(ManualClock::new(start_time()));

  let first = harness_with_store(store.clone(), clock.clone());
  let id = start_counter(&first.runtime, "c-1").await;
  let sequence = first.runtime.record(&id).unwrap().next_sequence();

  send(&first.runtime, &id, "notify", json!({})).await.unwrap();
  assert_eq!(first.gateway.notifications().len(), 1);
  let used = format!("{}:{}:0", id, sequence);
  assert_eq!(store.journal_get(&used).await.unwrap(), None);
  first.runtime.shutdown();

  // After a restart the next attempt at the same sequence skips the used key.
  let second = harness_with_store(store, clock);
  second.runtime.recover().await.unwrap();
  send(&second.runtime, &id, "notify", json!({})).await.unwrap();

  let keys: Vec<String> = second
    .gateway
    .keyed_calls()
    .into_iter()
    .filter(|(_, call)| matches!(call, ActivityCall::SendNotification(_)))
    .map(|(key, _)| key.to_string())
    .collect();
  assert_eq!(keys, vec![format!("{}:{}:1", id, sequence)]);
}
