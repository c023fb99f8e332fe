//! The durable executor.

use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, RwLock};

use accu_activity::{ActivityGateway, RecordingGateway};
use accu_config::EngineConfig;
use accu_store::{HistoryEntry, InstanceStatus, MemoryStore, Store, WorkflowKind, WorkflowRecord};
use accu_timer::{Clock, SystemClock, TimerHeap};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::context::StepContext;
use crate::error::WorkflowError;
use crate::instance::{Actor, Command, Dormant, InstanceHandle, Launch, Snapshot, mirror_history};
use crate::replay::{FAILED_ACTION, TERMINATED_ACTION, replay};
use crate::summary::{ListFilter, RecoveryReport, WorkflowSummary};
use crate::workflow::{Workflow, encode_event};

/// Services every instance shares.
pub(crate) struct Shared {
  pub config: EngineConfig,
  pub store: Arc<dyn Store>,
  pub gateway: Arc<dyn ActivityGateway>,
  pub timers: Arc<TimerHeap>,
  pub shutdown: CancellationToken,
}

/// Type-erased workflow definition.
#[async_trait]
trait Definition: Send + Sync {
  async fn create(
    &self,
    shared: &Arc<Shared>,
    id: String,
    entity_type: &str,
    entity_id: &str,
    input: &Value,
    performed_by: &str,
  ) -> Result<Box<dyn Launch>, WorkflowError>;

  /// Replay a stored record. The flag is set when the replayed state differs
  /// from the stored snapshot.
  fn restore(
    &self,
    shared: &Arc<Shared>,
    record: WorkflowRecord,
  ) -> Result<(Box<dyn Launch>, bool), WorkflowError>;
}

struct Registered<W>(PhantomData<fn() -> W>);

#[async_trait]
impl<W: Workflow> Definition for Registered<W> {
  async fn create(
    &self,
    shared: &Arc<Shared>,
    id: String,
    entity_type: &str,
    entity_id: &str,
    input: &Value,
    performed_by: &str,
  ) -> Result<Box<dyn Launch>, WorkflowError> {
    let now = shared.timers.now();
    let (events, performed_by) = {
      let mut ctx = StepContext::new(
        &id,
        entity_type,
        entity_id,
        0,
        0,
        now,
        performed_by.to_string(),
        shared,
      );
      let events = W::start(&mut ctx, input).await?;
      let (performed_by, _) = ctx.finish();
      (events, performed_by)
    };

    let mut state = W::default();
    let mut history = Vec::with_capacity(events.len());
    for event in &events {
      let (action, details) = encode_event(event)?;
      state.apply(event);
      history.push(HistoryEntry {
        sequence: history.len() as u64,
        timestamp: now,
        action,
        performed_by: performed_by.clone(),
        details,
      });
    }

    let record = WorkflowRecord {
      id,
      workflow_type: W::KIND,
      entity_type: entity_type.to_string(),
      entity_id: entity_id.to_string(),
      status: state.status(),
      state_data: serde_json::to_value(&state)?,
      history,
      created_at: now,
      updated_at: now,
    };
    shared.store.insert(&record).await?;
    mirror_history(shared, &record, &record.history).await;

    Ok(Box::new(Actor::new(state, record, shared.clone(), None)))
  }

  fn restore(
    &self,
    shared: &Arc<Shared>,
    mut record: WorkflowRecord,
  ) -> Result<(Box<dyn Launch>, bool), WorkflowError> {
    let replayed = replay::<W>(&record.id, &record.history)?;
    let state_data = serde_json::to_value(&replayed.state)?;
    let mismatched = state_data != record.state_data || replayed.status != record.status;
    if mismatched {
      warn!(
        workflow_id = %record.id,
        stored_status = %record.status,
        replayed_status = %replayed.status,
        "replay_mismatch"
      );
    }
    record.state_data = state_data;
    record.status = replayed.status;

    let launch: Box<dyn Launch> = if record.status.is_live() {
      let now = shared.timers.now();
      Box::new(Actor::new(replayed.state, record, shared.clone(), Some(now)))
    } else {
      Box::new(Dormant::new(replayed.state, record))
    };
    Ok((launch, mismatched))
  }
}

/// Builder for [`Runtime`].
///
/// Defaults to an in-memory store, a [`RecordingGateway`] and the system
/// clock.
pub struct RuntimeBuilder {
  config: EngineConfig,
  store: Option<Arc<dyn Store>>,
  gateway: Option<Arc<dyn ActivityGateway>>,
  clock: Option<Arc<dyn Clock>>,
  definitions: HashMap<WorkflowKind, Arc<dyn Definition>>,
}

impl RuntimeBuilder {
  pub fn store(mut self, store: Arc<dyn Store>) -> Self {
    self.store = Some(store);
    self
  }

  pub fn gateway(mut self, gateway: Arc<dyn ActivityGateway>) -> Self {
    self.gateway = Some(gateway);
    self
  }

  pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = Some(clock);
    self
  }

  /// Register a workflow definition under `W::KIND`.
  pub fn register<W: Workflow>(mut self) -> Self {
    self
      .definitions
      .insert(W::KIND, Arc::new(Registered::<W>(PhantomData)));
    self
  }

  pub fn build(self) -> Runtime {
    let clock = self
      .clock
      .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
    let shared = Shared {
      config: self.config,
      store: self
        .store
        .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn Store>),
      gateway: self
        .gateway
        .unwrap_or_else(|| Arc::new(RecordingGateway::new()) as Arc<dyn ActivityGateway>),
      timers: Arc::new(TimerHeap::new(clock)),
      shutdown: CancellationToken::new(),
    };
    Runtime {
      inner: Arc::new(Inner {
        shared: Arc::new(shared),
        definitions: self.definitions,
        instances: RwLock::new(HashMap::new()),
        starting: Mutex::new(HashSet::new()),
      }),
    }
  }
}

struct Inner {
  shared: Arc<Shared>,
  definitions: HashMap<WorkflowKind, Arc<dyn Definition>>,
  instances: RwLock<HashMap<String, InstanceHandle>>,
  /// Keys with a `start` in flight.
  starting: Mutex<HashSet<(WorkflowKind, String)>>,
}

/// Releases a `(kind, entity)` start reservation when dropped.
struct Reservation<'a> {
  starting: &'a Mutex<HashSet<(WorkflowKind, String)>>,
  key: (WorkflowKind, String),
}

impl Drop for Reservation<'_> {
  fn drop(&mut self) {
    self.starting.lock().unwrap().remove(&self.key);
  }
}

/// Pending outcome of a queued signal.
#[derive(Debug)]
pub struct SignalTicket {
  workflow_id: String,
  reply: oneshot::Receiver<Result<(), WorkflowError>>,
}

impl SignalTicket {
  pub fn workflow_id(&self) -> &str {
    &self.workflow_id
  }

  /// Wait until the signal has been applied or rejected.
  pub async fn outcome(self) -> Result<(), WorkflowError> {
    match self.reply.await {
      Ok(outcome) => outcome,
      Err(_) => Err(WorkflowError::Terminated {
        workflow_id: self.workflow_id,
      }),
    }
  }
}

/// Owns every workflow instance of the process.
///
/// Cheap to clone; clones share the same instances.
///
/// # Usage
///
/// ```ignore
/// let runtime = Runtime::builder(config)
///   .store(store)
///   .gateway(gateway)
///   .register::<DeadlineWorkflow>()
///   .build();
///
/// runtime.recover().await?;
/// let id = runtime.start(WorkflowKind::Deadline, "project", "p-1", input, "api").await?;
/// runtime.signal(&id, "completeDeadline", payload).await?.outcome().await?;
///
/// let cancel = CancellationToken::new();
/// runtime.run(cancel).await;
/// ```
#[derive(Clone)]
pub struct Runtime {
  inner: Arc<Inner>,
}

impl Runtime {
  pub fn builder(config: EngineConfig) -> RuntimeBuilder {
    RuntimeBuilder {
      config,
      store: None,
      gateway: None,
      clock: None,
      definitions: HashMap::new(),
    }
  }

  pub fn config(&self) -> &EngineConfig {
    &self.inner.shared.config
  }

  pub fn now(&self) -> DateTime<Utc> {
    self.inner.shared.timers.now()
  }

  pub fn timers(&self) -> &TimerHeap {
    &self.inner.shared.timers
  }

  pub fn is_registered(&self, kind: WorkflowKind) -> bool {
    self.inner.definitions.contains_key(&kind)
  }

  fn handle(&self, id: &str) -> Result<InstanceHandle, WorkflowError> {
    self
      .inner
      .instances
      .read()
      .unwrap()
      .get(id)
      .cloned()
      .ok_or_else(|| WorkflowError::NoSuchWorkflow {
        workflow_id: id.to_string(),
      })
  }

  /// Id of the live instance for `(kind, entity_id)`, if any.
  pub fn find_live(&self, kind: WorkflowKind, entity_id: &str) -> Option<String> {
    let instances = self.inner.instances.read().unwrap();
    instances
      .iter()
      .find(|(_, handle)| {
        handle.kind == kind
          && handle.entity_id == entity_id
          && handle.cell.snapshot().record.status.is_live()
      })
      .map(|(id, _)| id.clone())
  }

  /// Create an instance and run its start handler.
  #[instrument(name = "start_workflow", skip(self, input), fields(workflow_type = %kind))]
  pub async fn start(
    &self,
    kind: WorkflowKind,
    entity_type: &str,
    entity_id: &str,
    input: Value,
    performed_by: &str,
  ) -> Result<String, WorkflowError> {
    if self.inner.shared.shutdown.is_cancelled() {
      return Err(WorkflowError::Shutdown);
    }
    let definition = self
      .inner
      .definitions
      .get(&kind)
      .cloned()
      .ok_or(WorkflowError::NotRegistered { kind })?;

    let key = (kind, entity_id.to_string());
    if !self.inner.starting.lock().unwrap().insert(key.clone()) {
      return Err(WorkflowError::AlreadyExists {
        kind,
        entity_id: entity_id.to_string(),
        workflow_id: "pending".to_string(),
      });
    }
    let _reservation = Reservation {
      starting: &self.inner.starting,
      key,
    };

    if let Some(existing) = self.find_live(kind, entity_id) {
      return Err(WorkflowError::AlreadyExists {
        kind,
        entity_id: entity_id.to_string(),
        workflow_id: existing,
      });
    }

    let id = format!("{}-{}", kind, Uuid::new_v4());
    let launch = definition
      .create(
        &self.inner.shared,
        id.clone(),
        entity_type,
        entity_id,
        &input,
        performed_by,
      )
      .await?;

    {
      let mut instances = self.inner.instances.write().unwrap();
      instances.insert(id.clone(), launch.launch());
    }
    info!(workflow_id = %id, entity_id = %entity_id, "workflow_started");
    Ok(id)
  }

  /// Check a signal against the latest snapshot and queue it.
  ///
  /// Unknown signals, malformed payloads and signals that are illegal in
  /// the current state are rejected here. Failures that depend on the
  /// step itself arrive through [`SignalTicket::outcome`].
  #[instrument(name = "signal_workflow", skip(self, payload), fields(workflow_id = %id, signal = %name))]
  pub async fn signal(&self, id: &str, name: &str, payload: Value) -> Result<SignalTicket, WorkflowError> {
    let handle = self.handle(id)?;
    let snapshot = handle.cell.snapshot();
    if !snapshot.record.status.is_live() {
      return Err(WorkflowError::invalid_transition(
        name,
        snapshot.record.status.as_str(),
      ));
    }
    snapshot.view.check_signal(name, &payload)?;

    let sender = handle
      .commands
      .ok_or_else(|| WorkflowError::invalid_transition(name, snapshot.record.status.as_str()))?;
    let (reply, receiver) = oneshot::channel();
    sender
      .send(Command::Signal {
        name: name.to_string(),
        payload,
        reply,
      })
      .await
      .map_err(|_| WorkflowError::Terminated {
        workflow_id: id.to_string(),
      })?;

    debug!("signal_queued");
    Ok(SignalTicket {
      workflow_id: id.to_string(),
      reply: receiver,
    })
  }

  /// Read the last committed state. Never waits for queued signals.
  pub fn query(&self, id: &str, name: &str, args: &Value) -> Result<Value, WorkflowError> {
    let snapshot = self.handle(id)?.cell.snapshot();
    match name {
      "getHistory" => Ok(serde_json::to_value(&snapshot.record.history)?),
      "getWorkflowStatus" => Ok(status_report(&snapshot)),
      _ => snapshot.view.query(name, args, self.now()),
    }
  }

  pub fn describe(&self, id: &str) -> Result<WorkflowSummary, WorkflowError> {
    let snapshot = self.handle(id)?.cell.snapshot();
    Ok(WorkflowSummary::new(&snapshot.record, snapshot.view.state_name()))
  }

  /// Last committed record of an instance.
  pub fn record(&self, id: &str) -> Result<WorkflowRecord, WorkflowError> {
    Ok(self.handle(id)?.cell.snapshot().record.clone())
  }

  /// Summaries matching `filter`, oldest first.
  pub fn list(&self, filter: &ListFilter) -> Vec<WorkflowSummary> {
    let instances = self.inner.instances.read().unwrap();
    let mut summaries: Vec<WorkflowSummary> = instances
      .values()
      .map(|handle| {
        let snapshot = handle.cell.snapshot();
        WorkflowSummary::new(&snapshot.record, snapshot.view.state_name())
      })
      .filter(|summary| filter.matches(summary))
      .collect();
    summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    summaries
  }

  /// Force an instance to `cancelled`.
  ///
  /// Takes effect immediately: a step that is still running is discarded
  /// and its activity results are ignored.
  #[instrument(name = "terminate_workflow", skip(self), fields(workflow_id = %id))]
  pub async fn terminate(&self, id: &str, reason: &str, performed_by: &str) -> Result<(), WorkflowError> {
    let handle = self.handle(id)?;
    let shared = &self.inner.shared;

    let guard = handle.cell.commit.lock().await;
    let snapshot = handle.cell.snapshot();
    let status = snapshot.record.status;
    if matches!(status, InstanceStatus::Completed | InstanceStatus::Cancelled) {
      return Err(WorkflowError::invalid_transition("terminate", status.as_str()));
    }

    handle.cell.cancel.cancel();
    shared.timers.cancel_instance(id);

    let now = shared.timers.now();
    let mut record = snapshot.record.clone();
    let entry = HistoryEntry {
      sequence: record.next_sequence(),
      timestamp: now,
      action: TERMINATED_ACTION.to_string(),
      performed_by: performed_by.to_string(),
      details: json!({ "reason": reason, "previousStatus": status }),
    };
    record.history.push(entry.clone());
    record.status = InstanceStatus::Cancelled;
    record.updated_at = now;

    shared.store.save(&record).await?;
    handle.cell.publish(Snapshot {
      record: record.clone(),
      view: snapshot.view.clone(),
    });
    drop(guard);

    info!(reason = %reason, "workflow_terminated");
    mirror_history(shared, &record, &[entry]).await;
    Ok(())
  }

  /// Load every stored instance, replay it and restart the live ones.
  ///
  /// Instances already loaded in this runtime are skipped.
  #[instrument(name = "recover", skip(self))]
  pub async fn recover(&self) -> Result<RecoveryReport, WorkflowError> {
    let records = self.inner.shared.store.list().await?;
    let mut report = RecoveryReport::default();

    for record in records {
      if self.inner.instances.read().unwrap().contains_key(&record.id) {
        continue;
      }
      let definition = self
        .inner
        .definitions
        .get(&record.workflow_type)
        .cloned()
        .ok_or(WorkflowError::NotRegistered {
          kind: record.workflow_type,
        })?;

      let id = record.id.clone();
      let live = record.status.is_live();
      let (launch, mismatched) = definition.restore(&self.inner.shared, record)?;
      {
        let mut instances = self.inner.instances.write().unwrap();
        instances.insert(id.clone(), launch.launch());
      }

      report.restored += 1;
      if live {
        report.resumed += 1;
      }
      if mismatched {
        report.mismatched.push(id);
      }
    }

    info!(
      restored = report.restored,
      resumed = report.resumed,
      mismatched = report.mismatched.len(),
      "recovery_complete"
    );
    Ok(report)
  }

  /// Remove terminal instances last updated before the retention period.
  #[instrument(name = "collect_garbage", skip(self))]
  pub async fn collect_garbage(&self) -> Result<Vec<String>, WorkflowError> {
    let retention = Duration::days(self.inner.shared.config.runtime.retention_days);
    let cutoff = self.now() - retention;

    let expired: Vec<String> = {
      let instances = self.inner.instances.read().unwrap();
      instances
        .iter()
        .filter(|(_, handle)| {
          let snapshot = handle.cell.snapshot();
          !snapshot.record.status.is_live() && snapshot.record.updated_at < cutoff
        })
        .map(|(id, _)| id.clone())
        .collect()
    };

    for id in &expired {
      self.inner.shared.store.delete(id).await?;
      self.inner.instances.write().unwrap().remove(id);
      debug!(workflow_id = %id, "instance_collected");
    }

    info!(removed = expired.len(), "garbage_collected");
    Ok(expired)
  }

  /// Deliver every timer that is due now and wait until each wake-up has
  /// been processed. Returns the number of timers popped.
  pub async fn fire_due_timers(&self) -> usize {
    let expired = self.inner.shared.timers.pop_due();
    let count = expired.len();

    let deliveries: Vec<_> = {
      let instances = self.inner.instances.read().unwrap();
      expired
        .into_iter()
        .filter_map(|timer| {
          let sender = instances.get(&timer.instance_id)?.commands.clone()?;
          Some(async move {
            let (done, processed) = oneshot::channel();
            let wake = Command::Wake {
              handle: timer.handle,
              reason: timer.reason,
              done,
            };
            if sender.send(wake).await.is_ok() {
              let _ = processed.await;
            }
          })
        })
        .collect()
    };

    futures::future::join_all(deliveries).await;
    count
  }

  /// Drive timers until `cancel` fires.
  pub async fn run(&self, cancel: CancellationToken) {
    info!(armed = self.timers().len(), "timer_driver_started");

    loop {
      self.fire_due_timers().await;

      let timers = &self.inner.shared.timers;
      tokio::select! {
        _ = cancel.cancelled() => {
          info!("timer_driver_cancelled");
          break;
        }
        _ = timers.changed() => {}
        _ = timers.sleep_until_next() => {}
      }
    }
  }

  /// Stop every instance actor. Committed state is unaffected.
  pub fn shutdown(&self) {
    self.inner.shared.shutdown.cancel();
    info!("runtime_shutdown");
  }
}

/// Built-in `getWorkflowStatus` answer.
fn status_report(snapshot: &Snapshot) -> Value {
  let record = &snapshot.record;
  let last_error = record
    .history
    .iter()
    .rev()
    .find(|entry| entry.action == FAILED_ACTION)
    .and_then(|entry| entry.details.get("error").cloned());

  json!({
    "id": record.id,
    "workflowType": record.workflow_type,
    "entityType": record.entity_type,
    "entityId": record.entity_id,
    "status": record.status,
    "state": snapshot.view.state_name(),
    "stateData": record.state_data,
    "historyLength": record.history.len(),
    "lastError": last_error,
    "createdAt": record.created_at,
    "updatedAt": record.updated_at,
  })
}
