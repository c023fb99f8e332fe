//! Per-instance actor.
//!
//! Each live instance is one tokio task that owns its state and drains a
//! single command queue, so signals and timer wake-ups are applied strictly
//! one at a time in arrival order. Committed state is published through a
//! `watch` channel for lock-free queries.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use accu_activity::{HistoryRecord, IdempotencyKey, names, with_retry};
use accu_store::{HistoryEntry, InstanceStatus, WorkflowKind, WorkflowRecord};
use accu_timer::{TimerHandle, TimerReason};
use chrono::{DateTime, Duration, Utc};
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::StepContext;
use crate::error::WorkflowError;
use crate::replay::FAILED_ACTION;
use crate::runtime::Shared;
use crate::workflow::{InstanceView, Workflow, encode_event, parse_signal};

/// Call index reserved for mirroring history entries to the gateway.
const MIRROR_CALL: u32 = u32::MAX;

/// Journal activity under which a step records how many calls its
/// abandoned attempts used.
const ABANDONED_CALLS: &str = "abandonedCalls";

fn abandoned_calls_key(instance_id: &str, sequence: u64) -> String {
  format!("{}abandoned", IdempotencyKey::step_prefix(instance_id, sequence))
}

/// Actor used for timer-driven steps.
pub(crate) const SYSTEM_ACTOR: &str = "system";

/// Last committed state of an instance.
pub(crate) struct Snapshot {
  pub record: WorkflowRecord,
  pub view: Arc<dyn InstanceView>,
}

/// State shared between an instance's actor and the runtime.
pub(crate) struct InstanceCell {
  snapshot: watch::Sender<Arc<Snapshot>>,
  /// Held while a step's result is being persisted. `terminate` takes it too,
  /// so a step either commits before termination or not at all.
  pub commit: Mutex<()>,
  pub cancel: CancellationToken,
}

impl InstanceCell {
  fn new(snapshot: Snapshot, cancel: CancellationToken) -> Self {
    let (snapshot, _) = watch::channel(Arc::new(snapshot));
    Self {
      snapshot,
      commit: Mutex::new(()),
      cancel,
    }
  }

  pub fn snapshot(&self) -> Arc<Snapshot> {
    self.snapshot.borrow().clone()
  }

  pub fn publish(&self, snapshot: Snapshot) {
    self.snapshot.send_replace(Arc::new(snapshot));
  }
}

pub(crate) enum Command {
  Signal {
    name: String,
    payload: Value,
    reply: oneshot::Sender<Result<(), WorkflowError>>,
  },
  Wake {
    handle: TimerHandle,
    reason: TimerReason,
    done: oneshot::Sender<()>,
  },
}

/// Runtime-side handle of one instance.
#[derive(Clone)]
pub(crate) struct InstanceHandle {
  pub kind: WorkflowKind,
  pub entity_id: String,
  pub cell: Arc<InstanceCell>,
  /// `None` for dormant (terminal) instances.
  pub commands: Option<mpsc::Sender<Command>>,
}

/// An instance that is ready to be registered and started.
pub(crate) trait Launch: Send {
  fn launch(self: Box<Self>) -> InstanceHandle;
}

/// A terminal instance kept only for queries.
pub(crate) struct Dormant {
  kind: WorkflowKind,
  snapshot: Snapshot,
}

impl Dormant {
  pub fn new<W: Workflow>(state: W, record: WorkflowRecord) -> Self {
    Self {
      kind: W::KIND,
      snapshot: Snapshot {
        record,
        view: Arc::new(state),
      },
    }
  }
}

impl Launch for Dormant {
  fn launch(self: Box<Self>) -> InstanceHandle {
    let entity_id = self.snapshot.record.entity_id.clone();
    InstanceHandle {
      kind: self.kind,
      entity_id,
      cell: Arc::new(InstanceCell::new(self.snapshot, CancellationToken::new())),
      commands: None,
    }
  }
}

enum Input<S> {
  Signal(S),
  Timer(TimerReason),
}

pub(crate) struct Actor<W: Workflow> {
  state: W,
  record: WorkflowRecord,
  shared: Arc<Shared>,
  first_tick: Option<DateTime<Utc>>,
}

impl<W: Workflow> Actor<W> {
  /// `first_tick` overrides when the first monitor tick fires.
  pub fn new(
    state: W,
    record: WorkflowRecord,
    shared: Arc<Shared>,
    first_tick: Option<DateTime<Utc>>,
  ) -> Self {
    Self {
      state,
      record,
      shared,
      first_tick,
    }
  }
}

impl<W: Workflow> Launch for Actor<W> {
  fn launch(self: Box<Self>) -> InstanceHandle {
    let cancel = self.shared.shutdown.child_token();
    let cell = Arc::new(InstanceCell::new(
      Snapshot {
        record: self.record.clone(),
        view: Arc::new(self.state.clone()),
      },
      cancel,
    ));
    let (sender, commands) = mpsc::channel(self.shared.config.runtime.signal_buffer.max(1));
    let handle = InstanceHandle {
      kind: W::KIND,
      entity_id: self.record.entity_id.clone(),
      cell: cell.clone(),
      commands: Some(sender),
    };

    let mut running = Running {
      state: self.state,
      record: self.record,
      shared: self.shared,
      cell,
      commands,
      armed: HashMap::new(),
      spent: HashSet::new(),
      next_tick: self.first_tick,
      next_call: 0,
      next_call_loaded: false,
    };
    // Arm before spawning so a caller that advances a clock right after
    // start or recovery sees the timers.
    running.arm_timers();
    tokio::spawn(running.run());
    handle
  }
}

struct Running<W: Workflow> {
  state: W,
  record: WorkflowRecord,
  shared: Arc<Shared>,
  cell: Arc<InstanceCell>,
  commands: mpsc::Receiver<Command>,
  armed: HashMap<TimerReason, (TimerHandle, DateTime<Utc>)>,
  /// Conditional waits that already fired at this due time.
  spent: HashSet<(TimerReason, DateTime<Utc>)>,
  next_tick: Option<DateTime<Utc>>,
  /// Activity calls made since the last commit.
  next_call: u32,
  /// Whether `next_call` has been restored from the journal.
  next_call_loaded: bool,
}

impl<W: Workflow> Running<W> {
  async fn run(mut self) {
    info!(
      workflow_id = %self.record.id,
      workflow_type = %W::KIND,
      status = %self.record.status,
      "instance_running"
    );

    loop {
      tokio::select! {
        _ = self.cell.cancel.cancelled() => {
          debug!(workflow_id = %self.record.id, "instance_cancelled");
          break;
        }
        command = self.commands.recv() => {
          match command {
            Some(command) => self.handle(command).await,
            None => break,
          }
        }
      }

      if !self.record.status.is_live() {
        break;
      }
    }

    self.disarm();
    self.drain();
    info!(workflow_id = %self.record.id, status = %self.record.status, "instance_stopped");
  }

  async fn handle(&mut self, command: Command) {
    match command {
      Command::Signal {
        name,
        payload,
        reply,
      } => {
        let outcome = self.handle_signal(&name, payload).await;
        match &outcome {
          Ok(()) => info!(workflow_id = %self.record.id, signal = %name, "signal_applied"),
          Err(e) => warn!(workflow_id = %self.record.id, signal = %name, error = %e, "signal_rejected"),
        }
        self.arm_timers();
        let _ = reply.send(outcome);
      }
      Command::Wake {
        handle,
        reason,
        done,
      } => {
        self.handle_wake(handle, reason).await;
        self.arm_timers();
        let _ = done.send(());
      }
    }
  }

  async fn handle_signal(&mut self, name: &str, payload: Value) -> Result<(), WorkflowError> {
    let signal = parse_signal::<W>(name, &payload)?;
    self.state.check(&signal)?;
    let performed_by = payload
      .get("performedBy")
      .and_then(Value::as_str)
      .unwrap_or("api")
      .to_string();
    self.step(Input::Signal(signal), performed_by).await
  }

  async fn handle_wake(&mut self, handle: TimerHandle, reason: TimerReason) {
    let due = match self.armed.get(&reason) {
      Some((armed, due)) if *armed == handle => *due,
      _ => {
        debug!(workflow_id = %self.record.id, reason = %reason, "stale_timer");
        return;
      }
    };
    self.armed.remove(&reason);

    let now = self.shared.timers.now();
    match &reason {
      TimerReason::Tick => self.next_tick = Some(now + self.tick_interval()),
      TimerReason::Wait(_) => {
        self.spent.insert((reason.clone(), due));
      }
    }

    debug!(workflow_id = %self.record.id, reason = %reason, "timer_fired");
    if let Err(e) = self.step(Input::Timer(reason.clone()), SYSTEM_ACTOR.to_string()).await {
      if !matches!(e, WorkflowError::Terminated { .. }) {
        warn!(workflow_id = %self.record.id, reason = %reason, error = %e, "timer_step_failed");
      }
    }
  }

  /// Run one handler and commit the events it produced.
  async fn step(&mut self, input: Input<W::Signal>, performed_by: String) -> Result<(), WorkflowError> {
    let now = self.shared.timers.now();
    let sequence = self.record.next_sequence();
    let cancel = self.cell.cancel.clone();
    if !self.next_call_loaded {
      self.next_call_loaded = true;
      self.next_call = self.next_call.max(self.abandoned_calls(sequence).await);
    }

    let (result, (performed_by, next_call)) = {
      let mut ctx = StepContext::new(
        &self.record.id,
        &self.record.entity_type,
        &self.record.entity_id,
        sequence,
        self.next_call,
        now,
        performed_by,
        &self.shared,
      );
      let state = &self.state;
      let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(WorkflowError::Terminated {
          workflow_id: self.record.id.clone(),
        }),
        result = async {
          match input {
            Input::Signal(signal) => state.on_signal(&mut ctx, signal).await,
            Input::Timer(reason) => state.on_timer(&mut ctx, &reason).await,
          }
        } => result,
      };
      (result, ctx.finish())
    };
    self.next_call = next_call;

    match result {
      Ok(events) if events.is_empty() => {
        self.discard_step(sequence).await;
        Ok(())
      }
      Ok(events) => self.commit(events, now, &performed_by).await,
      Err(e @ WorkflowError::ActivityFailure(_)) => {
        self.fail(&e, now).await;
        Err(e)
      }
      Err(e @ WorkflowError::Terminated { .. }) => Err(e),
      Err(e) => {
        self.discard_step(sequence).await;
        Err(e)
      }
    }
  }

  /// Forget the activity results of a step that committed nothing and
  /// record how many call indexes it used. Later attempts at the same
  /// sequence, in this process or after a restart, continue past them.
  async fn discard_step(&mut self, sequence: u64) {
    if self.next_call == 0 {
      return;
    }
    let store = &self.shared.store;
    let id = &self.record.id;
    let removed = match store.journal_discard(&IdempotencyKey::step_prefix(id, sequence)).await {
      Ok(removed) => removed,
      Err(e) => {
        warn!(workflow_id = %id, sequence, error = %e, "step_journal_discard_failed");
        return;
      }
    };
    let marker = abandoned_calls_key(id, sequence);
    if let Err(e) = store
      .journal_put(&marker, ABANDONED_CALLS, &Value::from(self.next_call))
      .await
    {
      warn!(workflow_id = %id, sequence, error = %e, "abandoned_calls_write_failed");
      return;
    }
    debug!(
      workflow_id = %id,
      sequence,
      removed,
      next_call = self.next_call,
      "step_journal_discarded"
    );
  }

  /// Call indexes used by abandoned attempts at `sequence` in an earlier process.
  async fn abandoned_calls(&self, sequence: u64) -> u32 {
    let marker = abandoned_calls_key(&self.record.id, sequence);
    match self.shared.store.journal_get(&marker).await {
      Ok(Some(entry)) if entry.activity == ABANDONED_CALLS => entry
        .result
        .as_u64()
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(0),
      Ok(_) => 0,
      Err(e) => {
        warn!(workflow_id = %self.record.id, sequence, error = %e, "abandoned_calls_read_failed");
        0
      }
    }
  }

  async fn commit(
    &mut self,
    events: Vec<W::Event>,
    now: DateTime<Utc>,
    performed_by: &str,
  ) -> Result<(), WorkflowError> {
    if events.is_empty() {
      return Ok(());
    }

    let guard = self.cell.commit.lock().await;
    if self.cell.cancel.is_cancelled() {
      return Err(WorkflowError::Terminated {
        workflow_id: self.record.id.clone(),
      });
    }

    let mut state = self.state.clone();
    let mut record = self.record.clone();
    let first = record.history.len();
    for event in &events {
      let (action, details) = encode_event(event)?;
      state.apply(event);
      record.history.push(HistoryEntry {
        sequence: record.next_sequence(),
        timestamp: now,
        action,
        performed_by: performed_by.to_string(),
        details,
      });
    }
    record.status = state.status();
    record.state_data = serde_json::to_value(&state)?;
    record.updated_at = now;

    self.shared.store.save(&record).await?;
    let entries = record.history[first..].to_vec();
    self.state = state;
    self.record = record;
    self.next_call = 0;
    self.publish();
    drop(guard);

    debug!(
      workflow_id = %self.record.id,
      entries = entries.len(),
      status = %self.record.status,
      "step_committed"
    );
    mirror_history(&self.shared, &self.record, &entries).await;
    Ok(())
  }

  /// Record an exhausted activity and move the instance to `failed`.
  async fn fail(&mut self, cause: &WorkflowError, now: DateTime<Utc>) {
    let guard = self.cell.commit.lock().await;
    if self.cell.cancel.is_cancelled() {
      return;
    }

    let mut record = self.record.clone();
    let entry = HistoryEntry {
      sequence: record.next_sequence(),
      timestamp: now,
      action: FAILED_ACTION.to_string(),
      performed_by: SYSTEM_ACTOR.to_string(),
      details: json!({ "error": cause.to_string() }),
    };
    record.history.push(entry.clone());
    record.status = InstanceStatus::Failed;
    record.updated_at = now;

    if let Err(e) = self.shared.store.save(&record).await {
      error!(workflow_id = %self.record.id, error = %e, "failure_not_persisted");
      return;
    }
    self.record = record;
    self.publish();
    drop(guard);

    error!(workflow_id = %self.record.id, error = %cause, "workflow_failed");
    mirror_history(&self.shared, &self.record, &[entry]).await;
  }

  fn publish(&self) {
    self.cell.publish(Snapshot {
      record: self.record.clone(),
      view: Arc::new(self.state.clone()),
    });
  }

  fn tick_interval(&self) -> Duration {
    Duration::seconds(self.shared.config.runtime.tick_interval_secs as i64)
  }

  /// Reconcile armed timers with the ones the current state asks for.
  fn arm_timers(&mut self) {
    if self.cell.cancel.is_cancelled() || !self.record.status.is_live() {
      self.disarm();
      return;
    }

    let requested = self.state.timers(&self.shared.config);
    self
      .spent
      .retain(|(reason, at)| requested.iter().any(|r| r.reason == *reason && r.at == *at));

    let mut desired: HashMap<TimerReason, DateTime<Utc>> = requested
      .into_iter()
      .filter(|r| !self.spent.contains(&(r.reason.clone(), r.at)))
      .map(|r| (r.reason, r.at))
      .collect();

    if self.state.ticks() {
      let first = self.shared.timers.now() + self.tick_interval();
      let at = *self.next_tick.get_or_insert(first);
      desired.insert(TimerReason::Tick, at);
    } else {
      self.next_tick = None;
    }

    let timers = &self.shared.timers;
    self.armed.retain(|reason, (handle, at)| {
      if desired.get(reason) == Some(at) {
        true
      } else {
        timers.cancel(*handle);
        false
      }
    });
    for (reason, at) in desired {
      if !self.armed.contains_key(&reason) {
        let handle = timers.insert(self.record.id.clone(), reason.clone(), at);
        debug!(workflow_id = %self.record.id, reason = %reason, due = %at, "timer_armed");
        self.armed.insert(reason, (handle, at));
      }
    }
  }

  fn disarm(&mut self) {
    for (_, (handle, _)) in self.armed.drain() {
      self.shared.timers.cancel(handle);
    }
  }

  /// Answer commands still queued after the actor stopped.
  fn drain(&mut self) {
    self.commands.close();
    while let Ok(command) = self.commands.try_recv() {
      match command {
        Command::Signal { name, reply, .. } => {
          let _ = reply.send(Err(self.closed_error(&name)));
        }
        Command::Wake { done, .. } => {
          let _ = done.send(());
        }
      }
    }
  }

  fn closed_error(&self, signal: &str) -> WorkflowError {
    if self.shared.shutdown.is_cancelled() {
      WorkflowError::Shutdown
    } else if self.cell.cancel.is_cancelled() {
      WorkflowError::Terminated {
        workflow_id: self.record.id.clone(),
      }
    } else {
      WorkflowError::invalid_transition(signal, self.record.status.as_str())
    }
  }
}

/// Mirror committed entries through `recordHistoryEntry`. Best-effort.
pub(crate) async fn mirror_history(shared: &Shared, record: &WorkflowRecord, entries: &[HistoryEntry]) {
  for entry in entries {
    let key = IdempotencyKey::new(&record.id, entry.sequence, MIRROR_CALL);
    let history = HistoryRecord {
      workflow_id: record.id.clone(),
      step: entry.sequence,
      status: record.status.to_string(),
      data: json!({
        "action": entry.action,
        "performedBy": entry.performed_by,
        "timestamp": entry.timestamp,
        "details": entry.details,
      }),
    };
    let gateway = shared.gateway.as_ref();
    let result = with_retry(&shared.config.retry, names::RECORD_HISTORY_ENTRY, || {
      gateway.record_history_entry(&key, &history)
    })
    .await;
    if let Err(e) = result {
      warn!(workflow_id = %record.id, sequence = entry.sequence, error = %e, "history_mirror_failed");
    }
  }
}
