//! Shared heap of armed wake-up times.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::clock::Clock;

/// Opaque reference to one armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimerHandle(u64);

/// Why an instance asked to be woken.
///
/// An instance holds at most one pending timer per reason.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum TimerReason {
  /// Periodic monitor tick.
  Tick,
  /// Timeout of a named conditional wait.
  Wait(String),
}

impl TimerReason {
  pub fn wait(name: impl Into<String>) -> Self {
    TimerReason::Wait(name.into())
  }
}

impl fmt::Display for TimerReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TimerReason::Tick => f.write_str("tick"),
      TimerReason::Wait(name) => write!(f, "wait:{}", name),
    }
  }
}

/// A timer popped from the heap because its due time passed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expired {
  pub handle: TimerHandle,
  pub instance_id: String,
  pub reason: TimerReason,
  pub due: DateTime<Utc>,
}

struct Armed {
  instance_id: String,
  reason: TimerReason,
  due: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
  order: BinaryHeap<Reverse<(DateTime<Utc>, TimerHandle)>>,
  armed: HashMap<TimerHandle, Armed>,
  next_id: u64,
}

impl Inner {
  /// Drop cancelled handles sitting on top of the heap.
  fn prune(&mut self) {
    while let Some(Reverse((_, handle))) = self.order.peek() {
      if self.armed.contains_key(handle) {
        break;
      }
      self.order.pop();
    }
  }
}

/// Min-heap of wake-up times shared by all workflow instances.
///
/// Insert, cancel and pop are safe to call concurrently. Cancelled timers are
/// removed lazily when they reach the top of the heap.
pub struct TimerHeap {
  clock: Arc<dyn Clock>,
  inner: Mutex<Inner>,
  changed: Notify,
}

impl TimerHeap {
  pub fn new(clock: Arc<dyn Clock>) -> Self {
    Self {
      clock,
      inner: Mutex::new(Inner::default()),
      changed: Notify::new(),
    }
  }

  /// Current wall-clock time.
  pub fn now(&self) -> DateTime<Utc> {
    self.clock.now()
  }

  pub fn clock(&self) -> Arc<dyn Clock> {
    self.clock.clone()
  }

  /// Arm a timer for `instance_id`.
  pub fn insert(
    &self,
    instance_id: impl Into<String>,
    reason: TimerReason,
    due: DateTime<Utc>,
  ) -> TimerHandle {
    let handle = {
      let mut inner = self.inner.lock().unwrap();
      let handle = TimerHandle(inner.next_id);
      inner.next_id += 1;
      inner.order.push(Reverse((due, handle)));
      inner.armed.insert(
        handle,
        Armed {
          instance_id: instance_id.into(),
          reason,
          due,
        },
      );
      handle
    };
    self.changed.notify_one();
    handle
  }

  /// Disarm a timer. Returns false if it already fired or was cancelled.
  pub fn cancel(&self, handle: TimerHandle) -> bool {
    let mut inner = self.inner.lock().unwrap();
    let removed = inner.armed.remove(&handle).is_some();
    inner.prune();
    removed
  }

  /// Disarm every timer belonging to an instance.
  pub fn cancel_instance(&self, instance_id: &str) -> usize {
    let mut inner = self.inner.lock().unwrap();
    let before = inner.armed.len();
    inner.armed.retain(|_, armed| armed.instance_id != instance_id);
    let removed = before - inner.armed.len();
    inner.prune();
    removed
  }

  /// Pop every timer due at or before the current clock time, earliest first.
  pub fn pop_due(&self) -> Vec<Expired> {
    let now = self.clock.now();
    let mut inner = self.inner.lock().unwrap();
    let mut expired = Vec::new();

    while let Some(Reverse((due, handle))) = inner.order.peek().copied() {
      if due > now {
        break;
      }
      inner.order.pop();
      if let Some(armed) = inner.armed.remove(&handle) {
        expired.push(Expired {
          handle,
          instance_id: armed.instance_id,
          reason: armed.reason,
          due: armed.due,
        });
      }
    }

    inner.prune();
    expired
  }

  /// Earliest pending due time.
  pub fn next_due(&self) -> Option<DateTime<Utc>> {
    let mut inner = self.inner.lock().unwrap();
    inner.prune();
    inner.order.peek().map(|Reverse((due, _))| *due)
  }

  /// Number of armed timers.
  pub fn len(&self) -> usize {
    self.inner.lock().unwrap().armed.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Armed timers of one instance, earliest first.
  pub fn pending_for(&self, instance_id: &str) -> Vec<(TimerReason, DateTime<Utc>)> {
    let inner = self.inner.lock().unwrap();
    let mut pending: Vec<_> = inner
      .armed
      .values()
      .filter(|armed| armed.instance_id == instance_id)
      .map(|armed| (armed.reason.clone(), armed.due))
      .collect();
    pending.sort_by_key(|(_, due)| *due);
    pending
  }

  /// Resolves after the next insert (or immediately if one happened since the
  /// last call).
  pub async fn changed(&self) {
    self.changed.notified().await;
  }

  /// Sleep until the earliest armed timer is due, or forever if none is armed.
  pub async fn sleep_until_next(&self) {
    match self.next_due() {
      Some(due) => self.clock.sleep_until(due).await,
      None => std::future::pending::<()>().await,
    }
  }
}
