//! Wall-clock sources.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Notify;

/// Source of wall-clock time.
#[async_trait]
pub trait Clock: Send + Sync {
  /// Current time.
  fn now(&self) -> DateTime<Utc>;

  /// Resolve once `now() >= at`.
  async fn sleep_until(&self, at: DateTime<Utc>);
}

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }

  async fn sleep_until(&self, at: DateTime<Utc>) {
    let remaining = at - Utc::now();
    if let Ok(remaining) = remaining.to_std() {
      tokio::time::sleep(remaining).await;
    }
  }
}

/// A clock that only moves when told to. Used to drive timers in tests.
pub struct ManualClock {
  now: Mutex<DateTime<Utc>>,
  moved: Notify,
}

impl ManualClock {
  pub fn new(start: DateTime<Utc>) -> Self {
    Self {
      now: Mutex::new(start),
      moved: Notify::new(),
    }
  }

  /// Move the clock forward.
  pub fn advance(&self, by: Duration) {
    {
      let mut now = self.now.lock().unwrap();
      *now += by;
    }
    self.moved.notify_waiters();
  }

  /// Jump to an absolute time. Moving backwards is ignored.
  pub fn set(&self, at: DateTime<Utc>) {
    {
      let mut now = self.now.lock().unwrap();
      if at > *now {
        *now = at;
      }
    }
    self.moved.notify_waiters();
  }
}

#[async_trait]
impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.now.lock().unwrap()
  }

  async fn sleep_until(&self, at: DateTime<Utc>) {
    loop {
      let moved = self.moved.notified();
      if self.now() >= at {
        return;
      }
      moved.await;
    }
  }
}
