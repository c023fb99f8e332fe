//! Shared harness: manual clock, recording gateway and a fast retry policy.

#![allow(dead_code)]

use std::sync::Arc;

use accu_activity::RecordingGateway;
use accu_config::{EngineConfig, RetryBackoff, RetryPolicy};
use accu_runtime::{Runtime, WorkflowError, WorkflowKind};
use accu_store::{MemoryStore, Store};
use accu_timer::ManualClock;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::Value;

pub fn start_time() -> DateTime<Utc> {
  Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

pub fn fast_config() -> EngineConfig {
  let mut config = EngineConfig::default();
  config.retry = RetryPolicy {
    max_attempts: 2,
    initial_backoff_ms: 1,
    max_backoff_ms: 2,
    backoff: RetryBackoff::Constant,
  };
  config
}

pub struct Harness {
  pub runtime: Runtime,
  pub clock: Arc<ManualClock>,
  pub gateway: Arc<RecordingGateway>,
}

impl Harness {
  pub fn new() -> Self {
    Self::with(fast_config(), Arc::new(MemoryStore::new()), start_time())
  }

  pub fn with_config(config: EngineConfig) -> Self {
    Self::with(config, Arc::new(MemoryStore::new()), start_time())
  }

  pub fn with(config: EngineConfig, store: Arc<dyn Store>, now: DateTime<Utc>) -> Self {
    let clock = Arc::new(ManualClock::new(now));
    let gateway = Arc::new(RecordingGateway::new());
    let runtime = accu_workflows::register_all(Runtime::builder(config))
      .store(store)
      .gateway(gateway.clone())
      .clock(clock.clone())
      .build();
    Self {
      runtime,
      clock,
      gateway,
    }
  }

  pub async fn start(&self, kind: WorkflowKind, entity_type: &str, entity_id: &str, input: Value) -> String {
    self
      .runtime
      .start(kind, entity_type, entity_id, input, "tester")
      .await
      .unwrap()
  }

  /// Deliver a signal and wait for its step to finish.
  pub async fn send(&self, id: &str, name: &str, payload: Value) -> Result<(), WorkflowError> {
    self.runtime.signal(id, name, payload).await?.outcome().await
  }

  pub fn query(&self, id: &str, name: &str, args: Value) -> Value {
    self.runtime.query(id, name, &args).unwrap()
  }

  /// Move the clock forward and fire whatever became due.
  pub async fn advance(&self, by: Duration) -> usize {
    self.clock.advance(by);
    self.runtime.fire_due_timers().await
  }
}
