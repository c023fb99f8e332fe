//! Accu Store
//!
//! This crate provides the durable layout and storage trait for workflow
//! instances. Each instance is one [`WorkflowRecord`]: identity, status,
//! the JSON state snapshot and the append-only history log it was built from.
//!
//! The [`Store`] trait defines operations for:
//! - Creating, saving and loading workflow records
//! - Listing records for recovery and inspection
//! - Journaling completed activity results by idempotency key
//!
//! Two implementations are provided: [`MemoryStore`] for tests and ephemeral
//! runs, and [`SqliteStore`] for durable deployments.

mod memory;
mod sqlite;
mod types;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use types::{HistoryEntry, InstanceStatus, JournalEntry, WorkflowKind, WorkflowRecord};

use async_trait::async_trait;

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  /// The requested record was not found.
  #[error("not found: {0}")]
  NotFound(String),

  /// A record with the same id already exists.
  #[error("record already exists: {0}")]
  Conflict(String),

  /// A save would drop or rewrite committed history entries.
  #[error("history of '{id}' is append-only: stored {stored} entries, got {given}")]
  HistoryRewrite { id: String, stored: usize, given: usize },

  /// A stored value could not be (de)serialized.
  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  /// A database error occurred.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),
}

/// Storage trait for workflow records and the activity journal.
#[async_trait]
pub trait Store: Send + Sync {
  /// Create a new record. Fails with [`StoreError::Conflict`] if the id exists.
  async fn insert(&self, record: &WorkflowRecord) -> Result<(), StoreError>;

  /// Persist a new version of an existing record.
  ///
  /// The stored history must be a prefix of `record.history`.
  async fn save(&self, record: &WorkflowRecord) -> Result<(), StoreError>;

  /// Get a record by id.
  async fn get(&self, id: &str) -> Result<WorkflowRecord, StoreError>;

  /// List all records, oldest first.
  async fn list(&self) -> Result<Vec<WorkflowRecord>, StoreError>;

  /// Delete a record and its journaled activity results.
  async fn delete(&self, id: &str) -> Result<(), StoreError>;

  /// Look up a journaled activity result.
  async fn journal_get(&self, key: &str) -> Result<Option<JournalEntry>, StoreError>;

  /// Journal a completed activity result.
  ///
  /// Re-journaling a key for the same activity is a no-op; a different
  /// activity replaces the entry.
  async fn journal_put(
    &self,
    key: &str,
    activity: &str,
    result: &serde_json::Value,
  ) -> Result<(), StoreError>;

  /// Remove every journaled result whose key starts with `prefix`.
  /// Returns the number of entries removed.
  async fn journal_discard(&self, prefix: &str) -> Result<u64, StoreError>;
}

/// Journal keys are prefixed with the owning instance id.
pub(crate) fn journal_prefix(id: &str) -> String {
  format!("{}:", id)
}
