use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::types::Json;
use sqlx::{FromRow, SqlitePool};

use crate::{
  HistoryEntry, InstanceStatus, JournalEntry, Store, StoreError, WorkflowKind, WorkflowRecord,
  journal_prefix,
};

/// SQLite-based store implementation.
pub struct SqliteStore {
  pool: SqlitePool,
}

/// A workflow record as stored in the database.
#[derive(FromRow)]
struct RecordRow {
  id: String,
  workflow_type: WorkflowKind,
  entity_type: String,
  entity_id: String,
  status: InstanceStatus,
  state_data: Json<serde_json::Value>,
  history: Json<Vec<HistoryEntry>>,
  created_at: DateTime<Utc>,
  updated_at: DateTime<Utc>,
}

impl From<RecordRow> for WorkflowRecord {
  fn from(row: RecordRow) -> Self {
    WorkflowRecord {
      id: row.id,
      workflow_type: row.workflow_type,
      entity_type: row.entity_type,
      entity_id: row.entity_id,
      status: row.status,
      state_data: row.state_data.0,
      history: row.history.0,
      created_at: row.created_at,
      updated_at: row.updated_at,
    }
  }
}

impl SqliteStore {
  /// Create a new SQLite store with the given connection pool.
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Open (creating if needed) the database file and run migrations.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
    let options = SqliteConnectOptions::new()
      .filename(path.as_ref())
      .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
      .max_connections(4)
      .connect_with(options)
      .await?;

    let store = Self::new(pool);
    store
      .migrate()
      .await
      .map_err(|e| StoreError::Database(e.into()))?;
    Ok(store)
  }

  /// Run database migrations.
  pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(&self.pool).await
  }
}

#[async_trait]
impl Store for SqliteStore {
  async fn insert(&self, record: &WorkflowRecord) -> Result<(), StoreError> {
    let result = sqlx::query(
      r#"
            INSERT OR IGNORE INTO workflow_instances
                (id, workflow_type, entity_type, entity_id, status, state_data, history, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
    )
    .bind(&record.id)
    .bind(record.workflow_type)
    .bind(&record.entity_type)
    .bind(&record.entity_id)
    .bind(record.status)
    .bind(Json(&record.state_data))
    .bind(Json(&record.history))
    .bind(record.created_at)
    .bind(record.updated_at)
    .execute(&self.pool)
    .await?;

    if result.rows_affected() == 0 {
      return Err(StoreError::Conflict(record.id.clone()));
    }
    Ok(())
  }

  async fn save(&self, record: &WorkflowRecord) -> Result<(), StoreError> {
    let mut tx = self.pool.begin().await?;

    let stored: Option<(Json<Vec<HistoryEntry>>,)> =
      sqlx::query_as("SELECT history FROM workflow_instances WHERE id = ?")
        .bind(&record.id)
        .fetch_optional(&mut *tx)
        .await?;

    let Some((Json(history),)) = stored else {
      return Err(StoreError::NotFound(record.id.clone()));
    };

    let prefix_kept = history.len() <= record.history.len()
      && history
        .iter()
        .zip(record.history.iter())
        .all(|(a, b)| a == b);
    if !prefix_kept {
      return Err(StoreError::HistoryRewrite {
        id: record.id.clone(),
        stored: history.len(),
        given: record.history.len(),
      });
    }

    sqlx::query(
      r#"
            UPDATE workflow_instances
            SET status = ?, state_data = ?, history = ?, updated_at = ?
            WHERE id = ?
            "#,
    )
    .bind(record.status)
    .bind(Json(&record.state_data))
    .bind(Json(&record.history))
    .bind(record.updated_at)
    .bind(&record.id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
  }

  async fn get(&self, id: &str) -> Result<WorkflowRecord, StoreError> {
    let row: Option<RecordRow> = sqlx::query_as(
      r#"
            SELECT id, workflow_type, entity_type, entity_id, status, state_data, history, created_at, updated_at
            FROM workflow_instances
            WHERE id = ?
            "#,
    )
    .bind(id)
    .fetch_optional(&self.pool)
    .await?;

    row
      .map(WorkflowRecord::from)
      .ok_or_else(|| StoreError::NotFound(id.to_string()))
  }

  async fn list(&self) -> Result<Vec<WorkflowRecord>, StoreError> {
    let rows: Vec<RecordRow> = sqlx::query_as(
      r#"
            SELECT id, workflow_type, entity_type, entity_id, status, state_data, history, created_at, updated_at
            FROM workflow_instances
            ORDER BY created_at ASC, id ASC
            "#,
    )
    .fetch_all(&self.pool)
    .await?;

    Ok(rows.into_iter().map(WorkflowRecord::from).collect())
  }

  async fn delete(&self, id: &str) -> Result<(), StoreError> {
    let mut tx = self.pool.begin().await?;

    let result = sqlx::query("DELETE FROM workflow_instances WHERE id = ?")
      .bind(id)
      .execute(&mut *tx)
      .await?;
    if result.rows_affected() == 0 {
      return Err(StoreError::NotFound(id.to_string()));
    }

    let prefix = journal_prefix(id);
    sqlx::query("DELETE FROM activity_journal WHERE substr(idempotency_key, 1, ?) = ?")
      .bind(prefix.len() as i64)
      .bind(&prefix)
      .execute(&mut *tx)
      .await?;

    tx.commit().await?;
    Ok(())
  }

  async fn journal_get(&self, key: &str) -> Result<Option<JournalEntry>, StoreError> {
    let row: Option<(String, Json<serde_json::Value>)> =
      sqlx::query_as("SELECT activity, result FROM activity_journal WHERE idempotency_key = ?")
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

    Ok(row.map(|(activity, Json(result))| JournalEntry { activity, result }))
  }

  async fn journal_put(
    &self,
    key: &str,
    activity: &str,
    result: &serde_json::Value,
  ) -> Result<(), StoreError> {
    sqlx::query(
      r#"
            INSERT INTO activity_journal (idempotency_key, activity, result, recorded_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(idempotency_key) DO UPDATE SET
                activity = excluded.activity,
                result = excluded.result,
                recorded_at = excluded.recorded_at
            WHERE activity <> excluded.activity
            "#,
    )
    .bind(key)
    .bind(activity)
    .bind(Json(result))
    .bind(Utc::now())
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn journal_discard(&self, prefix: &str) -> Result<u64, StoreError> {
    let result =
      sqlx::query("DELETE FROM activity_journal WHERE substr(idempotency_key, 1, ?) = ?")
        .bind(prefix.len() as i64)
        .bind(prefix)
        .execute(&self.pool)
        .await?;

    Ok(result.rows_affected())
  }
}
