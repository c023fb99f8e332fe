use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::{JournalEntry, Store, StoreError, WorkflowRecord, journal_prefix};

/// In-memory store. State is lost when the process exits.
#[derive(Default)]
pub struct MemoryStore {
  records: RwLock<HashMap<String, WorkflowRecord>>,
  journal: RwLock<HashMap<String, JournalEntry>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Number of journaled activity results.
  pub fn journal_len(&self) -> usize {
    self.journal.read().unwrap().len()
  }
}

#[async_trait]
impl Store for MemoryStore {
  async fn insert(&self, record: &WorkflowRecord) -> Result<(), StoreError> {
    let mut records = self.records.write().unwrap();
    if records.contains_key(&record.id) {
      return Err(StoreError::Conflict(record.id.clone()));
    }
    records.insert(record.id.clone(), record.clone());
    Ok(())
  }

  async fn save(&self, record: &WorkflowRecord) -> Result<(), StoreError> {
    let mut records = self.records.write().unwrap();
    let stored = records
      .get(&record.id)
      .ok_or_else(|| StoreError::NotFound(record.id.clone()))?;

    if !stored.is_extended_by(record) {
      return Err(StoreError::HistoryRewrite {
        id: record.id.clone(),
        stored: stored.history.len(),
        given: record.history.len(),
      });
    }

    records.insert(record.id.clone(), record.clone());
    Ok(())
  }

  async fn get(&self, id: &str) -> Result<WorkflowRecord, StoreError> {
    self
      .records
      .read()
      .unwrap()
      .get(id)
      .cloned()
      .ok_or_else(|| StoreError::NotFound(id.to_string()))
  }

  async fn list(&self) -> Result<Vec<WorkflowRecord>, StoreError> {
    let mut records: Vec<_> = self.records.read().unwrap().values().cloned().collect();
    records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    Ok(records)
  }

  async fn delete(&self, id: &str) -> Result<(), StoreError> {
    self
      .records
      .write()
      .unwrap()
      .remove(id)
      .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

    let prefix = journal_prefix(id);
    self
      .journal
      .write()
      .unwrap()
      .retain(|key, _| !key.starts_with(&prefix));
    Ok(())
  }

  async fn journal_get(&self, key: &str) -> Result<Option<JournalEntry>, StoreError> {
    Ok(self.journal.read().unwrap().get(key).cloned())
  }

  async fn journal_put(
    &self,
    key: &str,
    activity: &str,
    result: &serde_json::Value,
  ) -> Result<(), StoreError> {
    let mut journal = self.journal.write().unwrap();
    if journal.get(key).is_some_and(|entry| entry.activity == activity) {
      return Ok(());
    }
    journal.insert(
      key.to_string(),
      JournalEntry {
        activity: activity.to_string(),
        result: result.clone(),
      },
    );
    Ok(())
  }

  async fn journal_discard(&self, prefix: &str) -> Result<u64, StoreError> {
    let mut journal = self.journal.write().unwrap();
    let before = journal.len();
    journal.retain(|key, _| !key.starts_with(prefix));
    Ok((before - journal.len()) as u64)
  }
}
