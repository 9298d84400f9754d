use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::{Error, Store, TaskCacheEntry, TaskCacheUpdate};

/// In-memory store implementation.
///
/// Suitable for tests and single-process deployments. Clones share the same rows.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
  rows: Arc<DashMap<String, TaskCacheEntry>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Number of rows currently stored.
  pub fn len(&self) -> usize {
    self.rows.len()
  }

  pub fn is_empty(&self) -> bool {
    self.rows.is_empty()
  }
}

#[async_trait]
impl Store for MemoryStore {
  async fn get_by_hash(&self, hash: &str) -> Result<Option<TaskCacheEntry>, Error> {
    Ok(self.rows.get(hash).map(|row| row.value().clone()))
  }

  async fn insert(&self, entry: &TaskCacheEntry) -> Result<(), Error> {
    match self.rows.entry(entry.hash.clone()) {
      Entry::Occupied(_) => Err(Error::Conflict(entry.hash.clone())),
      Entry::Vacant(slot) => {
        slot.insert(entry.clone());
        Ok(())
      }
    }
  }

  async fn update(&self, hash: &str, update: &TaskCacheUpdate) -> Result<(), Error> {
    let mut row = self
      .rows
      .get_mut(hash)
      .ok_or_else(|| Error::NotFound(hash.to_string()))?;
    update.apply(row.value_mut());
    Ok(())
  }

  async fn delete_by_hash(&self, hash: &str) -> Result<(), Error> {
    self.rows.remove(hash);
    Ok(())
  }
}
