use flowcache_artifact::BlobLocation;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle state of a cached computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum CacheStatus {
  Pending,
  Success,
  Failed,
}

impl CacheStatus {
  pub fn is_terminal(self) -> bool {
    !matches!(self, CacheStatus::Pending)
  }
}

/// One row per fingerprint, the source of truth for a computation's state.
///
/// Timestamps are unix seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct TaskCacheEntry {
  pub id: String,
  pub hash: String,
  pub task_type: String,
  pub status: CacheStatus,
  pub store_id: String,
  pub object_key: String,
  pub extension: String,
  pub size_bytes: i64,
  pub error_message: String,
  pub created_at: i64,
  pub modified_at: i64,
  pub expires_at: i64,
}

impl TaskCacheEntry {
  /// Build a fresh pending row.
  pub fn pending(
    id: impl Into<String>,
    hash: impl Into<String>,
    task_type: impl Into<String>,
    location: BlobLocation,
    extension: impl Into<String>,
    now: i64,
    expire_secs: i64,
  ) -> Self {
    Self {
      id: id.into(),
      hash: hash.into(),
      task_type: task_type.into(),
      status: CacheStatus::Pending,
      store_id: location.store_id,
      object_key: location.object_key,
      extension: extension.into(),
      size_bytes: 0,
      error_message: String::new(),
      created_at: now,
      modified_at: now,
      expires_at: now.saturating_add(expire_secs),
    }
  }

  /// Where the serialized result lives.
  pub fn location(&self) -> BlobLocation {
    BlobLocation::new(&self.store_id, &self.object_key)
  }

  pub fn is_expired(&self, now: i64) -> bool {
    self.expires_at <= now
  }
}

/// Partial update applied to an existing row. `None` fields are left as is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskCacheUpdate {
  pub status: Option<CacheStatus>,
  pub size_bytes: Option<i64>,
  pub error_message: Option<String>,
  pub expires_at: Option<i64>,
  pub modified_at: i64,
}

impl TaskCacheUpdate {
  /// Mark the row succeeded with the stored result size.
  pub fn success(size_bytes: i64, now: i64) -> Self {
    Self {
      status: Some(CacheStatus::Success),
      size_bytes: Some(size_bytes),
      modified_at: now,
      ..Self::default()
    }
  }

  /// Mark the row failed, keeping it readable until `expires_at`.
  pub fn failed(message: impl Into<String>, now: i64, expires_at: i64) -> Self {
    Self {
      status: Some(CacheStatus::Failed),
      error_message: Some(message.into()),
      expires_at: Some(expires_at),
      modified_at: now,
      ..Self::default()
    }
  }

  pub(crate) fn apply(&self, entry: &mut TaskCacheEntry) {
    if let Some(status) = self.status {
      entry.status = status;
    }
    if let Some(size) = self.size_bytes {
      entry.size_bytes = size;
    }
    if let Some(message) = &self.error_message {
      entry.error_message = message.clone();
    }
    if let Some(expires_at) = self.expires_at {
      entry.expires_at = expires_at;
    }
    entry.modified_at = self.modified_at;
  }
}
