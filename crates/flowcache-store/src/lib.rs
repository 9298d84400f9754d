//! Flowcache Store
//!
//! This crate provides the storage trait and implementations for task cache
//! rows. There is exactly one row per computation fingerprint; it tracks the
//! lifecycle state and points at the blob holding the serialized result.
//!
//! The [`Store`] trait defines operations for:
//! - Fast unguarded lookups by fingerprint
//! - Creating the pending row (only while holding the creation lock)
//! - Applying the terminal update or deleting the row after execution

mod memory;
mod sqlite;
mod types;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use types::{CacheStatus, TaskCacheEntry, TaskCacheUpdate};

use async_trait::async_trait;

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// The requested record was not found.
  #[error("not found: {0}")]
  NotFound(String),

  /// A row already exists for this fingerprint.
  #[error("task cache entry already exists: {0}")]
  Conflict(String),

  /// A database error occurred.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),
}

/// Storage trait for task cache rows.
#[async_trait]
pub trait Store: Send + Sync {
  /// Look up the row for a fingerprint.
  async fn get_by_hash(&self, hash: &str) -> Result<Option<TaskCacheEntry>, Error>;

  /// Insert a new row. Fails with [`Error::Conflict`] if the fingerprint exists.
  async fn insert(&self, entry: &TaskCacheEntry) -> Result<(), Error>;

  /// Apply a partial update to the row for a fingerprint.
  async fn update(&self, hash: &str, update: &TaskCacheUpdate) -> Result<(), Error>;

  /// Delete the row for a fingerprint. Deleting a missing row is not an error.
  async fn delete_by_hash(&self, hash: &str) -> Result<(), Error>;
}

/// Current unix time in seconds.
pub fn unix_now() -> i64 {
  chrono::Utc::now().timestamp()
}
