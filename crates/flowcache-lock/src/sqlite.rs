use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::{Error, LockBackend};

/// SQLite-based lock backend.
///
/// Uses the `task_locks` table created by the shared migrations. Acquisition is
/// a single upsert that only overwrites an expired row, so concurrent callers
/// across processes sharing the database file see exactly one winner.
#[derive(Debug, Clone)]
pub struct SqliteLockBackend {
  pool: SqlitePool,
}

impl SqliteLockBackend {
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }
}

fn now_ms() -> i64 {
  chrono::Utc::now().timestamp_millis()
}

#[async_trait]
impl LockBackend for SqliteLockBackend {
  async fn try_acquire(&self, resource: &str, owner: &str, ttl: Duration) -> Result<bool, Error> {
    let now = now_ms();
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    let expires_at = now.saturating_add(ttl_ms);

    let result = sqlx::query(
      r#"
            INSERT INTO task_locks (resource, owner, expires_at_ms)
            VALUES (?, ?, ?)
            ON CONFLICT(resource) DO UPDATE
            SET owner = excluded.owner, expires_at_ms = excluded.expires_at_ms
            WHERE task_locks.expires_at_ms <= ?
            "#,
    )
    .bind(resource)
    .bind(owner)
    .bind(expires_at)
    .bind(now)
    .execute(&self.pool)
    .await?;

    Ok(result.rows_affected() == 1)
  }

  async fn release(&self, resource: &str, owner: &str) -> Result<bool, Error> {
    let result = sqlx::query(
      r#"
            DELETE FROM task_locks
            WHERE resource = ? AND owner = ? AND expires_at_ms > ?
            "#,
    )
    .bind(resource)
    .bind(owner)
    .bind(now_ms())
    .execute(&self.pool)
    .await?;

    Ok(result.rows_affected() == 1)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use flowcache_store::SqliteStore;

  async fn backend() -> SqliteLockBackend {
    let store = SqliteStore::connect("sqlite::memory:").await.unwrap();
    store.migrate().await.unwrap();
    SqliteLockBackend::new(store.pool().clone())
  }

  #[tokio::test]
  async fn test_single_winner() {
    let backend = backend().await;
    let ttl = Duration::from_secs(30);

    assert!(backend.try_acquire("r", "a", ttl).await.unwrap());
    assert!(!backend.try_acquire("r", "b", ttl).await.unwrap());
    assert!(!backend.release("r", "b").await.unwrap());
    assert!(backend.release("r", "a").await.unwrap());
    assert!(backend.try_acquire("r", "b", ttl).await.unwrap());
  }

  #[tokio::test]
  async fn test_expired_row_is_taken_over() {
    let backend = backend().await;

    assert!(
      backend
        .try_acquire("r", "a", Duration::from_millis(5))
        .await
        .unwrap()
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(
      backend
        .try_acquire("r", "b", Duration::from_secs(30))
        .await
        .unwrap()
    );
    assert!(!backend.release("r", "a").await.unwrap());
  }
}
