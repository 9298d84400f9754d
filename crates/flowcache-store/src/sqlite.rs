use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::{Error, Store, TaskCacheEntry, TaskCacheUpdate};

/// SQLite-based store implementation.
#[derive(Debug, Clone)]
pub struct SqliteStore {
  pool: SqlitePool,
}

impl SqliteStore {
  /// Create a new SQLite store with the given connection pool.
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Connect to `database_url`, creating the database file if needed.
  ///
  /// In-memory databases are private to a connection, so they get a single
  /// connection that is never recycled.
  pub async fn connect(database_url: &str) -> Result<Self, Error> {
    use std::str::FromStr;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    let pool = if database_url.contains(":memory:") {
      SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?
    } else {
      SqlitePool::connect_with(options).await?
    };
    Ok(Self::new(pool))
  }

  /// Run database migrations.
  pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(&self.pool).await
  }

  /// The underlying pool, shared with the SQLite lock backend.
  pub fn pool(&self) -> &SqlitePool {
    &self.pool
  }
}

#[async_trait]
impl Store for SqliteStore {
  async fn get_by_hash(&self, hash: &str) -> Result<Option<TaskCacheEntry>, Error> {
    let entry = sqlx::query_as(
      r#"
            SELECT id, hash, task_type, status, store_id, object_key, extension,
                   size_bytes, error_message, created_at, modified_at, expires_at
            FROM task_cache
            WHERE hash = ?
            "#,
    )
    .bind(hash)
    .fetch_optional(&self.pool)
    .await?;

    Ok(entry)
  }

  async fn insert(&self, entry: &TaskCacheEntry) -> Result<(), Error> {
    let result = sqlx::query(
      r#"
            INSERT INTO task_cache (id, hash, task_type, status, store_id, object_key, extension,
                                    size_bytes, error_message, created_at, modified_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
    )
    .bind(&entry.id)
    .bind(&entry.hash)
    .bind(&entry.task_type)
    .bind(entry.status)
    .bind(&entry.store_id)
    .bind(&entry.object_key)
    .bind(&entry.extension)
    .bind(entry.size_bytes)
    .bind(&entry.error_message)
    .bind(entry.created_at)
    .bind(entry.modified_at)
    .bind(entry.expires_at)
    .execute(&self.pool)
    .await;

    match result {
      Ok(_) => Ok(()),
      Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
        Err(Error::Conflict(entry.hash.clone()))
      }
      Err(e) => Err(e.into()),
    }
  }

  async fn update(&self, hash: &str, update: &TaskCacheUpdate) -> Result<(), Error> {
    let result = sqlx::query(
      r#"
            UPDATE task_cache
            SET status = COALESCE(?, status),
                size_bytes = COALESCE(?, size_bytes),
                error_message = COALESCE(?, error_message),
                expires_at = COALESCE(?, expires_at),
                modified_at = ?
            WHERE hash = ?
            "#,
    )
    .bind(update.status)
    .bind(update.size_bytes)
    .bind(&update.error_message)
    .bind(update.expires_at)
    .bind(update.modified_at)
    .bind(hash)
    .execute(&self.pool)
    .await?;

    if result.rows_affected() == 0 {
      return Err(Error::NotFound(hash.to_string()));
    }
    Ok(())
  }

  async fn delete_by_hash(&self, hash: &str) -> Result<(), Error> {
    sqlx::query("DELETE FROM task_cache WHERE hash = ?")
      .bind(hash)
      .execute(&self.pool)
      .await?;

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::CacheStatus;
  use flowcache_artifact::BlobLocation;

  async fn memory_store() -> SqliteStore {
    let store = SqliteStore::connect("sqlite::memory:").await.unwrap();
    store.migrate().await.unwrap();
    store
  }

  fn entry(hash: &str) -> TaskCacheEntry {
    TaskCacheEntry::pending(
      "id-1",
      hash,
      "file_parse",
      BlobLocation::new("local", "task-cache/id-1.json"),
      ".json",
      1_000,
      60,
    )
  }

  #[tokio::test]
  async fn test_insert_get_update_delete() {
    let store = memory_store().await;

    assert!(store.get_by_hash("h1").await.unwrap().is_none());

    store.insert(&entry("h1")).await.unwrap();
    let row = store.get_by_hash("h1").await.unwrap().unwrap();
    assert_eq!(row.status, CacheStatus::Pending);
    assert_eq!(row.expires_at, 1_060);
    assert_eq!(row.location(), BlobLocation::new("local", "task-cache/id-1.json"));

    store
      .update("h1", &TaskCacheUpdate::success(42, 1_010))
      .await
      .unwrap();
    let row = store.get_by_hash("h1").await.unwrap().unwrap();
    assert_eq!(row.status, CacheStatus::Success);
    assert_eq!(row.size_bytes, 42);
    assert_eq!(row.modified_at, 1_010);
    assert_eq!(row.expires_at, 1_060);

    store.delete_by_hash("h1").await.unwrap();
    assert!(store.get_by_hash("h1").await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_duplicate_insert_conflicts() {
    let store = memory_store().await;
    store.insert(&entry("dup")).await.unwrap();

    let mut second = entry("dup");
    second.id = "id-2".to_string();
    let result = store.insert(&second).await;
    assert!(matches!(result, Err(Error::Conflict(h)) if h == "dup"));
  }

  #[tokio::test]
  async fn test_update_missing_row() {
    let store = memory_store().await;
    let result = store
      .update("nope", &TaskCacheUpdate::success(1, 1))
      .await;
    assert!(matches!(result, Err(Error::NotFound(_))));
  }
}
