//! Single-flight task cache.

use std::sync::Arc;

use flowcache_artifact::BlobLocation;
use flowcache_bus::{CompletionMessage, Publisher};
use flowcache_config::CacheConfig;
use flowcache_lock::{DistributedLock, LockBackend};
use flowcache_store::{CacheStatus, TaskCacheEntry, unix_now};
use tracing::{debug, error, info, instrument, warn};

use crate::error::CacheError;
use crate::execution::Execution;
use crate::hash::derive_hash;
use crate::pool::WorkerPool;
use crate::task::AsyncTask;

/// The backends a [`TaskCacheManager`] coordinates.
#[derive(Clone)]
pub struct CacheComponents {
  pub store: Arc<dyn flowcache_store::Store>,
  pub blobs: Arc<dyn flowcache_artifact::Store>,
  pub lock_backend: Arc<dyn LockBackend>,
  pub publisher: Arc<dyn Publisher>,
}

/// State shared between the synchronous path and detached executions.
pub(crate) struct Shared {
  pub(crate) store: Arc<dyn flowcache_store::Store>,
  pub(crate) blobs: Arc<dyn flowcache_artifact::Store>,
  pub(crate) publisher: Arc<dyn Publisher>,
  pub(crate) config: CacheConfig,
}

impl Shared {
  /// Record a failed computation according to the failure policy.
  pub(crate) async fn record_failure(
    &self,
    hash: &str,
    message: &str,
  ) -> Result<(), flowcache_store::Error> {
    let now = unix_now();
    match self.config.failure.tombstone_ttl() {
      None => self.store.delete_by_hash(hash).await,
      Some(ttl) => {
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let expires_at = now.saturating_add(ttl_secs);
        let update = flowcache_store::TaskCacheUpdate::failed(message, now, expires_at);
        self.store.update(hash, &update).await
      }
    }
  }

  /// Publish a completion message, logging instead of failing.
  pub(crate) async fn publish(&self, message: &CompletionMessage) {
    let topic = &self.config.notification.topic;
    if let Err(e) = self.publisher.publish(topic, message).await {
      error!(
        hash = %message.hash,
        topic = %topic,
        error = %e,
        "failed to publish task completion"
      );
    }
  }
}

/// What a caller observes for a fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
  /// The computation is in flight; the caller should suspend.
  ///
  /// `attempt` is the id of the row being computed. Completion messages for
  /// that run carry the same id.
  Pending { hash: String, attempt: String },
  /// The cached result.
  Ready {
    hash: String,
    result: serde_json::Value,
  },
}

impl Lookup {
  pub fn hash(&self) -> &str {
    match self {
      Lookup::Pending { hash, .. } | Lookup::Ready { hash, .. } => hash,
    }
  }

  pub fn is_ready(&self) -> bool {
    matches!(self, Lookup::Ready { .. })
  }
}

/// Coordinates cache lookups, single-flight creation and detached execution.
///
/// Every call for a fingerprint either reads the existing row or races for the
/// creation lock; exactly one caller inserts the pending row and hands the
/// computation to the worker pool. The lock is released right after the
/// insert, so it never spans the computation itself.
///
/// # Example
///
/// ```ignore
/// let manager = TaskCacheManager::new(components, config);
/// match manager.run(&instance_id, task).await? {
///   Lookup::Ready { result, .. } => use_result(result),
///   Lookup::Pending { hash, attempt } => suspend_until_notified(hash, attempt),
/// }
/// ```
pub struct TaskCacheManager {
  shared: Arc<Shared>,
  lock: DistributedLock,
  pool: WorkerPool,
}

impl TaskCacheManager {
  /// Create a manager and spawn its worker pool.
  ///
  /// Must be called from within a tokio runtime.
  pub fn new(components: CacheComponents, config: CacheConfig) -> Self {
    let lock = DistributedLock::new(components.lock_backend, config.lock.prefix.clone())
      .with_retry_interval(config.lock.retry_interval());
    let pool = WorkerPool::new(config.executor.workers, config.executor.queue_capacity);

    Self {
      shared: Arc::new(Shared {
        store: components.store,
        blobs: components.blobs,
        publisher: components.publisher,
        config,
      }),
      lock,
      pool,
    }
  }

  pub fn config(&self) -> &CacheConfig {
    &self.shared.config
  }

  pub fn store(&self) -> &Arc<dyn flowcache_store::Store> {
    &self.shared.store
  }

  /// Fingerprint of a task's defining inputs.
  pub fn fingerprint(&self, task: &dyn AsyncTask) -> String {
    derive_hash(&task.hash_content())
  }

  /// Look up or start the computation for `task` on behalf of `owner`.
  ///
  /// Returns [`Lookup::Pending`] immediately while the computation runs; the
  /// only bounded wait is for the creation lock.
  #[instrument(
    name = "task_cache_run",
    skip(self, task),
    fields(task_type = %task.task_type())
  )]
  pub async fn run(&self, owner: &str, task: Arc<dyn AsyncTask>) -> Result<Lookup, CacheError> {
    let hash = self.fingerprint(task.as_ref());

    if let Some(entry) = self.live_entry(&hash).await? {
      debug!(hash = %hash, status = ?entry.status, "task_cache_hit");
      return self.dispatch(entry).await;
    }

    let mut handle = self.lock.handle(&hash, owner);
    if let Err(e) = handle
      .try_lock(self.shared.config.lock.ttl(), self.shared.config.lock.wait_timeout())
      .await
    {
      return match e {
        flowcache_lock::Error::Unavailable { waited, .. } => {
          match self.live_entry(&hash).await? {
            Some(entry) => {
              info!(hash = %hash, waited_ms = waited.as_millis() as u64, "task_cache_lock_lost");
              self.dispatch(entry).await
            }
            None => {
              warn!(hash = %hash, waited_ms = waited.as_millis() as u64, "lock acquisition timeout");
              Err(CacheError::LockTimeout { hash })
            }
          }
        }
        other => Err(other.into()),
      };
    }

    let created = self.create_locked(&hash, task.as_ref()).await;

    if let Err(e) = handle.release().await {
      warn!(hash = %hash, error = %e, "failed to release task cache lock");
    }

    match created? {
      Created::Existing(entry) => self.dispatch(entry).await,
      Created::Inserted(entry) => {
        let attempt = entry.id.clone();
        self.submit(task, entry).await?;
        Ok(Lookup::Pending { hash, attempt })
      }
    }
  }

  /// Shut down the worker pool after queued computations finish.
  pub async fn shutdown(&self) {
    self.pool.shutdown().await;
  }

  /// Read the row for `hash`, treating an expired Failed tombstone as absent.
  async fn live_entry(&self, hash: &str) -> Result<Option<TaskCacheEntry>, CacheError> {
    let entry = self.shared.store.get_by_hash(hash).await?;
    Ok(entry.filter(|entry| !is_expired_tombstone(entry, unix_now())))
  }

  /// Double-checked creation. Runs only while holding the lock.
  async fn create_locked(&self, hash: &str, task: &dyn AsyncTask) -> Result<Created, CacheError> {
    let now = unix_now();
    if let Some(entry) = self.shared.store.get_by_hash(hash).await? {
      if !is_expired_tombstone(&entry, now) {
        return Ok(Created::Existing(entry));
      }
      debug!(hash = %hash, "removing expired failure tombstone");
      self.shared.store.delete_by_hash(hash).await?;
    }

    let config = &self.shared.config;
    let id = uuid::Uuid::new_v4().to_string();
    let extension = task.result_extension().to_string();
    let location = BlobLocation::new(
      &config.blob.store_id,
      format!("{}/{}/{}{}", config.blob.key_prefix, hash, id, extension),
    );
    let expire_secs = match task.expire_seconds() {
      secs if secs > 0 => secs,
      _ => config.default_expire_secs,
    };

    let entry = TaskCacheEntry::pending(
      id,
      hash,
      task.task_type(),
      location,
      extension,
      now,
      expire_secs,
    );

    match self.shared.store.insert(&entry).await {
      Ok(()) => {
        info!(
          hash = %hash,
          task_type = %entry.task_type,
          location = %entry.location(),
          "task_cache_created"
        );
        Ok(Created::Inserted(entry))
      }
      // Another process inserted without holding our lock (e.g. after our TTL lapsed).
      Err(flowcache_store::Error::Conflict(_)) => match self.shared.store.get_by_hash(hash).await? {
        Some(existing) => Ok(Created::Existing(existing)),
        None => Err(CacheError::LockTimeout {
          hash: hash.to_string(),
        }),
      },
      Err(e) => Err(e.into()),
    }
  }

  async fn submit(&self, task: Arc<dyn AsyncTask>, entry: TaskCacheEntry) -> Result<(), CacheError> {
    let hash = entry.hash.clone();
    let attempt = entry.id.clone();
    let task_type = entry.task_type.clone();
    let execution = Execution::new(Arc::clone(&self.shared), task, entry);

    if let Err(e) = self.pool.submit(execution.run()).await {
      error!(hash = %hash, error = %e, "failed to schedule task");
      let message = e.to_string();
      if let Err(store_err) = self.shared.record_failure(&hash, &message).await {
        error!(hash = %hash, error = %store_err, "failed to record task failure");
      }
      self
        .shared
        .publish(&CompletionMessage::failed(
          &hash,
          attempt,
          task_type,
          message,
          unix_now(),
        ))
        .await;
      return Err(e);
    }
    Ok(())
  }

  /// Translate a row into what the caller observes.
  async fn dispatch(&self, entry: TaskCacheEntry) -> Result<Lookup, CacheError> {
    match entry.status {
      CacheStatus::Pending => Ok(Lookup::Pending {
        hash: entry.hash,
        attempt: entry.id,
      }),
      CacheStatus::Failed => Err(CacheError::TaskFailed {
        hash: entry.hash,
        message: entry.error_message,
      }),
      CacheStatus::Success => {
        let data = flowcache_artifact::download(self.shared.blobs.as_ref(), &entry.location()).await?;
        let result = serde_json::from_slice(&data).map_err(|e| CacheError::Serialization {
          hash: entry.hash.clone(),
          message: e.to_string(),
        })?;
        Ok(Lookup::Ready {
          hash: entry.hash,
          result,
        })
      }
    }
  }
}

enum Created {
  Existing(TaskCacheEntry),
  Inserted(TaskCacheEntry),
}

fn is_expired_tombstone(entry: &TaskCacheEntry, now: i64) -> bool {
  entry.status == CacheStatus::Failed && entry.is_expired(now)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::TaskError;
  use crate::task::TaskContext;
  use async_trait::async_trait;
  use flowcache_bus::NoopPublisher;
  use flowcache_lock::MemoryLockBackend;
  use flowcache_store::Store as _;
  use serde_json::json;

  struct Echo {
    content: String,
    expire: i64,
  }

  #[async_trait]
  impl AsyncTask for Echo {
    fn task_type(&self) -> &str {
      "echo"
    }

    fn hash_content(&self) -> String {
      self.content.clone()
    }

    fn expire_seconds(&self) -> i64 {
      self.expire
    }

    async fn execute(&self, _ctx: &TaskContext) -> Result<serde_json::Value, TaskError> {
      Ok(json!({ "echo": self.content }))
    }
  }

  fn manager(store: Arc<flowcache_store::MemoryStore>) -> TaskCacheManager {
    TaskCacheManager::new(
      CacheComponents {
        store,
        blobs: Arc::new(flowcache_artifact::MemoryStore::new()),
        lock_backend: Arc::new(MemoryLockBackend::new()),
        publisher: Arc::new(NoopPublisher),
      },
      CacheConfig::default(),
    )
  }

  #[tokio::test]
  async fn test_first_call_inserts_pending_row() {
    let store = Arc::new(flowcache_store::MemoryStore::new());
    let manager = manager(Arc::clone(&store));
    let task = Arc::new(Echo {
      content: "a".to_string(),
      expire: 0,
    });

    let lookup = manager.run("inst-1", task).await.unwrap();
    let hash = derive_hash("a");
    assert_eq!(lookup.hash(), hash);

    manager.shutdown().await;
    let entry = store.get_by_hash(&hash).await.unwrap().unwrap();
    assert_eq!(entry.task_type, "echo");
    assert_eq!(entry.store_id, "local");
    assert!(entry.object_key.starts_with(&format!("task-cache/{hash}/")));
    assert!(entry.object_key.ends_with(".json"));
    assert_eq!(entry.expires_at - entry.created_at, 86_400);
  }

  #[tokio::test]
  async fn test_task_expiry_overrides_default() {
    let store = Arc::new(flowcache_store::MemoryStore::new());
    let manager = manager(Arc::clone(&store));
    let task = Arc::new(Echo {
      content: "b".to_string(),
      expire: 30,
    });

    manager.run("inst-1", task).await.unwrap();
    manager.shutdown().await;

    let entry = store.get_by_hash(&derive_hash("b")).await.unwrap().unwrap();
    assert_eq!(entry.expires_at - entry.created_at, 30);
  }

  #[tokio::test]
  async fn test_failed_row_surfaces_stored_message() {
    let store = Arc::new(flowcache_store::MemoryStore::new());
    let manager = manager(Arc::clone(&store));
    let hash = derive_hash("c");
    let now = unix_now();
    let mut entry = TaskCacheEntry::pending(
      "id-1",
      &hash,
      "echo",
      BlobLocation::new("local", "k"),
      ".json",
      now,
      60,
    );
    entry.status = CacheStatus::Failed;
    entry.error_message = "ocr backend unavailable".to_string();
    store.insert(&entry).await.unwrap();

    let task = Arc::new(Echo {
      content: "c".to_string(),
      expire: 0,
    });
    let err = manager.run("inst-1", task).await.unwrap_err();
    assert_eq!(err.to_string(), "ocr backend unavailable");
  }

  #[test]
  fn test_expired_tombstone_detection() {
    let mut entry = TaskCacheEntry::pending(
      "id",
      "h",
      "t",
      BlobLocation::new("s", "k"),
      ".json",
      100,
      10,
    );
    assert!(!is_expired_tombstone(&entry, 200));
    entry.status = CacheStatus::Failed;
    assert!(!is_expired_tombstone(&entry, 105));
    assert!(is_expired_tombstone(&entry, 110));
  }
}
