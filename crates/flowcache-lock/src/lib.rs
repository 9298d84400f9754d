//! Flowcache Lock
//!
//! A cross-process "first writer wins" gate keyed by computation fingerprint.
//! The gate is backed by an atomic create-if-absent-with-TTL primitive in a
//! shared store ([`LockBackend`]). A holder that crashes before releasing is
//! recovered by TTL expiry.
//!
//! ```ignore
//! let lock = DistributedLock::new(backend, "flowcache:lock:");
//! let mut handle = lock.handle(&hash, &instance_id);
//! handle.try_lock(Duration::from_secs(10), Duration::from_secs(3)).await?;
//! // ... double-check and insert the pending row ...
//! handle.release().await?;
//! ```

mod memory;
mod sqlite;

pub use memory::MemoryLockBackend;
pub use sqlite::SqliteLockBackend;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Error type for lock operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// The lock could not be acquired within the wait window.
  #[error("lock '{resource}' unavailable after {waited:?}")]
  Unavailable { resource: String, waited: Duration },

  /// A database error occurred in the lock backend.
  #[error("lock backend error: {0}")]
  Database(#[from] sqlx::Error),
}

/// Atomic TTL-bounded mutual exclusion primitive shared across processes.
#[async_trait]
pub trait LockBackend: Send + Sync {
  /// Create the lock entry for `resource` if it is absent or expired.
  ///
  /// Returns `true` if `owner` now holds the lock.
  async fn try_acquire(&self, resource: &str, owner: &str, ttl: Duration) -> Result<bool, Error>;

  /// Remove the lock entry if `owner` still holds it.
  ///
  /// Returns `false` if the entry was gone or owned by someone else.
  async fn release(&self, resource: &str, owner: &str) -> Result<bool, Error>;
}

/// Factory for per-fingerprint [`LockHandle`]s sharing one backend.
#[derive(Clone)]
pub struct DistributedLock {
  backend: Arc<dyn LockBackend>,
  prefix: String,
  retry_interval: Duration,
}

impl DistributedLock {
  /// Create a lock factory. Resources are named `{prefix}{fingerprint}`.
  pub fn new(backend: Arc<dyn LockBackend>, prefix: impl Into<String>) -> Self {
    Self {
      backend,
      prefix: prefix.into(),
      retry_interval: Duration::from_millis(50),
    }
  }

  /// How long to sleep between acquisition attempts while waiting.
  pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
    self.retry_interval = retry_interval.max(Duration::from_millis(1));
    self
  }

  /// Replace the resource prefix.
  pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
    self.prefix = prefix.into();
    self
  }

  pub fn prefix(&self) -> &str {
    &self.prefix
  }

  /// Build a handle for `fingerprint` owned by `owner`.
  pub fn handle(&self, fingerprint: &str, owner: &str) -> LockHandle {
    LockHandle {
      backend: Arc::clone(&self.backend),
      resource: format!("{}{}", self.prefix, fingerprint),
      owner: owner.to_string(),
      retry_interval: self.retry_interval,
      held: false,
    }
  }
}

/// A lock on one fingerprint for one owner.
///
/// Never persisted beyond the backend's TTL. Dropping a held handle without
/// calling [`LockHandle::release`] leaves the entry to expire.
pub struct LockHandle {
  backend: Arc<dyn LockBackend>,
  resource: String,
  owner: String,
  retry_interval: Duration,
  held: bool,
}

impl LockHandle {
  pub fn resource(&self) -> &str {
    &self.resource
  }

  pub fn owner(&self) -> &str {
    &self.owner
  }

  pub fn is_held(&self) -> bool {
    self.held
  }

  /// Acquire the lock with the given TTL, waiting up to `wait_timeout`.
  ///
  /// Fails with [`Error::Unavailable`] once the wait window elapses.
  pub async fn try_lock(&mut self, ttl: Duration, wait_timeout: Duration) -> Result<(), Error> {
    let started = Instant::now();
    let deadline = started + wait_timeout;

    loop {
      if self
        .backend
        .try_acquire(&self.resource, &self.owner, ttl)
        .await?
      {
        debug!(resource = %self.resource, owner = %self.owner, "lock acquired");
        self.held = true;
        return Ok(());
      }

      let now = Instant::now();
      if now >= deadline {
        return Err(Error::Unavailable {
          resource: self.resource.clone(),
          waited: now - started,
        });
      }

      tokio::time::sleep(self.retry_interval.min(deadline - now)).await;
    }
  }

  /// Release the lock if held.
  pub async fn release(&mut self) -> Result<(), Error> {
    if !self.held {
      return Ok(());
    }
    self.held = false;

    if !self.backend.release(&self.resource, &self.owner).await? {
      warn!(
        resource = %self.resource,
        owner = %self.owner,
        "lock expired before release"
      );
    }
    Ok(())
  }
}
