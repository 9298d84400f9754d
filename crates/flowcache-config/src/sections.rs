use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Creation lock settings.
///
/// The TTL only needs to cover allocating a result location and inserting the
/// pending row, not the computation itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
  /// Prefix prepended to the fingerprint to form the lock resource.
  pub prefix: String,
  pub ttl_ms: u64,
  /// How long a caller waits for the lock before falling back to a read.
  pub wait_timeout_ms: u64,
  /// Sleep between acquisition attempts.
  pub retry_interval_ms: u64,
}

impl Default for LockConfig {
  fn default() -> Self {
    Self {
      prefix: "flowcache:lock:".to_string(),
      ttl_ms: 10_000,
      wait_timeout_ms: 3_000,
      retry_interval_ms: 50,
    }
  }
}

impl LockConfig {
  pub fn ttl(&self) -> Duration {
    Duration::from_millis(self.ttl_ms)
  }

  pub fn wait_timeout(&self) -> Duration {
    Duration::from_millis(self.wait_timeout_ms)
  }

  pub fn retry_interval(&self) -> Duration {
    Duration::from_millis(self.retry_interval_ms)
  }
}

/// Worker pool settings for detached execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
  pub workers: usize,
  /// Jobs that may wait for a worker before submission applies backpressure.
  pub queue_capacity: usize,
}

impl Default for ExecutorConfig {
  fn default() -> Self {
    Self {
      workers: 4,
      queue_capacity: 64,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
  pub database_url: String,
}

impl Default for StoreConfig {
  fn default() -> Self {
    Self {
      database_url: "sqlite://flowcache.db".to_string(),
    }
  }
}

/// Where results are written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobConfig {
  /// Filesystem root for the local blob store.
  pub root: PathBuf,
  /// Store identifier recorded on every cache row.
  pub store_id: String,
  /// Prefix for allocated object keys.
  pub key_prefix: String,
}

impl Default for BlobConfig {
  fn default() -> Self {
    Self {
      root: PathBuf::from("blobs"),
      store_id: "local".to_string(),
      key_prefix: "task-cache".to_string(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
  pub topic: String,
}

impl Default for NotificationConfig {
  fn default() -> Self {
    Self {
      topic: "flowcache.task.completed".to_string(),
    }
  }
}

/// Settings for resuming blocked instances from completion messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResumeConfig {
  /// Attempts to read the cache row before giving up on a message.
  pub lookup_attempts: u32,
  /// Linear backoff step between attempts.
  pub lookup_backoff_ms: u64,
}

impl Default for ResumeConfig {
  fn default() -> Self {
    Self {
      lookup_attempts: 3,
      lookup_backoff_ms: 1_000,
    }
  }
}

impl ResumeConfig {
  pub fn lookup_backoff(&self) -> Duration {
    Duration::from_millis(self.lookup_backoff_ms)
  }
}
