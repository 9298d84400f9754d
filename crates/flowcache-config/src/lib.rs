//! Flowcache Config
//!
//! This crate contains the serializable configuration types for flowcache.
//! Every field has a default, so an empty JSON object is a valid config.
//!
//! Configuration can be loaded from:
//! - JSON files (via CLI with `--config=flowcache.json`)
//! - Embedding applications constructing [`CacheConfig`] directly
//!
//! # Example
//!
//! ```json
//! {
//!   "lock": { "ttl_ms": 10000, "wait_timeout_ms": 3000 },
//!   "executor": { "workers": 8, "queue_capacity": 128 },
//!   "failure": { "policy": "tombstone", "tombstone_ttl_secs": 30 }
//! }
//! ```

mod failure;
mod sections;

pub use failure::FailurePolicy;
pub use sections::{
  BlobConfig, ExecutorConfig, LockConfig, NotificationConfig, ResumeConfig, StoreConfig,
};

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("failed to read config file: {0}")]
  Io(#[from] std::io::Error),

  #[error("failed to parse config: {0}")]
  Parse(#[from] serde_json::Error),

  #[error("invalid config: {message}")]
  Invalid { message: String },
}

/// Top-level configuration for the task cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub lock: LockConfig,
  pub executor: ExecutorConfig,
  pub store: StoreConfig,
  pub blob: BlobConfig,
  pub notification: NotificationConfig,
  pub failure: FailurePolicy,
  pub resume: ResumeConfig,
  /// Row lifetime used when a task reports a non-positive expiry.
  pub default_expire_secs: i64,
  /// Default tracing filter when `RUST_LOG` is unset.
  pub log_level: String,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      lock: LockConfig::default(),
      executor: ExecutorConfig::default(),
      store: StoreConfig::default(),
      blob: BlobConfig::default(),
      notification: NotificationConfig::default(),
      failure: FailurePolicy::default(),
      resume: ResumeConfig::default(),
      default_expire_secs: 86_400,
      log_level: "info".to_string(),
    }
  }
}

impl CacheConfig {
  /// Parse and validate a JSON config string.
  pub fn from_json(content: &str) -> Result<Self, ConfigError> {
    let config: CacheConfig = serde_json::from_str(content)?;
    config.validate()?;
    Ok(config)
  }

  /// Read and validate a JSON config file.
  pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    Self::from_json(&content)
  }

  /// Reject settings the runtime cannot honour.
  pub fn validate(&self) -> Result<(), ConfigError> {
    let invalid = |message: &str| -> Result<(), ConfigError> {
      Err(ConfigError::Invalid {
        message: message.to_string(),
      })
    };

    if self.lock.ttl_ms == 0 {
      return invalid("lock.ttl_ms must be positive");
    }
    if self.executor.workers == 0 {
      return invalid("executor.workers must be positive");
    }
    if self.executor.queue_capacity == 0 {
      return invalid("executor.queue_capacity must be positive");
    }
    if self.default_expire_secs <= 0 {
      return invalid("default_expire_secs must be positive");
    }
    if self.blob.store_id.is_empty() {
      return invalid("blob.store_id must not be empty");
    }
    if self.resume.lookup_attempts == 0 {
      return invalid("resume.lookup_attempts must be positive");
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  #[test]
  fn test_empty_object_uses_defaults() {
    let config = CacheConfig::from_json("{}").unwrap();
    assert_eq!(config, CacheConfig::default());
    assert_eq!(config.lock.prefix, "flowcache:lock:");
    assert_eq!(config.lock.ttl(), Duration::from_secs(10));
    assert_eq!(config.failure, FailurePolicy::Delete);
  }

  #[test]
  fn test_partial_override() {
    let config = CacheConfig::from_json(
      r#"{
        "lock": { "wait_timeout_ms": 100 },
        "executor": { "workers": 2 },
        "failure": { "policy": "tombstone", "tombstone_ttl_secs": 5 }
      }"#,
    )
    .unwrap();

    assert_eq!(config.lock.wait_timeout(), Duration::from_millis(100));
    assert_eq!(config.lock.ttl_ms, 10_000);
    assert_eq!(config.executor.workers, 2);
    assert_eq!(config.executor.queue_capacity, 64);
    assert_eq!(
      config.failure,
      FailurePolicy::Tombstone {
        tombstone_ttl_secs: 5
      }
    );
  }

  #[test]
  fn test_rejects_zero_workers() {
    let result = CacheConfig::from_json(r#"{ "executor": { "workers": 0 } }"#);
    assert!(matches!(result, Err(ConfigError::Invalid { .. })));
  }

  #[test]
  fn test_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flowcache.json");
    std::fs::write(&path, r#"{ "log_level": "debug" }"#).unwrap();

    let config = CacheConfig::from_file(&path).unwrap();
    assert_eq!(config.log_level, "debug");
  }
}
