use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What happens to a cache row when its computation fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum FailurePolicy {
  /// Delete the row so the next caller retries from scratch. Waiters that were
  /// blocked learn about the failure from the completion message.
  Delete,
  /// Keep a Failed row carrying the error until the TTL passes. Callers during
  /// that window fail fast instead of re-running the computation.
  Tombstone {
    #[serde(default = "default_tombstone_ttl_secs")]
    tombstone_ttl_secs: u64,
  },
}

fn default_tombstone_ttl_secs() -> u64 {
  60
}

impl Default for FailurePolicy {
  fn default() -> Self {
    FailurePolicy::Delete
  }
}

impl FailurePolicy {
  /// Tombstone lifetime, if tombstones are kept.
  pub fn tombstone_ttl(&self) -> Option<Duration> {
    match self {
      FailurePolicy::Delete => None,
      FailurePolicy::Tombstone { tombstone_ttl_secs } => {
        Some(Duration::from_secs(*tombstone_ttl_secs))
      }
    }
  }
}
