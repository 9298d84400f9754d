use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;

use crate::{Error, LockBackend};

#[derive(Debug)]
struct LockEntry {
  owner: String,
  expires_at: Instant,
}

/// Map size above which expired entries are swept on acquire.
const DEFAULT_PRUNE_THRESHOLD: usize = 1024;

/// In-memory lock backend.
///
/// Atomicity comes from the per-shard map entry lock. Only coordinates callers
/// within one process; suitable for tests and single-node deployments.
/// Entries left behind by crashed holders are dropped once the map grows past
/// the prune threshold.
#[derive(Debug)]
pub struct MemoryLockBackend {
  entries: DashMap<String, LockEntry>,
  prune_threshold: usize,
}

impl Default for MemoryLockBackend {
  fn default() -> Self {
    Self {
      entries: DashMap::new(),
      prune_threshold: DEFAULT_PRUNE_THRESHOLD,
    }
  }
}

impl MemoryLockBackend {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_prune_threshold(mut self, threshold: usize) -> Self {
    self.prune_threshold = threshold;
    self
  }

  /// Number of entries held, expired ones included.
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Current owner of `resource`, if the entry is live.
  pub fn owner(&self, resource: &str) -> Option<String> {
    self
      .entries
      .get(resource)
      .filter(|entry| entry.expires_at > Instant::now())
      .map(|entry| entry.owner.clone())
  }
}

#[async_trait]
impl LockBackend for MemoryLockBackend {
  async fn try_acquire(&self, resource: &str, owner: &str, ttl: Duration) -> Result<bool, Error> {
    let now = Instant::now();
    let fresh = LockEntry {
      owner: owner.to_string(),
      expires_at: now + ttl,
    };

    // Must run before `entry()`: retain locks every shard.
    if self.entries.len() > self.prune_threshold {
      self.entries.retain(|_, entry| entry.expires_at > now);
    }

    match self.entries.entry(resource.to_string()) {
      Entry::Vacant(slot) => {
        slot.insert(fresh);
        Ok(true)
      }
      Entry::Occupied(mut slot) if slot.get().expires_at <= now => {
        slot.insert(fresh);
        Ok(true)
      }
      Entry::Occupied(_) => Ok(false),
    }
  }

  async fn release(&self, resource: &str, owner: &str) -> Result<bool, Error> {
    let now = Instant::now();
    Ok(
      self
        .entries
        .remove_if(resource, |_, entry| {
          entry.owner == owner && entry.expires_at > now
        })
        .is_some(),
    )
  }
}
