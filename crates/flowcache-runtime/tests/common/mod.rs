//! Shared fixtures for runtime integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use flowcache_bus::{BroadcastBus, CompletionMessage, Envelope};
use flowcache_config::CacheConfig;
use flowcache_lock::MemoryLockBackend;
use flowcache_runtime::{
  AsyncTask, CacheComponents, Orchestrator, OrchestratorError, StepOutcome, TaskCacheManager,
  TaskContext, TaskError,
};
use tokio::sync::broadcast;

/// What a [`TestTask`] does when executed.
#[derive(Debug, Clone)]
pub enum Behavior {
  Succeed(serde_json::Value),
  Fail(String),
  Panic(String),
}

/// A task that counts its executions.
#[derive(Clone)]
pub struct TestTask {
  pub content: String,
  pub delay: Duration,
  pub behavior: Behavior,
  pub executions: Arc<AtomicUsize>,
}

impl TestTask {
  pub fn new(content: &str, behavior: Behavior) -> Self {
    Self {
      content: content.to_string(),
      delay: Duration::ZERO,
      behavior,
      executions: Arc::new(AtomicUsize::new(0)),
    }
  }

  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = delay;
    self
  }

  pub fn executions(&self) -> usize {
    self.executions.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl AsyncTask for TestTask {
  fn task_type(&self) -> &str {
    "test"
  }

  fn hash_content(&self) -> String {
    self.content.clone()
  }

  async fn execute(&self, _ctx: &TaskContext) -> Result<serde_json::Value, TaskError> {
    self.executions.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(self.delay).await;
    match &self.behavior {
      Behavior::Succeed(value) => Ok(value.clone()),
      Behavior::Fail(message) => Err(TaskError::execution(message.clone())),
      Behavior::Panic(message) => panic!("{}", message),
    }
  }
}

/// A manager over in-memory backends, with handles to each backend.
pub struct Harness {
  pub manager: Arc<TaskCacheManager>,
  pub store: Arc<flowcache_store::MemoryStore>,
  pub blobs: Arc<flowcache_artifact::MemoryStore>,
  pub locks: Arc<MemoryLockBackend>,
  pub bus: BroadcastBus,
}

pub fn test_config() -> CacheConfig {
  let mut config = CacheConfig::default();
  config.lock.retry_interval_ms = 5;
  config.lock.wait_timeout_ms = 1_000;
  config.resume.lookup_backoff_ms = 10;
  config
}

pub fn harness(config: CacheConfig) -> Harness {
  let store = Arc::new(flowcache_store::MemoryStore::new());
  let blobs = Arc::new(flowcache_artifact::MemoryStore::new());
  let locks = Arc::new(MemoryLockBackend::new());
  let bus = BroadcastBus::default();

  let manager = TaskCacheManager::new(
    CacheComponents {
      store: store.clone(),
      blobs: blobs.clone(),
      lock_backend: locks.clone(),
      publisher: Arc::new(bus.clone()),
    },
    config,
  );

  Harness {
    manager: Arc::new(manager),
    store,
    blobs,
    locks,
    bus,
  }
}

/// Wait for the next completion message for `hash`.
pub async fn next_message(
  receiver: &mut broadcast::Receiver<Envelope>,
  hash: &str,
) -> CompletionMessage {
  tokio::time::timeout(Duration::from_secs(5), async {
    loop {
      let envelope = receiver.recv().await.expect("bus closed");
      if envelope.message.hash == hash {
        return envelope.message;
      }
    }
  })
  .await
  .expect("timed out waiting for completion message")
}

/// Orchestrator double that records persisted hashes, blocks and resumes.
#[derive(Default)]
pub struct RecordingOrchestrator {
  hashes: Mutex<HashMap<String, String>>,
  /// instance id -> (hash, attempt) it is suspended on.
  blocked: Mutex<HashMap<String, (String, String)>>,
  resumed: Mutex<Vec<(String, StepOutcome)>>,
  reject: Mutex<HashSet<String>>,
  block_delay: Duration,
}

impl RecordingOrchestrator {
  pub fn new() -> Self {
    Self::default()
  }

  /// Delay recording each block, to widen the gap after the cache returns Pending.
  pub fn with_block_delay(mut self, delay: Duration) -> Self {
    self.block_delay = delay;
    self
  }

  /// Make `resume` fail for an instance.
  pub fn reject_resume(&self, instance_id: &str) {
    self.reject.lock().unwrap().insert(instance_id.to_string());
  }

  pub fn hash_of(&self, instance_id: &str) -> Option<String> {
    self.hashes.lock().unwrap().get(instance_id).cloned()
  }

  /// The attempt an instance is currently suspended on.
  pub fn attempt_of(&self, instance_id: &str) -> Option<String> {
    self
      .blocked
      .lock()
      .unwrap()
      .get(instance_id)
      .map(|(_, attempt)| attempt.clone())
  }

  pub fn resumed(&self) -> Vec<(String, StepOutcome)> {
    self.resumed.lock().unwrap().clone()
  }
}

#[async_trait]
impl Orchestrator for RecordingOrchestrator {
  async fn persist_hash(&self, instance_id: &str, hash: &str) -> Result<(), OrchestratorError> {
    self
      .hashes
      .lock()
      .unwrap()
      .insert(instance_id.to_string(), hash.to_string());
    Ok(())
  }

  async fn mark_blocked(
    &self,
    instance_id: &str,
    hash: &str,
    attempt: &str,
  ) -> Result<(), OrchestratorError> {
    if !self.block_delay.is_zero() {
      tokio::time::sleep(self.block_delay).await;
    }
    self.blocked.lock().unwrap().insert(
      instance_id.to_string(),
      (hash.to_string(), attempt.to_string()),
    );
    Ok(())
  }

  async fn blocked_instances(
    &self,
    hash: &str,
    attempt: &str,
  ) -> Result<Vec<String>, OrchestratorError> {
    let mut instances: Vec<String> = self
      .blocked
      .lock()
      .unwrap()
      .iter()
      .filter(|(_, (h, a))| h.as_str() == hash && a.as_str() == attempt)
      .map(|(id, _)| id.clone())
      .collect();
    instances.sort();
    Ok(instances)
  }

  async fn resume(&self, instance_id: &str, outcome: &StepOutcome) -> Result<(), OrchestratorError> {
    if self.reject.lock().unwrap().contains(instance_id) {
      return Err(OrchestratorError::new(format!(
        "instance {instance_id} is not suspended"
      )));
    }
    self.blocked.lock().unwrap().remove(instance_id);
    self
      .resumed
      .lock()
      .unwrap()
      .push((instance_id.to_string(), outcome.clone()));
    Ok(())
  }
}
