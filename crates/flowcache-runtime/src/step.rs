//! Workflow step adapter.
//!
//! The surrounding orchestrator invokes a step, possibly many times, for a
//! workflow task instance. The adapter runs the cached computation and
//! translates what it observed into a three-state outcome. A blocked step is
//! never polled: it stays suspended until the resume handler delivers the
//! terminal outcome from the completion message.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use flowcache_store::CacheStatus;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::cache::{Lookup, TaskCacheManager};
use crate::error::{CacheError, OrchestratorError};
use crate::task::AsyncTask;

/// Re-reads allowed when an attempt completes while a step is blocking on it.
const MAX_BLOCK_ATTEMPTS: usize = 3;

/// Prefix of the per-instance scratch key holding the step status.
pub const STATUS_KEY_PREFIX: &str = "__status_";

/// Scratch key for an instance's step status.
pub fn status_key(instance_id: &str) -> String {
  format!("{STATUS_KEY_PREFIX}{instance_id}")
}

/// Per-execution scratch key-value storage supplied by the orchestrator.
///
/// Async to support networked backends.
pub trait ShareData: Send + Sync {
  fn get(&self, key: &str) -> Pin<Box<dyn Future<Output = Option<String>> + Send + '_>>;

  fn set(&self, key: &str, value: String) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

  fn delete(&self, key: &str) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// In-memory scratch storage.
#[derive(Debug, Default, Clone)]
pub struct InMemoryShareData {
  data: Arc<DashMap<String, String>>,
}

impl InMemoryShareData {
  pub fn new() -> Self {
    Self::default()
  }
}

impl ShareData for InMemoryShareData {
  fn get(&self, key: &str) -> Pin<Box<dyn Future<Output = Option<String>> + Send + '_>> {
    let value = self.data.get(key).map(|v| v.value().clone());
    Box::pin(async move { value })
  }

  fn set(&self, key: &str, value: String) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
    self.data.insert(key.to_string(), value);
    Box::pin(async {})
  }

  fn delete(&self, key: &str) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
    self.data.remove(key);
    Box::pin(async {})
  }
}

/// Status flag written to scratch storage after each invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
  Blocked,
  Success,
  Failed,
}

impl StepStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      StepStatus::Blocked => "blocked",
      StepStatus::Success => "success",
      StepStatus::Failed => "failed",
    }
  }

  pub fn parse(value: &str) -> Option<Self> {
    match value {
      "blocked" => Some(StepStatus::Blocked),
      "success" => Some(StepStatus::Success),
      "failed" => Some(StepStatus::Failed),
      _ => None,
    }
  }
}

/// Result of one step invocation, or the outcome delivered on resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum StepOutcome {
  /// Suspended until the computation completes.
  Blocked,
  Succeeded(serde_json::Value),
  Failed(String),
}

impl StepOutcome {
  pub fn status(&self) -> StepStatus {
    match self {
      StepOutcome::Blocked => StepStatus::Blocked,
      StepOutcome::Succeeded(_) => StepStatus::Success,
      StepOutcome::Failed(_) => StepStatus::Failed,
    }
  }
}

/// A workflow task instance as seen by the adapter.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TaskInstance {
  pub id: String,
  /// Fingerprint of the computation this instance currently depends on.
  pub hash: Option<String>,
}

impl TaskInstance {
  pub fn new(id: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      hash: None,
    }
  }
}

/// The orchestrator's side of the blocked/resume contract.
#[async_trait]
pub trait Orchestrator: Send + Sync {
  /// Persist the fingerprint an instance depends on.
  async fn persist_hash(&self, instance_id: &str, hash: &str) -> Result<(), OrchestratorError>;

  /// Record that an instance is suspended on one attempt of `hash`.
  ///
  /// An instance waits on at most one attempt; a later call replaces the
  /// earlier one.
  async fn mark_blocked(
    &self,
    instance_id: &str,
    hash: &str,
    attempt: &str,
  ) -> Result<(), OrchestratorError>;

  /// Instances currently blocked on `attempt` of `hash`.
  async fn blocked_instances(
    &self,
    hash: &str,
    attempt: &str,
  ) -> Result<Vec<String>, OrchestratorError>;

  /// Resume a blocked instance with its terminal outcome.
  async fn resume(&self, instance_id: &str, outcome: &StepOutcome) -> Result<(), OrchestratorError>;
}

/// Synchronous entry point invoked by the orchestrator for a cached step.
#[derive(Clone)]
pub struct StepAdapter {
  manager: Arc<TaskCacheManager>,
  orchestrator: Arc<dyn Orchestrator>,
}

impl StepAdapter {
  pub fn new(manager: Arc<TaskCacheManager>, orchestrator: Arc<dyn Orchestrator>) -> Self {
    Self {
      manager,
      orchestrator,
    }
  }

  pub fn manager(&self) -> &Arc<TaskCacheManager> {
    &self.manager
  }

  /// Run a step for `instance` and record its status flag in `share`.
  ///
  /// The instance's fingerprint is persisted before the cache is consulted.
  /// A blocked step is then registered against the attempt it waits on, and
  /// the row is re-read so a completion published before the registration is
  /// not lost.
  #[instrument(name = "step_run", skip_all, fields(instance_id = %instance.id))]
  pub async fn run(
    &self,
    instance: &mut TaskInstance,
    share: &dyn ShareData,
    task: Arc<dyn AsyncTask>,
  ) -> StepOutcome {
    let outcome = match self.invoke(instance, task).await {
      Ok(Lookup::Pending { hash, attempt }) => {
        debug!(
          instance_id = %instance.id,
          hash = %hash,
          attempt = %attempt,
          "step blocked on pending task"
        );
        StepOutcome::Blocked
      }
      Ok(Lookup::Ready { result, .. }) => StepOutcome::Succeeded(result),
      Err(e) => {
        warn!(instance_id = %instance.id, error = %e, "step failed");
        StepOutcome::Failed(e.to_string())
      }
    };

    share
      .set(&status_key(&instance.id), outcome.status().as_str().to_string())
      .await;
    outcome
  }

  async fn invoke(
    &self,
    instance: &mut TaskInstance,
    task: Arc<dyn AsyncTask>,
  ) -> Result<Lookup, CacheError> {
    let hash = self.manager.fingerprint(task.as_ref());
    if instance.hash.as_deref() != Some(hash.as_str()) {
      self.orchestrator.persist_hash(&instance.id, &hash).await?;
      info!(instance_id = %instance.id, hash = %hash, "step fingerprint recorded");
      instance.hash = Some(hash);
    }

    let mut lookup = self.manager.run(&instance.id, Arc::clone(&task)).await?;
    for remaining in (0..MAX_BLOCK_ATTEMPTS).rev() {
      let (hash, attempt) = match lookup {
        Lookup::Pending { hash, attempt } => (hash, attempt),
        ready => return Ok(ready),
      };
      self
        .orchestrator
        .mark_blocked(&instance.id, &hash, &attempt)
        .await?;
      if remaining == 0 || self.still_pending(&hash, &attempt).await? {
        return Ok(Lookup::Pending { hash, attempt });
      }
      // The attempt finished before the block was recorded, so its
      // completion message may already be gone. Look again.
      debug!(
        instance_id = %instance.id,
        hash = %hash,
        attempt = %attempt,
        "attempt finished while blocking"
      );
      lookup = self.manager.run(&instance.id, Arc::clone(&task)).await?;
    }
    Ok(lookup)
  }

  /// Whether the row for `hash` is still the pending row of `attempt`.
  async fn still_pending(&self, hash: &str, attempt: &str) -> Result<bool, CacheError> {
    let entry = self.manager.store().get_by_hash(hash).await?;
    Ok(entry.is_some_and(|entry| entry.id == attempt && entry.status == CacheStatus::Pending))
  }

  /// Post-invocation hook: the status flag left by the last [`run`](Self::run).
  ///
  /// `None` if the step has not run for this instance in this execution.
  pub async fn after_run(&self, instance_id: &str, share: &dyn ShareData) -> Option<StepStatus> {
    let value = share.get(&status_key(instance_id)).await?;
    StepStatus::parse(&value)
  }
}
