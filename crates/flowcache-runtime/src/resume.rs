//! Resuming blocked instances from completion messages.

use std::sync::Arc;

use flowcache_bus::{CompletionMessage, CompletionStatus, Envelope};
use flowcache_config::ResumeConfig;
use flowcache_store::{CacheStatus, TaskCacheEntry};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::CacheError;
use crate::step::{Orchestrator, StepOutcome};

/// Consumes completion messages and resumes the instances waiting on them.
///
/// # Usage
///
/// ```ignore
/// let handler = ResumeHandler::new(store, orchestrator, topic, config.resume);
/// let cancel = CancellationToken::new();
/// tokio::spawn(handler.start(bus.subscribe(), cancel.clone()));
/// ```
pub struct ResumeHandler {
  store: Arc<dyn flowcache_store::Store>,
  orchestrator: Arc<dyn Orchestrator>,
  topic: String,
  config: ResumeConfig,
}

impl ResumeHandler {
  pub fn new(
    store: Arc<dyn flowcache_store::Store>,
    orchestrator: Arc<dyn Orchestrator>,
    topic: impl Into<String>,
    config: ResumeConfig,
  ) -> Self {
    Self {
      store,
      orchestrator,
      topic: topic.into(),
      config,
    }
  }

  /// Resume every instance blocked on the message's attempt.
  ///
  /// Instances blocked on a later attempt of the same fingerprint are left
  /// alone. Returns how many instances were resumed. A failure to resume one
  /// instance is logged and does not stop the others.
  #[instrument(
    name = "task_resume",
    skip_all,
    fields(hash = %message.hash, attempt = %message.attempt, status = ?message.status)
  )]
  pub async fn handle(&self, message: &CompletionMessage) -> Result<usize, CacheError> {
    let outcome = match message.status {
      CompletionStatus::Success => {
        self.confirm_success(&message.hash, &message.attempt).await?;
        StepOutcome::Succeeded(message.result.clone().unwrap_or(serde_json::Value::Null))
      }
      CompletionStatus::Failed => {
        StepOutcome::Failed(message.error.clone().unwrap_or_default())
      }
    };

    let instances = self
      .orchestrator
      .blocked_instances(&message.hash, &message.attempt)
      .await?;
    if instances.is_empty() {
      debug!(hash = %message.hash, attempt = %message.attempt, "no instances blocked on task");
      return Ok(0);
    }

    let mut resumed = 0;
    for instance_id in &instances {
      match self.orchestrator.resume(instance_id, &outcome).await {
        Ok(()) => {
          info!(
            hash = %message.hash,
            instance_id = %instance_id,
            status = outcome.status().as_str(),
            "task_resumed"
          );
          resumed += 1;
        }
        Err(e) => {
          warn!(
            hash = %message.hash,
            instance_id = %instance_id,
            error = %e,
            "failed to resume instance"
          );
        }
      }
    }
    Ok(resumed)
  }

  /// Wait for the succeeded row of `row_id` to be readable, backing off linearly.
  async fn confirm_success(&self, hash: &str, row_id: &str) -> Result<TaskCacheEntry, CacheError> {
    let lookups = self.config.lookup_attempts.max(1);
    for lookup in 1..=lookups {
      match self.store.get_by_hash(hash).await? {
        Some(entry) if entry.id == row_id && entry.status == CacheStatus::Success => {
          return Ok(entry);
        }
        found => {
          debug!(
            hash = %hash,
            lookup,
            status = ?found.map(|e| e.status),
            "task cache row not yet succeeded"
          );
        }
      }
      if lookup < lookups {
        tokio::time::sleep(self.config.lookup_backoff() * lookup).await;
      }
    }
    Err(CacheError::Store(flowcache_store::Error::NotFound(format!(
      "succeeded task cache row '{row_id}' for '{hash}'"
    ))))
  }

  /// Start the consume loop.
  ///
  /// Runs until the cancellation token is triggered or the bus closes.
  pub async fn start(self, mut receiver: broadcast::Receiver<Envelope>, cancel: CancellationToken) {
    info!(topic = %self.topic, "starting resume handler");

    loop {
      tokio::select! {
        _ = cancel.cancelled() => {
          info!(topic = %self.topic, "resume handler cancelled");
          break;
        }
        received = receiver.recv() => {
          match received {
            Ok(envelope) if envelope.topic == self.topic => {
              if let Err(e) = self.handle(&envelope.message).await {
                error!(
                  hash = %envelope.message.hash,
                  error = %e,
                  "failed to handle completion message"
                );
              }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
              warn!(topic = %self.topic, skipped, "resume handler lagged behind bus");
            }
            Err(broadcast::error::RecvError::Closed) => {
              info!(topic = %self.topic, "completion bus closed");
              break;
            }
          }
        }
      }
    }
  }
}
