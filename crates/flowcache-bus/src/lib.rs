//! Completion notifications for cached computations.
//!
//! Exactly one [`CompletionMessage`] is published per terminal transition of a
//! fingerprint. Consumers (typically a resume handler) map the `hash` back to
//! the workflow instances waiting on it. The transport is pluggable through
//! [`Publisher`]; this crate ships in-process implementations only.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

/// Default topic for completion messages.
pub const DEFAULT_TOPIC: &str = "flowcache.task.completed";

/// Error type for publishing.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// The transport has no live receivers or was shut down.
  #[error("bus closed: {0}")]
  Closed(String),

  /// The payload could not be encoded or decoded.
  #[error("invalid payload: {0}")]
  Payload(#[from] serde_json::Error),
}

/// Terminal status carried by a completion message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
  Success,
  Failed,
}

/// Terminal-state notification for one fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionMessage {
  pub hash: String,
  /// Id of the cache row the computation ran for. A retry of the same
  /// fingerprint gets a new id, so consumers can tell attempts apart.
  #[serde(default)]
  pub attempt: String,
  pub task_type: String,
  pub status: CompletionStatus,
  /// The task result, present on success.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub result: Option<serde_json::Value>,
  /// The error text, present on failure.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  /// Unix seconds.
  pub completed_at: i64,
}

impl CompletionMessage {
  pub fn success(
    hash: impl Into<String>,
    attempt: impl Into<String>,
    task_type: impl Into<String>,
    result: serde_json::Value,
    completed_at: i64,
  ) -> Self {
    Self {
      hash: hash.into(),
      attempt: attempt.into(),
      task_type: task_type.into(),
      status: CompletionStatus::Success,
      result: Some(result),
      error: None,
      completed_at,
    }
  }

  pub fn failed(
    hash: impl Into<String>,
    attempt: impl Into<String>,
    task_type: impl Into<String>,
    error: impl Into<String>,
    completed_at: i64,
  ) -> Self {
    Self {
      hash: hash.into(),
      attempt: attempt.into(),
      task_type: task_type.into(),
      status: CompletionStatus::Failed,
      result: None,
      error: Some(error.into()),
      completed_at,
    }
  }

  /// Encode for a byte-oriented transport.
  pub fn to_payload(&self) -> Result<Vec<u8>, Error> {
    Ok(serde_json::to_vec(self)?)
  }

  /// Decode a payload produced by [`CompletionMessage::to_payload`].
  pub fn from_payload(payload: &[u8]) -> Result<Self, Error> {
    Ok(serde_json::from_slice(payload)?)
  }
}

/// A message together with the topic it was published on.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
  pub topic: String,
  pub message: CompletionMessage,
}

/// Trait for emitting completion messages to a shared bus.
#[async_trait]
pub trait Publisher: Send + Sync {
  async fn publish(&self, topic: &str, message: &CompletionMessage) -> Result<(), Error>;
}

/// A no-op publisher that discards all messages.
///
/// Useful when nothing waits on completions.
#[derive(Debug, Clone, Default)]
pub struct NoopPublisher;

#[async_trait]
impl Publisher for NoopPublisher {
  async fn publish(&self, _topic: &str, _message: &CompletionMessage) -> Result<(), Error> {
    Ok(())
  }
}

/// A publisher that sends messages to an unbounded channel.
///
/// Use this when a single consumer drains completions asynchronously.
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
  // Unbounded so the executor never waits on a slow consumer; volume is one
  // message per terminal transition.
  sender: mpsc::UnboundedSender<Envelope>,
}

impl ChannelPublisher {
  pub fn new(sender: mpsc::UnboundedSender<Envelope>) -> Self {
    Self { sender }
  }
}

#[async_trait]
impl Publisher for ChannelPublisher {
  async fn publish(&self, topic: &str, message: &CompletionMessage) -> Result<(), Error> {
    self
      .sender
      .send(Envelope {
        topic: topic.to_string(),
        message: message.clone(),
      })
      .map_err(|_| Error::Closed("channel receiver dropped".to_string()))
  }
}

/// Fan-out bus: every subscriber sees every message.
///
/// Publishing with no subscribers succeeds; the message is simply not observed,
/// matching fire-and-forget topic semantics.
#[derive(Debug, Clone)]
pub struct BroadcastBus {
  sender: broadcast::Sender<Envelope>,
}

impl BroadcastBus {
  pub fn new(capacity: usize) -> Self {
    let (sender, _) = broadcast::channel(capacity.max(1));
    Self { sender }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
    self.sender.subscribe()
  }
}

impl Default for BroadcastBus {
  fn default() -> Self {
    Self::new(256)
  }
}

#[async_trait]
impl Publisher for BroadcastBus {
  async fn publish(&self, topic: &str, message: &CompletionMessage) -> Result<(), Error> {
    // A send error only means there are no subscribers right now.
    let _ = self.sender.send(Envelope {
      topic: topic.to_string(),
      message: message.clone(),
    });
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_payload_shape() {
    let message = CompletionMessage::success("h", "row-1", "ocr", json!({"text": "hello"}), 10);
    let value: serde_json::Value = serde_json::from_slice(&message.to_payload().unwrap()).unwrap();
    assert_eq!(value["status"], "success");
    assert_eq!(value["attempt"], "row-1");
    assert_eq!(value["result"]["text"], "hello");
    assert!(value.get("error").is_none());

    let failed = CompletionMessage::failed("h", "row-1", "ocr", "boom", 11);
    let decoded = CompletionMessage::from_payload(&failed.to_payload().unwrap()).unwrap();
    assert_eq!(decoded, failed);
  }

  #[tokio::test]
  async fn test_channel_publisher() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let publisher = ChannelPublisher::new(tx);
    let message = CompletionMessage::failed("h", "row-1", "ocr", "boom", 1);

    publisher.publish("topic-a", &message).await.unwrap();

    let envelope = rx.recv().await.unwrap();
    assert_eq!(envelope.topic, "topic-a");
    assert_eq!(envelope.message, message);

    drop(rx);
    assert!(matches!(
      publisher.publish("topic-a", &message).await,
      Err(Error::Closed(_))
    ));
  }

  #[tokio::test]
  async fn test_broadcast_fan_out() {
    let bus = BroadcastBus::default();
    bus
      .publish(DEFAULT_TOPIC, &CompletionMessage::failed("early", "row-0", "t", "x", 0))
      .await
      .unwrap();

    let mut a = bus.subscribe();
    let mut b = bus.subscribe();
    let message = CompletionMessage::success("h", "row-2", "t", json!(1), 2);
    bus.publish(DEFAULT_TOPIC, &message).await.unwrap();

    assert_eq!(a.recv().await.unwrap().message, message);
    assert_eq!(b.recv().await.unwrap().message, message);
  }
}
