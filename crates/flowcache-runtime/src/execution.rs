//! Detached execution of a cached computation.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use flowcache_bus::CompletionMessage;
use flowcache_store::{TaskCacheEntry, TaskCacheUpdate, unix_now};
use futures::FutureExt;
use tracing::{error, info, instrument};

use crate::cache::Shared;
use crate::error::TaskError;
use crate::pool::panic_message;
use crate::task::{AsyncTask, TaskContext, content_type_for};

/// One run of a task for a freshly inserted pending row.
///
/// Owned entirely by the worker that runs it, so it outlives the request that
/// created the row.
pub(crate) struct Execution {
  shared: Arc<Shared>,
  task: Arc<dyn AsyncTask>,
  entry: TaskCacheEntry,
}

impl Execution {
  pub(crate) fn new(shared: Arc<Shared>, task: Arc<dyn AsyncTask>, entry: TaskCacheEntry) -> Self {
    Self {
      shared,
      task,
      entry,
    }
  }

  /// Run the task and drive the row to its terminal state.
  ///
  /// Never returns an error: failures are recorded on the row and published.
  #[instrument(
    name = "task_execute",
    skip(self),
    fields(hash = %self.entry.hash, attempt = %self.entry.id, task_type = %self.entry.task_type)
  )]
  pub(crate) async fn run(self) {
    let ctx = TaskContext {
      hash: self.entry.hash.clone(),
      task_type: self.entry.task_type.clone(),
    };

    info!(
      hash = %self.entry.hash,
      task_type = %self.entry.task_type,
      location = %self.entry.location(),
      "task_started"
    );

    let outcome = match AssertUnwindSafe(self.task.execute(&ctx)).catch_unwind().await {
      Ok(result) => result,
      Err(panic) => {
        let message = panic_message(panic.as_ref());
        error!(hash = %self.entry.hash, panic = %message, "task_panicked");
        Err(TaskError::Panicked { message })
      }
    };

    let stored = match outcome {
      Ok(value) => self.store_result(&value).await.map(|size| (value, size)),
      Err(e) => Err(e),
    };

    match stored {
      Ok((value, size)) => {
        info!(hash = %self.entry.hash, size_bytes = size, "task_completed");
        self
          .shared
          .publish(&CompletionMessage::success(
            &self.entry.hash,
            &self.entry.id,
            &self.entry.task_type,
            value,
            unix_now(),
          ))
          .await;
      }
      Err(e) => self.fail(e).await,
    }
  }

  /// Upload the result then mark the row succeeded, in that order.
  async fn store_result(&self, value: &serde_json::Value) -> Result<i64, TaskError> {
    let data = serde_json::to_vec(value).map_err(TaskError::storage)?;
    let size = flowcache_artifact::upload(
      self.shared.blobs.as_ref(),
      &self.entry.location(),
      Bytes::from(data),
      content_type_for(&self.entry.extension),
    )
    .await
    .map_err(TaskError::storage)? as i64;

    self
      .shared
      .store
      .update(&self.entry.hash, &TaskCacheUpdate::success(size, unix_now()))
      .await
      .map_err(TaskError::storage)?;

    Ok(size)
  }

  async fn fail(&self, e: TaskError) {
    let message = e.to_string();
    error!(hash = %self.entry.hash, error = %message, "task_failed");

    if let Err(store_err) = self.shared.record_failure(&self.entry.hash, &message).await {
      error!(
        hash = %self.entry.hash,
        error = %store_err,
        "failed to record task failure"
      );
    }

    self
      .shared
      .publish(&CompletionMessage::failed(
        &self.entry.hash,
        &self.entry.id,
        &self.entry.task_type,
        message,
        unix_now(),
      ))
      .await;
  }
}
