//! The executable unit handed to the task cache.

use async_trait::async_trait;

use crate::error::TaskError;

/// Context passed to [`AsyncTask::execute`].
#[derive(Debug, Clone)]
pub struct TaskContext {
  /// Fingerprint of the computation being executed.
  pub hash: String,
  /// Category tag reported by the task.
  pub task_type: String,
}

/// An expensive computation whose result is cached by fingerprint.
///
/// Implementations describe their defining inputs through
/// [`hash_content`](AsyncTask::hash_content); two tasks with the same content
/// share one execution and one result.
///
/// # Example
///
/// ```ignore
/// struct Ocr { doc_id: String, version: String }
///
/// #[async_trait]
/// impl AsyncTask for Ocr {
///   fn task_type(&self) -> &str { "ocr" }
///   fn hash_content(&self) -> String { format!("ocr:{}:{}", self.doc_id, self.version) }
///   async fn execute(&self, _ctx: &TaskContext) -> Result<serde_json::Value, TaskError> {
///     Ok(json!({ "text": run_ocr(&self.doc_id).await? }))
///   }
/// }
/// ```
#[async_trait]
pub trait AsyncTask: Send + Sync {
  /// Category tag for observability and routing.
  fn task_type(&self) -> &str;

  /// The inputs that define the computation.
  fn hash_content(&self) -> String;

  /// Lifetime of the cached row in seconds. Non-positive uses the configured default.
  fn expire_seconds(&self) -> i64 {
    0
  }

  /// Extension of the stored result, used as a content-type hint.
  fn result_extension(&self) -> &str {
    ".json"
  }

  /// Run the computation.
  async fn execute(&self, ctx: &TaskContext) -> Result<serde_json::Value, TaskError>;
}

/// Map a result extension to the content type sent to the blob store.
pub(crate) fn content_type_for(extension: &str) -> &'static str {
  match extension.trim_start_matches('.') {
    "json" => "application/json",
    "txt" | "md" => "text/plain",
    "html" => "text/html",
    _ => "application/octet-stream",
  }
}
