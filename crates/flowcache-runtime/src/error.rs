//! Runtime errors.

/// Errors surfaced to a synchronous caller of the task cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
  /// The creation lock was unobtainable and no winner's row appeared.
  #[error("lock acquisition timeout for task '{hash}'")]
  LockTimeout { hash: String },

  /// The computation for this fingerprint failed; carries the stored message verbatim.
  #[error("{message}")]
  TaskFailed { hash: String, message: String },

  /// Cache store read/insert/update failed.
  #[error("task cache store error: {0}")]
  Store(#[from] flowcache_store::Error),

  /// Lock backend failed (other than timing out).
  #[error("task cache lock error: {0}")]
  Lock(#[from] flowcache_lock::Error),

  /// Blob download failed for a succeeded row.
  #[error("task cache blob error: {0}")]
  Blob(#[from] flowcache_artifact::Error),

  /// A stored result could not be decoded.
  #[error("invalid cached result for task '{hash}': {message}")]
  Serialization { hash: String, message: String },

  /// The worker pool no longer accepts jobs.
  #[error("task worker pool is shut down")]
  PoolClosed,

  /// The orchestrator rejected a contract call.
  #[error(transparent)]
  Orchestrator(#[from] OrchestratorError),
}

/// Failure of a detached computation.
///
/// Never returned to a synchronous caller; rendered into the failure
/// notification (and the tombstone row, when kept).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TaskError {
  /// The computation returned an error.
  #[error("{message}")]
  Execution { message: String },

  /// The computation panicked.
  #[error("task panicked: {message}")]
  Panicked { message: String },

  /// The result could not be serialized or written.
  #[error("failed to store task result: {message}")]
  Storage { message: String },
}

impl TaskError {
  /// Create an execution error.
  pub fn execution(message: impl Into<String>) -> Self {
    Self::Execution {
      message: message.into(),
    }
  }

  pub(crate) fn storage(message: impl ToString) -> Self {
    Self::Storage {
      message: message.to_string(),
    }
  }
}

/// Error reported by an [`crate::Orchestrator`] implementation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("orchestrator error: {message}")]
pub struct OrchestratorError {
  pub message: String,
}

impl OrchestratorError {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
    }
  }
}
