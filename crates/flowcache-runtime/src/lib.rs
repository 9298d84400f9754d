//! Task cache runtime for flowcache.
//!
//! This crate ties the cache store, creation lock, blob store and completion
//! bus together into a single-flight cache for expensive computations.
//!
//! # Architecture
//!
//! ```text
//! StepAdapter
//! ├── run(instance, share, task) -> StepOutcome::{Blocked, Succeeded, Failed}
//! └── after_run(instance_id, share) -> StepStatus
//!
//! TaskCacheManager
//! └── run(owner, task) - fast read, lock, double-check, insert pending, submit
//!
//! WorkerPool
//! └── Execution::run() - execute, upload result, mark success, publish
//!
//! ResumeHandler
//! └── start(bus, cancel) - completion message -> resume instances blocked on its attempt
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use flowcache_runtime::{CacheComponents, StepAdapter, TaskCacheManager};
//!
//! let manager = Arc::new(TaskCacheManager::new(components, config));
//! let adapter = StepAdapter::new(manager, orchestrator);
//!
//! match adapter.run(&mut instance, &share, task).await {
//!     StepOutcome::Blocked => { /* wait for resume */ }
//!     StepOutcome::Succeeded(value) => { /* continue */ }
//!     StepOutcome::Failed(message) => { /* fail the step */ }
//! }
//! ```

mod cache;
mod error;
mod execution;
mod hash;
mod pool;
mod resume;
mod step;
mod task;

pub use cache::{CacheComponents, Lookup, TaskCacheManager};
pub use error::{CacheError, OrchestratorError, TaskError};
pub use hash::{FINGERPRINT_LEN, derive_hash, derive_hash_bytes};
pub use pool::WorkerPool;
pub use resume::ResumeHandler;
pub use step::{
  InMemoryShareData, Orchestrator, STATUS_KEY_PREFIX, ShareData, StepAdapter, StepOutcome,
  StepStatus, TaskInstance, status_key,
};
pub use task::{AsyncTask, TaskContext};
