//! Bounded worker pool for detached computations.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::CacheError;

type Job = BoxFuture<'static, ()>;

/// A fixed set of workers draining a bounded queue.
///
/// Submission waits while the queue is full. A job that panics is logged and
/// the worker moves on to the next job. Shutting down closes the queue and
/// lets the workers drain it: a job is either accepted and run, or rejected
/// with [`CacheError::PoolClosed`].
pub struct WorkerPool {
  /// `None` once the pool is shut down.
  sender: std::sync::Mutex<Option<mpsc::Sender<Job>>>,
  workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
  /// Spawn `workers` workers sharing a queue of `queue_capacity` jobs.
  ///
  /// Must be called from within a tokio runtime.
  pub fn new(workers: usize, queue_capacity: usize) -> Self {
    let (sender, receiver) = mpsc::channel::<Job>(queue_capacity.max(1));
    let receiver = Arc::new(Mutex::new(receiver));

    let handles = (0..workers.max(1))
      .map(|worker_id| tokio::spawn(worker_loop(worker_id, Arc::clone(&receiver))))
      .collect();

    Self {
      sender: std::sync::Mutex::new(Some(sender)),
      workers: Mutex::new(handles),
    }
  }

  /// Queue a job, waiting for space if the queue is full.
  pub async fn submit<F>(&self, job: F) -> Result<(), CacheError>
  where
    F: std::future::Future<Output = ()> + Send + 'static,
  {
    // The clone keeps the queue open until this send resolves, so the
    // workers are still draining when it lands.
    let sender = self.sender().ok_or(CacheError::PoolClosed)?;
    sender
      .send(job.boxed())
      .await
      .map_err(|_| CacheError::PoolClosed)
  }

  pub fn is_closed(&self) -> bool {
    self.sender().is_none()
  }

  /// Stop accepting jobs and wait for queued jobs to finish.
  pub async fn shutdown(&self) {
    drop(
      self
        .sender
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take(),
    );
    let handles = std::mem::take(&mut *self.workers.lock().await);
    for handle in handles {
      if let Err(e) = handle.await {
        error!(error = %e, "task worker join error");
      }
    }
    info!("task worker pool stopped");
  }

  fn sender(&self) -> Option<mpsc::Sender<Job>> {
    self
      .sender
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }
}

/// Runs jobs until every sender is gone and the queue is empty.
async fn worker_loop(worker_id: usize, receiver: Arc<Mutex<mpsc::Receiver<Job>>>) {
  loop {
    let job = receiver.lock().await.recv().await;

    let Some(job) = job else {
      debug!(worker_id, "task worker exiting");
      break;
    };

    if let Err(panic) = AssertUnwindSafe(job).catch_unwind().await {
      error!(
        worker_id,
        error = %panic_message(panic.as_ref()),
        "task worker job panicked"
      );
    }
  }
}

/// Render a panic payload as text.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
  if let Some(message) = payload.downcast_ref::<&str>() {
    (*message).to_string()
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.clone()
  } else {
    "unknown panic".to_string()
  }
}
