//! Tracking for work that outlives the handler that started it.

use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::warn;

/// Spawned background work the worker must let finish before shutting down.
#[derive(Clone, Default)]
pub struct BackgroundTasks {
  handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl BackgroundTasks {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn spawn<F>(&self, future: F)
  where
    F: Future<Output = ()> + Send + 'static,
  {
    let handle = tokio::spawn(future);
    match self.handles.lock() {
      Ok(mut handles) => {
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
      }
      Err(e) => warn!(error = %e, "background task registry poisoned, task untracked"),
    }
  }

  /// Number of tasks still running.
  pub fn pending(&self) -> usize {
    self
      .handles
      .lock()
      .map(|handles| handles.iter().filter(|h| !h.is_finished()).count())
      .unwrap_or(0)
  }

  /// Wait for every tracked task, including ones spawned while waiting.
  pub async fn settle(&self) {
    loop {
      let pending: Vec<JoinHandle<()>> = match self.handles.lock() {
        Ok(mut handles) => handles.drain(..).collect(),
        Err(_) => return,
      };
      if pending.is_empty() {
        return;
      }
      for handle in pending {
        if let Err(e) = handle.await {
          warn!(error = %e, "background task panicked");
        }
      }
    }
  }
}
