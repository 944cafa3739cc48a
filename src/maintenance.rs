//! Background checkpoint remover.

use crossbeam_channel::{bounded, select, tick, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace};

use crate::manager::{CheckpointManager, CollapseOutcome};

/// Totals accumulated by a remover thread over its lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoverTotals {
  pub passes: u64,
  pub checkpoints_removed: u64,
  pub items_removed: u64,
  pub checkpoints_created: u64,
}

impl RemoverTotals {
  fn absorb(&mut self, outcome: &CollapseOutcome) {
    self.checkpoints_removed += outcome.checkpoints_removed as u64;
    self.items_removed += outcome.items_removed as u64;
    if outcome.new_checkpoint_created {
      self.checkpoints_created += 1;
    }
  }
}

/// Periodically runs [`CheckpointManager::remove_closed_unref_checkpoints`]
/// over a fixed set of managers until stopped or dropped.
pub struct CheckpointRemover {
  shutdown: Option<Sender<()>>,
  handle: Option<JoinHandle<RemoverTotals>>,
}

impl CheckpointRemover {
  pub fn spawn(managers: Vec<Arc<CheckpointManager>>, interval: Duration) -> Self {
    let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
    let ticker = tick(interval);

    let handle = thread::spawn(move || {
      let mut totals = RemoverTotals::default();
      debug!(managers = managers.len(), ?interval, "checkpoint remover started");
      loop {
        select! {
          recv(shutdown_rx) -> _ => break,
          recv(ticker) -> _ => {
            for manager in &managers {
              let outcome = manager.remove_closed_unref_checkpoints();
              totals.absorb(&outcome);
            }
            totals.passes += 1;
            trace!(pass = totals.passes, "checkpoint remover pass");
          }
        }
      }
      debug!(
        passes = totals.passes,
        removed = totals.checkpoints_removed,
        "checkpoint remover stopped"
      );
      totals
    });

    Self {
      shutdown: Some(shutdown_tx),
      handle: Some(handle),
    }
  }

  /// Stop the thread and return what it did.
  pub fn stop(mut self) -> RemoverTotals {
    self.shutdown_and_join()
  }

  fn shutdown_and_join(&mut self) -> RemoverTotals {
    if let Some(shutdown) = self.shutdown.take() {
      let _ = shutdown.send(());
    }
    self
      .handle
      .take()
      .and_then(|handle| handle.join().ok())
      .unwrap_or_default()
  }
}

impl Drop for CheckpointRemover {
  fn drop(&mut self) {
    self.shutdown_and_join();
  }
}
