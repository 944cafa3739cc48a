//! Diagnostic counters shared by every manager in a process.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{KiteError, Result};

#[derive(Debug, Default)]
pub struct CheckpointStats {
  items_enqueued: AtomicU64,
  items_deduplicated: AtomicU64,
  checkpoints_created: AtomicU64,
  checkpoints_removed: AtomicU64,
  items_removed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
  pub items_enqueued: u64,
  pub items_deduplicated: u64,
  pub checkpoints_created: u64,
  pub checkpoints_removed: u64,
  pub items_removed: u64,
}

impl CheckpointStats {
  pub fn new() -> Self {
    Self::default()
  }

  pub(crate) fn record_enqueued(&self) {
    self.items_enqueued.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn record_deduplicated(&self) {
    self.items_deduplicated.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn record_checkpoint_created(&self) {
    self.checkpoints_created.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn record_removed(&self, checkpoints: usize, items: usize) {
    self
      .checkpoints_removed
      .fetch_add(checkpoints as u64, Ordering::Relaxed);
    self
      .items_removed
      .fetch_add(items as u64, Ordering::Relaxed);
  }

  pub fn items_deduplicated(&self) -> u64 {
    self.items_deduplicated.load(Ordering::Relaxed)
  }

  pub fn snapshot(&self) -> StatsSnapshot {
    StatsSnapshot {
      items_enqueued: self.items_enqueued.load(Ordering::Relaxed),
      items_deduplicated: self.items_deduplicated.load(Ordering::Relaxed),
      checkpoints_created: self.checkpoints_created.load(Ordering::Relaxed),
      checkpoints_removed: self.checkpoints_removed.load(Ordering::Relaxed),
      items_removed: self.items_removed.load(Ordering::Relaxed),
    }
  }
}

impl StatsSnapshot {
  pub fn to_json(&self) -> Result<String> {
    serde_json::to_string(self)
      .map_err(|error| KiteError::Serialization(format!("encode checkpoint stats: {error}")))
  }
}
