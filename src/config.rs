//! Checkpoint manager configuration.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{KiteError, Result};
use crate::stats::CheckpointStats;
use crate::types::{Cas, PartitionId, PartitionState, Seqno};

pub const DEFAULT_MAX_ITEMS: usize = 500;
pub const DEFAULT_PERIOD_SECS: u64 = 5;
pub const DEFAULT_MAX_CHECKPOINTS: usize = 2;

/// Rotation, retention and collapse policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
  /// Non-meta items held by the open checkpoint before it rotates.
  pub max_items: usize,
  /// Age of a non-empty open checkpoint before it rotates.
  pub period_secs: u64,
  /// Bound on retained checkpoints for policy-driven rotation.
  pub max_checkpoints: usize,
  pub item_based: bool,
  /// Keep unreferenced closed checkpoints while under `max_checkpoints`.
  pub keep_closed: bool,
  /// Merge closed checkpoints of replica partitions.
  pub enable_merge: bool,
  /// Ephemeral partitions run without a persistence cursor.
  pub persistence_enabled: bool,
}

impl Default for CheckpointConfig {
  fn default() -> Self {
    Self {
      max_items: DEFAULT_MAX_ITEMS,
      period_secs: DEFAULT_PERIOD_SECS,
      max_checkpoints: DEFAULT_MAX_CHECKPOINTS,
      item_based: true,
      keep_closed: false,
      enable_merge: false,
      persistence_enabled: true,
    }
  }
}

impl CheckpointConfig {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn max_items(mut self, value: usize) -> Self {
    self.max_items = value;
    self
  }

  pub fn period_secs(mut self, value: u64) -> Self {
    self.period_secs = value;
    self
  }

  pub fn max_checkpoints(mut self, value: usize) -> Self {
    self.max_checkpoints = value;
    self
  }

  pub fn item_based(mut self, value: bool) -> Self {
    self.item_based = value;
    self
  }

  pub fn keep_closed(mut self, value: bool) -> Self {
    self.keep_closed = value;
    self
  }

  pub fn enable_merge(mut self, value: bool) -> Self {
    self.enable_merge = value;
    self
  }

  pub fn persistence_enabled(mut self, value: bool) -> Self {
    self.persistence_enabled = value;
    self
  }

  pub fn period(&self) -> Duration {
    Duration::from_secs(self.period_secs)
  }

  pub fn validate(&self) -> Result<()> {
    if self.max_items == 0 {
      return Err(KiteError::InvalidConfig(
        "max_items must be > 0".to_string(),
      ));
    }
    if self.max_checkpoints == 0 {
      return Err(KiteError::InvalidConfig(
        "max_checkpoints must be > 0".to_string(),
      ));
    }
    Ok(())
  }

  pub fn from_json(raw: &str) -> Result<Self> {
    let config: CheckpointConfig = serde_json::from_str(raw)
      .map_err(|error| KiteError::Serialization(format!("decode checkpoint config: {error}")))?;
    config.validate()?;
    Ok(config)
  }

  pub fn to_json(&self) -> Result<String> {
    serde_json::to_string(self)
      .map_err(|error| KiteError::Serialization(format!("encode checkpoint config: {error}")))
  }
}

/// Construction-time state of a checkpoint manager.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
  pub partition: PartitionId,
  pub state: PartitionState,
  /// Highest seqno already durable before the log was (re)built.
  pub last_seqno: Seqno,
  pub last_snapshot_start: Seqno,
  pub last_snapshot_end: Seqno,
  pub max_cas: Cas,
  pub config: CheckpointConfig,
  /// Counters shared between managers; a private set is created when absent.
  pub stats: Option<Arc<CheckpointStats>>,
}

impl Default for ManagerOptions {
  fn default() -> Self {
    Self {
      partition: 0,
      state: PartitionState::Active,
      last_seqno: 0,
      last_snapshot_start: 0,
      last_snapshot_end: 0,
      max_cas: 0,
      config: CheckpointConfig::default(),
      stats: None,
    }
  }
}

impl ManagerOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn partition(mut self, value: PartitionId) -> Self {
    self.partition = value;
    self
  }

  pub fn state(mut self, value: PartitionState) -> Self {
    self.state = value;
    self
  }

  pub fn last_seqno(mut self, value: Seqno) -> Self {
    self.last_seqno = value;
    self
  }

  pub fn last_snapshot(mut self, start: Seqno, end: Seqno) -> Self {
    self.last_snapshot_start = start;
    self.last_snapshot_end = end;
    self
  }

  pub fn max_cas(mut self, value: Cas) -> Self {
    self.max_cas = value;
    self
  }

  pub fn config(mut self, value: CheckpointConfig) -> Self {
    self.config = value;
    self
  }

  pub fn stats(mut self, value: Arc<CheckpointStats>) -> Self {
    self.stats = Some(value);
    self
  }
}
