//! Per-partition checkpoint manager.
//!
//! All structural state (checkpoints, cursors, the seqno allocator and the
//! persistence floor) lives behind one lock. Operations are split across
//! submodules by concern:
//!
//! - `queue`: enqueue, deduplication and rotation
//! - `cursor_ops`: cursor registration and reads
//! - `collapse`: freeing, merging and clearing checkpoints

mod collapse;
mod cursor_ops;
mod queue;

#[cfg(test)]
mod stress;

pub use collapse::CollapseOutcome;
pub use queue::Enqueued;

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::iter;
use std::sync::Arc;
use tracing::debug;

use crate::checkpoint::{Checkpoint, CheckpointState};
use crate::clock::SeqnoAllocator;
use crate::config::{CheckpointConfig, ManagerOptions};
use crate::cursor::{Cursor, CursorKind, CursorPosition, PERSISTENCE_CURSOR_NAME};
use crate::error::{KiteError, Result};
use crate::stats::CheckpointStats;
use crate::types::{Cas, CheckpointId, PartitionId, PartitionState, Seqno, SnapshotRange};

pub struct CheckpointManager {
  partition: PartitionId,
  inner: Mutex<ManagerInner>,
  stats: Arc<CheckpointStats>,
}

pub(crate) struct ManagerInner {
  state: PartitionState,
  config: CheckpointConfig,
  /// Closed checkpoints, oldest first.
  closed: VecDeque<Checkpoint>,
  open: Checkpoint,
  cursors: IndexMap<String, Cursor>,
  allocator: SeqnoAllocator,
  /// Oldest checkpoint handed to the flusher that is not yet persisted.
  persistence_floor: Option<CheckpointId>,
}

/// Serializable view of a manager for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerSummary {
  pub partition: PartitionId,
  pub state: PartitionState,
  pub high_seqno: Seqno,
  pub max_cas: Cas,
  pub num_items: usize,
  pub persistence_floor: Option<CheckpointId>,
  pub checkpoints: Vec<CheckpointSummary>,
  pub cursors: Vec<CursorSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSummary {
  pub id: CheckpointId,
  pub state: CheckpointState,
  pub num_items: usize,
  pub num_slots: usize,
  pub snapshot: SnapshotRange,
  pub cursor_refs: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CursorSummary {
  pub name: String,
  pub kind: CursorKind,
  pub position: CursorPosition,
  pub outstanding: usize,
  pub send_end_markers: bool,
  pub last_seqno: Seqno,
}

impl ManagerSummary {
  pub fn to_json(&self) -> Result<String> {
    serde_json::to_string_pretty(self)
      .map_err(|error| KiteError::Serialization(format!("encode manager summary: {error}")))
  }
}

impl CheckpointManager {
  pub fn new(options: ManagerOptions) -> Result<Self> {
    options.config.validate()?;
    let boundary = options.last_seqno + 1;
    let mut open = Checkpoint::new(
      1,
      options.last_snapshot_start,
      options.last_snapshot_end,
      boundary,
    );

    let mut cursors = IndexMap::new();
    if options.config.persistence_enabled {
      cursors.insert(
        PERSISTENCE_CURSOR_NAME.to_string(),
        Cursor::new(
          CursorKind::Persistence,
          open.id(),
          0,
          0,
          true,
          options.last_seqno,
        ),
      );
      open.attach_cursor();
    }

    debug!(
      partition = options.partition,
      state = %options.state,
      last_seqno = options.last_seqno,
      "checkpoint manager created"
    );

    Ok(Self {
      partition: options.partition,
      inner: Mutex::new(ManagerInner {
        state: options.state,
        config: options.config,
        closed: VecDeque::new(),
        open,
        cursors,
        allocator: SeqnoAllocator::new(options.last_seqno, options.max_cas),
        persistence_floor: None,
      }),
      stats: options
        .stats
        .unwrap_or_else(|| Arc::new(CheckpointStats::new())),
    })
  }

  pub fn partition(&self) -> PartitionId {
    self.partition
  }

  pub fn stats(&self) -> &Arc<CheckpointStats> {
    &self.stats
  }

  pub fn config(&self) -> CheckpointConfig {
    self.inner.lock().config.clone()
  }

  pub fn partition_state(&self) -> PartitionState {
    self.inner.lock().state
  }

  pub fn high_seqno(&self) -> Seqno {
    self.inner.lock().allocator.high_seqno()
  }

  pub fn max_cas(&self) -> Cas {
    self.inner.lock().allocator.max_cas()
  }

  /// Record a CAS observed outside the log so later local CAS values exceed it.
  pub fn observe_cas(&self, cas: Cas) {
    self.inner.lock().allocator.observe_cas(cas);
  }

  pub fn num_checkpoints(&self) -> usize {
    self.inner.lock().num_checkpoints()
  }

  pub fn open_checkpoint_id(&self) -> CheckpointId {
    self.inner.lock().open.id()
  }

  pub fn last_closed_checkpoint_id(&self) -> Option<CheckpointId> {
    self.inner.lock().closed.back().map(Checkpoint::id)
  }

  /// Non-meta items in the open checkpoint.
  pub fn num_open_checkpoint_items(&self) -> usize {
    self.inner.lock().open.num_items()
  }

  /// Live entries across all checkpoints, counting start markers and
  /// partition-state markers but not dummies or end markers.
  pub fn num_items(&self) -> usize {
    self.inner.lock().num_items()
  }

  pub fn open_snapshot_range(&self) -> SnapshotRange {
    self.inner.lock().open.snapshot_range()
  }

  pub fn num_cursors(&self) -> usize {
    self.inner.lock().cursors.len()
  }

  pub fn cursor_names(&self) -> Vec<String> {
    self.inner.lock().cursors.keys().cloned().collect()
  }

  pub fn has_cursor(&self, name: &str) -> bool {
    self.inner.lock().cursors.contains_key(name)
  }

  pub fn persistence_floor(&self) -> Option<CheckpointId> {
    self.inner.lock().persistence_floor
  }

  pub fn summary(&self) -> ManagerSummary {
    let inner = self.inner.lock();
    ManagerSummary {
      partition: self.partition,
      state: inner.state,
      high_seqno: inner.allocator.high_seqno(),
      max_cas: inner.allocator.max_cas(),
      num_items: inner.num_items(),
      persistence_floor: inner.persistence_floor,
      checkpoints: inner
        .checkpoints()
        .map(|checkpoint| CheckpointSummary {
          id: checkpoint.id(),
          state: checkpoint.state(),
          num_items: checkpoint.num_items(),
          num_slots: checkpoint.len(),
          snapshot: checkpoint.snapshot_range(),
          cursor_refs: checkpoint.cursor_refs(),
        })
        .collect(),
      cursors: inner
        .cursors
        .iter()
        .map(|(name, cursor)| CursorSummary {
          name: name.clone(),
          kind: cursor.kind,
          position: cursor.position(),
          outstanding: inner.outstanding(cursor),
          send_end_markers: cursor.send_end_markers,
          last_seqno: cursor.last_seqno,
        })
        .collect(),
    }
  }

  /// Full structural recount. Cheap bookkeeping is only debug-asserted on
  /// the hot paths; this walks every slot and every cursor.
  pub fn verify(&self) -> Result<()> {
    self.inner.lock().verify()
  }
}

impl ManagerInner {
  pub(crate) fn checkpoints(&self) -> impl Iterator<Item = &Checkpoint> + '_ {
    self.closed.iter().chain(iter::once(&self.open))
  }

  fn num_checkpoints(&self) -> usize {
    self.closed.len() + 1
  }

  fn num_items(&self) -> usize {
    self.checkpoints().map(Checkpoint::num_queued).sum()
  }

  fn closed_index(&self, id: CheckpointId) -> Option<usize> {
    self.closed.binary_search_by_key(&id, Checkpoint::id).ok()
  }

  pub(crate) fn checkpoint(&self, id: CheckpointId) -> Result<&Checkpoint> {
    if id == self.open.id() {
      return Ok(&self.open);
    }
    self
      .closed_index(id)
      .map(|index| &self.closed[index])
      .ok_or_else(|| KiteError::Internal(format!("checkpoint {id} is not resident")))
  }

  pub(crate) fn checkpoint_mut(&mut self, id: CheckpointId) -> Result<&mut Checkpoint> {
    if id == self.open.id() {
      return Ok(&mut self.open);
    }
    match self.closed_index(id) {
      Some(index) => Ok(&mut self.closed[index]),
      None => Err(KiteError::Internal(format!(
        "checkpoint {id} is not resident"
      ))),
    }
  }

  /// Id of the checkpoint following `id`.
  pub(crate) fn successor(&self, id: CheckpointId) -> Result<CheckpointId> {
    let index = self
      .closed_index(id)
      .ok_or_else(|| KiteError::Internal(format!("checkpoint {id} has no successor")))?;
    Ok(
      self
        .closed
        .get(index + 1)
        .map_or(self.open.id(), Checkpoint::id),
    )
  }

  pub(crate) fn cursor(&self, name: &str) -> Result<&Cursor> {
    self
      .cursors
      .get(name)
      .ok_or_else(|| KiteError::UnknownCursor(name.to_string()))
  }

  /// Move a cursor, keeping per-checkpoint reference counts in step.
  pub(crate) fn reposition(
    &mut self,
    name: &str,
    checkpoint_id: CheckpointId,
    offset: usize,
    consumed: usize,
  ) -> Result<()> {
    let cursor = self
      .cursors
      .get_mut(name)
      .ok_or_else(|| KiteError::UnknownCursor(name.to_string()))?;
    let from = cursor.checkpoint_id;
    cursor.checkpoint_id = checkpoint_id;
    cursor.offset = offset;
    cursor.consumed = consumed;
    if from != checkpoint_id {
      self.checkpoint_mut(from)?.detach_cursor();
      self.checkpoint_mut(checkpoint_id)?.attach_cursor();
    }
    Ok(())
  }

  /// Items the cursor has yet to consume.
  pub(crate) fn outstanding(&self, cursor: &Cursor) -> usize {
    self
      .checkpoints()
      .filter(|checkpoint| checkpoint.id() >= cursor.checkpoint_id)
      .map(|checkpoint| {
        if checkpoint.id() == cursor.checkpoint_id {
          checkpoint.num_items().saturating_sub(cursor.consumed)
        } else {
          checkpoint.num_items()
        }
      })
      .sum()
  }

  /// Oldest checkpoint something still depends on.
  pub(crate) fn oldest_referenced(&self) -> CheckpointId {
    self
      .cursors
      .values()
      .map(|cursor| cursor.checkpoint_id)
      .chain(self.persistence_floor)
      .min()
      .unwrap_or_else(|| self.open.id())
  }

  pub(crate) fn oldest(&self) -> &Checkpoint {
    self.closed.front().unwrap_or(&self.open)
  }

  pub(crate) fn debug_check_refs(&self) {
    if cfg!(debug_assertions) {
      for checkpoint in self.checkpoints() {
        let refs = self
          .cursors
          .values()
          .filter(|cursor| cursor.checkpoint_id == checkpoint.id())
          .count();
        debug_assert_eq!(
          refs,
          checkpoint.cursor_refs(),
          "cursor refs drifted on checkpoint {}",
          checkpoint.id()
        );
      }
    }
  }

  fn verify(&self) -> Result<()> {
    let violation = |message: String| Err(KiteError::Internal(message));

    let mut previous: Option<CheckpointId> = None;
    for checkpoint in self.checkpoints() {
      if let Some(previous) = previous {
        if checkpoint.id() <= previous {
          return violation(format!(
            "checkpoint ids out of order: {previous} then {}",
            checkpoint.id()
          ));
        }
      }
      previous = Some(checkpoint.id());

      let expect_open = checkpoint.id() == self.open.id();
      if checkpoint.is_open() != expect_open {
        return violation(format!(
          "checkpoint {} has state {:?}",
          checkpoint.id(),
          checkpoint.state()
        ));
      }
      checkpoint.check_consistency().map_err(KiteError::Internal)?;

      let refs = self
        .cursors
        .values()
        .filter(|cursor| cursor.checkpoint_id == checkpoint.id())
        .count();
      if refs != checkpoint.cursor_refs() {
        return violation(format!(
          "checkpoint {} records {} cursors but {refs} point at it",
          checkpoint.id(),
          checkpoint.cursor_refs()
        ));
      }
    }

    let mut last_seqno = 0;
    for checkpoint in self.checkpoints() {
      for (_, entry) in checkpoint.live_entries() {
        if entry.is_meta() {
          continue;
        }
        if entry.seqno() <= last_seqno {
          return violation(format!(
            "seqno {} follows {last_seqno} in checkpoint {}",
            entry.seqno(),
            checkpoint.id()
          ));
        }
        last_seqno = entry.seqno();
      }
    }
    if last_seqno > self.allocator.high_seqno() {
      return violation(format!(
        "queued seqno {last_seqno} above high seqno {}",
        self.allocator.high_seqno()
      ));
    }

    for (name, cursor) in &self.cursors {
      let checkpoint = self.checkpoint(cursor.checkpoint_id)?;
      if cursor.offset >= checkpoint.len() {
        return violation(format!(
          "cursor {name} offset {} beyond checkpoint {} of {} slots",
          cursor.offset,
          checkpoint.id(),
          checkpoint.len()
        ));
      }
      if checkpoint.entry(cursor.offset).is_none() {
        return violation(format!(
          "cursor {name} sits on tombstone {} of checkpoint {}",
          cursor.offset,
          checkpoint.id()
        ));
      }
      let consumed = checkpoint.items_through(cursor.offset);
      if consumed != cursor.consumed {
        return violation(format!(
          "cursor {name} records {} consumed items but sits after {consumed}",
          cursor.consumed
        ));
      }
    }

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::CheckpointManager;
  use crate::config::{CheckpointConfig, ManagerOptions};
  use crate::cursor::PERSISTENCE_CURSOR_NAME;
  use crate::error::Result;
  use crate::types::PartitionState;

  #[test]
  fn test_new_manager_layout() -> Result<()> {
    let manager = CheckpointManager::new(ManagerOptions::new().partition(3).last_seqno(1000))?;
    assert_eq!(manager.partition(), 3);
    assert_eq!(manager.num_checkpoints(), 1);
    assert_eq!(manager.open_checkpoint_id(), 1);
    assert_eq!(manager.last_closed_checkpoint_id(), None);
    assert_eq!(manager.num_items(), 1);
    assert_eq!(manager.num_open_checkpoint_items(), 0);
    assert_eq!(manager.high_seqno(), 1000);
    assert_eq!(manager.cursor_names(), vec![PERSISTENCE_CURSOR_NAME.to_string()]);
    manager.verify()
  }

  #[test]
  fn test_ephemeral_manager_has_no_cursors() -> Result<()> {
    let manager = CheckpointManager::new(
      ManagerOptions::new()
        .state(PartitionState::Replica)
        .config(CheckpointConfig::new().persistence_enabled(false)),
    )?;
    assert_eq!(manager.num_cursors(), 0);
    assert_eq!(manager.partition_state(), PartitionState::Replica);
    manager.verify()
  }

  #[test]
  fn test_invalid_config_is_rejected() {
    let options = ManagerOptions::new().config(CheckpointConfig::new().max_items(0));
    assert!(CheckpointManager::new(options).is_err());
  }

  #[test]
  fn test_summary_serializes() -> Result<()> {
    let manager = CheckpointManager::new(ManagerOptions::new())?;
    let summary = manager.summary();
    assert_eq!(summary.checkpoints.len(), 1);
    assert_eq!(summary.cursors.len(), 1);
    assert_eq!(summary.cursors[0].outstanding, 0);
    let raw = summary.to_json()?;
    assert!(raw.contains("\"persistence\""));
    Ok(())
  }
}
