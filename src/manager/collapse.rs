//! Reclaiming closed checkpoints.

use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::debug;

use super::{CheckpointManager, ManagerInner};
use crate::checkpoint::Checkpoint;
use crate::cursor::{CursorKind, PERSISTENCE_CURSOR_NAME};
use crate::types::{PartitionState, Seqno};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollapseOutcome {
  pub checkpoints_removed: usize,
  pub items_removed: usize,
  /// Closed checkpoints folded into a neighbour by a replica merge.
  pub checkpoints_merged: usize,
  pub new_checkpoint_created: bool,
}

impl CheckpointManager {
  /// Run one maintenance pass: rotate an active partition's open checkpoint
  /// if policy says so, merge replica checkpoints when enabled, then free
  /// every closed checkpoint no cursor depends on.
  pub fn remove_closed_unref_checkpoints(&self) -> CollapseOutcome {
    let mut inner = self.inner.lock();
    let mut outcome = CollapseOutcome::default();

    if inner.state == PartitionState::Active
      && inner.rotation_due(Instant::now())
      && inner.can_create_checkpoint()
    {
      inner.rotate(&self.stats);
      outcome.new_checkpoint_created = true;
    }

    if inner.config.enable_merge && inner.state == PartitionState::Replica {
      let (merged, dropped) = inner.merge_closed();
      outcome.checkpoints_merged = merged;
      outcome.items_removed += dropped;
    }

    let (removed, items) = inner.free_unreferenced();
    outcome.checkpoints_removed = removed;
    outcome.items_removed += items;
    inner.debug_check_refs();

    if outcome.checkpoints_removed > 0 || outcome.checkpoints_merged > 0 {
      self
        .stats
        .record_removed(outcome.checkpoints_removed, outcome.items_removed);
      debug!(
        partition = self.partition,
        removed = outcome.checkpoints_removed,
        merged = outcome.checkpoints_merged,
        items = outcome.items_removed,
        "closed checkpoints reclaimed"
      );
    }
    outcome
  }

  /// Drop every checkpoint and restart the log after `seqno`. All cursors
  /// are moved to the start of the fresh checkpoint.
  pub fn clear(&self, seqno: Seqno) {
    let mut inner = self.inner.lock();
    inner.clear(seqno);
    debug!(partition = self.partition, seqno, "checkpoint log cleared");
  }
}

impl ManagerInner {
  fn free_unreferenced(&mut self) -> (usize, usize) {
    let oldest_referenced = self.oldest_referenced();
    let mut removed = 0;
    let mut items = 0;
    while let Some(front) = self.closed.front() {
      if front.id() >= oldest_referenced {
        break;
      }
      if self.config.keep_closed && self.num_checkpoints() <= self.config.max_checkpoints {
        break;
      }
      if let Some(checkpoint) = self.closed.pop_front() {
        removed += 1;
        items += checkpoint.num_items();
      }
    }
    (removed, items)
  }

  /// Collapse the run of closed checkpoints the flusher has moved past into
  /// its newest member. Returns checkpoints folded away and items dropped.
  fn merge_closed(&mut self) -> (usize, usize) {
    let bound = self
      .cursors
      .get(PERSISTENCE_CURSOR_NAME)
      .filter(|cursor| cursor.kind == CursorKind::Persistence)
      .map(|cursor| cursor.checkpoint_id)
      .into_iter()
      .chain(self.persistence_floor)
      .min()
      .unwrap_or_else(|| self.open.id());
    let run_len = self
      .closed
      .iter()
      .take_while(|checkpoint| checkpoint.id() < bound)
      .count();
    if run_len < 2 {
      return (0, 0);
    }

    let run: Vec<Checkpoint> = self.closed.drain(..run_len).collect();
    let mut merged = Checkpoint::merge(run);
    let merged_id = merged.checkpoint.id();

    let mut refs = 0;
    for cursor in self.cursors.values_mut() {
      let Some((_, map)) = merged
        .offset_maps
        .iter()
        .find(|(id, _)| *id == cursor.checkpoint_id)
      else {
        continue;
      };
      cursor.checkpoint_id = merged_id;
      cursor.offset = map.get(cursor.offset).copied().unwrap_or(0);
      cursor.consumed = merged.checkpoint.items_through(cursor.offset);
      refs += 1;
    }
    merged.checkpoint.set_cursor_refs(refs);

    debug!(
      into = merged_id,
      folded = run_len - 1,
      dropped = merged.dropped_items,
      cursors = refs,
      "replica checkpoints merged"
    );
    self.closed.push_front(merged.checkpoint);
    (run_len - 1, merged.dropped_items)
  }

  fn clear(&mut self, seqno: Seqno) {
    self.allocator.reset(seqno);
    let next_id = self.open.id() + 1;
    let boundary = seqno + 1;
    self.closed.clear();
    self.open = Checkpoint::new(next_id, boundary, boundary, boundary);

    for cursor in self.cursors.values_mut() {
      cursor.checkpoint_id = next_id;
      cursor.offset = 0;
      cursor.consumed = 0;
      cursor.last_seqno = cursor.last_seqno.min(seqno);
    }
    self.open.set_cursor_refs(self.cursors.len());
    self.persistence_floor = None;
  }
}
