//! Enqueue path: stamping, deduplication and checkpoint rotation.

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

use super::{CheckpointManager, ManagerInner};
use crate::checkpoint::{Checkpoint, QueueSlot};
use crate::clock::Stamp;
use crate::entry::{Entry, EntryKind, SystemEvent};
use crate::error::{KiteError, Result};
use crate::stats::CheckpointStats;
use crate::types::{Cas, CasMode, CheckpointId, PartitionState, Seqno, SeqnoMode};

/// Outcome of a successful enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Enqueued {
  pub seqno: Seqno,
  pub cas: Cas,
  /// False when the entry replaced an older version of its key in the open
  /// checkpoint.
  pub new_item: bool,
}

impl CheckpointManager {
  /// Stamp `entry` and append it to the open checkpoint.
  ///
  /// With [`SeqnoMode::Provided`] the entry's own seqno must be above the
  /// current high seqno. With [`CasMode::Generate`] a non-zero CAS already
  /// carried by the entry is treated as a lower bound for the new CAS.
  pub fn enqueue(
    &self,
    entry: Entry,
    seqno_mode: SeqnoMode,
    cas_mode: CasMode,
  ) -> Result<Enqueued> {
    let kind = entry.kind();
    if kind.is_meta() {
      return Err(KiteError::InvalidEntry(format!(
        "{kind} entries are written by the checkpoint manager"
      )));
    }

    let mut inner = self.inner.lock();
    if inner.state == PartitionState::Dead {
      return Err(KiteError::InvalidState(format!(
        "partition {} is dead",
        self.partition
      )));
    }
    if seqno_mode == SeqnoMode::Provided && entry.seqno() <= inner.allocator.high_seqno() {
      return Err(KiteError::SeqnoRegression {
        provided: entry.seqno(),
        high: inner.allocator.high_seqno(),
      });
    }

    if inner.state == PartitionState::Active
      && inner.rotation_due(Instant::now())
      && inner.can_create_checkpoint()
    {
      inner.rotate(&self.stats);
    }

    let mut entry = entry;
    let stamp = inner.stamp(&entry, seqno_mode, cas_mode)?;
    entry.stamp(stamp.seqno, stamp.cas);

    let slot = inner.open.queue(Arc::new(entry));
    let new_item = match slot {
      QueueSlot::New => true,
      QueueSlot::Replaced { stale, offset } => {
        inner.shift_cursors_past(stale);
        self.stats.record_deduplicated();
        trace!(
          partition = self.partition,
          seqno = stamp.seqno,
          stale,
          offset,
          "deduplicated key in open checkpoint"
        );
        if inner.open.needs_compaction() {
          inner.compact_open();
        }
        false
      }
    };
    self.stats.record_enqueued();
    inner.debug_check_refs();

    Ok(Enqueued {
      seqno: stamp.seqno,
      cas: stamp.cas,
      new_item,
    })
  }

  /// Enqueue with a generated seqno and CAS.
  pub fn queue_dirty(&self, entry: Entry) -> Result<Enqueued> {
    self.enqueue(entry, SeqnoMode::Generate, CasMode::Generate)
  }

  pub fn queue_system_event(&self, event: SystemEvent) -> Result<Enqueued> {
    self.enqueue(
      Entry::system_event(event),
      SeqnoMode::Generate,
      CasMode::Generate,
    )
  }

  /// Record a partition state change in the log and apply it. The marker
  /// takes the seqno the next data entry will receive.
  pub fn queue_set_partition_state(&self, state: PartitionState) {
    let mut inner = self.inner.lock();
    let seqno = inner.allocator.high_seqno() + 1;
    inner.state = state;
    inner.open.queue(Arc::new(Entry::meta(
      EntryKind::SetPartitionState(state),
      seqno,
    )));
    debug!(partition = self.partition, %state, seqno, "partition state queued");
  }

  /// Close the open checkpoint and start a new one, regardless of the
  /// rotation policy. An open checkpoint without items is left alone.
  /// Returns the id of the open checkpoint afterwards.
  pub fn create_new_checkpoint(&self) -> CheckpointId {
    let mut inner = self.inner.lock();
    if inner.open.num_items() == 0 {
      return inner.open.id();
    }
    inner.rotate(&self.stats)
  }
}

impl ManagerInner {
  pub(crate) fn rotation_due(&self, now: Instant) -> bool {
    let items = self.open.num_items();
    if self.config.item_based && items >= self.config.max_items {
      return true;
    }
    items > 0 && now.duration_since(self.open.created_at()) >= self.config.period()
  }

  /// Policy rotation is suppressed once the checkpoint count has reached its
  /// bound and the oldest checkpoint still has cursors in it.
  pub(crate) fn can_create_checkpoint(&self) -> bool {
    self.num_checkpoints() < self.config.max_checkpoints || self.oldest().cursor_refs() == 0
  }

  fn stamp(&mut self, entry: &Entry, seqno_mode: SeqnoMode, cas_mode: CasMode) -> Result<Stamp> {
    let hint = (entry.cas() != 0).then_some(entry.cas());
    let stamp = match (seqno_mode, cas_mode) {
      (SeqnoMode::Generate, CasMode::Generate) => self.allocator.allocate(hint),
      (SeqnoMode::Generate, CasMode::Provided) => {
        let seqno = self.allocator.high_seqno() + 1;
        self.allocator.accept_seqno(seqno)?;
        self.allocator.observe_cas(entry.cas());
        Stamp {
          seqno,
          cas: entry.cas(),
        }
      }
      (SeqnoMode::Provided, CasMode::Generate) => {
        self.allocator.accept_seqno(entry.seqno())?;
        Stamp {
          seqno: entry.seqno(),
          cas: self.allocator.next_cas(hint),
        }
      }
      (SeqnoMode::Provided, CasMode::Provided) => {
        self.allocator.accept_seqno(entry.seqno())?;
        self.allocator.observe_cas(entry.cas());
        Stamp {
          seqno: entry.seqno(),
          cas: entry.cas(),
        }
      }
    };
    Ok(stamp)
  }

  /// A slot in the open checkpoint was tombstoned; cursors that had already
  /// consumed it lose one consumed item, and a cursor sitting on it steps
  /// back to the previous live slot.
  fn shift_cursors_past(&mut self, stale: usize) {
    let open_id = self.open.id();
    let previous = self.open.prev_live(stale).unwrap_or(0);
    for cursor in self.cursors.values_mut() {
      if cursor.checkpoint_id != open_id || cursor.offset < stale {
        continue;
      }
      cursor.consumed = cursor.consumed.saturating_sub(1);
      if cursor.offset == stale {
        cursor.offset = previous;
      }
    }
  }

  /// Squeeze tombstones out of the open checkpoint. Cursors only ever sit on
  /// live slots, so their consumed counts carry over unchanged.
  fn compact_open(&mut self) {
    let open_id = self.open.id();
    let reclaimed = self.open.tombstones();
    let map = self.open.compact();
    for cursor in self.cursors.values_mut() {
      if cursor.checkpoint_id == open_id {
        cursor.offset = map.get(cursor.offset).copied().unwrap_or(0);
      }
    }
    trace!(
      checkpoint_id = open_id,
      reclaimed,
      slots = self.open.len(),
      "open checkpoint compacted"
    );
  }

  /// Close the open checkpoint and open its successor. Cursors that have
  /// consumed everything and do not want end markers move straight into the
  /// new checkpoint.
  pub(crate) fn rotate(&mut self, stats: &CheckpointStats) -> CheckpointId {
    let high = self.allocator.high_seqno();
    let boundary = high + 1;
    let next_id = self.open.id() + 1;
    let fresh = Checkpoint::new(next_id, boundary, boundary, boundary);

    let mut closing = std::mem::replace(&mut self.open, fresh);
    let closing_id = closing.id();
    let items = closing.num_items();
    closing.close(boundary);
    let end_offset = closing.last_offset();

    let mut moved = 0;
    for cursor in self.cursors.values_mut() {
      if cursor.checkpoint_id != closing_id || cursor.send_end_markers {
        continue;
      }
      if closing.next_live(cursor.offset) == Some(end_offset) {
        cursor.checkpoint_id = next_id;
        cursor.offset = 0;
        cursor.consumed = 0;
        moved += 1;
      }
    }
    for _ in 0..moved {
      closing.detach_cursor();
      self.open.attach_cursor();
    }

    self.closed.push_back(closing);
    stats.record_checkpoint_created();
    debug!(
      closed = closing_id,
      opened = next_id,
      items,
      high_seqno = high,
      cursors_moved = moved,
      "checkpoint rotated"
    );
    next_id
  }
}
