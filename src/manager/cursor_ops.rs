//! Cursor registration and reads.

use std::sync::Arc;
use tracing::{debug, trace};

use super::{CheckpointManager, ManagerInner};
use crate::cursor::{
  Cursor, CursorItems, CursorKind, CursorPosition, CursorRegistration, NextItem,
  PERSISTENCE_CURSOR_NAME,
};
use crate::entry::{Entry, EntryKind};
use crate::error::{KiteError, Result};
use crate::types::{CheckpointId, Seqno, SnapshotRange};

/// Scratch position used while walking the log.
#[derive(Debug, Clone, Copy)]
struct Walk {
  checkpoint_id: CheckpointId,
  offset: usize,
  consumed: usize,
}

fn deliverable(kind: EntryKind, send_end_markers: bool) -> bool {
  match kind {
    EntryKind::SegmentEmpty => false,
    EntryKind::SegmentEnd => send_end_markers,
    EntryKind::Mutation
    | EntryKind::Deletion
    | EntryKind::SegmentStart
    | EntryKind::SetPartitionState(_)
    | EntryKind::SystemEvent(_) => true,
  }
}

/// Data at or below the cursor's high-water mark was delivered already or
/// sits below the seqno it registered at.
fn behind_high_water(entry: &Entry, last_seqno: Seqno) -> bool {
  !entry.is_meta() && entry.seqno() <= last_seqno
}

fn ensure_not_reserved(name: &str) -> Result<()> {
  if name == PERSISTENCE_CURSOR_NAME {
    return Err(KiteError::ReservedCursorName(name.to_string()));
  }
  Ok(())
}

impl CheckpointManager {
  /// Register (or re-register) a replication cursor so its first data entry
  /// is the lowest live seqno at or above `start_seqno`.
  ///
  /// Backfill is required when the log no longer holds `start_seqno` itself
  /// but the partition has already written it. A `start_seqno` beyond the
  /// high seqno is honoured: the cursor skips the seqnos below it.
  pub fn register_cursor_by_seqno(
    &self,
    name: &str,
    start_seqno: Seqno,
    send_end_markers: bool,
  ) -> Result<CursorRegistration> {
    ensure_not_reserved(name)?;
    let mut inner = self.inner.lock();
    let start = start_seqno.max(1);
    let high = inner.allocator.high_seqno();

    let (checkpoint_id, offset, first_seqno) = inner.locate(start, high);
    let consumed = inner.checkpoint(checkpoint_id)?.items_through(offset);
    inner.install_cursor(
      name,
      Cursor::new(
        CursorKind::Replication,
        checkpoint_id,
        offset,
        consumed,
        send_end_markers,
        start - 1,
      ),
    )?;

    let backfill_required = first_seqno > start && start <= high;
    debug!(
      partition = self.partition,
      cursor = name,
      start_seqno,
      first_seqno,
      checkpoint_id,
      backfill_required,
      "cursor registered"
    );
    Ok(CursorRegistration {
      first_seqno,
      backfill_required,
    })
  }

  /// Register a replication cursor at the tail of the open checkpoint with
  /// nothing outstanding.
  pub fn register_cursor_at_head(
    &self,
    name: &str,
    send_end_markers: bool,
  ) -> Result<CursorRegistration> {
    ensure_not_reserved(name)?;
    let mut inner = self.inner.lock();
    let high = inner.allocator.high_seqno();
    let checkpoint_id = inner.open.id();
    let offset = inner.open.last_offset();
    let consumed = inner.open.num_items();
    inner.install_cursor(
      name,
      Cursor::new(
        CursorKind::Replication,
        checkpoint_id,
        offset,
        consumed,
        send_end_markers,
        high,
      ),
    )?;
    debug!(
      partition = self.partition,
      cursor = name,
      checkpoint_id,
      "cursor registered at head"
    );
    Ok(CursorRegistration {
      first_seqno: high + 1,
      backfill_required: false,
    })
  }

  /// Drop a replication cursor. Returns false if no cursor had that name.
  pub fn remove_cursor(&self, name: &str) -> Result<bool> {
    ensure_not_reserved(name)?;
    let mut inner = self.inner.lock();
    let Some(cursor) = inner.cursors.shift_remove(name) else {
      return Ok(false);
    };
    inner.checkpoint_mut(cursor.checkpoint_id)?.detach_cursor();
    debug!(partition = self.partition, cursor = name, "cursor removed");
    Ok(true)
  }

  /// Read from `name` up to `limit` delivered entries. A read never stops
  /// inside a checkpoint: once the limit is reached it continues to the next
  /// checkpoint boundary.
  pub fn get_items_for_cursor(&self, name: &str, limit: Option<usize>) -> Result<CursorItems> {
    let mut inner = self.inner.lock();
    inner.pin_persistence_floor(name)?;
    let read = inner.read(name, limit)?;
    trace!(
      partition = self.partition,
      cursor = name,
      items = read.items.len(),
      range = %read.range,
      "cursor read"
    );
    Ok(read)
  }

  pub fn get_all_items_for_cursor(&self, name: &str) -> Result<CursorItems> {
    self.get_items_for_cursor(name, None)
  }

  /// Advance `name` by one delivered entry.
  pub fn next_item(&self, name: &str) -> Result<Option<NextItem>> {
    let mut inner = self.inner.lock();
    inner.pin_persistence_floor(name)?;
    inner.next_item(name)
  }

  /// The flusher has made everything it read durable; checkpoints behind the
  /// persistence cursor are no longer pinned.
  pub fn items_persisted(&self) {
    let mut inner = self.inner.lock();
    if let Some(floor) = inner.persistence_floor.take() {
      trace!(partition = self.partition, floor, "persistence floor released");
    }
  }

  /// Items `name` has yet to consume.
  pub fn num_items_for_cursor(&self, name: &str) -> Result<usize> {
    let inner = self.inner.lock();
    let cursor = inner.cursor(name)?;
    Ok(inner.outstanding(cursor))
  }

  /// Slot-by-slot recount of what `name` has yet to consume, independent of
  /// the cached counters behind [`num_items_for_cursor`](Self::num_items_for_cursor).
  pub fn recount_items_for_cursor(&self, name: &str) -> Result<usize> {
    let inner = self.inner.lock();
    let cursor = inner.cursor(name)?;
    Ok(
      inner
        .checkpoints()
        .filter(|checkpoint| checkpoint.id() >= cursor.checkpoint_id)
        .flat_map(|checkpoint| {
          let skip = if checkpoint.id() == cursor.checkpoint_id {
            cursor.offset + 1
          } else {
            0
          };
          checkpoint
            .live_entries()
            .filter(move |(offset, _)| *offset >= skip)
        })
        .filter(|(_, entry)| !entry.is_meta())
        .count(),
    )
  }

  pub fn checkpoint_id_for_cursor(&self, name: &str) -> Result<CheckpointId> {
    Ok(self.inner.lock().cursor(name)?.checkpoint_id)
  }

  pub fn cursor_position(&self, name: &str) -> Result<CursorPosition> {
    Ok(self.inner.lock().cursor(name)?.position())
  }
}

impl ManagerInner {
  /// First checkpoint holding a data entry at or above `start`, the offset a
  /// cursor must sit at to deliver it next, and its seqno. Without such an
  /// entry the cursor lands in the open checkpoint behind every slot below
  /// `start` and will next deliver the later of `start` and `high + 1`.
  fn locate(&self, start: Seqno, high: Seqno) -> (CheckpointId, usize, Seqno) {
    for checkpoint in self.checkpoints() {
      let mut before = 0;
      for (offset, entry) in checkpoint.live_entries() {
        if !entry.is_meta() && entry.seqno() >= start {
          return (checkpoint.id(), before, entry.seqno());
        }
        if entry.seqno() < start {
          before = offset;
        }
      }
    }
    let before = self
      .open
      .live_entries()
      .filter(|(_, entry)| entry.seqno() < start)
      .map(|(offset, _)| offset)
      .last()
      .unwrap_or(0);
    (self.open.id(), before, start.max(high + 1))
  }

  fn install_cursor(&mut self, name: &str, cursor: Cursor) -> Result<()> {
    let checkpoint_id = cursor.checkpoint_id;
    if let Some(previous) = self.cursors.insert(name.to_string(), cursor) {
      self.checkpoint_mut(previous.checkpoint_id)?.detach_cursor();
    }
    self.checkpoint_mut(checkpoint_id)?.attach_cursor();
    self.debug_check_refs();
    Ok(())
  }

  fn pin_persistence_floor(&mut self, name: &str) -> Result<()> {
    let cursor = self.cursor(name)?;
    if cursor.kind == CursorKind::Persistence {
      let checkpoint_id = cursor.checkpoint_id;
      self.persistence_floor.get_or_insert(checkpoint_id);
    }
    Ok(())
  }

  fn walk_from(&self, name: &str) -> Result<(Walk, bool, Seqno)> {
    let cursor = self.cursor(name)?;
    Ok((
      Walk {
        checkpoint_id: cursor.checkpoint_id,
        offset: cursor.offset,
        consumed: cursor.consumed,
      },
      cursor.send_end_markers,
      cursor.last_seqno,
    ))
  }

  /// Consume the next live slot. Consuming an end marker moves the walk to
  /// the start of the following checkpoint.
  fn step(&self, walk: &mut Walk) -> Result<Option<Arc<Entry>>> {
    let checkpoint = self.checkpoint(walk.checkpoint_id)?;
    let Some(next) = checkpoint.next_live(walk.offset) else {
      return Ok(None);
    };
    let entry = checkpoint.entry(next).cloned().ok_or_else(|| {
      KiteError::Internal(format!(
        "slot {next} of checkpoint {} vanished",
        walk.checkpoint_id
      ))
    })?;

    if entry.kind() == EntryKind::SegmentEnd {
      walk.checkpoint_id = self.successor(walk.checkpoint_id)?;
      walk.offset = 0;
      walk.consumed = 0;
    } else {
      walk.offset = next;
      if !entry.is_meta() {
        walk.consumed += 1;
      }
    }
    Ok(Some(entry))
  }

  fn finish_walk(&mut self, name: &str, walk: Walk, last_seqno: Seqno) -> Result<()> {
    self.reposition(name, walk.checkpoint_id, walk.offset, walk.consumed)?;
    if let Some(cursor) = self.cursors.get_mut(name) {
      cursor.last_seqno = last_seqno;
    }
    self.debug_check_refs();
    Ok(())
  }

  fn read(&mut self, name: &str, limit: Option<usize>) -> Result<CursorItems> {
    let (mut walk, send_end_markers, previous) = self.walk_from(name)?;
    let mut items = Vec::new();
    let mut low: Option<Seqno> = None;
    let mut high: Option<Seqno> = None;

    while let Some(entry) = self.step(&mut walk)? {
      let kind = entry.kind();
      if behind_high_water(&entry, previous) {
        continue;
      }
      if !entry.is_meta() {
        low.get_or_insert(entry.seqno());
        high = Some(entry.seqno());
      }
      if deliverable(kind, send_end_markers) {
        items.push(entry);
      }
      if kind == EntryKind::SegmentEnd && limit.is_some_and(|limit| items.len() >= limit) {
        break;
      }
    }

    let last_seqno = high.unwrap_or(previous);
    self.finish_walk(name, walk, last_seqno)?;
    Ok(CursorItems {
      items,
      range: SnapshotRange::new(low.unwrap_or(previous), last_seqno),
    })
  }

  fn next_item(&mut self, name: &str) -> Result<Option<NextItem>> {
    let (mut walk, send_end_markers, previous) = self.walk_from(name)?;
    let mut found = None;

    while let Some(entry) = self.step(&mut walk)? {
      let kind = entry.kind();
      if !deliverable(kind, send_end_markers) || behind_high_water(&entry, previous) {
        continue;
      }
      let is_last_mutation = kind == EntryKind::SegmentEnd
        || self
          .checkpoint(walk.checkpoint_id)?
          .no_items_after(walk.offset);
      found = Some(NextItem {
        entry,
        is_last_mutation,
      });
      break;
    }

    let last_seqno = match &found {
      Some(item) if !item.entry.is_meta() => item.entry.seqno(),
      _ => previous,
    };
    self.finish_walk(name, walk, last_seqno)?;
    Ok(found)
  }
}
