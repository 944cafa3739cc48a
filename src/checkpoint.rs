//! A single checkpoint: an ordered run of log entries plus a key index.
//!
//! Slots are append-only. Deduplicating a key tombstones the stale slot in
//! place and appends the fresh entry at the tail. Once tombstones outnumber
//! live slots the open checkpoint is compacted and every offset held against
//! it must be remapped. Every checkpoint starts with a `SegmentEmpty` dummy at
//! offset 0 followed by `SegmentStart`; a closed checkpoint always ends with
//! `SegmentEnd`.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

use crate::entry::{Entry, EntryKind};
use crate::key::DocKey;
use crate::types::{CheckpointId, Seqno, SnapshotRange};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointState {
  Open,
  Closed,
}

/// Where `Checkpoint::queue` placed an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueueSlot {
  New,
  Replaced { stale: usize, offset: usize },
}

#[derive(Debug)]
pub struct Checkpoint {
  id: CheckpointId,
  state: CheckpointState,
  entries: Vec<Option<Arc<Entry>>>,
  key_index: HashMap<DocKey, usize>,
  snapshot_start: Seqno,
  snapshot_end: Seqno,
  /// Live non-meta entries.
  num_items: usize,
  /// Live entries other than the empty dummy and the end marker.
  num_queued: usize,
  tombstones: usize,
  cursor_refs: usize,
  created_at: Instant,
}

/// Result of collapsing a run of closed checkpoints into one.
#[derive(Debug)]
pub(crate) struct MergedCheckpoint {
  pub checkpoint: Checkpoint,
  /// Old checkpoint id and, per old offset, the offset of the last surviving
  /// slot at or before it.
  pub offset_maps: Vec<(CheckpointId, Vec<usize>)>,
  pub dropped_items: usize,
}

impl Checkpoint {
  pub(crate) fn new(
    id: CheckpointId,
    snapshot_start: Seqno,
    snapshot_end: Seqno,
    boundary_seqno: Seqno,
  ) -> Self {
    Self {
      id,
      state: CheckpointState::Open,
      entries: vec![
        Some(Arc::new(Entry::meta(EntryKind::SegmentEmpty, boundary_seqno))),
        Some(Arc::new(Entry::meta(EntryKind::SegmentStart, boundary_seqno))),
      ],
      key_index: HashMap::new(),
      snapshot_start,
      snapshot_end,
      num_items: 0,
      num_queued: 1,
      tombstones: 0,
      cursor_refs: 0,
      created_at: Instant::now(),
    }
  }

  pub fn id(&self) -> CheckpointId {
    self.id
  }

  pub fn state(&self) -> CheckpointState {
    self.state
  }

  pub fn is_open(&self) -> bool {
    self.state == CheckpointState::Open
  }

  /// Live non-meta entries.
  pub fn num_items(&self) -> usize {
    self.num_items
  }

  pub(crate) fn num_queued(&self) -> usize {
    self.num_queued
  }

  /// Physical slots, tombstones included.
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.num_items == 0
  }

  pub fn snapshot_range(&self) -> SnapshotRange {
    SnapshotRange::new(self.snapshot_start, self.snapshot_end)
  }

  pub fn created_at(&self) -> Instant {
    self.created_at
  }

  pub fn cursor_refs(&self) -> usize {
    self.cursor_refs
  }

  pub(crate) fn attach_cursor(&mut self) {
    self.cursor_refs += 1;
  }

  pub(crate) fn detach_cursor(&mut self) {
    debug_assert!(self.cursor_refs > 0, "checkpoint {} has no cursors", self.id);
    self.cursor_refs = self.cursor_refs.saturating_sub(1);
  }

  pub(crate) fn set_cursor_refs(&mut self, refs: usize) {
    self.cursor_refs = refs;
  }

  /// Live entry at `offset`; `None` for tombstones and out-of-range offsets.
  pub fn entry(&self, offset: usize) -> Option<&Arc<Entry>> {
    self.entries.get(offset).and_then(Option::as_ref)
  }

  pub fn live_entries(&self) -> impl Iterator<Item = (usize, &Arc<Entry>)> + '_ {
    self
      .entries
      .iter()
      .enumerate()
      .filter_map(|(offset, slot)| slot.as_ref().map(|entry| (offset, entry)))
  }

  /// Offset of the live entry currently indexed under `key`.
  pub fn offset_of(&self, key: &DocKey) -> Option<usize> {
    self.key_index.get(key).copied()
  }

  /// Seqno of the first live non-meta entry.
  pub fn low_seqno(&self) -> Option<Seqno> {
    self
      .live_entries()
      .find(|(_, entry)| !entry.is_meta())
      .map(|(_, entry)| entry.seqno())
  }

  /// Seqno of the last live non-meta entry.
  pub fn high_seqno(&self) -> Option<Seqno> {
    self
      .entries
      .iter()
      .rev()
      .flatten()
      .find(|entry| !entry.is_meta())
      .map(|entry| entry.seqno())
  }

  pub(crate) fn next_live(&self, offset: usize) -> Option<usize> {
    (offset + 1..self.entries.len()).find(|&next| self.entries[next].is_some())
  }

  pub(crate) fn prev_live(&self, offset: usize) -> Option<usize> {
    (0..offset.min(self.entries.len()))
      .rev()
      .find(|&prev| self.entries[prev].is_some())
  }

  pub(crate) fn tombstones(&self) -> usize {
    self.tombstones
  }

  pub(crate) fn needs_compaction(&self) -> bool {
    self.tombstones > self.entries.len() - self.tombstones
  }

  /// Drop tombstoned slots. Returns, per old offset, the new offset of the
  /// last live slot at or before it.
  pub(crate) fn compact(&mut self) -> Vec<usize> {
    let mut map = Vec::with_capacity(self.entries.len());
    let mut kept = Vec::with_capacity(self.entries.len() - self.tombstones);
    for slot in self.entries.drain(..) {
      if slot.is_some() {
        kept.push(slot);
      }
      map.push(kept.len().saturating_sub(1));
    }
    self.entries = kept;
    for offset in self.key_index.values_mut() {
      *offset = map[*offset];
    }
    self.tombstones = 0;
    map
  }

  /// Index of the last slot, which is always live.
  pub(crate) fn last_offset(&self) -> usize {
    self.entries.len() - 1
  }

  /// Live non-meta entries in `[0, offset]`.
  pub(crate) fn items_through(&self, offset: usize) -> usize {
    self
      .entries
      .iter()
      .take(offset + 1)
      .flatten()
      .filter(|entry| !entry.is_meta())
      .count()
  }

  /// True when no live non-meta entry follows `offset`.
  pub(crate) fn no_items_after(&self, offset: usize) -> bool {
    self
      .entries
      .iter()
      .skip(offset + 1)
      .flatten()
      .all(|entry| entry.is_meta())
  }

  pub(crate) fn queue(&mut self, entry: Arc<Entry>) -> QueueSlot {
    debug_assert!(self.is_open(), "queue into closed checkpoint {}", self.id);
    let offset = self.entries.len();
    let kind = entry.kind();
    if !kind.is_meta() {
      self.snapshot_end = self.snapshot_end.max(entry.seqno());
    }

    let slot = match (kind.is_dedupable(), entry.key()) {
      (true, Some(key)) => match self.key_index.insert(key.clone(), offset) {
        Some(stale) => {
          self.entries[stale] = None;
          self.tombstones += 1;
          QueueSlot::Replaced { stale, offset }
        }
        None => {
          self.num_items += 1;
          self.num_queued += 1;
          QueueSlot::New
        }
      },
      _ => {
        if !kind.is_meta() {
          self.num_items += 1;
        }
        self.num_queued += 1;
        QueueSlot::New
      }
    };

    self.entries.push(Some(entry));
    slot
  }

  pub(crate) fn close(&mut self, boundary_seqno: Seqno) {
    debug_assert!(self.is_open(), "checkpoint {} closed twice", self.id);
    self
      .entries
      .push(Some(Arc::new(Entry::meta(EntryKind::SegmentEnd, boundary_seqno))));
    self.state = CheckpointState::Closed;
  }

  /// Collapse a run of closed checkpoints (oldest first) into one checkpoint
  /// carrying the newest id. Interior boundary markers are dropped and a key
  /// keeps only its newest version across the run.
  pub(crate) fn merge(run: Vec<Checkpoint>) -> MergedCheckpoint {
    debug_assert!(run.len() > 1);
    debug_assert!(run.iter().all(|checkpoint| !checkpoint.is_open()));
    let last = run.len() - 1;

    let mut newest: HashMap<&DocKey, (usize, usize)> = HashMap::new();
    for (index, checkpoint) in run.iter().enumerate() {
      for (offset, entry) in checkpoint.live_entries() {
        if let (true, Some(key)) = (entry.kind().is_dedupable(), entry.key()) {
          newest.insert(key, (index, offset));
        }
      }
    }

    let mut merged = Checkpoint {
      id: run[last].id,
      state: CheckpointState::Closed,
      entries: Vec::new(),
      key_index: HashMap::new(),
      snapshot_start: run[0].snapshot_start,
      snapshot_end: run[last].snapshot_end,
      num_items: 0,
      num_queued: 0,
      tombstones: 0,
      cursor_refs: 0,
      created_at: run[last].created_at,
    };
    let mut offset_maps = Vec::with_capacity(run.len());
    let mut dropped_items = 0;

    for (index, checkpoint) in run.iter().enumerate() {
      let mut map = Vec::with_capacity(checkpoint.entries.len());
      for (offset, slot) in checkpoint.entries.iter().enumerate() {
        if let Some(entry) = slot {
          let keep = match entry.kind() {
            EntryKind::SegmentEmpty | EntryKind::SegmentStart => index == 0,
            EntryKind::SegmentEnd => index == last,
            EntryKind::Mutation | EntryKind::Deletion => entry
              .key()
              .is_some_and(|key| newest.get(key) == Some(&(index, offset))),
            EntryKind::SetPartitionState(_) | EntryKind::SystemEvent(_) => true,
          };
          if keep {
            merged.push_merged(Arc::clone(entry));
          } else if !entry.is_meta() {
            dropped_items += 1;
          }
        }
        map.push(merged.entries.len().saturating_sub(1));
      }
      offset_maps.push((checkpoint.id, map));
    }

    MergedCheckpoint {
      checkpoint: merged,
      offset_maps,
      dropped_items,
    }
  }

  fn push_merged(&mut self, entry: Arc<Entry>) {
    let offset = self.entries.len();
    let kind = entry.kind();
    if let (true, Some(key)) = (kind.is_dedupable(), entry.key()) {
      self.key_index.insert(key.clone(), offset);
    }
    if !kind.is_meta() {
      self.num_items += 1;
    }
    if !matches!(kind, EntryKind::SegmentEmpty | EntryKind::SegmentEnd) {
      self.num_queued += 1;
    }
    self.entries.push(Some(entry));
  }

  /// Recount cached counters and the key index against the slots.
  pub(crate) fn check_consistency(&self) -> Result<(), String> {
    let live_items = self
      .entries
      .iter()
      .flatten()
      .filter(|entry| !entry.is_meta())
      .count();
    if live_items != self.num_items {
      return Err(format!(
        "checkpoint {} counts {} items but holds {live_items}",
        self.id, self.num_items
      ));
    }
    let tombstones = self.entries.iter().filter(|slot| slot.is_none()).count();
    if tombstones != self.tombstones {
      return Err(format!(
        "checkpoint {} counts {} tombstones but holds {tombstones}",
        self.id, self.tombstones
      ));
    }
    for (key, &offset) in &self.key_index {
      match self.entry(offset) {
        Some(entry) if entry.key() == Some(key) => {}
        _ => {
          return Err(format!(
            "checkpoint {} indexes {key} at dead offset {offset}",
            self.id
          ))
        }
      }
    }
    let first_two = (
      self.entry(0).map(|entry| entry.kind()),
      self.entry(1).map(|entry| entry.kind()),
    );
    if first_two != (Some(EntryKind::SegmentEmpty), Some(EntryKind::SegmentStart)) {
      return Err(format!("checkpoint {} lost its leading markers", self.id));
    }
    let ends_closed = self
      .entry(self.last_offset())
      .is_some_and(|entry| entry.kind() == EntryKind::SegmentEnd);
    if ends_closed == self.is_open() {
      return Err(format!(
        "checkpoint {} state {:?} disagrees with its trailing marker",
        self.id, self.state
      ));
    }
    Ok(())
  }
}
