//! Draining the persistence cursor into a durable store.

use hashbrown::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cursor::{CursorItems, PERSISTENCE_CURSOR_NAME};
use crate::entry::{Entry, EntryKind};
use crate::error::{KiteError, Result};
use crate::key::DocKey;
use crate::manager::CheckpointManager;
use crate::types::{PartitionId, PartitionState, SnapshotRange};

/// Durable store fed by the flusher.
pub trait FlushSink: Send {
  /// Stage one entry. Returns false if the store rejected it; the flusher
  /// offers rejected entries again on its next call.
  fn persist(&mut self, entry: &Entry) -> bool;

  /// Make every staged entry of `batch` durable.
  fn commit(&mut self, batch: &FlushBatch) -> Result<()>;

  /// Discard everything staged since the last commit.
  fn rollback(&mut self);
}

/// One persistence read, reduced to what the store needs to write.
#[derive(Debug, Clone)]
pub struct FlushBatch {
  pub partition: PartitionId,
  /// Newest version of each key, in seqno order.
  pub entries: Vec<Arc<Entry>>,
  pub range: SnapshotRange,
  /// Last partition state marker seen in the read.
  pub partition_state: Option<PartitionState>,
}

impl FlushBatch {
  pub fn from_items(partition: PartitionId, read: CursorItems) -> Self {
    let mut partition_state = None;
    let mut newest: HashMap<DocKey, usize> = HashMap::new();
    let mut data = Vec::new();

    for entry in read.items {
      match entry.kind() {
        EntryKind::SetPartitionState(state) => partition_state = Some(state),
        _ if entry.is_meta() => {}
        _ => {
          if let Some(key) = entry.key() {
            newest.insert(key.clone(), data.len());
          }
          data.push(entry);
        }
      }
    }

    let entries = data
      .into_iter()
      .enumerate()
      .filter(|(index, entry)| {
        entry
          .key()
          .map_or(true, |key| newest.get(key) == Some(index))
      })
      .map(|(_, entry)| entry)
      .collect();

    Self {
      partition,
      entries,
      range: read.range,
      partition_state,
    }
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty() && self.partition_state.is_none()
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOutcome {
  pub items_flushed: usize,
  pub items_rejected: usize,
  pub range: Option<SnapshotRange>,
}

/// Moves batches from a manager's persistence cursor into a [`FlushSink`].
///
/// A batch whose commit fails is kept and retried on the next call, as are
/// entries the sink rejected. The manager's persistence floor stays pinned
/// until every entry of the batch is durable.
#[derive(Debug, Default)]
pub struct Flusher {
  batch_limit: Option<usize>,
  pending: Option<FlushBatch>,
}

impl Flusher {
  pub fn new(batch_limit: Option<usize>) -> Self {
    Self {
      batch_limit,
      pending: None,
    }
  }

  pub fn has_pending(&self) -> bool {
    self.pending.is_some()
  }

  pub fn flush_once<S: FlushSink + ?Sized>(
    &mut self,
    manager: &CheckpointManager,
    sink: &mut S,
  ) -> Result<FlushOutcome> {
    let batch = match self.pending.take() {
      Some(batch) => batch,
      None => {
        let read = manager.get_items_for_cursor(PERSISTENCE_CURSOR_NAME, self.batch_limit)?;
        FlushBatch::from_items(manager.partition(), read)
      }
    };

    if batch.is_empty() {
      manager.items_persisted();
      return Ok(FlushOutcome::default());
    }

    let rejected: Vec<Arc<Entry>> = batch
      .entries
      .iter()
      .filter(|entry| !sink.persist(entry))
      .cloned()
      .collect();
    let items_rejected = rejected.len();

    if let Err(error) = sink.commit(&batch) {
      sink.rollback();
      warn!(
        partition = batch.partition,
        items = batch.len(),
        error = %error,
        "flush commit failed; batch retained"
      );
      self.pending = Some(batch);
      return Err(error);
    }

    let retry_range = rejected
      .first()
      .zip(rejected.last())
      .map(|(first, last)| SnapshotRange::new(first.seqno(), last.seqno()));
    if let Some(range) = retry_range {
      warn!(
        partition = batch.partition,
        rejected = items_rejected,
        "sink rejected entries; kept for retry"
      );
      self.pending = Some(FlushBatch {
        partition: batch.partition,
        entries: rejected,
        range,
        partition_state: None,
      });
    } else {
      manager.items_persisted();
    }
    debug!(
      partition = batch.partition,
      items = batch.len(),
      rejected = items_rejected,
      range = %batch.range,
      "batch flushed"
    );
    Ok(FlushOutcome {
      items_flushed: batch.len() - items_rejected,
      items_rejected,
      range: Some(batch.range),
    })
  }

  /// Flush until the persistence cursor has nothing outstanding.
  pub fn flush_all<S: FlushSink + ?Sized>(
    &mut self,
    manager: &CheckpointManager,
    sink: &mut S,
  ) -> Result<usize> {
    let mut flushed = 0;
    loop {
      flushed += self.flush_once(manager, sink)?.items_flushed;
      if manager.num_items_for_cursor(PERSISTENCE_CURSOR_NAME)? == 0 {
        return Ok(flushed);
      }
    }
  }
}

/// In-memory sink keyed by document key.
#[derive(Debug, Default)]
pub struct MemoryFlushSink {
  staged: Vec<Arc<Entry>>,
  durable: HashMap<DocKey, Arc<Entry>>,
  commits: usize,
  failing_commits: usize,
  reject_deletions: bool,
}

impl MemoryFlushSink {
  pub fn new() -> Self {
    Self::default()
  }

  /// Make the next `count` commits fail.
  pub fn fail_next_commits(&mut self, count: usize) {
    self.failing_commits = count;
  }

  pub fn reject_deletions(&mut self, reject: bool) {
    self.reject_deletions = reject;
  }

  pub fn get(&self, key: &DocKey) -> Option<&Arc<Entry>> {
    self.durable.get(key)
  }

  pub fn len(&self) -> usize {
    self.durable.len()
  }

  pub fn is_empty(&self) -> bool {
    self.durable.is_empty()
  }

  pub fn commits(&self) -> usize {
    self.commits
  }
}

impl FlushSink for MemoryFlushSink {
  fn persist(&mut self, entry: &Entry) -> bool {
    if self.reject_deletions && entry.is_deleted() {
      return false;
    }
    self.staged.push(Arc::new(entry.clone()));
    true
  }

  fn commit(&mut self, batch: &FlushBatch) -> Result<()> {
    if self.failing_commits > 0 {
      self.failing_commits -= 1;
      return Err(KiteError::Flush(format!(
        "injected commit failure for partition {}",
        batch.partition
      )));
    }
    for entry in self.staged.drain(..) {
      if let Some(key) = entry.key() {
        self.durable.insert(key.clone(), Arc::clone(&entry));
      }
    }
    self.commits += 1;
    Ok(())
  }

  fn rollback(&mut self) {
    self.staged.clear();
  }
}
