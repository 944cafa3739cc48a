//! Consumer cursors and the values returned by cursor reads.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::entry::Entry;
use crate::error::KiteError;
use crate::types::{CheckpointId, Seqno, SnapshotRange};

/// Name of the cursor that feeds the flusher. Reserved: replication
/// consumers cannot register or remove it.
pub const PERSISTENCE_CURSOR_NAME: &str = "persistence";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CursorKind {
  Persistence,
  Replication,
}

impl fmt::Display for CursorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let value = match self {
      CursorKind::Persistence => "persistence",
      CursorKind::Replication => "replication",
    };
    write!(f, "{value}")
  }
}

/// Checkpoint id plus the offset of the last slot the cursor consumed.
/// Offset 0 is the dummy slot, so a cursor there has consumed nothing.
/// Offsets into the open checkpoint change when it is compacted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CursorPosition {
  pub checkpoint_id: CheckpointId,
  pub offset: u64,
}

impl CursorPosition {
  pub const fn new(checkpoint_id: CheckpointId, offset: u64) -> Self {
    Self {
      checkpoint_id,
      offset,
    }
  }
}

impl fmt::Display for CursorPosition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.checkpoint_id, self.offset)
  }
}

impl Ord for CursorPosition {
  fn cmp(&self, other: &Self) -> Ordering {
    self
      .checkpoint_id
      .cmp(&other.checkpoint_id)
      .then_with(|| self.offset.cmp(&other.offset))
  }
}

impl PartialOrd for CursorPosition {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl FromStr for CursorPosition {
  type Err = KiteError;

  fn from_str(raw: &str) -> Result<Self, Self::Err> {
    let mut parts = raw.split(':');
    let checkpoint_id = parse_u64_component(parts.next(), "checkpoint_id", raw)?;
    let offset = parse_u64_component(parts.next(), "offset", raw)?;

    if parts.next().is_some() {
      return Err(KiteError::InvalidPosition(format!(
        "invalid position format: {raw}"
      )));
    }

    Ok(Self::new(checkpoint_id, offset))
  }
}

fn parse_u64_component(
  value: Option<&str>,
  component: &'static str,
  token: &str,
) -> Result<u64, KiteError> {
  let value = value.ok_or_else(|| {
    KiteError::InvalidPosition(format!("{component} missing: {token}"))
  })?;

  if value.is_empty() || !value.bytes().all(|byte| byte.is_ascii_digit()) {
    return Err(KiteError::InvalidPosition(format!(
      "invalid {component}: {value}"
    )));
  }

  value.parse::<u64>().map_err(|_| {
    KiteError::InvalidPosition(format!("{component} overflow: {token}"))
  })
}

#[derive(Debug, Clone)]
pub(crate) struct Cursor {
  pub kind: CursorKind,
  pub checkpoint_id: CheckpointId,
  /// Always a live slot of `checkpoint_id`.
  pub offset: usize,
  /// Live non-meta entries at or before `offset` in the current checkpoint.
  pub consumed: usize,
  pub send_end_markers: bool,
  /// Highest data seqno handed to the consumer so far. Data at or below it
  /// is consumed without being delivered.
  pub last_seqno: Seqno,
}

impl Cursor {
  pub fn new(
    kind: CursorKind,
    checkpoint_id: CheckpointId,
    offset: usize,
    consumed: usize,
    send_end_markers: bool,
    last_seqno: Seqno,
  ) -> Self {
    Self {
      kind,
      checkpoint_id,
      offset,
      consumed,
      send_end_markers,
      last_seqno,
    }
  }

  pub fn position(&self) -> CursorPosition {
    CursorPosition::new(self.checkpoint_id, self.offset as u64)
  }
}

/// Outcome of registering a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorRegistration {
  /// Seqno of the first data entry the cursor will deliver.
  pub first_seqno: Seqno,
  /// The log no longer holds everything from the requested start seqno.
  pub backfill_required: bool,
}

/// Entries handed out by a cursor read together with the data seqno range
/// they cover.
#[derive(Debug, Clone)]
pub struct CursorItems {
  pub items: Vec<Arc<Entry>>,
  pub range: SnapshotRange,
}

impl CursorItems {
  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  /// Data entries only, markers stripped.
  pub fn data(&self) -> impl Iterator<Item = &Arc<Entry>> + '_ {
    self.items.iter().filter(|entry| !entry.is_meta())
  }
}

#[derive(Debug, Clone)]
pub struct NextItem {
  pub entry: Arc<Entry>,
  /// No data entry follows this one in its checkpoint.
  pub is_last_mutation: bool,
}
