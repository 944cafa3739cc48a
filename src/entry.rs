//! Log entries.
//!
//! An [`Entry`] is built by a producer without seqno/CAS, stamped by the
//! checkpoint manager inside `enqueue`, and is immutable once it is shared
//! with readers as an `Arc<Entry>`.

use std::fmt;

use crate::key::{CollectionId, DocKey};
use crate::types::{Cas, PartitionState, RevSeqno, Seqno};

/// Collection lifecycle events carried through the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemEvent {
  CollectionCreated(CollectionId),
  CollectionDropped(CollectionId),
}

impl SystemEvent {
  /// Key under which the event is stored.
  pub fn key(&self) -> DocKey {
    let name = match self {
      SystemEvent::CollectionCreated(id) => format!("_collection:create:{}", id.0),
      SystemEvent::CollectionDropped(id) => format!("_collection:drop:{}", id.0),
    };
    DocKey::new(name, CollectionId::SYSTEM)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
  Mutation,
  Deletion,
  /// First deliverable entry of every checkpoint.
  SegmentStart,
  /// Last entry of a closed checkpoint.
  SegmentEnd,
  /// Dummy at offset 0 of every checkpoint; never delivered.
  SegmentEmpty,
  SetPartitionState(PartitionState),
  SystemEvent(SystemEvent),
}

impl EntryKind {
  /// Meta entries never count as items and never carry a key.
  pub fn is_meta(&self) -> bool {
    match self {
      EntryKind::SegmentStart
      | EntryKind::SegmentEnd
      | EntryKind::SegmentEmpty
      | EntryKind::SetPartitionState(_) => true,
      EntryKind::Mutation | EntryKind::Deletion | EntryKind::SystemEvent(_) => false,
    }
  }

  /// Only document mutations take part in key deduplication.
  pub fn is_dedupable(&self) -> bool {
    matches!(self, EntryKind::Mutation | EntryKind::Deletion)
  }

  pub fn name(&self) -> &'static str {
    match self {
      EntryKind::Mutation => "mutation",
      EntryKind::Deletion => "deletion",
      EntryKind::SegmentStart => "segment_start",
      EntryKind::SegmentEnd => "segment_end",
      EntryKind::SegmentEmpty => "segment_empty",
      EntryKind::SetPartitionState(_) => "set_partition_state",
      EntryKind::SystemEvent(_) => "system_event",
    }
  }
}

impl fmt::Display for EntryKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.name())
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
  kind: EntryKind,
  key: Option<DocKey>,
  value: Option<Vec<u8>>,
  seqno: Seqno,
  cas: Cas,
  rev_seqno: RevSeqno,
}

impl Entry {
  pub fn mutation(key: impl Into<DocKey>, value: impl Into<Vec<u8>>) -> Self {
    Self {
      kind: EntryKind::Mutation,
      key: Some(key.into()),
      value: Some(value.into()),
      seqno: 0,
      cas: 0,
      rev_seqno: 0,
    }
  }

  pub fn deletion(key: impl Into<DocKey>) -> Self {
    Self {
      kind: EntryKind::Deletion,
      key: Some(key.into()),
      value: None,
      seqno: 0,
      cas: 0,
      rev_seqno: 0,
    }
  }

  pub fn system_event(event: SystemEvent) -> Self {
    Self {
      kind: EntryKind::SystemEvent(event),
      key: Some(event.key()),
      value: None,
      seqno: 0,
      cas: 0,
      rev_seqno: 0,
    }
  }

  pub(crate) fn meta(kind: EntryKind, seqno: Seqno) -> Self {
    debug_assert!(kind.is_meta());
    Self {
      kind,
      key: None,
      value: None,
      seqno,
      cas: 0,
      rev_seqno: 0,
    }
  }

  /// Revision counter supplied by the document layer.
  pub fn with_rev_seqno(mut self, rev_seqno: RevSeqno) -> Self {
    self.rev_seqno = rev_seqno;
    self
  }

  /// Seqno used when enqueued with [`SeqnoMode::Provided`](crate::SeqnoMode).
  pub fn with_seqno(mut self, seqno: Seqno) -> Self {
    self.seqno = seqno;
    self
  }

  /// CAS used when enqueued with [`CasMode::Provided`](crate::CasMode).
  pub fn with_cas(mut self, cas: Cas) -> Self {
    self.cas = cas;
    self
  }

  pub(crate) fn stamp(&mut self, seqno: Seqno, cas: Cas) {
    self.seqno = seqno;
    self.cas = cas;
  }

  pub fn kind(&self) -> EntryKind {
    self.kind
  }

  pub fn key(&self) -> Option<&DocKey> {
    self.key.as_ref()
  }

  pub fn value(&self) -> Option<&[u8]> {
    self.value.as_deref()
  }

  pub fn seqno(&self) -> Seqno {
    self.seqno
  }

  pub fn cas(&self) -> Cas {
    self.cas
  }

  pub fn rev_seqno(&self) -> RevSeqno {
    self.rev_seqno
  }

  pub fn is_deleted(&self) -> bool {
    self.kind == EntryKind::Deletion
  }

  pub fn is_meta(&self) -> bool {
    self.kind.is_meta()
  }
}
