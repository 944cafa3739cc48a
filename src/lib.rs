//! Checkpoint-structured replication log.
//!
//! Each partition owns a [`CheckpointManager`]: producers enqueue mutations,
//! which are stamped with a seqno and CAS and appended to the open
//! checkpoint, deduplicating by key. Named cursors (one reserved for
//! persistence, any number for replication) read the log in seqno order.
//! Closed checkpoints are freed once no cursor depends on them.

pub mod checkpoint;
pub mod clock;
pub mod config;
pub mod cursor;
pub mod entry;
pub mod error;
pub mod flusher;
pub mod key;
pub mod maintenance;
pub mod manager;
pub mod stats;
pub mod types;

pub use checkpoint::{Checkpoint, CheckpointState};
pub use config::{CheckpointConfig, ManagerOptions};
pub use cursor::{
  CursorItems, CursorKind, CursorPosition, CursorRegistration, NextItem, PERSISTENCE_CURSOR_NAME,
};
pub use entry::{Entry, EntryKind, SystemEvent};
pub use error::{KiteError, Result};
pub use flusher::{FlushBatch, FlushOutcome, FlushSink, Flusher, MemoryFlushSink};
pub use key::{CollectionId, DocKey};
pub use maintenance::{CheckpointRemover, RemoverTotals};
pub use manager::{
  CheckpointManager, CheckpointSummary, CollapseOutcome, CursorSummary, Enqueued, ManagerSummary,
};
pub use stats::{CheckpointStats, StatsSnapshot};
pub use types::{
  Cas, CasMode, CheckpointId, PartitionId, PartitionState, RevSeqno, Seqno, SeqnoMode,
  SnapshotRange,
};
