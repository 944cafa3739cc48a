//! Core scalar types shared across the log.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::KiteError;

pub type Seqno = u64;
pub type Cas = u64;
pub type CheckpointId = u64;
pub type PartitionId = u16;
pub type RevSeqno = u64;

/// Lifecycle state of the partition that owns a checkpoint manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PartitionState {
  #[default]
  Active,
  Replica,
  Pending,
  Dead,
}

impl fmt::Display for PartitionState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let value = match self {
      PartitionState::Active => "active",
      PartitionState::Replica => "replica",
      PartitionState::Pending => "pending",
      PartitionState::Dead => "dead",
    };
    write!(f, "{value}")
  }
}

impl FromStr for PartitionState {
  type Err = KiteError;

  fn from_str(raw: &str) -> Result<Self, Self::Err> {
    match raw {
      "active" => Ok(Self::Active),
      "replica" => Ok(Self::Replica),
      "pending" => Ok(Self::Pending),
      "dead" => Ok(Self::Dead),
      _ => Err(KiteError::InvalidState(format!(
        "unknown partition state: {raw}"
      ))),
    }
  }
}

/// Whether `enqueue` allocates a seqno or trusts the one carried by the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqnoMode {
  Generate,
  Provided,
}

/// Whether `enqueue` allocates a CAS or trusts the one carried by the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasMode {
  Generate,
  Provided,
}

/// Seqno range covered by a cursor read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRange {
  pub start: Seqno,
  pub end: Seqno,
}

impl SnapshotRange {
  pub const fn new(start: Seqno, end: Seqno) -> Self {
    Self { start, end }
  }
}

impl fmt::Display for SnapshotRange {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "[{}, {}]", self.start, self.end)
  }
}
