//! Seqno and CAS allocation.
//!
//! The allocator is owned by the checkpoint manager and is only ever touched
//! while the manager's structural lock is held, so a seqno and its CAS are
//! handed out as one step and every reader observes them in the same order.
//! CAS values are hybrid logical clock readings: the wall clock in
//! nanoseconds with the low 16 bits cleared, bumped past the previous value
//! and past any externally observed CAS.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{KiteError, Result};
use crate::types::{Cas, Seqno};

const HLC_LOGICAL_MASK: u64 = 0xFFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stamp {
  pub seqno: Seqno,
  pub cas: Cas,
}

#[derive(Debug)]
pub struct SeqnoAllocator {
  high_seqno: Seqno,
  max_cas: Cas,
}

impl SeqnoAllocator {
  pub fn new(high_seqno: Seqno, max_cas: Cas) -> Self {
    Self {
      high_seqno,
      max_cas,
    }
  }

  pub fn high_seqno(&self) -> Seqno {
    self.high_seqno
  }

  pub fn max_cas(&self) -> Cas {
    self.max_cas
  }

  /// Next seqno plus a CAS strictly above every CAS handed out or observed so
  /// far. `hint` is an external clock reading the new CAS must not fall below.
  pub fn allocate(&mut self, hint: Option<Cas>) -> Stamp {
    self.high_seqno += 1;
    Stamp {
      seqno: self.high_seqno,
      cas: self.next_cas(hint),
    }
  }

  pub fn next_cas(&mut self, hint: Option<Cas>) -> Cas {
    let cas = self
      .max_cas
      .saturating_add(1)
      .max(physical_now())
      .max(hint.unwrap_or(0));
    self.max_cas = cas;
    cas
  }

  /// Accept a seqno chosen elsewhere (replica streams) and move the
  /// high-water mark up to it.
  pub fn accept_seqno(&mut self, provided: Seqno) -> Result<()> {
    if provided <= self.high_seqno {
      return Err(KiteError::SeqnoRegression {
        provided,
        high: self.high_seqno,
      });
    }
    self.high_seqno = provided;
    Ok(())
  }

  /// Record a CAS chosen elsewhere so later local CAS values exceed it.
  pub fn observe_cas(&mut self, cas: Cas) {
    self.max_cas = self.max_cas.max(cas);
  }

  pub(crate) fn reset(&mut self, high_seqno: Seqno) {
    self.high_seqno = high_seqno;
  }
}

fn physical_now() -> Cas {
  let nanos = SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_nanos() as u64;
  nanos & !HLC_LOGICAL_MASK
}
