//! Error types for the checkpoint log.

use thiserror::Error;

use crate::types::Seqno;

#[derive(Debug, Error)]
pub enum KiteError {
  #[error("unknown cursor: {0}")]
  UnknownCursor(String),

  #[error("cursor name is reserved: {0}")]
  ReservedCursorName(String),

  #[error("seqno regression: provided {provided} is not above high seqno {high}")]
  SeqnoRegression { provided: Seqno, high: Seqno },

  #[error("invalid entry: {0}")]
  InvalidEntry(String),

  #[error("invalid cursor position: {0}")]
  InvalidPosition(String),

  #[error("invalid partition state: {0}")]
  InvalidState(String),

  #[error("invalid config: {0}")]
  InvalidConfig(String),

  #[error("serialization error: {0}")]
  Serialization(String),

  #[error("flush failed: {0}")]
  Flush(String),

  #[error("internal error: {0}")]
  Internal(String),
}

pub type Result<T> = std::result::Result<T, KiteError>;
