//! Stored document keys.
//!
//! A key is stored as an unsigned LEB128 collection id followed by the raw key
//! bytes, so keys from different collections never compare equal and never
//! deduplicate each other.

use std::fmt;

use crate::error::{KiteError, Result};

/// Collection identifier encoded at the front of every stored key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct CollectionId(pub u32);

impl CollectionId {
  pub const DEFAULT: CollectionId = CollectionId(0);
  /// Collection used for keys of system events.
  pub const SYSTEM: CollectionId = CollectionId(1);
}

impl fmt::Display for CollectionId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "0x{:x}", self.0)
  }
}

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocKey {
  bytes: Box<[u8]>,
}

impl DocKey {
  pub fn new(key: impl AsRef<[u8]>, collection: CollectionId) -> Self {
    let key = key.as_ref();
    let mut bytes = Vec::with_capacity(key.len() + 5);
    encode_unsigned_leb128(collection.0, &mut bytes);
    bytes.extend_from_slice(key);
    Self {
      bytes: bytes.into_boxed_slice(),
    }
  }

  /// Key in the default collection.
  pub fn default_collection(key: impl AsRef<[u8]>) -> Self {
    Self::new(key, CollectionId::DEFAULT)
  }

  /// Rebuild a key from its stored (prefixed) representation.
  pub fn from_stored(bytes: &[u8]) -> Result<Self> {
    decode_unsigned_leb128(bytes)?;
    Ok(Self {
      bytes: bytes.into(),
    })
  }

  pub fn collection_id(&self) -> CollectionId {
    match decode_unsigned_leb128(&self.bytes) {
      Ok((id, _)) => CollectionId(id),
      Err(_) => unreachable!("stored key always carries a valid collection prefix"),
    }
  }

  /// Key bytes without the collection prefix.
  pub fn key(&self) -> &[u8] {
    match decode_unsigned_leb128(&self.bytes) {
      Ok((_, rest)) => rest,
      Err(_) => unreachable!("stored key always carries a valid collection prefix"),
    }
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.bytes
  }

  pub fn len(&self) -> usize {
    self.bytes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.bytes.is_empty()
  }
}

impl From<&str> for DocKey {
  fn from(value: &str) -> Self {
    Self::default_collection(value)
  }
}

impl From<String> for DocKey {
  fn from(value: String) -> Self {
    Self::default_collection(value)
  }
}

impl fmt::Display for DocKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "cid:{}:{}",
      self.collection_id(),
      String::from_utf8_lossy(self.key())
    )
  }
}

impl fmt::Debug for DocKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "DocKey({self})")
  }
}

fn encode_unsigned_leb128(mut value: u32, out: &mut Vec<u8>) {
  loop {
    let byte = (value & 0x7f) as u8;
    value >>= 7;
    if value == 0 {
      out.push(byte);
      return;
    }
    out.push(byte | 0x80);
  }
}

fn decode_unsigned_leb128(bytes: &[u8]) -> Result<(u32, &[u8])> {
  let mut value: u32 = 0;
  for (index, byte) in bytes.iter().enumerate() {
    let shift = 7 * index as u32;
    if index >= 5 || (index == 4 && (byte & 0x7f) > 0x0f) {
      return Err(KiteError::InvalidEntry(
        "collection id prefix overflows u32".to_string(),
      ));
    }
    value |= u32::from(byte & 0x7f) << shift;
    if byte & 0x80 == 0 {
      return Ok((value, &bytes[index + 1..]));
    }
  }
  Err(KiteError::InvalidEntry(
    "collection id prefix is truncated".to_string(),
  ))
}

#[cfg(test)]
mod tests {
  use super::{CollectionId, DocKey};

  #[test]
  fn default_collection_prefix_is_single_zero_byte() {
    let key = DocKey::from("key1");
    assert_eq!(key.as_bytes(), b"\x00key1");
    assert_eq!(key.collection_id(), CollectionId::DEFAULT);
    assert_eq!(key.key(), b"key1");
  }

  #[test]
  fn multi_byte_collection_ids_survive_decoding() {
    for id in [0_u32, 1, 127, 128, 300, 16_384, u32::MAX] {
      let key = DocKey::new("k", CollectionId(id));
      assert_eq!(key.collection_id(), CollectionId(id));
      assert_eq!(key.key(), b"k");
      let restored = DocKey::from_stored(key.as_bytes()).expect("stored key");
      assert_eq!(restored, key);
    }
  }

  #[test]
  fn same_key_in_different_collections_differs() {
    let a = DocKey::new("k", CollectionId(8));
    let b = DocKey::new("k", CollectionId(9));
    assert_ne!(a, b);
    assert_eq!(a.key(), b.key());
  }

  #[test]
  fn malformed_prefixes_are_rejected() {
    assert!(DocKey::from_stored(&[]).is_err());
    assert!(DocKey::from_stored(&[0x80]).is_err());
    assert!(DocKey::from_stored(&[0xff, 0xff, 0xff, 0xff, 0x7f]).is_err());
  }

  #[test]
  fn display_shows_collection_and_key() {
    let key = DocKey::new("hello", CollectionId(0x1f));
    assert_eq!(key.to_string(), "cid:0x1f:hello");
  }
}
