//! Typed mutations and their log-entry codec.
//!
//! Every replicated write travels through the Raft log as a serialized
//! [`Operation`]. The wire layout is fixed and little-endian framed:
//!
//! ```text
//! +-----+----------------+-----------+----------------+-------------+
//! | tag | key len (u32)  | key bytes | val len (u32)  | value bytes |
//! +-----+----------------+-----------+----------------+-------------+
//!   1B      4B LE                        4B LE (PUT/UPDATE only)
//! ```
//!
//! Tags: 0 = PUT, 1 = UPDATE, 2 = DELETE. The encoding is total: every
//! well-formed operation has exactly one encoding, and every byte string
//! either decodes to exactly one operation or is rejected.

use serde::{Deserialize, Serialize};
use thiserror::Error;

const TAG_PUT: u8 = 0;
const TAG_UPDATE: u8 = 1;
const TAG_DELETE: u8 = 2;

const LEN_PREFIX: usize = std::mem::size_of::<u32>();

/// The three mutation kinds the state machine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    Put,
    Update,
    Delete,
}

impl OperationKind {
    fn tag(self) -> u8 {
        match self {
            OperationKind::Put => TAG_PUT,
            OperationKind::Update => TAG_UPDATE,
            OperationKind::Delete => TAG_DELETE,
        }
    }

    /// PUT and UPDATE carry a value section; DELETE does not.
    pub fn has_value(self) -> bool {
        matches!(self, OperationKind::Put | OperationKind::Update)
    }
}

/// Reasons a byte string fails to decode as an [`Operation`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("buffer too short: needed {needed} more byte(s) at offset {offset}")]
    ShortBuffer { offset: usize, needed: usize },

    #[error("unknown operation tag: {0:#04x}")]
    UnknownTag(u8),

    #[error("length prefix {len} at offset {offset} overflows remaining buffer")]
    LengthOverflow { offset: usize, len: u32 },

    #[error("operation key must be non-empty")]
    EmptyKey,

    #[error("{trailing} trailing byte(s) after a complete operation")]
    TrailingBytes { trailing: usize },
}

/// An immutable key/value mutation. The value is present iff the kind is
/// PUT or UPDATE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    kind: OperationKind,
    key: Vec<u8>,
    value: Option<Vec<u8>>,
}

impl Operation {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: OperationKind::Put,
            key: key.into(),
            value: Some(value.into()),
        }
    }

    pub fn update(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: OperationKind::Update,
            key: key.into(),
            value: Some(value.into()),
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: OperationKind::Delete,
            key: key.into(),
            value: None,
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// The value section. Only PUT and UPDATE operations carry one.
    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    /// Serialize into the log-entry wire format. Allocates exactly the
    /// output buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut size = 1 + LEN_PREFIX + self.key.len();
        if let Some(v) = &self.value {
            size += LEN_PREFIX + v.len();
        }

        let mut buf = Vec::with_capacity(size);
        buf.push(self.kind.tag());
        buf.extend_from_slice(&(self.key.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.key);
        if let Some(v) = &self.value {
            buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
            buf.extend_from_slice(v);
        }
        buf
    }

    /// Decode a log entry. Rejects short buffers, unknown tags, overflowing
    /// length prefixes, missing value sections, and trailing garbage.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut cursor = Cursor { buf, pos: 0 };

        let tag = cursor.take_u8()?;
        let kind = match tag {
            TAG_PUT => OperationKind::Put,
            TAG_UPDATE => OperationKind::Update,
            TAG_DELETE => OperationKind::Delete,
            other => return Err(DecodeError::UnknownTag(other)),
        };

        let key = cursor.take_section()?.to_vec();
        if key.is_empty() {
            return Err(DecodeError::EmptyKey);
        }

        let value = if kind.has_value() {
            Some(cursor.take_section()?.to_vec())
        } else {
            None
        };

        if cursor.pos != buf.len() {
            return Err(DecodeError::TrailingBytes {
                trailing: buf.len() - cursor.pos,
            });
        }

        Ok(Self { kind, key, value })
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take_u8(&mut self) -> Result<u8, DecodeError> {
        let b = *self.buf.get(self.pos).ok_or(DecodeError::ShortBuffer {
            offset: self.pos,
            needed: 1,
        })?;
        self.pos += 1;
        Ok(b)
    }

    /// A u32 LE length prefix followed by that many bytes.
    fn take_section(&mut self) -> Result<&'a [u8], DecodeError> {
        let remaining = self.buf.len() - self.pos;
        if remaining < LEN_PREFIX {
            return Err(DecodeError::ShortBuffer {
                offset: self.pos,
                needed: LEN_PREFIX - remaining,
            });
        }

        let mut prefix = [0u8; LEN_PREFIX];
        prefix.copy_from_slice(&self.buf[self.pos..self.pos + LEN_PREFIX]);
        let len = u32::from_le_bytes(prefix);
        let offset = self.pos;
        self.pos += LEN_PREFIX;

        let end = self
            .pos
            .checked_add(len as usize)
            .filter(|&end| end <= self.buf.len())
            .ok_or(DecodeError::LengthOverflow { offset, len })?;

        let section = &self.buf[self.pos..end];
        self.pos = end;
        Ok(section)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_round_trips() {
        let op = Operation::put(&b"apple"[..], &b"An apple a day"[..]);
        let decoded = Operation::decode(&op.encode()).unwrap();
        assert_eq!(decoded, op);
        assert_eq!(decoded.kind(), OperationKind::Put);
        assert_eq!(decoded.value(), Some(&b"An apple a day"[..]));
    }

    #[test]
    fn update_round_trips() {
        let op = Operation::update(&b"k"[..], &b""[..]);
        let decoded = Operation::decode(&op.encode()).unwrap();
        assert_eq!(decoded, op);
        // An empty value is legal; only keys must be non-empty.
        assert_eq!(decoded.value(), Some(&b""[..]));
    }

    #[test]
    fn delete_round_trips_without_value() {
        let op = Operation::delete(&b"gone"[..]);
        let bytes = op.encode();
        assert_eq!(bytes.len(), 1 + 4 + 4);
        let decoded = Operation::decode(&bytes).unwrap();
        assert_eq!(decoded, op);
        assert_eq!(decoded.value(), None);
    }

    #[test]
    fn wire_layout_is_little_endian() {
        let op = Operation::put(&b"ab"[..], &b"c"[..]);
        let bytes = op.encode();
        assert_eq!(
            bytes,
            vec![0, 2, 0, 0, 0, b'a', b'b', 1, 0, 0, 0, b'c'],
        );
    }

    #[test]
    fn rejects_empty_buffer() {
        assert!(matches!(
            Operation::decode(&[]),
            Err(DecodeError::ShortBuffer { .. })
        ));
    }

    #[test]
    fn rejects_unknown_tag() {
        let mut bytes = Operation::delete(&b"k"[..]).encode();
        bytes[0] = 9;
        assert_eq!(Operation::decode(&bytes), Err(DecodeError::UnknownTag(9)));
    }

    #[test]
    fn rejects_truncated_length_prefix() {
        // Tag plus two of the four key-length bytes.
        let err = Operation::decode(&[TAG_DELETE, 1, 0]).unwrap_err();
        assert!(matches!(err, DecodeError::ShortBuffer { .. }));
    }

    #[test]
    fn rejects_overflowing_length_prefix() {
        let mut bytes = Operation::delete(&b"key"[..]).encode();
        // Claim a 1000-byte key in a 12-byte buffer.
        bytes[1..5].copy_from_slice(&1000u32.to_le_bytes());
        assert!(matches!(
            Operation::decode(&bytes),
            Err(DecodeError::LengthOverflow { .. })
        ));
    }

    #[test]
    fn rejects_put_without_value_section() {
        // A PUT truncated right after the key.
        let full = Operation::put(&b"key"[..], &b"value"[..]).encode();
        let truncated = &full[..1 + 4 + 3];
        assert!(matches!(
            Operation::decode(truncated),
            Err(DecodeError::ShortBuffer { .. })
        ));
    }

    #[test]
    fn rejects_empty_key() {
        let bytes = vec![TAG_DELETE, 0, 0, 0, 0];
        assert_eq!(Operation::decode(&bytes), Err(DecodeError::EmptyKey));
    }

    #[test]
    fn rejects_trailing_bytes() {
        let mut bytes = Operation::delete(&b"k"[..]).encode();
        bytes.push(0xFF);
        assert_eq!(
            Operation::decode(&bytes),
            Err(DecodeError::TrailingBytes { trailing: 1 })
        );
    }

    #[test]
    fn binary_keys_and_values_survive() {
        let key = vec![0u8, 255, 1, 254, 7];
        let value = (0u8..=255).collect::<Vec<u8>>();
        let op = Operation::put(key.clone(), value.clone());
        let decoded = Operation::decode(&op.encode()).unwrap();
        assert_eq!(decoded.key(), key.as_slice());
        assert_eq!(decoded.value(), Some(value.as_slice()));
    }
}
