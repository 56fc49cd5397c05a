//! Message entries: the unit the replication engine sequences and acks.
//!
//! Wire format (little-endian):
//! ```text
//! +0   Sequence id        (8 bytes)
//! +8   Content length     (4 bytes)
//! +12  Content kind       (2 bytes)
//! +14  Content digest     (16 bytes, BLAKE2b-128 of the payload)
//! +30  Payload            (variable)
//! ```

use crate::core::constants::MESSAGE_HEADER_SIZE;
use crate::core::error::DecodeError;
use crate::wire::cursor::Cursor;
use crate::wire::digest::content_digest;

/// What the payload bytes are.
///
/// The replication layer never interprets payloads; the kind rides along so
/// the layer above knows how to revive the reassembled blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ContentKind {
    /// UTF-8 text.
    Text = 1,
    /// Opaque binary.
    Binary = 2,
    /// JSON document.
    Json = 3,
    /// zstd-compressed JSON document.
    Compressed = 4,
}

impl ContentKind {
    /// Decode the wire discriminant.
    pub fn from_wire(value: u16) -> Result<Self, DecodeError> {
        match value {
            1 => Ok(Self::Text),
            2 => Ok(Self::Binary),
            3 => Ok(Self::Json),
            4 => Ok(Self::Compressed),
            other => Err(DecodeError::UnknownContentKind(other)),
        }
    }
}

/// Message header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    /// Sequence id assigned by the sender's Lamport clock; immutable.
    pub seq: u64,
    /// Payload length in bytes.
    pub content_len: u32,
    /// Payload kind.
    pub kind: ContentKind,
    /// BLAKE2b-128 digest of the payload.
    pub content_digest: [u8; 16],
}

/// One sequenced message: header plus payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Header.
    pub header: MessageHeader,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

impl Message {
    /// Build a message, computing length and digest from the payload.
    pub fn new(seq: u64, kind: ContentKind, payload: Vec<u8>) -> Self {
        Self {
            header: MessageHeader {
                seq,
                content_len: payload.len() as u32,
                kind,
                content_digest: content_digest(&payload),
            },
            payload,
        }
    }

    /// Sequence id shorthand.
    pub fn seq(&self) -> u64 {
        self.header.seq
    }

    /// Serialized size, used for greedy packet fill.
    pub fn wire_size(&self) -> usize {
        MESSAGE_HEADER_SIZE + self.payload.len()
    }

    /// Append the wire encoding to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.header.seq.to_le_bytes());
        out.extend_from_slice(&self.header.content_len.to_le_bytes());
        out.extend_from_slice(&(self.header.kind as u16).to_le_bytes());
        out.extend_from_slice(&self.header.content_digest);
        out.extend_from_slice(&self.payload);
    }

    /// Decode one message from the cursor, verifying the payload digest and
    /// the per-message bound.
    pub fn decode(cursor: &mut Cursor<'_>, max_payload: usize) -> Result<Self, DecodeError> {
        let seq = cursor.take_u64()?;
        let content_len = cursor.take_u32()?;
        let kind = ContentKind::from_wire(cursor.take_u16()?)?;
        let declared_digest: [u8; 16] = cursor.take_array()?;

        if seq == 0 {
            return Err(DecodeError::InvalidField("message seq must be >= 1"));
        }
        if content_len as usize > max_payload {
            return Err(DecodeError::OversizedMessage {
                seq,
                len: content_len as usize,
                bound: max_payload,
            });
        }

        let payload = cursor.take(content_len as usize)?.to_vec();
        if content_digest(&payload) != declared_digest {
            return Err(DecodeError::DigestMismatch { section: "message" });
        }

        Ok(Self {
            header: MessageHeader {
                seq,
                content_len,
                kind,
                content_digest: declared_digest,
            },
            payload,
        })
    }
}
