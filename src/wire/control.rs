//! Control block: the passive acknowledgement state carried in every packet.
//!
//! A monotonic contiguous watermark plus a sparse out-of-order set replaces
//! any dedicated ack message type, so acknowledgement propagates with normal
//! traffic and there is no ack-of-ack round trip to recurse on.
//!
//! Wire format (little-endian):
//! ```text
//! +0   Last sent                  (8 bytes)
//! +8   Last contiguous received   (8 bytes)
//! +16  Out-of-order entry count   (4 bytes)
//! +20  Entries: seq + nonce       (16 bytes each)
//! ...  Section digest             (8 bytes, BLAKE2b-64)
//! ```

use crate::core::error::DecodeError;
use crate::wire::cursor::Cursor;
use crate::wire::digest::section_digest;

/// One out-of-order acknowledgement: a sequence id observed beyond a gap,
/// paired with the packet id that delivered it.
///
/// The nonce is defense-in-depth against ack replay; verifying it against
/// sent records is a configurable hardening option, not a correctness
/// requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckEntry {
    /// Acknowledged sequence id.
    pub seq: u64,
    /// Packet id of the packet that carried the message.
    pub nonce: u64,
}

/// Acknowledgement state exchanged in every packet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ControlBlock {
    /// Sender's last assigned sequence id (its Lamport clock).
    pub last_sent: u64,
    /// Highest sequence id from the recipient such that everything up to and
    /// including it has been observed, gap-free.
    pub last_contiguous_received: u64,
    /// Sequence ids observed beyond a gap, pending the gap's resolution.
    pub out_of_order: Vec<AckEntry>,
}

impl ControlBlock {
    /// Serialized size, used for packet-bound accounting.
    pub fn wire_size(&self) -> usize {
        8 + 8 + 4 + self.out_of_order.len() * 16 + 8
    }

    /// Append the wire encoding, digest included, to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.extend_from_slice(&self.last_sent.to_le_bytes());
        out.extend_from_slice(&self.last_contiguous_received.to_le_bytes());
        out.extend_from_slice(&(self.out_of_order.len() as u32).to_le_bytes());
        for entry in &self.out_of_order {
            out.extend_from_slice(&entry.seq.to_le_bytes());
            out.extend_from_slice(&entry.nonce.to_le_bytes());
        }
        let digest = section_digest(&out[start..]);
        out.extend_from_slice(&digest);
    }

    /// Decode and digest-check one control block from the cursor.
    pub fn decode(cursor: &mut Cursor<'_>) -> Result<Self, DecodeError> {
        let last_sent_bytes: [u8; 8] = cursor.take_array()?;
        let received_bytes: [u8; 8] = cursor.take_array()?;
        let count_bytes: [u8; 4] = cursor.take_array()?;
        let count = u32::from_le_bytes(count_bytes) as usize;

        // The count is not digest-checked yet; refuse to reserve for more
        // entries than the input could possibly still hold.
        let entries_len = count.saturating_mul(16);
        if entries_len.saturating_add(8) > cursor.remaining() {
            return Err(DecodeError::Truncated {
                needed: entries_len.saturating_add(8),
                available: cursor.remaining(),
            });
        }

        let mut body = Vec::with_capacity(20 + entries_len);
        body.extend_from_slice(&last_sent_bytes);
        body.extend_from_slice(&received_bytes);
        body.extend_from_slice(&count_bytes);

        let mut out_of_order = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let seq_bytes: [u8; 8] = cursor.take_array()?;
            let nonce_bytes: [u8; 8] = cursor.take_array()?;
            body.extend_from_slice(&seq_bytes);
            body.extend_from_slice(&nonce_bytes);
            out_of_order.push(AckEntry {
                seq: u64::from_le_bytes(seq_bytes),
                nonce: u64::from_le_bytes(nonce_bytes),
            });
        }

        let declared: [u8; 8] = cursor.take_array()?;
        if section_digest(&body) != declared {
            return Err(DecodeError::DigestMismatch { section: "control" });
        }

        let block = Self {
            last_sent: u64::from_le_bytes(last_sent_bytes),
            last_contiguous_received: u64::from_le_bytes(received_bytes),
            out_of_order,
        };
        for entry in &block.out_of_order {
            // an out-of-order ack at or under the watermark is nonsense
            if entry.seq <= block.last_contiguous_received {
                return Err(DecodeError::InvalidField(
                    "out-of-order ack at or under watermark",
                ));
            }
        }
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ControlBlock {
        ControlBlock {
            last_sent: 42,
            last_contiguous_received: 17,
            out_of_order: vec![
                AckEntry { seq: 19, nonce: 7 },
                AckEntry { seq: 23, nonce: 9 },
            ],
        }
    }

    #[test]
    fn test_roundtrip() {
        let block = sample();
        let mut buf = Vec::new();
        block.encode_into(&mut buf);
        assert_eq!(buf.len(), block.wire_size());

        let mut cursor = Cursor::new(&buf);
        assert_eq!(ControlBlock::decode(&mut cursor).unwrap(), block);
        assert!(cursor.at_end());
    }

    #[test]
    fn test_empty_roundtrip() {
        let block = ControlBlock::default();
        let mut buf = Vec::new();
        block.encode_into(&mut buf);

        let mut cursor = Cursor::new(&buf);
        assert_eq!(ControlBlock::decode(&mut cursor).unwrap(), block);
    }

    #[test]
    fn test_corruption_detected() {
        let mut buf = Vec::new();
        sample().encode_into(&mut buf);
        buf[3] ^= 0x01;

        let mut cursor = Cursor::new(&buf);
        assert_eq!(
            ControlBlock::decode(&mut cursor).unwrap_err(),
            DecodeError::DigestMismatch { section: "control" }
        );
    }

    #[test]
    fn test_truncation_detected() {
        let mut buf = Vec::new();
        sample().encode_into(&mut buf);
        buf.truncate(buf.len() - 10);

        let mut cursor = Cursor::new(&buf);
        assert!(matches!(
            ControlBlock::decode(&mut cursor),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn test_huge_declared_count_rejected_before_allocating() {
        let mut buf = Vec::new();
        sample().encode_into(&mut buf);
        // Bitrot in the count field must not translate into a giant
        // reservation; the declared entries cannot fit what remains.
        buf[16..20].copy_from_slice(&u32::MAX.to_le_bytes());

        let mut cursor = Cursor::new(&buf);
        assert!(matches!(
            ControlBlock::decode(&mut cursor),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn test_ack_under_watermark_rejected() {
        let block = ControlBlock {
            last_sent: 10,
            last_contiguous_received: 5,
            out_of_order: vec![AckEntry { seq: 4, nonce: 1 }],
        };
        let mut buf = Vec::new();
        block.encode_into(&mut buf);

        let mut cursor = Cursor::new(&buf);
        assert!(matches!(
            ControlBlock::decode(&mut cursor),
            Err(DecodeError::InvalidField(_))
        ));
    }
}
