//! Framed packet: the unit the transport writes and reads as one file.
//!
//! Wire format (little-endian):
//! ```text
//! +0   Sender uuid        (16 bytes)
//! +16  Recipient uuid     (16 bytes)
//! +32  Packet id          (8 bytes)
//! +40  Message count      (4 bytes)
//! +44  Timestamp          (8 bytes, unix seconds)
//! +52  Protocol version   (4 bytes)
//! +56  Header digest      (8 bytes, BLAKE2b-64)
//! +64  Control block      (variable, digest-guarded)
//! ...  Messages           (count entries, each digest-guarded)
//! ```
//!
//! Any decode failure means the file is dropped silently: a malformed packet
//! has no reliable return-address semantics to nack against.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::core::constants::{MAX_MESSAGE_BYTES, PACKET_HEADER_SIZE, PROTOCOL_VERSION};
use crate::core::error::{DecodeError, IdentityError};
use crate::core::id::PeerId;
use crate::wire::control::ControlBlock;
use crate::wire::cursor::Cursor;
use crate::wire::digest::section_digest;
use crate::wire::message::Message;

/// Packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Originating peer.
    pub sender: PeerId,
    /// Intended recipient.
    pub recipient: PeerId,
    /// Monotonic per-direction packet id; doubles as the ack nonce.
    pub packet_id: u64,
    /// Number of message entries that follow the control block.
    pub num_messages: u32,
    /// Sender wall-clock at creation, unix seconds.
    pub timestamp: u64,
    /// Protocol version.
    pub protocol_version: u32,
}

impl PacketHeader {
    fn encode_into(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.extend_from_slice(self.sender.as_bytes());
        out.extend_from_slice(self.recipient.as_bytes());
        out.extend_from_slice(&self.packet_id.to_le_bytes());
        out.extend_from_slice(&self.num_messages.to_le_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&self.protocol_version.to_le_bytes());
        let digest = section_digest(&out[start..]);
        out.extend_from_slice(&digest);
    }

    fn decode(cursor: &mut Cursor<'_>) -> Result<Self, DecodeError> {
        let body = cursor.take(PACKET_HEADER_SIZE - 8)?;
        let declared: [u8; 8] = cursor.take_array()?;
        if section_digest(body) != declared {
            return Err(DecodeError::DigestMismatch { section: "header" });
        }

        let mut fields = Cursor::new(body);
        let sender = PeerId::from_bytes(fields.take_array()?);
        let recipient = PeerId::from_bytes(fields.take_array()?);
        let packet_id = fields.take_u64()?;
        let num_messages = fields.take_u32()?;
        let timestamp = fields.take_u64()?;
        let protocol_version = fields.take_u32()?;

        if protocol_version != PROTOCOL_VERSION {
            return Err(DecodeError::UnsupportedVersion(protocol_version));
        }
        if packet_id == 0 {
            return Err(DecodeError::InvalidField("packet id must be >= 1"));
        }

        Ok(Self {
            sender,
            recipient,
            packet_id,
            num_messages,
            timestamp,
            protocol_version,
        })
    }
}

/// One framed packet: header, control block, ordered message list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Header.
    pub header: PacketHeader,
    /// Messages, in ascending sequence-id order. May be empty for a pure
    /// control packet.
    pub messages: Vec<Message>,
    /// Acknowledgement state.
    pub control: ControlBlock,
}

impl Packet {
    /// Assemble a packet; fills in count, timestamp, and version.
    pub fn new(
        sender: PeerId,
        recipient: PeerId,
        packet_id: u64,
        messages: Vec<Message>,
        control: ControlBlock,
    ) -> Self {
        Self {
            header: PacketHeader {
                sender,
                recipient,
                packet_id,
                num_messages: messages.len() as u32,
                timestamp: unix_now(),
                protocol_version: PROTOCOL_VERSION,
            },
            messages,
            control,
        }
    }

    /// Serialized size.
    pub fn wire_size(&self) -> usize {
        PACKET_HEADER_SIZE
            + self.control.wire_size()
            + self.messages.iter().map(Message::wire_size).sum::<usize>()
    }

    /// Encode to the wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.wire_size());
        self.header.encode_into(&mut out);
        self.control.encode_into(&mut out);
        for message in &self.messages {
            message.encode_into(&mut out);
        }
        out
    }

    /// Decode and fully validate one packet.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        Self::decode_with_bound(data, MAX_MESSAGE_BYTES)
    }

    /// Decode with an explicit per-message payload bound.
    pub fn decode_with_bound(data: &[u8], max_payload: usize) -> Result<Self, DecodeError> {
        let mut cursor = Cursor::new(data);
        let header = PacketHeader::decode(&mut cursor)?;
        let control = ControlBlock::decode(&mut cursor)?;

        let mut messages = Vec::with_capacity((header.num_messages as usize).min(1024));
        let mut prev_seq = 0u64;
        for _ in 0..header.num_messages {
            let message = Message::decode(&mut cursor, max_payload)?;
            if message.seq() <= prev_seq {
                return Err(DecodeError::InvalidField(
                    "message seqs must be strictly ascending",
                ));
            }
            prev_seq = message.seq();
            messages.push(message);
        }

        if !cursor.at_end() {
            return Err(DecodeError::TrailingBytes(cursor.remaining()));
        }

        Ok(Self {
            header,
            messages,
            control,
        })
    }

    /// Reject packets whose claimed identities do not match the session or
    /// folder context (surreptitious forwarding / misdelivery defense).
    pub fn verify_identity(
        &self,
        expected_sender: PeerId,
        expected_recipient: PeerId,
    ) -> Result<(), IdentityError> {
        if self.header.sender != expected_sender || self.header.recipient != expected_recipient {
            return Err(IdentityError {
                expected_sender,
                expected_recipient,
                actual_sender: self.header.sender,
                actual_recipient: self.header.recipient,
            });
        }
        Ok(())
    }

    /// Canonical file name for this packet:
    /// `{sender}--{recipient}--{packet_id}.packet`.
    pub fn file_name(&self) -> String {
        format!(
            "{}--{}--{}.{}",
            self.header.sender,
            self.header.recipient,
            self.header.packet_id,
            crate::core::constants::PACKET_EXTENSION,
        )
    }
}

/// Current wall clock as unix seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::control::AckEntry;
    use crate::wire::message::ContentKind;

    fn sample() -> Packet {
        Packet::new(
            PeerId::new(),
            PeerId::new(),
            1,
            vec![
                Message::new(1, ContentKind::Text, b"hello".to_vec()),
                Message::new(2, ContentKind::Binary, vec![0; 300]),
            ],
            ControlBlock {
                last_sent: 2,
                last_contiguous_received: 5,
                out_of_order: vec![AckEntry { seq: 8, nonce: 3 }],
            },
        )
    }

    #[test]
    fn test_roundtrip() {
        let packet = sample();
        let encoded = packet.encode();
        assert_eq!(encoded.len(), packet.wire_size());
        assert_eq!(Packet::decode(&encoded).unwrap(), packet);
    }

    #[test]
    fn test_control_only_roundtrip() {
        let packet = Packet::new(
            PeerId::new(),
            PeerId::new(),
            9,
            Vec::new(),
            ControlBlock::default(),
        );
        let decoded = Packet::decode(&packet.encode()).unwrap();
        assert!(decoded.messages.is_empty());
        assert_eq!(decoded.header.packet_id, 9);
    }

    #[test]
    fn test_truncation_at_every_boundary() {
        let encoded = sample().encode();
        // Chop progressively larger suffixes; every prefix must fail to
        // decode, none may panic.
        for keep in [0, 10, 55, 63, 70, 100, encoded.len() - 1] {
            let result = Packet::decode(&encoded[..keep]);
            assert!(result.is_err(), "prefix of {keep} bytes decoded");
        }
    }

    #[test]
    fn test_bitrot_in_header() {
        let mut encoded = sample().encode();
        encoded[20] ^= 0x40;
        assert_eq!(
            Packet::decode(&encoded).unwrap_err(),
            DecodeError::DigestMismatch { section: "header" }
        );
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        let mut encoded = sample().encode();
        encoded.push(0);
        assert!(matches!(
            Packet::decode(&encoded),
            Err(DecodeError::TrailingBytes(1))
        ));
    }

    #[test]
    fn test_unsupported_version() {
        let mut packet = sample();
        packet.header.protocol_version = 99;
        let err = Packet::decode(&packet.encode()).unwrap_err();
        assert_eq!(err, DecodeError::UnsupportedVersion(99));
    }

    #[test]
    fn test_out_of_order_message_list_rejected() {
        let mut packet = sample();
        packet.messages.reverse();
        assert!(matches!(
            Packet::decode(&packet.encode()),
            Err(DecodeError::InvalidField(_))
        ));
    }

    #[test]
    fn test_verify_identity() {
        let packet = sample();
        let sender = packet.header.sender;
        let recipient = packet.header.recipient;

        assert!(packet.verify_identity(sender, recipient).is_ok());

        let stranger = PeerId::new();
        let err = packet.verify_identity(stranger, recipient).unwrap_err();
        assert_eq!(err.actual_sender, sender);
        assert!(packet.verify_identity(sender, stranger).is_err());
    }

    #[test]
    fn test_file_name_shape() {
        let packet = sample();
        let name = packet.file_name();
        assert!(name.ends_with(".packet"));
        assert_eq!(name.matches("--").count(), 2);
        assert!(name.starts_with(&packet.header.sender.to_string()));
    }
}
