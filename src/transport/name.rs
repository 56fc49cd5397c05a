//! Packet file naming.

use std::fmt;
use std::str::FromStr;

use crate::core::constants::PACKET_EXTENSION;
use crate::core::error::TransportError;
use crate::core::id::PeerId;
use crate::wire::packet::PacketHeader;

/// Parsed form of a packet file name:
/// `{sender}--{recipient}--{packet_id}.packet`.
///
/// Peer ids are hyphenated UUIDs, which never contain a double hyphen, so
/// the `--` separator is unambiguous. Anything else in the folder is not
/// ours and gets skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PacketName {
    /// Sending peer.
    pub sender: PeerId,
    /// Receiving peer; selects the subfolder scanned for it.
    pub recipient: PeerId,
    /// Packet id, unique per sender/recipient pair.
    pub packet_id: u64,
}

impl PacketName {
    /// Name for an outbound packet.
    pub fn new(sender: PeerId, recipient: PeerId, packet_id: u64) -> Self {
        Self {
            sender,
            recipient,
            packet_id,
        }
    }
}

impl From<&PacketHeader> for PacketName {
    fn from(header: &PacketHeader) -> Self {
        Self::new(header.sender, header.recipient, header.packet_id)
    }
}

impl fmt::Display for PacketName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}--{}--{}.{}",
            self.sender, self.recipient, self.packet_id, PACKET_EXTENSION
        )
    }
}

impl FromStr for PacketName {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || TransportError::BadFileName(s.to_string());
        let stem = s
            .strip_suffix(PACKET_EXTENSION)
            .and_then(|rest| rest.strip_suffix('.'))
            .ok_or_else(bad)?;

        let mut parts = stem.split("--");
        let sender = parts.next().ok_or_else(bad)?;
        let recipient = parts.next().ok_or_else(bad)?;
        let packet_id = parts.next().ok_or_else(bad)?;
        if parts.next().is_some() {
            return Err(bad());
        }

        Ok(Self {
            sender: sender.parse().map_err(|_| bad())?,
            recipient: recipient.parse().map_err(|_| bad())?,
            packet_id: packet_id.parse().map_err(|_| bad())?,
        })
    }
}
