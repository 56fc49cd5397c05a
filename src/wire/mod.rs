//! Packet codec: the framed wire format written to and read from the
//! drop folder.

pub mod control;
pub mod cursor;
pub mod digest;
pub mod message;
pub mod packet;

pub use control::{AckEntry, ControlBlock};
pub use cursor::Cursor;
pub use message::{ContentKind, Message, MessageHeader};
pub use packet::{Packet, PacketHeader};
