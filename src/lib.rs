//! # fileway
//!
//! Reliable, ordered, deduplicating message replication over a shared
//! drop folder.
//!
//! Two peers that cannot talk directly exchange packet files through a
//! folder an external mover carries across a boundary (a data diode, an
//! air-gap bridge, a synced share). The transport may delay, reorder,
//! duplicate, or truncate files; it never has to report anything back.
//! On top of it fileway provides:
//!
//! - **Reliability**: per-peer Lamport sequencing, passive acks carried
//!   piggyback in every packet, timeout-driven retransmission
//! - **Effectively-once delivery**: at-least-once on the wire, filtered
//!   by watermark plus sparse-set deduplication that stays exact after
//!   state is garbage-collected
//! - **Large payloads**: fragmentation with selective repeat, so a lost
//!   fragment is resent alone rather than with its whole envelope
//! - **HTTP bridging**: request/response envelopes serialized as JSON
//!   and zstd-compressed when that pays off
//!
//! ## Feature Flags
//!
//! - `compression` (default): zstd compression of envelope payloads
//!
//! ## Modules
//!
//! - [`core`]: identities, constants, and error types
//! - [`wire`]: the digest-guarded packet codec
//! - [`engine`]: the per-peer replication state machine
//! - [`session`]: per-peer state and the peer registry
//! - [`fragment`]: splitting and reassembly of oversized payloads
//! - [`envelope`]: HTTP envelopes and their codec
//! - [`transport`]: drop-folder backends
//! - [`node`]: the polling loop tying it all together
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use fileway::prelude::*;
//!
//! # async fn example() -> Result<(), FilewayError> {
//! let near = PeerId::new();
//! let far = PeerId::new();
//!
//! let mut node = Node::new(near, FolderTransport::new("/mnt/diode/outbound"));
//! node.add_peer(far);
//!
//! let request = Envelope::Request(HttpRequestEnvelope::new("GET", "/inventory"));
//! let ticket = node.send_envelope(far, &request).await?;
//!
//! node.run_once().await?;
//! println!("riding on messages {:?}", ticket.seqs);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod core;
pub mod engine;
pub mod envelope;
pub mod fragment;
pub mod node;
pub mod session;
pub mod transport;
pub mod wire;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::{
        DecodeError, EngineError, EnvelopeError, EnvelopeId, FilewayError, FragmentError,
        IdentityError, PeerId, TransportError,
    };
    pub use crate::engine::{EngineConfig, Messenger, ReceiveOutcome, RetransmitTimer};
    pub use crate::envelope::{
        CompressionConfig, Envelope, EnvelopeCodec, HttpRequestEnvelope, HttpResponseEnvelope,
    };
    pub use crate::fragment::{EnvelopeTicket, Reassembler};
    pub use crate::node::{Delivery, Node, NodeConfig};
    pub use crate::transport::{FolderTransport, MemoryTransport, PacketName, PacketTransport};
    pub use crate::wire::{ContentKind, Message, Packet};
}

pub use crate::core::{FilewayError, PeerId};
pub use crate::node::{Delivery, Node, NodeConfig};
