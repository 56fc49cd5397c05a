//! Error types.
//!
//! Decode, transport, and identity failures are all *droppable*: the engine
//! logs them and discards the offending file. Nothing in this layer nacks a
//! bad packet (a malformed packet has no trustworthy return address, and
//! nacking corrupt input risks a nack amplification avalanche) and nothing
//! here is fatal to the process.

use thiserror::Error;

use crate::core::id::PeerId;

/// Errors from decoding a packet, message, control block, or fragment header.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Input ended before the declared structure did. The dominant failure
    /// mode of the transport is truncation, so this is expected traffic.
    #[error("truncated input: needed {needed} more bytes, had {available}")]
    Truncated {
        /// Bytes still required.
        needed: usize,
        /// Bytes remaining in the input.
        available: usize,
    },

    /// A section digest did not match its contents.
    #[error("digest mismatch in {section}")]
    DigestMismatch {
        /// Which guarded section failed ("header", "control", "message").
        section: &'static str,
    },

    /// Packet declares a protocol version this build does not speak.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),

    /// Unknown content kind discriminant.
    #[error("unknown content kind {0}")]
    UnknownContentKind(u16),

    /// A message payload exceeds the per-message bound.
    #[error("message {seq} payload is {len} bytes, bound is {bound}")]
    OversizedMessage {
        /// Sequence id of the offending message.
        seq: u64,
        /// Declared payload length.
        len: usize,
        /// Configured per-message bound.
        bound: usize,
    },

    /// Bytes left over after the declared structure ended.
    #[error("{0} trailing bytes after packet end")]
    TrailingBytes(usize),

    /// Structurally invalid field value.
    #[error("invalid field: {0}")]
    InvalidField(&'static str),
}

/// Packet sender/recipient do not match the folder or session context.
/// Treated as a misdelivery or surreptitious-forwarding signal: logged,
/// dropped, never nacked, and never mutates peer state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("identity mismatch: expected {expected_sender} -> {expected_recipient}, packet claims {actual_sender} -> {actual_recipient}")]
pub struct IdentityError {
    /// Sender the context expected.
    pub expected_sender: PeerId,
    /// Recipient the context expected.
    pub expected_recipient: PeerId,
    /// Sender the packet header claims.
    pub actual_sender: PeerId,
    /// Recipient the packet header claims.
    pub actual_recipient: PeerId,
}

/// Errors at the transport adapter boundary.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Underlying filesystem failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A packet filename that does not follow
    /// `{sender}--{recipient}--{packet_id}.packet`.
    #[error("unparseable packet filename: {0}")]
    BadFileName(String),
}

/// Errors from the replication engine's own bookkeeping.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Enqueued payload exceeds the per-message bound; oversized data must
    /// go through the fragmentation layer instead.
    #[error("payload of {len} bytes exceeds per-message bound {bound}")]
    PayloadTooLarge {
        /// Offered payload length.
        len: usize,
        /// Configured per-message bound.
        bound: usize,
    },

    /// Framed message could never fit even an otherwise-empty packet; left
    /// in the outbox it would be skipped on every tick and never leave.
    #[error("framed message of {framed} bytes exceeds usable packet capacity {capacity}")]
    PacketBoundExceeded {
        /// Message wire size, header included.
        framed: usize,
        /// Packet bound minus header and empty-control framing.
        capacity: usize,
    },

    /// Per-message bound too small to hold even a fragment header.
    #[error("per-message bound {bound} cannot hold a {header}-byte fragment header")]
    MessageBoundTooSmall {
        /// Configured per-message bound.
        bound: usize,
        /// Fragment header wire size.
        header: usize,
    },

    /// No session exists for the given peer.
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
}

/// Errors from fragment bookkeeping and reassembly.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FragmentError {
    /// Two fragments of one envelope declared different totals.
    #[error("fragment count mismatch for envelope: expected {expected}, got {actual}")]
    CountMismatch {
        /// Count declared by the first-seen fragment.
        expected: u32,
        /// Count declared by the conflicting fragment.
        actual: u32,
    },

    /// Fragment index at or beyond the declared count.
    #[error("fragment index {index} out of range for count {count}")]
    IndexOutOfRange {
        /// Offending index.
        index: u32,
        /// Declared fragment count.
        count: u32,
    },

    /// Zero-count fragment header.
    #[error("fragment declares zero count")]
    ZeroCount,
}

/// Errors from envelope serialization, compression, and decompression.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// JSON serialization or deserialization failed.
    #[error("envelope serde error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Compression failed.
    #[error("compression failed: {0}")]
    Compression(String),

    /// Decompression failed or the data is malformed.
    #[error("decompression failed: {0}")]
    Decompression(String),

    /// Decompressed size exceeds the safety cap.
    #[error("decompressed size exceeded limit: {size} > {limit}")]
    SizeExceeded {
        /// Actual decompressed size.
        size: usize,
        /// Maximum allowed size.
        limit: usize,
    },

    /// Payload carried a content kind the envelope codec cannot decode.
    #[error("unexpected content kind for envelope payload")]
    UnexpectedKind,
}

/// Top-level error union.
#[derive(Debug, Error)]
pub enum FilewayError {
    /// Decode error.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Identity mismatch.
    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),

    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Engine error.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// Fragment error.
    #[error("fragment error: {0}")]
    Fragment(#[from] FragmentError),

    /// Envelope error.
    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
