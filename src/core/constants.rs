//! Protocol constants.
//!
//! Wire sizes are fixed by the packet format; timing and bound values are
//! defaults that `EngineConfig` and the transport can override.

use std::time::Duration;

// =============================================================================
// WIRE FORMAT
// =============================================================================

/// Protocol version carried in every packet header.
pub const PROTOCOL_VERSION: u32 = 2;

/// Truncated BLAKE2b digest guarding the packet header and control block.
pub const HEADER_DIGEST_SIZE: usize = 8;

/// Truncated BLAKE2b digest guarding each message payload.
pub const CONTENT_DIGEST_SIZE: usize = 16;

/// Packet header wire size: two uuids + packet id + message count
/// + timestamp + version + digest.
pub const PACKET_HEADER_SIZE: usize = 16 + 16 + 8 + 4 + 8 + 4 + HEADER_DIGEST_SIZE;

/// Message header wire size: seq + content length + kind + digest.
pub const MESSAGE_HEADER_SIZE: usize = 8 + 4 + 2 + CONTENT_DIGEST_SIZE;

/// Fragment header prepended to every fragment payload:
/// envelope id + index + count.
pub const FRAGMENT_HEADER_SIZE: usize = 16 + 4 + 4;

/// Filename extension for packet files.
pub const PACKET_EXTENSION: &str = "packet";

// =============================================================================
// SIZE BOUNDS
// =============================================================================

/// Default serialized packet bound. Kept in the low tens of megabytes,
/// well under the transport's truncation risk threshold.
pub const MAX_PACKET_BYTES: usize = 32 * 1024 * 1024;

/// Default per-message payload bound, which is also the fragment slice size.
pub const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

// =============================================================================
// TIMING
// =============================================================================

/// Base retransmission timeout for an unacknowledged message.
pub const BASE_RETRANSMIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Additional retransmission delay per mebibyte of payload, so large
/// messages are not retransmitted while still plausibly in flight.
pub const RETRANSMIT_PER_MIB: Duration = Duration::from_secs(1);

/// A candidate file whose size and mtime are unchanged across this window
/// is judged fully written and ready to read.
pub const QUIESCENCE_WINDOW: Duration = Duration::from_secs(1);

/// Interval between node cycles, each a folder poll plus a send pass;
/// bounds passive ack latency.
pub const SEND_TICK_INTERVAL: Duration = Duration::from_millis(250);

/// Minimum spacing between housekeeping sweeps.
pub const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

// =============================================================================
// COMPRESSION
// =============================================================================

/// Minimum envelope size to attempt compression.
pub const MIN_COMPRESS_SIZE: usize = 64;

/// Default zstd compression level.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Default decompressed-size cap (DoS protection).
pub const MAX_DECOMPRESSED_SIZE: usize = 256 * 1024 * 1024;
