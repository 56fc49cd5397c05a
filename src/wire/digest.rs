//! Truncated BLAKE2b digests guarding wire sections.
//!
//! These are integrity checks against truncation and bitrot, not
//! authentication; sealing is an external transform outside this crate.

use blake2::digest::consts::{U16, U8};
use blake2::{Blake2b, Digest};

type Blake2b64 = Blake2b<U8>;
type Blake2b128 = Blake2b<U16>;

/// 8-byte digest over a header or control section.
pub fn section_digest(data: &[u8]) -> [u8; 8] {
    Blake2b64::digest(data).into()
}

/// 16-byte digest over a message payload.
pub fn content_digest(data: &[u8]) -> [u8; 16] {
    Blake2b128::digest(data).into()
}
