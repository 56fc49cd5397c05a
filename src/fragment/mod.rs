//! Fragmentation and reassembly of oversized payloads.
//!
//! A payload larger than the per-message bound is split into fragments,
//! each framed with a 24-byte header and enqueued as an ordinary message.
//! Every envelope payload goes through this framing, even when it fits in
//! a single fragment, so the receive path is uniform. Fragments share the
//! engine's reliability machinery: a lost fragment is retransmitted
//! individually, never the whole envelope (selective repeat).

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use tracing::warn;

use crate::core::constants::FRAGMENT_HEADER_SIZE;
use crate::core::error::{DecodeError, EngineError, FragmentError};
use crate::core::id::EnvelopeId;
use crate::engine::Messenger;
use crate::wire::cursor::Cursor;
use crate::wire::message::ContentKind;

/// Framing prefix of every fragment payload: envelope id, fragment index,
/// and total fragment count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    /// Envelope this fragment belongs to.
    pub envelope_id: EnvelopeId,
    /// Zero-based position within the envelope.
    pub index: u32,
    /// Total fragments in the envelope, at least 1.
    pub count: u32,
}

impl FragmentHeader {
    /// Serialize in front of a fragment chunk.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.envelope_id.as_bytes());
        out.extend_from_slice(&self.index.to_le_bytes());
        out.extend_from_slice(&self.count.to_le_bytes());
    }

    /// Split a message payload into its fragment header and chunk.
    pub fn split_payload(payload: &[u8]) -> Result<(Self, &[u8]), DecodeError> {
        let mut cursor = Cursor::new(payload);
        let envelope_id = EnvelopeId::from_bytes(cursor.take_array::<16>()?);
        let index = cursor.take_u32()?;
        let count = cursor.take_u32()?;
        let header = Self {
            envelope_id,
            index,
            count,
        };
        Ok((header, &payload[FRAGMENT_HEADER_SIZE..]))
    }
}

/// Split `data` into framed fragment payloads, each at most
/// `max_message_bytes` long including the header. An empty `data` still
/// yields one fragment. A bound with no room for payload beyond the
/// header is rejected.
pub fn split(
    envelope_id: EnvelopeId,
    data: &[u8],
    max_message_bytes: usize,
) -> Result<Vec<Vec<u8>>, EngineError> {
    if max_message_bytes <= FRAGMENT_HEADER_SIZE {
        return Err(EngineError::MessageBoundTooSmall {
            bound: max_message_bytes,
            header: FRAGMENT_HEADER_SIZE,
        });
    }
    let chunk_size = max_message_bytes - FRAGMENT_HEADER_SIZE;
    let count = data.len().div_ceil(chunk_size).max(1) as u32;

    let mut fragments = Vec::with_capacity(count as usize);
    for index in 0..count {
        let start = index as usize * chunk_size;
        let end = (start + chunk_size).min(data.len());
        let chunk = &data[start..end];
        let mut framed = Vec::with_capacity(FRAGMENT_HEADER_SIZE + chunk.len());
        FragmentHeader {
            envelope_id,
            index,
            count,
        }
        .encode_into(&mut framed);
        framed.extend_from_slice(chunk);
        fragments.push(framed);
    }
    Ok(fragments)
}

/// Split an envelope payload and enqueue every fragment, returning a
/// ticket naming the sequence ids the envelope rides on.
pub fn submit(
    messenger: &mut Messenger,
    kind: ContentKind,
    data: &[u8],
) -> Result<EnvelopeTicket, EngineError> {
    submit_at(messenger, kind, data, Instant::now())
}

/// [`submit`] at a given time.
pub fn submit_at(
    messenger: &mut Messenger,
    kind: ContentKind,
    data: &[u8],
    now: Instant,
) -> Result<EnvelopeTicket, EngineError> {
    let envelope_id = EnvelopeId::new();
    let fragments = split(envelope_id, data, messenger.config().max_message_bytes)?;
    let mut seqs = Vec::with_capacity(fragments.len());
    for framed in fragments {
        seqs.push(messenger.enqueue_at(kind, framed, now)?);
    }
    Ok(EnvelopeTicket { envelope_id, seqs })
}

/// Handle to one submitted envelope: which sequence ids carry it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeTicket {
    /// Envelope identity shared by every fragment.
    pub envelope_id: EnvelopeId,
    /// Sequence ids the fragments were enqueued under, in index order.
    pub seqs: Vec<u64>,
}

impl EnvelopeTicket {
    /// Fragment sequence ids the peer has not yet acknowledged.
    pub fn missing(&self, messenger: &Messenger) -> Vec<u64> {
        messenger.unacked_among(&self.seqs)
    }

    /// Every fragment is acknowledged.
    pub fn is_delivered(&self, messenger: &Messenger) -> bool {
        self.missing(messenger).is_empty()
    }

    /// Queue exactly the unacknowledged fragments for immediate resend,
    /// returning their ids. Acknowledged fragments are never resent.
    pub fn expedite_missing(&self, messenger: &mut Messenger) -> Vec<u64> {
        let missing = self.missing(messenger);
        messenger.expedite(&missing);
        missing
    }
}

/// One partially received envelope.
#[derive(Debug)]
struct PendingEnvelope {
    kind: ContentKind,
    count: u32,
    chunks: BTreeMap<u32, Vec<u8>>,
    first_seen: Instant,
}

/// A fully reassembled envelope payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedEnvelope {
    /// Envelope identity.
    pub envelope_id: EnvelopeId,
    /// Content kind of the carrying fragments.
    pub kind: ContentKind,
    /// Concatenated payload in fragment-index order.
    pub data: Vec<u8>,
}

/// Collects fragments across packets until envelopes complete.
///
/// Fragment arrival order is irrelevant; duplicates are absorbed. The
/// engine's dedup layer already filters redelivered sequence ids, so a
/// duplicate index here means two distinct messages claimed the same slot.
#[derive(Debug, Default)]
pub struct Reassembler {
    pending: HashMap<EnvelopeId, PendingEnvelope>,
}

impl Reassembler {
    /// Empty reassembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment. Returns the completed envelope once the last
    /// missing fragment arrives.
    pub fn accept(
        &mut self,
        header: FragmentHeader,
        kind: ContentKind,
        chunk: &[u8],
    ) -> Result<Option<CompletedEnvelope>, FragmentError> {
        self.accept_at(header, kind, chunk, Instant::now())
    }

    /// [`accept`](Self::accept) at a given time.
    pub fn accept_at(
        &mut self,
        header: FragmentHeader,
        kind: ContentKind,
        chunk: &[u8],
        now: Instant,
    ) -> Result<Option<CompletedEnvelope>, FragmentError> {
        if header.count == 0 {
            return Err(FragmentError::ZeroCount);
        }
        if header.index >= header.count {
            return Err(FragmentError::IndexOutOfRange {
                index: header.index,
                count: header.count,
            });
        }

        let pending = self
            .pending
            .entry(header.envelope_id)
            .or_insert_with(|| PendingEnvelope {
                kind,
                count: header.count,
                chunks: BTreeMap::new(),
                first_seen: now,
            });
        if pending.count != header.count {
            return Err(FragmentError::CountMismatch {
                expected: pending.count,
                actual: header.count,
            });
        }
        if pending.chunks.contains_key(&header.index) {
            warn!(
                envelope = %header.envelope_id,
                index = header.index,
                "duplicate fragment index ignored"
            );
            return Ok(None);
        }
        pending.chunks.insert(header.index, chunk.to_vec());

        if (pending.chunks.len() as u32) < pending.count {
            return Ok(None);
        }
        let done = match self.pending.remove(&header.envelope_id) {
            Some(done) => done,
            None => return Ok(None),
        };
        let mut data = Vec::with_capacity(done.chunks.values().map(Vec::len).sum());
        for chunk in done.chunks.into_values() {
            data.extend_from_slice(&chunk);
        }
        Ok(Some(CompletedEnvelope {
            envelope_id: header.envelope_id,
            kind: done.kind,
            data,
        }))
    }

    /// Fragment indices still missing for a pending envelope, or `None`
    /// if the envelope is unknown (never seen, or already completed).
    pub fn missing_indices(&self, envelope_id: &EnvelopeId) -> Option<Vec<u32>> {
        self.pending.get(envelope_id).map(|pending| {
            (0..pending.count)
                .filter(|index| !pending.chunks.contains_key(index))
                .collect()
        })
    }

    /// Number of envelopes still awaiting fragments.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Pending envelopes first seen before `cutoff`, oldest first. The
    /// caller decides whether to discard them.
    pub fn stale_envelopes(&self, cutoff: Instant) -> Vec<EnvelopeId> {
        let mut stale: Vec<(Instant, EnvelopeId)> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.first_seen < cutoff)
            .map(|(id, pending)| (pending.first_seen, *id))
            .collect();
        stale.sort();
        stale.into_iter().map(|(_, id)| id).collect()
    }

    /// Drop a pending envelope, losing its partial data.
    pub fn discard(&mut self, envelope_id: &EnvelopeId) -> bool {
        self.pending.remove(envelope_id).is_some()
    }
}
