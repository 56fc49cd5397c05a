//! Per-peer session state: clocks, outbox, sent records, inbox.
//!
//! Pure data plus invariant-preserving mutators. Only the replication
//! engine touches this; one session is owned by exactly one peer context
//! (single-writer discipline enforced by the store's mutex).

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use crate::core::id::PeerId;
use crate::wire::message::Message;

/// One queued outbound message and its delivery bookkeeping.
#[derive(Debug, Clone)]
pub struct OutboxEntry {
    /// The message; its sequence id is assigned once and never changes.
    pub message: Message,
    /// When the entry was created.
    pub created_at: Instant,
    /// When the message last went out in a packet, if ever.
    pub last_sent_at: Option<Instant>,
    /// Packet id of the last packet that carried it.
    pub sent_in_packet: Option<u64>,
    /// When the peer acknowledged it, directly or by watermark.
    pub acked_at: Option<Instant>,
}

impl OutboxEntry {
    /// New unsent entry.
    pub fn new(message: Message, now: Instant) -> Self {
        Self {
            message,
            created_at: now,
            last_sent_at: None,
            sent_in_packet: None,
            acked_at: None,
        }
    }

    /// Whether the entry has been acknowledged.
    pub fn is_acked(&self) -> bool {
        self.acked_at.is_some()
    }
}

/// Record of one written packet, kept until the peer's received-clock state
/// proves every carried id was observed.
#[derive(Debug, Clone)]
pub struct SentRecord {
    /// Packet id (doubles as the ack nonce).
    pub packet_id: u64,
    /// When the packet was written.
    pub sent_at: Instant,
    /// Sequence ids carried; empty for a pure control packet.
    pub seq_ids: Vec<u64>,
    /// Set once every carried id is proven observed.
    pub acked: bool,
}

/// One received message and its acknowledgement bookkeeping.
#[derive(Debug, Clone)]
pub struct InboxEntry {
    /// Sequence id.
    pub seq: u64,
    /// Payload; `None` once consumed by the layer above. The entry itself
    /// lingers until housekeeping proves the double-ack.
    pub message: Option<Message>,
    /// Sender-declared packet timestamp, unix seconds.
    pub sent_timestamp: u64,
    /// Local receipt time.
    pub received_at: Instant,
    /// When our ack for it first went out in a control block.
    pub ack_published_at: Option<Instant>,
    /// When we concluded the sender has seen our ack.
    pub ack_acked_at: Option<Instant>,
}

/// All replication state for one ordered peer pair.
///
/// Clock invariants: `last_assigned_seq`, `peer_acked_watermark`,
/// `recv_watermark`, and `remote_last_sent` are monotonically
/// non-decreasing; sparse sets hold only ids strictly above their watermark.
#[derive(Debug)]
pub struct PeerSession {
    /// Our identity.
    pub local_id: PeerId,
    /// The remote peer's identity.
    pub remote_id: PeerId,

    /// Our Lamport clock: last sequence id assigned to an outbox entry.
    pub last_assigned_seq: u64,
    /// Outbox keyed by sequence id.
    pub outbox: BTreeMap<u64, OutboxEntry>,
    /// Last sequence id the peer has contiguously acknowledged.
    pub peer_acked_watermark: u64,
    /// Ids above the watermark the peer acknowledged individually.
    pub peer_acked_sparse: BTreeSet<u64>,

    /// Sent-packet records keyed by packet id.
    pub sent: BTreeMap<u64, SentRecord>,
    /// Next packet id to assign.
    pub next_packet_id: u64,

    /// Inbox keyed by sequence id.
    pub inbox: BTreeMap<u64, InboxEntry>,
    /// Last sequence id received from the remote with no gap before it.
    pub recv_watermark: u64,
    /// Ids received beyond a gap, mapped to the packet id that delivered
    /// them (the ack nonce we echo back).
    pub recv_sparse: BTreeMap<u64, u64>,
    /// The remote's Lamport clock as last declared in its control blocks.
    pub remote_last_sent: u64,

    /// Duplicate receipts observed; evidence of lost acks, not errors.
    pub duplicates_seen: u64,
}

impl PeerSession {
    /// Fresh session for one ordered pair.
    pub fn new(local_id: PeerId, remote_id: PeerId) -> Self {
        Self {
            local_id,
            remote_id,
            last_assigned_seq: 0,
            outbox: BTreeMap::new(),
            peer_acked_watermark: 0,
            peer_acked_sparse: BTreeSet::new(),
            sent: BTreeMap::new(),
            next_packet_id: 1,
            inbox: BTreeMap::new(),
            recv_watermark: 0,
            recv_sparse: BTreeMap::new(),
            remote_last_sent: 0,
            duplicates_seen: 0,
        }
    }

    /// Assign the next sequence id.
    pub fn next_seq(&mut self) -> u64 {
        self.last_assigned_seq += 1;
        self.last_assigned_seq
    }

    /// Assign the next packet id.
    pub fn take_packet_id(&mut self) -> u64 {
        let id = self.next_packet_id;
        self.next_packet_id += 1;
        id
    }

    /// Whether the peer has acknowledged this sequence id, by watermark or
    /// individually.
    pub fn is_acked_by_peer(&self, seq: u64) -> bool {
        seq <= self.peer_acked_watermark || self.peer_acked_sparse.contains(&seq)
    }

    /// Whether this sequence id has already been received from the remote.
    /// This is the dedup predicate; it must hold even after the inbox entry
    /// itself has been garbage-collected.
    pub fn already_received(&self, seq: u64) -> bool {
        seq <= self.recv_watermark || self.recv_sparse.contains_key(&seq)
    }

    /// Advance the receive watermark across any now-contiguous sparse ids.
    pub fn roll_up_recv_watermark(&mut self) {
        while self.recv_sparse.remove(&(self.recv_watermark + 1)).is_some() {
            self.recv_watermark += 1;
        }
    }

    /// Fully synchronized: everything we sent is acked, everything the
    /// remote declared sent has been received, no gaps either way.
    pub fn is_synchronized(&self) -> bool {
        self.peer_acked_watermark == self.last_assigned_seq
            && self.recv_watermark == self.remote_last_sent
            && self.peer_acked_sparse.is_empty()
            && self.recv_sparse.is_empty()
    }
}
