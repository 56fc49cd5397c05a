//! Per-peer replication state machine.
//!
//! Drives sending, batching, acking, retransmission, deduplication, and
//! housekeeping for one ordered peer pair. Sends are continuous and
//! pipelined, never lock-step: the send side, receive side, and
//! housekeeping sweep are independent operations that share the session
//! under the caller's single-writer discipline.

use std::collections::BTreeSet;
use std::time::Instant;

use tracing::{debug, warn};

use crate::core::constants::{
    MAX_MESSAGE_BYTES, MAX_PACKET_BYTES, MESSAGE_HEADER_SIZE, PACKET_HEADER_SIZE,
};
use crate::core::error::{EngineError, IdentityError};
use crate::session::peer::{InboxEntry, OutboxEntry, PeerSession, SentRecord};
use crate::wire::control::{AckEntry, ControlBlock};
use crate::wire::message::{ContentKind, Message};
use crate::wire::packet::Packet;

use super::timing::RetransmitTimer;

/// Tunables for one peer's engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Serialized packet bound; messages are appended greedily in
    /// sequence-id order until the next one would exceed it.
    pub max_packet_bytes: usize,
    /// Per-message payload bound.
    pub max_message_bytes: usize,
    /// Hardening option: ignore out-of-order acks whose nonce does not
    /// match a sent record carrying that id.
    pub verify_ack_nonces: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_packet_bytes: MAX_PACKET_BYTES,
            max_message_bytes: MAX_MESSAGE_BYTES,
            verify_ack_nonces: false,
        }
    }
}

/// What one received packet did to the session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiveOutcome {
    /// Sequence ids accepted into the inbox, in packet order.
    pub accepted: Vec<u64>,
    /// Messages skipped as duplicates. A duplicate is evidence the original
    /// ack was lost, not an error.
    pub duplicates: u64,
}

/// What one housekeeping sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HousekeepingReport {
    /// Acknowledged outbox entries removed.
    pub outbox_removed: usize,
    /// Proven sent records removed.
    pub sent_removed: usize,
    /// Double-acked, consumed inbox entries removed.
    pub inbox_removed: usize,
}

impl HousekeepingReport {
    /// True when the sweep removed nothing.
    pub fn is_empty(&self) -> bool {
        self.outbox_removed == 0 && self.sent_removed == 0 && self.inbox_removed == 0
    }
}

/// Replication engine for one ordered peer pair.
pub struct Messenger {
    session: PeerSession,
    timer: RetransmitTimer,
    config: EngineConfig,
    /// Control state as last written out, for idle suppression.
    last_published_control: Option<ControlBlock>,
}

impl Messenger {
    /// New engine with default timing and config.
    pub fn new(local_id: crate::core::id::PeerId, remote_id: crate::core::id::PeerId) -> Self {
        Self::with_config(local_id, remote_id, RetransmitTimer::new(), EngineConfig::default())
    }

    /// New engine with explicit timing and config.
    pub fn with_config(
        local_id: crate::core::id::PeerId,
        remote_id: crate::core::id::PeerId,
        timer: RetransmitTimer,
        config: EngineConfig,
    ) -> Self {
        Self {
            session: PeerSession::new(local_id, remote_id),
            timer,
            config,
            last_published_control: None,
        }
    }

    /// Read-only view of the session state.
    pub fn session(&self) -> &PeerSession {
        &self.session
    }

    /// Retransmission timer in use.
    pub fn timer(&self) -> &RetransmitTimer {
        &self.timer
    }

    /// Engine configuration in use.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Duplicate messages absorbed so far.
    pub fn duplicate_count(&self) -> u64 {
        self.session.duplicates_seen
    }

    /// Everything sent is acked and everything declared by the remote has
    /// arrived, with no gaps in either direction.
    pub fn is_synchronized(&self) -> bool {
        self.session.is_synchronized()
    }

    // -------------------------------------------------------------------------
    // Send side
    // -------------------------------------------------------------------------

    /// Queue a payload for delivery, assigning the next sequence id.
    pub fn enqueue(&mut self, kind: ContentKind, payload: Vec<u8>) -> Result<u64, EngineError> {
        self.enqueue_at(kind, payload, Instant::now())
    }

    /// Queue a payload at a given time.
    pub fn enqueue_at(
        &mut self,
        kind: ContentKind,
        payload: Vec<u8>,
        now: Instant,
    ) -> Result<u64, EngineError> {
        if payload.len() > self.config.max_message_bytes {
            return Err(EngineError::PayloadTooLarge {
                len: payload.len(),
                bound: self.config.max_message_bytes,
            });
        }
        // A message no packet can ever carry must not enter the outbox:
        // the packet builder would skip it on every tick and it would sit
        // unacked forever. Check against an empty control block; a fat
        // control only delays a fitting message, never strands it.
        let framed = MESSAGE_HEADER_SIZE + payload.len();
        let capacity = self
            .config
            .max_packet_bytes
            .saturating_sub(PACKET_HEADER_SIZE + ControlBlock::default().wire_size());
        if framed > capacity {
            return Err(EngineError::PacketBoundExceeded { framed, capacity });
        }
        let seq = self.session.next_seq();
        let message = Message::new(seq, kind, payload);
        self.session
            .outbox
            .insert(seq, OutboxEntry::new(message, now));
        Ok(seq)
    }

    /// Current acknowledgement state to publish.
    pub fn control_block(&self) -> ControlBlock {
        ControlBlock {
            last_sent: self.session.last_assigned_seq,
            last_contiguous_received: self.session.recv_watermark,
            out_of_order: self
                .session
                .recv_sparse
                .iter()
                .map(|(&seq, &nonce)| AckEntry { seq, nonce })
                .collect(),
        }
    }

    /// Build the next outbound packet, or `None` when there is nothing new
    /// to say: no retransmission-due messages and a control block identical
    /// to the last one written.
    pub fn create_packet(&mut self) -> Option<Packet> {
        self.create_packet_at(Instant::now())
    }

    /// Build the next outbound packet at a given time.
    ///
    /// Unacked outbox entries whose retransmission timeout has lapsed are
    /// appended greedily in sequence-id order up to the packet bound; an
    /// entry too large for the remaining budget is skipped so later, smaller
    /// ones can still ride along.
    pub fn create_packet_at(&mut self, now: Instant) -> Option<Packet> {
        let control = self.control_block();

        let mut budget = self
            .config
            .max_packet_bytes
            .saturating_sub(PACKET_HEADER_SIZE + control.wire_size());
        let mut messages = Vec::new();
        for (&seq, entry) in self.session.outbox.iter() {
            if entry.is_acked() || self.session.is_acked_by_peer(seq) {
                continue;
            }
            if let Some(last) = entry.last_sent_at {
                let timeout = self.timer.timeout_for(entry.message.payload.len());
                if now.duration_since(last) < timeout {
                    continue;
                }
            }
            let size = entry.message.wire_size();
            if size > budget {
                continue;
            }
            budget -= size;
            messages.push(entry.message.clone());
        }

        if messages.is_empty() && self.last_published_control.as_ref() == Some(&control) {
            return None;
        }

        let packet_id = self.session.take_packet_id();
        Some(Packet::new(
            self.session.local_id,
            self.session.remote_id,
            packet_id,
            messages,
            control,
        ))
    }

    /// Record that a packet produced by [`create_packet`] was handed to the
    /// transport: stamps carried entries, creates the sent record, and marks
    /// the acks it published.
    ///
    /// [`create_packet`]: Self::create_packet
    pub fn record_sent(&mut self, packet: &Packet) {
        self.record_sent_at(packet, Instant::now());
    }

    /// Record a sent packet at a given time.
    pub fn record_sent_at(&mut self, packet: &Packet, now: Instant) {
        let seq_ids: Vec<u64> = packet.messages.iter().map(Message::seq).collect();
        for &seq in &seq_ids {
            if let Some(entry) = self.session.outbox.get_mut(&seq) {
                if entry.is_acked() {
                    continue;
                }
                entry.last_sent_at = Some(now);
                entry.sent_in_packet = Some(packet.header.packet_id);
            }
        }

        self.session.sent.insert(
            packet.header.packet_id,
            SentRecord {
                packet_id: packet.header.packet_id,
                sent_at: now,
                // a pure control record is vacuously proven observed
                acked: seq_ids.is_empty(),
                seq_ids,
            },
        );

        // Mark which inbox acks this control block published.
        let control = &packet.control;
        for entry in self.session.inbox.values_mut() {
            if entry.ack_published_at.is_some() {
                continue;
            }
            let published = entry.seq <= control.last_contiguous_received
                || control.out_of_order.iter().any(|a| a.seq == entry.seq);
            if published {
                entry.ack_published_at = Some(now);
            }
        }

        self.last_published_control = Some(packet.control.clone());
        debug!(
            peer = %self.session.remote_id,
            packet_id = packet.header.packet_id,
            messages = packet.messages.len(),
            "packet sent"
        );
    }

    // -------------------------------------------------------------------------
    // Receive side
    // -------------------------------------------------------------------------

    /// Process one validated inbound packet.
    ///
    /// No response is generated here: acknowledgement propagates passively
    /// via the next outbound control block, bounding ack latency by the send
    /// tick rather than by a dedicated round trip.
    pub fn receive_packet(&mut self, packet: &Packet) -> Result<ReceiveOutcome, IdentityError> {
        self.receive_packet_at(packet, Instant::now())
    }

    /// Process one inbound packet at a given time.
    pub fn receive_packet_at(
        &mut self,
        packet: &Packet,
        now: Instant,
    ) -> Result<ReceiveOutcome, IdentityError> {
        packet.verify_identity(self.session.remote_id, self.session.local_id)?;

        self.apply_control(&packet.control, now);

        let carried: BTreeSet<u64> = packet.messages.iter().map(Message::seq).collect();
        let mut outcome = ReceiveOutcome::default();
        for message in &packet.messages {
            let seq = message.seq();
            if self.session.already_received(seq) {
                self.session.duplicates_seen += 1;
                outcome.duplicates += 1;
                continue;
            }
            self.session.inbox.insert(
                seq,
                InboxEntry {
                    seq,
                    message: Some(message.clone()),
                    sent_timestamp: packet.header.timestamp,
                    received_at: now,
                    ack_published_at: None,
                    ack_acked_at: None,
                },
            );
            if seq == self.session.recv_watermark + 1 {
                self.session.recv_watermark = seq;
                self.session.roll_up_recv_watermark();
            } else {
                self.session
                    .recv_sparse
                    .insert(seq, packet.header.packet_id);
            }
            outcome.accepted.push(seq);
        }

        self.detect_double_acks(&carried, now);

        if outcome.duplicates > 0 {
            debug!(
                peer = %self.session.remote_id,
                duplicates = outcome.duplicates,
                "absorbed duplicate messages"
            );
        }
        Ok(outcome)
    }

    /// Apply a control block to outbox/sent state.
    fn apply_control(&mut self, control: &ControlBlock, now: Instant) {
        let session = &mut self.session;

        if control.last_sent > session.remote_last_sent {
            session.remote_last_sent = control.last_sent;
        }

        // Contiguous acknowledgement watermark. A watermark above our own
        // clock would ack messages we never sent; clamp and note it.
        let mut watermark = control.last_contiguous_received;
        if watermark > session.last_assigned_seq {
            warn!(
                peer = %session.remote_id,
                claimed = watermark,
                assigned = session.last_assigned_seq,
                "peer acked beyond our clock; clamping"
            );
            watermark = session.last_assigned_seq;
        }
        if watermark > session.peer_acked_watermark {
            for (_, entry) in session
                .outbox
                .range_mut(session.peer_acked_watermark + 1..=watermark)
            {
                if entry.acked_at.is_none() {
                    entry.acked_at = Some(now);
                }
            }
            session.peer_acked_watermark = watermark;
            session.peer_acked_sparse = session
                .peer_acked_sparse
                .split_off(&(session.peer_acked_watermark + 1));
        }

        // Individual (out-of-order) acknowledgements.
        for ack in &control.out_of_order {
            if ack.seq > session.last_assigned_seq || ack.seq <= session.peer_acked_watermark {
                continue;
            }
            if self.config.verify_ack_nonces {
                let proven = session
                    .sent
                    .get(&ack.nonce)
                    .is_some_and(|record| record.seq_ids.contains(&ack.seq));
                if !proven {
                    warn!(
                        peer = %session.remote_id,
                        seq = ack.seq,
                        nonce = ack.nonce,
                        "out-of-order ack with unknown nonce ignored"
                    );
                    continue;
                }
            }
            if let Some(entry) = session.outbox.get_mut(&ack.seq) {
                if entry.acked_at.is_none() {
                    entry.acked_at = Some(now);
                }
            }
            session.peer_acked_sparse.insert(ack.seq);
        }

        // A sent record is proven once every carried id is observed.
        let watermark = session.peer_acked_watermark;
        let sparse = &session.peer_acked_sparse;
        for record in session.sent.values_mut() {
            if !record.acked {
                record.acked = record
                    .seq_ids
                    .iter()
                    .all(|seq| *seq <= watermark || sparse.contains(seq));
            }
        }
    }

    /// Double-ack detection, the inbox-GC heuristic: once our ack for an
    /// entry has been out for at least one base timeout and a later remote
    /// packet does not retransmit that id, the remote is presumed to have
    /// seen the ack. Liveness-only and explicitly approximate.
    fn detect_double_acks(&mut self, carried: &BTreeSet<u64>, now: Instant) {
        let grace = self.timer.base();
        for entry in self.session.inbox.values_mut() {
            if entry.ack_acked_at.is_some() || carried.contains(&entry.seq) {
                continue;
            }
            if let Some(published) = entry.ack_published_at {
                if now.duration_since(published) >= grace {
                    entry.ack_acked_at = Some(now);
                }
            }
        }
    }

    /// Hand a received message to the layer above, leaving the entry behind
    /// for acknowledgement bookkeeping.
    pub fn take_message(&mut self, seq: u64) -> Option<Message> {
        self.session
            .inbox
            .get_mut(&seq)
            .and_then(|entry| entry.message.take())
    }

    // -------------------------------------------------------------------------
    // Selective repeat
    // -------------------------------------------------------------------------

    /// Of the given sequence ids, those the peer has not yet acknowledged.
    pub fn unacked_among(&self, seqs: &[u64]) -> Vec<u64> {
        seqs.iter()
            .copied()
            .filter(|&seq| {
                seq <= self.session.last_assigned_seq && !self.session.is_acked_by_peer(seq)
            })
            .collect()
    }

    /// Clear the last-sent stamps of the given ids so the next packet
    /// carries exactly them, without waiting out their timeouts.
    pub fn expedite(&mut self, seqs: &[u64]) {
        for seq in seqs {
            if let Some(entry) = self.session.outbox.get_mut(seq) {
                if !entry.is_acked() {
                    entry.last_sent_at = None;
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Housekeeping
    // -------------------------------------------------------------------------

    /// Periodic sweep: drop acknowledged outbox entries, proven sent
    /// records, and double-acked consumed inbox entries.
    pub fn housekeeping(&mut self) -> HousekeepingReport {
        self.housekeeping_at(Instant::now())
    }

    /// Housekeeping sweep at a given time.
    pub fn housekeeping_at(&mut self, now: Instant) -> HousekeepingReport {
        let mut report = HousekeepingReport::default();
        let session = &mut self.session;

        // An outbox entry leaves only with proof of acknowledgement.
        let before = session.outbox.len();
        session.outbox.retain(|_, entry| !entry.is_acked());
        report.outbox_removed = before - session.outbox.len();

        let before = session.sent.len();
        session.sent.retain(|_, record| !record.acked);
        report.sent_removed = before - session.sent.len();

        // Remote silence long past the retransmission horizon also counts
        // as double-ack evidence; keeps idle sessions collectable.
        let silence_horizon = 3 * self.timer.base();
        for entry in session.inbox.values_mut() {
            if entry.ack_acked_at.is_none() {
                if let Some(published) = entry.ack_published_at {
                    if now.duration_since(published) >= silence_horizon {
                        entry.ack_acked_at = Some(now);
                    }
                }
            }
        }

        // Dedup stays exact after removal: the receive watermark covers
        // every removed id, so membership is never forgotten.
        let watermark = session.recv_watermark;
        let before = session.inbox.len();
        session.inbox.retain(|&seq, entry| {
            !(seq <= watermark && entry.message.is_none() && entry.ack_acked_at.is_some())
        });
        report.inbox_removed = before - session.inbox.len();

        if !report.is_empty() {
            debug!(
                peer = %session.remote_id,
                outbox = report.outbox_removed,
                sent = report.sent_removed,
                inbox = report.inbox_removed,
                "housekeeping sweep"
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::id::PeerId;
    use std::time::Duration;

    fn pair() -> (Messenger, Messenger) {
        let a = PeerId::new();
        let b = PeerId::new();
        (Messenger::new(a, b), Messenger::new(b, a))
    }

    fn fast_pair() -> (Messenger, Messenger) {
        let a = PeerId::new();
        let b = PeerId::new();
        let timer = RetransmitTimer::with_delays(Duration::from_millis(10), Duration::ZERO);
        (
            Messenger::with_config(a, b, timer, EngineConfig::default()),
            Messenger::with_config(b, a, timer, EngineConfig::default()),
        )
    }

    fn payload(n: u8) -> Vec<u8> {
        vec![n; 8]
    }

    #[test]
    fn test_enqueue_assigns_sequential_ids() {
        let (mut a, _) = pair();
        assert_eq!(a.enqueue(ContentKind::Binary, payload(1)).unwrap(), 1);
        assert_eq!(a.enqueue(ContentKind::Binary, payload(2)).unwrap(), 2);
        assert_eq!(a.session().last_assigned_seq, 2);
    }

    #[test]
    fn test_enqueue_rejects_oversized() {
        let a = PeerId::new();
        let b = PeerId::new();
        let config = EngineConfig {
            max_message_bytes: 4,
            ..EngineConfig::default()
        };
        let mut m = Messenger::with_config(a, b, RetransmitTimer::new(), config);
        assert!(matches!(
            m.enqueue(ContentKind::Binary, vec![0; 5]),
            Err(EngineError::PayloadTooLarge { len: 5, bound: 4 })
        ));
    }

    #[test]
    fn test_enqueue_rejects_message_no_packet_can_carry() {
        let config = EngineConfig {
            max_packet_bytes: 1024,
            max_message_bytes: 4096,
            ..EngineConfig::default()
        };
        let mut m = Messenger::with_config(
            PeerId::new(),
            PeerId::new(),
            RetransmitTimer::new(),
            config,
        );
        // Within the message bound but beyond what any packet can frame.
        assert!(matches!(
            m.enqueue(ContentKind::Binary, vec![0; 4096]),
            Err(EngineError::PacketBoundExceeded { .. })
        ));
        assert!(m.session().outbox.is_empty());

        // The rejection burns no sequence id.
        assert_eq!(m.enqueue(ContentKind::Binary, vec![0; 16]).unwrap(), 1);
    }

    #[test]
    fn test_first_packet_carries_all_queued() {
        let (mut a, _) = pair();
        let now = Instant::now();
        for i in 1..=3 {
            a.enqueue_at(ContentKind::Binary, payload(i), now).unwrap();
        }

        let packet = a.create_packet_at(now).unwrap();
        let seqs: Vec<u64> = packet.messages.iter().map(Message::seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(packet.control.last_sent, 3);
    }

    #[test]
    fn test_no_retransmit_before_timeout() {
        let (mut a, _) = pair();
        let now = Instant::now();
        a.enqueue_at(ContentKind::Binary, payload(1), now).unwrap();

        let packet = a.create_packet_at(now).unwrap();
        a.record_sent_at(&packet, now);

        // Within the timeout the message is considered in flight, and the
        // control block hasn't changed: nothing to send.
        assert!(a.create_packet_at(now + Duration::from_millis(1)).is_none());

        // Past the timeout it is retransmitted.
        let later = now + a.timer().timeout_for(8) + Duration::from_millis(1);
        let retry = a.create_packet_at(later).unwrap();
        assert_eq!(retry.messages.len(), 1);
        assert_eq!(retry.messages[0].seq(), 1);
    }

    #[test]
    fn test_watermark_ack_scenario() {
        // A sends 1..=5 in one packet; B's reply declares watermark 5;
        // housekeeping on A removes 1..=5 and must keep a later 6.
        let (mut a, mut b) = pair();
        let now = Instant::now();
        for i in 1..=5 {
            a.enqueue_at(ContentKind::Binary, payload(i), now).unwrap();
        }
        let packet = a.create_packet_at(now).unwrap();
        a.record_sent_at(&packet, now);

        let outcome = b.receive_packet_at(&packet, now).unwrap();
        assert_eq!(outcome.accepted, vec![1, 2, 3, 4, 5]);
        let reply = b.create_packet_at(now).unwrap();
        assert_eq!(reply.control.last_contiguous_received, 5);
        b.record_sent_at(&reply, now);

        a.receive_packet_at(&reply, now).unwrap();
        a.enqueue_at(ContentKind::Binary, payload(6), now).unwrap();

        let report = a.housekeeping_at(now);
        assert_eq!(report.outbox_removed, 5);
        assert!(a.session().outbox.contains_key(&6));
        assert_eq!(a.session().outbox.len(), 1);
    }

    #[test]
    fn test_housekeeping_never_removes_unacked() {
        let (mut a, _) = pair();
        let now = Instant::now();
        for i in 1..=4 {
            a.enqueue_at(ContentKind::Binary, payload(i), now).unwrap();
        }
        let packet = a.create_packet_at(now).unwrap();
        a.record_sent_at(&packet, now);

        let report = a.housekeeping_at(now + Duration::from_secs(3600));
        assert_eq!(report.outbox_removed, 0);
        assert_eq!(a.session().outbox.len(), 4);
    }

    #[test]
    fn test_duplicate_delivery_is_idempotent() {
        let (mut a, mut b) = pair();
        let now = Instant::now();
        for i in 1..=3 {
            a.enqueue_at(ContentKind::Binary, payload(i), now).unwrap();
        }
        let packet = a.create_packet_at(now).unwrap();
        a.record_sent_at(&packet, now);

        let first = b.receive_packet_at(&packet, now).unwrap();
        assert_eq!(first.accepted.len(), 3);
        assert_eq!(first.duplicates, 0);

        let watermark = b.session().recv_watermark;
        let inbox_len = b.session().inbox.len();

        // Byte-for-byte redelivery: no state change beyond the counter.
        let again = b.receive_packet_at(&packet, now).unwrap();
        assert!(again.accepted.is_empty());
        assert_eq!(again.duplicates, 3);
        assert_eq!(b.session().recv_watermark, watermark);
        assert_eq!(b.session().inbox.len(), inbox_len);
        assert_eq!(b.duplicate_count(), 3);
    }

    #[test]
    fn test_out_of_order_arrival_rolls_up() {
        let (mut a, mut b) = pair();
        let now = Instant::now();
        for i in 1..=3 {
            a.enqueue_at(ContentKind::Binary, payload(i), now).unwrap();
        }
        let full = a.create_packet_at(now).unwrap();
        a.record_sent_at(&full, now);

        // Deliver 1 and 3 first, then 2.
        let partial = Packet::new(
            full.header.sender,
            full.header.recipient,
            full.header.packet_id,
            vec![full.messages[0].clone(), full.messages[2].clone()],
            full.control.clone(),
        );
        b.receive_packet_at(&partial, now).unwrap();
        assert_eq!(b.session().recv_watermark, 1);
        assert!(b.session().recv_sparse.contains_key(&3));

        let rest = Packet::new(
            full.header.sender,
            full.header.recipient,
            99,
            vec![full.messages[1].clone()],
            full.control.clone(),
        );
        b.receive_packet_at(&rest, now).unwrap();
        assert_eq!(b.session().recv_watermark, 3);
        assert!(b.session().recv_sparse.is_empty());
    }

    #[test]
    fn test_selective_repeat_retransmits_exactly_missing() {
        let (mut a, mut b) = pair();
        let now = Instant::now();
        for i in 1..=6 {
            a.enqueue_at(ContentKind::Binary, payload(i), now).unwrap();
        }
        let full = a.create_packet_at(now).unwrap();
        a.record_sent_at(&full, now);

        // The transport loses fragments 2 and 5.
        let delivered: Vec<Message> = full
            .messages
            .iter()
            .filter(|m| m.seq() != 2 && m.seq() != 5)
            .cloned()
            .collect();
        let partial = Packet::new(
            full.header.sender,
            full.header.recipient,
            full.header.packet_id,
            delivered,
            full.control.clone(),
        );
        b.receive_packet_at(&partial, now).unwrap();

        let reply = b.create_packet_at(now).unwrap();
        assert_eq!(reply.control.last_contiguous_received, 1);
        let sparse: Vec<u64> = reply.control.out_of_order.iter().map(|e| e.seq).collect();
        assert_eq!(sparse, vec![3, 4, 6]);
        b.record_sent_at(&reply, now);

        a.receive_packet_at(&reply, now).unwrap();
        assert_eq!(a.unacked_among(&[1, 2, 3, 4, 5, 6]), vec![2, 5]);

        // After the timeout the next packet carries exactly {2, 5}.
        let later = now + a.timer().timeout_for(8) + Duration::from_millis(1);
        let retry = a.create_packet_at(later).unwrap();
        let seqs: Vec<u64> = retry.messages.iter().map(Message::seq).collect();
        assert_eq!(seqs, vec![2, 5]);
    }

    #[test]
    fn test_expedite_skips_timeout() {
        let (mut a, _) = pair();
        let now = Instant::now();
        for i in 1..=3 {
            a.enqueue_at(ContentKind::Binary, payload(i), now).unwrap();
        }
        let packet = a.create_packet_at(now).unwrap();
        a.record_sent_at(&packet, now);

        a.expedite(&[2]);
        let retry = a.create_packet_at(now + Duration::from_millis(1)).unwrap();
        let seqs: Vec<u64> = retry.messages.iter().map(Message::seq).collect();
        assert_eq!(seqs, vec![2]);
    }

    #[test]
    fn test_greedy_fill_respects_packet_bound() {
        let a = PeerId::new();
        let b = PeerId::new();
        let config = EngineConfig {
            // room for the header, control block, and roughly one 4 KiB
            // message, but not two
            max_packet_bytes: PACKET_HEADER_SIZE + 20 + 2 * 4096 - 1,
            ..EngineConfig::default()
        };
        let mut m = Messenger::with_config(a, b, RetransmitTimer::new(), config);
        let now = Instant::now();
        m.enqueue_at(ContentKind::Binary, vec![1; 4096], now).unwrap();
        m.enqueue_at(ContentKind::Binary, vec![2; 4096], now).unwrap();
        m.enqueue_at(ContentKind::Binary, vec![3; 16], now).unwrap();

        let packet = m.create_packet_at(now).unwrap();
        let seqs: Vec<u64> = packet.messages.iter().map(Message::seq).collect();
        // The second 4 KiB message does not fit; the small third one rides
        // along anyway.
        assert_eq!(seqs, vec![1, 3]);
        assert!(packet.wire_size() <= m.config.max_packet_bytes);
    }

    #[test]
    fn test_idle_suppression() {
        let (mut a, _) = pair();
        let now = Instant::now();

        // First packet publishes the (empty) control block.
        let hello = a.create_packet_at(now).unwrap();
        a.record_sent_at(&hello, now);

        // Nothing changed: stay quiet.
        assert!(a.create_packet_at(now + Duration::from_secs(1)).is_none());

        // New data wakes the sender up.
        a.enqueue_at(ContentKind::Binary, payload(1), now).unwrap();
        assert!(a.create_packet_at(now).is_some());
    }

    #[test]
    fn test_pure_control_packet_after_receive() {
        let (mut a, mut b) = pair();
        let now = Instant::now();
        a.enqueue_at(ContentKind::Binary, payload(1), now).unwrap();
        let packet = a.create_packet_at(now).unwrap();
        a.record_sent_at(&packet, now);

        let quiet = b.create_packet_at(now).unwrap();
        b.record_sent_at(&quiet, now);
        assert!(b.create_packet_at(now).is_none());

        // Receiving data changes the control block, so B speaks again even
        // with an empty outbox.
        b.receive_packet_at(&packet, now).unwrap();
        let reply = b.create_packet_at(now).unwrap();
        assert!(reply.messages.is_empty());
        assert_eq!(reply.control.last_contiguous_received, 1);
    }

    #[test]
    fn test_identity_mismatch_rejected_without_state_change() {
        let (mut a, mut b) = pair();
        let now = Instant::now();
        a.enqueue_at(ContentKind::Binary, payload(1), now).unwrap();
        let packet = a.create_packet_at(now).unwrap();
        a.record_sent_at(&packet, now);

        // C's engine must reject A->B traffic dropped in its folder.
        let mut c = Messenger::new(PeerId::new(), packet.header.sender);
        assert!(c.receive_packet_at(&packet, now).is_err());
        assert_eq!(c.session().recv_watermark, 0);
        assert!(c.session().inbox.is_empty());

        // B accepts the same bytes.
        assert!(b.receive_packet_at(&packet, now).is_ok());
    }

    #[test]
    fn test_sent_records_proven_and_swept() {
        let (mut a, mut b) = fast_pair();
        let now = Instant::now();
        for i in 1..=2 {
            a.enqueue_at(ContentKind::Binary, payload(i), now).unwrap();
        }
        let packet = a.create_packet_at(now).unwrap();
        a.record_sent_at(&packet, now);
        assert_eq!(a.session().sent.len(), 1);
        assert!(!a.session().sent[&packet.header.packet_id].acked);

        b.receive_packet_at(&packet, now).unwrap();
        let reply = b.create_packet_at(now).unwrap();
        b.record_sent_at(&reply, now);
        a.receive_packet_at(&reply, now).unwrap();

        assert!(a.session().sent[&packet.header.packet_id].acked);
        let report = a.housekeeping_at(now);
        assert_eq!(report.sent_removed, 1);
        assert!(a.session().sent.is_empty());
    }

    #[test]
    fn test_inbox_gc_after_double_ack() {
        let (mut a, mut b) = fast_pair();
        let t0 = Instant::now();
        a.enqueue_at(ContentKind::Binary, payload(1), t0).unwrap();
        let packet = a.create_packet_at(t0).unwrap();
        a.record_sent_at(&packet, t0);

        b.receive_packet_at(&packet, t0).unwrap();
        assert_eq!(b.take_message(1).unwrap().seq(), 1);
        let ack = b.create_packet_at(t0).unwrap();
        b.record_sent_at(&ack, t0);

        // Not yet double-acked: the entry stays.
        assert!(b.housekeeping_at(t0).inbox_removed == 0);

        // A later remote packet that does not retransmit seq 1, past the
        // grace period, proves the ack landed.
        a.receive_packet_at(&ack, t0).unwrap();
        a.enqueue_at(ContentKind::Binary, payload(2), t0).unwrap();
        let t1 = t0 + Duration::from_millis(20);
        let next = a.create_packet_at(t1).unwrap();
        a.record_sent_at(&next, t1);
        b.receive_packet_at(&next, t1).unwrap();

        let report = b.housekeeping_at(t1);
        assert_eq!(report.inbox_removed, 1);
        // Dedup survives the removal.
        assert!(b.session().already_received(1));
    }

    #[test]
    fn test_inbox_gc_on_remote_silence() {
        let (mut a, mut b) = fast_pair();
        let t0 = Instant::now();
        a.enqueue_at(ContentKind::Binary, payload(1), t0).unwrap();
        let packet = a.create_packet_at(t0).unwrap();
        a.record_sent_at(&packet, t0);

        b.receive_packet_at(&packet, t0).unwrap();
        b.take_message(1);
        let ack = b.create_packet_at(t0).unwrap();
        b.record_sent_at(&ack, t0);

        // No further traffic at all: the silence horizon collects it.
        let much_later = t0 + Duration::from_secs(60);
        let report = b.housekeeping_at(much_later);
        assert_eq!(report.inbox_removed, 1);
    }

    #[test]
    fn test_ack_nonce_verification() {
        let a_id = PeerId::new();
        let b_id = PeerId::new();
        let config = EngineConfig {
            verify_ack_nonces: true,
            ..EngineConfig::default()
        };
        let mut a = Messenger::with_config(a_id, b_id, RetransmitTimer::new(), config);
        let now = Instant::now();
        for i in 1..=3 {
            a.enqueue_at(ContentKind::Binary, payload(i), now).unwrap();
        }
        let packet = a.create_packet_at(now).unwrap();
        a.record_sent_at(&packet, now);
        let genuine_nonce = packet.header.packet_id;

        // A forged out-of-order ack with a bogus nonce is ignored; the
        // genuine one lands.
        let control = ControlBlock {
            last_sent: 0,
            last_contiguous_received: 0,
            out_of_order: vec![
                AckEntry { seq: 2, nonce: 777 },
                AckEntry {
                    seq: 3,
                    nonce: genuine_nonce,
                },
            ],
        };
        let reply = Packet::new(b_id, a_id, 1, Vec::new(), control);
        a.receive_packet_at(&reply, now).unwrap();

        assert!(!a.session().is_acked_by_peer(2));
        assert!(a.session().is_acked_by_peer(3));
    }

    #[test]
    fn test_bogus_watermark_clamped() {
        let (mut a, _) = pair();
        let now = Instant::now();
        a.enqueue_at(ContentKind::Binary, payload(1), now).unwrap();

        let control = ControlBlock {
            last_sent: 0,
            last_contiguous_received: 50,
            out_of_order: Vec::new(),
        };
        let reply = Packet::new(a.session().remote_id, a.session().local_id, 1, Vec::new(), control);
        a.receive_packet_at(&reply, now).unwrap();

        assert_eq!(a.session().peer_acked_watermark, 1);
    }

    #[test]
    fn test_full_sync_converges() {
        let (mut a, mut b) = fast_pair();
        let mut now = Instant::now();
        for i in 1..=4 {
            a.enqueue_at(ContentKind::Binary, payload(i), now).unwrap();
        }
        b.enqueue_at(ContentKind::Text, b"from b".to_vec(), now).unwrap();

        // A few alternating exchanges reach a synchronized fixpoint.
        for _ in 0..4 {
            if let Some(p) = a.create_packet_at(now) {
                a.record_sent_at(&p, now);
                b.receive_packet_at(&p, now).unwrap();
            }
            if let Some(p) = b.create_packet_at(now) {
                b.record_sent_at(&p, now);
                a.receive_packet_at(&p, now).unwrap();
            }
            now += Duration::from_millis(50);
        }

        assert!(a.is_synchronized());
        assert!(b.is_synchronized());
        a.housekeeping_at(now);
        b.housekeeping_at(now);
        assert!(a.session().outbox.is_empty());
        assert!(b.session().outbox.is_empty());
    }
}
