//! One end of the bridge: ties the transport, per-peer engines, the
//! fragment layer, and the envelope codec into a polling loop.

use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::core::constants::{HOUSEKEEPING_INTERVAL, SEND_TICK_INTERVAL};
use crate::core::error::{EngineError, FilewayError};
use crate::core::id::PeerId;
use crate::envelope::{CompressionConfig, Envelope, EnvelopeCodec};
use crate::engine::{EngineConfig, RetransmitTimer};
use crate::fragment::{self, EnvelopeTicket, FragmentHeader, Reassembler};
use crate::session::SessionStore;
use crate::transport::{PacketName, PacketTransport};
use crate::wire::packet::Packet;

/// Node tunables.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Per-peer engine config.
    pub engine: EngineConfig,
    /// Retransmission timing shared by all peers.
    pub timer: RetransmitTimer,
    /// Envelope compression policy.
    pub compression: CompressionConfig,
    /// Poll interval for [`Node::run`].
    pub tick_interval: Duration,
    /// Minimum spacing between housekeeping sweeps; a cycle skips the
    /// sweep when the last one is more recent than this.
    pub housekeeping_interval: Duration,
    /// Incomplete envelopes older than this are abandoned. Fragments are
    /// retransmitted reliably, so only a peer that disappeared for good
    /// leaves an envelope stuck this long.
    pub reassembly_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            timer: RetransmitTimer::new(),
            compression: CompressionConfig::default(),
            tick_interval: SEND_TICK_INTERVAL,
            housekeeping_interval: HOUSEKEEPING_INTERVAL,
            reassembly_timeout: Duration::from_secs(300),
        }
    }
}

/// A fully reassembled envelope handed to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Peer the envelope came from.
    pub peer: PeerId,
    /// The envelope itself.
    pub envelope: Envelope,
}

/// A replication endpoint bound to one transport.
///
/// `run_once` performs one receive / send / housekeeping cycle; `run`
/// repeats it on a timer until told to stop. Both sides of a bridge are
/// just two nodes pointed at the same folder.
pub struct Node<T: PacketTransport> {
    local_id: PeerId,
    transport: T,
    store: SessionStore,
    reassembler: Reassembler,
    codec: EnvelopeCodec,
    config: NodeConfig,
    last_sweep: Option<Instant>,
    completed_tx: mpsc::UnboundedSender<Delivery>,
    completed_rx: Option<mpsc::UnboundedReceiver<Delivery>>,
}

impl<T: PacketTransport> Node<T> {
    /// Node with default configuration.
    pub fn new(local_id: PeerId, transport: T) -> Self {
        Self::with_config(local_id, transport, NodeConfig::default())
    }

    /// Node with explicit configuration.
    pub fn with_config(local_id: PeerId, transport: T, config: NodeConfig) -> Self {
        let (completed_tx, completed_rx) = mpsc::unbounded_channel();
        Self {
            local_id,
            transport,
            store: SessionStore::new(local_id, config.timer, config.engine.clone()),
            reassembler: Reassembler::new(),
            codec: EnvelopeCodec::with_compression(config.compression.clone()),
            config,
            last_sweep: None,
            completed_tx,
            completed_rx: Some(completed_rx),
        }
    }

    /// This node's identity.
    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// Register a peer to replicate with. Idempotent.
    pub fn add_peer(&mut self, remote_id: PeerId) {
        self.store.add_peer(remote_id);
    }

    /// Receiver of reassembled envelopes. Yields `None` after the first
    /// call; there is one consumer.
    pub fn take_completed(&mut self) -> Option<mpsc::UnboundedReceiver<Delivery>> {
        self.completed_rx.take()
    }

    /// Queue an envelope for a peer. Returns a ticket naming the sequence
    /// ids it rides on, usable for delivery tracking and selective resend.
    pub async fn send_envelope(
        &mut self,
        peer: PeerId,
        envelope: &Envelope,
    ) -> Result<EnvelopeTicket, FilewayError> {
        let handle = self
            .store
            .get(&peer)
            .ok_or(EngineError::UnknownPeer(peer))?;
        let (kind, bytes) = self.codec.encode(envelope)?;
        let mut messenger = handle.lock().await;
        let ticket = fragment::submit(&mut messenger, kind, &bytes)?;
        debug!(%peer, envelope = %ticket.envelope_id, fragments = ticket.seqs.len(), "envelope queued");
        Ok(ticket)
    }

    /// Resend exactly the unacknowledged fragments of an envelope,
    /// skipping their timeouts. Acked fragments are never resent.
    pub async fn expedite(&mut self, peer: PeerId, ticket: &EnvelopeTicket) -> Result<Vec<u64>, FilewayError> {
        let handle = self
            .store
            .get(&peer)
            .ok_or(EngineError::UnknownPeer(peer))?;
        let mut messenger = handle.lock().await;
        Ok(ticket.expedite_missing(&mut messenger))
    }

    /// One full cycle: ingest ready packet files, emit due packets, sweep.
    pub async fn run_once(&mut self) -> Result<(), FilewayError> {
        self.receive_phase().await?;
        self.send_phase().await?;
        self.housekeeping_phase().await;
        Ok(())
    }

    /// Poll until `shutdown` flips to true.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), FilewayError> {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        info!(local = %self.local_id, peers = self.store.len(), "node running");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        // Transport hiccups (folder briefly unreachable) are
                        // retried on the next tick.
                        warn!(error = %e, "cycle failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(local = %self.local_id, "node stopped");
        Ok(())
    }

    async fn receive_phase(&mut self) -> Result<(), FilewayError> {
        let ready = self.transport.list_ready(self.local_id).await?;
        for (name, bytes) in ready {
            self.ingest_file(name, &bytes).await?;
            // Every consumed file leaves the folder, valid or not. A
            // dropped packet is recovered by retransmission, not by
            // re-reading the same bad bytes forever.
            self.transport.remove(&name).await?;
        }
        Ok(())
    }

    async fn ingest_file(&mut self, name: PacketName, bytes: &[u8]) -> Result<(), FilewayError> {
        let Some(handle) = self.store.get(&name.sender) else {
            warn!(%name, "packet from unregistered peer dropped");
            return Ok(());
        };

        let packet = match Packet::decode(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                // Truncation in transit is the expected failure here.
                warn!(%name, error = %e, "undecodable packet file dropped");
                return Ok(());
            }
        };

        let mut messenger = handle.lock().await;
        let outcome = match messenger.receive_packet(&packet) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(%name, error = %e, "misdelivered packet dropped");
                return Ok(());
            }
        };

        for seq in outcome.accepted {
            let Some(message) = messenger.take_message(seq) else {
                continue;
            };
            let (header, chunk) = match FragmentHeader::split_payload(&message.payload) {
                Ok(parts) => parts,
                Err(e) => {
                    warn!(peer = %name.sender, seq, error = %e, "unframed message discarded");
                    continue;
                }
            };
            match self.reassembler.accept(header, message.header.kind, chunk) {
                Ok(Some(done)) => match self.codec.decode(done.kind, &done.data) {
                    Ok(envelope) => {
                        let _ = self.completed_tx.send(Delivery {
                            peer: name.sender,
                            envelope,
                        });
                    }
                    Err(e) => {
                        warn!(peer = %name.sender, envelope = %done.envelope_id, error = %e, "undecodable envelope discarded");
                    }
                },
                Ok(None) => {}
                Err(e) => {
                    warn!(peer = %name.sender, seq, error = %e, "fragment rejected");
                }
            }
        }
        Ok(())
    }

    async fn send_phase(&mut self) -> Result<(), FilewayError> {
        for (_, handle) in self.store.iter() {
            // Encode under the lock, write without it. record_sent
            // tolerates whatever happened to the session in between.
            let staged = {
                let mut messenger = handle.lock().await;
                messenger
                    .create_packet()
                    .map(|packet| (PacketName::from(&packet.header), packet.encode(), packet))
            };
            let Some((name, bytes, packet)) = staged else {
                continue;
            };
            self.transport.write_atomic(&name, &bytes).await?;
            handle.lock().await.record_sent(&packet);
        }
        Ok(())
    }

    async fn housekeeping_phase(&mut self) {
        let now = Instant::now();
        if self
            .last_sweep
            .is_some_and(|last| now.duration_since(last) < self.config.housekeeping_interval)
        {
            return;
        }
        self.last_sweep = Some(now);
        for (_, handle) in self.store.iter() {
            handle.lock().await.housekeeping();
        }
        if let Some(cutoff) = now.checked_sub(self.config.reassembly_timeout) {
            for envelope_id in self.reassembler.stale_envelopes(cutoff) {
                warn!(envelope = %envelope_id, "abandoning stale partial envelope");
                self.reassembler.discard(&envelope_id);
            }
        }
    }
}
