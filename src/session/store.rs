//! Registry of active peer engines.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::core::id::PeerId;
use crate::engine::{EngineConfig, Messenger, RetransmitTimer};

/// Shared handle to one peer's engine. Each engine is locked as a whole;
/// the send path, receive path, and housekeeping for one peer serialize on
/// it while distinct peers proceed in parallel.
pub type MessengerHandle = Arc<Mutex<Messenger>>;

/// All peer engines of one local node.
pub struct SessionStore {
    local_id: PeerId,
    timer: RetransmitTimer,
    config: EngineConfig,
    peers: HashMap<PeerId, MessengerHandle>,
}

impl SessionStore {
    /// Empty store for the given local identity.
    pub fn new(local_id: PeerId, timer: RetransmitTimer, config: EngineConfig) -> Self {
        Self {
            local_id,
            timer,
            config,
            peers: HashMap::new(),
        }
    }

    /// Local identity all engines send as.
    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// Register a peer, creating its engine on first sight. Idempotent.
    pub fn add_peer(&mut self, remote_id: PeerId) -> MessengerHandle {
        Arc::clone(self.peers.entry(remote_id).or_insert_with(|| {
            Arc::new(Mutex::new(Messenger::with_config(
                self.local_id,
                remote_id,
                self.timer,
                self.config.clone(),
            )))
        }))
    }

    /// Engine for a known peer.
    pub fn get(&self, remote_id: &PeerId) -> Option<MessengerHandle> {
        self.peers.get(remote_id).map(Arc::clone)
    }

    /// All registered peers and their engines.
    pub fn iter(&self) -> impl Iterator<Item = (&PeerId, &MessengerHandle)> {
        self.peers.iter()
    }

    /// Number of registered peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// True when no peers are registered.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
