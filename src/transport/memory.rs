//! In-memory transport for tests and loopback wiring.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::core::error::TransportError;
use crate::core::id::PeerId;

use super::{PacketName, PacketTransport};

#[derive(Default)]
struct Inner {
    folders: HashMap<PeerId, BTreeMap<PacketName, Vec<u8>>>,
    /// When set, the next write keeps only this many bytes. Models the
    /// transport's dominant failure mode, a file cut short in transit.
    truncate_next: Option<usize>,
}

/// Shared in-memory drop folder. Clones see the same folders, so two
/// nodes handed clones of one `MemoryTransport` are wired back to back.
///
/// Writes are atomic by construction, so everything listed is ready
/// immediately; there is no quiescence delay to wait out in tests.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryTransport {
    /// Empty shared folder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arrange for the next `write_atomic` to store only the first
    /// `keep_bytes` bytes of its packet, simulating a truncated transfer.
    pub async fn truncate_next(&self, keep_bytes: usize) {
        self.inner.lock().await.truncate_next = Some(keep_bytes);
    }

    /// Total packet files currently stored, across all recipients.
    pub async fn file_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.folders.values().map(BTreeMap::len).sum()
    }
}

impl PacketTransport for MemoryTransport {
    async fn list_ready(
        &self,
        recipient: PeerId,
    ) -> Result<Vec<(PacketName, Vec<u8>)>, TransportError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .folders
            .get(&recipient)
            .map(|folder| {
                folder
                    .iter()
                    .map(|(name, bytes)| (*name, bytes.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn write_atomic(&self, name: &PacketName, bytes: &[u8]) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().await;
        let stored = match inner.truncate_next.take() {
            Some(keep) => bytes[..keep.min(bytes.len())].to_vec(),
            None => bytes.to_vec(),
        };
        inner
            .folders
            .entry(name.recipient)
            .or_default()
            .insert(*name, stored);
        Ok(())
    }

    async fn remove(&self, name: &PacketName) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().await;
        if let Some(folder) = inner.folders.get_mut(&name.recipient) {
            folder.remove(name);
        }
        Ok(())
    }
}
