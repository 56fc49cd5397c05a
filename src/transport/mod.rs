//! Transport layer: moving packet files through the shared drop folder.
//!
//! The transport is deliberately dumb. It names files, writes them
//! atomically, lists the ones that look finished, and deletes consumed
//! ones. It never inspects packet contents; validation belongs to the
//! codec and engine above it.
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │              Node                       │
//! ├─────────────────────────────────────────┤
//! │         Engine + Codec                  │
//! ├─────────────────────────────────────────┤
//! │         Transport Layer                 │  ← This module
//! │   naming, atomic writes, readiness      │
//! ├─────────────────────────────────────────┤
//! │        Shared drop folder               │
//! └─────────────────────────────────────────┘
//! ```

mod folder;
mod memory;
mod name;

pub use folder::FolderTransport;
pub use memory::MemoryTransport;
pub use name::PacketName;

use std::future::Future;

use crate::core::error::TransportError;
use crate::core::id::PeerId;

/// A drop-folder backend.
///
/// Implementations must make `write_atomic` all-or-nothing from the
/// reader's point of view and must only return packets from `list_ready`
/// that will not change afterwards. Readiness is conservative: returning
/// a file late is fine, returning a still-growing file is not.
pub trait PacketTransport: Send {
    /// Finished packet files addressed to `recipient`, as raw bytes.
    fn list_ready(
        &self,
        recipient: PeerId,
    ) -> impl Future<Output = Result<Vec<(PacketName, Vec<u8>)>, TransportError>> + Send;

    /// Publish a packet file so no reader ever observes a partial write.
    fn write_atomic(
        &self,
        name: &PacketName,
        bytes: &[u8],
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Delete a consumed packet file. Deleting a missing file is not an
    /// error; a crashed consumer may retry.
    fn remove(&self, name: &PacketName) -> impl Future<Output = Result<(), TransportError>> + Send;
}
