//! Shared-folder transport backed by the local filesystem.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::core::constants::QUIESCENCE_WINDOW;
use crate::core::error::TransportError;
use crate::core::id::PeerId;

use super::{PacketName, PacketTransport};

/// Last observed metadata of a not-yet-ready file.
#[derive(Debug, Clone, Copy)]
struct Seen {
    size: u64,
    modified: Option<SystemTime>,
    stable_since: Instant,
}

/// Drop-folder transport over a directory tree, one subdirectory per
/// recipient: `{root}/{recipient}/{sender}--{recipient}--{id}.packet`.
///
/// Writes go to a dot-prefixed temporary in the destination directory and
/// are renamed into place, so a name is only ever visible complete. Reads
/// additionally wait for quiescence (size and mtime unchanged for a full
/// window) because third-party producers dropping files into the folder
/// may copy them non-atomically.
pub struct FolderTransport {
    root: PathBuf,
    quiescence: Duration,
    seen: Mutex<HashMap<PacketName, Seen>>,
}

impl FolderTransport {
    /// Transport rooted at `root` with the default quiescence window.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_quiescence(root, QUIESCENCE_WINDOW)
    }

    /// Transport with an explicit quiescence window. Zero disables the
    /// stability wait, appropriate when every producer renames into place.
    pub fn with_quiescence(root: impl Into<PathBuf>, quiescence: Duration) -> Self {
        Self {
            root: root.into(),
            quiescence,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Folder this transport reads and writes under.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn recipient_dir(&self, recipient: PeerId) -> PathBuf {
        self.root.join(recipient.to_string())
    }

    /// True once the file's metadata has been identical for a full window.
    async fn is_quiescent(&self, name: PacketName, size: u64, modified: Option<SystemTime>) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock().await;
        let entry = seen.entry(name).or_insert(Seen {
            size,
            modified,
            stable_since: now,
        });
        if entry.size != size || entry.modified != modified {
            debug!(%name, size, "packet file still changing");
            *entry = Seen {
                size,
                modified,
                stable_since: now,
            };
            return false;
        }
        if now.duration_since(entry.stable_since) >= self.quiescence {
            seen.remove(&name);
            true
        } else {
            false
        }
    }
}

impl PacketTransport for FolderTransport {
    async fn list_ready(
        &self,
        recipient: PeerId,
    ) -> Result<Vec<(PacketName, Vec<u8>)>, TransportError> {
        let dir = self.recipient_dir(recipient);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ready = Vec::new();
        let mut present = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            // In-progress writes are dot-prefixed; anything unparseable is
            // not ours.
            if file_name.starts_with('.') {
                continue;
            }
            let name: PacketName = match file_name.parse() {
                Ok(name) => name,
                Err(_) => {
                    warn!(file = file_name, "ignoring foreign file in drop folder");
                    continue;
                }
            };
            if name.recipient != recipient {
                warn!(%name, "packet filed under the wrong recipient folder");
                continue;
            }
            present.push(name);

            let metadata = entry.metadata().await?;
            let modified = metadata.modified().ok();
            if !self.is_quiescent(name, metadata.len(), modified).await {
                continue;
            }
            let bytes = fs::read(entry.path()).await?;
            ready.push((name, bytes));
        }

        // Files deleted out from under us must not pin stale observations.
        self.seen
            .lock()
            .await
            .retain(|name, _| present.contains(name));

        Ok(ready)
    }

    async fn write_atomic(&self, name: &PacketName, bytes: &[u8]) -> Result<(), TransportError> {
        let dir = self.recipient_dir(name.recipient);
        fs::create_dir_all(&dir).await?;
        // Unique temp name so a retrying writer never races itself.
        let tmp = dir.join(format!(".{name}.{:08x}.tmp", rand::random::<u32>()));
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, dir.join(name.to_string())).await?;
        Ok(())
    }

    async fn remove(&self, name: &PacketName) -> Result<(), TransportError> {
        let path = self.recipient_dir(name.recipient).join(name.to_string());
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
