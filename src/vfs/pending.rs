//! In-memory pending write state, per file handle. Created on first
//! write, merged on each subsequent write, destroyed on flush.

use std::collections::HashMap;
use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};

use super::types::{FileEntry, FileHandle, PayloadId};

/// Attribute snapshot taken before a write touched anything; clients use
/// it to detect concurrent modification.
#[derive(Debug, Clone, PartialEq)]
pub struct PreWriteAttr {
    pub size: u64,
    pub mtime: OffsetDateTime,
    pub ctime: OffsetDateTime,
    pub payload_id: PayloadId,
}

#[derive(Debug, Clone)]
pub struct PendingWrite {
    /// Largest size any commit on this handle has seen.
    pub max_size: u64,
    /// Latest modification time.
    pub mtime: OffsetDateTime,
    pub payload_id: PayloadId,
    /// Snapshot from the first write on the handle.
    pub pre_attr: PreWriteAttr,
    pub clear_setuid: bool,
    /// Validated record for the fast-path prepare on this handle.
    pub cached_entry: FileEntry,
    pub cow_source: Option<PayloadId>,
}

pub type PendingMap = HashMap<FileHandle, PendingWrite>;

#[derive(Debug, Default)]
pub struct PendingWrites {
    inner: Arc<RwLock<PendingMap>>,
}

impl PendingWrites {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fast-path lookup of the cached validated record, under the read
    /// lock.
    pub async fn cached_entry(&self, handle: &FileHandle) -> Option<FileEntry> {
        self.inner
            .read()
            .await
            .get(handle)
            .map(|p| p.cached_entry.clone())
    }

    pub async fn get(&self, handle: &FileHandle) -> Option<PendingWrite> {
        self.inner.read().await.get(handle).cloned()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    pub async fn handles(&self) -> Vec<FileHandle> {
        self.inner.read().await.keys().cloned().collect()
    }

    /// Create-or-merge: size ratchets up, modification time moves
    /// forward, the setuid-clear flag is sticky, and the pre-write
    /// snapshot and COW origin stay as the first write recorded them.
    pub async fn merge(&self, handle: &FileHandle, update: PendingWrite) {
        let mut map = self.inner.write().await;
        match map.get_mut(handle) {
            Some(existing) => {
                existing.max_size = existing.max_size.max(update.max_size);
                existing.mtime = update.mtime;
                existing.payload_id = update.payload_id;
                existing.clear_setuid |= update.clear_setuid;
                existing.cached_entry = update.cached_entry;
                if existing.cow_source.is_none() {
                    existing.cow_source = update.cow_source;
                }
            }
            None => {
                map.insert(handle.clone(), update);
            }
        }
    }

    /// Overlays pending size, times, mode-bit changes and the switched
    /// payload onto a stored record, so attribute readers see a coherent
    /// monotonic view.
    pub async fn overlay(&self, handle: &FileHandle, mut entry: FileEntry) -> FileEntry {
        if let Some(pending) = self.inner.read().await.get(handle) {
            entry.size = entry.size.max(pending.max_size);
            entry.mtime = pending.mtime;
            entry.ctime = pending.mtime;
            if pending.clear_setuid {
                entry.mode &= !0o6000;
            }
            entry.payload_id = pending.payload_id;
        }
        entry
    }

    /// Exclusive guard over the whole map; flush holds this across its
    /// store transaction so entry removal is atomic with the write.
    pub async fn lock_all(&self) -> OwnedRwLockWriteGuard<PendingMap> {
        Arc::clone(&self.inner).write_owned().await
    }
}
