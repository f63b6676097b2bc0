//! The two-phase metadata write pipeline: `prepare → content write →
//! commit`, with deferred commit batching and copy-on-write fan-out for
//! hard-linked files. This is the sole mediator between protocol handlers
//! and the metadata store for file content operations.

use std::sync::Arc;

use time::OffsetDateTime;

use crate::config::ServerConfig;
use crate::context::OpContext;

use super::pending::{PendingWrite, PendingWrites, PreWriteAttr};
use super::store::MetadataStore;
use super::types::{
    check_access, AccessMode, AuthContext, FileEntry, FileHandle, FileType, ObjectId, PayloadId,
};

/// Everything a handler needs to write content and commit: where the
/// bytes go, what the file looked like beforehand, and whether this write
/// forked a hard-linked payload.
#[derive(Debug, Clone)]
pub struct WriteIntent {
    pub handle: FileHandle,
    /// Payload to write content into.
    pub payload_id: PayloadId,
    /// The write forked a hard-linked, finalized payload.
    pub cow: bool,
    pub cow_source: Option<PayloadId>,
    /// Intended size after the write.
    pub size: u64,
    pub pre_attr: PreWriteAttr,
}

pub struct WritePipeline {
    meta: Arc<dyn MetadataStore>,
    pending: PendingWrites,
    deferred: bool,
}

impl WritePipeline {
    pub fn new(meta: Arc<dyn MetadataStore>, config: &ServerConfig) -> Arc<Self> {
        Arc::new(WritePipeline {
            meta,
            pending: PendingWrites::new(),
            deferred: config.deferred_commit_enabled,
        })
    }

    pub fn pending(&self) -> &PendingWrites {
        &self.pending
    }

    /// Validates the write and hands back a write intent. Never mutates
    /// persistent metadata. A hard-linked file with finalized content
    /// gets a fresh payload id so concurrent links keep seeing the
    /// original bytes; the content layer is responsible for the copy.
    pub async fn prepare(
        &self,
        ctx: &OpContext,
        creds: &AuthContext,
        handle: &FileHandle,
        new_size: u64,
    ) -> crate::Result<WriteIntent> {
        ctx.check()?;
        if !creds.is_live() {
            return Err(crate::Error::AccessDenied(
                "authentication context expired".to_string(),
            ));
        }
        let (share, file_id) = handle.decode()?;
        let entry = match self.pending.cached_entry(handle).await {
            Some(entry) => entry,
            None => self.meta.get(&share, file_id).await?,
        };
        match entry.file_type {
            FileType::Regular => {}
            FileType::Directory => {
                return Err(crate::Error::IsDirectory(format!("{}/{}", share, file_id)))
            }
            _ => {
                return Err(crate::Error::InvalidArgument(
                    "write target is not a regular file".to_string(),
                ))
            }
        }
        check_access(&entry, creds, AccessMode::Write, true)?;

        let pre_attr = PreWriteAttr {
            size: entry.size,
            mtime: entry.mtime,
            ctime: entry.ctime,
            payload_id: entry.payload_id,
        };
        let (payload_id, cow, cow_source) = if entry.nlink > 1 && entry.is_finalized() {
            (PayloadId::generate(), true, Some(entry.payload_id))
        } else if entry.payload_id.is_zero() {
            (PayloadId::generate(), false, None)
        } else {
            (entry.payload_id, false, None)
        };
        if cow {
            log::debug!(
                "prepare on {}/{}: hard-linked payload forked to {:02x?}",
                share,
                file_id,
                payload_id.as_bytes()
            );
        }
        Ok(WriteIntent {
            handle: handle.clone(),
            payload_id,
            cow,
            cow_source,
            size: new_size,
            pre_attr,
        })
    }

    /// Records the completed content write. In deferred mode this only
    /// touches the in-memory pending tracker; otherwise the file record
    /// is updated in a store transaction right away.
    pub async fn commit(
        &self,
        ctx: &OpContext,
        creds: &AuthContext,
        intent: WriteIntent,
    ) -> crate::Result<()> {
        ctx.check()?;
        let now = OffsetDateTime::now_utc();
        let clear_setuid = !creds.is_superuser();
        let (share, file_id) = intent.handle.decode()?;

        if !self.deferred {
            let mut txn = self.meta.begin(&share).await?;
            let mut entry = txn.get(file_id).await?;
            entry.size = entry.size.max(intent.size);
            entry.mtime = now;
            entry.ctime = now;
            if clear_setuid {
                entry.mode &= !0o6000;
            }
            entry.payload_id = intent.payload_id;
            if intent.cow {
                entry.cow_source = intent.cow_source;
            }
            entry.object_id = ObjectId::ZERO;
            txn.put(entry).await?;
            txn.commit().await?;
            return Ok(());
        }

        let base = match self.pending.cached_entry(&intent.handle).await {
            Some(entry) => entry,
            None => self.meta.get(&share, file_id).await?,
        };
        let mut cached = base;
        cached.size = cached.size.max(intent.size);
        cached.mtime = now;
        cached.ctime = now;
        cached.payload_id = intent.payload_id;
        if clear_setuid {
            cached.mode &= !0o6000;
        }
        if intent.cow {
            cached.cow_source = intent.cow_source;
        }
        cached.object_id = ObjectId::ZERO;

        self.pending
            .merge(
                &intent.handle,
                PendingWrite {
                    max_size: intent.size,
                    mtime: now,
                    payload_id: intent.payload_id,
                    pre_attr: intent.pre_attr,
                    clear_setuid,
                    cached_entry: cached,
                    cow_source: intent.cow_source,
                },
            )
            .await;
        Ok(())
    }

    /// Applies the pending state for one handle to the store and drops
    /// it. Flushing a handle with nothing pending succeeds.
    pub async fn flush_handle(&self, ctx: &OpContext, handle: &FileHandle) -> crate::Result<()> {
        ctx.check()?;
        let mut map = self.pending.lock_all().await;
        let Some(pending) = map.get(handle).cloned() else {
            return Ok(());
        };
        self.flush_one(handle, &pending).await?;
        map.remove(handle);
        Ok(())
    }

    /// Shutdown path: flush every pending handle. The first failure is
    /// reported after the remaining handles were still attempted.
    pub async fn flush_all(&self, ctx: &OpContext) -> crate::Result<()> {
        ctx.check()?;
        let mut map = self.pending.lock_all().await;
        let handles: Vec<FileHandle> = map.keys().cloned().collect();
        let mut first_error = None;
        for handle in handles {
            let Some(pending) = map.get(&handle).cloned() else {
                continue;
            };
            match self.flush_one(&handle, &pending).await {
                Ok(()) => {
                    map.remove(&handle);
                }
                Err(err) => {
                    log::error!("flush of {:?} failed: {}", handle, err);
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Attribute read with pending deltas overlaid, so same-connection
    /// readers observe sizes and times monotonically.
    pub async fn get_attr(&self, ctx: &OpContext, handle: &FileHandle) -> crate::Result<FileEntry> {
        ctx.check()?;
        let (share, file_id) = handle.decode()?;
        let entry = self.meta.get(&share, file_id).await?;
        Ok(self.pending.overlay(handle, entry).await)
    }

    async fn flush_one(&self, handle: &FileHandle, pending: &PendingWrite) -> crate::Result<()> {
        let (share, file_id) = handle.decode()?;
        let mut txn = self.meta.begin(&share).await?;
        let mut entry = txn.get(file_id).await?;
        entry.size = entry.size.max(pending.max_size);
        entry.mtime = pending.mtime;
        entry.ctime = pending.mtime;
        if pending.clear_setuid {
            entry.mode &= !0o6000;
        }
        entry.payload_id = pending.payload_id;
        if let Some(source) = pending.cow_source {
            entry.cow_source = Some(source);
        }
        // The write de-finalizes the content until it is hashed again.
        entry.object_id = ObjectId::ZERO;
        txn.put(entry).await?;
        txn.commit().await?;
        log::debug!("flushed pending write for {}/{}", share, file_id);
        Ok(())
    }
}
