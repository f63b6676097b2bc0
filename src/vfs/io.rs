//! The operation layer protocol handlers call for file content I/O. It
//! composes the unified lock checks, the lease gate, and the two-phase
//! write pipeline in the required order: no byte reaches the content
//! store while a conflicting lock or unbroken lease stands.

use std::sync::Arc;

use time::OffsetDateTime;

use crate::context::OpContext;
use crate::locking::oplock::{self, OplockCheck};
use crate::locking::{AccessIntent, LockManager, LockOwner, LockRange};

use super::content::ContentStore;
use super::pipeline::WritePipeline;
use super::store::MetadataStore;
use super::types::{check_access, AccessMode, AuthContext, FileHandle};

/// Which front end an operation arrives from. SMB callers resolve lease
/// conflicts directly through the share's lock manager (their own leases
/// are exempt); foreign-protocol callers go through the installed oplock
/// checker, which is a no-op when no SMB front end is attached.
#[derive(Debug, Clone)]
pub enum Origin {
    Smb { client_id: String },
    Foreign,
}

/// Resolves the lock manager of a share; the server's share table
/// implements this.
pub trait ShareLocks: Send + Sync {
    fn locks(&self, share: &str) -> Option<Arc<LockManager>>;
}

pub struct FileIo {
    meta: Arc<dyn MetadataStore>,
    content: Arc<dyn ContentStore>,
    pipeline: Arc<WritePipeline>,
    shares: Arc<dyn ShareLocks>,
}

impl FileIo {
    pub fn new(
        meta: Arc<dyn MetadataStore>,
        content: Arc<dyn ContentStore>,
        pipeline: Arc<WritePipeline>,
        shares: Arc<dyn ShareLocks>,
    ) -> Self {
        FileIo {
            meta,
            content,
            pipeline,
            shares,
        }
    }

    pub async fn write(
        &self,
        ctx: &OpContext,
        creds: &AuthContext,
        origin: &Origin,
        owner: &LockOwner,
        handle: &FileHandle,
        offset: u64,
        data: &[u8],
    ) -> crate::Result<u64> {
        ctx.check()?;
        let (share, file_id) = handle.decode()?;
        let manager = self
            .shares
            .locks(&share)
            .ok_or_else(|| crate::Error::NotFound(share.clone()))?;

        // A write conflicts with any byte-range lock held by another
        // owner, whichever protocol took it.
        let range = LockRange::new(offset, data.len() as u64);
        manager.check_io(ctx, file_id, owner, range, true).await?;

        self.lease_gate(ctx, &manager, origin, handle, file_id, AccessIntent::Write)
            .await?;

        let end = offset.saturating_add(data.len() as u64);
        let intent = self.pipeline.prepare(ctx, creds, handle, end).await?;
        if intent.cow {
            if let Some(source) = intent.cow_source {
                self.content.copy(ctx, source, intent.payload_id).await?;
            }
        }
        self.content
            .write(ctx, intent.payload_id, offset, data)
            .await?;
        self.pipeline.commit(ctx, creds, intent).await?;
        Ok(data.len() as u64)
    }

    pub async fn read(
        &self,
        ctx: &OpContext,
        creds: &AuthContext,
        origin: &Origin,
        owner: &LockOwner,
        handle: &FileHandle,
        offset: u64,
        length: usize,
    ) -> crate::Result<Vec<u8>> {
        ctx.check()?;
        let (share, file_id) = handle.decode()?;
        let manager = self
            .shares
            .locks(&share)
            .ok_or_else(|| crate::Error::NotFound(share.clone()))?;

        // A read conflicts only with a foreign exclusive lock.
        let range = LockRange::new(offset, length as u64);
        manager.check_io(ctx, file_id, owner, range, false).await?;

        self.lease_gate(ctx, &manager, origin, handle, file_id, AccessIntent::Read)
            .await?;

        let entry = self.pipeline.get_attr(ctx, handle).await?;
        check_access(&entry, creds, AccessMode::Read, false)?;
        if offset >= entry.size {
            return Ok(Vec::new());
        }
        let length = length.min((entry.size - offset) as usize);
        self.content.read(ctx, entry.payload_id, offset, length).await
    }

    /// Drops one link. Every handle lease on the file is broken first; a
    /// link count of zero leaves an orphan for content garbage-collection.
    pub async fn remove(
        &self,
        ctx: &OpContext,
        creds: &AuthContext,
        origin: &Origin,
        handle: &FileHandle,
    ) -> crate::Result<()> {
        ctx.check()?;
        let (share, file_id) = handle.decode()?;
        let manager = self
            .shares
            .locks(&share)
            .ok_or_else(|| crate::Error::NotFound(share.clone()))?;

        self.lease_gate(ctx, &manager, origin, handle, file_id, AccessIntent::Unlink)
            .await?;

        // Settle pending write state before the namespace change.
        self.pipeline.flush_handle(ctx, handle).await?;

        let mut txn = self.meta.begin(&share).await?;
        let mut entry = txn.get(file_id).await?;
        check_access(&entry, creds, AccessMode::Write, false)?;
        entry.nlink = entry.nlink.saturating_sub(1);
        entry.ctime = OffsetDateTime::now_utc();
        if entry.is_orphan() {
            log::debug!("{}/{} is now an orphan awaiting collection", share, file_id);
        }
        txn.put(entry).await?;
        txn.commit().await?;
        Ok(())
    }

    /// Suspends the operation until conflicting leases are broken. The
    /// checker returns the break-pending sentinel; waiting and retrying
    /// is this caller's job.
    async fn lease_gate(
        &self,
        ctx: &OpContext,
        manager: &Arc<LockManager>,
        origin: &Origin,
        handle: &FileHandle,
        file_id: u64,
        intent: AccessIntent,
    ) -> crate::Result<()> {
        match origin {
            Origin::Foreign => loop {
                ctx.check()?;
                let check = match intent {
                    AccessIntent::Read => oplock::check_read(ctx, handle).await?,
                    AccessIntent::Write => oplock::check_write(ctx, handle).await?,
                    AccessIntent::Unlink => oplock::check_delete(ctx, handle).await?,
                };
                match check {
                    OplockCheck::Clear => return Ok(()),
                    OplockCheck::BreakPending => {
                        manager.wait_breaks_drained(ctx, file_id, intent, None).await?;
                    }
                }
            },
            Origin::Smb { client_id } => {
                if !manager
                    .break_leases(ctx, file_id, intent, Some(client_id))
                    .await?
                {
                    manager
                        .wait_breaks_drained(ctx, file_id, intent, Some(client_id))
                        .await?;
                }
                Ok(())
            }
        }
    }
}
