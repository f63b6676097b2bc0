//! Assembly of the protocol front end: dispatcher wiring, the share
//! table with its per-share lock managers, and the cross-protocol lease
//! gate installed for foreign-protocol handlers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ServerConfig;
use crate::connection::{
    ConnectionState, DispatchOutcome, Dispatcher, IoctlHandler, NegotiateHandler,
    PreauthIngestHook,
};
use crate::context::OpContext;
use crate::locking::oplock::{self, OplockCheck, OplockChecker};
use crate::locking::{AccessIntent, ClientRegistry, LockManager, LockStore, RestartNotifier};
use crate::packets::guid::Guid;
use crate::packets::header::Command;
use crate::vfs::{ContentStore, FileHandle, FileIo, MetadataStore, ShareLocks, WritePipeline};

/// Lock managers by share name.
#[derive(Default)]
pub struct ShareSet {
    inner: std::sync::RwLock<HashMap<String, Arc<LockManager>>>,
}

impl ShareSet {
    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<LockManager>>> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn insert(&self, name: &str, manager: Arc<LockManager>) {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.insert(name.to_string(), manager);
    }

    pub fn get(&self, name: &str) -> Option<Arc<LockManager>> {
        self.read().get(name).cloned()
    }

    pub fn all(&self) -> Vec<Arc<LockManager>> {
        self.read().values().cloned().collect()
    }
}

impl ShareLocks for ShareSet {
    fn locks(&self, share: &str) -> Option<Arc<LockManager>> {
        self.get(share)
    }
}

/// The oplock checker exposed to foreign protocols: enumerates SMB
/// leases on the file, initiates breaks, and reports the break-pending
/// sentinel so the caller suspends until they drain.
pub struct LeaseBreakGate {
    shares: Arc<ShareSet>,
}

impl LeaseBreakGate {
    pub fn new(shares: Arc<ShareSet>) -> Self {
        LeaseBreakGate { shares }
    }

    async fn check(
        &self,
        ctx: &OpContext,
        handle: &FileHandle,
        intent: AccessIntent,
    ) -> crate::Result<OplockCheck> {
        let (share, file_id) = handle.decode()?;
        let Some(manager) = self.shares.get(&share) else {
            return Ok(OplockCheck::Clear);
        };
        if manager.break_leases(ctx, file_id, intent, None).await? {
            Ok(OplockCheck::Clear)
        } else {
            Ok(OplockCheck::BreakPending)
        }
    }
}

#[async_trait]
impl OplockChecker for LeaseBreakGate {
    async fn check_break_for_write(
        &self,
        ctx: &OpContext,
        handle: &FileHandle,
    ) -> crate::Result<OplockCheck> {
        self.check(ctx, handle, AccessIntent::Write).await
    }

    async fn check_break_for_read(
        &self,
        ctx: &OpContext,
        handle: &FileHandle,
    ) -> crate::Result<OplockCheck> {
        self.check(ctx, handle, AccessIntent::Read).await
    }

    async fn check_break_for_delete(
        &self,
        ctx: &OpContext,
        handle: &FileHandle,
    ) -> crate::Result<OplockCheck> {
        self.check(ctx, handle, AccessIntent::Unlink).await
    }
}

pub struct SmbServer {
    config: Arc<ServerConfig>,
    guid: Guid,
    dispatcher: Dispatcher,
    shares: Arc<ShareSet>,
    meta: Arc<dyn MetadataStore>,
    content: Arc<dyn ContentStore>,
    pipeline: Arc<WritePipeline>,
}

impl SmbServer {
    pub fn new(
        config: ServerConfig,
        meta: Arc<dyn MetadataStore>,
        content: Arc<dyn ContentStore>,
    ) -> crate::Result<Arc<Self>> {
        config.validate()?;
        let config = Arc::new(config);
        let guid = Guid::generate();
        let pipeline = WritePipeline::new(meta.clone(), &config);

        let mut dispatcher = Dispatcher::new();
        dispatcher.register_hook(Command::Negotiate, Arc::new(PreauthIngestHook));
        dispatcher.register_handler(
            Command::Negotiate,
            Arc::new(NegotiateHandler::new(config.clone(), guid)),
        );
        dispatcher.register_handler(Command::Ioctl, Arc::new(IoctlHandler));

        let shares = Arc::new(ShareSet::default());
        // Cross-protocol lease gate goes live with the front end.
        oplock::install_checker(Arc::new(LeaseBreakGate::new(shares.clone())));

        log::info!("SMB front end up, server guid {}", guid);
        Ok(Arc::new(SmbServer {
            config,
            guid,
            dispatcher,
            shares,
            meta,
            content,
            pipeline,
        }))
    }

    pub fn guid(&self) -> Guid {
        self.guid
    }

    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.config
    }

    pub fn shares(&self) -> &Arc<ShareSet> {
        &self.shares
    }

    pub fn pipeline(&self) -> &Arc<WritePipeline> {
        &self.pipeline
    }

    /// Attaches a share. Each share owns its lock manager, lock store and
    /// client registry.
    pub fn add_share(
        &self,
        name: &str,
        lock_store: Arc<dyn LockStore>,
        registry: Arc<dyn ClientRegistry>,
    ) -> Arc<LockManager> {
        let manager = LockManager::new(
            name,
            self.config.clone(),
            self.meta.clone(),
            lock_store,
            registry,
        );
        self.shares.insert(name, manager.clone());
        manager
    }

    /// Restart recovery: every share bumps its epoch once and opens its
    /// grace window; registered clients are notified so they reclaim.
    pub async fn recover(&self, notifier: Option<&dyn RestartNotifier>) -> crate::Result<()> {
        for manager in self.shares.all() {
            manager.recover(notifier).await?;
        }
        Ok(())
    }

    pub fn new_connection(&self, peer: impl Into<String>) -> Arc<ConnectionState> {
        Arc::new(ConnectionState::new(peer))
    }

    /// Entry point for the transport: one inbound raw message, one
    /// outcome. A `None` response with the drop flag means "close the
    /// socket, send nothing".
    pub async fn handle_message(
        &self,
        conn: &ConnectionState,
        ctx: &OpContext,
        raw: &[u8],
    ) -> crate::Result<DispatchOutcome> {
        self.dispatcher.dispatch(conn, ctx, raw).await
    }

    pub fn file_io(&self) -> FileIo {
        let shares: Arc<dyn ShareLocks> = self.shares.clone();
        FileIo::new(
            self.meta.clone(),
            self.content.clone(),
            self.pipeline.clone(),
            shares,
        )
    }

    /// Flushes all pending write state; the last call before the process
    /// exits.
    pub async fn shutdown(&self, ctx: &OpContext) -> crate::Result<()> {
        self.pipeline.flush_all(ctx).await
    }
}
