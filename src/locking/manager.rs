//! The per-share lock manager: byte-range tables, lease state machines,
//! the blocking-wait queue, grace-period reclaim, and persistence.
//!
//! One mutex guards the lock records, the wait queues and the waits-for
//! graph. Store writes happen inside that critical section; the in-memory
//! store makes them cheap, a durable store may queue behind a write-ahead
//! log.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::time::Instant;

use crate::config::ServerConfig;
use crate::context::OpContext;
use crate::sync_helpers::{Mutex, Notify};
use crate::vfs::{check_access, AccessMode, AuthContext, FileId, FileType, MetadataStore};

use super::graph::WaitForGraph;
use super::lease::{break_to_for, Lease, LeaseKey, LeaseState};
use super::range::LockRange;
use super::registry::{ClientRegistration, ClientRegistry, RestartNotifier};
use super::store::{LockStore, PersistedLease, PersistedLock};
use super::{AccessIntent, DenyMode, LockConflict, LockId, LockOwner, LockType};

#[derive(Debug, Clone)]
pub struct LockRecord {
    pub id: LockId,
    pub owner: LockOwner,
    pub client_id: String,
    pub lock_type: LockType,
    pub range: LockRange,
    pub deny_mode: DenyMode,
    pub acquired_at: OffsetDateTime,
    pub epoch: u64,
    pub reclaimed: bool,
    /// Present on lease records, which are full-file and exclusive at the
    /// record level; their conflict semantics come from the lease state
    /// machine, not the type and range.
    pub lease: Option<Lease>,
}

#[derive(Debug, Clone)]
pub struct LockParams {
    pub owner: LockOwner,
    pub client_id: String,
    pub lock_type: LockType,
    pub range: LockRange,
    pub deny_mode: DenyMode,
    /// Set when the client is re-establishing a pre-restart lock.
    pub reclaim: bool,
}

impl LockParams {
    pub fn exclusive(owner: impl Into<LockOwner>, client_id: &str, range: LockRange) -> Self {
        LockParams {
            owner: owner.into(),
            client_id: client_id.to_string(),
            lock_type: LockType::Exclusive,
            range,
            deny_mode: DenyMode::None,
            reclaim: false,
        }
    }

    pub fn shared(owner: impl Into<LockOwner>, client_id: &str, range: LockRange) -> Self {
        LockParams {
            lock_type: LockType::Shared,
            ..Self::exclusive(owner, client_id, range)
        }
    }

    pub fn reclaiming(self) -> Self {
        LockParams {
            reclaim: true,
            ..self
        }
    }
}

#[derive(Debug, Clone)]
pub struct LeaseBreakNotice {
    pub share: String,
    pub file_id: FileId,
    pub client_id: String,
    pub key: LeaseKey,
    pub current_state: LeaseState,
    pub new_state: LeaseState,
    pub epoch: u16,
}

/// Delivers break notifications to the owning client; the transport layer
/// supplies the real implementation.
#[async_trait]
pub trait LeaseBreakNotifier: Send + Sync {
    async fn lease_breaking(&self, notice: &LeaseBreakNotice);
}

#[derive(Debug)]
struct GraceState {
    deadline: Instant,
    had_clients: bool,
    expected: HashSet<String>,
    reclaimed: HashSet<String>,
}

#[derive(Default)]
struct LockTables {
    locks: HashMap<FileId, Vec<LockRecord>>,
    unlock_notify: HashMap<FileId, Arc<Notify>>,
    break_notify: HashMap<FileId, Arc<Notify>>,
    graph: WaitForGraph,
    next_id: LockId,
    grace: Option<GraceState>,
}

enum Attempt {
    Granted(LockId),
    Blocked {
        first: LockConflict,
        owners: Vec<LockOwner>,
    },
}

type UnlockCallback = Box<dyn Fn(FileId) + Send + Sync>;

pub struct LockManager {
    share: String,
    config: Arc<ServerConfig>,
    meta: Arc<dyn MetadataStore>,
    store: Arc<dyn LockStore>,
    registry: Arc<dyn ClientRegistry>,
    break_notifier: std::sync::RwLock<Option<Arc<dyn LeaseBreakNotifier>>>,
    unlock_callback: std::sync::RwLock<Option<UnlockCallback>>,
    epoch: AtomicU64,
    state: Mutex<LockTables>,
}

impl LockManager {
    pub fn new(
        share: impl Into<String>,
        config: Arc<ServerConfig>,
        meta: Arc<dyn MetadataStore>,
        store: Arc<dyn LockStore>,
        registry: Arc<dyn ClientRegistry>,
    ) -> Arc<Self> {
        Arc::new(LockManager {
            share: share.into(),
            config,
            meta,
            store,
            registry,
            break_notifier: std::sync::RwLock::new(None),
            unlock_callback: std::sync::RwLock::new(None),
            epoch: AtomicU64::new(0),
            state: Mutex::new(LockTables::default()),
        })
    }

    pub fn share(&self) -> &str {
        &self.share
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn set_break_notifier(&self, notifier: Arc<dyn LeaseBreakNotifier>) {
        let mut slot = match self.break_notifier.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(notifier);
    }

    /// Called after every successful unlock so the blocking-wait queue can
    /// re-examine pending requests; external observers hook in here too.
    pub fn set_unlock_callback(&self, callback: impl Fn(FileId) + Send + Sync + 'static) {
        let mut slot = match self.unlock_callback.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(Box::new(callback));
    }

    /// Bumps the server epoch, persists it, and opens the grace window.
    /// Previously registered clients are notified so they can reclaim.
    pub async fn recover(&self, notifier: Option<&dyn RestartNotifier>) -> crate::Result<u64> {
        let epoch = self.store.load_epoch().await? + 1;
        self.store.store_epoch(epoch).await?;
        self.epoch.store(epoch, Ordering::SeqCst);

        let clients = self.registry.list().await?;
        // New ids must not collide with pre-restart shadows still waiting
        // to be reclaimed.
        let highest_persisted = self
            .store
            .list()
            .await?
            .iter()
            .map(|p| p.id)
            .max()
            .unwrap_or(0);
        {
            let mut tables = self.state.lock().await;
            tables.next_id = tables.next_id.max(highest_persisted);
            tables.grace = Some(GraceState {
                deadline: Instant::now() + self.config.grace_period,
                had_clients: !clients.is_empty(),
                expected: clients.iter().map(|c| c.client_id.clone()).collect(),
                reclaimed: HashSet::new(),
            });
        }
        if let Some(notifier) = notifier {
            for client in &clients {
                notifier.notify_restart(client, epoch).await;
            }
        }
        log::info!(
            "share {:?}: entering grace at epoch {}, {} clients to reclaim",
            self.share,
            epoch,
            clients.len()
        );
        Ok(epoch)
    }

    pub async fn in_grace(&self) -> bool {
        let mut tables = self.state.lock().await;
        if self.expire_grace_if_due(&mut tables).await.is_err() {
            return false;
        }
        tables.grace.is_some()
    }

    pub async fn register_client(
        &self,
        ctx: &OpContext,
        registration: ClientRegistration,
    ) -> crate::Result<()> {
        ctx.check()?;
        self.registry.put(&registration).await
    }

    /// Removes a client from the grace bookkeeping and forgets its
    /// pre-restart locks. The monitoring service calls this when the host
    /// is confirmed down.
    pub async fn declare_client_dead(&self, client_id: &str) -> crate::Result<()> {
        let mut tables = self.state.lock().await;
        let epoch = self.epoch();
        for lock in self.store.list().await? {
            if lock.share == self.share && lock.client_id == client_id && lock.epoch < epoch {
                self.store.remove(lock.id).await?;
            }
        }
        self.registry.remove(client_id).await?;
        let done = match tables.grace.as_mut() {
            Some(grace) => {
                grace.expected.remove(client_id);
                grace.had_clients && grace.expected.is_subset(&grace.reclaimed)
            }
            None => false,
        };
        if done {
            self.finish_grace(&mut tables).await?;
        }
        Ok(())
    }

    /// Non-blocking acquire. Rejects with a conflict descriptor, grace,
    /// deadlock never (nothing waits), or the per-owner cap.
    pub async fn lock(
        &self,
        ctx: &OpContext,
        creds: &AuthContext,
        file_id: FileId,
        params: LockParams,
    ) -> crate::Result<LockId> {
        ctx.check()?;
        self.validate_target(creds, file_id, params.lock_type).await?;

        let mut tables = self.state.lock().await;
        self.expire_grace_if_due(&mut tables).await?;
        if tables.grace.is_some() {
            if params.reclaim {
                return self.reclaim_range_locked(&mut tables, file_id, params).await;
            }
            return Err(crate::Error::GracePeriod);
        }
        if params.reclaim {
            log::debug!(
                "share {:?}: reclaim from {:?} outside grace, treating as a fresh lock",
                self.share,
                params.client_id
            );
        }
        match self.try_insert(&mut tables, file_id, &params).await? {
            Attempt::Granted(id) => Ok(id),
            Attempt::Blocked { first, .. } => Err(crate::Error::Locked(first)),
        }
    }

    /// Blocking acquire: parks on the per-file wait queue until a
    /// conflicting lock goes away, the context gives up, or waiting would
    /// deadlock.
    pub async fn lock_wait(
        &self,
        ctx: &OpContext,
        creds: &AuthContext,
        file_id: FileId,
        params: LockParams,
    ) -> crate::Result<LockId> {
        ctx.check()?;
        self.validate_target(creds, file_id, params.lock_type).await?;

        loop {
            ctx.check()?;
            let mut tables = self.state.lock().await;
            self.expire_grace_if_due(&mut tables).await?;
            if tables.grace.is_some() {
                if params.reclaim {
                    return self.reclaim_range_locked(&mut tables, file_id, params).await;
                }
                return Err(crate::Error::GracePeriod);
            }
            let owners = match self.try_insert(&mut tables, file_id, &params).await? {
                Attempt::Granted(id) => {
                    tables.graph.remove_waiter(&params.owner);
                    return Ok(id);
                }
                Attempt::Blocked { owners, .. } => owners,
            };
            // Graph mutation happens under the same mutex as the conflict
            // scan; a stale edge cannot fake or hide a cycle.
            if tables.graph.would_deadlock(&params.owner, &owners) {
                tables.graph.remove_waiter(&params.owner);
                return Err(crate::Error::Deadlock);
            }
            tables.graph.add_edges(&params.owner, &owners);
            let notify = tables
                .unlock_notify
                .entry(file_id)
                .or_insert_with(|| Arc::new(Notify::new()))
                .clone();
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            drop(tables);

            tokio::select! {
                _ = &mut notified => {}
                _ = ctx.done() => {
                    let mut tables = self.state.lock().await;
                    tables.graph.remove_waiter(&params.owner);
                    return Err(crate::Error::Cancelled);
                }
            }
            let mut tables = self.state.lock().await;
            tables.graph.remove_waiter(&params.owner);
        }
    }

    /// Removes this owner's locks over `range`, splitting partially
    /// covered records into residual ranges. Unlocking nothing succeeds,
    /// for idempotent retries.
    pub async fn unlock(
        &self,
        ctx: &OpContext,
        file_id: FileId,
        owner: &LockOwner,
        range: LockRange,
    ) -> crate::Result<()> {
        ctx.check()?;
        let mut tables = self.state.lock().await;
        let mut records = tables.locks.remove(&file_id).unwrap_or_default();
        let mut kept = Vec::with_capacity(records.len());
        let mut removed_ids = Vec::new();
        let mut residual_records = Vec::new();
        for record in records.drain(..) {
            let affected =
                record.lease.is_none() && record.owner == *owner && record.range.overlaps(&range);
            if !affected {
                kept.push(record);
                continue;
            }
            removed_ids.push(record.id);
            for residual in record.range.subtract(&range) {
                tables.next_id += 1;
                let mut piece = record.clone();
                piece.id = tables.next_id;
                piece.range = residual;
                residual_records.push(piece);
            }
        }
        let removed_any = !removed_ids.is_empty();
        for id in &removed_ids {
            self.store.remove(*id).await?;
        }
        for piece in &residual_records {
            self.store.put(&self.persisted(file_id, piece)).await?;
        }
        kept.extend(residual_records);
        if !kept.is_empty() {
            tables.locks.insert(file_id, kept);
        }
        if removed_any {
            if let Some(notify) = tables.unlock_notify.get(&file_id) {
                notify.notify_waiters();
            }
        }
        drop(tables);
        if removed_any {
            let slot = match self.unlock_callback.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(callback) = slot.as_ref() {
                callback(file_id);
            }
        }
        Ok(())
    }

    /// NLM TEST: reports the first conflicting holder without mutating
    /// anything.
    pub async fn test_lock(
        &self,
        ctx: &OpContext,
        file_id: FileId,
        owner: &LockOwner,
        range: LockRange,
        lock_type: LockType,
    ) -> crate::Result<Option<LockConflict>> {
        ctx.check()?;
        let tables = self.state.lock().await;
        Ok(Self::first_conflict(
            &tables,
            file_id,
            owner,
            range,
            lock_type.is_exclusive(),
        ))
    }

    /// I/O-versus-lock conflict: a read conflicts only with an exclusive
    /// lock held by a different owner, a write with any lock held by a
    /// different owner.
    pub async fn check_io(
        &self,
        ctx: &OpContext,
        file_id: FileId,
        owner: &LockOwner,
        range: LockRange,
        write: bool,
    ) -> crate::Result<()> {
        ctx.check()?;
        let tables = self.state.lock().await;
        match Self::first_conflict(&tables, file_id, owner, range, write) {
            Some(conflict) => Err(crate::Error::Locked(conflict)),
            None => Ok(()),
        }
    }

    /// Grants a lease, downgrading the request against other clients'
    /// leases and breaking their conflicting write caching first. The
    /// granted state is returned; a request never receives W while another
    /// client's lease survives with content bits.
    pub async fn acquire_lease(
        &self,
        ctx: &OpContext,
        creds: &AuthContext,
        file_id: FileId,
        client_id: &str,
        owner: &LockOwner,
        key: LeaseKey,
        requested: LeaseState,
    ) -> crate::Result<LeaseState> {
        ctx.check()?;
        let entry = self.meta.get(&self.share, file_id).await?;
        if entry.file_type == FileType::Directory && !self.config.directory_leasing_enabled {
            return Err(crate::Error::NotSupported(
                "directory leasing is disabled".to_string(),
            ));
        }
        let mode = if requested.write_caching() {
            AccessMode::Write
        } else {
            AccessMode::Read
        };
        check_access(&entry, creds, mode, false)?;

        let mut notices = Vec::new();
        let granted;
        {
            let mut tables = self.state.lock().await;
            self.expire_grace_if_due(&mut tables).await?;
            if tables.grace.is_some() {
                return Err(crate::Error::GracePeriod);
            }
            let mut records = tables.locks.remove(&file_id).unwrap_or_default();

            let mut wanted = requested;
            let intent = if requested.write_caching() {
                AccessIntent::Write
            } else {
                AccessIntent::Read
            };
            let others_hold_leases = records
                .iter()
                .any(|r| r.lease.is_some() && r.client_id != client_id);
            if others_hold_leases {
                wanted.set_write_caching(false);
                for record in records.iter_mut() {
                    if record.client_id == client_id {
                        continue;
                    }
                    let Some(lease) = record.lease.as_mut() else {
                        continue;
                    };
                    if lease.breaking || !lease.obstructs(intent) {
                        continue;
                    }
                    let target = break_to_for(lease.state, intent);
                    lease.breaking = true;
                    lease.break_to = target;
                    lease.epoch = lease.epoch.wrapping_add(1);
                    notices.push(LeaseBreakNotice {
                        share: self.share.clone(),
                        file_id,
                        client_id: record.client_id.clone(),
                        key: lease.key,
                        current_state: lease.state,
                        new_state: target,
                        epoch: lease.epoch,
                    });
                }
            }

            if let Some(record) = records.iter_mut().find(|r| {
                r.client_id == client_id && r.lease.as_ref().is_some_and(|l| l.key == key)
            }) {
                // Same lease key: upgrade in place.
                let lease = record.lease.as_mut().ok_or(crate::Error::LockNotFound)?;
                lease.state = lease.state.union(&wanted);
                lease.epoch = lease.epoch.wrapping_add(1);
                granted = lease.state;
                let snapshot = record.clone();
                self.store.put(&self.persisted(file_id, &snapshot)).await?;
            } else {
                tables.next_id += 1;
                let record = LockRecord {
                    id: tables.next_id,
                    owner: owner.clone(),
                    client_id: client_id.to_string(),
                    lock_type: LockType::Exclusive,
                    range: LockRange::to_eof(0),
                    deny_mode: DenyMode::None,
                    acquired_at: OffsetDateTime::now_utc(),
                    epoch: self.epoch(),
                    reclaimed: false,
                    lease: Some(Lease::new(key, wanted)),
                };
                granted = wanted;
                self.store.put(&self.persisted(file_id, &record)).await?;
                records.push(record);
            }
            for record in records.iter().filter(|r| {
                r.lease.as_ref().is_some_and(|l| l.breaking) && r.client_id != client_id
            }) {
                self.store.put(&self.persisted(file_id, record)).await?;
            }
            tables.locks.insert(file_id, records);
        }
        for notice in &notices {
            self.send_break_notice(notice).await;
        }
        log::debug!(
            "share {:?}: lease {:02x?} for {:?} granted {:?} (requested {:?})",
            self.share,
            key,
            client_id,
            granted,
            requested
        );
        Ok(granted)
    }

    /// Initiates breaks of every lease on the file that obstructs
    /// `intent`, excluding `exclude_client`'s own. Returns `true` when the
    /// file is already clear, `false` when the caller must wait for the
    /// breaks to drain. Idempotent while breaks are outstanding.
    pub async fn break_leases(
        &self,
        ctx: &OpContext,
        file_id: FileId,
        intent: AccessIntent,
        exclude_client: Option<&str>,
    ) -> crate::Result<bool> {
        ctx.check()?;
        let mut notices = Vec::new();
        let clear;
        {
            let mut tables = self.state.lock().await;
            let mut records = tables.locks.remove(&file_id).unwrap_or_default();
            let mut blocked = false;
            for record in records.iter_mut() {
                if exclude_client.is_some_and(|c| c == record.client_id) {
                    continue;
                }
                let Some(lease) = record.lease.as_mut() else {
                    continue;
                };
                if lease.breaking {
                    // From break initiation to acknowledgement, nothing
                    // that needs the post-break state may proceed.
                    blocked = true;
                    continue;
                }
                if !lease.obstructs(intent) {
                    continue;
                }
                let target = break_to_for(lease.state, intent);
                lease.breaking = true;
                lease.break_to = target;
                lease.epoch = lease.epoch.wrapping_add(1);
                notices.push(LeaseBreakNotice {
                    share: self.share.clone(),
                    file_id,
                    client_id: record.client_id.clone(),
                    key: lease.key,
                    current_state: lease.state,
                    new_state: target,
                    epoch: lease.epoch,
                });
                blocked = true;
            }
            for record in records
                .iter()
                .filter(|r| r.lease.as_ref().is_some_and(|l| l.breaking))
            {
                self.store.put(&self.persisted(file_id, record)).await?;
            }
            if !records.is_empty() {
                tables.locks.insert(file_id, records);
            }
            clear = !blocked;
        }
        for notice in &notices {
            log::info!(
                "share {:?}: breaking lease {:02x?} of {:?} from {:?} to {:?}",
                self.share,
                notice.key,
                notice.client_id,
                notice.current_state,
                notice.new_state
            );
            self.send_break_notice(notice).await;
        }
        Ok(clear)
    }

    /// Waits until no lease on the file obstructs `intent`. If the break
    /// acknowledgement does not arrive within the configured timeout the
    /// break completes server-side and the wait returns: progress is
    /// forced rather than failed.
    pub async fn wait_breaks_drained(
        &self,
        ctx: &OpContext,
        file_id: FileId,
        intent: AccessIntent,
        exclude_client: Option<&str>,
    ) -> crate::Result<()> {
        let deadline = Instant::now() + self.config.lease_break_timeout;
        loop {
            if self.break_leases(ctx, file_id, intent, exclude_client).await? {
                return Ok(());
            }
            let notify = {
                let mut tables = self.state.lock().await;
                tables
                    .break_notify
                    .entry(file_id)
                    .or_insert_with(|| Arc::new(Notify::new()))
                    .clone()
            };
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            // Re-check after arming so an ack in between cannot be missed.
            if self.break_leases(ctx, file_id, intent, exclude_client).await? {
                return Ok(());
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    log::warn!(
                        "share {:?}: lease break on file {} timed out, completing server-side",
                        self.share,
                        file_id
                    );
                    self.force_complete_breaks(file_id).await?;
                    return Ok(());
                }
                _ = ctx.done() => return Err(crate::Error::Cancelled),
            }
        }
    }

    /// The client's break acknowledgement. The acknowledged state is
    /// clamped to the break-to state; a lease acknowledged down to nothing
    /// is released outright.
    pub async fn ack_lease_break(
        &self,
        ctx: &OpContext,
        file_id: FileId,
        key: LeaseKey,
        new_state: LeaseState,
    ) -> crate::Result<LeaseState> {
        ctx.check()?;
        let mut tables = self.state.lock().await;
        let accepted;
        let mut drop_id = None;
        let mut snapshot = None;
        {
            let records = tables
                .locks
                .get_mut(&file_id)
                .ok_or(crate::Error::LockNotFound)?;
            let record = records
                .iter_mut()
                .find(|r| r.lease.as_ref().is_some_and(|l| l.key == key))
                .ok_or(crate::Error::LockNotFound)?;
            let lease = record.lease.as_mut().ok_or(crate::Error::LockNotFound)?;
            if !lease.breaking {
                return Err(crate::Error::InvalidArgument(
                    "no lease break outstanding".to_string(),
                ));
            }
            accepted = new_state.intersect(&lease.break_to);
            if accepted != new_state {
                log::info!(
                    "share {:?}: clamping break ack {:?} to {:?}",
                    self.share,
                    new_state,
                    accepted
                );
            }
            lease.state = accepted;
            lease.breaking = false;
            if accepted.is_none() {
                drop_id = Some(record.id);
            } else {
                snapshot = Some(record.clone());
            }
        }
        if let Some(id) = drop_id {
            if let Some(records) = tables.locks.get_mut(&file_id) {
                records.retain(|r| r.id != id);
                if records.is_empty() {
                    tables.locks.remove(&file_id);
                }
            }
            self.store.remove(id).await?;
        } else if let Some(record) = snapshot {
            self.store.put(&self.persisted(file_id, &record)).await?;
        }
        if let Some(notify) = tables.break_notify.get(&file_id) {
            notify.notify_waiters();
        }
        Ok(accepted)
    }

    pub async fn release_lease(
        &self,
        ctx: &OpContext,
        file_id: FileId,
        key: LeaseKey,
    ) -> crate::Result<()> {
        ctx.check()?;
        let mut tables = self.state.lock().await;
        let records = tables
            .locks
            .get_mut(&file_id)
            .ok_or(crate::Error::LockNotFound)?;
        let position = records
            .iter()
            .position(|r| r.lease.as_ref().is_some_and(|l| l.key == key))
            .ok_or(crate::Error::LockNotFound)?;
        let record = records.remove(position);
        if records.is_empty() {
            tables.locks.remove(&file_id);
        }
        self.store.remove(record.id).await?;
        if let Some(notify) = tables.break_notify.get(&file_id) {
            notify.notify_waiters();
        }
        Ok(())
    }

    /// Re-materializes a pre-restart lease from its persisted record,
    /// looked up by the 16-byte key. A reclaim with a reduced state is
    /// accepted and logged.
    pub async fn reclaim_lease(
        &self,
        ctx: &OpContext,
        file_id: FileId,
        client_id: &str,
        owner: &LockOwner,
        key: LeaseKey,
        state: LeaseState,
    ) -> crate::Result<LeaseState> {
        ctx.check()?;
        let mut tables = self.state.lock().await;
        self.expire_grace_if_due(&mut tables).await?;
        let epoch = self.epoch();
        let previous = self
            .store
            .list()
            .await?
            .into_iter()
            .find(|p| {
                p.share == self.share
                    && p.file_id == file_id
                    && p.client_id == client_id
                    && p.epoch < epoch
                    && p.lease.as_ref().is_some_and(|l| l.key == key)
            })
            .ok_or(crate::Error::LockNotFound)?;
        let previous_lease = previous.lease.as_ref().ok_or(crate::Error::LockNotFound)?;
        let previous_state = LeaseState::from_bytes(previous_lease.state.to_le_bytes());
        if previous_state != state {
            log::info!(
                "share {:?}: lease {:02x?} reclaimed with {:?}, was {:?}",
                self.share,
                key,
                state,
                previous_state
            );
        }
        tables.next_id += 1;
        let mut lease = Lease::new(key, state);
        lease.epoch = previous_lease.epoch;
        let record = LockRecord {
            id: tables.next_id,
            owner: owner.clone(),
            client_id: client_id.to_string(),
            lock_type: LockType::Exclusive,
            range: LockRange::to_eof(0),
            deny_mode: previous.deny_mode,
            acquired_at: OffsetDateTime::now_utc(),
            epoch,
            reclaimed: true,
            lease: Some(lease),
        };
        self.store.remove(previous.id).await?;
        self.store.put(&self.persisted(file_id, &record)).await?;
        tables.locks.entry(file_id).or_default().push(record);
        self.note_reclaim(&mut tables, client_id).await?;
        Ok(state)
    }

    /// Current state of a lease, if present: `(state, breaking)`.
    pub async fn lease_state(&self, file_id: FileId, key: LeaseKey) -> Option<(LeaseState, bool)> {
        let tables = self.state.lock().await;
        tables.locks.get(&file_id).and_then(|records| {
            records.iter().find_map(|r| {
                r.lease
                    .as_ref()
                    .filter(|l| l.key == key)
                    .map(|l| (l.state, l.breaking))
            })
        })
    }

    /// Does any lease on the file (other than `exclude_client`'s)
    /// obstruct `intent` right now?
    pub async fn leases_obstruct(
        &self,
        file_id: FileId,
        intent: AccessIntent,
        exclude_client: Option<&str>,
    ) -> bool {
        let tables = self.state.lock().await;
        tables
            .locks
            .get(&file_id)
            .map(|records| {
                records.iter().any(|r| {
                    !exclude_client.is_some_and(|c| c == r.client_id)
                        && r.lease
                            .as_ref()
                            .is_some_and(|l| l.breaking || l.obstructs(intent))
                })
            })
            .unwrap_or(false)
    }

    pub async fn locks_on(&self, file_id: FileId) -> Vec<LockRecord> {
        let tables = self.state.lock().await;
        tables.locks.get(&file_id).cloned().unwrap_or_default()
    }

    // ---- internals ----

    async fn validate_target(
        &self,
        creds: &AuthContext,
        file_id: FileId,
        lock_type: LockType,
    ) -> crate::Result<()> {
        let entry = self.meta.get(&self.share, file_id).await?;
        if entry.file_type == FileType::Directory {
            return Err(crate::Error::IsDirectory(format!(
                "directories cannot be range-locked (file {})",
                file_id
            )));
        }
        let mode = if lock_type.is_exclusive() {
            AccessMode::Write
        } else {
            AccessMode::Read
        };
        check_access(&entry, creds, mode, false)
    }

    /// With `any_lock_conflicts`, every overlapping foreign lock is a
    /// conflict (writes, exclusive requests); otherwise only exclusive
    /// ones are (reads, shared requests).
    fn first_conflict(
        tables: &LockTables,
        file_id: FileId,
        owner: &LockOwner,
        range: LockRange,
        any_lock_conflicts: bool,
    ) -> Option<LockConflict> {
        tables.locks.get(&file_id).and_then(|records| {
            records
                .iter()
                .filter(|r| r.lease.is_none())
                .filter(|r| r.owner != *owner)
                .filter(|r| r.range.overlaps(&range))
                .find(|r| r.lock_type.is_exclusive() || any_lock_conflicts)
                .map(|r| LockConflict {
                    owner: r.owner.clone(),
                    range: r.range,
                    exclusive: r.lock_type.is_exclusive(),
                })
        })
    }

    async fn try_insert(
        &self,
        tables: &mut LockTables,
        file_id: FileId,
        params: &LockParams,
    ) -> crate::Result<Attempt> {
        let held = tables
            .locks
            .values()
            .flatten()
            .filter(|r| r.lease.is_none() && r.owner == params.owner)
            .count();
        if held >= self.config.max_locks_per_owner {
            return Err(crate::Error::TooManyLocks);
        }

        let conflicts: Vec<LockConflict> = tables
            .locks
            .get(&file_id)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.lease.is_none())
                    .filter(|r| r.owner != params.owner)
                    .filter(|r| r.range.overlaps(&params.range))
                    .filter(|r| r.lock_type.is_exclusive() || params.lock_type.is_exclusive())
                    .map(|r| LockConflict {
                        owner: r.owner.clone(),
                        range: r.range,
                        exclusive: r.lock_type.is_exclusive(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        if let Some(first) = conflicts.first().cloned() {
            let mut owners: Vec<LockOwner> = Vec::new();
            for conflict in &conflicts {
                if !owners.contains(&conflict.owner) {
                    owners.push(conflict.owner.clone());
                }
            }
            return Ok(Attempt::Blocked { first, owners });
        }

        tables.next_id += 1;
        let record = LockRecord {
            id: tables.next_id,
            owner: params.owner.clone(),
            client_id: params.client_id.clone(),
            lock_type: params.lock_type,
            range: params.range,
            deny_mode: params.deny_mode,
            acquired_at: OffsetDateTime::now_utc(),
            epoch: self.epoch(),
            reclaimed: false,
            lease: None,
        };
        let id = record.id;
        self.store.put(&self.persisted(file_id, &record)).await?;
        tables.locks.entry(file_id).or_default().push(record);
        Ok(Attempt::Granted(id))
    }

    /// Re-materializes a pre-restart byte-range lock from the store. The
    /// persisted record must belong to the claiming client and cover the
    /// quoted range; a reclaim with a different shape is accepted and
    /// logged.
    async fn reclaim_range_locked(
        &self,
        tables: &mut LockTables,
        file_id: FileId,
        params: LockParams,
    ) -> crate::Result<LockId> {
        let epoch = self.epoch();
        let previous = self
            .store
            .list()
            .await?
            .into_iter()
            .find(|p| {
                p.share == self.share
                    && p.file_id == file_id
                    && p.client_id == params.client_id
                    && p.owner == params.owner
                    && p.lease.is_none()
                    && p.epoch < epoch
                    && p.range.overlaps(&params.range)
            })
            .ok_or(crate::Error::LockNotFound)?;
        if previous.range != params.range || previous.lock_type != params.lock_type {
            log::info!(
                "share {:?}: {:?} reclaims [{}, +{}) {:?}, recorded [{}, +{}) {:?}",
                self.share,
                params.client_id,
                params.range.offset,
                params.range.length,
                params.lock_type,
                previous.range.offset,
                previous.range.length,
                previous.lock_type
            );
        }
        tables.next_id += 1;
        let record = LockRecord {
            id: tables.next_id,
            owner: params.owner.clone(),
            client_id: params.client_id.clone(),
            lock_type: params.lock_type,
            range: params.range,
            deny_mode: params.deny_mode,
            acquired_at: OffsetDateTime::now_utc(),
            epoch,
            reclaimed: true,
            lease: None,
        };
        let id = record.id;
        self.store.remove(previous.id).await?;
        self.store.put(&self.persisted(file_id, &record)).await?;
        tables.locks.entry(file_id).or_default().push(record);
        self.note_reclaim(tables, &params.client_id).await?;
        Ok(id)
    }

    async fn note_reclaim(&self, tables: &mut LockTables, client_id: &str) -> crate::Result<()> {
        let done = match tables.grace.as_mut() {
            Some(grace) => {
                grace.reclaimed.insert(client_id.to_string());
                grace.had_clients && grace.expected.is_subset(&grace.reclaimed)
            }
            None => false,
        };
        if done {
            log::info!(
                "share {:?}: every registered client reclaimed, ending grace early",
                self.share
            );
            self.finish_grace(tables).await?;
        }
        Ok(())
    }

    async fn expire_grace_if_due(&self, tables: &mut LockTables) -> crate::Result<()> {
        let due = matches!(&tables.grace, Some(grace) if Instant::now() >= grace.deadline);
        if due {
            self.finish_grace(tables).await?;
        }
        Ok(())
    }

    /// Closes the grace window and purges persisted records from earlier
    /// epochs that nobody reclaimed.
    async fn finish_grace(&self, tables: &mut LockTables) -> crate::Result<()> {
        tables.grace = None;
        let epoch = self.epoch();
        for lock in self.store.list().await? {
            if lock.share == self.share && lock.epoch < epoch {
                self.store.remove(lock.id).await?;
            }
        }
        log::info!("share {:?}: grace period over at epoch {}", self.share, epoch);
        Ok(())
    }

    /// Timeout path of the force-progress policy: apply the break-to
    /// state as if the client had acknowledged.
    async fn force_complete_breaks(&self, file_id: FileId) -> crate::Result<()> {
        let mut tables = self.state.lock().await;
        let mut records = tables.locks.remove(&file_id).unwrap_or_default();
        let mut kept = Vec::with_capacity(records.len());
        for mut record in records.drain(..) {
            let broke_to_nothing = match record.lease.as_mut() {
                Some(lease) if lease.breaking => {
                    lease.state = lease.break_to;
                    lease.breaking = false;
                    lease.state.is_none()
                }
                _ => {
                    kept.push(record);
                    continue;
                }
            };
            if broke_to_nothing {
                self.store.remove(record.id).await?;
            } else {
                self.store.put(&self.persisted(file_id, &record)).await?;
                kept.push(record);
            }
        }
        if !kept.is_empty() {
            tables.locks.insert(file_id, kept);
        }
        if let Some(notify) = tables.break_notify.get(&file_id) {
            notify.notify_waiters();
        }
        Ok(())
    }

    async fn send_break_notice(&self, notice: &LeaseBreakNotice) {
        let notifier = {
            let slot = match self.break_notifier.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            slot.clone()
        };
        if let Some(notifier) = notifier {
            notifier.lease_breaking(notice).await;
        }
    }

    fn persisted(&self, file_id: FileId, record: &LockRecord) -> PersistedLock {
        PersistedLock {
            id: record.id,
            share: self.share.clone(),
            file_id,
            owner: record.owner.clone(),
            client_id: record.client_id.clone(),
            lock_type: record.lock_type,
            range: record.range,
            deny_mode: record.deny_mode,
            acquired_at: record.acquired_at,
            epoch: record.epoch,
            lease: record.lease.as_ref().map(|l| PersistedLease {
                key: l.key,
                state: u32::from_le_bytes(l.state.into_bytes()),
                epoch: l.epoch,
            }),
        }
    }
}
