//! Persistence for lock records, keyed by synthetic lock id, plus the
//! single server-epoch cell. The in-memory implementation backs tests;
//! a durable store implements the same trait.

use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::sync_helpers::Mutex;
use crate::vfs::FileId;

use super::lease::LeaseKey;
use super::range::LockRange;
use super::{DenyMode, LockId, LockOwner, LockType};

/// The persistent shadow of a lease sub-record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedLease {
    pub key: LeaseKey,
    /// Raw lease-state bits (R=0x1, H=0x2, W=0x4).
    pub state: u32,
    pub epoch: u16,
}

/// The persistent shadow of a lock record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedLock {
    pub id: LockId,
    pub share: String,
    pub file_id: FileId,
    pub owner: LockOwner,
    pub client_id: String,
    pub lock_type: LockType,
    pub range: LockRange,
    pub deny_mode: DenyMode,
    pub acquired_at: OffsetDateTime,
    pub epoch: u64,
    pub lease: Option<PersistedLease>,
}

#[async_trait]
pub trait LockStore: Send + Sync {
    async fn put(&self, lock: &PersistedLock) -> crate::Result<()>;
    async fn remove(&self, id: LockId) -> crate::Result<()>;
    async fn list(&self) -> crate::Result<Vec<PersistedLock>>;

    async fn load_epoch(&self) -> crate::Result<u64>;
    async fn store_epoch(&self, epoch: u64) -> crate::Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryLockStore {
    locks: Mutex<HashMap<LockId, PersistedLock>>,
    epoch: Mutex<u64>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn put(&self, lock: &PersistedLock) -> crate::Result<()> {
        self.locks.lock().await.insert(lock.id, lock.clone());
        Ok(())
    }

    async fn remove(&self, id: LockId) -> crate::Result<()> {
        self.locks.lock().await.remove(&id);
        Ok(())
    }

    async fn list(&self) -> crate::Result<Vec<PersistedLock>> {
        Ok(self.locks.lock().await.values().cloned().collect())
    }

    async fn load_epoch(&self) -> crate::Result<u64> {
        Ok(*self.epoch.lock().await)
    }

    async fn store_epoch(&self, epoch: u64) -> crate::Result<()> {
        *self.epoch.lock().await = epoch;
        Ok(())
    }
}
