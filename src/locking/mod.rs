//! The unified lock and lease subsystem.
//!
//! One model spans the three lock-taking front ends — SMB byte-range
//! locks, the NLM byte-range protocol used by NFSv3 clients, and SMB
//! leases — so a handler from any protocol sees and resolves conflicts
//! against locks taken by any other.

pub mod graph;
pub mod lease;
pub mod manager;
pub mod oplock;
pub mod range;
pub mod registry;
pub mod store;

use std::fmt::Display;

pub use graph::WaitForGraph;
pub use lease::{Lease, LeaseKey, LeaseState};
pub use manager::{LeaseBreakNotice, LeaseBreakNotifier, LockManager, LockParams, LockRecord};
pub use oplock::{OplockCheck, OplockChecker};
pub use range::LockRange;
pub use registry::{ClientRegistration, ClientRegistry, MemoryClientRegistry, RestartNotifier};
pub use store::{LockStore, MemoryLockStore, PersistedLock};

/// Synthetic id a lock record keeps for its whole life, in memory and in
/// the lock store.
pub type LockId = u64;

/// Protocol-prefixed owner string, e.g. `"smb:sess-7/1234"` or
/// `"nlm:host.example/551"`. The owner distinguishes lock holders within
/// a client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockOwner(String);

impl LockOwner {
    pub fn new(owner: impl Into<String>) -> Self {
        LockOwner(owner.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for LockOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for LockOwner {
    fn from(value: &str) -> Self {
        LockOwner(value.to_string())
    }
}

impl From<String> for LockOwner {
    fn from(value: String) -> Self {
        LockOwner(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    Shared,
    Exclusive,
}

impl LockType {
    pub fn is_exclusive(&self) -> bool {
        matches!(self, LockType::Exclusive)
    }
}

/// What an operation is about to do to a file; drives which leases have
/// to be broken first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessIntent {
    Read,
    Write,
    Unlink,
}

/// Share-reservation mask carried on NLM share records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DenyMode {
    #[default]
    None,
    Read,
    Write,
    ReadWrite,
}

/// Who holds the conflicting lock, reported back to the requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConflict {
    pub owner: LockOwner,
    pub range: LockRange,
    pub exclusive: bool,
}

impl Display for LockConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} holds a {} lock over [{}, {})",
            self.owner,
            if self.exclusive { "exclusive" } else { "shared" },
            self.range.offset,
            self.range.end(),
        )
    }
}
