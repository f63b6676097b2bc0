//! The cross-protocol oplock boundary. A foreign-protocol handler asks
//! the installed checker before reading, writing or unlinking; the
//! checker enumerates SMB leases and starts breaks. With no SMB front
//! end attached the checks are no-ops.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::context::OpContext;
use crate::vfs::FileHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OplockCheck {
    /// No conflicting lease; the operation may proceed.
    Clear,
    /// Breaks were initiated; the caller must wait for them to drain and
    /// retry.
    BreakPending,
}

#[async_trait]
pub trait OplockChecker: Send + Sync {
    async fn check_break_for_write(
        &self,
        ctx: &OpContext,
        handle: &FileHandle,
    ) -> crate::Result<OplockCheck>;

    async fn check_break_for_read(
        &self,
        ctx: &OpContext,
        handle: &FileHandle,
    ) -> crate::Result<OplockCheck>;

    async fn check_break_for_delete(
        &self,
        ctx: &OpContext,
        handle: &FileHandle,
    ) -> crate::Result<OplockCheck>;
}

static CHECKER: RwLock<Option<Arc<dyn OplockChecker>>> = RwLock::new(None);

fn read_slot() -> Option<Arc<dyn OplockChecker>> {
    match CHECKER.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

/// Installs the checker. Set once when the SMB front end initializes;
/// replacing a live checker is logged because it usually means two front
/// ends were started in one process.
pub fn install_checker(checker: Arc<dyn OplockChecker>) {
    let mut guard = match CHECKER.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if guard.is_some() {
        log::warn!("replacing an already installed oplock checker");
    }
    *guard = Some(checker);
}

pub fn installed_checker() -> Option<Arc<dyn OplockChecker>> {
    read_slot()
}

pub async fn check_write(ctx: &OpContext, handle: &FileHandle) -> crate::Result<OplockCheck> {
    match read_slot() {
        Some(checker) => checker.check_break_for_write(ctx, handle).await,
        None => Ok(OplockCheck::Clear),
    }
}

pub async fn check_read(ctx: &OpContext, handle: &FileHandle) -> crate::Result<OplockCheck> {
    match read_slot() {
        Some(checker) => checker.check_break_for_read(ctx, handle).await,
        None => Ok(OplockCheck::Clear),
    }
}

pub async fn check_delete(ctx: &OpContext, handle: &FileHandle) -> crate::Result<OplockCheck> {
    match read_slot() {
        Some(checker) => checker.check_break_for_delete(ctx, handle).await,
        None => Ok(OplockCheck::Clear),
    }
}
