//! The content store boundary: a byte-addressable object store keyed by
//! payload id. The core only consumes this interface; the in-memory
//! implementation exists for tests and performs copy-on-write copies
//! eagerly where a production store would copy lazily.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::context::OpContext;
use crate::sync_helpers::Mutex;

use super::types::PayloadId;

#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn write(
        &self,
        ctx: &OpContext,
        payload: PayloadId,
        offset: u64,
        data: &[u8],
    ) -> crate::Result<()>;

    async fn read(
        &self,
        ctx: &OpContext,
        payload: PayloadId,
        offset: u64,
        length: usize,
    ) -> crate::Result<Vec<u8>>;

    /// Materializes `source`'s current bytes under `target`, for
    /// copy-on-write fan-out.
    async fn copy(
        &self,
        ctx: &OpContext,
        source: PayloadId,
        target: PayloadId,
    ) -> crate::Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryContentStore {
    blobs: Mutex<HashMap<PayloadId, Vec<u8>>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn write(
        &self,
        ctx: &OpContext,
        payload: PayloadId,
        offset: u64,
        data: &[u8],
    ) -> crate::Result<()> {
        ctx.check()?;
        let mut blobs = self.blobs.lock().await;
        let blob = blobs.entry(payload).or_default();
        let end = offset as usize + data.len();
        if blob.len() < end {
            blob.resize(end, 0);
        }
        blob[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    async fn read(
        &self,
        ctx: &OpContext,
        payload: PayloadId,
        offset: u64,
        length: usize,
    ) -> crate::Result<Vec<u8>> {
        ctx.check()?;
        let blobs = self.blobs.lock().await;
        let blob = blobs.get(&payload).map(|b| b.as_slice()).unwrap_or(&[]);
        let start = (offset as usize).min(blob.len());
        let end = (start + length).min(blob.len());
        Ok(blob[start..end].to_vec())
    }

    async fn copy(
        &self,
        ctx: &OpContext,
        source: PayloadId,
        target: PayloadId,
    ) -> crate::Result<()> {
        ctx.check()?;
        let mut blobs = self.blobs.lock().await;
        let bytes = blobs.get(&source).cloned().unwrap_or_default();
        blobs.insert(target, bytes);
        Ok(())
    }
}
