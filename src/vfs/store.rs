//! The metadata store boundary. Multi-step updates run inside a
//! transaction; nested transactions are not supported. The in-memory
//! implementation serializes transactions behind one mutex and backs the
//! test suite; the durable store implements the same traits.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::types::{FileEntry, FileId};

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Point read outside any transaction.
    async fn get(&self, share: &str, file_id: FileId) -> crate::Result<FileEntry>;

    /// Opens a transaction over one share.
    async fn begin(&self, share: &str) -> crate::Result<Box<dyn MetadataTxn>>;
}

#[async_trait]
pub trait MetadataTxn: Send {
    async fn get(&mut self, file_id: FileId) -> crate::Result<FileEntry>;
    async fn put(&mut self, entry: FileEntry) -> crate::Result<()>;
    async fn remove(&mut self, file_id: FileId) -> crate::Result<()>;

    /// Atomically applies every staged write. Dropping the transaction
    /// without committing discards them.
    async fn commit(self: Box<Self>) -> crate::Result<()>;
}

type EntryMap = HashMap<(String, FileId), FileEntry>;

#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    entries: Arc<Mutex<EntryMap>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bootstrap helper: direct insert outside any transaction.
    pub async fn insert(&self, share: &str, entry: FileEntry) {
        self.entries
            .lock()
            .await
            .insert((share.to_string(), entry.file_id), entry);
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn get(&self, share: &str, file_id: FileId) -> crate::Result<FileEntry> {
        self.entries
            .lock()
            .await
            .get(&(share.to_string(), file_id))
            .cloned()
            .ok_or_else(|| crate::Error::NotFound(format!("{}/{}", share, file_id)))
    }

    async fn begin(&self, share: &str) -> crate::Result<Box<dyn MetadataTxn>> {
        let guard = Arc::clone(&self.entries).lock_owned().await;
        Ok(Box::new(MemoryTxn {
            share: share.to_string(),
            guard,
            staged: HashMap::new(),
        }))
    }
}

struct MemoryTxn {
    share: String,
    guard: OwnedMutexGuard<EntryMap>,
    staged: HashMap<FileId, Option<FileEntry>>,
}

#[async_trait]
impl MetadataTxn for MemoryTxn {
    async fn get(&mut self, file_id: FileId) -> crate::Result<FileEntry> {
        if let Some(staged) = self.staged.get(&file_id) {
            return staged
                .clone()
                .ok_or_else(|| crate::Error::NotFound(format!("{}/{}", self.share, file_id)));
        }
        self.guard
            .get(&(self.share.clone(), file_id))
            .cloned()
            .ok_or_else(|| crate::Error::NotFound(format!("{}/{}", self.share, file_id)))
    }

    async fn put(&mut self, entry: FileEntry) -> crate::Result<()> {
        self.staged.insert(entry.file_id, Some(entry));
        Ok(())
    }

    async fn remove(&mut self, file_id: FileId) -> crate::Result<()> {
        self.staged.insert(file_id, None);
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> crate::Result<()> {
        let staged = std::mem::take(&mut self.staged);
        for (file_id, entry) in staged {
            match entry {
                Some(entry) => {
                    self.guard.insert((self.share.clone(), file_id), entry);
                }
                None => {
                    self.guard.remove(&(self.share.clone(), file_id));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::types::tests::regular_file;
    use super::*;

    #[tokio::test]
    async fn test_uncommitted_txn_leaves_no_trace() {
        let store = MemoryMetadataStore::new();
        store.insert("public", regular_file(1, 0, 0, 0o644)).await;
        {
            let mut txn = store.begin("public").await.unwrap();
            let mut entry = txn.get(1).await.unwrap();
            entry.size = 4096;
            txn.put(entry).await.unwrap();
            // dropped without commit
        }
        assert_eq!(store.get("public", 1).await.unwrap().size, 0);
    }

    #[tokio::test]
    async fn test_commit_applies_staged_writes() {
        let store = MemoryMetadataStore::new();
        store.insert("public", regular_file(1, 0, 0, 0o644)).await;
        let mut txn = store.begin("public").await.unwrap();
        let mut entry = txn.get(1).await.unwrap();
        entry.size = 4096;
        txn.put(entry).await.unwrap();
        txn.remove(99).await.unwrap(); // removing a missing id is staged, harmless
        txn.commit().await.unwrap();
        assert_eq!(store.get("public", 1).await.unwrap().size, 4096);
    }

    #[tokio::test]
    async fn test_txn_reads_its_own_writes() {
        let store = MemoryMetadataStore::new();
        store.insert("public", regular_file(1, 0, 0, 0o644)).await;
        let mut txn = store.begin("public").await.unwrap();
        let mut entry = txn.get(1).await.unwrap();
        entry.size = 100;
        txn.put(entry).await.unwrap();
        assert_eq!(txn.get(1).await.unwrap().size, 100);
        txn.remove(1).await.unwrap();
        assert!(txn.get(1).await.is_err());
        txn.commit().await.unwrap();
        assert!(store.get("public", 1).await.is_err());
    }
}
