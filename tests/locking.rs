//! Byte-range locking: conflicts, splitting, blocking waits, deadlock
//! rejection, persistence, and grace-period reclaim.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::file_entry;

use smbd::config::ServerConfig;
use smbd::context::OpContext;
use smbd::locking::{
    ClientRegistration, LockManager, LockOwner, LockParams, LockRange, LockStore, LockType,
    MemoryClientRegistry, MemoryLockStore, RestartNotifier,
};
use smbd::vfs::{AuthContext, MemoryMetadataStore};
use smbd::Error;

use async_trait::async_trait;
use time::OffsetDateTime;

struct Fixture {
    manager: Arc<LockManager>,
    meta: Arc<MemoryMetadataStore>,
    lock_store: Arc<MemoryLockStore>,
    registry: Arc<MemoryClientRegistry>,
    config: Arc<ServerConfig>,
}

async fn fixture_with(config: ServerConfig) -> Fixture {
    let meta = Arc::new(MemoryMetadataStore::new());
    meta.insert("public", file_entry(1, 1000, 100, 0o666, 4096)).await;
    meta.insert("public", file_entry(2, 1000, 100, 0o666, 4096)).await;
    let lock_store = Arc::new(MemoryLockStore::new());
    let registry = Arc::new(MemoryClientRegistry::new());
    let config = Arc::new(config);
    let manager = LockManager::new(
        "public",
        config.clone(),
        meta.clone(),
        lock_store.clone(),
        registry.clone(),
    );
    Fixture {
        manager,
        meta,
        lock_store,
        registry,
        config,
    }
}

async fn fixture() -> Fixture {
    fixture_with(ServerConfig::default()).await
}

fn creds() -> AuthContext {
    AuthContext::user(1000, 100)
}

#[test_log::test(tokio::test)]
async fn test_exclusive_conflict_reports_holder() {
    let f = fixture().await;
    let ctx = OpContext::background();
    f.manager
        .lock(
            &ctx,
            &creds(),
            1,
            LockParams::exclusive("O1", "C1", LockRange::new(0, 100)),
        )
        .await
        .unwrap();

    let denied = f
        .manager
        .lock(
            &ctx,
            &creds(),
            1,
            LockParams::exclusive("O2", "C2", LockRange::new(50, 150)),
        )
        .await;
    match denied {
        Err(Error::Locked(conflict)) => {
            assert_eq!(conflict.owner, LockOwner::from("O1"));
            assert_eq!(conflict.range, LockRange::new(0, 100));
            assert!(conflict.exclusive);
        }
        other => panic!("expected a lock conflict, got {:?}", other.map(|_| ())),
    }
}

#[test_log::test(tokio::test)]
async fn test_shared_locks_coexist_but_block_exclusive() {
    let f = fixture().await;
    let ctx = OpContext::background();
    f.manager
        .lock(&ctx, &creds(), 1, LockParams::shared("O1", "C1", LockRange::new(0, 100)))
        .await
        .unwrap();
    f.manager
        .lock(&ctx, &creds(), 1, LockParams::shared("O2", "C2", LockRange::new(0, 100)))
        .await
        .unwrap();
    assert!(matches!(
        f.manager
            .lock(
                &ctx,
                &creds(),
                1,
                LockParams::exclusive("O3", "C3", LockRange::new(10, 10))
            )
            .await,
        Err(Error::Locked(_))
    ));
}

#[test_log::test(tokio::test)]
async fn test_same_owner_overlap_is_not_a_conflict() {
    let f = fixture().await;
    let ctx = OpContext::background();
    f.manager
        .lock(&ctx, &creds(), 1, LockParams::exclusive("O1", "C1", LockRange::new(0, 100)))
        .await
        .unwrap();
    f.manager
        .lock(&ctx, &creds(), 1, LockParams::exclusive("O1", "C1", LockRange::new(50, 100)))
        .await
        .unwrap();
}

#[test_log::test(tokio::test)]
async fn test_directories_cannot_be_locked() {
    let f = fixture().await;
    let mut dir = file_entry(9, 1000, 100, 0o777, 0);
    dir.file_type = smbd::vfs::FileType::Directory;
    f.meta.insert("public", dir).await;
    let ctx = OpContext::background();
    assert!(matches!(
        f.manager
            .lock(&ctx, &creds(), 9, LockParams::shared("O1", "C1", LockRange::new(0, 1)))
            .await,
        Err(Error::IsDirectory(_))
    ));
}

#[test_log::test(tokio::test)]
async fn test_permission_gates_lock_type() {
    let f = fixture().await;
    // Mode 444: readable, not writable.
    f.meta.insert("public", file_entry(3, 1000, 100, 0o444, 0)).await;
    let ctx = OpContext::background();
    let other = AuthContext::user(2000, 200);
    f.manager
        .lock(&ctx, &other, 3, LockParams::shared("O1", "C1", LockRange::new(0, 1)))
        .await
        .unwrap();
    assert!(matches!(
        f.manager
            .lock(&ctx, &other, 3, LockParams::exclusive("O1", "C1", LockRange::new(0, 1)))
            .await,
        Err(Error::PermissionDenied(_))
    ));
}

#[test_log::test(tokio::test)]
async fn test_unlock_is_idempotent() {
    let f = fixture().await;
    let ctx = OpContext::background();
    f.manager
        .unlock(&ctx, 1, &LockOwner::from("O1"), LockRange::new(0, 100))
        .await
        .unwrap();
}

#[test_log::test(tokio::test)]
async fn test_partial_unlock_splits_the_record() {
    let f = fixture().await;
    let ctx = OpContext::background();
    let owner = LockOwner::from("O1");
    f.manager
        .lock(&ctx, &creds(), 1, LockParams::exclusive("O1", "C1", LockRange::new(0, 100)))
        .await
        .unwrap();
    f.manager
        .unlock(&ctx, 1, &owner, LockRange::new(40, 20))
        .await
        .unwrap();

    let mut ranges: Vec<LockRange> = f
        .manager
        .locks_on(1)
        .await
        .into_iter()
        .map(|r| r.range)
        .collect();
    ranges.sort_by_key(|r| r.offset);
    assert_eq!(ranges, vec![LockRange::new(0, 40), LockRange::new(60, 40)]);

    // The hole is lockable by someone else now.
    f.manager
        .lock(&ctx, &creds(), 1, LockParams::exclusive("O2", "C2", LockRange::new(40, 20)))
        .await
        .unwrap();
    // Persistence mirrors the split.
    let persisted = f.lock_store.list().await.unwrap();
    assert_eq!(persisted.len(), 3);
}

#[test_log::test(tokio::test)]
async fn test_per_owner_cap() {
    let f = fixture_with(ServerConfig {
        max_locks_per_owner: 2,
        ..Default::default()
    })
    .await;
    let ctx = OpContext::background();
    for offset in [0u64, 10] {
        f.manager
            .lock(
                &ctx,
                &creds(),
                1,
                LockParams::exclusive("O1", "C1", LockRange::new(offset, 5)),
            )
            .await
            .unwrap();
    }
    assert!(matches!(
        f.manager
            .lock(&ctx, &creds(), 1, LockParams::exclusive("O1", "C1", LockRange::new(20, 5)))
            .await,
        Err(Error::TooManyLocks)
    ));
}

#[test_log::test(tokio::test)]
async fn test_test_lock_reports_without_mutating() {
    let f = fixture().await;
    let ctx = OpContext::background();
    f.manager
        .lock(&ctx, &creds(), 1, LockParams::exclusive("O1", "C1", LockRange::new(0, 100)))
        .await
        .unwrap();
    let holder = f
        .manager
        .test_lock(&ctx, 1, &LockOwner::from("O2"), LockRange::new(10, 1), LockType::Shared)
        .await
        .unwrap()
        .expect("a conflict");
    assert_eq!(holder.owner, LockOwner::from("O1"));
    assert_eq!(f.manager.locks_on(1).await.len(), 1);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_blocking_wait_wakes_on_unlock() {
    let f = fixture().await;
    let ctx = OpContext::background();
    f.manager
        .lock(&ctx, &creds(), 1, LockParams::exclusive("O1", "C1", LockRange::new(0, 100)))
        .await
        .unwrap();

    let manager = f.manager.clone();
    let waiter = tokio::spawn(async move {
        let ctx = OpContext::background();
        manager
            .lock_wait(
                &ctx,
                &creds(),
                1,
                LockParams::exclusive("O2", "C2", LockRange::new(0, 100)),
            )
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    f.manager
        .unlock(&ctx, 1, &LockOwner::from("O1"), LockRange::new(0, 100))
        .await
        .unwrap();
    waiter.await.unwrap().unwrap();
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_wait_cycle_is_rejected_as_deadlock() {
    let f = fixture().await;
    let ctx = OpContext::background();
    // O1 holds file 1, O2 holds file 2.
    f.manager
        .lock(&ctx, &creds(), 1, LockParams::exclusive("O1", "C1", LockRange::new(0, 10)))
        .await
        .unwrap();
    f.manager
        .lock(&ctx, &creds(), 2, LockParams::exclusive("O2", "C2", LockRange::new(0, 10)))
        .await
        .unwrap();

    // O1 parks waiting for file 2.
    let manager = f.manager.clone();
    let parked_ctx = OpContext::background();
    let parked_ctx_handle = parked_ctx.clone();
    let parked = tokio::spawn(async move {
        manager
            .lock_wait(
                &parked_ctx_handle,
                &creds(),
                2,
                LockParams::exclusive("O1", "C1", LockRange::new(0, 10)),
            )
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // O2 waiting for file 1 would close the cycle.
    assert!(matches!(
        f.manager
            .lock_wait(
                &ctx,
                &creds(),
                1,
                LockParams::exclusive("O2", "C2", LockRange::new(0, 10)),
            )
            .await,
        Err(Error::Deadlock)
    ));

    parked_ctx.cancel();
    assert!(matches!(parked.await.unwrap(), Err(Error::Cancelled)));
}

#[test_log::test(tokio::test)]
async fn test_unlock_callback_fires() {
    let f = fixture().await;
    let ctx = OpContext::background();
    let fired = Arc::new(std::sync::atomic::AtomicU64::new(0));
    let fired_in_callback = fired.clone();
    f.manager.set_unlock_callback(move |file_id| {
        fired_in_callback.store(file_id, std::sync::atomic::Ordering::SeqCst);
    });
    f.manager
        .lock(&ctx, &creds(), 1, LockParams::exclusive("O1", "C1", LockRange::new(0, 10)))
        .await
        .unwrap();
    f.manager
        .unlock(&ctx, 1, &LockOwner::from("O1"), LockRange::new(0, 10))
        .await
        .unwrap();
    assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 1);
}

struct RecordingNotifier {
    notified: std::sync::Mutex<Vec<(String, u64)>>,
}

#[async_trait]
impl RestartNotifier for RecordingNotifier {
    async fn notify_restart(&self, registration: &ClientRegistration, new_epoch: u64) {
        self.notified
            .lock()
            .unwrap()
            .push((registration.client_id.clone(), new_epoch));
    }
}

#[test_log::test(tokio::test)]
async fn test_grace_reclaim_flow() {
    let f = fixture().await;
    let ctx = OpContext::background();
    f.manager
        .register_client(
            &ctx,
            ClientRegistration {
                client_id: "C1".to_string(),
                host: "c1.example".to_string(),
                privilege_cookie: vec![1],
                callback_endpoint: "tcp://c1.example:4045".to_string(),
                registered_at: OffsetDateTime::now_utc(),
                epoch: 0,
            },
        )
        .await
        .unwrap();
    f.manager
        .lock(
            &ctx,
            &creds(),
            1,
            LockParams::exclusive("nlm:C1/7", "C1", LockRange::new(0, 100)),
        )
        .await
        .unwrap();

    // "Restart": a fresh manager over the same stores.
    let restarted = LockManager::new(
        "public",
        f.config.clone(),
        f.meta.clone(),
        f.lock_store.clone(),
        f.registry.clone(),
    );
    let notifier = RecordingNotifier {
        notified: std::sync::Mutex::new(Vec::new()),
    };
    let epoch = restarted.recover(Some(&notifier)).await.unwrap();
    assert_eq!(epoch, 1);
    assert_eq!(
        notifier.notified.lock().unwrap().as_slice(),
        &[("C1".to_string(), 1)]
    );
    assert!(restarted.in_grace().await);

    // Fresh, non-reclaim locks are refused during grace.
    assert!(matches!(
        restarted
            .lock(
                &ctx,
                &creds(),
                2,
                LockParams::exclusive("nlm:C2/9", "C2", LockRange::new(0, 10))
            )
            .await,
        Err(Error::GracePeriod)
    ));

    // The pre-restart lock comes back for its client.
    restarted
        .lock(
            &ctx,
            &creds(),
            1,
            LockParams::exclusive("nlm:C1/7", "C1", LockRange::new(0, 100)).reclaiming(),
        )
        .await
        .unwrap();
    let records = restarted.locks_on(1).await;
    assert_eq!(records.len(), 1);
    assert!(records[0].reclaimed);
    assert_eq!(records[0].epoch, 1);

    // All registered clients reclaimed: grace ends early, normal service
    // resumes for everyone else.
    assert!(!restarted.in_grace().await);
    restarted
        .lock(
            &ctx,
            &creds(),
            2,
            LockParams::exclusive("nlm:C2/9", "C2", LockRange::new(0, 10)),
        )
        .await
        .unwrap();
}

#[test_log::test(tokio::test)]
async fn test_reclaim_by_stranger_is_refused() {
    let f = fixture().await;
    let ctx = OpContext::background();
    f.manager
        .lock(
            &ctx,
            &creds(),
            1,
            LockParams::exclusive("nlm:C1/7", "C1", LockRange::new(0, 100)),
        )
        .await
        .unwrap();

    let restarted = LockManager::new(
        "public",
        f.config.clone(),
        f.meta.clone(),
        f.lock_store.clone(),
        f.registry.clone(),
    );
    restarted.recover(None).await.unwrap();
    assert!(matches!(
        restarted
            .lock(
                &ctx,
                &creds(),
                1,
                LockParams::exclusive("nlm:C2/1", "C2", LockRange::new(0, 100)).reclaiming(),
            )
            .await,
        Err(Error::LockNotFound)
    ));
}

#[test_log::test(tokio::test)]
async fn test_stale_locks_are_purged_after_grace() {
    let f = fixture_with(ServerConfig {
        grace_period: Duration::from_millis(50),
        ..Default::default()
    })
    .await;
    let ctx = OpContext::background();
    f.manager
        .lock(
            &ctx,
            &creds(),
            1,
            LockParams::exclusive("nlm:C1/7", "C1", LockRange::new(0, 100)),
        )
        .await
        .unwrap();

    let restarted = LockManager::new(
        "public",
        f.config.clone(),
        f.meta.clone(),
        f.lock_store.clone(),
        f.registry.clone(),
    );
    restarted.recover(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(!restarted.in_grace().await);
    // Nobody reclaimed: the pre-restart shadow is gone.
    assert!(f.lock_store.list().await.unwrap().is_empty());
    // And the range is free again.
    restarted
        .lock(
            &ctx,
            &creds(),
            1,
            LockParams::exclusive("nlm:C2/1", "C2", LockRange::new(0, 100)),
        )
        .await
        .unwrap();
}
