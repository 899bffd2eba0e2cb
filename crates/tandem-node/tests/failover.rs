//! Live/backup failover across node managers.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use tandem_core::Error;
use tandem_node::backend::{InProcessLockBackend, LockBackend};
use tandem_node::{LeaseState, NodeEvent, NodeManager, NodeStatus};
use tandem_test_utils::{
    FaultyBackend, LockOp, SqliteFixture, init_test_logging, test_config, unique_lock_id,
};
use tokio::runtime::Handle;
use tokio::time::Instant;

fn sql_node(fixture: &SqliteFixture, node_id: &str) -> NodeManager {
    NodeManager::from_config(fixture.node_config(node_id), Handle::current()).expect("build")
}

/// Two SQL-backed nodes with a 2s lease and 500ms renewal. The live node dies
/// without releasing; the backup takes over once the lease expires.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn backup_takes_over_after_live_node_dies() {
    init_test_logging();
    let fixture = SqliteFixture::new();
    let a = sql_node(&fixture, "broker-a");
    let b = sql_node(&fixture, "broker-b");

    let live = a.start_live_node().await.expect("a live");
    let first_token = live.fencing_token.expect("token");

    b.start_backup().await.expect("b backup");
    b.await_backup_node(Some(Duration::from_secs(5)))
        .await
        .expect("b is backup");
    assert_eq!(b.status(), NodeStatus::Backup);
    b.await_live_status(Some(Duration::from_secs(1)))
        .await
        .expect("b observes a live node");

    a.crash_live_node().await;
    let crashed_at = Instant::now();

    // The lease is still recorded right after the crash.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!b.is_live_node());

    let promoted = b
        .await_live_node(Some(Duration::from_secs(5)))
        .await
        .expect("b promoted");
    let takeover = crashed_at.elapsed();
    assert!(
        takeover <= Duration::from_secs(2) + Duration::from_millis(500) + Duration::from_millis(750),
        "takeover took {takeover:?}"
    );
    assert!(b.is_live_node());
    assert!(!a.is_live_node());
    assert!(first_token.is_stale_against(promoted.fencing_token.expect("token")));

    b.stop().await;
    a.stop().await;
}

#[tokio::test(start_paused = true)]
async fn in_process_backup_takes_over_on_release() {
    let backend: Arc<dyn LockBackend> = Arc::new(InProcessLockBackend::new());
    let a = NodeManager::builder(test_config("a"))
        .backend(Arc::clone(&backend))
        .build()
        .expect("build");
    let b = NodeManager::builder(test_config("b"))
        .backend(Arc::clone(&backend))
        .build()
        .expect("build");
    let mut b_events = b.subscribe();

    a.start_live_node().await.expect("a live");
    b.start_backup().await.expect("b backup");
    b.await_backup_node(Some(Duration::from_secs(1)))
        .await
        .expect("b backup");

    a.stop().await;
    b.await_live_node(Some(Duration::from_secs(2)))
        .await
        .expect("b live");

    assert!(matches!(
        b_events.recv().await.expect("event"),
        NodeEvent::BecameBackup { .. }
    ));
    assert!(matches!(
        b_events.recv().await.expect("event"),
        NodeEvent::BecameLive { .. }
    ));
    b.stop().await;
}

#[tokio::test(start_paused = true)]
async fn in_process_crash_blocks_takeover_until_release() {
    let backend = Arc::new(InProcessLockBackend::new());
    let a = NodeManager::builder(test_config("a"))
        .backend(Arc::clone(&backend) as Arc<dyn LockBackend>)
        .build()
        .expect("build");
    let b = NodeManager::builder(test_config("b"))
        .backend(Arc::clone(&backend) as Arc<dyn LockBackend>)
        .build()
        .expect("build");

    a.start_live_node().await.expect("a live");
    a.crash_live_node().await;
    b.start_backup().await.expect("b backup");

    // In-process locks never expire.
    let err = b
        .await_live_node(Some(Duration::from_secs(10)))
        .await
        .expect_err("no expiry in process");
    assert!(matches!(err, Error::AcquisitionTimeout { .. }));

    backend.release("live", a.holder_id()).await.expect("release");
    b.await_live_node(Some(Duration::from_secs(2)))
        .await
        .expect("b live after release");
    b.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stop_during_acquisition_returns_stopped() {
    let backend = FaultyBackend::in_process();
    let holder = NodeManager::builder(test_config("a"))
        .backend(backend.clone())
        .build()
        .expect("build");
    holder.start_live_node().await.expect("live");

    let contender = Arc::new(
        NodeManager::builder(test_config("b"))
            .backend(backend.clone())
            .build()
            .expect("build"),
    );
    let attempt = {
        let contender = Arc::clone(&contender);
        tokio::spawn(async move { contender.start_live_node().await })
    };

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(contender.status(), NodeStatus::Starting);
    contender.stop().await;

    let result = attempt.await.expect("join");
    assert!(matches!(result, Err(Error::Stopped)));
    assert_eq!(contender.status(), NodeStatus::Stopped);
    assert!(!contender.is_live_node());

    // The contender never renews after being stopped.
    backend.clear_operations();
    tokio::time::sleep(Duration::from_secs(2)).await;
    let contender_id = contender.holder_id().to_string();
    assert!(!backend.operations().iter().any(|op| matches!(
        op,
        LockOp::Renew { holder_id, .. } | LockOp::TryAcquire { holder_id, .. }
            if *holder_id == contender_id
    )));
    assert!(holder.is_live_node());
    holder.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bounded_acquisition_on_sql_returns_in_time() {
    let fixture = SqliteFixture::new();
    let a = sql_node(&fixture, "a");
    a.start_live_node().await.expect("a live");

    let timeout = Duration::from_millis(800);
    let b = NodeManager::from_config(
        fixture.node_config("b").with_acquisition_timeout(timeout),
        Handle::current(),
    )
    .expect("build");

    let started = Instant::now();
    let err = b.start_live_node().await.expect_err("contended");
    let elapsed = started.elapsed();
    assert!(matches!(err, Error::AcquisitionTimeout { .. }));
    assert!(elapsed < timeout + Duration::from_millis(500), "took {elapsed:?}");

    let store = fixture.backend().await;
    assert_eq!(
        store.current_holder("live").await.expect("holder").as_deref(),
        Some(a.holder_id().as_str())
    );

    a.stop().await;
    b.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sql_crash_leaves_lock_until_expiry() {
    let fixture = SqliteFixture::new();
    let a = sql_node(&fixture, "a");
    let store = fixture.backend().await;

    a.start_live_node().await.expect("live");
    a.crash_live_node().await;
    assert!(!a.is_live_node());
    assert!(store.is_locked("live").await.expect("is_locked"));

    tokio::time::sleep(Duration::from_millis(2300)).await;
    assert!(!store.is_locked("live").await.expect("is_locked"));
    a.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sql_stop_releases_immediately() {
    let fixture = SqliteFixture::new();
    let a = sql_node(&fixture, "a");
    let b = sql_node(&fixture, "b");
    let store = fixture.backend().await;

    a.start_live_node().await.expect("a live");
    a.stop().await;
    assert!(!store.is_locked("live").await.expect("is_locked"));

    let started = Instant::now();
    b.start_live_node().await.expect("b live");
    assert!(started.elapsed() < Duration::from_secs(1));
    b.stop().await;
}

#[tokio::test(start_paused = true)]
async fn configured_in_process_managers_share_one_lock() {
    let lock_id = unique_lock_id("shared");
    let a = NodeManager::from_config(test_config("a").with_lock_id(&lock_id), Handle::current())
        .expect("build");
    let b = NodeManager::from_config(test_config("b").with_lock_id(&lock_id), Handle::current())
        .expect("build");
    assert!(!a.capabilities().cross_process);
    let mut a_status = a.watch_status();

    a.start_live_node().await.expect("a live");
    assert_eq!(*a_status.borrow_and_update(), NodeStatus::Live);
    let lease = a.live_lease().expect("a holds the lease");
    assert_eq!(lease.lock_id, lock_id);
    assert_eq!(&lease.holder_id, a.holder_id());

    b.start_backup().await.expect("b backup");
    b.await_backup_node(Some(Duration::from_secs(1)))
        .await
        .expect("b backup");
    assert!(b.live_lease().is_none());

    a.stop().await;
    b.await_live_node(Some(Duration::from_secs(2)))
        .await
        .expect("b live");
    assert!(a.live_lease().is_none());
    b.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stop_during_backup_takeover_releases_the_lock() {
    let backend = FaultyBackend::in_process();
    let node = NodeManager::builder(test_config("b"))
        .backend(backend.clone())
        .build()
        .expect("build");
    backend.delay_acquisitions(Duration::from_millis(300));

    node.start_backup().await.expect("backup");
    tokio::time::sleep(Duration::from_millis(100)).await;
    // The grant is recorded while its reply is still on the way.
    assert_eq!(
        backend.current_holder("live").await.expect("holder"),
        Some(node.holder_id().to_string())
    );

    node.stop().await;
    assert_eq!(node.status(), NodeStatus::Stopped);
    assert!(!node.is_live_node());
    assert!(!backend.is_locked("live").await.expect("is_locked"));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!backend.is_locked("live").await.expect("is_locked"));
}

#[tokio::test(start_paused = true)]
async fn abandoned_start_releases_the_lock() {
    let backend = FaultyBackend::in_process();
    let node = NodeManager::builder(test_config("a"))
        .backend(backend.clone())
        .build()
        .expect("build");
    backend.delay_acquisitions(Duration::from_millis(300));

    let attempt = tokio::time::timeout(Duration::from_millis(100), node.start_live_node()).await;
    assert!(attempt.is_err(), "caller gave up first");
    assert_eq!(node.status(), NodeStatus::Stopped);
    assert_eq!(node.lease().state, LeaseState::Idle);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!backend.is_locked("live").await.expect("is_locked"));
    assert!(backend.operations().iter().any(|op| matches!(
        op,
        LockOp::Release { holder_id, .. } if *holder_id == node.holder_id().to_string()
    )));

    // The manager is still usable after the abandoned attempt.
    backend.delay_acquisitions(Duration::ZERO);
    node.start_live_node().await.expect("live");
    assert!(node.is_live_node());
    node.stop().await;
    assert!(!backend.is_locked("live").await.expect("is_locked"));
}

#[tokio::test(start_paused = true)]
async fn abandoned_start_does_not_release_a_later_grant() {
    let backend = FaultyBackend::in_process();
    let node = NodeManager::builder(test_config("a"))
        .backend(backend.clone())
        .build()
        .expect("build");
    backend.delay_acquisitions(Duration::from_millis(300));

    let attempt = tokio::time::timeout(Duration::from_millis(100), node.start_live_node()).await;
    assert!(attempt.is_err());

    // A second start, begun while the first reply is still pending, wins the
    // lock for the same holder and keeps it.
    backend.delay_acquisitions(Duration::ZERO);
    node.start_live_node().await.expect("live");
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(node.is_live_node());
    assert_eq!(
        backend.current_holder("live").await.expect("holder"),
        Some(node.holder_id().to_string())
    );
    node.stop().await;
}
