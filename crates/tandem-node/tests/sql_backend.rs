//! SQL lock backend shared by several connection pools.
//!
//! Each pool stands in for a broker process pointed at the same store.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use tandem_core::id::HolderId;
use tandem_node::backend::{LockBackend, RenewOutcome, SqlLockBackend};
use tandem_test_utils::SqliteFixture;

const LOCK: &str = "live";

async fn contenders(fixture: &SqliteFixture, count: usize) -> Vec<Arc<SqlLockBackend>> {
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(Arc::new(fixture.backend().await));
    }
    out
}

async fn race(backends: &[Arc<SqlLockBackend>], lease: Duration) -> Vec<HolderId> {
    let mut tasks = Vec::new();
    for backend in backends {
        let backend = Arc::clone(backend);
        tasks.push(tokio::spawn(async move {
            let holder = HolderId::generate();
            let outcome = backend
                .try_acquire(LOCK, &holder, lease)
                .await
                .expect("acquire");
            outcome.is_granted().then_some(holder)
        }));
    }

    let mut winners = Vec::new();
    for task in tasks {
        if let Some(holder) = task.await.expect("join") {
            winners.push(holder);
        }
    }
    winners
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_acquire_has_one_winner() {
    let fixture = SqliteFixture::new();
    let backends = contenders(&fixture, 6).await;

    let winners = race(&backends, Duration::from_secs(5)).await;
    assert_eq!(winners.len(), 1);
    assert_eq!(
        backends[0].current_holder(LOCK).await.expect("holder"),
        Some(winners[0].to_string())
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn expired_lock_race_has_one_winner() {
    let fixture = SqliteFixture::new();
    let backends = contenders(&fixture, 6).await;

    let first = HolderId::generate();
    let grant = backends[0]
        .try_acquire(LOCK, &first, Duration::from_millis(100))
        .await
        .expect("acquire")
        .into_grant()
        .expect("granted");
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(!backends[0].is_locked(LOCK).await.expect("is_locked"));

    let winners = race(&backends, Duration::from_secs(5)).await;
    assert_eq!(winners.len(), 1);

    let outcome = backends[1]
        .renew(LOCK, &first, Duration::from_secs(5))
        .await
        .expect("renew");
    assert_eq!(
        outcome,
        RenewOutcome::Lost {
            current_holder: Some(winners[0].to_string())
        }
    );
    let token = backends[2]
        .try_acquire(LOCK, &winners[0], Duration::from_secs(5))
        .await
        .expect("re-acquire")
        .into_grant()
        .expect("owner re-acquires")
        .fencing_token;
    assert!(grant.fencing_token.is_stale_against(token));
}

#[tokio::test]
async fn release_is_idempotent_across_pools() {
    let fixture = SqliteFixture::new();
    let backends = contenders(&fixture, 2).await;
    let holder = HolderId::generate();
    let other = HolderId::generate();

    backends[0]
        .try_acquire(LOCK, &holder, Duration::from_secs(5))
        .await
        .expect("acquire");
    assert!(!backends[1].release(LOCK, &other).await.expect("foreign release"));
    assert!(backends[1].is_locked(LOCK).await.expect("is_locked"));

    assert!(backends[1].release(LOCK, &holder).await.expect("release"));
    assert!(!backends[0].release(LOCK, &holder).await.expect("second release"));
    assert!(!backends[0].is_locked(LOCK).await.expect("is_locked"));
    assert!(
        backends[1]
            .try_acquire(LOCK, &other, Duration::from_secs(5))
            .await
            .expect("acquire")
            .is_granted()
    );
}

#[tokio::test]
async fn shorter_renewal_never_shortens_the_lease() {
    let fixture = SqliteFixture::new();
    let backend = fixture.backend().await;
    let holder = HolderId::generate();

    let grant = backend
        .try_acquire(LOCK, &holder, Duration::from_secs(30))
        .await
        .expect("acquire")
        .into_grant()
        .expect("granted");

    match backend
        .renew(LOCK, &holder, Duration::from_secs(1))
        .await
        .expect("renew")
    {
        RenewOutcome::Renewed {
            expires_at,
            fencing_token,
        } => {
            assert!(expires_at >= grant.expires_at);
            assert_eq!(fencing_token, grant.fencing_token);
        }
        RenewOutcome::Lost { .. } => panic!("holder lost its own lock"),
    }
}

#[tokio::test]
async fn locks_are_independent() {
    let fixture = SqliteFixture::new();
    let backend = fixture.backend().await;
    let a = HolderId::generate();
    let b = HolderId::generate();

    assert!(
        backend
            .try_acquire("live-1", &a, Duration::from_secs(5))
            .await
            .expect("acquire")
            .is_granted()
    );
    assert!(
        backend
            .try_acquire("live-2", &b, Duration::from_secs(5))
            .await
            .expect("acquire")
            .is_granted()
    );
    assert_eq!(
        backend.current_holder("live-1").await.expect("holder"),
        Some(a.to_string())
    );
    assert!(!backend.is_locked("live-3").await.expect("is_locked"));
}
