//! Property-based tests for lock backend invariants.
//!
//! Random operation sequences from a handful of holders are replayed against
//! the in-process backend and checked against a single-owner model.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::HashMap;
use std::time::Duration;

use proptest::prelude::*;
use tokio_test::block_on;

use tandem_core::id::{FencingToken, HolderId};
use tandem_node::backend::{AcquireOutcome, InProcessLockBackend, LockBackend, RenewOutcome};

const LOCK: &str = "live";

#[derive(Debug, Clone, Copy)]
enum Op {
    Acquire(usize),
    Renew(usize, u64),
    Release(usize),
}

fn arb_op(holders: usize) -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..holders).prop_map(Op::Acquire),
        (0..holders, 1_u64..5_000).prop_map(|(h, ms)| Op::Renew(h, ms)),
        (0..holders).prop_map(Op::Release),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// At most one holder owns the lock, and only the owner can renew or release it.
    #[test]
    fn prop_single_owner(ops in prop::collection::vec(arb_op(3), 1..60)) {
        let backend = InProcessLockBackend::new();
        let holders: Vec<HolderId> = (0..3).map(|_| HolderId::generate()).collect();
        let mut owner: Option<usize> = None;

        block_on(async {
            for op in ops {
                match op {
                    Op::Acquire(h) => {
                        let outcome = backend
                            .try_acquire(LOCK, &holders[h], Duration::from_secs(2))
                            .await
                            .expect("acquire");
                        let expected = owner.is_none() || owner == Some(h);
                        prop_assert_eq!(outcome.is_granted(), expected);
                        if let AcquireOutcome::Contended { current_holder } = outcome {
                            let current = owner.map(|o| holders[o].to_string());
                            prop_assert_eq!(current_holder, current);
                        } else {
                            owner = Some(h);
                        }
                    }
                    Op::Renew(h, ms) => {
                        let outcome = backend
                            .renew(LOCK, &holders[h], Duration::from_millis(ms))
                            .await
                            .expect("renew");
                        prop_assert_eq!(outcome.is_renewed(), owner == Some(h));
                    }
                    Op::Release(h) => {
                        let released = backend.release(LOCK, &holders[h]).await.expect("release");
                        prop_assert_eq!(released, owner == Some(h));
                        if released {
                            owner = None;
                        }
                    }
                }
                prop_assert_eq!(backend.is_locked(LOCK).await.expect("is_locked"), owner.is_some());
            }
            Ok(())
        })?;
    }

    /// Fencing tokens strictly increase across grants, whoever receives them.
    #[test]
    fn prop_fencing_tokens_increase(ops in prop::collection::vec(arb_op(3), 1..60)) {
        let backend = InProcessLockBackend::new();
        let holders: Vec<HolderId> = (0..3).map(|_| HolderId::generate()).collect();
        let mut last: Option<FencingToken> = None;

        block_on(async {
            for op in ops {
                match op {
                    Op::Acquire(h) => {
                        let outcome = backend
                            .try_acquire(LOCK, &holders[h], Duration::from_secs(2))
                            .await
                            .expect("acquire");
                        if let Some(grant) = outcome.into_grant() {
                            if let Some(prev) = last {
                                prop_assert!(grant.fencing_token > prev);
                            }
                            last = Some(grant.fencing_token);
                        }
                    }
                    Op::Renew(h, ms) => {
                        let outcome = backend
                            .renew(LOCK, &holders[h], Duration::from_millis(ms))
                            .await
                            .expect("renew");
                        if let RenewOutcome::Renewed { fencing_token, .. } = outcome {
                            prop_assert_eq!(Some(fencing_token), last);
                        }
                    }
                    Op::Release(h) => {
                        backend.release(LOCK, &holders[h]).await.expect("release");
                    }
                }
            }
            Ok(())
        })?;
    }

    /// A successful renewal never moves the expiry backwards.
    #[test]
    fn prop_renewal_is_monotonic(durations in prop::collection::vec(1_u64..10_000, 1..30)) {
        let backend = InProcessLockBackend::new();
        let holder = HolderId::generate();

        block_on(async {
            let grant = backend
                .try_acquire(LOCK, &holder, Duration::from_secs(5))
                .await
                .expect("acquire")
                .into_grant()
                .expect("granted");
            let mut expires = HashMap::from([(holder.clone(), grant.expires_at)]);

            for ms in durations {
                match backend
                    .renew(LOCK, &holder, Duration::from_millis(ms))
                    .await
                    .expect("renew")
                {
                    RenewOutcome::Renewed { expires_at, .. } => {
                        let prev = expires[&holder];
                        prop_assert!(expires_at >= prev);
                        expires.insert(holder.clone(), expires_at);
                    }
                    RenewOutcome::Lost { .. } => prop_assert!(false, "holder lost its own lock"),
                }
            }
            Ok(())
        })?;
    }
}
