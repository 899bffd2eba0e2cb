//! Lock backend wrapper with failure injection.
//!
//! [`FaultyBackend`] forwards to a real backend and records every call. Tests
//! can make the store unreachable, fail a number of renewals, simulate an
//! external takeover on the next renewal, or hold back acquisition replies
//! after the grant is recorded.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tandem_core::error::{Error, Result};
use tandem_core::id::HolderId;
use tandem_node::backend::{
    AcquireOutcome, BackendCapabilities, InProcessLockBackend, LockBackend, RenewOutcome,
};

/// Holder reported when a takeover is simulated.
pub const EXTERNAL_HOLDER: &str = "external-holder";

/// Record of a backend call for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOp {
    /// `prepare` was called.
    Prepare,
    /// `try_acquire` was called.
    TryAcquire {
        /// Lock identifier.
        lock_id: String,
        /// Caller.
        holder_id: String,
    },
    /// `renew` was called.
    Renew {
        /// Lock identifier.
        lock_id: String,
        /// Caller.
        holder_id: String,
    },
    /// `release` was called.
    Release {
        /// Lock identifier.
        lock_id: String,
        /// Caller.
        holder_id: String,
    },
    /// `is_locked` was called.
    IsLocked {
        /// Lock identifier.
        lock_id: String,
    },
    /// `current_holder` was called.
    CurrentHolder {
        /// Lock identifier.
        lock_id: String,
    },
    /// `close` was called.
    Close,
}

/// Lock backend with injected failures.
pub struct FaultyBackend {
    inner: Arc<dyn LockBackend>,
    operations: Mutex<Vec<LockOp>>,
    unavailable: AtomicBool,
    failing_renewals: AtomicU32,
    lose_next_renewal: AtomicBool,
    acquire_delay_ms: AtomicU64,
}

impl std::fmt::Debug for FaultyBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultyBackend")
            .field("inner", &self.inner.name())
            .field("unavailable", &self.unavailable.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl FaultyBackend {
    /// Wraps `inner`.
    pub fn wrap(inner: Arc<dyn LockBackend>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            operations: Mutex::new(Vec::new()),
            unavailable: AtomicBool::new(false),
            failing_renewals: AtomicU32::new(0),
            lose_next_renewal: AtomicBool::new(false),
            acquire_delay_ms: AtomicU64::new(0),
        })
    }

    /// Wraps a fresh, isolated in-process backend.
    pub fn in_process() -> Arc<Self> {
        Self::wrap(Arc::new(InProcessLockBackend::new()))
    }

    /// Makes every call fail as unreachable until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fails the next `count` renewals as unreachable.
    pub fn fail_next_renewals(&self, count: u32) {
        self.failing_renewals.store(count, Ordering::SeqCst);
    }

    /// Reports the next renewal as lost to an external holder.
    pub fn lose_next_renewal(&self) {
        self.lose_next_renewal.store(true, Ordering::SeqCst);
    }

    /// Delays every `try_acquire` reply by `delay`. The inner backend has
    /// already decided, and possibly granted, when the delay starts.
    pub fn delay_acquisitions(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.acquire_delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Returns all recorded operations.
    pub fn operations(&self) -> Vec<LockOp> {
        self.operations.lock().expect("lock").clone()
    }

    /// Returns the number of renewals attempted.
    pub fn renew_calls(&self) -> usize {
        self.operations()
            .iter()
            .filter(|op| matches!(op, LockOp::Renew { .. }))
            .count()
    }

    /// Clears recorded operations.
    pub fn clear_operations(&self) {
        self.operations.lock().expect("lock").clear();
    }

    fn record(&self, op: LockOp) {
        self.operations.lock().expect("lock").push(op);
    }

    fn check_available(&self, operation: &str) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::backend_unavailable(format!(
                "injected outage during {operation}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl LockBackend for FaultyBackend {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.inner.capabilities()
    }

    async fn prepare(&self) -> Result<()> {
        self.record(LockOp::Prepare);
        self.check_available("prepare")?;
        self.inner.prepare().await
    }

    async fn try_acquire(
        &self,
        lock_id: &str,
        holder_id: &HolderId,
        lease: Duration,
    ) -> Result<AcquireOutcome> {
        self.record(LockOp::TryAcquire {
            lock_id: lock_id.to_string(),
            holder_id: holder_id.to_string(),
        });
        self.check_available("try_acquire")?;
        let outcome = self.inner.try_acquire(lock_id, holder_id, lease).await;
        let delay = self.acquire_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        outcome
    }

    async fn renew(
        &self,
        lock_id: &str,
        holder_id: &HolderId,
        lease: Duration,
    ) -> Result<RenewOutcome> {
        self.record(LockOp::Renew {
            lock_id: lock_id.to_string(),
            holder_id: holder_id.to_string(),
        });
        self.check_available("renew")?;

        if self
            .failing_renewals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::backend_unavailable("injected renewal failure"));
        }
        if self.lose_next_renewal.swap(false, Ordering::SeqCst) {
            return Ok(RenewOutcome::Lost {
                current_holder: Some(EXTERNAL_HOLDER.to_string()),
            });
        }
        self.inner.renew(lock_id, holder_id, lease).await
    }

    async fn release(&self, lock_id: &str, holder_id: &HolderId) -> Result<bool> {
        self.record(LockOp::Release {
            lock_id: lock_id.to_string(),
            holder_id: holder_id.to_string(),
        });
        self.check_available("release")?;
        self.inner.release(lock_id, holder_id).await
    }

    async fn is_locked(&self, lock_id: &str) -> Result<bool> {
        self.record(LockOp::IsLocked {
            lock_id: lock_id.to_string(),
        });
        self.check_available("is_locked")?;
        self.inner.is_locked(lock_id).await
    }

    async fn current_holder(&self, lock_id: &str) -> Result<Option<String>> {
        self.record(LockOp::CurrentHolder {
            lock_id: lock_id.to_string(),
        });
        self.check_available("current_holder")?;
        self.inner.current_holder(lock_id).await
    }

    async fn close(&self) {
        self.record(LockOp::Close);
        self.inner.close().await;
    }
}
