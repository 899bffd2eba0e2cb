//! Lock backends for live/backup arbitration.
//!
//! The [`LockBackend`] trait is the exclusive-lock primitive beneath a
//! [`Lease`](crate::lease::Lease). It is separated from the lease and node
//! manager logic so that:
//!
//! - **Embedded tests** use [`InProcessLockBackend`], a mutex with no real expiry
//! - **Production** uses [`SqlLockBackend`], a lock row in a shared database
//! - **Fault injection** wraps either one without touching scheduler code
//!
//! ## Guarantees
//!
//! The two variants differ in correctness guarantees, surfaced through
//! [`BackendCapabilities`]. The in-process variant is only safe when both
//! competing roles live in one OS process. It never expires a holder and never
//! reports [`Error::BackendUnavailable`](tandem_core::Error::BackendUnavailable).
//!
//! Contention is an ordinary outcome ([`AcquireOutcome::Contended`],
//! [`RenewOutcome::Lost`]), not an error, unless the caller opts in with
//! [`AcquireOutcome::into_result`]. Errors are reserved for failures to reach
//! or use the store.

pub mod in_process;
pub mod sql;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tandem_core::config::BackendConfig;
use tandem_core::error::{Error, Result};
use tandem_core::id::{FencingToken, HolderId};

pub use in_process::InProcessLockBackend;
pub use sql::SqlLockBackend;

/// What a backend can promise about the locks it hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BackendCapabilities {
    /// Whether an unrenewed lease actually expires and can be taken over.
    pub enforces_expiry: bool,
    /// Whether holders in different OS processes are mutually excluded.
    pub cross_process: bool,
}

/// Ownership granted by a successful acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaseGrant {
    /// The holder the lock was granted to.
    pub holder_id: HolderId,
    /// When the current holder first acquired the lock, by the backend clock.
    pub acquired_at: DateTime<Utc>,
    /// When the lease expires, by the backend clock.
    pub expires_at: DateTime<Utc>,
    /// Token strictly increasing across successive acquisitions.
    pub fencing_token: FencingToken,
}

/// Result of an acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The lock was free, expired or already ours.
    Granted(LeaseGrant),
    /// Another holder owns an unexpired lease.
    Contended {
        /// The current holder, if the backend could report it.
        current_holder: Option<String>,
    },
}

impl AcquireOutcome {
    /// Returns true if the lock was granted.
    #[must_use]
    pub const fn is_granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }

    /// Returns the grant, if any.
    #[must_use]
    pub fn into_grant(self) -> Option<LeaseGrant> {
        match self {
            Self::Granted(grant) => Some(grant),
            Self::Contended { .. } => None,
        }
    }

    /// Converts contention into [`Error::Contention`] for callers that treat
    /// it as a failure.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Contention`] if another holder owns the lock.
    pub fn into_result(self, lock_id: &str) -> Result<LeaseGrant> {
        match self {
            Self::Granted(grant) => Ok(grant),
            Self::Contended { current_holder } => Err(Error::Contention {
                lock_id: lock_id.to_string(),
                holder: current_holder,
            }),
        }
    }
}

/// Result of a renewal attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewOutcome {
    /// The lease was extended.
    Renewed {
        /// New expiry by the backend clock. Never earlier than the previous one.
        expires_at: DateTime<Utc>,
        /// Token of the acquisition being renewed.
        fencing_token: FencingToken,
    },
    /// The caller is no longer the recorded holder.
    Lost {
        /// The holder now on record, if any.
        current_holder: Option<String>,
    },
}

impl RenewOutcome {
    /// Returns true if the lease was extended.
    #[must_use]
    pub const fn is_renewed(&self) -> bool {
        matches!(self, Self::Renewed { .. })
    }
}

/// Exclusive-lock primitive shared by a live/backup pair.
///
/// Implementations must make `try_acquire` and `renew` atomic conditional
/// operations: a grant happens only if the record is absent, expired by the
/// backend's own clock, or already owned by the caller.
///
/// ## Example
///
/// ```rust
/// use std::time::Duration;
///
/// use tandem_core::HolderId;
/// use tandem_node::backend::{InProcessLockBackend, LockBackend};
///
/// # tokio_test::block_on(async {
/// let backend = InProcessLockBackend::new();
/// let a = HolderId::generate();
/// let b = HolderId::generate();
///
/// let first = backend.try_acquire("live", &a, Duration::from_secs(2)).await?;
/// assert!(first.is_granted());
///
/// let second = backend.try_acquire("live", &b, Duration::from_secs(2)).await?;
/// assert!(!second.is_granted());
///
/// backend.release("live", &a).await?;
/// assert!(!backend.is_locked("live").await?);
/// # Ok::<(), tandem_core::Error>(())
/// # }).unwrap();
/// ```
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Short backend name for logs and metrics.
    fn name(&self) -> &'static str;

    /// Describes the guarantees this backend gives.
    fn capabilities(&self) -> BackendCapabilities;

    /// Creates whatever storage the backend needs. Safe to call repeatedly.
    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    /// Attempts to obtain exclusive ownership of `lock_id` for `lease`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BackendUnavailable`] if the store cannot be reached.
    /// Contention is reported as [`AcquireOutcome::Contended`].
    async fn try_acquire(
        &self,
        lock_id: &str,
        holder_id: &HolderId,
        lease: Duration,
    ) -> Result<AcquireOutcome>;

    /// Extends ownership if `holder_id` is still the recorded holder.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BackendUnavailable`] if the store cannot be reached.
    /// A stolen or released lock is reported as [`RenewOutcome::Lost`].
    async fn renew(
        &self,
        lock_id: &str,
        holder_id: &HolderId,
        lease: Duration,
    ) -> Result<RenewOutcome>;

    /// Relinquishes ownership. Returns false if `holder_id` did not hold the lock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BackendUnavailable`] if the store cannot be reached.
    async fn release(&self, lock_id: &str, holder_id: &HolderId) -> Result<bool>;

    /// Returns true if some holder owns an unexpired lease on `lock_id`.
    async fn is_locked(&self, lock_id: &str) -> Result<bool>;

    /// Returns the holder of an unexpired lease on `lock_id`, if any.
    async fn current_holder(&self, lock_id: &str) -> Result<Option<String>>;

    /// Releases pooled resources. Further calls may fail.
    async fn close(&self) {}
}

/// Constructs the backend described by `config`.
///
/// The in-process variant returns the process-wide shared instance so that
/// every node manager configured for it in this process contends on the same
/// locks. The SQL variant connects lazily and must be called from within a
/// tokio runtime.
///
/// # Errors
///
/// Returns [`Error::Configuration`] if the backend parameters are malformed.
pub fn from_config(config: &BackendConfig) -> Result<Arc<dyn LockBackend>> {
    match config {
        BackendConfig::InProcess => Ok(InProcessLockBackend::shared()),
        BackendConfig::Sql(sql) => Ok(Arc::new(SqlLockBackend::connect_lazy(sql)?)),
    }
}

/// Converts a lease duration to a signed backend clock offset.
pub(crate) fn lease_delta(lease: Duration) -> Result<chrono::TimeDelta> {
    chrono::TimeDelta::from_std(lease)
        .map_err(|_| Error::configuration(format!("lease duration {lease:?} is out of range")))
}
