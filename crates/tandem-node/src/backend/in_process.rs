//! In-process lock backend.
//!
//! [`InProcessLockBackend`] is a mutex-guarded map of lock slots suitable for
//! embedded deployments and tests where the live and backup roles share one
//! process.
//!
//! ## Limitations
//!
//! - **Single-process only**: holders in other processes are invisible
//! - **No expiry**: a holder keeps the lock until it releases it, so a
//!   "crashed" holder in the same process blocks takeover until released
//! - **No persistence**: all state is lost when the process exits

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tandem_core::error::{Error, Result};
use tandem_core::id::{FencingToken, HolderId};

use super::{
    AcquireOutcome, BackendCapabilities, LeaseGrant, LockBackend, RenewOutcome, lease_delta,
};

/// State of a single lock.
///
/// The sequence survives releases so fencing tokens keep increasing across
/// holders.
#[derive(Debug, Clone, Default)]
struct Slot {
    holder_id: Option<HolderId>,
    acquired_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    sequence: u64,
}

/// In-process lock backend.
///
/// ## Example
///
/// ```rust
/// use std::sync::Arc;
///
/// use tandem_node::backend::{InProcessLockBackend, LockBackend};
///
/// let shared = InProcessLockBackend::shared();
/// assert!(Arc::ptr_eq(&shared, &InProcessLockBackend::shared()));
/// assert!(!shared.capabilities().cross_process);
/// ```
#[derive(Debug, Default)]
pub struct InProcessLockBackend {
    slots: Mutex<HashMap<String, Slot>>,
}

static SHARED: OnceLock<Arc<InProcessLockBackend>> = OnceLock::new();

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::internal("in-process lock table poisoned")
}

impl InProcessLockBackend {
    /// Creates an isolated lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the process-wide lock table.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::clone(SHARED.get_or_init(|| Arc::new(Self::new())))
    }

    /// Returns the fencing sequence last issued for `lock_id`.
    #[must_use]
    pub fn sequence(&self, lock_id: &str) -> u64 {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(lock_id)
            .map_or(0, |slot| slot.sequence)
    }
}

#[async_trait]
impl LockBackend for InProcessLockBackend {
    fn name(&self) -> &'static str {
        "in_process"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            enforces_expiry: false,
            cross_process: false,
        }
    }

    async fn try_acquire(
        &self,
        lock_id: &str,
        holder_id: &HolderId,
        lease: Duration,
    ) -> Result<AcquireOutcome> {
        let delta = lease_delta(lease)?;
        let mut slots = self.slots.lock().map_err(poison_err)?;
        let slot = slots.entry(lock_id.to_string()).or_default();

        match &slot.holder_id {
            Some(current) if current != holder_id => {
                return Ok(AcquireOutcome::Contended {
                    current_holder: Some(current.to_string()),
                });
            }
            Some(_) => {}
            None => slot.acquired_at = None,
        }

        let now = Utc::now();
        slot.sequence += 1;
        slot.holder_id = Some(holder_id.clone());
        let acquired_at = *slot.acquired_at.get_or_insert(now);
        let expires_at = now + delta;
        slot.expires_at = Some(expires_at);

        Ok(AcquireOutcome::Granted(LeaseGrant {
            holder_id: holder_id.clone(),
            acquired_at,
            expires_at,
            fencing_token: FencingToken::from_sequence(slot.sequence),
        }))
    }

    async fn renew(
        &self,
        lock_id: &str,
        holder_id: &HolderId,
        lease: Duration,
    ) -> Result<RenewOutcome> {
        let delta = lease_delta(lease)?;
        let mut slots = self.slots.lock().map_err(poison_err)?;

        let Some(slot) = slots.get_mut(lock_id) else {
            return Ok(RenewOutcome::Lost {
                current_holder: None,
            });
        };
        if slot.holder_id.as_ref() != Some(holder_id) {
            return Ok(RenewOutcome::Lost {
                current_holder: slot.holder_id.as_ref().map(ToString::to_string),
            });
        }

        let candidate = Utc::now() + delta;
        let expires_at = slot.expires_at.map_or(candidate, |prev| prev.max(candidate));
        slot.expires_at = Some(expires_at);

        Ok(RenewOutcome::Renewed {
            expires_at,
            fencing_token: FencingToken::from_sequence(slot.sequence),
        })
    }

    async fn release(&self, lock_id: &str, holder_id: &HolderId) -> Result<bool> {
        let mut slots = self.slots.lock().map_err(poison_err)?;
        let Some(slot) = slots.get_mut(lock_id) else {
            return Ok(false);
        };
        if slot.holder_id.as_ref() != Some(holder_id) {
            return Ok(false);
        }
        slot.holder_id = None;
        slot.acquired_at = None;
        slot.expires_at = None;
        Ok(true)
    }

    async fn is_locked(&self, lock_id: &str) -> Result<bool> {
        let slots = self.slots.lock().map_err(poison_err)?;
        Ok(slots.get(lock_id).is_some_and(|slot| slot.holder_id.is_some()))
    }

    async fn current_holder(&self, lock_id: &str) -> Result<Option<String>> {
        let slots = self.slots.lock().map_err(poison_err)?;
        Ok(slots
            .get(lock_id)
            .and_then(|slot| slot.holder_id.as_ref().map(ToString::to_string)))
    }
}
