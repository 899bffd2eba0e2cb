//! Renewal scheduler.
//!
//! One [`RenewalTask`] runs per held lease, on the runtime handle the node
//! manager was given. Each tick renews the lease through the backend and
//! finishes before the next tick is scheduled, so renewals for a lease are
//! never concurrent.
//!
//! ## Failure policy
//!
//! - **Not renewed**: the record names another holder. The lease is `Lost`
//!   immediately.
//! - **Backend error**: counted as a consecutive failure and reported as
//!   degraded health. Once the count exceeds the configured budget, or the
//!   local safety deadline passes, the lease is treated as `Lost`: ownership
//!   can no longer be assumed.
//!
//! Loss is reported to the [`RenewalObserver`] exactly once, then the task exits.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tandem_core::error::Error;
use tandem_core::observability::lock_span;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::Instrument;

use crate::backend::{LockBackend, RenewOutcome};
use crate::lease::Lease;
use crate::metrics::NodeMetrics;

/// Receives the outcome of renewal ticks.
pub trait RenewalObserver: Send + Sync {
    /// A renewal succeeded.
    fn renewed(&self, _expires_at: DateTime<Utc>) {}

    /// A renewal could not reach the backend. The lease is still trusted.
    fn degraded(&self, consecutive_failures: u32, error: &Error);

    /// A renewal succeeded after one or more failures.
    fn recovered(&self);

    /// The lease is lost. Called at most once per task.
    fn lost(&self, error: &Error);
}

/// Everything a renewal task needs.
pub struct RenewalContext {
    /// Backend to renew through.
    pub backend: Arc<dyn LockBackend>,
    /// The lease being kept alive.
    pub lease: Arc<Mutex<Lease>>,
    /// Duration requested on every renewal.
    pub lease_duration: Duration,
    /// Tick interval.
    pub renew_period: Duration,
    /// Consecutive failures tolerated before the lease is treated as lost.
    pub max_failures: u32,
    /// Receives tick outcomes.
    pub observer: Arc<dyn RenewalObserver>,
    /// Metrics recorder.
    pub metrics: NodeMetrics,
}

/// Why a renewal task exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalExit {
    /// Cancelled, or the lease stopped being held.
    Cancelled,
    /// The lease was lost.
    Lost,
}

/// Spawns renewal tasks.
#[derive(Debug, Clone, Copy, Default)]
pub struct RenewalScheduler;

impl RenewalScheduler {
    /// Starts renewing on `handle`. The first renewal happens one period from now.
    #[must_use]
    pub fn spawn(handle: &Handle, ctx: RenewalContext) -> RenewalTask {
        let (stop_tx, stop_rx) = watch::channel(false);
        let join = handle.spawn(run(ctx, stop_rx));
        RenewalTask {
            stop: stop_tx,
            join: Some(join),
        }
    }
}

/// Handle to a running renewal task. Dropping it aborts the task.
#[derive(Debug)]
pub struct RenewalTask {
    stop: watch::Sender<bool>,
    join: Option<JoinHandle<RenewalExit>>,
}

impl RenewalTask {
    /// Stops the task after any in-flight renewal and waits for it to exit.
    ///
    /// Returns `None` if the task panicked or was already aborted.
    pub async fn cancel(mut self) -> Option<RenewalExit> {
        let _ = self.stop.send(true);
        let join = self.join.take()?;
        join.await.ok()
    }

    /// Aborts the task immediately, even mid-renewal.
    pub fn abort(mut self) {
        if let Some(join) = self.join.take() {
            join.abort();
        }
    }

    /// Returns true if the task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

impl Drop for RenewalTask {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            join.abort();
        }
    }
}

enum Tick {
    Continue,
    Stop,
    Lost,
}

fn lock(lease: &Mutex<Lease>) -> MutexGuard<'_, Lease> {
    lease.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn run(ctx: RenewalContext, mut stop: watch::Receiver<bool>) -> RenewalExit {
    let mut ticker = interval_at(Instant::now() + ctx.renew_period, ctx.renew_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut failures = 0_u32;

    loop {
        tokio::select! {
            biased;
            _ = stop.changed() => return RenewalExit::Cancelled,
            _ = ticker.tick() => {}
        }
        if *stop.borrow() {
            return RenewalExit::Cancelled;
        }

        match renew_once(&ctx, &mut failures).await {
            Tick::Continue => {}
            Tick::Stop => return RenewalExit::Cancelled,
            Tick::Lost => return RenewalExit::Lost,
        }
    }
}

async fn renew_once(ctx: &RenewalContext, failures: &mut u32) -> Tick {
    let requested_at = Instant::now();
    let (lock_id, holder_id) = {
        let mut lease = lock(&ctx.lease);
        if lease.begin_renew().is_err() {
            tracing::debug!(state = %lease.state(), "lease no longer held, renewal stops");
            return Tick::Stop;
        }
        (lease.lock_id().to_string(), lease.holder_id().clone())
    };

    let span = lock_span("renew", &lock_id, holder_id.as_str());
    let result = ctx
        .backend
        .renew(&lock_id, &holder_id, ctx.lease_duration)
        .instrument(span)
        .await;

    match result {
        Ok(RenewOutcome::Renewed { expires_at, .. }) => {
            if let Err(e) = lock(&ctx.lease).renewed(expires_at, requested_at) {
                tracing::debug!(error = %e, "lease changed during renewal");
                return Tick::Stop;
            }
            ctx.metrics.record_renewal("renewed");
            tracing::debug!(lock_id = %lock_id, %expires_at, "lease renewed");
            if *failures > 0 {
                tracing::info!(
                    lock_id = %lock_id,
                    failures = *failures,
                    "lock backend reachable again"
                );
                *failures = 0;
                ctx.metrics.set_degraded(0);
                ctx.observer.recovered();
            }
            ctx.observer.renewed(expires_at);
            Tick::Continue
        }
        Ok(RenewOutcome::Lost { current_holder }) => {
            let message = match current_holder {
                Some(holder) => format!("lock {lock_id} is now held by {holder}"),
                None => format!("lock {lock_id} no longer records this holder"),
            };
            declare_lost(ctx, &lock_id, message, "stolen")
        }
        Err(err) => {
            *failures += 1;
            ctx.metrics.record_renewal("error");
            ctx.metrics.record_backend_error("renew");

            let deadline_passed = lock(&ctx.lease).safe_deadline_passed(Instant::now());
            if *failures > ctx.max_failures || deadline_passed {
                let cause = if deadline_passed { "deadline" } else { "unavailable" };
                let message = format!(
                    "renewal failed {failures} consecutive times, ownership can no longer be assumed: {err}",
                    failures = *failures,
                );
                return declare_lost(ctx, &lock_id, message, cause);
            }

            if let Err(e) = lock(&ctx.lease).renew_deferred() {
                tracing::debug!(error = %e, "lease changed during renewal");
                return Tick::Stop;
            }
            tracing::warn!(
                lock_id = %lock_id,
                failures = *failures,
                budget = ctx.max_failures,
                error = %err,
                "lease renewal failed, retrying next tick"
            );
            ctx.metrics.set_degraded(*failures);
            ctx.observer.degraded(*failures, &err);
            Tick::Continue
        }
    }
}

fn declare_lost(ctx: &RenewalContext, lock_id: &str, message: String, cause: &'static str) -> Tick {
    if let Err(e) = lock(&ctx.lease).lost() {
        tracing::debug!(error = %e, "lease changed during renewal");
        return Tick::Stop;
    }
    ctx.metrics.record_renewal("lost");
    ctx.metrics.record_lease_lost(cause);
    tracing::error!(lock_id, cause, "{message}");

    let err = Error::LeaseLost {
        lock_id: lock_id.to_string(),
        message,
    };
    ctx.observer.lost(&err);
    Tick::Lost
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InProcessLockBackend;
    use crate::lease::LeaseState;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tandem_core::id::HolderId;

    const PERIOD: Duration = Duration::from_millis(500);
    const LEASE: Duration = Duration::from_secs(2);

    #[derive(Default)]
    struct Recorder {
        renewed: AtomicU32,
        lost: AtomicU32,
        last_lost_code: Mutex<Option<String>>,
    }

    impl RenewalObserver for Recorder {
        fn renewed(&self, _expires_at: DateTime<Utc>) {
            self.renewed.fetch_add(1, Ordering::SeqCst);
        }
        fn degraded(&self, _consecutive_failures: u32, _error: &Error) {}
        fn recovered(&self) {}
        fn lost(&self, error: &Error) {
            self.lost.fetch_add(1, Ordering::SeqCst);
            *self.last_lost_code.lock().expect("lock") = Some(error.code().to_string());
        }
    }

    async fn held(backend: &Arc<InProcessLockBackend>) -> Arc<Mutex<Lease>> {
        let holder = HolderId::generate();
        let mut lease = Lease::new("live", holder.clone(), Duration::from_millis(1500));
        lease.begin_acquire().expect("acquire");
        let grant = backend
            .try_acquire("live", &holder, LEASE)
            .await
            .expect("backend")
            .into_grant()
            .expect("granted");
        lease.granted(&grant, Instant::now()).expect("grant");
        Arc::new(Mutex::new(lease))
    }

    fn context(
        backend: Arc<InProcessLockBackend>,
        lease: Arc<Mutex<Lease>>,
        observer: Arc<Recorder>,
    ) -> RenewalContext {
        RenewalContext {
            backend,
            lease,
            lease_duration: LEASE,
            renew_period: PERIOD,
            max_failures: 3,
            observer,
            metrics: NodeMetrics::new("live", "in_process"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn renews_every_period_until_cancelled() {
        let backend = Arc::new(InProcessLockBackend::new());
        let lease = held(&backend).await;
        let recorder = Arc::new(Recorder::default());
        let task = RenewalScheduler::spawn(
            &Handle::current(),
            context(backend, Arc::clone(&lease), Arc::clone(&recorder)),
        );

        tokio::time::sleep(PERIOD * 4 + Duration::from_millis(10)).await;
        assert_eq!(recorder.renewed.load(Ordering::SeqCst), 4);
        assert_eq!(lock(&lease).state(), LeaseState::Held);

        assert_eq!(task.cancel().await, Some(RenewalExit::Cancelled));
        tokio::time::sleep(PERIOD * 2).await;
        assert_eq!(recorder.renewed.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn stolen_lease_is_reported_once() {
        let backend = Arc::new(InProcessLockBackend::new());
        let lease = held(&backend).await;
        let recorder = Arc::new(Recorder::default());
        let task = RenewalScheduler::spawn(
            &Handle::current(),
            context(
                Arc::clone(&backend),
                Arc::clone(&lease),
                Arc::clone(&recorder),
            ),
        );

        let holder = lock(&lease).holder_id().clone();
        backend.release("live", &holder).await.expect("release");
        let thief = HolderId::generate();
        backend
            .try_acquire("live", &thief, LEASE)
            .await
            .expect("acquire");

        tokio::time::sleep(PERIOD * 4).await;
        assert!(task.is_finished());
        assert_eq!(recorder.lost.load(Ordering::SeqCst), 1);
        assert_eq!(
            recorder.last_lost_code.lock().expect("lock").as_deref(),
            Some("LEASE_LOST")
        );
        assert_eq!(lock(&lease).state(), LeaseState::Lost);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_lease_is_no_longer_held() {
        let backend = Arc::new(InProcessLockBackend::new());
        let lease = held(&backend).await;
        let recorder = Arc::new(Recorder::default());
        let task = RenewalScheduler::spawn(
            &Handle::current(),
            context(backend, Arc::clone(&lease), Arc::clone(&recorder)),
        );

        lock(&lease).released().expect("released");
        tokio::time::sleep(PERIOD * 2).await;
        assert!(task.is_finished());
        assert_eq!(recorder.lost.load(Ordering::SeqCst), 0);
        assert_eq!(task.cancel().await, Some(RenewalExit::Cancelled));
    }
}
