//! Node manager façade.
//!
//! [`NodeManager`] decides whether this broker replica acts as the live node
//! or as a backup. It composes a [`Lease`] on a [`LockBackend`] with a
//! renewal task, and translates lease events into role transitions.
//!
//! ## Roles
//!
//! - [`NodeManager::start_live_node`] acquires the live lock, retrying while
//!   another holder owns it, and starts renewing.
//! - [`NodeManager::start_backup`] polls the lock in the background and
//!   promotes this node once the live holder's lease is observed expired.
//! - A lost lease moves the node to [`NodeStatus::Failed`] and is reported to
//!   the [`CriticalErrorListener`]. It is never silently re-acquired.
//!
//! ## Background work
//!
//! Every background task runs on the tokio runtime handle supplied at
//! construction. [`NodeManager::stop`] tears all of it down and releases the
//! lock; dropping the manager aborts the tasks and releases best-effort.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tandem_core::config::NodeManagerConfig;
use tandem_core::error::{Error, Result};
use tandem_core::id::{FencingToken, HolderId};
use tandem_core::observability::{lock_span, node_span};
use tokio::runtime::Handle;
use tokio::sync::{OnceCell, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;

use crate::backend::{self, AcquireOutcome, BackendCapabilities, LeaseGrant, LockBackend};
use crate::events::{CriticalErrorListener, Health, LogCriticalErrors, NodeEvent, NodeStatus};
use crate::lease::{Lease, LeaseSnapshot, LeaseState};
use crate::metrics::NodeMetrics;
use crate::renewal::{RenewalContext, RenewalObserver, RenewalScheduler, RenewalTask};

const EVENT_CAPACITY: usize = 64;
const MAX_BACKOFF_SHIFT: u32 = 4;

/// Builds a [`NodeManager`].
///
/// ## Example
///
/// ```rust
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// use tandem_core::NodeManagerConfig;
/// use tandem_node::backend::InProcessLockBackend;
/// use tandem_node::NodeManager;
///
/// # tokio_test::block_on(async {
/// let config = NodeManagerConfig::default()
///     .with_node_id("broker-a")
///     .with_lease_duration(Duration::from_secs(2))
///     .with_renew_period(Duration::from_millis(500));
///
/// let manager = NodeManager::builder(config)
///     .backend(Arc::new(InProcessLockBackend::new()))
///     .runtime(tokio::runtime::Handle::current())
///     .listener(|code: &str, message: &str, lock_id: &str| {
///         eprintln!("{code} on {lock_id}: {message}");
///     })
///     .build()?;
///
/// manager.start_live_node().await?;
/// assert!(manager.is_live_node());
/// manager.stop().await;
/// # Ok::<(), tandem_core::Error>(())
/// # }).unwrap();
/// ```
pub struct NodeManagerBuilder {
    config: NodeManagerConfig,
    backend: Option<Arc<dyn LockBackend>>,
    runtime: Option<Handle>,
    listener: Option<Arc<dyn CriticalErrorListener>>,
    holder_id: Option<HolderId>,
}

impl NodeManagerBuilder {
    /// Uses `backend` instead of constructing the one named by the config.
    ///
    /// A supplied backend is shared with the caller and is not closed by
    /// [`NodeManager::stop`].
    #[must_use]
    pub fn backend(mut self, backend: Arc<dyn LockBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Runs background tasks on `handle`. Defaults to the current runtime.
    #[must_use]
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Receives lost-lease failures. Defaults to [`LogCriticalErrors`].
    #[must_use]
    pub fn listener(mut self, listener: impl CriticalErrorListener + 'static) -> Self {
        self.listener = Some(Arc::new(listener));
        self
    }

    /// Overrides the generated holder identity.
    #[must_use]
    pub fn holder_id(mut self, holder_id: HolderId) -> Self {
        self.holder_id = Some(holder_id);
        self
    }

    /// Validates the configuration and builds the node manager.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the configuration is invalid or no
    /// runtime handle is available.
    pub fn build(self) -> Result<NodeManager> {
        self.config.validate()?;
        let runtime = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|_| {
                Error::configuration("no tokio runtime handle supplied for background tasks")
            })?,
        };

        let (backend, owns_backend) = match self.backend {
            Some(backend) => (backend, false),
            None => {
                let _enter = runtime.enter();
                (backend::from_config(&self.config.backend)?, true)
            }
        };

        let holder_id = self.holder_id.unwrap_or_else(HolderId::generate);
        let lease = Lease::new(
            self.config.lock_id.clone(),
            holder_id.clone(),
            self.config.safe_lease_window(),
        );
        let metrics = NodeMetrics::new(self.config.lock_id.clone(), backend.name());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        tracing::info!(
            node_id = %self.config.node_id,
            lock_id = %self.config.lock_id,
            holder_id = %holder_id,
            backend = backend.name(),
            lease_duration = ?self.config.lease_duration,
            renew_period = ?self.config.renew_period,
            "node manager created"
        );

        Ok(NodeManager {
            shared: Arc::new(Shared {
                config: self.config,
                holder_id,
                backend,
                owns_backend,
                runtime,
                lease: Arc::new(Mutex::new(lease)),
                tasks: Mutex::new(Tasks::default()),
                role: tokio::sync::Mutex::new(()),
                prepared: OnceCell::new(),
                status: watch::Sender::new(NodeStatus::Stopped),
                health: watch::Sender::new(Health::Healthy),
                events,
                stop: watch::Sender::new(false),
                closed: AtomicBool::new(false),
                listener: self.listener.unwrap_or_else(|| Arc::new(LogCriticalErrors)),
                metrics,
            }),
        })
    }
}

/// Live/backup node manager for one broker replica.
pub struct NodeManager {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Tasks {
    renewal: Option<RenewalTask>,
    backup: Option<JoinHandle<()>>,
}

struct Shared {
    config: NodeManagerConfig,
    holder_id: HolderId,
    backend: Arc<dyn LockBackend>,
    owns_backend: bool,
    runtime: Handle,
    lease: Arc<Mutex<Lease>>,
    tasks: Mutex<Tasks>,
    /// Serializes role transitions.
    role: tokio::sync::Mutex<()>,
    prepared: OnceCell<()>,
    status: watch::Sender<NodeStatus>,
    health: watch::Sender<Health>,
    events: broadcast::Sender<NodeEvent>,
    stop: watch::Sender<bool>,
    closed: AtomicBool,
    listener: Arc<dyn CriticalErrorListener>,
    metrics: NodeMetrics,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn backoff(base: Duration, failures: u32, cap: Duration) -> Duration {
    base.saturating_mul(1 << failures.min(MAX_BACKOFF_SHIFT)).min(cap)
}

enum Takeover {
    Waiting,
    Promoted,
    Stopped,
}

impl NodeManager {
    /// Starts building a node manager.
    #[must_use]
    pub fn builder(config: NodeManagerConfig) -> NodeManagerBuilder {
        NodeManagerBuilder {
            config,
            backend: None,
            runtime: None,
            listener: None,
            holder_id: None,
        }
    }

    /// Builds a node manager with the backend named by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the configuration is invalid.
    pub fn from_config(config: NodeManagerConfig, runtime: Handle) -> Result<Self> {
        Self::builder(config).runtime(runtime).build()
    }

    /// Acquires the live lock and starts renewing it.
    ///
    /// Retries while another holder owns the lock and backs off while the
    /// backend is unreachable. An in-flight backend call is never abandoned,
    /// so a bounded attempt returns within the acquisition timeout plus one
    /// backend round trip, and never leaves a lock held behind the caller's
    /// back.
    ///
    /// # Errors
    ///
    /// - [`Error::AcquisitionTimeout`] if the configured bound expires
    /// - [`Error::Stopped`] if [`NodeManager::stop`] is called meanwhile
    /// - [`Error::InvalidStateTransition`] if a lost lease left the node failed
    pub async fn start_live_node(&self) -> Result<LeaseSnapshot> {
        let shared = &self.shared;
        let span = node_span("start_live_node", &shared.config.node_id, &shared.config.lock_id);
        shared.start_live().instrument(span).await
    }

    /// Starts passive backup mode without blocking.
    ///
    /// A background task polls the live lock every backup poll interval. Once
    /// the lock is observed free or expired, it attempts to take it over and,
    /// if granted, promotes this node to live.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] if this node is already live
    /// or failed, and [`Error::Stopped`] after [`NodeManager::stop`].
    pub async fn start_backup(&self) -> Result<()> {
        let shared = &self.shared;
        let _role = shared.role.lock().await;
        shared.ensure_open()?;

        let status = *shared.status.borrow();
        if matches!(status, NodeStatus::Live | NodeStatus::Failed) {
            return Err(Error::InvalidStateTransition {
                from: status.as_label().to_string(),
                to: NodeStatus::Backup.as_label().to_string(),
            });
        }

        let mut tasks = lock(&shared.tasks);
        if tasks.backup.as_ref().is_some_and(|h| !h.is_finished()) {
            return Ok(());
        }
        shared.set_status(NodeStatus::Starting);
        let span = node_span("backup", &shared.config.node_id, &shared.config.lock_id);
        tasks.backup = Some(
            shared
                .runtime
                .spawn(backup_monitor(Arc::clone(shared)).instrument(span)),
        );
        Ok(())
    }

    /// Waits until this node is live.
    ///
    /// # Errors
    ///
    /// - [`Error::AcquisitionTimeout`] if `timeout` expires first
    /// - [`Error::LeaseLost`] if the node failed
    /// - [`Error::Stopped`] if the node manager was stopped
    pub async fn await_live_node(&self, timeout: Option<Duration>) -> Result<LeaseSnapshot> {
        let shared = &self.shared;
        let wait = shared.wait_for_status(|status| status == NodeStatus::Live);
        let bound = timeout.unwrap_or(Duration::MAX);
        match tokio::time::timeout(bound, wait).await {
            Ok(result) => result.map(|()| shared.lease_snapshot()),
            Err(_) => Err(Error::AcquisitionTimeout {
                lock_id: shared.config.lock_id.clone(),
                timeout: bound,
            }),
        }
    }

    /// Waits until this node is running as a backup (or has been promoted).
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] if `timeout` expires first
    /// - [`Error::LeaseLost`] if the node failed
    /// - [`Error::Stopped`] if the node manager was stopped
    pub async fn await_backup_node(&self, timeout: Option<Duration>) -> Result<()> {
        let wait = self
            .shared
            .wait_for_status(|status| matches!(status, NodeStatus::Backup | NodeStatus::Live));
        let bound = timeout.unwrap_or(Duration::MAX);
        tokio::time::timeout(bound, wait)
            .await
            .map_err(|_| Error::Timeout {
                operation: "await_backup_node",
                timeout: bound,
            })?
    }

    /// Waits until some node, possibly another process, holds the live lock.
    ///
    /// Backend outages are logged and polled through.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if `timeout` expires first, [`Error::Stopped`]
    /// after [`NodeManager::stop`], or a non-connectivity backend error.
    pub async fn await_live_status(&self, timeout: Option<Duration>) -> Result<()> {
        let bound = timeout.unwrap_or(Duration::MAX);
        tokio::time::timeout(bound, self.shared.poll_until_live())
            .await
            .map_err(|_| Error::Timeout {
                operation: "await_live_status",
                timeout: bound,
            })?
    }

    /// Returns true if this node currently holds the live role.
    #[must_use]
    pub fn is_live_node(&self) -> bool {
        *self.shared.status.borrow() == NodeStatus::Live && lock(&self.shared.lease).is_held()
    }

    /// Abandons the live role without releasing the lock.
    ///
    /// Background tasks are aborted as if the process had died; the lock
    /// stays recorded until its lease expires. Used to exercise failover.
    pub async fn crash_live_node(&self) {
        let shared = &self.shared;
        let _role = shared.role.lock().await;
        let (renewal, backup) = {
            let mut tasks = lock(&shared.tasks);
            (tasks.renewal.take(), tasks.backup.take())
        };
        if let Some(task) = renewal {
            task.abort();
        }
        if let Some(handle) = backup {
            handle.abort();
            let _ = handle.await;
        }

        lock(&shared.lease).reset();
        shared.metrics.set_live(false);
        shared.set_status(NodeStatus::Stopped);
        tracing::warn!(node_id = %shared.config.node_id, "live node crashed without releasing");
        shared.emit(NodeEvent::Crashed {
            node_id: shared.config.node_id.clone(),
        });
    }

    /// Stops the node manager.
    ///
    /// Cancels the renewal and backup tasks, releases the lock if held and
    /// closes backend resources this manager created. Release failures are
    /// logged, not returned: the lease will expire on its own. Idempotent;
    /// a stopped node manager cannot be restarted.
    pub async fn stop(&self) {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        shared.stop.send_replace(true);
        let span = node_span("stop", &shared.config.node_id, &shared.config.lock_id);
        async {
            let _role = shared.role.lock().await;
            let orphaned = shared.stop_backup_monitor().await;
            let renewal = lock(&shared.tasks).renewal.take();
            if let Some(task) = renewal {
                task.cancel().await;
            }

            let held = {
                let mut lease = lock(&shared.lease);
                let held = lease.is_held();
                if held {
                    let _ = lease.released();
                }
                held
            };
            if held || orphaned {
                shared.release_best_effort().await;
            }
            if held {
                shared.emit(NodeEvent::Released {
                    node_id: shared.config.node_id.clone(),
                });
            }
            lock(&shared.lease).reset();
            shared.metrics.set_live(false);

            if shared.owns_backend {
                shared.backend.close().await;
            }
            shared.set_status(NodeStatus::Stopped);
            tracing::info!("node manager stopped");
            shared.emit(NodeEvent::Stopped {
                node_id: shared.config.node_id.clone(),
            });
        }
        .instrument(span)
        .await;
    }

    /// Returns the current role.
    #[must_use]
    pub fn status(&self) -> NodeStatus {
        *self.shared.status.borrow()
    }

    /// Returns a receiver that observes role changes.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<NodeStatus> {
        self.shared.status.subscribe()
    }

    /// Returns the health of the backend connection.
    #[must_use]
    pub fn health(&self) -> Health {
        *self.shared.health.borrow()
    }

    /// Subscribes to node events emitted from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.shared.events.subscribe()
    }

    /// Returns the fencing token of the live lease, if this node is live.
    #[must_use]
    pub fn fencing_token(&self) -> Option<FencingToken> {
        let lease = lock(&self.shared.lease);
        if lease.is_held() {
            lease.fencing_token()
        } else {
            None
        }
    }

    /// Returns the live lease, if this node holds it.
    #[must_use]
    pub fn live_lease(&self) -> Option<LeaseSnapshot> {
        let lease = lock(&self.shared.lease);
        lease.is_held().then(|| lease.snapshot())
    }

    /// Returns the lease, whatever its state.
    #[must_use]
    pub fn lease(&self) -> LeaseSnapshot {
        self.shared.lease_snapshot()
    }

    /// Returns the configured node identity.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.shared.config.node_id
    }

    /// Returns the holder identity used with the backend.
    #[must_use]
    pub fn holder_id(&self) -> &HolderId {
        &self.shared.holder_id
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &NodeManagerConfig {
        &self.shared.config
    }

    /// Returns the backend's guarantees.
    #[must_use]
    pub fn capabilities(&self) -> BackendCapabilities {
        self.shared.backend.capabilities()
    }
}

impl std::fmt::Debug for NodeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeManager")
            .field("node_id", &self.shared.config.node_id)
            .field("lock_id", &self.shared.config.lock_id)
            .field("holder_id", &self.shared.holder_id)
            .field("backend", &self.shared.backend.name())
            .field("status", &*self.shared.status.borrow())
            .finish_non_exhaustive()
    }
}

impl Drop for NodeManager {
    fn drop(&mut self) {
        let shared = &self.shared;
        shared.stop.send_replace(true);
        {
            let mut tasks = lock(&shared.tasks);
            if let Some(handle) = tasks.backup.take() {
                handle.abort();
            }
            if let Some(task) = tasks.renewal.take() {
                task.abort();
            }
        }
        if shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let needs_release = {
            let mut lease = lock(&shared.lease);
            let state = lease.state();
            lease.reset();
            state.is_held() || state == LeaseState::Acquiring
        };
        shared.metrics.set_live(false);
        if needs_release {
            tracing::warn!(
                lock_id = %shared.config.lock_id,
                "node manager dropped without stop, releasing lock in background"
            );
            let shared = Arc::clone(shared);
            drop(shared.runtime.clone().spawn(async move {
                shared.release_best_effort().await;
            }));
        }
    }
}

impl Shared {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(Error::Stopped)
        } else {
            Ok(())
        }
    }

    async fn ensure_prepared(&self) -> Result<()> {
        self.prepared
            .get_or_try_init(|| self.backend.prepare())
            .await
            .map(|&()| ())
    }

    fn lease_snapshot(&self) -> LeaseSnapshot {
        lock(&self.lease).snapshot()
    }

    fn emit(&self, event: NodeEvent) {
        let _ = self.events.send(event);
    }

    fn set_status(&self, status: NodeStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            tracing::info!(from = previous.as_label(), to = status.as_label(), "node status changed");
        }
    }

    fn set_health(&self, health: Health) {
        self.health.send_replace(health);
    }

    async fn wait_for_status<F>(&self, target: F) -> Result<()>
    where
        F: Fn(NodeStatus) -> bool,
    {
        let mut rx = self.status.subscribe();
        loop {
            let status = *rx.borrow_and_update();
            if target(status) {
                return Ok(());
            }
            if status == NodeStatus::Failed {
                return Err(Error::LeaseLost {
                    lock_id: self.config.lock_id.clone(),
                    message: "live lease was lost".to_string(),
                });
            }
            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::Stopped);
            }
            rx.changed().await.map_err(|_| Error::Stopped)?;
        }
    }

    async fn start_live(self: &Arc<Self>) -> Result<LeaseSnapshot> {
        let _role = self.role.lock().await;
        self.ensure_open()?;
        let status = *self.status.borrow();
        match status {
            NodeStatus::Live => return Ok(self.lease_snapshot()),
            NodeStatus::Failed => {
                return Err(Error::InvalidStateTransition {
                    from: status.as_label().to_string(),
                    to: NodeStatus::Live.as_label().to_string(),
                });
            }
            NodeStatus::Stopped | NodeStatus::Starting | NodeStatus::Backup => {}
        }

        if self.stop_backup_monitor().await {
            self.release_best_effort().await;
        }
        self.set_status(NodeStatus::Starting);
        let deadline = self.config.acquisition_timeout.map(|t| Instant::now() + t);

        let mut attempt = AttemptGuard {
            shared: self,
            armed: true,
        };
        let result = self.acquire_loop(deadline).await;
        attempt.armed = false;

        match result {
            Ok(grant) => {
                self.activate(&grant);
                Ok(self.lease_snapshot())
            }
            Err(err) => {
                tracing::warn!(error = %err, "live lock not acquired");
                self.abandon_attempt().await;
                Err(err)
            }
        }
    }

    async fn poll_until_live(&self) -> Result<()> {
        let mut stop = self.stop.subscribe();
        let interval = self.config.backup_poll_interval();
        loop {
            self.ensure_open()?;
            let observed = match self.ensure_prepared().await {
                Ok(()) => self.backend.is_locked(&self.config.lock_id).await,
                Err(e) => Err(e),
            };
            match observed {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) if e.is_backend_unavailable() => {
                    tracing::warn!(error = %e, "cannot observe live lock");
                }
                Err(e) => return Err(e),
            }
            tokio::select! {
                _ = stop.changed() => return Err(Error::Stopped),
                () = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// One acquisition attempt. `None` means contended.
    ///
    /// The backend call runs as its own task so that dropping the caller
    /// cannot strand a grant the store has already recorded.
    async fn acquire_once(self: &Arc<Self>) -> Result<Option<LeaseGrant>> {
        self.ensure_prepared().await?;
        lock(&self.lease).begin_acquire()?;
        let lock_id = &self.config.lock_id;
        let requested_at = Instant::now();
        let call = {
            let shared = Arc::clone(self);
            let span = lock_span("try_acquire", lock_id, self.holder_id.as_str());
            self.runtime.spawn(
                async move {
                    shared
                        .backend
                        .try_acquire(
                            &shared.config.lock_id,
                            &shared.holder_id,
                            shared.config.lease_duration,
                        )
                        .await
                }
                .instrument(span),
            )
        };
        let outcome = PendingAcquire {
            shared: Arc::clone(self),
            call: Some(call),
        }
        .finish()
        .await;

        let mut lease = lock(&self.lease);
        match outcome {
            Ok(AcquireOutcome::Granted(grant)) => {
                lease.granted(&grant, requested_at)?;
                self.metrics.record_acquisition("granted");
                Ok(Some(grant))
            }
            Ok(AcquireOutcome::Contended { current_holder }) => {
                lease.declined()?;
                self.metrics.record_acquisition("contended");
                tracing::debug!(
                    lock_id = %lock_id,
                    current_holder = current_holder.as_deref().unwrap_or("unknown"),
                    "live lock is held by another node"
                );
                Ok(None)
            }
            Err(err) => {
                lease.reset();
                self.metrics.record_acquisition("error");
                self.metrics.record_backend_error("try_acquire");
                Err(err)
            }
        }
    }

    async fn acquire_loop(self: &Arc<Self>, deadline: Option<Instant>) -> Result<LeaseGrant> {
        let mut stop = self.stop.subscribe();
        let interval = self.config.backup_poll_interval();
        let mut failures = 0_u32;

        loop {
            if *stop.borrow() {
                return Err(Error::Stopped);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(Error::AcquisitionTimeout {
                    lock_id: self.config.lock_id.clone(),
                    timeout: self.config.acquisition_timeout.unwrap_or_default(),
                });
            }

            let mut delay = interval;
            let attempt = self.acquire_once().await;
            if failures > 0 && attempt.is_ok() {
                failures = 0;
                self.backend_recovered();
            }
            match attempt {
                Ok(Some(grant)) => return Ok(grant),
                Ok(None) => {}
                Err(err) if err.is_backend_unavailable() => {
                    failures += 1;
                    delay = backoff(interval, failures, self.config.lease_duration);
                    tracing::warn!(error = %err, failures, retry_in = ?delay, "lock backend unavailable");
                    self.backend_degraded(failures, &err);
                }
                Err(err) => return Err(err),
            }

            if let Some(deadline) = deadline {
                delay = delay.min(deadline.saturating_duration_since(Instant::now()));
            }
            tokio::select! {
                _ = stop.changed() => return Err(Error::Stopped),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Polls the lock once, taking it over if it is free.
    ///
    /// The takeover runs under the role lock, so `stop` waits for an
    /// in-flight attempt and a grant is either activated or released.
    async fn poll_for_takeover(self: &Arc<Self>) -> Result<Takeover> {
        self.ensure_prepared().await?;
        if self.backend.is_locked(&self.config.lock_id).await? {
            return Ok(Takeover::Waiting);
        }
        let _role = self.role.lock().await;
        if *self.stop.borrow() {
            return Ok(Takeover::Stopped);
        }
        tracing::info!(lock_id = %self.config.lock_id, "live lock is free, attempting takeover");
        let Some(grant) = self.acquire_once().await? else {
            return Ok(Takeover::Waiting);
        };
        if *self.stop.borrow() {
            lock(&self.lease).reset();
            self.release_best_effort().await;
            return Ok(Takeover::Stopped);
        }
        self.activate(&grant);
        Ok(Takeover::Promoted)
    }

    fn backend_degraded(&self, consecutive_failures: u32, error: &Error) {
        self.set_health(Health::Degraded {
            consecutive_failures,
        });
        self.emit(NodeEvent::BackendDegraded {
            consecutive_failures,
            message: error.to_string(),
        });
    }

    fn backend_recovered(&self) {
        self.set_health(Health::Healthy);
        self.emit(NodeEvent::BackendRecovered);
    }

    fn activate(self: &Arc<Self>, grant: &LeaseGrant) {
        let ctx = RenewalContext {
            backend: Arc::clone(&self.backend),
            lease: Arc::clone(&self.lease),
            lease_duration: self.config.lease_duration,
            renew_period: self.config.renew_period,
            max_failures: self.config.max_renewal_failures,
            observer: Arc::new(ManagerObserver {
                shared: Arc::downgrade(self),
            }),
            metrics: self.metrics.clone(),
        };
        let task = RenewalScheduler::spawn(&self.runtime, ctx);
        if let Some(previous) = lock(&self.tasks).renewal.replace(task) {
            previous.abort();
        }

        self.metrics.set_live(true);
        self.metrics.set_degraded(0);
        self.set_health(Health::Healthy);
        self.set_status(NodeStatus::Live);
        tracing::info!(
            lock_id = %self.config.lock_id,
            fencing_token = grant.fencing_token.sequence(),
            expires_at = %grant.expires_at,
            "node is live"
        );
        self.emit(NodeEvent::BecameLive {
            node_id: self.config.node_id.clone(),
            fencing_token: grant.fencing_token,
        });
    }

    /// Aborts the backup monitor. Returns true if it was cut off mid-acquisition,
    /// in which case the store may record this holder.
    async fn stop_backup_monitor(&self) -> bool {
        let handle = lock(&self.tasks).backup.take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        let mut lease = lock(&self.lease);
        if lease.state() == LeaseState::Acquiring {
            lease.reset();
            true
        } else {
            false
        }
    }

    async fn abandon_attempt(&self) {
        let needs_release = {
            let mut lease = lock(&self.lease);
            let state = lease.state();
            lease.reset();
            state.is_held() || state == LeaseState::Acquiring
        };
        if needs_release {
            self.release_best_effort().await;
        }
        self.set_status(NodeStatus::Stopped);
    }

    async fn release_best_effort(&self) {
        let lock_id = &self.config.lock_id;
        match self
            .backend
            .release(lock_id, &self.holder_id)
            .instrument(lock_span("release", lock_id, self.holder_id.as_str()))
            .await
        {
            Ok(true) => tracing::info!(lock_id = %lock_id, "live lock released"),
            Ok(false) => tracing::debug!(lock_id = %lock_id, "live lock was not held at release"),
            Err(err) => {
                self.metrics.record_backend_error("release");
                tracing::warn!(
                    lock_id = %lock_id,
                    error = %err,
                    "failed to release live lock, it will expire on its own"
                );
            }
        }
    }
}

/// Undoes a `start_live_node` attempt whose caller went away.
struct AttemptGuard<'a> {
    shared: &'a Arc<Shared>,
    armed: bool,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let shared = self.shared;
        let was_held = {
            let mut lease = lock(&shared.lease);
            let held = lease.is_held();
            if held || lease.state() == LeaseState::Acquiring {
                lease.reset();
            }
            held
        };
        if *shared.status.borrow() == NodeStatus::Starting {
            shared.set_status(NodeStatus::Stopped);
        }
        tracing::warn!(lock_id = %shared.config.lock_id, "live node start abandoned by caller");
        if was_held {
            let shared = Arc::clone(shared);
            drop(shared.runtime.clone().spawn(async move {
                shared.release_best_effort().await;
            }));
        }
    }
}

/// An acquisition call running on the runtime.
///
/// If dropped before the call completes, the call is left to finish and any
/// grant it produced is released, unless this node has since become the
/// holder through a later attempt.
struct PendingAcquire {
    shared: Arc<Shared>,
    call: Option<JoinHandle<Result<AcquireOutcome>>>,
}

impl PendingAcquire {
    async fn finish(mut self) -> Result<AcquireOutcome> {
        let Some(call) = self.call.as_mut() else {
            return Err(Error::internal("acquisition already settled"));
        };
        let joined = call.await;
        self.call = None;
        joined.map_err(|e| Error::internal_with_source("acquisition task failed", e))?
    }
}

impl Drop for PendingAcquire {
    fn drop(&mut self) {
        if let Some(call) = self.call.take() {
            let shared = Arc::clone(&self.shared);
            drop(
                self.shared
                    .runtime
                    .spawn(settle_abandoned_acquire(shared, call)),
            );
        }
    }
}

async fn settle_abandoned_acquire(shared: Arc<Shared>, call: JoinHandle<Result<AcquireOutcome>>) {
    if let Ok(Ok(AcquireOutcome::Contended { .. })) = call.await {
        return;
    }
    let _role = shared.role.lock().await;
    let state = lock(&shared.lease).state();
    if state.is_held() || state == LeaseState::Acquiring {
        return;
    }
    tracing::info!(
        lock_id = %shared.config.lock_id,
        "releasing lock claimed by an abandoned acquisition"
    );
    shared.release_best_effort().await;
}

async fn backup_monitor(shared: Arc<Shared>) {
    let mut stop = shared.stop.subscribe();
    let interval = shared.config.backup_poll_interval();
    let mut announced = false;
    let mut failures = 0_u32;

    loop {
        if *stop.borrow() {
            return;
        }
        let mut delay = interval;
        match shared.poll_for_takeover().await {
            Ok(Takeover::Promoted | Takeover::Stopped) => return,
            Ok(Takeover::Waiting) => {
                if failures > 0 {
                    failures = 0;
                    shared.backend_recovered();
                }
                if !announced {
                    announced = true;
                    shared.set_status(NodeStatus::Backup);
                    shared.emit(NodeEvent::BecameBackup {
                        node_id: shared.config.node_id.clone(),
                    });
                }
            }
            Err(err) => {
                failures += 1;
                shared.metrics.record_backend_error("poll");
                delay = backoff(interval, failures, shared.config.lease_duration);
                tracing::warn!(error = %err, failures, retry_in = ?delay, "backup poll failed");
                shared.backend_degraded(failures, &err);
            }
        }

        tokio::select! {
            _ = stop.changed() => return,
            () = tokio::time::sleep(delay) => {}
        }
    }
}

/// Routes renewal outcomes into status, health, events and the listener.
struct ManagerObserver {
    shared: Weak<Shared>,
}

impl RenewalObserver for ManagerObserver {
    fn renewed(&self, _expires_at: DateTime<Utc>) {}

    fn degraded(&self, consecutive_failures: u32, error: &Error) {
        if let Some(shared) = self.shared.upgrade() {
            shared.backend_degraded(consecutive_failures, error);
        }
    }

    fn recovered(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.backend_recovered();
        }
    }

    fn lost(&self, error: &Error) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let message = match error {
            Error::LeaseLost { message, .. } => message.clone(),
            other => other.to_string(),
        };
        shared.metrics.set_live(false);
        shared.set_status(NodeStatus::Failed);
        shared
            .listener
            .on_critical_error(error.code(), &message, &shared.config.lock_id);
        shared.emit(NodeEvent::LeaseLost {
            node_id: shared.config.node_id.clone(),
            lock_id: shared.config.lock_id.clone(),
            code: error.code().to_string(),
            message,
        });
    }
}
