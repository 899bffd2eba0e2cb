//! Node manager metrics.
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `tandem_acquisitions_total` | Counter | `lock_id`, `result` | Acquisition attempts by outcome |
//! | `tandem_renewals_total` | Counter | `lock_id`, `result` | Renewal attempts by outcome |
//! | `tandem_leases_lost_total` | Counter | `lock_id`, `cause` | Leases lost while live |
//! | `tandem_backend_errors_total` | Counter | `backend`, `operation` | Backend calls that failed |
//! | `tandem_node_live` | Gauge | `lock_id` | 1 while this node holds the live role |
//! | `tandem_backend_degraded` | Gauge | `lock_id` | Consecutive failed renewals |
//!
//! Metrics go through the `metrics` crate facade; installing an exporter is
//! left to the embedding application.

use metrics::{counter, gauge};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: acquisition attempts by result.
    pub const ACQUISITIONS_TOTAL: &str = "tandem_acquisitions_total";
    /// Counter: renewal attempts by result.
    pub const RENEWALS_TOTAL: &str = "tandem_renewals_total";
    /// Counter: leases lost while live.
    pub const LEASES_LOST_TOTAL: &str = "tandem_leases_lost_total";
    /// Counter: failed backend calls.
    pub const BACKEND_ERRORS_TOTAL: &str = "tandem_backend_errors_total";
    /// Gauge: whether this node is live.
    pub const NODE_LIVE: &str = "tandem_node_live";
    /// Gauge: consecutive failed renewals.
    pub const BACKEND_DEGRADED: &str = "tandem_backend_degraded";
}

/// Label keys used across metrics.
pub mod labels {
    /// Lock identifier.
    pub const LOCK_ID: &str = "lock_id";
    /// Outcome (granted, contended, renewed, lost, error).
    pub const RESULT: &str = "result";
    /// Why a lease was lost (stolen, unavailable, deadline).
    pub const CAUSE: &str = "cause";
    /// Backend name.
    pub const BACKEND: &str = "backend";
    /// Backend operation.
    pub const OPERATION: &str = "operation";
}

/// Records node manager metrics for one lock.
#[derive(Debug, Clone)]
pub struct NodeMetrics {
    lock_id: String,
    backend: &'static str,
}

impl NodeMetrics {
    /// Creates a recorder labelled with `lock_id` and the backend name.
    #[must_use]
    pub fn new(lock_id: impl Into<String>, backend: &'static str) -> Self {
        Self {
            lock_id: lock_id.into(),
            backend,
        }
    }

    /// Records an acquisition attempt.
    pub fn record_acquisition(&self, result: &'static str) {
        counter!(
            names::ACQUISITIONS_TOTAL,
            labels::LOCK_ID => self.lock_id.clone(),
            labels::RESULT => result,
        )
        .increment(1);
    }

    /// Records a renewal attempt.
    pub fn record_renewal(&self, result: &'static str) {
        counter!(
            names::RENEWALS_TOTAL,
            labels::LOCK_ID => self.lock_id.clone(),
            labels::RESULT => result,
        )
        .increment(1);
    }

    /// Records a lost lease.
    pub fn record_lease_lost(&self, cause: &'static str) {
        counter!(
            names::LEASES_LOST_TOTAL,
            labels::LOCK_ID => self.lock_id.clone(),
            labels::CAUSE => cause,
        )
        .increment(1);
    }

    /// Records a failed backend call.
    pub fn record_backend_error(&self, operation: &'static str) {
        counter!(
            names::BACKEND_ERRORS_TOTAL,
            labels::BACKEND => self.backend,
            labels::OPERATION => operation,
        )
        .increment(1);
    }

    /// Sets the live gauge.
    pub fn set_live(&self, live: bool) {
        gauge!(names::NODE_LIVE, labels::LOCK_ID => self.lock_id.clone())
            .set(if live { 1.0 } else { 0.0 });
    }

    /// Sets the degraded gauge to the current consecutive failure count.
    pub fn set_degraded(&self, consecutive_failures: u32) {
        gauge!(names::BACKEND_DEGRADED, labels::LOCK_ID => self.lock_id.clone())
            .set(f64::from(consecutive_failures));
    }
}
