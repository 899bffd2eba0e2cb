//! Role status, health and events published by a node manager.

use serde::Serialize;
use tandem_core::id::FencingToken;

/// Broker role of a node manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Not started, or stopped.
    Stopped,
    /// Acquiring the live lock or starting the backup monitor.
    Starting,
    /// Passive standby polling the live lock.
    Backup,
    /// Holding the live lock.
    Live,
    /// The live lease was lost. Requires a restart.
    Failed,
}

impl NodeStatus {
    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Backup => "backup",
            Self::Live => "live",
            Self::Failed => "failed",
        }
    }
}

/// Health of the connection to the lock backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Health {
    /// The last backend call succeeded.
    Healthy,
    /// Recent renewals could not reach the backend.
    Degraded {
        /// Consecutive failed renewals.
        consecutive_failures: u32,
    },
}

impl Health {
    /// Returns true if healthy.
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// Role transitions and lease events, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NodeEvent {
    /// This node acquired the live lock.
    BecameLive {
        /// This node.
        node_id: String,
        /// Fencing token of the acquisition.
        fencing_token: FencingToken,
    },
    /// This node is a passive backup.
    BecameBackup {
        /// This node.
        node_id: String,
    },
    /// The live lease was lost. This node must stop acting as live.
    LeaseLost {
        /// This node.
        node_id: String,
        /// The lost lock.
        lock_id: String,
        /// Stable error code.
        code: String,
        /// How the loss was detected.
        message: String,
    },
    /// Renewals are failing to reach the backend.
    BackendDegraded {
        /// Consecutive failed renewals.
        consecutive_failures: u32,
        /// The last failure.
        message: String,
    },
    /// Renewals reach the backend again.
    BackendRecovered,
    /// The live lock was released voluntarily.
    Released {
        /// This node.
        node_id: String,
    },
    /// The live role was abandoned without releasing the lock.
    Crashed {
        /// This node.
        node_id: String,
    },
    /// The node manager stopped.
    Stopped {
        /// This node.
        node_id: String,
    },
}

/// Receives unrecoverable lease failures.
///
/// Invoked inline by the renewal task, at most once per lost lease, before
/// any further renewal would run. Implementations must not block for long.
pub trait CriticalErrorListener: Send + Sync {
    /// Called with a stable error code, a message and the lock identifier.
    fn on_critical_error(&self, code: &str, message: &str, context_id: &str);
}

impl<F> CriticalErrorListener for F
where
    F: Fn(&str, &str, &str) + Send + Sync,
{
    fn on_critical_error(&self, code: &str, message: &str, context_id: &str) {
        self(code, message, context_id);
    }
}

/// Default listener: logs the failure as fatal for the live role.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogCriticalErrors;

impl CriticalErrorListener for LogCriticalErrors {
    fn on_critical_error(&self, code: &str, message: &str, context_id: &str) {
        tracing::error!(
            code,
            lock_id = context_id,
            "critical lease failure, live role must stop: {message}"
        );
    }
}
