//! Error types and result aliases for tandem.
//!
//! The taxonomy separates outcomes that callers must never conflate:
//!
//! - [`Error::Contention`]: another holder owns the lock. Normal and expected;
//!   most APIs report it as a result value instead of an error.
//! - [`Error::BackendUnavailable`]: the lock store could not be reached.
//!   Retried with backoff and surfaced as degraded health.
//! - [`Error::LeaseLost`]: a holder discovered it no longer owns the lock.
//!   Never silently retried into re-acquisition.
//! - [`Error::AcquisitionTimeout`]: a bounded acquisition expired.
//! - [`Error::Configuration`]: malformed parameters, rejected at construction.

use std::time::Duration;

/// The result type used throughout tandem.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in node manager operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The lock is currently owned by another holder.
    #[error("lock {lock_id} is held by another holder")]
    Contention {
        /// The contended lock identifier.
        lock_id: String,
        /// The current holder, if the backend reported one.
        holder: Option<String>,
    },

    /// The lock backend could not be reached.
    #[error("lock backend unavailable: {message}")]
    BackendUnavailable {
        /// Description of the connectivity failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The lease was lost while this process believed it was the holder.
    #[error("lease lost on lock {lock_id}: {message}")]
    LeaseLost {
        /// The lock whose lease was lost.
        lock_id: String,
        /// Description of how the loss was detected.
        message: String,
    },

    /// Acquisition did not succeed within the configured bound.
    #[error("timed out after {timeout:?} acquiring lock {lock_id}")]
    AcquisitionTimeout {
        /// The lock being acquired.
        lock_id: String,
        /// The bound that expired.
        timeout: Duration,
    },

    /// A blocking wait did not complete within its bound.
    #[error("timed out after {timeout:?} waiting for {operation}")]
    Timeout {
        /// The operation being waited on.
        operation: &'static str,
        /// The bound that expired.
        timeout: Duration,
    },

    /// Configuration is malformed or internally inconsistent.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the invalid setting.
        message: String,
    },

    /// An invalid lease state transition was attempted.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
    },

    /// The node manager was stopped while the operation was in progress.
    #[error("node manager stopped")]
    Stopped,

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl Error {
    /// Creates a backend-unavailable error with the given message.
    #[must_use]
    pub fn backend_unavailable(message: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a backend-unavailable error with a source cause.
    #[must_use]
    pub fn backend_unavailable_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::BackendUnavailable {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates an internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Creates an internal error with a source cause.
    #[must_use]
    pub fn internal_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Internal {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Returns true if the lock store could not be reached.
    #[must_use]
    pub const fn is_backend_unavailable(&self) -> bool {
        matches!(self, Self::BackendUnavailable { .. })
    }

    /// Returns true if this is an ordinary contention outcome.
    #[must_use]
    pub const fn is_contention(&self) -> bool {
        matches!(self, Self::Contention { .. })
    }

    /// Returns a stable error code for failure listeners and metrics.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Contention { .. } => "CONTENTION",
            Self::BackendUnavailable { .. } => "BACKEND_UNAVAILABLE",
            Self::LeaseLost { .. } => "LEASE_LOST",
            Self::AcquisitionTimeout { .. } => "ACQUISITION_TIMEOUT",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Configuration { .. } => "CONFIGURATION",
            Self::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            Self::Stopped => "STOPPED",
            Self::Internal { .. } => "INTERNAL",
        }
    }
}
