//! # tandem-core
//!
//! Core abstractions shared by the tandem live/backup node manager.
//!
//! This crate provides the foundational types used across all tandem components:
//!
//! - **Error Types**: The failure taxonomy (contention, backend unavailable,
//!   lease lost, acquisition timeout, configuration) and result alias
//! - **Identifiers**: Holder identifiers and fencing tokens
//! - **Configuration**: Lease timings and lock backend selection, loaded
//!   programmatically or from the environment and validated up front
//! - **Observability**: Logging initialization and span helpers
//!
//! ## Example
//!
//! ```rust
//! use std::time::Duration;
//!
//! use tandem_core::prelude::*;
//!
//! let config = NodeManagerConfig::default()
//!     .with_lease_duration(Duration::from_secs(2))
//!     .with_renew_period(Duration::from_millis(500));
//! config.validate().expect("valid timings");
//!
//! let holder = HolderId::generate();
//! assert!(!holder.as_str().is_empty());
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod id;
pub mod observability;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use tandem_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::{BackendConfig, NodeManagerConfig, SqlLockConfig};
    pub use crate::error::{Error, Result};
    pub use crate::id::{FencingToken, HolderId};
}

// Re-export key types at crate root for ergonomics
pub use config::{BackendConfig, NodeManagerConfig, SqlLockConfig};
pub use error::{Error, Result};
pub use id::{FencingToken, HolderId};
pub use observability::{LogFormat, init_logging};
