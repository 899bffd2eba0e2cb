//! # tandem-node
//!
//! Lease-based live/backup arbitration for a replicated broker pair.
//!
//! Exactly one replica may act as the live node at a time. This crate makes
//! that decision safe under crashes, partitions and restarts:
//!
//! - **Lock backends** ([`backend`]): an in-process mutex for embedded use and
//!   a SQL lock row for replicas in separate processes
//! - **Lease** ([`lease`]): the time-bounded ownership state machine
//! - **Renewal** ([`renewal`]): the background task keeping a held lease alive
//! - **Node manager** ([`manager`]): the broker-facing façade
//!
//! ## Example
//!
//! ```rust
//! use std::time::Duration;
//!
//! use tandem_core::NodeManagerConfig;
//! use tandem_node::NodeManager;
//!
//! # tokio_test::block_on(async {
//! let config = NodeManagerConfig::default()
//!     .with_lock_id("doc-example")
//!     .with_lease_duration(Duration::from_secs(2))
//!     .with_renew_period(Duration::from_millis(500));
//!
//! let node = NodeManager::from_config(config, tokio::runtime::Handle::current())?;
//! let lease = node.start_live_node().await?;
//! assert!(node.is_live_node());
//! assert_eq!(node.fencing_token(), lease.fencing_token);
//!
//! node.stop().await;
//! # Ok::<(), tandem_core::Error>(())
//! # }).unwrap();
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod backend;
pub mod events;
pub mod lease;
pub mod manager;
pub mod metrics;
pub mod renewal;

pub use backend::{AcquireOutcome, BackendCapabilities, LeaseGrant, LockBackend, RenewOutcome};
pub use events::{CriticalErrorListener, Health, LogCriticalErrors, NodeEvent, NodeStatus};
pub use lease::{Lease, LeaseSnapshot, LeaseState};
pub use manager::{NodeManager, NodeManagerBuilder};
