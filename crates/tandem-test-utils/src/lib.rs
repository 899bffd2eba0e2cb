//! Shared test utilities for tandem integration tests.
//!
//! This crate provides:
//! - [`FaultyBackend`]: a lock backend wrapper with injected failures and
//!   operation recording
//! - [`SqliteFixture`]: a SQLite lock store in a temporary directory
//! - Config fixtures with short, valid timings
//!
//! # Example
//!
//! ```rust,ignore
//! use tandem_test_utils::{FaultyBackend, init_test_logging, test_config};
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_example() {
//!     init_test_logging();
//!     let backend = FaultyBackend::in_process();
//!     backend.fail_next_renewals(3);
//!     // ... build a NodeManager on `backend` ...
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod backend;
pub mod fixtures;

pub use backend::*;
pub use fixtures::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("tandem_node=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
