//! Test fixtures for node managers and lock stores.

use std::time::Duration;

use tandem_core::config::{BackendConfig, NodeManagerConfig, SqlLockConfig};
use tandem_core::id::HolderId;
use tandem_node::backend::SqlLockBackend;
use tempfile::TempDir;

/// Lease duration used by [`test_config`].
pub const TEST_LEASE: Duration = Duration::from_secs(2);

/// Renew period used by [`test_config`].
pub const TEST_RENEW: Duration = Duration::from_millis(500);

/// Returns a lock identifier no other test uses.
///
/// Keeps tests isolated when they share the process-wide in-process backend.
pub fn unique_lock_id(prefix: &str) -> String {
    format!("{prefix}-{}", HolderId::generate())
}

/// Returns a valid config with a 2s lease and a 500ms renew period.
pub fn test_config(node_id: &str) -> NodeManagerConfig {
    NodeManagerConfig::default()
        .with_node_id(node_id)
        .with_lease_duration(TEST_LEASE)
        .with_renew_period(TEST_RENEW)
}

/// A SQLite lock store in a temporary directory.
///
/// The database file is shared by every backend created from the fixture,
/// the same way two broker processes share one store.
#[derive(Debug)]
pub struct SqliteFixture {
    dir: TempDir,
}

impl SqliteFixture {
    /// Creates an empty store directory.
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("create temp dir"),
        }
    }

    /// Returns the connection URL of the store.
    pub fn url(&self) -> String {
        format!("sqlite://{}", self.dir.path().join("lock.db").display())
    }

    /// Returns a SQL lock config for the store.
    pub fn sql_config(&self) -> SqlLockConfig {
        SqlLockConfig::new(self.url())
    }

    /// Returns a node manager config using the store.
    pub fn node_config(&self, node_id: &str) -> NodeManagerConfig {
        test_config(node_id).with_backend(BackendConfig::Sql(self.sql_config()))
    }

    /// Opens a new backend on the store with its own connection pool.
    pub async fn backend(&self) -> SqlLockBackend {
        SqlLockBackend::connect(&self.sql_config())
            .await
            .expect("connect to sqlite fixture")
    }
}

impl Default for SqliteFixture {
    fn default() -> Self {
        Self::new()
    }
}
