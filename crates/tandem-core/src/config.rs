//! Node manager configuration.
//!
//! Timings and lock backend selection are fixed once, when a node manager is
//! created. [`NodeManagerConfig::validate`] rejects inconsistent timings and
//! malformed backend parameters up front so that nothing fails on first use.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{Error, Result};

/// Default lease duration ("lock expiration").
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(20);

/// Default renewal interval ("renew period").
pub const DEFAULT_RENEW_PERIOD: Duration = Duration::from_secs(2);

/// Default lock identifier shared by a live/backup pair.
pub const DEFAULT_LOCK_ID: &str = "live";

/// Default number of consecutive unreachable-backend renewals tolerated.
pub const DEFAULT_MAX_RENEWAL_FAILURES: u32 = 5;

/// Default lock table name for the SQL backend.
pub const DEFAULT_SQL_TABLE: &str = "node_manager_store";

/// Which lock backend a node manager uses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// In-process lock. Only safe when both roles share one OS process.
    #[default]
    InProcess,
    /// Lock row in a shared SQL database.
    Sql(SqlLockConfig),
}

impl BackendConfig {
    /// Returns a short label for logs and metrics.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::InProcess => "in_process",
            Self::Sql(_) => "sql",
        }
    }
}

/// Connection parameters for the SQL lock backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlLockConfig {
    /// Connection URL, e.g. `sqlite:///var/lib/tandem/lock.db`.
    pub url: String,

    /// Table holding the lock rows.
    #[serde(default = "default_sql_table")]
    pub table_name: String,

    /// Maximum pooled connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How long a statement waits on a locked database before failing.
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout: Duration,

    /// How long to wait for a pooled connection before reporting the store unavailable.
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout: Duration,
}

fn default_sql_table() -> String {
    DEFAULT_SQL_TABLE.to_string()
}

const fn default_max_connections() -> u32 {
    2
}

const fn default_busy_timeout() -> Duration {
    Duration::from_secs(1)
}

const fn default_acquire_timeout() -> Duration {
    Duration::from_secs(2)
}

impl SqlLockConfig {
    /// Creates a SQL lock config for the given URL with default pool settings.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            table_name: default_sql_table(),
            max_connections: default_max_connections(),
            busy_timeout: default_busy_timeout(),
            acquire_timeout: default_acquire_timeout(),
        }
    }

    /// Overrides the lock table name.
    #[must_use]
    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = table_name.into();
        self
    }

    /// Validates the connection parameters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for an unsupported or empty URL, a
    /// table name that is not a plain SQL identifier, or an empty pool.
    pub fn validate(&self) -> Result<()> {
        let url = self.url.trim();
        let Some(path) = url
            .strip_prefix("sqlite://")
            .or_else(|| url.strip_prefix("sqlite:"))
        else {
            return Err(Error::configuration(format!(
                "unsupported lock store url '{url}': expected a sqlite: url"
            )));
        };
        if path.trim().is_empty() {
            return Err(Error::configuration("lock store url has no database path"));
        }
        if !is_sql_identifier(&self.table_name) {
            return Err(Error::configuration(format!(
                "lock table name '{}' must match [A-Za-z_][A-Za-z0-9_]*",
                self.table_name
            )));
        }
        if self.max_connections == 0 {
            return Err(Error::configuration("max_connections must be at least 1"));
        }
        if self.busy_timeout.is_zero() || self.acquire_timeout.is_zero() {
            return Err(Error::configuration("sql timeouts must be non-zero"));
        }
        Ok(())
    }
}

fn is_sql_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Configuration for a node manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeManagerConfig {
    /// Identity of the broker node, used in logs and events.
    pub node_id: String,

    /// Identifier of the lock contended by the live/backup pair.
    pub lock_id: String,

    /// How long an acquired or renewed lease stays valid.
    pub lease_duration: Duration,

    /// How often the holder renews its lease.
    pub renew_period: Duration,

    /// How long before expiry a renewal must have succeeded.
    ///
    /// Defaults to a quarter of the lease duration. Ownership is assumed for
    /// `lease_duration - deadline_margin` after the last successful renewal
    /// was sent, so a holder rides out `N` consecutive failed renewals only
    /// if `renew_period * N < lease_duration - deadline_margin`. With a 2s
    /// lease and a 500ms period that is two misses; the third lands on the
    /// deadline and the lease is treated as lost.
    #[serde(default)]
    pub deadline_margin: Option<Duration>,

    /// Bound on `start_live_node`. `None` waits until stopped.
    #[serde(default)]
    pub acquisition_timeout: Option<Duration>,

    /// How often a backup polls the lock. Defaults to the renew period.
    #[serde(default)]
    pub backup_poll_interval: Option<Duration>,

    /// Consecutive unreachable-backend renewals tolerated before the lease is
    /// treated as lost.
    pub max_renewal_failures: u32,

    /// Lock backend selection.
    #[serde(default)]
    pub backend: BackendConfig,
}

impl Default for NodeManagerConfig {
    fn default() -> Self {
        Self {
            node_id: Ulid::new().to_string(),
            lock_id: DEFAULT_LOCK_ID.to_string(),
            lease_duration: DEFAULT_LEASE_DURATION,
            renew_period: DEFAULT_RENEW_PERIOD,
            deadline_margin: None,
            acquisition_timeout: None,
            backup_poll_interval: None,
            max_renewal_failures: DEFAULT_MAX_RENEWAL_FAILURES,
            backend: BackendConfig::InProcess,
        }
    }
}

impl NodeManagerConfig {
    /// Sets the node identity.
    #[must_use]
    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    /// Sets the lock identifier.
    #[must_use]
    pub fn with_lock_id(mut self, lock_id: impl Into<String>) -> Self {
        self.lock_id = lock_id.into();
        self
    }

    /// Sets the lease duration.
    #[must_use]
    pub const fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    /// Sets the renew period.
    #[must_use]
    pub const fn with_renew_period(mut self, renew_period: Duration) -> Self {
        self.renew_period = renew_period;
        self
    }

    /// Sets the deadline margin.
    #[must_use]
    pub const fn with_deadline_margin(mut self, margin: Duration) -> Self {
        self.deadline_margin = Some(margin);
        self
    }

    /// Bounds `start_live_node`.
    #[must_use]
    pub const fn with_acquisition_timeout(mut self, timeout: Duration) -> Self {
        self.acquisition_timeout = Some(timeout);
        self
    }

    /// Sets the backup polling interval.
    #[must_use]
    pub const fn with_backup_poll_interval(mut self, interval: Duration) -> Self {
        self.backup_poll_interval = Some(interval);
        self
    }

    /// Sets the tolerated number of consecutive unreachable-backend renewals.
    #[must_use]
    pub const fn with_max_renewal_failures(mut self, failures: u32) -> Self {
        self.max_renewal_failures = failures;
        self
    }

    /// Selects the lock backend.
    #[must_use]
    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backend = backend;
        self
    }

    /// Returns the deadline margin, applying the default when unset.
    ///
    /// The `deadline_margin` field documents how this bounds the number of
    /// renewal misses a holder survives.
    #[must_use]
    pub fn deadline_margin(&self) -> Duration {
        self.deadline_margin.unwrap_or(self.lease_duration / 4)
    }

    /// Returns the backup polling interval, applying the default when unset.
    #[must_use]
    pub fn backup_poll_interval(&self) -> Duration {
        self.backup_poll_interval.unwrap_or(self.renew_period)
    }

    /// Returns how long a lease may safely be relied on after a renewal
    /// request was sent.
    #[must_use]
    pub fn safe_lease_window(&self) -> Duration {
        self.lease_duration.saturating_sub(self.deadline_margin())
    }

    /// Returns true if the renew period does not tolerate one missed tick.
    #[must_use]
    pub fn renew_period_exceeds_recommendation(&self) -> bool {
        self.renew_period >= self.lease_duration / 2
    }

    /// Validates timings and backend parameters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if any duration is zero, if the renew
    /// period is not smaller than the lease duration minus the deadline
    /// margin, or if the backend parameters are malformed.
    pub fn validate(&self) -> Result<()> {
        if self.lock_id.trim().is_empty() {
            return Err(Error::configuration("lock_id must not be empty"));
        }
        if self.node_id.trim().is_empty() {
            return Err(Error::configuration("node_id must not be empty"));
        }
        if self.lease_duration.is_zero() || self.renew_period.is_zero() {
            return Err(Error::configuration(
                "lease_duration and renew_period must be non-zero",
            ));
        }
        if self.renew_period >= self.lease_duration {
            return Err(Error::configuration(format!(
                "renew_period ({:?}) must be smaller than lease_duration ({:?})",
                self.renew_period, self.lease_duration
            )));
        }
        let margin = self.deadline_margin();
        if margin.is_zero() || margin >= self.lease_duration {
            return Err(Error::configuration(format!(
                "deadline_margin ({margin:?}) must be non-zero and smaller than lease_duration ({:?})",
                self.lease_duration
            )));
        }
        if self.renew_period >= self.safe_lease_window() {
            return Err(Error::configuration(format!(
                "renew_period ({:?}) must be smaller than lease_duration - deadline_margin ({:?})",
                self.renew_period,
                self.safe_lease_window()
            )));
        }
        if self.backup_poll_interval().is_zero() {
            return Err(Error::configuration("backup_poll_interval must be non-zero"));
        }
        if self.acquisition_timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::configuration("acquisition_timeout must be non-zero"));
        }
        if let BackendConfig::Sql(sql) = &self.backend {
            sql.validate()?;
        }
        if self.renew_period_exceeds_recommendation() {
            tracing::warn!(
                renew_period = ?self.renew_period,
                lease_duration = ?self.lease_duration,
                "renew_period is at least half the lease duration; a single missed renewal may lose the lease"
            );
        }
        Ok(())
    }

    /// Loads configuration from environment variables.
    ///
    /// Supported env vars:
    /// - `TANDEM_NODE_ID`, `TANDEM_LOCK_ID`
    /// - `TANDEM_LOCK_EXPIRATION_MS`, `TANDEM_LOCK_RENEW_PERIOD_MS`
    /// - `TANDEM_LOCK_DEADLINE_MARGIN_MS`
    /// - `TANDEM_LOCK_ACQUISITION_TIMEOUT_MS` (`-1` waits forever)
    /// - `TANDEM_BACKUP_POLL_INTERVAL_MS`, `TANDEM_MAX_RENEWAL_FAILURES`
    /// - `TANDEM_NODE_MANAGER` (`in_process` or `sql`)
    /// - `TANDEM_SQL_URL`, `TANDEM_SQL_TABLE`, `TANDEM_SQL_MAX_CONNECTIONS`,
    ///   `TANDEM_SQL_BUSY_TIMEOUT_MS`
    ///
    /// The result is validated before it is returned.
    ///
    /// # Errors
    ///
    /// Returns an error if any environment variable is present but cannot be
    /// parsed, or if the resulting configuration is invalid.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// See [`NodeManagerConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(&lookup);
        let mut config = Self::default();

        if let Some(node_id) = vars.string("TANDEM_NODE_ID") {
            config.node_id = node_id;
        }
        if let Some(lock_id) = vars.string("TANDEM_LOCK_ID") {
            config.lock_id = lock_id;
        }
        if let Some(lease) = vars.millis("TANDEM_LOCK_EXPIRATION_MS")? {
            config.lease_duration = lease;
        }
        if let Some(period) = vars.millis("TANDEM_LOCK_RENEW_PERIOD_MS")? {
            config.renew_period = period;
        }
        if let Some(margin) = vars.millis("TANDEM_LOCK_DEADLINE_MARGIN_MS")? {
            config.deadline_margin = Some(margin);
        }
        config.acquisition_timeout = vars.optional_millis("TANDEM_LOCK_ACQUISITION_TIMEOUT_MS")?;
        if let Some(interval) = vars.millis("TANDEM_BACKUP_POLL_INTERVAL_MS")? {
            config.backup_poll_interval = Some(interval);
        }
        if let Some(failures) = vars.u32("TANDEM_MAX_RENEWAL_FAILURES")? {
            config.max_renewal_failures = failures;
        }

        let kind = vars
            .string("TANDEM_NODE_MANAGER")
            .unwrap_or_else(|| "in_process".to_string());
        config.backend = match kind.to_ascii_lowercase().as_str() {
            "in_process" | "inprocess" | "in_vm" => BackendConfig::InProcess,
            "sql" | "jdbc" => {
                let url = vars.string("TANDEM_SQL_URL").ok_or_else(|| {
                    Error::configuration("TANDEM_SQL_URL is required when TANDEM_NODE_MANAGER=sql")
                })?;
                let mut sql = SqlLockConfig::new(url);
                if let Some(table) = vars.string("TANDEM_SQL_TABLE") {
                    sql.table_name = table;
                }
                if let Some(max) = vars.u32("TANDEM_SQL_MAX_CONNECTIONS")? {
                    sql.max_connections = max;
                }
                if let Some(busy) = vars.millis("TANDEM_SQL_BUSY_TIMEOUT_MS")? {
                    sql.busy_timeout = busy;
                }
                BackendConfig::Sql(sql)
            }
            other => {
                return Err(Error::configuration(format!(
                    "TANDEM_NODE_MANAGER must be one of: in_process, sql (got {other})"
                )));
            }
        };

        config.validate()?;
        Ok(config)
    }
}

struct Vars<'a, F>(&'a F);

impl<F> Vars<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.0)(name).and_then(|v| {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    fn u64(&self, name: &str) -> Result<Option<u64>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<u64>()
            .map(Some)
            .map_err(|e| Error::configuration(format!("{name} must be a u64: {e}")))
    }

    fn u32(&self, name: &str) -> Result<Option<u32>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<u32>()
            .map(Some)
            .map_err(|e| Error::configuration(format!("{name} must be a u32: {e}")))
    }

    fn millis(&self, name: &str) -> Result<Option<Duration>> {
        Ok(self.u64(name)?.map(Duration::from_millis))
    }

    /// Like `millis`, but a negative value means "no bound".
    fn optional_millis(&self, name: &str) -> Result<Option<Duration>> {
        match self.string(name) {
            Some(v) if v.starts_with('-') => Ok(None),
            _ => self.millis(name),
        }
    }
}
