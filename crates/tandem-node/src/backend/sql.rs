//! SQL lock backend.
//!
//! [`SqlLockBackend`] stores one row per lock in a table shared by both
//! replicas. Every ownership change is a single conditional statement
//! evaluated against the database clock, so two processes racing on an
//! expired lease cannot both be granted, whatever their local clocks say.
//!
//! ## Schema
//!
//! | Column | Type | Meaning |
//! |--------|------|---------|
//! | `lock_id` | `TEXT PRIMARY KEY` | lock identifier |
//! | `holder_id` | `TEXT NULL` | current holder, `NULL` when released |
//! | `expires_at_ms` | `INTEGER` | lease expiry, Unix millis (database clock) |
//! | `acquired_at_ms` | `INTEGER` | when the current holder acquired it |
//! | `version` | `INTEGER` | bumped on every acquisition; the fencing token |

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tandem_core::config::SqlLockConfig;
use tandem_core::error::{Error, Result};
use tandem_core::id::{FencingToken, HolderId};

use super::{AcquireOutcome, BackendCapabilities, LeaseGrant, LockBackend, RenewOutcome};

/// Current time in Unix millis, by the database clock.
const DB_NOW_MS: &str = "CAST((julianday('now') - 2440587.5) * 86400000.0 AS INTEGER)";

#[derive(Debug, sqlx::FromRow)]
struct GrantRow {
    expires_at_ms: i64,
    acquired_at_ms: i64,
    version: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct RenewRow {
    expires_at_ms: i64,
    version: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct StatusRow {
    holder_id: Option<String>,
    expires_at_ms: i64,
    now_ms: i64,
}

impl StatusRow {
    fn live_holder(self) -> Option<String> {
        if self.expires_at_ms > self.now_ms {
            self.holder_id
        } else {
            None
        }
    }
}

/// Statements rendered once for the configured table.
#[derive(Debug)]
struct Statements {
    create_table: String,
    acquire: String,
    renew: String,
    release: String,
    status: String,
}

impl Statements {
    fn for_table(table: &str) -> Self {
        Self {
            create_table: format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    lock_id TEXT PRIMARY KEY NOT NULL,
                    holder_id TEXT,
                    expires_at_ms INTEGER NOT NULL DEFAULT 0,
                    acquired_at_ms INTEGER NOT NULL DEFAULT 0,
                    version INTEGER NOT NULL DEFAULT 0
                )"
            ),
            acquire: format!(
                "INSERT INTO {table} (lock_id, holder_id, expires_at_ms, acquired_at_ms, version)
                 VALUES (?1, ?2, {DB_NOW_MS} + ?3, {DB_NOW_MS}, 1)
                 ON CONFLICT(lock_id) DO UPDATE SET
                    holder_id = excluded.holder_id,
                    expires_at_ms = excluded.expires_at_ms,
                    acquired_at_ms = CASE
                        WHEN {table}.holder_id = excluded.holder_id THEN {table}.acquired_at_ms
                        ELSE excluded.acquired_at_ms
                    END,
                    version = {table}.version + 1
                 WHERE {table}.holder_id IS NULL
                    OR {table}.holder_id = excluded.holder_id
                    OR {table}.expires_at_ms <= {DB_NOW_MS}
                 RETURNING expires_at_ms, acquired_at_ms, version"
            ),
            renew: format!(
                "UPDATE {table}
                 SET expires_at_ms = MAX(expires_at_ms, {DB_NOW_MS} + ?3)
                 WHERE lock_id = ?1 AND holder_id = ?2
                 RETURNING expires_at_ms, version"
            ),
            release: format!(
                "UPDATE {table} SET holder_id = NULL, expires_at_ms = 0
                 WHERE lock_id = ?1 AND holder_id = ?2"
            ),
            status: format!(
                "SELECT holder_id, expires_at_ms, {DB_NOW_MS} AS now_ms
                 FROM {table} WHERE lock_id = ?1"
            ),
        }
    }
}

/// Lock backend storing leases in a shared SQLite database.
///
/// ## Example
///
/// ```rust,no_run
/// use tandem_core::SqlLockConfig;
/// use tandem_node::backend::{LockBackend, SqlLockBackend};
///
/// # async fn run() -> tandem_core::Result<()> {
/// let config = SqlLockConfig::new("sqlite:///var/lib/tandem/lock.db");
/// let backend = SqlLockBackend::connect(&config).await?;
/// assert!(backend.capabilities().enforces_expiry);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct SqlLockBackend {
    pool: SqlitePool,
    table: String,
    statements: Statements,
}

impl SqlLockBackend {
    /// Creates a backend without opening any connection.
    ///
    /// Must be called from within a tokio runtime. Connectivity problems are
    /// reported by the first operation as [`Error::BackendUnavailable`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if `config` is malformed.
    pub fn connect_lazy(config: &SqlLockConfig) -> Result<Self> {
        config.validate()?;
        let options = SqliteConnectOptions::from_str(config.url.trim())
            .map_err(|e| Error::configuration(format!("invalid lock store url: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(config.busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect_lazy_with(options);

        Ok(Self {
            pool,
            table: config.table_name.clone(),
            statements: Statements::for_table(&config.table_name),
        })
    }

    /// Creates a backend and its lock table.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if `config` is malformed, or
    /// [`Error::BackendUnavailable`] if the database cannot be opened.
    pub async fn connect(config: &SqlLockConfig) -> Result<Self> {
        let backend = Self::connect_lazy(config)?;
        backend.prepare().await?;
        Ok(backend)
    }

    /// Returns the lock table name.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    async fn status(&self, lock_id: &str) -> Result<Option<StatusRow>> {
        sqlx::query_as::<_, StatusRow>(&self.statements.status)
            .bind(lock_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("status", e))
    }
}

#[async_trait]
impl LockBackend for SqlLockBackend {
    fn name(&self) -> &'static str {
        "sql"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            enforces_expiry: true,
            cross_process: true,
        }
    }

    async fn prepare(&self) -> Result<()> {
        sqlx::query(&self.statements.create_table)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("prepare", e))?;
        tracing::debug!(table = %self.table, "lock table ready");
        Ok(())
    }

    async fn try_acquire(
        &self,
        lock_id: &str,
        holder_id: &HolderId,
        lease: Duration,
    ) -> Result<AcquireOutcome> {
        let row = sqlx::query_as::<_, GrantRow>(&self.statements.acquire)
            .bind(lock_id)
            .bind(holder_id.as_str())
            .bind(lease_millis(lease)?)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("try_acquire", e))?;

        let Some(row) = row else {
            let current_holder = self.status(lock_id).await?.and_then(|s| s.holder_id);
            return Ok(AcquireOutcome::Contended { current_holder });
        };

        Ok(AcquireOutcome::Granted(LeaseGrant {
            holder_id: holder_id.clone(),
            acquired_at: timestamp(row.acquired_at_ms)?,
            expires_at: timestamp(row.expires_at_ms)?,
            fencing_token: fencing_token(row.version)?,
        }))
    }

    async fn renew(
        &self,
        lock_id: &str,
        holder_id: &HolderId,
        lease: Duration,
    ) -> Result<RenewOutcome> {
        let row = sqlx::query_as::<_, RenewRow>(&self.statements.renew)
            .bind(lock_id)
            .bind(holder_id.as_str())
            .bind(lease_millis(lease)?)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("renew", e))?;

        match row {
            Some(row) => Ok(RenewOutcome::Renewed {
                expires_at: timestamp(row.expires_at_ms)?,
                fencing_token: fencing_token(row.version)?,
            }),
            None => {
                let current_holder = self.status(lock_id).await?.and_then(|s| s.holder_id);
                Ok(RenewOutcome::Lost { current_holder })
            }
        }
    }

    async fn release(&self, lock_id: &str, holder_id: &HolderId) -> Result<bool> {
        let result = sqlx::query(&self.statements.release)
            .bind(lock_id)
            .bind(holder_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("release", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn is_locked(&self, lock_id: &str) -> Result<bool> {
        Ok(self.current_holder(lock_id).await?.is_some())
    }

    async fn current_holder(&self, lock_id: &str) -> Result<Option<String>> {
        Ok(self.status(lock_id).await?.and_then(StatusRow::live_holder))
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

fn lease_millis(lease: Duration) -> Result<i64> {
    i64::try_from(lease.as_millis())
        .map_err(|_| Error::configuration(format!("lease duration {lease:?} is out of range")))
}

fn timestamp(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| Error::internal(format!("lock row holds invalid timestamp {millis}")))
}

fn fencing_token(version: i64) -> Result<FencingToken> {
    u64::try_from(version)
        .map(FencingToken::from_sequence)
        .map_err(|_| Error::internal(format!("lock row holds negative version {version}")))
}

/// SQLite primary result codes that mean the store is unreachable or busy.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;
const SQLITE_IOERR: i32 = 10;
const SQLITE_CANTOPEN: i32 = 14;

/// Maps driver errors onto the lock error taxonomy.
fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> Error {
    let unavailable = match &err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .is_some_and(|code| {
                matches!(
                    code & 0xff,
                    SQLITE_BUSY | SQLITE_LOCKED | SQLITE_IOERR | SQLITE_CANTOPEN
                )
            }),
        _ => false,
    };

    if unavailable {
        tracing::warn!(operation, error = %err, "lock store unavailable");
        return Error::backend_unavailable_with_source(format!("{operation} failed"), err);
    }
    if let sqlx::Error::Configuration(source) = &err {
        return Error::configuration(format!("{operation}: {source}"));
    }
    Error::internal_with_source(format!("{operation} failed"), err)
}
