//! Unified database connection pool supporting SQLite and PostgreSQL.
//!
//! This module provides a backend-agnostic interface for database connections.
//! The actual backend is determined at runtime based on the database URL.
//!
//! It also owns the advisory-lock discipline used for sequence allocation,
//! job claiming and group allocation. On PostgreSQL the lock is a
//! transaction-scoped `pg_advisory_xact_lock`. SQLite has no advisory locks,
//! so a locked transaction starts by writing to `advisory_locks`, which takes
//! the database-wide write lock until commit.

use std::path::Path;

use diesel::sql_types::{BigInt, Text};
use diesel::sqlite::SqliteConnection;
use diesel_async::sync_connection_wrapper::SyncConnectionWrapper;
use diesel_async::{AsyncConnection, RunQueryDsl, SimpleAsyncConnection};

#[cfg(feature = "postgres")]
use diesel_async::pooled_connection::deadpool::Pool as DeadPool;
#[cfg(feature = "postgres")]
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
#[cfg(feature = "postgres")]
use diesel_async::AsyncPgConnection;

use super::util::to_diesel_error;

/// Diesel error type alias.
pub type DbError = diesel::result::Error;

/// Async SQLite connection type.
pub type SqliteConn = SyncConnectionWrapper<SqliteConnection>;

/// Async PostgreSQL connection type.
#[cfg(feature = "postgres")]
pub type PgConn = deadpool::managed::Object<AsyncDieselConnectionManager<AsyncPgConnection>>;

/// How long a SQLite connection waits on a competing writer before failing.
const SQLITE_BUSY_TIMEOUT_MS: u32 = 30_000;

/// Named advisory locks. Each key serializes one read-then-write pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKey {
    /// Reading the highest sequence number and inserting the next ones.
    SequenceAllocation,
    /// Selecting eligible work items and marking them in flight.
    JobClaim,
    /// Allocating page groups.
    Grouping,
}

impl LockKey {
    pub const fn id(self) -> i64 {
        match self {
            LockKey::SequenceAllocation => 12345,
            LockKey::JobClaim => 23456,
            LockKey::Grouping => 88888,
        }
    }
}

/// SQLite connection pool (lightweight - creates connections on demand).
#[derive(Clone)]
pub struct SqlitePool {
    database_url: String,
}

impl SqlitePool {
    /// Create a new SQLite pool.
    pub fn new(database_url: &str) -> Self {
        // Strip sqlite: prefix if present
        let url = database_url.strip_prefix("sqlite:").unwrap_or(database_url);
        Self {
            database_url: url.to_string(),
        }
    }

    /// Create pool from a file path.
    pub fn from_path(path: &Path) -> Self {
        Self::new(&path.display().to_string())
    }

    /// Get a connection.
    pub async fn get(&self) -> Result<SqliteConn, DbError> {
        let mut conn = SqliteConn::establish(&self.database_url)
            .await
            .map_err(to_diesel_error)?;
        conn.batch_execute(&format!(
            "PRAGMA busy_timeout = {SQLITE_BUSY_TIMEOUT_MS}; PRAGMA foreign_keys = ON;"
        ))
        .await?;
        Ok(conn)
    }

    /// Get the database URL.
    pub fn database_url(&self) -> &str {
        &self.database_url
    }
}

/// PostgreSQL connection pool.
#[cfg(feature = "postgres")]
#[derive(Clone)]
pub struct PgPool {
    pool: DeadPool<AsyncPgConnection>,
}

#[cfg(feature = "postgres")]
impl PgPool {
    /// Create a new PostgreSQL pool.
    pub fn new(database_url: &str, max_size: usize) -> Result<Self, DbError> {
        let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
        let pool = DeadPool::builder(config)
            .max_size(max_size)
            .build()
            .map_err(to_diesel_error)?;
        Ok(Self { pool })
    }

    /// Get a connection.
    pub async fn get(&self) -> Result<PgConn, DbError> {
        self.pool.get().await.map_err(to_diesel_error)
    }
}

/// Unified database pool that supports both SQLite and PostgreSQL.
#[derive(Clone)]
pub enum DbPool {
    Sqlite(SqlitePool),
    #[cfg(feature = "postgres")]
    Postgres(PgPool),
}

impl DbPool {
    /// Create a pool from a database URL.
    ///
    /// Detects the backend from the URL:
    /// - `postgres://` or `postgresql://` → PostgreSQL
    /// - Everything else → SQLite
    pub fn from_url(url: &str) -> Result<Self, DbError> {
        #[cfg(feature = "postgres")]
        if super::util::is_postgres_url(url) {
            return Ok(DbPool::Postgres(PgPool::new(url, 16)?));
        }

        Ok(DbPool::Sqlite(SqlitePool::new(url)))
    }

    /// Create a SQLite pool from a file path.
    pub fn sqlite_from_path(path: &Path) -> Self {
        DbPool::Sqlite(SqlitePool::from_path(path))
    }

    /// Check if this is a SQLite backend.
    pub fn is_sqlite(&self) -> bool {
        matches!(self, DbPool::Sqlite(_))
    }

    /// Check if this is a PostgreSQL backend.
    #[cfg(feature = "postgres")]
    pub fn is_postgres(&self) -> bool {
        matches!(self, DbPool::Postgres(_))
    }
}

/// Take `key` as the first statement of the current SQLite transaction.
pub async fn acquire_sqlite_lock(conn: &mut SqliteConn, key: LockKey) -> Result<(), DbError> {
    diesel::sql_query(
        "INSERT INTO advisory_locks (lock_key, acquired_at) VALUES (?, ?) \
         ON CONFLICT(lock_key) DO UPDATE SET acquired_at = excluded.acquired_at",
    )
    .bind::<BigInt, _>(key.id())
    .bind::<Text, _>(super::now_timestamp())
    .execute(conn)
    .await?;
    Ok(())
}

/// Take `key` for the rest of the current PostgreSQL transaction.
#[cfg(feature = "postgres")]
pub async fn acquire_pg_lock(conn: &mut PgConn, key: LockKey) -> Result<(), DbError> {
    diesel::sql_query("SELECT pg_advisory_xact_lock($1)")
        .bind::<BigInt, _>(key.id())
        .execute(conn)
        .await?;
    Ok(())
}

/// Macro for running database operations on either backend.
///
/// This macro handles the connection dispatch, allowing the same Diesel DSL
/// code to run on both SQLite and PostgreSQL.
///
/// # Example
/// ```ignore
/// with_conn!(self.pool, conn => {
///     work_items::table.load::<WorkItemRecord>(&mut conn).await
/// })
/// ```
#[macro_export]
macro_rules! with_conn {
    ($pool:expr, $conn:ident => $body:expr) => {{
        match &$pool {
            $crate::repository::pool::DbPool::Sqlite(pool) => {
                let mut $conn = pool.get().await?;
                $body
            }
            #[cfg(feature = "postgres")]
            $crate::repository::pool::DbPool::Postgres(pool) => {
                let mut $conn = pool.get().await?;
                $body
            }
        }
    }};
}

/// Macro for running database operations that need different SQL per backend.
///
/// Use this when the SQL syntax differs between SQLite and PostgreSQL.
#[macro_export]
macro_rules! with_conn_split {
    ($pool:expr, sqlite: $sqlite_conn:ident => $sqlite_body:expr, postgres: $pg_conn:ident => $pg_body:expr) => {{
        match &$pool {
            $crate::repository::pool::DbPool::Sqlite(pool) => {
                let mut $sqlite_conn = pool.get().await?;
                $sqlite_body
            }
            #[cfg(feature = "postgres")]
            $crate::repository::pool::DbPool::Postgres(pool) => {
                let mut $pg_conn = pool.get().await?;
                $pg_body
            }
        }
    }};
}

/// Run `$body` inside a transaction that holds the advisory lock `$key`.
///
/// `$conn` is bound to `&mut` connection inside the body, which must evaluate
/// to `Result<_, DbError>`. The lock is released when the transaction ends.
///
/// # Example
/// ```ignore
/// with_advisory_lock!(self.pool, LockKey::JobClaim, conn => {
///     let rows = work_items::table.load::<WorkItemRecord>(conn).await?;
///     Ok(rows)
/// })
/// ```
#[macro_export]
macro_rules! with_advisory_lock {
    ($pool:expr, $key:expr, $conn:ident => $body:expr) => {{
        let lock_key: $crate::repository::pool::LockKey = $key;
        match &$pool {
            $crate::repository::pool::DbPool::Sqlite(pool) => {
                let mut conn = pool.get().await?;
                diesel_async::AsyncConnection::transaction::<
                    _,
                    $crate::repository::pool::DbError,
                    _,
                >(&mut conn, |$conn| {
                    Box::pin(async move {
                        $crate::repository::pool::acquire_sqlite_lock($conn, lock_key).await?;
                        $body
                    })
                })
                .await
            }
            #[cfg(feature = "postgres")]
            $crate::repository::pool::DbPool::Postgres(pool) => {
                let mut conn = pool.get().await?;
                diesel_async::AsyncConnection::transaction::<
                    _,
                    $crate::repository::pool::DbError,
                    _,
                >(&mut conn, |$conn| {
                    Box::pin(async move {
                        $crate::repository::pool::acquire_pg_lock($conn, lock_key).await?;
                        $body
                    })
                })
                .await
            }
        }
    }};
}

#[allow(unused_imports)]
pub use with_advisory_lock;
#[allow(unused_imports)]
pub use with_conn;
#[allow(unused_imports)]
pub use with_conn_split;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_detection() {
        // SQLite paths
        assert!(DbPool::from_url("/path/to/db.sqlite").unwrap().is_sqlite());
        assert!(DbPool::from_url("sqlite:/path/to/db").unwrap().is_sqlite());

        // PostgreSQL URLs (only with feature)
        #[cfg(feature = "postgres")]
        {
            assert!(DbPool::from_url("postgres://localhost/test")
                .unwrap()
                .is_postgres());
        }
    }

    #[test]
    fn test_sqlite_prefix_is_stripped() {
        let pool = SqlitePool::new("sqlite:/tmp/pages.db");
        assert_eq!(pool.database_url(), "/tmp/pages.db");
    }

    #[test]
    fn test_lock_keys_are_distinct() {
        let keys = [
            LockKey::SequenceAllocation.id(),
            LockKey::JobClaim.id(),
            LockKey::Grouping.id(),
        ];
        assert_eq!(keys, [12345, 23456, 88888]);
    }
}
