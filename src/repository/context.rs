//! Database context for managing connections and repository access.
//!
//! The DbContext is the primary entry point for all database operations.
//! It holds the connection pool and provides access to all repositories.

use std::path::{Path, PathBuf};

use diesel_async::SimpleAsyncConnection;

use super::groups::GroupRepository;
use super::pool::{DbError, DbPool};
use super::work_items::WorkItemRepository;
use crate::storage::PageStore;

/// Database context that manages the connection pool and provides repository access.
///
/// # Example
/// ```ignore
/// let ctx = DbContext::from_url("postgres://localhost/pagebind", pages_dir)?;
/// let counts = ctx.work_items().counts().await?;
/// ```
#[derive(Clone)]
pub struct DbContext {
    pool: DbPool,
    pages_dir: PathBuf,
}

impl DbContext {
    /// Create a context from a database file path (SQLite only).
    pub fn new(db_path: &Path, pages_dir: &Path) -> Self {
        Self {
            pool: DbPool::sqlite_from_path(db_path),
            pages_dir: pages_dir.to_path_buf(),
        }
    }

    /// Create a context from a database URL.
    ///
    /// Supports:
    /// - SQLite: file paths or `sqlite:` URLs
    /// - PostgreSQL: `postgres://` or `postgresql://` URLs
    pub fn from_url(url: &str, pages_dir: &Path) -> Result<Self, DbError> {
        Ok(Self {
            pool: DbPool::from_url(url)?,
            pages_dir: pages_dir.to_path_buf(),
        })
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Page image store rooted at the configured pages directory.
    pub fn page_store(&self) -> PageStore {
        PageStore::new(&self.pages_dir)
    }

    /// Get a work item repository.
    pub fn work_items(&self) -> WorkItemRepository {
        WorkItemRepository::new(self.pool.clone(), self.page_store())
    }

    /// Get a group repository.
    pub fn groups(&self) -> GroupRepository {
        GroupRepository::new(self.pool.clone())
    }

    /// Initialize database schema.
    pub async fn init_schema(&self) -> Result<(), DbError> {
        crate::with_conn_split!(self.pool,
            sqlite: conn => {
                init_sqlite_schema(&mut conn).await
            },
            postgres: conn => {
                init_postgres_schema(&mut conn).await
            }
        )
    }
}

/// Initialize SQLite schema.
async fn init_sqlite_schema(conn: &mut super::pool::SqliteConn) -> Result<(), DbError> {
    conn.batch_execute(include_str!("schema_sqlite.sql")).await
}

/// Initialize PostgreSQL schema.
#[cfg(feature = "postgres")]
async fn init_postgres_schema(conn: &mut super::pool::PgConn) -> Result<(), DbError> {
    use diesel_async::RunQueryDsl;

    // PostgreSQL needs statements executed separately
    let statements = include_str!("schema_postgres.sql");
    for stmt in statements.split(';') {
        let stmt = stmt.trim();
        if !stmt.is_empty() && !stmt.starts_with("--") {
            diesel::sql_query(stmt).execute(conn).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tempfile::{tempdir, TempDir};

    /// Fresh SQLite database and page store in a temporary directory.
    pub(crate) async fn setup_test_db() -> (DbContext, TempDir) {
        let dir = tempdir().unwrap();
        let ctx = DbContext::new(&dir.path().join("test.db"), &dir.path().join("pages"));
        ctx.init_schema().await.unwrap();
        (ctx, dir)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::setup_test_db;

    #[tokio::test]
    async fn test_init_schema_is_idempotent() {
        let (ctx, _dir) = setup_test_db().await;
        ctx.init_schema().await.unwrap();

        let counts = ctx.work_items().counts().await.unwrap();
        assert_eq!(counts.total, 0);
        assert!(ctx.pool().is_sqlite());
    }
}
