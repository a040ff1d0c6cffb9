//! Database connection, schema management and table locks.
//!
//! This module provides SQLite connectivity with:
//! - Connection pool management
//! - WAL mode for file-backed databases
//! - Automatic migration of the framework's bookkeeping tables
//! - An in-process registry of advisory table locks shared by every clone
//!
//! Raw, tool and domain tables are not part of the migrations; they are
//! created on first use by the collector and the batch writers.
//!
//! # Example
//!
//! ```no_run
//! use devflow_core::Database;
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new(Path::new("devflow.db")).await?;
//! let exists = db.table_exists("_devlake_tasks").await?;
//! assert!(exists);
//! # Ok(())
//! # }
//! ```

pub mod query;
pub mod tx;

use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::instrument;

pub use query::SelectQuery;
pub use tx::{LockTable, TxHelper, with_transaction};

/// Default maximum number of connections in the pool.
/// Kept low for SQLite since it uses file-level locking.
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// SQLite busy timeout in milliseconds.
/// Connections will wait this long before returning SQLITE_BUSY.
const BUSY_TIMEOUT_MS: u32 = 5000;

/// Database-related errors.
#[derive(Error, Debug)]
pub enum DbError {
    /// Failed to connect to the database.
    #[error("failed to connect to database: {0}")]
    Connection(#[from] sqlx::Error),

    /// Failed to run migrations.
    #[error("failed to run migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Registry of advisory per-table locks.
#[derive(Debug, Default)]
pub(crate) struct TableLocks {
    locks: DashMap<String, Arc<RwLock<()>>>,
}

impl TableLocks {
    /// Returns the lock guarding `table`, creating it on first use.
    pub(crate) fn handle(&self, table: &str) -> Arc<RwLock<()>> {
        Arc::clone(self.locks.entry(table.to_string()).or_default().value())
    }
}

/// Database connection wrapper with connection pool.
///
/// Cloning is cheap: clones share the pool and the table-lock registry, so
/// a lock taken through one clone is visible to every other clone.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    locks: Arc<TableLocks>,
}

impl Database {
    /// Creates a new database connection to the specified path.
    ///
    /// This will:
    /// 1. Create the database file if it doesn't exist
    /// 2. Enable WAL mode and a busy timeout
    /// 3. Run any pending migrations
    ///
    /// # Errors
    ///
    /// Returns `DbError::Connection` if the connection fails,
    /// or `DbError::Migration` if migrations fail.
    #[instrument(skip(db_path), fields(path = %db_path.display()))]
    pub async fn new(db_path: &Path) -> Result<Self, DbError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&pool)
            .await?;

        sqlx::query(&format!("PRAGMA busy_timeout={BUSY_TIMEOUT_MS}"))
            .execute(&pool)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self::from_pool(pool))
    }

    /// Creates an in-memory database for testing.
    ///
    /// The pool is limited to a single connection because every SQLite
    /// in-memory connection would otherwise see its own empty database.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Connection` if the connection fails,
    /// or `DbError::Migration` if migrations fail.
    #[instrument]
    pub async fn new_in_memory() -> Result<Self, DbError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self::from_pool(pool))
    }

    fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            locks: Arc::new(TableLocks::default()),
        }
    }

    /// Returns a reference to the underlying connection pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub(crate) fn table_locks(&self) -> &Arc<TableLocks> {
        &self.locks
    }

    /// Checks whether a table exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog query fails.
    #[instrument(skip(self))]
    pub async fn table_exists(&self, table: &str) -> Result<bool, sqlx::Error> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
                .bind(table)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    /// Counts all rows of `table`.
    ///
    /// # Errors
    ///
    /// Returns an error if the table name is not a plain identifier or the
    /// query fails.
    pub async fn count_rows(&self, table: &str) -> Result<i64, crate::error::EtlError> {
        let table = quote_ident(table)?;
        let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Checks if WAL mode is enabled.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Connection` if the query fails.
    #[instrument(skip(self))]
    pub async fn is_wal_enabled(&self) -> Result<bool, DbError> {
        let result: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&self.pool)
            .await?;

        Ok(result.0.to_lowercase() == "wal")
    }

    /// Gracefully closes all connections in the pool.
    #[instrument(skip(self))]
    pub async fn close(self) {
        self.pool.close().await;
    }
}

/// Validates a table or column name and returns it double-quoted.
///
/// Names are interpolated into SQL, so only `[A-Za-z0-9_]` is accepted.
///
/// # Errors
///
/// Returns [`EtlError::BadInput`](crate::error::EtlError::BadInput) for empty
/// names or names with other characters.
pub fn quote_ident(name: &str) -> Result<String, crate::error::EtlError> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(crate::error::EtlError::bad_input(format!(
            "invalid SQL identifier '{name}'"
        )));
    }
    Ok(format!("\"{name}\""))
}
