//! Scoped transactions with advisory table locks.
//!
//! [`TxHelper`] opens one transaction, optionally takes shared or exclusive
//! locks on a set of tables (with a timeout), and finalizes in
//! [`end`](TxHelper::end): locks are released first, then the transaction is
//! committed when the unit of work succeeded and rolled back otherwise.
//!
//! Locks live in the in-process registry shared by every clone of a
//! [`Database`]. They serialize converters that touch overlapping tables;
//! they are not SQL-level locks.
//!
//! [`with_transaction`] wraps the whole sequence and turns a panic inside the
//! unit of work into an error, so the transaction is rolled back either way.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use devflow_core::{Database, EtlError, LockTable, with_transaction};
//!
//! # async fn example(db: Database) -> Result<(), EtlError> {
//! let tables = [LockTable::exclusive("project_mapping")];
//! let inserted = with_transaction(&db, Duration::from_secs(2), &tables, |conn| {
//!     Box::pin(async move {
//!         let done = sqlx::query("DELETE FROM project_mapping WHERE project_name = ?")
//!             .bind("demo")
//!             .execute(&mut *conn)
//!             .await?;
//!         Ok(done.rows_affected())
//!     })
//! })
//! .await?;
//! # let _ = inserted;
//! # Ok(())
//! # }
//! ```

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use sqlx::{Sqlite, SqliteConnection, Transaction};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock, oneshot};
use tracing::{debug, instrument, warn};

use super::{Database, TableLocks};
use crate::error::EtlError;

/// A table to lock and the lock mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockTable {
    /// Table name.
    pub table: String,
    /// Exclusive (write) lock when true, shared (read) lock otherwise.
    pub exclusive: bool,
}

impl LockTable {
    /// An exclusive lock on `table`.
    #[must_use]
    pub fn exclusive(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            exclusive: true,
        }
    }

    /// A shared lock on `table`.
    #[must_use]
    pub fn shared(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            exclusive: false,
        }
    }
}

enum TableGuard {
    Shared(#[allow(dead_code)] OwnedRwLockReadGuard<()>),
    Exclusive(#[allow(dead_code)] OwnedRwLockWriteGuard<()>),
}

/// One transaction plus the table locks taken for it.
///
/// Dropping a helper without calling [`end`](Self::end) releases the locks
/// and rolls the transaction back.
pub struct TxHelper {
    db: Database,
    tx: Option<Transaction<'static, Sqlite>>,
    guards: Vec<TableGuard>,
}

impl TxHelper {
    /// Creates a helper bound to `db`; no transaction is open yet.
    #[must_use]
    pub fn new(db: &Database) -> Self {
        Self {
            db: db.clone(),
            tx: None,
            guards: Vec::new(),
        }
    }

    /// Opens the transaction.
    ///
    /// # Errors
    ///
    /// Returns [`EtlError::Default`] if a transaction is already open, or a
    /// database error if it cannot be started.
    pub async fn begin(&mut self) -> Result<(), EtlError> {
        if self.tx.is_some() {
            return Err(EtlError::other("transaction already begun"));
        }
        self.tx = Some(self.db.pool().begin().await?);
        Ok(())
    }

    /// Whether a transaction is open.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.tx.is_some()
    }

    /// The connection of the open transaction.
    ///
    /// # Errors
    ///
    /// Returns [`EtlError::Default`] if [`begin`](Self::begin) was not called.
    pub fn connection(&mut self) -> Result<&mut SqliteConnection, EtlError> {
        self.tx
            .as_deref_mut()
            .ok_or_else(|| EtlError::other("transaction not begun"))
    }

    /// Locks `tables`, waiting at most `timeout`.
    ///
    /// Tables are locked in name order; a table listed twice is locked once,
    /// exclusively if any entry asks for it. The attempt runs on its own task.
    /// On timeout that task is abandoned rather than cancelled: it keeps
    /// waiting and releases whatever it obtains as soon as it completes.
    ///
    /// # Errors
    ///
    /// Returns [`EtlError::Timeout`] if the locks are not obtained in time.
    #[instrument(skip(self, tables), fields(tables = ?tables.iter().map(|t| &t.table).collect::<Vec<_>>()))]
    pub async fn lock_tables_timeout(
        &mut self,
        timeout: Duration,
        tables: &[LockTable],
    ) -> Result<(), EtlError> {
        let handles = lock_plan(self.db.table_locks(), tables);
        let (sender, receiver) = oneshot::channel();

        tokio::spawn(async move {
            let mut guards = Vec::with_capacity(handles.len());
            for (lock, exclusive) in handles {
                guards.push(if exclusive {
                    TableGuard::Exclusive(lock.write_owned().await)
                } else {
                    TableGuard::Shared(lock.read_owned().await)
                });
            }
            // Receiver gone means the caller timed out; dropping the guards unlocks.
            let _ = sender.send(guards);
        });

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(guards)) => {
                debug!(count = guards.len(), "tables locked");
                self.guards.extend(guards);
                Ok(())
            }
            Ok(Err(_)) => Err(EtlError::other("table lock task ended unexpectedly")),
            Err(_) => Err(EtlError::timeout(format!(
                "locking tables {:?} timed out after {}ms",
                tables.iter().map(|t| t.table.as_str()).collect::<Vec<_>>(),
                timeout.as_millis()
            ))),
        }
    }

    /// Releases every lock held by this helper.
    pub fn unlock_tables(&mut self) {
        self.guards.clear();
    }

    /// Finalizes: unlocks, then commits when `outcome` is `Ok`, rolls back otherwise.
    ///
    /// A rollback failure is logged and swallowed so it does not mask the
    /// error that caused the rollback.
    ///
    /// # Errors
    ///
    /// Returns the commit error when committing fails.
    pub async fn end<T>(mut self, outcome: &Result<T, EtlError>) -> Result<(), EtlError> {
        self.unlock_tables();
        let Some(tx) = self.tx.take() else {
            return Ok(());
        };
        match outcome {
            Ok(_) => {
                tx.commit().await?;
                debug!("transaction committed");
            }
            Err(error) => {
                if let Err(rollback_error) = tx.rollback().await {
                    warn!(%rollback_error, cause = %error, "transaction rollback failed");
                } else {
                    debug!(cause = %error, "transaction rolled back");
                }
            }
        }
        Ok(())
    }
}

fn lock_plan(registry: &Arc<TableLocks>, tables: &[LockTable]) -> Vec<(Arc<RwLock<()>>, bool)> {
    let mut modes: BTreeMap<&str, bool> = BTreeMap::new();
    for table in tables {
        let exclusive = modes.entry(table.table.as_str()).or_insert(false);
        *exclusive |= table.exclusive;
    }
    modes
        .into_iter()
        .map(|(table, exclusive)| (registry.handle(table), exclusive))
        .collect()
}

/// Runs `work` inside a transaction holding `tables`.
///
/// `work` receives the transaction's connection. The transaction commits when
/// `work` returns `Ok`, and rolls back when it returns `Err` or panics; a
/// panic is reported as [`EtlError::Default`].
///
/// # Errors
///
/// Returns the lock timeout, the error from `work`, or a commit failure.
pub async fn with_transaction<T, F>(
    db: &Database,
    lock_timeout: Duration,
    tables: &[LockTable],
    work: F,
) -> Result<T, EtlError>
where
    F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T, EtlError>>,
{
    let mut helper = TxHelper::new(db);
    helper.begin().await?;

    if !tables.is_empty() {
        if let Err(error) = helper.lock_tables_timeout(lock_timeout, tables).await {
            let failed: Result<T, EtlError> = Err(error);
            helper.end(&failed).await?;
            return failed;
        }
    }

    let result = {
        let conn = helper.connection()?;
        match std::panic::catch_unwind(AssertUnwindSafe(|| work(conn))) {
            Ok(future) => match AssertUnwindSafe(future).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(panic_error(panic.as_ref())),
            },
            Err(panic) => Err(panic_error(panic.as_ref())),
        }
    };

    helper.end(&result).await?;
    result
}

fn panic_error(panic: &(dyn Any + Send)) -> EtlError {
    EtlError::other(format!("unit of work panicked: {}", panic_message(panic)))
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
