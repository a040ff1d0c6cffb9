//! Batched upserts of tool-layer and domain-layer records.
//!
//! [`BatchSave`] buffers rows for one table and writes them with multi-row
//! `INSERT OR REPLACE` statements, so re-running an extractor or converter
//! over unchanged input overwrites rows by primary key instead of
//! duplicating them. The destination table is created on first use from the
//! record's [`Column`] layout, plus the provenance columns.
//!
//! [`BatchSaveDivider`] routes heterogeneous records (fan-out) to one
//! `BatchSave` per table. In full (non-incremental) mode it first deletes
//! the rows a previous run derived from the same raw table and params.

use std::collections::BTreeMap;

use sqlx::{QueryBuilder, Sqlite};
use tracing::{debug, instrument};

use crate::db::{Database, quote_ident};
use crate::error::EtlError;
use crate::models::{Column, RawDataOrigin, Record, SqlValue};

/// SQLite's default limit on bound variables per statement is 32766.
const MAX_BIND_VARIABLES: usize = 32_000;

/// Buffered writer for one table.
#[derive(Debug)]
pub struct BatchSave {
    db: Database,
    table: &'static str,
    quoted: String,
    columns: &'static [Column],
    batch_size: usize,
    buffer: Vec<Vec<SqlValue>>,
    table_ready: bool,
    written: u64,
}

impl BatchSave {
    /// Creates a writer for `table` with the given column layout.
    ///
    /// # Errors
    ///
    /// Returns [`EtlError::BadInput`] for invalid identifiers or types, or a
    /// layout without columns.
    pub fn new(
        db: &Database,
        table: &'static str,
        columns: &'static [Column],
        batch_size: usize,
    ) -> Result<Self, EtlError> {
        if columns.is_empty() {
            return Err(EtlError::bad_input(format!("table {table} declares no columns")));
        }
        for column in columns {
            quote_ident(column.name)?;
            if !column
                .sql_type
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == ' ')
            {
                return Err(EtlError::bad_input(format!(
                    "invalid SQL type '{}' for {table}.{}",
                    column.sql_type, column.name
                )));
            }
        }
        Ok(Self {
            db: db.clone(),
            table,
            quoted: quote_ident(table)?,
            columns,
            batch_size: batch_size.max(1),
            buffer: Vec::new(),
            table_ready: false,
            written: 0,
        })
    }

    #[must_use]
    pub fn table(&self) -> &'static str {
        self.table
    }

    /// Rows written so far.
    #[must_use]
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Creates the destination table and its provenance index if missing.
    ///
    /// # Errors
    ///
    /// Returns [`EtlError::Database`] if the DDL fails.
    pub async fn ensure_table(&mut self) -> Result<(), EtlError> {
        if self.table_ready {
            return Ok(());
        }
        let mut definitions: Vec<String> = self
            .columns
            .iter()
            .chain(RawDataOrigin::COLUMNS.iter())
            .map(|c| format!("\"{}\" {}", c.name, c.sql_type))
            .collect();
        let keys: Vec<String> = self
            .columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| format!("\"{}\"", c.name))
            .collect();
        if !keys.is_empty() {
            definitions.push(format!("PRIMARY KEY ({})", keys.join(", ")));
        }

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.quoted,
            definitions.join(", ")
        ))
        .execute(self.db.pool())
        .await?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS \"idx_{}_raw\" ON {} (_raw_data_table, _raw_data_params)",
            self.table, self.quoted
        ))
        .execute(self.db.pool())
        .await?;

        self.table_ready = true;
        Ok(())
    }

    /// Buffers a record, flushing when the batch is full.
    ///
    /// # Errors
    ///
    /// Returns [`EtlError::BadInput`] when the record belongs to another
    /// table or its values do not match the column layout, or the flush
    /// error.
    pub async fn add(&mut self, record: &dyn Record) -> Result<(), EtlError> {
        if record.table() != self.table || record.columns() != self.columns {
            return Err(EtlError::bad_input(format!(
                "record for {} does not match the layout of {}",
                record.table(),
                self.table
            )));
        }
        let mut values = record.values();
        if values.len() != self.columns.len() {
            return Err(EtlError::bad_input(format!(
                "record for {} has {} values but {} columns",
                self.table,
                values.len(),
                self.columns.len()
            )));
        }
        values.extend(record.origin().values());
        self.buffer.push(values);

        if self.buffer.len() >= self.batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    /// Writes all buffered rows; returns how many were written.
    ///
    /// # Errors
    ///
    /// Returns [`EtlError::Database`] if the insert fails; nothing from this
    /// flush is kept in that case.
    #[instrument(level = "debug", skip(self), fields(table = self.table, rows = self.buffer.len()))]
    pub async fn flush(&mut self) -> Result<u64, EtlError> {
        if self.buffer.is_empty() {
            return Ok(0);
        }
        self.ensure_table().await?;

        let width = self.columns.len() + RawDataOrigin::COLUMNS.len();
        let rows_per_statement = (MAX_BIND_VARIABLES / width).max(1);
        let column_list = self
            .columns
            .iter()
            .chain(RawDataOrigin::COLUMNS.iter())
            .map(|c| format!("\"{}\"", c.name))
            .collect::<Vec<_>>()
            .join(", ");

        let rows = std::mem::take(&mut self.buffer);
        let mut tx = self.db.pool().begin().await?;
        for chunk in rows.chunks(rows_per_statement) {
            let mut builder = QueryBuilder::<Sqlite>::new(format!(
                "INSERT OR REPLACE INTO {} ({column_list}) VALUES ",
                self.quoted
            ));
            for (i, row) in chunk.iter().enumerate() {
                if i > 0 {
                    builder.push(", ");
                }
                builder.push("(");
                for (j, value) in row.iter().enumerate() {
                    if j > 0 {
                        builder.push(", ");
                    }
                    value.bind_to(&mut builder);
                }
                builder.push(")");
            }
            builder.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;

        let count = rows.len() as u64;
        self.written += count;
        debug!(table = self.table, rows = count, "batch flushed");
        Ok(count)
    }

    /// Flushes what is left and returns the total rows written.
    ///
    /// # Errors
    ///
    /// See [`flush`](Self::flush).
    pub async fn close(mut self) -> Result<u64, EtlError> {
        self.flush().await?;
        Ok(self.written)
    }
}

/// Outcome of an extractor or converter run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransformSummary {
    /// Input rows processed.
    pub inputs: u64,
    /// Rows written per destination table.
    pub written: BTreeMap<&'static str, u64>,
}

impl TransformSummary {
    /// Rows written across all tables.
    #[must_use]
    pub fn total_written(&self) -> u64 {
        self.written.values().sum()
    }
}

/// Routes records to one [`BatchSave`] per destination table.
#[derive(Debug)]
pub struct BatchSaveDivider {
    db: Database,
    batch_size: usize,
    raw_table: String,
    params: String,
    incremental: bool,
    savers: BTreeMap<&'static str, BatchSave>,
}

impl BatchSaveDivider {
    /// Creates a divider for rows derived from `raw_table` with `params`.
    #[must_use]
    pub fn new(
        db: &Database,
        batch_size: usize,
        raw_table: impl Into<String>,
        params: impl Into<String>,
        incremental: bool,
    ) -> Self {
        Self {
            db: db.clone(),
            batch_size,
            raw_table: raw_table.into(),
            params: params.into(),
            incremental,
            savers: BTreeMap::new(),
        }
    }

    /// Buffers a record in its table's writer.
    ///
    /// On the first record for a table in full mode, rows previously derived
    /// from the same raw table and params are deleted.
    ///
    /// # Errors
    ///
    /// Returns [`EtlError::BadInput`] when a table is reused with another
    /// column layout, or any database error.
    pub async fn save(&mut self, record: Box<dyn Record>) -> Result<(), EtlError> {
        let table = record.table();
        if !self.savers.contains_key(table) {
            let mut saver = BatchSave::new(&self.db, table, record.columns(), self.batch_size)?;
            saver.ensure_table().await?;
            if !self.incremental {
                self.delete_previous(&saver).await?;
            }
            self.savers.insert(table, saver);
        }
        match self.savers.get_mut(table) {
            Some(saver) => saver.add(record.as_ref()).await,
            None => Err(EtlError::other(format!("no batch writer for {table}"))),
        }
    }

    async fn delete_previous(&self, saver: &BatchSave) -> Result<(), EtlError> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE _raw_data_table = ? AND _raw_data_params = ?",
            saver.quoted
        ))
        .bind(&self.raw_table)
        .bind(&self.params)
        .execute(self.db.pool())
        .await?;
        debug!(
            table = saver.table,
            raw_table = %self.raw_table,
            params = %self.params,
            deleted = result.rows_affected(),
            "cleared rows from previous run"
        );
        Ok(())
    }

    /// Flushes every writer; returns the total rows written per table.
    ///
    /// # Errors
    ///
    /// Returns the first flush error.
    pub async fn close(self) -> Result<BTreeMap<&'static str, u64>, EtlError> {
        let mut written = BTreeMap::new();
        for (table, saver) in self.savers {
            written.insert(table, saver.close().await?);
        }
        Ok(written)
    }
}
