//! Raw-layer to tool-layer extraction.
//!
//! [`ApiExtractor`] streams the raw rows of one `(table, params)` scope in id
//! order, hands each to a pure transform and writes whatever records come
//! back through a [`BatchSaveDivider`]. One raw row may produce records of
//! several types; each goes to its own table. Every record is stamped with
//! the provenance of the raw row it came from.
//!
//! A transform error aborts the extraction and names the offending raw row.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use tracing::{debug, info, instrument, warn};

use crate::batch::{BatchSaveDivider, TransformSummary};
use crate::collector::RawDataSubTaskArgs;
use crate::db::quote_ident;
use crate::error::EtlError;
use crate::models::{RawData, RawDataOrigin, Record};
use crate::subtask::RunContext;

/// Turns one raw row into zero or more records.
pub type ExtractFn = Arc<dyn Fn(&RawData) -> Result<Vec<Box<dyn Record>>, EtlError> + Send + Sync>;

/// Hook run once before the first input row, e.g. to delete child rows.
pub type BeforeHook =
    Arc<dyn for<'a> Fn(&'a RunContext) -> BoxFuture<'a, Result<(), EtlError>> + Send + Sync>;

/// Formats a timestamp the way raw tables store `created_at`.
pub(crate) fn sqlite_timestamp(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Arguments of an [`ApiExtractor`].
pub struct ApiExtractorArgs {
    pub raw: RawDataSubTaskArgs,
    pub extract: ExtractFn,
    pub before_extract: Option<BeforeHook>,
    /// Rows per read and per write batch; the engine default when `None`.
    pub batch_size: Option<usize>,
    /// Keep previously extracted rows of the scope.
    pub incremental: bool,
    /// Only process raw rows created at or after this instant.
    pub created_after: Option<DateTime<Utc>>,
}

impl ApiExtractorArgs {
    #[must_use]
    pub fn new(raw: RawDataSubTaskArgs, extract: ExtractFn) -> Self {
        Self {
            raw,
            extract,
            before_extract: None,
            batch_size: None,
            incremental: false,
            created_after: None,
        }
    }

    #[must_use]
    pub fn with_before_extract(mut self, hook: BeforeHook) -> Self {
        self.before_extract = Some(hook);
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    #[must_use]
    pub fn incremental(mut self, incremental: bool) -> Self {
        self.incremental = incremental;
        self
    }

    /// Processes only raw rows created since `at` (stateful extraction).
    #[must_use]
    pub fn with_created_after(mut self, at: DateTime<Utc>) -> Self {
        self.created_after = Some(at);
        self.incremental = true;
        self
    }
}

/// Extracts tool-layer records from a raw table.
pub struct ApiExtractor {
    args: ApiExtractorArgs,
}

impl ApiExtractor {
    #[must_use]
    pub fn new(args: ApiExtractorArgs) -> Self {
        Self { args }
    }

    /// Runs the extraction.
    ///
    /// # Errors
    ///
    /// Returns [`EtlError::Cancelled`] when the run is cancelled, the
    /// transform error wrapped with the raw row's provenance, or a database
    /// error.
    #[instrument(skip(self, run), fields(table = %self.args.raw.table(), params = %self.args.raw.params()))]
    pub async fn execute(&self, run: &RunContext) -> Result<TransformSummary, EtlError> {
        run.check_cancelled()?;
        let table = self.args.raw.table();
        let params = self.args.raw.params();
        if !run.db().table_exists(table).await? {
            warn!("raw table does not exist, nothing to extract");
            return Ok(TransformSummary::default());
        }
        if let Some(hook) = &self.args.before_extract {
            hook(run).await?;
        }

        let quoted = quote_ident(table)?;
        let created_after = self.args.created_after.as_ref().map(sqlite_timestamp);
        let filter = if created_after.is_some() {
            "params = ? AND created_at >= ?"
        } else {
            "params = ?"
        };

        let count_sql = format!("SELECT COUNT(*) FROM {quoted} WHERE {filter}");
        let mut count = sqlx::query_as::<_, (i64,)>(&count_sql).bind(params);
        if let Some(after) = &created_after {
            count = count.bind(after.clone());
        }
        let (total,) = count.fetch_one(run.db().pool()).await?;
        run.set_progress(0, u64::try_from(total).unwrap_or(0));
        info!(total, "extracting raw rows");

        let batch_size = self.args.batch_size.unwrap_or(run.config().batch_size).max(1);
        let mut divider = BatchSaveDivider::new(
            run.db(),
            batch_size,
            table,
            params,
            self.args.incremental,
        );
        let select = format!(
            "SELECT id, params, data, url, input, created_at FROM {quoted} \
             WHERE {filter} AND id > ? ORDER BY id LIMIT ?"
        );

        let mut inputs = 0u64;
        let mut last_id = 0i64;
        loop {
            let mut query = sqlx::query_as::<_, RawData>(&select).bind(params);
            if let Some(after) = &created_after {
                query = query.bind(after.clone());
            }
            let rows = query
                .bind(last_id)
                .bind(i64::try_from(batch_size).unwrap_or(i64::MAX))
                .fetch_all(run.db().pool())
                .await?;
            let Some(last) = rows.last() else {
                break;
            };
            last_id = last.id;

            for row in &rows {
                run.check_cancelled()?;
                let records = (self.args.extract)(row)
                    .map_err(|e| e.wrap(format!("failed to extract raw row {table}#{} ({})", row.id, row.params)))?;
                for mut record in records {
                    stamp(record.as_mut(), table, row);
                    divider.save(record).await?;
                }
                inputs += 1;
                run.increment_progress(1);
            }
            debug!(rows = rows.len(), last_id, "raw batch extracted");
        }

        let written = divider.close().await?;
        let summary = TransformSummary { inputs, written };
        info!(inputs, written = summary.total_written(), "extraction finished");
        Ok(summary)
    }
}

/// Sets the provenance of `record` to `row`, keeping any remark.
fn stamp(record: &mut dyn Record, table: &str, row: &RawData) {
    let origin = record.origin_mut();
    let remark = std::mem::take(&mut origin.raw_data_remark);
    *origin = RawDataOrigin::from_raw(table, row);
    origin.raw_data_remark = remark;
}
