//! Tool-layer to domain-layer conversion.
//!
//! [`DataConverter`] pages through a [`SelectQuery`] (usually a join over
//! tool tables scoped to one connection) by keyset on an integer key, decodes
//! each row into `I` and writes the domain records returned by the transform.
//! The key defaults to the `rowid` of the FROM table, and rows with a key
//! above its maximum at the start of the run are not visited. Batching, fan-out
//! and upsert semantics match the extractor. Records without provenance
//! inherit the provenance of their input row.
//!
//! Domain ids should come from [`DomainIdGenerator`](crate::models::DomainIdGenerator)
//! so reruns overwrite rather than duplicate.

use std::marker::PhantomData;
use std::sync::Arc;

use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};
use tracing::{debug, info, instrument};

use crate::batch::{BatchSaveDivider, TransformSummary};
use crate::collector::RawDataSubTaskArgs;
use crate::db::SelectQuery;
use crate::error::EtlError;
use crate::extractor::BeforeHook;
use crate::models::{Provenance, Record};
use crate::subtask::RunContext;

/// Column alias under which the paging key is selected.
const CURSOR_ALIAS: &str = "_devflow_cursor";

/// Turns one input row into zero or more domain records.
pub type ConvertFn<I> = Arc<dyn Fn(&I) -> Result<Vec<Box<dyn Record>>, EtlError> + Send + Sync>;

/// Arguments of a [`DataConverter`].
pub struct DataConverterArgs<I> {
    /// Scope whose previously converted rows are replaced in full mode.
    pub raw: RawDataSubTaskArgs,
    /// Input rows; paged in key order, so any `ORDER BY` is replaced.
    pub query: SelectQuery,
    /// Integer key expression to page by; defaults to the FROM table's `rowid`.
    pub cursor: Option<String>,
    pub convert: ConvertFn<I>,
    pub before_convert: Option<BeforeHook>,
    pub batch_size: Option<usize>,
    pub incremental: bool,
}

impl<I> DataConverterArgs<I> {
    #[must_use]
    pub fn new(raw: RawDataSubTaskArgs, query: SelectQuery, convert: ConvertFn<I>) -> Self {
        Self {
            raw,
            query,
            cursor: None,
            convert,
            before_convert: None,
            batch_size: None,
            incremental: false,
        }
    }

    /// Pages by `column`, an increasing integer such as `i.issue_id`.
    #[must_use]
    pub fn with_cursor(mut self, column: impl Into<String>) -> Self {
        self.cursor = Some(column.into());
        self
    }

    #[must_use]
    pub fn with_before_convert(mut self, hook: BeforeHook) -> Self {
        self.before_convert = Some(hook);
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

    fn cursor_column(&self) -> String {
        match &self.cursor {
            Some(column) => column.clone(),
            None => {
                let qualifier = self.query.from_table().split_whitespace().last().unwrap_or_default();
                format!("{qualifier}.rowid")
            }
        }
    }
}

/// Converts rows decoded as `I` into domain records.
pub struct DataConverter<I> {
    args: DataConverterArgs<I>,
    _input: PhantomData<fn() -> I>,
}

impl<I> DataConverter<I>
where
    I: for<'r> FromRow<'r, SqliteRow> + Provenance + Send + Unpin + 'static,
{
    #[must_use]
    pub fn new(args: DataConverterArgs<I>) -> Self {
        Self {
            args,
            _input: PhantomData,
        }
    }

    /// Runs the conversion.
    ///
    /// # Errors
    ///
    /// Returns [`EtlError::Cancelled`] when the run is cancelled, the
    /// transform error wrapped with the input's provenance, or a database
    /// error.
    #[instrument(skip(self, run), fields(table = %self.args.raw.table(), params = %self.args.raw.params()))]
    pub async fn execute(&self, run: &RunContext) -> Result<TransformSummary, EtlError> {
        run.check_cancelled()?;
        if let Some(hook) = &self.args.before_convert {
            hook(run).await?;
        }

        let (total,): (i64,) = self
            .args
            .query
            .build_count()?
            .build_query_as()
            .fetch_one(run.db().pool())
            .await?;
        run.set_progress(0, u64::try_from(total).unwrap_or(0));
        info!(total, "converting rows");

        let batch_size = self.args.batch_size.unwrap_or(run.config().batch_size).max(1);
        let mut divider = BatchSaveDivider::new(
            run.db(),
            batch_size,
            self.args.raw.table(),
            self.args.raw.params(),
            self.args.incremental,
        );

        let cursor = self.args.cursor_column();
        let (upper,): (Option<i64>,) = self
            .args
            .query
            .build_aggregate(&format!("MAX({cursor})"))?
            .build_query_as()
            .fetch_one(run.db().pool())
            .await?;

        let mut inputs = 0u64;
        let mut last_key: Option<i64> = None;
        if let Some(upper) = upper {
            loop {
                let rows: Vec<SqliteRow> = self
                    .args
                    .query
                    .keyset_page(&cursor, CURSOR_ALIAS, last_key, upper, batch_size as u64)
                    .build()?
                    .build()
                    .fetch_all(run.db().pool())
                    .await?;

                for row in &rows {
                    run.check_cancelled()?;
                    let input = I::from_row(row)?;
                    let origin = input.origin();
                    let records = (self.args.convert)(&input).map_err(|e| {
                        e.wrap(format!(
                            "failed to convert row from {}#{} ({})",
                            origin.raw_data_table, origin.raw_data_id, origin.raw_data_params
                        ))
                    })?;
                    for mut record in records {
                        if record.origin().is_empty() {
                            *record.origin_mut() = origin.clone();
                        }
                        divider.save(record).await?;
                    }
                    last_key = Some(row.try_get(CURSOR_ALIAS)?);
                    inputs += 1;
                    run.increment_progress(1);
                }
                debug!(rows = rows.len(), last_key, "tool batch converted");

                if rows.len() < batch_size {
                    break;
                }
            }
        }

        let written = divider.close().await?;
        let summary = TransformSummary { inputs, written };
        info!(inputs, written = summary.total_written(), "conversion finished");
        Ok(summary)
    }
}
