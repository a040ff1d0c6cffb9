//! Subtask definitions, run context and the task orchestrator.
//!
//! A plugin exposes an ordered list of [`SubTaskMeta`] entries (collectors,
//! extractors, converters). [`TaskRunner::run`] decodes the caller's
//! selection, prepares the plugin's task data once, then runs the selected
//! subtasks in order:
//!
//! - task: `TASK_CREATED -> TASK_RUNNING -> {TASK_COMPLETED | TASK_FAILED}`
//! - subtask: `PENDING -> RUNNING -> {DONE | FAILED}`
//!
//! A failed subtask halts the remaining ones. Rows committed by earlier
//! subtasks stay in place; every subtask must be safe to re-run.
//! Cancellation is checked before each subtask and by the subtasks
//! themselves between pages and batches.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use devflow_core::subtask::{PluginTask, RunContext, SubTaskContext, SubTaskMeta, TaskRunner};
//! use devflow_core::{Database, EngineConfig, EtlError};
//! use futures_util::future::BoxFuture;
//! use tokio_util::sync::CancellationToken;
//!
//! struct Demo;
//!
//! fn collect(ctx: &SubTaskContext<()>) -> BoxFuture<'_, Result<(), EtlError>> {
//!     Box::pin(async move {
//!         ctx.run().increment_progress(1);
//!         Ok(())
//!     })
//! }
//!
//! #[async_trait]
//! impl PluginTask for Demo {
//!     type Data = ();
//!     fn name(&self) -> &'static str { "demo" }
//!     fn subtask_metas(&self) -> Vec<SubTaskMeta<()>> {
//!         vec![SubTaskMeta::new("collectThings", collect)]
//!     }
//!     async fn prepare_task_data(&self, _run: &RunContext, _options: &serde_json::Value) -> Result<(), EtlError> {
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> Result<(), EtlError> {
//! let db = Database::new_in_memory().await?;
//! let runner = TaskRunner::new(db, EngineConfig::default());
//! let report = runner
//!     .run(&Demo, serde_json::json!({"connectionId": 1}), CancellationToken::new())
//!     .await?;
//! assert!(report.is_success());
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::config::EngineConfig;
use crate::db::Database;
use crate::db::tx::panic_message;
use crate::error::EtlError;

/// Current time as stored in bookkeeping tables.
pub(crate) fn now_text() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Status of a task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Created,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "TASK_CREATED",
            Self::Running => "TASK_RUNNING",
            Self::Completed => "TASK_COMPLETED",
            Self::Failed => "TASK_FAILED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of one subtask within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubTaskStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl SubTaskStatus {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for SubTaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Progress snapshot sent to an optional observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningProgress {
    /// Plugin name.
    pub plugin: String,
    /// Current subtask name.
    pub subtask: String,
    /// 1-based index of the current subtask.
    pub subtask_number: usize,
    /// Number of selected subtasks.
    pub total_subtasks: usize,
    /// Records processed by the current subtask.
    pub current: u64,
    /// Expected records, 0 when unknown.
    pub total: u64,
}

#[derive(Debug, Default)]
struct ProgressCounters {
    current: AtomicU64,
    total: AtomicU64,
}

/// Everything a subtask needs from its run: database, configuration,
/// cancellation and progress reporting.
///
/// Cheap to clone; clones share the progress counters.
#[derive(Debug, Clone)]
pub struct RunContext {
    db: Database,
    config: Arc<EngineConfig>,
    cancel: CancellationToken,
    plugin: Arc<str>,
    subtask: Arc<str>,
    subtask_number: usize,
    total_subtasks: usize,
    counters: Arc<ProgressCounters>,
    reporter: Option<mpsc::UnboundedSender<RunningProgress>>,
}

impl RunContext {
    /// Creates a context outside any plugin or subtask (useful in tests and
    /// ad-hoc tooling).
    #[must_use]
    pub fn new(db: Database, config: EngineConfig, cancel: CancellationToken) -> Self {
        Self {
            db,
            config: Arc::new(config),
            cancel,
            plugin: Arc::from(""),
            subtask: Arc::from(""),
            subtask_number: 0,
            total_subtasks: 0,
            counters: Arc::new(ProgressCounters::default()),
            reporter: None,
        }
    }

    /// Same context tagged with a plugin name.
    #[must_use]
    pub fn with_plugin(mut self, plugin: &str) -> Self {
        self.plugin = Arc::from(plugin);
        self
    }

    /// Same context sending progress snapshots to `reporter`.
    #[must_use]
    pub fn with_progress_reporter(mut self, reporter: mpsc::UnboundedSender<RunningProgress>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// A child context for one subtask, with fresh progress counters.
    #[must_use]
    pub fn for_subtask(&self, name: &str, number: usize, total: usize) -> Self {
        Self {
            subtask: Arc::from(name),
            subtask_number: number,
            total_subtasks: total,
            counters: Arc::new(ProgressCounters::default()),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn db(&self) -> &Database {
        &self.db
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    #[must_use]
    pub fn plugin_name(&self) -> &str {
        &self.plugin
    }

    #[must_use]
    pub fn subtask_name(&self) -> &str {
        &self.subtask
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fails with [`EtlError::Cancelled`] once cancellation is requested.
    ///
    /// # Errors
    ///
    /// Returns [`EtlError::Cancelled`] if the run was cancelled.
    pub fn check_cancelled(&self) -> Result<(), EtlError> {
        if self.cancel.is_cancelled() {
            return Err(EtlError::Cancelled);
        }
        Ok(())
    }

    /// Sets both progress counters.
    pub fn set_progress(&self, current: u64, total: u64) {
        self.counters.current.store(current, Ordering::SeqCst);
        self.counters.total.store(total, Ordering::SeqCst);
        self.report();
    }

    /// Sets the expected number of records.
    pub fn set_total(&self, total: u64) {
        self.counters.total.store(total, Ordering::SeqCst);
        self.report();
    }

    /// Adds `n` processed records.
    pub fn increment_progress(&self, n: u64) {
        self.counters.current.fetch_add(n, Ordering::SeqCst);
        self.report();
    }

    /// `(current, total)` for the current subtask.
    #[must_use]
    pub fn progress(&self) -> (u64, u64) {
        (
            self.counters.current.load(Ordering::SeqCst),
            self.counters.total.load(Ordering::SeqCst),
        )
    }

    fn report(&self) {
        let Some(reporter) = &self.reporter else {
            return;
        };
        let (current, total) = self.progress();
        // The observer may have gone away; progress is best effort.
        let _ = reporter.send(RunningProgress {
            plugin: self.plugin.to_string(),
            subtask: self.subtask.to_string(),
            subtask_number: self.subtask_number,
            total_subtasks: self.total_subtasks,
            current,
            total,
        });
    }
}

/// Context handed to a subtask entry point: the run plus the plugin's data.
pub struct SubTaskContext<D> {
    run: RunContext,
    data: Arc<D>,
}

impl<D> SubTaskContext<D> {
    #[must_use]
    pub fn new(run: RunContext, data: Arc<D>) -> Self {
        Self { run, data }
    }

    /// The run this subtask belongs to.
    #[must_use]
    pub fn run(&self) -> &RunContext {
        &self.run
    }

    /// The plugin's prepared task data.
    #[must_use]
    pub fn data(&self) -> &D {
        &self.data
    }
}

/// Entry point of a subtask.
pub type SubTaskEntryPoint<D> =
    for<'a> fn(&'a SubTaskContext<D>) -> BoxFuture<'a, Result<(), EtlError>>;

/// Declaration of one named unit of a plugin.
pub struct SubTaskMeta<D> {
    pub name: &'static str,
    pub entry_point: SubTaskEntryPoint<D>,
    /// Always scheduled, whatever the caller selected.
    pub required: bool,
    /// Scheduled when the caller selects nothing explicitly.
    pub enabled_by_default: bool,
    pub description: &'static str,
    /// Domain types this unit produces, used for selective runs.
    pub domain_types: &'static [&'static str],
}

impl<D> SubTaskMeta<D> {
    /// A default-enabled, optional subtask with no domain types.
    #[must_use]
    pub fn new(name: &'static str, entry_point: SubTaskEntryPoint<D>) -> Self {
        Self {
            name,
            entry_point,
            required: false,
            enabled_by_default: true,
            description: "",
            domain_types: &[],
        }
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    #[must_use]
    pub fn disabled_by_default(mut self) -> Self {
        self.enabled_by_default = false;
        self
    }

    #[must_use]
    pub fn describe(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }

    #[must_use]
    pub fn domain_types(mut self, domain_types: &'static [&'static str]) -> Self {
        self.domain_types = domain_types;
        self
    }
}

impl<D> Clone for SubTaskMeta<D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<D> Copy for SubTaskMeta<D> {}

impl<D> fmt::Debug for SubTaskMeta<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubTaskMeta")
            .field("name", &self.name)
            .field("required", &self.required)
            .field("enabled_by_default", &self.enabled_by_default)
            .field("domain_types", &self.domain_types)
            .finish_non_exhaustive()
    }
}

/// Contract every source plugin implements.
#[async_trait]
pub trait PluginTask: Send + Sync {
    /// Data shared by all subtasks of one run (typed options, API client...).
    type Data: Send + Sync + 'static;

    /// Plugin name, e.g. `github`.
    fn name(&self) -> &'static str;

    /// All subtasks in execution order.
    fn subtask_metas(&self) -> Vec<SubTaskMeta<Self::Data>>;

    /// Decodes and validates options and builds the run's task data.
    async fn prepare_task_data(
        &self,
        run: &RunContext,
        options: &Value,
    ) -> Result<Self::Data, EtlError>;
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Selection {
    #[serde(default)]
    subtasks: Vec<String>,
    #[serde(default)]
    domain_types: Vec<String>,
}

/// Picks the subtasks to run, in declaration order.
///
/// Explicit names win over domain types, which win over defaults. Required
/// subtasks are always included.
///
/// # Errors
///
/// Returns [`EtlError::BadInput`] for an unknown subtask name.
pub fn select_subtasks<D>(
    metas: &[SubTaskMeta<D>],
    subtasks: &[String],
    domain_types: &[String],
) -> Result<Vec<SubTaskMeta<D>>, EtlError> {
    let known: HashSet<&str> = metas.iter().map(|m| m.name).collect();
    if let Some(unknown) = subtasks.iter().find(|name| !known.contains(name.as_str())) {
        return Err(EtlError::bad_input(format!("subtask {unknown} does not exist")));
    }

    let selected = metas
        .iter()
        .filter(|meta| {
            meta.required
                || if !subtasks.is_empty() {
                    subtasks.iter().any(|name| name == meta.name)
                } else if !domain_types.is_empty() {
                    meta.domain_types
                        .iter()
                        .any(|dt| domain_types.iter().any(|wanted| wanted == dt))
                } else {
                    meta.enabled_by_default
                }
        })
        .copied()
        .collect();
    Ok(selected)
}

/// Outcome of one executed subtask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubTaskReport {
    pub name: String,
    /// 1-based position within the run.
    pub number: usize,
    pub status: SubTaskStatus,
    /// Records processed before the subtask ended.
    pub records: u64,
    pub spent: Duration,
}

/// Outcome of one task run.
#[derive(Debug)]
pub struct TaskReport {
    /// Row id in `_devlake_tasks`.
    pub task_id: i64,
    pub status: TaskStatus,
    /// Executed subtasks (the last one may have failed).
    pub subtasks: Vec<SubTaskReport>,
    /// Name of the subtask that failed, if any.
    pub failed_subtask: Option<String>,
    pub error: Option<EtlError>,
    pub spent: Duration,
}

impl TaskReport {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    /// Total records processed across subtasks.
    #[must_use]
    pub fn records(&self) -> u64 {
        self.subtasks.iter().map(|s| s.records).sum()
    }

    /// Error messages from outermost to innermost cause.
    #[must_use]
    pub fn error_chain(&self) -> Vec<String> {
        self.error.as_ref().map(EtlError::cause_chain).unwrap_or_default()
    }
}

/// Runs plugin tasks and records them in `_devlake_tasks` /
/// `_devlake_subtasks`.
#[derive(Debug, Clone)]
pub struct TaskRunner {
    db: Database,
    config: EngineConfig,
    reporter: Option<mpsc::UnboundedSender<RunningProgress>>,
}

impl TaskRunner {
    #[must_use]
    pub fn new(db: Database, config: EngineConfig) -> Self {
        Self {
            db,
            config,
            reporter: None,
        }
    }

    /// Sends progress snapshots of every run to `reporter`.
    #[must_use]
    pub fn with_progress_reporter(mut self, reporter: mpsc::UnboundedSender<RunningProgress>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Runs one task of `plugin` with the given options.
    ///
    /// Subtask failures do not make this return `Err`; they are reported in
    /// [`TaskReport`] with status [`TaskStatus::Failed`].
    ///
    /// # Errors
    ///
    /// Returns an error only when the bookkeeping rows cannot be written.
    #[instrument(skip(self, plugin, options, cancel), fields(plugin = plugin.name()))]
    pub async fn run<D: Send + Sync + 'static>(
        &self,
        plugin: &dyn PluginTask<Data = D>,
        options: Value,
        cancel: CancellationToken,
    ) -> Result<TaskReport, EtlError> {
        let started = Instant::now();
        let task_id = self.create_task(plugin.name(), &options).await?;
        self.update_task_running(task_id).await?;
        info!(task_id, "task started");

        let mut run = RunContext::new(self.db.clone(), self.config.clone(), cancel)
            .with_plugin(plugin.name());
        if let Some(reporter) = &self.reporter {
            run = run.with_progress_reporter(reporter.clone());
        }

        let mut subtasks = Vec::new();
        let mut failed_subtask = None;
        let outcome = self
            .run_subtasks(task_id, plugin, &run, &options, &mut subtasks, &mut failed_subtask)
            .await;

        let spent = started.elapsed();
        let (status, error) = match outcome {
            Ok(()) => {
                info!(task_id, spent_ms = spent.as_millis(), "task completed");
                (TaskStatus::Completed, None)
            }
            Err(err) => {
                error!(task_id, failed_subtask = ?failed_subtask, error = %err, "task failed");
                (TaskStatus::Failed, Some(err))
            }
        };
        self.finish_task(task_id, status, error.as_ref(), failed_subtask.as_deref(), spent)
            .await?;

        Ok(TaskReport {
            task_id,
            status,
            subtasks,
            failed_subtask,
            error,
            spent,
        })
    }

    /// Runs the selected subtasks; `Err` carries the reason the task failed.
    async fn run_subtasks<D: Send + Sync + 'static>(
        &self,
        task_id: i64,
        plugin: &dyn PluginTask<Data = D>,
        run: &RunContext,
        options: &Value,
        reports: &mut Vec<SubTaskReport>,
        failed_subtask: &mut Option<String>,
    ) -> Result<(), EtlError> {
        let selection: Selection = serde_json::from_value(options.clone())
            .map_err(|e| EtlError::bad_input_from("invalid subtask selection", e))?;
        let selected = select_subtasks(
            &plugin.subtask_metas(),
            &selection.subtasks,
            &selection.domain_types,
        )?;
        let data = Arc::new(plugin.prepare_task_data(run, options).await?);

        let mut row_ids = Vec::with_capacity(selected.len());
        for (index, meta) in selected.iter().enumerate() {
            row_ids.push(self.create_subtask(task_id, meta.name, index + 1).await?);
        }

        let total = selected.len();
        for ((index, meta), row_id) in selected.iter().enumerate().zip(row_ids) {
            let number = index + 1;
            if let Err(err) = run.check_cancelled() {
                *failed_subtask = Some(meta.name.to_string());
                return Err(err);
            }

            info!(subtask = meta.name, number, total, "executing subtask");
            self.update_subtask_running(row_id).await?;
            let ctx = SubTaskContext::new(run.for_subtask(meta.name, number, total), data.clone());
            ctx.run().report();

            let started = Instant::now();
            let result = match AssertUnwindSafe((meta.entry_point)(&ctx)).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(EtlError::other(format!(
                    "subtask panicked: {}",
                    panic_message(panic.as_ref())
                ))),
            };
            let spent = started.elapsed();
            let (records, _) = ctx.run().progress();
            let status = if result.is_ok() {
                SubTaskStatus::Done
            } else {
                SubTaskStatus::Failed
            };
            self.finish_subtask(row_id, status, records, result.as_ref().err(), spent)
                .await?;
            self.update_task_progress(task_id, number, total).await?;
            reports.push(SubTaskReport {
                name: meta.name.to_string(),
                number,
                status,
                records,
                spent,
            });

            if let Err(err) = result {
                warn!(subtask = meta.name, records, error = %err, "subtask failed");
                *failed_subtask = Some(meta.name.to_string());
                return Err(err.wrap(format!("subtask {} ended unexpectedly", meta.name)));
            }
            info!(subtask = meta.name, records, spent_ms = spent.as_millis(), "subtask finished");
        }
        Ok(())
    }

    async fn create_task(&self, plugin: &str, options: &Value) -> Result<i64, EtlError> {
        let result = sqlx::query(
            r"INSERT INTO _devlake_tasks (plugin, options, status)
              VALUES (?, ?, ?)",
        )
        .bind(plugin)
        .bind(options.to_string())
        .bind(TaskStatus::Created.as_str())
        .execute(self.db.pool())
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn update_task_running(&self, task_id: i64) -> Result<(), EtlError> {
        sqlx::query(r"UPDATE _devlake_tasks SET status = ?, began_at = ? WHERE id = ?")
            .bind(TaskStatus::Running.as_str())
            .bind(now_text())
            .bind(task_id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    #[allow(clippy::cast_precision_loss)]
    async fn update_task_progress(
        &self,
        task_id: i64,
        finished: usize,
        total: usize,
    ) -> Result<(), EtlError> {
        sqlx::query(r"UPDATE _devlake_tasks SET progress = ? WHERE id = ?")
            .bind(finished as f64 / total.max(1) as f64)
            .bind(task_id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    async fn finish_task(
        &self,
        task_id: i64,
        status: TaskStatus,
        error: Option<&EtlError>,
        failed_subtask: Option<&str>,
        spent: Duration,
    ) -> Result<(), EtlError> {
        sqlx::query(
            r"UPDATE _devlake_tasks
              SET status = ?,
                  message = ?,
                  error_name = ?,
                  failed_sub_task = ?,
                  finished_at = ?,
                  spent_seconds = ?
              WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(error.map(|e| e.cause_chain().join(": ")))
        .bind(error.map(|e| e.root_kind().to_string()))
        .bind(failed_subtask)
        .bind(now_text())
        .bind(seconds(spent))
        .bind(task_id)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    async fn create_subtask(&self, task_id: i64, name: &str, number: usize) -> Result<i64, EtlError> {
        let result = sqlx::query(
            r"INSERT INTO _devlake_subtasks (task_id, name, number, status)
              VALUES (?, ?, ?, ?)",
        )
        .bind(task_id)
        .bind(name)
        .bind(i64::try_from(number).unwrap_or(i64::MAX))
        .bind(SubTaskStatus::Pending.as_str())
        .execute(self.db.pool())
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn update_subtask_running(&self, row_id: i64) -> Result<(), EtlError> {
        sqlx::query(r"UPDATE _devlake_subtasks SET status = ?, began_at = ? WHERE id = ?")
            .bind(SubTaskStatus::Running.as_str())
            .bind(now_text())
            .bind(row_id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    async fn finish_subtask(
        &self,
        row_id: i64,
        status: SubTaskStatus,
        records: u64,
        error: Option<&EtlError>,
        spent: Duration,
    ) -> Result<(), EtlError> {
        sqlx::query(
            r"UPDATE _devlake_subtasks
              SET status = ?,
                  records = ?,
                  message = ?,
                  finished_at = ?,
                  spent_seconds = ?
              WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(i64::try_from(records).unwrap_or(i64::MAX))
        .bind(error.map(|e| e.cause_chain().join(": ")))
        .bind(now_text())
        .bind(seconds(spent))
        .bind(row_id)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }
}

fn seconds(spent: Duration) -> i64 {
    i64::try_from(spent.as_secs()).unwrap_or(i64::MAX)
}
