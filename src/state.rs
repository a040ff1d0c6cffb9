//! Persisted incremental-collection state and high-water mark resolution.
//!
//! A [`SubtaskStateManager`] remembers, per `(plugin, subtask, params)`, when
//! the last successful run started and with which configuration. On the next
//! run it decides whether the subtask may collect incrementally and from
//! which point in time.
//!
//! # Example
//!
//! ```no_run
//! use devflow_core::collector::RawDataSubTaskArgs;
//! use devflow_core::state::{StateOptions, SubtaskStateManager};
//! use devflow_core::subtask::RunContext;
//! use serde_json::json;
//!
//! # async fn example(run: &RunContext) -> Result<(), devflow_core::EtlError> {
//! let raw = RawDataSubTaskArgs::new("github_api_issues", &json!({"connectionId": 1}))?;
//! let state = SubtaskStateManager::open(run, raw.params(), StateOptions::default()).await?;
//! if let Some(since) = state.since() {
//!     println!("collecting changes since {since}");
//! }
//! // ... collect ...
//! state.close().await?;
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use sqlx::FromRow;
use tracing::{debug, info, instrument};

use crate::db::{Database, SelectQuery, quote_ident};
use crate::error::EtlError;
use crate::models::SqlValue;
use crate::subtask::RunContext;

/// How a run wants its state evaluated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateOptions {
    /// Force a full re-collection.
    pub full_sync: bool,
    /// Earliest point in time the caller wants collected, if any.
    pub time_after: Option<DateTime<Utc>>,
    /// Configuration that shapes the collected data; a change forces full sync.
    pub config: Option<Value>,
}

impl StateOptions {
    #[must_use]
    pub fn full_sync(mut self, full_sync: bool) -> Self {
        self.full_sync = full_sync;
        self
    }

    #[must_use]
    pub fn with_time_after(mut self, time_after: DateTime<Utc>) -> Self {
        self.time_after = Some(time_after);
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: Value) -> Self {
        self.config = Some(config);
        self
    }
}

#[derive(Debug, Clone, FromRow)]
struct StoredState {
    prev_config: Option<String>,
    time_after: Option<String>,
    prev_started_at: Option<String>,
}

/// Decides incremental vs full collection for one subtask scope.
#[derive(Debug)]
pub struct SubtaskStateManager {
    db: Database,
    plugin: String,
    subtask: String,
    params: String,
    config: Option<String>,
    /// Lower time bound recorded on close.
    time_after: Option<DateTime<Utc>>,
    started_at: DateTime<Utc>,
    incremental: bool,
    since: Option<DateTime<Utc>>,
}

impl SubtaskStateManager {
    /// Loads the stored state of the current subtask for `params`.
    ///
    /// A run is incremental only when a previous run succeeded, the
    /// configuration is unchanged (an empty stored configuration never
    /// counts as a change), the requested `time_after` is not earlier than
    /// the stored one, and full sync was not requested.
    ///
    /// # Errors
    ///
    /// Returns a database error, or [`EtlError::BadInput`] when a stored
    /// timestamp cannot be parsed.
    #[instrument(skip(run, options), fields(plugin = %run.plugin_name(), subtask = %run.subtask_name()))]
    pub async fn open(run: &RunContext, params: &str, options: StateOptions) -> Result<Self, EtlError> {
        let config = options.config.as_ref().map(serde_json::to_string).transpose()?;
        let stored: Option<StoredState> = sqlx::query_as(
            r"SELECT prev_config, time_after, prev_started_at FROM _devlake_subtask_states
              WHERE plugin = ? AND subtask = ? AND params = ?",
        )
        .bind(run.plugin_name())
        .bind(run.subtask_name())
        .bind(params)
        .fetch_optional(run.db().pool())
        .await?;

        let prev_started_at = stored
            .as_ref()
            .and_then(|state| state.prev_started_at.as_deref())
            .map(parse_timestamp)
            .transpose()?;
        let prev_time_after = stored
            .as_ref()
            .and_then(|state| state.time_after.as_deref())
            .map(parse_timestamp)
            .transpose()?;
        let prev_config = stored
            .as_ref()
            .and_then(|state| state.prev_config.as_deref())
            .filter(|prev| !prev.is_empty());
        let config_changed = prev_config.is_some_and(|prev| Some(prev) != config.as_deref());
        let time_after_moved_back = matches!(
            (options.time_after, prev_time_after),
            (Some(requested), Some(previous)) if requested < previous
        );

        let (incremental, since) = match prev_started_at {
            Some(started) if !options.full_sync && !config_changed && !time_after_moved_back => {
                (true, Some(started))
            }
            _ => (false, options.time_after),
        };
        let since = since.or(prev_time_after);
        // Only a full run moves the stored lower bound, and never to NULL.
        let time_after = if incremental {
            prev_time_after
        } else {
            options.time_after.or(prev_time_after)
        };
        info!(incremental, since = ?since, "subtask state loaded");

        Ok(Self {
            db: run.db().clone(),
            plugin: run.plugin_name().to_string(),
            subtask: run.subtask_name().to_string(),
            params: params.to_string(),
            config,
            time_after,
            started_at: Utc::now(),
            incremental,
            since,
        })
    }

    /// Whether this run may collect only what changed.
    #[must_use]
    pub fn is_incremental(&self) -> bool {
        self.incremental
    }

    /// Lower bound of the time range to collect.
    ///
    /// The previous run's start when incremental, otherwise the requested
    /// `time_after`, falling back to the stored one.
    #[must_use]
    pub fn since(&self) -> Option<DateTime<Utc>> {
        self.since
    }

    /// When this run started.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Records a successful run. Call only after the subtask succeeded.
    ///
    /// The run's start and configuration are always stored. The stored
    /// `time_after` only changes after a full run that requested one.
    ///
    /// # Errors
    ///
    /// Returns a database error if the state row cannot be written.
    pub async fn close(self) -> Result<(), EtlError> {
        sqlx::query(
            r"INSERT INTO _devlake_subtask_states
                  (plugin, subtask, params, prev_config, time_after, prev_started_at, updated_at)
              VALUES (?, ?, ?, ?, ?, ?, ?)
              ON CONFLICT (plugin, subtask, params) DO UPDATE SET
                  prev_config = excluded.prev_config,
                  time_after = excluded.time_after,
                  prev_started_at = excluded.prev_started_at,
                  updated_at = excluded.updated_at",
        )
        .bind(&self.plugin)
        .bind(&self.subtask)
        .bind(&self.params)
        .bind(&self.config)
        .bind(self.time_after.as_ref().map(format_timestamp))
        .bind(format_timestamp(&self.started_at))
        .bind(format_timestamp(&Utc::now()))
        .execute(self.db.pool())
        .await?;
        debug!(plugin = %self.plugin, subtask = %self.subtask, "subtask state saved");
        Ok(())
    }
}

fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Parses RFC3339 or SQLite's `YYYY-MM-DD HH:MM:SS[.fff]` (taken as UTC).
fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, EtlError> {
    if let Ok(at) = DateTime::parse_from_rfc3339(text) {
        return Ok(at.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .map(|at| at.and_utc())
        .map_err(|e| EtlError::bad_input_from(format!("invalid timestamp '{text}'"), e))
}

/// Resolves the high-water mark for an incremental collection.
///
/// An explicit value wins. Otherwise the latest `updated_at` of `tool_table`
/// among rows matching every `(column, value)` pair of `scope` is used.
/// `None` means full collection: the table is missing or has no rows in scope.
///
/// # Errors
///
/// Returns [`EtlError::BadInput`] for invalid identifiers or an unparseable
/// `updated_at`, or a database error.
#[instrument(skip(db, scope))]
pub async fn resolve_since(
    db: &Database,
    explicit: Option<DateTime<Utc>>,
    tool_table: &str,
    scope: &[(&str, SqlValue)],
) -> Result<Option<DateTime<Utc>>, EtlError> {
    if explicit.is_some() {
        return Ok(explicit);
    }
    if !db.table_exists(tool_table).await? {
        return Ok(None);
    }

    let mut query = SelectQuery::from(quote_ident(tool_table)?).select(&["MAX(updated_at)"]);
    for (column, value) in scope {
        query = query.where_clause(format!("{} = ?", quote_ident(column)?), vec![value.clone()]);
    }
    let (latest,): (Option<String>,) = query
        .build()?
        .build_query_as()
        .fetch_one(db.pool())
        .await?;

    let since = latest.as_deref().map(parse_timestamp).transpose()?;
    debug!(since = ?since, "resolved high-water mark from tool table");
    Ok(since)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::config::EngineConfig;

    async fn run_context() -> RunContext {
        let db = Database::new_in_memory().await.unwrap();
        RunContext::new(db, EngineConfig::default(), CancellationToken::new())
            .with_plugin("github")
            .for_subtask("collectIssues", 1, 1)
    }

    // ==================== State Manager Tests ====================

    #[tokio::test]
    async fn test_first_run_is_full() {
        let run = run_context().await;
        let state = SubtaskStateManager::open(&run, "connectionId=1", StateOptions::default())
            .await
            .unwrap();
        assert!(!state.is_incremental());
        assert!(state.since().is_none());
    }

    #[tokio::test]
    async fn test_second_run_is_incremental_since_previous_start() {
        let run = run_context().await;
        let first = SubtaskStateManager::open(&run, "connectionId=1", StateOptions::default())
            .await
            .unwrap();
        let first_started = first.started_at();
        first.close().await.unwrap();

        let second = SubtaskStateManager::open(&run, "connectionId=1", StateOptions::default())
            .await
            .unwrap();
        assert!(second.is_incremental());
        let since = second.since().unwrap();
        assert_eq!(since.timestamp_millis(), first_started.timestamp_millis());

        let other_scope = SubtaskStateManager::open(&run, "connectionId=2", StateOptions::default())
            .await
            .unwrap();
        assert!(!other_scope.is_incremental());
    }

    #[tokio::test]
    async fn test_unclosed_run_stays_full() {
        let run = run_context().await;
        let failed = SubtaskStateManager::open(&run, "connectionId=1", StateOptions::default())
            .await
            .unwrap();
        drop(failed);
        let next = SubtaskStateManager::open(&run, "connectionId=1", StateOptions::default())
            .await
            .unwrap();
        assert!(!next.is_incremental());
    }

    #[tokio::test]
    async fn test_full_sync_and_config_change_force_full() {
        let run = run_context().await;
        let options = StateOptions::default().with_config(json!({"issueTypes": ["bug"]}));
        SubtaskStateManager::open(&run, "p", options.clone())
            .await
            .unwrap()
            .close()
            .await
            .unwrap();

        let same = SubtaskStateManager::open(&run, "p", options.clone()).await.unwrap();
        assert!(same.is_incremental());

        let forced = SubtaskStateManager::open(&run, "p", options.full_sync(true)).await.unwrap();
        assert!(!forced.is_incremental());

        let changed = StateOptions::default().with_config(json!({"issueTypes": ["bug", "incident"]}));
        let changed = SubtaskStateManager::open(&run, "p", changed).await.unwrap();
        assert!(!changed.is_incremental());
    }

    #[tokio::test]
    async fn test_time_after_moving_earlier_forces_full() {
        let run = run_context().await;
        let june = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let january = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let july = Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap();
        SubtaskStateManager::open(&run, "p", StateOptions::default().with_time_after(june))
            .await
            .unwrap()
            .close()
            .await
            .unwrap();

        let later = SubtaskStateManager::open(&run, "p", StateOptions::default().with_time_after(july))
            .await
            .unwrap();
        assert!(later.is_incremental());

        let earlier = SubtaskStateManager::open(&run, "p", StateOptions::default().with_time_after(january))
            .await
            .unwrap();
        assert!(!earlier.is_incremental());
    }

    async fn stored_time_after(run: &RunContext, params: &str) -> Option<String> {
        let (time_after,): (Option<String>,) =
            sqlx::query_as("SELECT time_after FROM _devlake_subtask_states WHERE params = ?")
                .bind(params)
                .fetch_one(run.db().pool())
                .await
                .unwrap();
        time_after
    }

    #[tokio::test]
    async fn test_full_run_since_is_requested_or_stored_time_after() {
        let run = run_context().await;
        let june = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let july = Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap();

        let first = SubtaskStateManager::open(&run, "p", StateOptions::default().with_time_after(june))
            .await
            .unwrap();
        assert!(!first.is_incremental());
        assert_eq!(first.since(), Some(june));
        first.close().await.unwrap();

        let forced = SubtaskStateManager::open(&run, "p", StateOptions::default().full_sync(true))
            .await
            .unwrap();
        assert!(!forced.is_incremental());
        assert_eq!(forced.since(), Some(june));

        let requested = SubtaskStateManager::open(
            &run,
            "p",
            StateOptions::default().full_sync(true).with_time_after(july),
        )
        .await
        .unwrap();
        assert_eq!(requested.since(), Some(july));
    }

    #[tokio::test]
    async fn test_dropping_time_after_stays_incremental() {
        let run = run_context().await;
        let june = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let first = SubtaskStateManager::open(&run, "p", StateOptions::default().with_time_after(june))
            .await
            .unwrap();
        let first_started = first.started_at();
        first.close().await.unwrap();

        let next = SubtaskStateManager::open(&run, "p", StateOptions::default())
            .await
            .unwrap();
        assert!(next.is_incremental());
        assert_eq!(
            next.since().unwrap().timestamp_millis(),
            first_started.timestamp_millis()
        );
    }

    #[tokio::test]
    async fn test_empty_stored_config_is_not_a_change() {
        let run = run_context().await;
        SubtaskStateManager::open(&run, "p", StateOptions::default())
            .await
            .unwrap()
            .close()
            .await
            .unwrap();

        let options = StateOptions::default().with_config(json!({"issueTypes": ["bug"]}));
        let with_config = SubtaskStateManager::open(&run, "p", options.clone()).await.unwrap();
        assert!(with_config.is_incremental());

        sqlx::query("UPDATE _devlake_subtask_states SET prev_config = '' WHERE params = 'p'")
            .execute(run.db().pool())
            .await
            .unwrap();
        let after_blank = SubtaskStateManager::open(&run, "p", options).await.unwrap();
        assert!(after_blank.is_incremental());
    }

    #[tokio::test]
    async fn test_incremental_close_keeps_stored_time_after() {
        let run = run_context().await;
        let june = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let july = Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap();
        SubtaskStateManager::open(&run, "p", StateOptions::default().with_time_after(june))
            .await
            .unwrap()
            .close()
            .await
            .unwrap();
        let stored = stored_time_after(&run, "p").await;
        assert_eq!(stored.as_deref(), Some("2024-06-01T00:00:00.000Z"));

        let second = SubtaskStateManager::open(&run, "p", StateOptions::default())
            .await
            .unwrap();
        assert!(second.is_incremental());
        second.close().await.unwrap();
        assert_eq!(stored_time_after(&run, "p").await, stored);

        let later = SubtaskStateManager::open(&run, "p", StateOptions::default().with_time_after(july))
            .await
            .unwrap();
        assert!(later.is_incremental());
        later.close().await.unwrap();
        assert_eq!(stored_time_after(&run, "p").await, stored);

        let third = SubtaskStateManager::open(&run, "p", StateOptions::default().full_sync(true))
            .await
            .unwrap();
        assert_eq!(third.since(), Some(june));
        third.close().await.unwrap();
        assert_eq!(stored_time_after(&run, "p").await, stored);
    }

    // ==================== Since Resolution Tests ====================

    async fn seeded_tool_table(db: &Database) {
        sqlx::query("CREATE TABLE _tool_github_issues (connection_id INTEGER, repo_id INTEGER, updated_at TEXT)")
            .execute(db.pool())
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO _tool_github_issues VALUES \
             (1, 10, '2024-03-01T08:00:00Z'), (1, 10, '2024-03-05T09:30:00Z'), (1, 11, '2024-04-01T00:00:00Z'), \
             (2, 10, '2024-05-01T00:00:00Z')",
        )
        .execute(db.pool())
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_resolve_since_explicit_wins() {
        let db = Database::new_in_memory().await.unwrap();
        seeded_tool_table(&db).await;
        let explicit = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let since = resolve_since(&db, Some(explicit), "_tool_github_issues", &[])
            .await
            .unwrap();
        assert_eq!(since, Some(explicit));
    }

    #[tokio::test]
    async fn test_resolve_since_uses_scoped_max_updated_at() {
        let db = Database::new_in_memory().await.unwrap();
        seeded_tool_table(&db).await;
        let since = resolve_since(
            &db,
            None,
            "_tool_github_issues",
            &[("connection_id", SqlValue::Int(1)), ("repo_id", SqlValue::Int(10))],
        )
        .await
        .unwrap();
        assert_eq!(since, Some(Utc.with_ymd_and_hms(2024, 3, 5, 9, 30, 0).unwrap()));

        let empty_scope = resolve_since(&db, None, "_tool_github_issues", &[("connection_id", SqlValue::Int(9))])
            .await
            .unwrap();
        assert!(empty_scope.is_none());
    }

    #[tokio::test]
    async fn test_resolve_since_missing_table_means_full() {
        let db = Database::new_in_memory().await.unwrap();
        let since = resolve_since(&db, None, "_tool_missing", &[]).await.unwrap();
        assert!(since.is_none());
    }

    #[test]
    fn test_parse_timestamp_accepts_sqlite_format() {
        let at = parse_timestamp("2024-03-05 09:30:00").unwrap();
        assert_eq!(at, Utc.with_ymd_and_hms(2024, 3, 5, 9, 30, 0).unwrap());
        assert!(parse_timestamp("yesterday").is_err());
    }
}
