//! End-to-end tests for a plugin task: collect, extract and convert.
//!
//! A small GitHub-like plugin is run by `TaskRunner` against a mock API and a
//! file-backed database, checking the data that lands in each layer and the
//! task bookkeeping rows.

use std::sync::Arc;

use async_trait::async_trait;
use devflow_core::api::{ApiClient, AsyncApiClient, RequestData, page_query};
use devflow_core::collector::{ApiCollector, ApiCollectorArgs, RawDataSubTaskArgs};
use devflow_core::converter::{ConvertFn, DataConverter, DataConverterArgs};
use devflow_core::extractor::{ApiExtractor, ApiExtractorArgs, ExtractFn};
use devflow_core::models::{
    Column, DomainIdGenerator, Provenance, RawData, RawDataOrigin, Record, SqlValue,
};
use devflow_core::state::{StateOptions, SubtaskStateManager};
use devflow_core::subtask::{PluginTask, RunContext, SubTaskContext, SubTaskMeta, TaskRunner, TaskStatus};
use devflow_core::{Database, ErrorKind, EtlError, SelectQuery, TaskOptions};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sqlx::FromRow;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

mod support;
use support::socket_guard::start_mock_server_or_skip;
use support::{init_tracing, setup_test_db, test_config};

type TestResult = Result<(), Box<dyn std::error::Error>>;

// ==================== Plugin Under Test ====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RepoScope {
    owner: String,
    repo: String,
}

struct GithubTaskData {
    options: TaskOptions<RepoScope>,
    client: AsyncApiClient,
    raw: RawDataSubTaskArgs,
}

struct GithubPlugin {
    endpoint: String,
}

#[async_trait]
impl PluginTask for GithubPlugin {
    type Data = GithubTaskData;

    fn name(&self) -> &'static str {
        "github"
    }

    fn subtask_metas(&self) -> Vec<SubTaskMeta<GithubTaskData>> {
        vec![
            SubTaskMeta::new("collectIssues", collect_issues).domain_types(&["TICKET"]),
            SubTaskMeta::new("extractIssues", extract_issues).domain_types(&["TICKET"]),
            SubTaskMeta::new("convertIssues", convert_issues).domain_types(&["TICKET"]),
        ]
    }

    async fn prepare_task_data(&self, run: &RunContext, options: &Value) -> Result<GithubTaskData, EtlError> {
        let options = TaskOptions::<RepoScope>::decode(options.clone())?;
        let client = ApiClient::new(&self.endpoint, run.config())?;
        let client = AsyncApiClient::new(
            client,
            run.config(),
            options.concurrency_or(run.config()),
            run.cancel_token().clone(),
        )?;
        let raw = RawDataSubTaskArgs::new(
            "github_api_issues",
            &json!({
                "connectionId": options.connection_id,
                "owner": options.scope.owner,
                "repo": options.scope.repo,
            }),
        )?;
        Ok(GithubTaskData { options, client, raw })
    }
}

fn collect_issues(ctx: &SubTaskContext<GithubTaskData>) -> BoxFuture<'_, Result<(), EtlError>> {
    Box::pin(async move {
        let data = ctx.data();
        let state = SubtaskStateManager::open(ctx.run(), data.raw.params(), StateOptions::default()).await?;
        let since = state.since();
        let paging = page_query("page", "per_page");
        let args = ApiCollectorArgs::new(data.raw.clone(), data.client.clone(), "repos/{owner}/{repo}/issues")
            .with_page_size(data.options.page_size_or(ctx.run().config()))
            .with_concurrency(data.options.concurrency_or(ctx.run().config()))
            .incremental(state.is_incremental())
            .with_query(Arc::new(
                move |request: &RequestData<'_>| -> Result<Vec<(String, String)>, EtlError> {
                    let mut query = paging(request)?;
                    if let Some(since) = since {
                        query.push(("since".to_string(), since.to_rfc3339()));
                    }
                    Ok(query)
                },
            ));
        ApiCollector::new(args)?.execute(ctx.run()).await?;
        state.close().await
    })
}

#[derive(Debug, Deserialize)]
struct ApiIssue {
    number: i64,
    title: String,
    state: String,
}

#[derive(Debug, Default)]
struct ToolIssue {
    connection_id: u64,
    number: i64,
    title: String,
    state: String,
    origin: RawDataOrigin,
}

impl Provenance for ToolIssue {
    fn origin(&self) -> &RawDataOrigin {
        &self.origin
    }
    fn origin_mut(&mut self) -> &mut RawDataOrigin {
        &mut self.origin
    }
}

impl Record for ToolIssue {
    fn table(&self) -> &'static str {
        "_tool_github_issues"
    }
    fn columns(&self) -> &'static [Column] {
        const COLUMNS: &[Column] = &[
            Column::key("connection_id", "INTEGER"),
            Column::key("number", "INTEGER"),
            Column::field("title", "TEXT"),
            Column::field("state", "TEXT"),
        ];
        COLUMNS
    }
    fn values(&self) -> Vec<SqlValue> {
        vec![
            self.connection_id.into(),
            self.number.into(),
            self.title.clone().into(),
            self.state.clone().into(),
        ]
    }
}

fn extract_issues(ctx: &SubTaskContext<GithubTaskData>) -> BoxFuture<'_, Result<(), EtlError>> {
    Box::pin(async move {
        let connection_id = ctx.data().options.connection_id;
        let extract: ExtractFn = Arc::new(move |row: &RawData| -> Result<Vec<Box<dyn Record>>, EtlError> {
            let issue: ApiIssue = row.parse()?;
            Ok(vec![Box::new(ToolIssue {
                connection_id,
                number: issue.number,
                title: issue.title,
                state: issue.state,
                ..ToolIssue::default()
            })])
        });
        ApiExtractor::new(ApiExtractorArgs::new(ctx.data().raw.clone(), extract))
            .execute(ctx.run())
            .await?;
        Ok(())
    })
}

#[derive(Debug, FromRow)]
struct ToolIssueRow {
    connection_id: i64,
    number: i64,
    title: String,
    state: String,
    #[sqlx(flatten)]
    origin: RawDataOrigin,
}

impl Provenance for ToolIssueRow {
    fn origin(&self) -> &RawDataOrigin {
        &self.origin
    }
    fn origin_mut(&mut self) -> &mut RawDataOrigin {
        &mut self.origin
    }
}

#[derive(Debug, Default)]
struct Issue {
    id: String,
    title: String,
    status: String,
    origin: RawDataOrigin,
}

impl Provenance for Issue {
    fn origin(&self) -> &RawDataOrigin {
        &self.origin
    }
    fn origin_mut(&mut self) -> &mut RawDataOrigin {
        &mut self.origin
    }
}

impl Record for Issue {
    fn table(&self) -> &'static str {
        "issues"
    }
    fn columns(&self) -> &'static [Column] {
        const COLUMNS: &[Column] = &[
            Column::key("id", "TEXT"),
            Column::field("title", "TEXT"),
            Column::field("status", "TEXT"),
        ];
        COLUMNS
    }
    fn values(&self) -> Vec<SqlValue> {
        vec![self.id.clone().into(), self.title.clone().into(), self.status.clone().into()]
    }
}

fn convert_issues(ctx: &SubTaskContext<GithubTaskData>) -> BoxFuture<'_, Result<(), EtlError>> {
    Box::pin(async move {
        let ids = DomainIdGenerator::new("github", "GithubIssue");
        let convert: ConvertFn<ToolIssueRow> =
            Arc::new(move |row: &ToolIssueRow| -> Result<Vec<Box<dyn Record>>, EtlError> {
                let status = if row.state == "closed" { "DONE" } else { "TODO" };
                Ok(vec![Box::new(Issue {
                    id: ids.generate(&[&row.connection_id, &row.number]),
                    title: row.title.clone(),
                    status: status.to_string(),
                    ..Issue::default()
                })])
            });
        let query = SelectQuery::from("_tool_github_issues")
            .select(&[
                "connection_id",
                "number",
                "title",
                "state",
                "_raw_data_params",
                "_raw_data_table",
                "_raw_data_id",
                "_raw_data_remark",
            ])
            .where_clause(
                "connection_id = ?",
                vec![SqlValue::from(ctx.data().options.connection_id)],
            )
            .order_by("number");
        DataConverter::new(DataConverterArgs::new(ctx.data().raw.clone(), query, convert))
            .execute(ctx.run())
            .await?;
        Ok(())
    })
}

// ==================== Helpers ====================

fn task_options() -> Value {
    json!({
        "connectionId": 1,
        "owner": "apache",
        "repo": "devlake",
        "pageSize": 2,
        "concurrency": 1
    })
}

async fn mount_issue_pages(server: &MockServer) {
    let pages = [
        json!([
            {"number": 1, "title": "crash on start", "state": "open"},
            {"number": 2, "title": "typo in docs", "state": "closed"}
        ]),
        json!([]),
    ];
    for (page, body) in pages.into_iter().enumerate() {
        Mock::given(method("GET"))
            .and(path("/repos/apache/devlake/issues"))
            .and(query_param("page", (page + 1).to_string()))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
    }
}

async fn subtask_rows(db: &Database, task_id: i64) -> Result<Vec<(String, String)>, sqlx::Error> {
    sqlx::query_as("SELECT name, status FROM _devlake_subtasks WHERE task_id = ? ORDER BY number")
        .bind(task_id)
        .fetch_all(db.pool())
        .await
}

// ==================== Pipeline Tests ====================

#[tokio::test]
async fn test_pipeline_moves_data_through_every_layer() -> TestResult {
    init_tracing();
    let Some(server) = start_mock_server_or_skip().await else {
        return Ok(());
    };
    mount_issue_pages(&server).await;
    let (db, _dir) = setup_test_db().await?;
    let plugin = GithubPlugin { endpoint: server.uri() };

    let report = TaskRunner::new(db.clone(), test_config())
        .run(&plugin, task_options(), CancellationToken::new())
        .await?;

    assert!(report.is_success(), "task failed: {:?}", report.error_chain());
    assert_eq!(report.subtasks.len(), 3);
    assert_eq!(db.count_rows("_raw_github_api_issues").await?, 2);
    assert_eq!(db.count_rows("_tool_github_issues").await?, 2);

    let issues: Vec<(String, String, String)> =
        sqlx::query_as("SELECT id, title, status FROM issues ORDER BY id")
            .fetch_all(db.pool())
            .await?;
    assert_eq!(
        issues,
        vec![
            ("github:GithubIssue:1:1".to_string(), "crash on start".to_string(), "TODO".to_string()),
            ("github:GithubIssue:1:2".to_string(), "typo in docs".to_string(), "DONE".to_string()),
        ]
    );

    // Every domain row points back at the raw row it came from.
    let (orphans,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM issues i LEFT JOIN _raw_github_api_issues r ON r.id = i._raw_data_id \
         WHERE r.id IS NULL OR i._raw_data_table != '_raw_github_api_issues'",
    )
    .fetch_one(db.pool())
    .await?;
    assert_eq!(orphans, 0);

    let (status,): (String,) = sqlx::query_as("SELECT status FROM _devlake_tasks WHERE id = ?")
        .bind(report.task_id)
        .fetch_one(db.pool())
        .await?;
    assert_eq!(status, TaskStatus::Completed.as_str());
    Ok(())
}

#[tokio::test]
async fn test_rerun_is_incremental_and_does_not_duplicate() -> TestResult {
    let Some(server) = start_mock_server_or_skip().await else {
        return Ok(());
    };
    mount_issue_pages(&server).await;
    let (db, _dir) = setup_test_db().await?;
    let plugin = GithubPlugin { endpoint: server.uri() };
    let runner = TaskRunner::new(db.clone(), test_config());

    let first = runner.run(&plugin, task_options(), CancellationToken::new()).await?;
    let second = runner.run(&plugin, task_options(), CancellationToken::new()).await?;
    assert!(first.is_success() && second.is_success());

    // The second collection appends raw rows instead of clearing them.
    assert_eq!(db.count_rows("_raw_github_api_issues").await?, 4);
    assert_eq!(db.count_rows("_tool_github_issues").await?, 2);
    assert_eq!(db.count_rows("issues").await?, 2);

    let requests = server.received_requests().await.unwrap_or_default();
    let with_since = requests
        .iter()
        .filter(|request| request.url.query_pairs().any(|(key, _)| key == "since"))
        .count();
    assert_eq!(with_since, 2, "only the second run should send since");
    Ok(())
}

#[tokio::test]
async fn test_failed_subtask_halts_task() -> TestResult {
    init_tracing();
    let Some(server) = start_mock_server_or_skip().await else {
        return Ok(());
    };
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;
    let (db, _dir) = setup_test_db().await?;
    let plugin = GithubPlugin { endpoint: server.uri() };

    let report = TaskRunner::new(db.clone(), test_config())
        .run(&plugin, task_options(), CancellationToken::new())
        .await?;

    assert_eq!(report.status, TaskStatus::Failed);
    assert_eq!(report.failed_subtask.as_deref(), Some("collectIssues"));
    let error = report.error.as_ref().ok_or("missing task error")?;
    assert_eq!(error.root_kind(), ErrorKind::HttpStatus(500));
    assert_eq!(
        subtask_rows(&db, report.task_id).await?,
        vec![
            ("collectIssues".to_string(), "FAILED".to_string()),
            ("extractIssues".to_string(), "PENDING".to_string()),
            ("convertIssues".to_string(), "PENDING".to_string()),
        ]
    );

    let (status, error_name, failed): (String, String, String) = sqlx::query_as(
        "SELECT status, error_name, failed_sub_task FROM _devlake_tasks WHERE id = ?",
    )
    .bind(report.task_id)
    .fetch_one(db.pool())
    .await?;
    assert_eq!(status, "TASK_FAILED");
    assert_eq!(error_name, "http_status_500");
    assert_eq!(failed, "collectIssues");
    Ok(())
}

#[tokio::test]
async fn test_selected_subtask_runs_alone() -> TestResult {
    let Some(server) = start_mock_server_or_skip().await else {
        return Ok(());
    };
    mount_issue_pages(&server).await;
    let (db, _dir) = setup_test_db().await?;
    let plugin = GithubPlugin { endpoint: server.uri() };
    let mut options = task_options();
    options["subtasks"] = json!(["collectIssues"]);

    let report = TaskRunner::new(db.clone(), test_config())
        .run(&plugin, options, CancellationToken::new())
        .await?;

    assert!(report.is_success());
    assert_eq!(subtask_rows(&db, report.task_id).await?.len(), 1);
    assert!(!db.table_exists("_tool_github_issues").await?);
    Ok(())
}

#[tokio::test]
async fn test_cancelled_task_sends_no_request() -> TestResult {
    let Some(server) = start_mock_server_or_skip().await else {
        return Ok(());
    };
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(0)
        .mount(&server)
        .await;
    let (db, _dir) = setup_test_db().await?;
    let plugin = GithubPlugin { endpoint: server.uri() };
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = TaskRunner::new(db.clone(), test_config())
        .run(&plugin, task_options(), cancel)
        .await?;

    assert_eq!(report.status, TaskStatus::Failed);
    assert!(report.error.as_ref().is_some_and(EtlError::is_cancelled));
    server.verify().await;
    Ok(())
}

#[tokio::test]
async fn test_invalid_options_fail_before_any_subtask() -> TestResult {
    let (db, _dir) = setup_test_db().await?;
    let plugin = GithubPlugin {
        endpoint: "http://127.0.0.1:9/".to_string(),
    };

    let report = TaskRunner::new(db.clone(), test_config())
        .run(&plugin, json!({"connectionId": 0, "owner": "apache", "repo": "devlake"}), CancellationToken::new())
        .await?;

    assert_eq!(report.status, TaskStatus::Failed);
    assert!(report.subtasks.is_empty());
    assert_eq!(
        report.error.as_ref().map(EtlError::root_kind),
        Some(ErrorKind::BadInput)
    );
    Ok(())
}
