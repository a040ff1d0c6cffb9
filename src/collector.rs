//! Paginated API collection into raw tables.
//!
//! [`ApiCollector`] drives a URL template across pages and persists every
//! parsed JSON fragment as a row of a `_raw_<plugin>_<entity>` table, tagged
//! with the scope params string. Pagination mode is picked from the
//! arguments:
//!
//! | Arguments | Mode |
//! |-----------|------|
//! | `page_size == 0` | a single request (one per input item with an input stream) |
//! | `next_page` set | sequential: each request is built from the previous response |
//! | `total_pages` set | page 1, then pages `2..=total` concurrently |
//! | otherwise | `concurrency` lanes claim pages until one comes back empty |
//!
//! With an input stream, every input item is paginated independently and
//! items are processed concurrently under the same client.
//!
//! In full mode the raw rows of the same scope are deleted before
//! collecting; incremental runs append.
//!
//! # Example
//!
//! ```no_run
//! use devflow_core::api::{ApiClient, AsyncApiClient, page_query};
//! use devflow_core::collector::{ApiCollector, ApiCollectorArgs, RawDataSubTaskArgs, parse_json_array};
//! use devflow_core::subtask::RunContext;
//! use devflow_core::EtlError;
//! use serde_json::json;
//!
//! # async fn example(run: &RunContext) -> Result<(), EtlError> {
//! let client = ApiClient::new("https://api.github.com/", run.config())?;
//! let client = AsyncApiClient::new(client, run.config(), 10, run.cancel_token().clone())?;
//! let raw = RawDataSubTaskArgs::new(
//!     "github_api_issues",
//!     &json!({"connectionId": 1, "owner": "apache", "repo": "incubator-devlake"}),
//! )?;
//!
//! let args = ApiCollectorArgs::new(raw, client, "repos/{owner}/{repo}/issues")
//!     .with_query(page_query("page", "per_page"))
//!     .with_parser(parse_json_array());
//! let summary = ApiCollector::new(args)?.execute(run).await?;
//! println!("saved {} raw rows", summary.items);
//! # Ok(())
//! # }
//! ```

use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use futures_util::stream::{self, Stream, StreamExt};
use reqwest::Method;
use serde::Serialize;
use serde_json::Value;
use sqlx::{QueryBuilder, Sqlite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::api::pagination::scalar_text;
use crate::api::{
    ApiRequest, ApiResponse, AsyncApiClient, BodyFn, NextPageFn, Pager, QueryFn, RequestData,
    TotalPagesFn, render_url_template,
};
use crate::config::{DEFAULT_PAGE_SIZE, MAX_CONCURRENCY, MIN_CONCURRENCY};
use crate::db::{Database, SelectQuery, query::row_to_json, quote_ident};
use crate::error::{ErrorKind, EtlError};
use crate::models::raw_table_ddl;
use crate::subtask::RunContext;

/// Upstream rows driving fan-out requests.
///
/// `Sync` so that collector arguments can be shared by concurrent lanes.
pub type InputStream = Pin<Box<dyn Stream<Item = Result<Value, EtlError>> + Send + Sync>>;

/// Turns one response into the fragments to persist.
pub type ResponseParser = Arc<dyn Fn(&ApiResponse) -> Result<ParsedPage, EtlError> + Send + Sync>;

/// Raw table and scope shared by a collector and its extractor.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDataSubTaskArgs {
    table: String,
    params: String,
    params_value: Value,
}

impl RawDataSubTaskArgs {
    /// Creates args for `table` (prefixed with `_raw_` when missing) and the
    /// scope `params`, which must serialize to a JSON object.
    ///
    /// The params string is `key=value` pairs sorted by key and joined by `,`.
    ///
    /// # Errors
    ///
    /// Returns [`EtlError::BadInput`] for an invalid table name or params
    /// that are not an object.
    pub fn new(table: &str, params: &impl Serialize) -> Result<Self, EtlError> {
        let table = if table.starts_with("_raw_") {
            table.to_string()
        } else {
            format!("_raw_{table}")
        };
        quote_ident(&table)?;

        let params_value = serde_json::to_value(params)
            .map_err(|e| EtlError::bad_input_from("raw data params must serialize", e))?;
        let Value::Object(map) = &params_value else {
            return Err(EtlError::bad_input("raw data params must be a JSON object"));
        };
        let mut pairs: Vec<(&String, &Value)> = map.iter().collect();
        pairs.sort_by(|a, b| a.0.cmp(b.0));
        let params = pairs
            .into_iter()
            .map(|(key, value)| {
                let text = scalar_text(value).unwrap_or_else(|| value.to_string());
                format!("{key}={text}")
            })
            .collect::<Vec<_>>()
            .join(",");

        Ok(Self {
            table,
            params,
            params_value,
        })
    }

    /// Raw table name, e.g. `_raw_github_api_issues`.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Scope discriminator stored in every raw row.
    #[must_use]
    pub fn params(&self) -> &str {
        &self.params
    }

    /// Scope as JSON, used for URL template variables.
    #[must_use]
    pub fn params_value(&self) -> &Value {
        &self.params_value
    }
}

/// Fragments parsed from one response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedPage {
    pub items: Vec<Value>,
    /// Stop paginating after persisting these items.
    pub finish: bool,
}

impl ParsedPage {
    #[must_use]
    pub fn new(items: Vec<Value>) -> Self {
        Self {
            items,
            finish: false,
        }
    }

    /// Items of the last page.
    #[must_use]
    pub fn finish(items: Vec<Value>) -> Self {
        Self {
            items,
            finish: true,
        }
    }
}

/// Parser for bodies that are a JSON array of fragments.
#[must_use]
pub fn parse_json_array() -> ResponseParser {
    Arc::new(|response: &ApiResponse| -> Result<ParsedPage, EtlError> {
        if response.body().is_empty() {
            return Ok(ParsedPage::default());
        }
        match response.json::<Value>()? {
            Value::Array(items) => Ok(ParsedPage::new(items)),
            Value::Null => Ok(ParsedPage::default()),
            other => Err(EtlError::bad_input(format!(
                "expected a JSON array from {}, got {}",
                response.url(),
                json_type(&other)
            ))),
        }
    })
}

/// Parser for bodies wrapping the array under `key`, e.g. `{"values": [...]}`.
#[must_use]
pub fn parse_json_at(key: &'static str) -> ResponseParser {
    Arc::new(move |response: &ApiResponse| -> Result<ParsedPage, EtlError> {
        match response.json::<Value>()? {
            Value::Object(mut map) => match map.remove(key) {
                Some(Value::Array(items)) => Ok(ParsedPage::new(items)),
                None | Some(Value::Null) => Ok(ParsedPage::default()),
                Some(other) => Err(EtlError::bad_input(format!(
                    "expected an array under '{key}' from {}, got {}",
                    response.url(),
                    json_type(&other)
                ))),
            },
            other => Err(EtlError::bad_input(format!(
                "expected a JSON object from {}, got {}",
                response.url(),
                json_type(&other)
            ))),
        }
    })
}

/// Parser for APIs returning one object per call.
#[must_use]
pub fn parse_json_object() -> ResponseParser {
    Arc::new(|response: &ApiResponse| -> Result<ParsedPage, EtlError> {
        Ok(ParsedPage::finish(vec![response.json::<Value>()?]))
    })
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Everything an [`ApiCollector`] needs.
pub struct ApiCollectorArgs {
    pub raw: RawDataSubTaskArgs,
    pub client: AsyncApiClient,
    pub url_template: String,
    pub method: Method,
    pub query: Option<QueryFn>,
    pub body: Option<BodyFn>,
    pub parser: ResponseParser,
    /// Items per page; 0 means a single request per input item.
    pub page_size: u32,
    /// Pages (or input items) worked on at the same time.
    pub concurrency: usize,
    pub incremental: bool,
    pub total_pages: Option<TotalPagesFn>,
    pub next_page: Option<NextPageFn>,
    pub input: Option<InputStream>,
    /// Minimum spacing between requests for this collection.
    pub min_tick_interval: Option<Duration>,
}

impl ApiCollectorArgs {
    /// GET collection of JSON arrays with default page size and the client's
    /// concurrency.
    #[must_use]
    pub fn new(raw: RawDataSubTaskArgs, client: AsyncApiClient, url_template: impl Into<String>) -> Self {
        let concurrency = client.concurrency();
        Self {
            raw,
            client,
            url_template: url_template.into(),
            method: Method::GET,
            query: None,
            body: None,
            parser: parse_json_array(),
            page_size: DEFAULT_PAGE_SIZE,
            concurrency,
            incremental: false,
            total_pages: None,
            next_page: None,
            input: None,
            min_tick_interval: None,
        }
    }

    #[must_use]
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    #[must_use]
    pub fn with_query(mut self, query: QueryFn) -> Self {
        self.query = Some(query);
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: BodyFn) -> Self {
        self.body = Some(body);
        self
    }

    #[must_use]
    pub fn with_parser(mut self, parser: ResponseParser) -> Self {
        self.parser = parser;
        self
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    #[must_use]
    pub fn incremental(mut self, incremental: bool) -> Self {
        self.incremental = incremental;
        self
    }

    #[must_use]
    pub fn with_total_pages(mut self, total_pages: TotalPagesFn) -> Self {
        self.total_pages = Some(total_pages);
        self
    }

    #[must_use]
    pub fn with_next_page(mut self, next_page: NextPageFn) -> Self {
        self.next_page = Some(next_page);
        self
    }

    #[must_use]
    pub fn with_input(mut self, input: InputStream) -> Self {
        self.input = Some(input);
        self
    }

    #[must_use]
    pub fn with_min_tick_interval(mut self, interval: Duration) -> Self {
        self.min_tick_interval = Some(interval);
        self
    }
}

/// Counters of one collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectSummary {
    /// Requests that returned a usable response.
    pub requests: u64,
    /// Raw rows written.
    pub items: u64,
}

/// Collects API pages into a raw table.
pub struct ApiCollector {
    args: ApiCollectorArgs,
}

impl ApiCollector {
    /// Validates the arguments.
    ///
    /// # Errors
    ///
    /// Returns [`EtlError::BadInput`] for an empty URL template, concurrency
    /// outside 1..=100, or both `total_pages` and `next_page` set.
    pub fn new(args: ApiCollectorArgs) -> Result<Self, EtlError> {
        if args.url_template.trim().is_empty() {
            return Err(EtlError::bad_input("url template is required"));
        }
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&args.concurrency) {
            return Err(EtlError::bad_input(format!(
                "invalid collector concurrency {}: must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}",
                args.concurrency
            )));
        }
        if args.total_pages.is_some() && args.next_page.is_some() {
            return Err(EtlError::bad_input(
                "total_pages and next_page cannot be combined",
            ));
        }
        Ok(Self { args })
    }

    /// Runs the collection.
    ///
    /// Page failures stop only their own lane; the first of them is returned
    /// once the other lanes are done. An authentication failure cancels the
    /// whole collection.
    ///
    /// # Errors
    ///
    /// Returns [`EtlError::Cancelled`] when the run is cancelled, the first
    /// page error, or a database error.
    #[instrument(skip(self, run), fields(table = %self.args.raw.table(), params = %self.args.raw.params()))]
    pub async fn execute(mut self, run: &RunContext) -> Result<CollectSummary, EtlError> {
        run.check_cancelled()?;
        let quoted = quote_ident(self.args.raw.table())?;
        sqlx::query(&raw_table_ddl(&quoted)).execute(run.db().pool()).await?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS \"idx{}_params\" ON {quoted} (params)",
            self.args.raw.table()
        ))
        .execute(run.db().pool())
        .await?;

        if self.args.incremental {
            info!("incremental collection, keeping previous raw rows");
        } else {
            let deleted = sqlx::query(&format!("DELETE FROM {quoted} WHERE params = ?"))
                .bind(self.args.raw.params())
                .execute(run.db().pool())
                .await?
                .rows_affected();
            debug!(deleted, "cleared raw rows of previous full collection");
        }

        let limiter = self.args.client.limiter().clone();
        let previous_tick = limiter.min_interval().await;
        if let Some(tick) = self.args.min_tick_interval {
            limiter
                .set_min_interval(Some(previous_tick.map_or(tick, |p| p.max(tick))))
                .await;
        }

        let input = self.args.input.take();
        let collection = Collection {
            args: &self.args,
            run,
            quoted,
            cancel: run.cancel_token().child_token(),
            failure: Mutex::new(None),
            requests: AtomicU64::new(0),
            items: AtomicU64::new(0),
        };

        match input {
            Some(input) => {
                let cancel = collection.cancel.clone();
                let collection = &collection;
                input
                    .take_while(move |_| std::future::ready(!cancel.is_cancelled()))
                    .map(|item| async move {
                        let item = item?;
                        collection.collect_scope(Some(&item)).await;
                        Ok::<(), EtlError>(())
                    })
                    .buffer_unordered(self.args.concurrency)
                    .for_each(|result| {
                        if let Err(error) = result {
                            collection.record(error);
                        }
                        std::future::ready(())
                    })
                    .await;
            }
            None => collection.collect_scope(None).await,
        }

        if self.args.min_tick_interval.is_some() {
            limiter.set_min_interval(previous_tick).await;
        }

        let summary = CollectSummary {
            requests: collection.requests.load(Ordering::SeqCst),
            items: collection.items.load(Ordering::SeqCst),
        };
        if let Some(error) = collection.into_failure() {
            warn!(requests = summary.requests, items = summary.items, %error, "collection failed");
            return Err(error);
        }
        run.check_cancelled()?;
        info!(requests = summary.requests, items = summary.items, "collection finished");
        Ok(summary)
    }
}

/// State of one `execute` call.
struct Collection<'a> {
    args: &'a ApiCollectorArgs,
    run: &'a RunContext,
    quoted: String,
    cancel: CancellationToken,
    failure: Mutex<Option<EtlError>>,
    requests: AtomicU64,
    items: AtomicU64,
}

impl Collection<'_> {
    /// Keeps the most significant failure; authentication failures cancel
    /// every lane.
    fn record(&self, error: EtlError) {
        let kind = error.root_kind();
        if kind == ErrorKind::Unauthorized {
            self.cancel.cancel();
        }
        let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        let replace = match failure.as_ref() {
            None => true,
            Some(current) => {
                let current_kind = current.root_kind();
                (kind == ErrorKind::Unauthorized && current_kind != ErrorKind::Unauthorized)
                    || (current_kind == ErrorKind::Cancelled && kind != ErrorKind::Cancelled)
            }
        };
        if replace {
            *failure = Some(error);
        }
    }

    fn into_failure(self) -> Option<EtlError> {
        self.failure
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Paginates one scope (the whole run, or one input item).
    async fn collect_scope(&self, input: Option<&Value>) {
        let result = if self.args.page_size == 0 {
            self.fetch_and_save(Pager::new(1, 0), input, None).await.map(|_| ())
        } else if self.args.next_page.is_some() {
            self.collect_sequential(input).await
        } else if self.args.total_pages.is_some() && self.run.config().prefer_total_pages_header {
            self.collect_determined(input).await
        } else {
            self.collect_undetermined(input, 1).await;
            Ok(())
        };
        if let Err(error) = result {
            self.record(error);
        }
    }

    async fn collect_sequential(&self, input: Option<&Value>) -> Result<(), EtlError> {
        let Some(next_page) = &self.args.next_page else {
            return Ok(());
        };
        let mut pager = Pager::new(1, self.args.page_size);
        let mut custom: Option<Value> = None;
        loop {
            let Some((response, page)) = self.fetch_and_save(pager, input, custom.as_ref()).await? else {
                return Ok(());
            };
            if page.finish || page.items.len() < self.args.page_size as usize {
                return Ok(());
            }
            let mut data = RequestData::new(pager, self.args.raw.params_value());
            data.input = input;
            data.custom_data = custom.as_ref();
            custom = next_page(&data, &response)?;
            if custom.is_none() {
                return Ok(());
            }
            pager = pager.next();
        }
    }

    async fn collect_determined(&self, input: Option<&Value>) -> Result<(), EtlError> {
        let Some(total_pages) = &self.args.total_pages else {
            return Ok(());
        };
        let first = Pager::new(1, self.args.page_size);
        let Some((response, page)) = self.fetch_and_save(first, input, None).await? else {
            return Ok(());
        };
        if page.finish || page.items.is_empty() {
            return Ok(());
        }
        let Some(total) = total_pages(&response)? else {
            debug!("no total pages signal, falling back to empty-page detection");
            self.collect_undetermined(input, 2).await;
            return Ok(());
        };
        debug!(total, "collecting determined pages");

        stream::iter(2..=total)
            .map(|page| self.fetch_and_save(Pager::new(page, self.args.page_size), input, None))
            .buffer_unordered(self.args.concurrency)
            .for_each(|result| {
                if let Err(error) = result {
                    self.record(error);
                }
                std::future::ready(())
            })
            .await;
        Ok(())
    }

    /// `concurrency` lanes claim pages from a shared counter until a page
    /// comes back empty, short or finished.
    async fn collect_undetermined(&self, input: Option<&Value>, start_page: u32) {
        let next = AtomicU32::new(start_page);
        let last = AtomicU32::new(u32::MAX);
        let lanes = (0..self.args.concurrency).map(|_| async {
            loop {
                let page = next.fetch_add(1, Ordering::SeqCst);
                if page > last.load(Ordering::SeqCst) {
                    return;
                }
                match self
                    .fetch_and_save(Pager::new(page, self.args.page_size), input, None)
                    .await
                {
                    Ok(Some((_, parsed)))
                        if !parsed.finish
                            && parsed.items.len() >= self.args.page_size as usize => {}
                    Ok(_) => {
                        last.fetch_min(page, Ordering::SeqCst);
                        return;
                    }
                    Err(error) => {
                        self.record(error);
                        return;
                    }
                }
            }
        });
        join_all(lanes).await;
    }

    /// Requests one page and persists its fragments.
    ///
    /// `Ok(None)` means the response was ignored by the client's hook.
    async fn fetch_and_save(
        &self,
        pager: Pager,
        input: Option<&Value>,
        custom: Option<&Value>,
    ) -> Result<Option<(ApiResponse, ParsedPage)>, EtlError> {
        if self.cancel.is_cancelled() {
            return Err(EtlError::Cancelled);
        }
        let mut data = RequestData::new(pager, self.args.raw.params_value());
        data.input = input;
        data.custom_data = custom;

        let path = render_url_template(&self.args.url_template, &data)?;
        let query = match &self.args.query {
            Some(build) => build(&data)?,
            None => Vec::new(),
        };
        let body = match &self.args.body {
            Some(build) => build(&data)?,
            None => None,
        };
        let request = ApiRequest {
            method: self.args.method.clone(),
            path,
            query,
            body,
        };

        let Some(response) = self.args.client.send(&request).await? else {
            debug!(page = pager.page, "page ignored");
            return Ok(None);
        };
        self.requests.fetch_add(1, Ordering::SeqCst);
        let page = (self.args.parser)(&response)
            .map_err(|e| e.wrap(format!("failed to parse response of {}", response.url())))?;
        let saved = self.save(&page.items, response.url(), input).await?;
        debug!(page = pager.page, items = saved, finish = page.finish, "page collected");
        Ok(Some((response, page)))
    }

    async fn save(&self, items: &[Value], url: &str, input: Option<&Value>) -> Result<u64, EtlError> {
        if items.is_empty() {
            return Ok(0);
        }
        let rows = items
            .iter()
            .map(serde_json::to_vec)
            .collect::<Result<Vec<_>, _>>()?;
        let input = input.map(Value::to_string);
        let params = self.args.raw.params();

        for chunk in rows.chunks(self.run.config().batch_size.max(1)) {
            let mut builder = QueryBuilder::<Sqlite>::new(format!(
                "INSERT INTO {} (params, data, url, input) ",
                self.quoted
            ));
            builder.push_values(chunk, |mut row, data| {
                row.push_bind(params.to_string())
                    .push_bind(data.clone())
                    .push_bind(url.to_string())
                    .push_bind(input.clone());
            });
            builder.build().execute(self.run.db().pool()).await?;
        }

        let saved = rows.len() as u64;
        self.items.fetch_add(saved, Ordering::SeqCst);
        self.run.increment_progress(saved);
        Ok(saved)
    }
}

/// Materialises the rows of `query` as JSON objects for fan-out collection.
///
/// # Errors
///
/// Returns the query build or database error.
pub async fn input_from_query(db: &Database, query: &SelectQuery) -> Result<InputStream, EtlError> {
    let rows = query.build()?.build().fetch_all(db.pool()).await?;
    let values = rows
        .iter()
        .map(row_to_json)
        .collect::<Result<Vec<_>, _>>()?;
    debug!(rows = values.len(), "loaded collector input");
    Ok(input_from_values(values))
}

/// Wraps in-memory values as an input stream.
#[must_use]
pub fn input_from_values(values: Vec<Value>) -> InputStream {
    Box::pin(stream::iter(values.into_iter().map(Ok)))
}
