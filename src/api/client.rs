//! Plain HTTP client for a remote API endpoint.
//!
//! [`ApiClient`] resolves request paths against a base endpoint, attaches
//! default headers (credentials are marked sensitive so they never show up in
//! debug output), and buffers each response into an [`ApiResponse`].
//!
//! After each response an [`AfterResponse`] hook classifies it: continue with
//! normal processing, or ignore it and move on (e.g. a 404 for a resource that
//! was deleted upstream). The default hook turns HTTP 401 into
//! [`EtlError::Unauthorized`].
//!
//! # Example
//!
//! ```no_run
//! use devflow_core::EngineConfig;
//! use devflow_core::api::ApiClient;
//!
//! # async fn example() -> Result<(), devflow_core::EtlError> {
//! let client = ApiClient::new("https://api.github.com/", &EngineConfig::default())?
//!     .with_header("Authorization", "Bearer secret")?;
//!
//! let query = vec![("state".to_string(), "all".to_string())];
//! if let Some(response) = client.get("repos/apache/incubator-devlake/issues", &query).await? {
//!     let issues: serde_json::Value = response.json()?;
//!     println!("{issues}");
//! }
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::config::EngineConfig;
use crate::error::EtlError;

/// User-Agent sent with every request.
fn default_user_agent() -> String {
    format!("devflow/{}", env!("CARGO_PKG_VERSION"))
}

/// A fully buffered HTTP response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    status: u16,
    headers: HeaderMap,
    body: Bytes,
    url: String,
}

impl ApiResponse {
    /// Builds a response by hand (used by tests and custom transports).
    #[must_use]
    pub fn new(status: u16, headers: HeaderMap, body: impl Into<Bytes>, url: impl Into<String>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
            url: url.into(),
        }
    }

    /// HTTP status code.
    #[must_use]
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Whether the status is 2xx.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Response headers.
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// A header value as text, if present and valid.
    #[must_use]
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Raw body bytes.
    #[must_use]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Final request URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Decodes the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`EtlError::Json`] when the body does not match `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, EtlError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// What to do with a response after the hook inspected it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseAction {
    /// Process normally (error statuses become errors).
    Continue,
    /// Drop the response and carry on without error.
    Ignore,
}

/// Hook run on every response before status handling.
pub type AfterResponse =
    Arc<dyn Fn(&ApiResponse) -> Result<ResponseAction, EtlError> + Send + Sync>;

/// Default hook: HTTP 401 is a terminal authentication failure.
///
/// # Errors
///
/// Returns [`EtlError::Unauthorized`] for status 401.
pub fn default_after_response(response: &ApiResponse) -> Result<ResponseAction, EtlError> {
    if response.status() == 401 {
        return Err(EtlError::unauthorized(format!(
            "authentication failed calling {}, please check your access token",
            response.url()
        )));
    }
    Ok(ResponseAction::Continue)
}

/// Hook that ignores the given statuses and otherwise behaves like
/// [`default_after_response`].
#[must_use]
pub fn ignore_http_status(statuses: &[u16]) -> AfterResponse {
    let statuses = statuses.to_vec();
    Arc::new(move |response: &ApiResponse| {
        if statuses.contains(&response.status()) {
            warn!(status = response.status(), url = %response.url(), "ignoring response");
            return Ok(ResponseAction::Ignore);
        }
        default_after_response(response)
    })
}

/// One request to send.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    /// HTTP method.
    pub method: Method,
    /// Path relative to the endpoint, or an absolute URL.
    pub path: String,
    /// Query pairs appended to the URL.
    pub query: Vec<(String, String)>,
    /// Optional JSON body.
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    /// A GET request.
    #[must_use]
    pub fn get(path: impl Into<String>, query: Vec<(String, String)>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            query,
            body: None,
        }
    }

    /// A POST request with a JSON body.
    #[must_use]
    pub fn post(
        path: impl Into<String>,
        query: Vec<(String, String)>,
        body: Option<serde_json::Value>,
    ) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            query,
            body,
        }
    }
}

/// HTTP client bound to one API endpoint.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    endpoint: Url,
    headers: HeaderMap,
    after_response: Option<AfterResponse>,
}

impl fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient")
            .field("endpoint", &self.endpoint.as_str())
            .field("headers", &self.headers)
            .field("after_response", &self.after_response.is_some())
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    /// Creates a client for `endpoint` using the configured request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`EtlError::BadInput`] for an invalid endpoint, or an error if
    /// the HTTP client cannot be built.
    #[instrument(skip(config))]
    pub fn new(endpoint: &str, config: &EngineConfig) -> Result<Self, EtlError> {
        let mut endpoint = Url::parse(endpoint)
            .map_err(|e| EtlError::bad_input_from(format!("invalid endpoint '{endpoint}'"), e))?;
        if !endpoint.path().ends_with('/') {
            let path = format!("{}/", endpoint.path());
            endpoint.set_path(&path);
        }

        let client = Client::builder()
            .timeout(config.api_timeout)
            .gzip(true)
            .user_agent(default_user_agent())
            .build()
            .map_err(|e| EtlError::from_cause("failed to build HTTP client", e))?;

        Ok(Self {
            client,
            endpoint,
            headers: HeaderMap::new(),
            after_response: None,
        })
    }

    /// Adds a default header; `Authorization` and similar values are marked sensitive.
    ///
    /// # Errors
    ///
    /// Returns [`EtlError::BadInput`] for an invalid header name or value.
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, EtlError> {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| EtlError::bad_input_from(format!("invalid header name '{name}'"), e))?;
        let mut header_value = HeaderValue::from_str(value)
            .map_err(|e| EtlError::bad_input_from(format!("invalid value for header '{name}'"), e))?;
        header_value.set_sensitive(true);
        self.headers.insert(header_name, header_value);
        Ok(self)
    }

    /// Replaces the after-response hook.
    #[must_use]
    pub fn with_after_response(mut self, hook: AfterResponse) -> Self {
        self.after_response = Some(hook);
        self
    }

    /// Base endpoint (always ends with `/`).
    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Resolves a path (or absolute URL) and appends the query pairs.
    ///
    /// # Errors
    ///
    /// Returns [`EtlError::BadInput`] if the URL cannot be formed.
    pub fn resolve_url(&self, path: &str, query: &[(String, String)]) -> Result<Url, EtlError> {
        let mut url = if path.starts_with("http://") || path.starts_with("https://") {
            Url::parse(path)
        } else {
            self.endpoint.join(path.trim_start_matches('/'))
        }
        .map_err(|e| EtlError::bad_input_from(format!("invalid request path '{path}'"), e))?;

        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    /// Sends a request and buffers the response without interpreting its status.
    ///
    /// # Errors
    ///
    /// Returns [`EtlError::Timeout`] when the request times out and
    /// [`EtlError::Network`] for other transport failures.
    #[instrument(level = "debug", skip(self, request), fields(method = %request.method, path = %request.path))]
    pub async fn send_raw(&self, request: &ApiRequest) -> Result<ApiResponse, EtlError> {
        let url = self.resolve_url(&request.path, &request.query)?;
        let url_text = url.to_string();

        let mut builder = self
            .client
            .request(request.method.clone(), url)
            .headers(self.headers.clone());
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| map_transport_error(&url_text, e))?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| map_transport_error(&url_text, e))?;

        debug!(status, bytes = body.len(), url = %url_text, "response received");
        Ok(ApiResponse {
            status,
            headers,
            body,
            url: url_text,
        })
    }

    /// Runs the after-response hook and maps error statuses.
    ///
    /// Returns `Ok(None)` when the hook ignored the response.
    ///
    /// # Errors
    ///
    /// Returns the hook's error, or [`EtlError::HttpStatus`] for status >= 400.
    pub fn check_response(&self, response: ApiResponse) -> Result<Option<ApiResponse>, EtlError> {
        let action = match &self.after_response {
            Some(hook) => hook(&response)?,
            None => default_after_response(&response)?,
        };
        if action == ResponseAction::Ignore {
            return Ok(None);
        }
        if response.status() >= 400 {
            return Err(EtlError::http_status(
                response.url(),
                response.status(),
                &response.body_text(),
            ));
        }
        Ok(Some(response))
    }

    /// Sends a request and applies [`check_response`](Self::check_response).
    ///
    /// # Errors
    ///
    /// See [`send_raw`](Self::send_raw) and [`check_response`](Self::check_response).
    pub async fn send(&self, request: &ApiRequest) -> Result<Option<ApiResponse>, EtlError> {
        let response = self.send_raw(request).await?;
        self.check_response(response)
    }

    /// Sends a GET request.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn get(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> Result<Option<ApiResponse>, EtlError> {
        self.send(&ApiRequest::get(path, query.to_vec())).await
    }

    /// Sends a POST request with a JSON body.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn post(
        &self,
        path: &str,
        query: &[(String, String)],
        body: &serde_json::Value,
    ) -> Result<Option<ApiResponse>, EtlError> {
        self.send(&ApiRequest::post(path, query.to_vec(), Some(body.clone())))
            .await
    }
}

fn map_transport_error(url: &str, error: reqwest::Error) -> EtlError {
    if error.is_timeout() {
        EtlError::timeout(format!("request to {url} timed out"))
    } else {
        EtlError::network(url, error)
    }
}
