//! Bounded-concurrency request executor with rate limiting and retries.
//!
//! [`AsyncApiClient`] sits on top of an [`ApiClient`] and is what collectors
//! use. Every request:
//!
//! 1. takes a semaphore permit (at most `concurrency` requests in flight),
//! 2. waits for the shared [`ApiRateLimiter`],
//! 3. is sent; the response may feed a new rate-limit observation,
//! 4. goes through the after-response hook (ignored responses yield `None`),
//! 5. is retried with backoff on transient failures, honoring `Retry-After`
//!    for 429 responses.
//!
//! Cancellation is cooperative: once the token is cancelled no new attempt
//! starts, and waits (for a permit, the limiter, or a backoff) are abandoned.
//! A request already on the wire is allowed to finish.
//!
//! # Example
//!
//! ```no_run
//! use devflow_core::EngineConfig;
//! use devflow_core::api::{ApiClient, ApiRequest, AsyncApiClient};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), devflow_core::EtlError> {
//! let config = EngineConfig::default();
//! let client = ApiClient::new("https://api.github.com/", &config)?;
//! let pool = AsyncApiClient::new(client, &config, 10, CancellationToken::new())?;
//!
//! let response = pool.send(&ApiRequest::get("rate_limit", Vec::new())).await?;
//! println!("ok: {}", response.is_some());
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use reqwest::header::RETRY_AFTER;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::client::{ApiClient, ApiRequest, ApiResponse};
use super::rate_limiter::{ApiRateLimiter, RateLimitDeriver, parse_retry_after};
use super::retry::{FailureType, RetryDecision, RetryPolicy, classify_error};
use crate::config::{EngineConfig, MAX_CONCURRENCY, MIN_CONCURRENCY};
use crate::error::EtlError;

/// Request counters for one client.
///
/// Uses atomic counters so concurrent requests can update them.
#[derive(Debug, Default)]
pub struct RequestStats {
    sent: AtomicUsize,
    succeeded: AtomicUsize,
    ignored: AtomicUsize,
    failed: AtomicUsize,
    retried: AtomicUsize,
}

impl RequestStats {
    /// Attempts put on the wire (retries included).
    #[must_use]
    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }

    /// Requests that ended with a usable response.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.succeeded.load(Ordering::SeqCst)
    }

    /// Requests whose response was ignored by the hook.
    #[must_use]
    pub fn ignored(&self) -> usize {
        self.ignored.load(Ordering::SeqCst)
    }

    /// Requests that failed after all attempts.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    /// Retry attempts made.
    #[must_use]
    pub fn retried(&self) -> usize {
        self.retried.load(Ordering::SeqCst)
    }
}

struct Inner {
    client: ApiClient,
    semaphore: Semaphore,
    concurrency: usize,
    limiter: Arc<ApiRateLimiter>,
    retry_policy: RetryPolicy,
    deriver: Option<RateLimitDeriver>,
    cancel: CancellationToken,
    stats: RequestStats,
}

/// Shared, cloneable request executor.
#[derive(Clone)]
pub struct AsyncApiClient {
    inner: Arc<Inner>,
}

impl fmt::Debug for AsyncApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncApiClient")
            .field("client", &self.inner.client)
            .field("concurrency", &self.inner.concurrency)
            .field("retry_policy", &self.inner.retry_policy)
            .field("stats", &self.inner.stats)
            .finish_non_exhaustive()
    }
}

impl AsyncApiClient {
    /// Creates an executor with a limiter and retry policy built from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`EtlError::BadInput`] if `concurrency` is outside 1..=100.
    #[instrument(level = "debug", skip(client, config, cancel))]
    pub fn new(
        client: ApiClient,
        config: &EngineConfig,
        concurrency: usize,
        cancel: CancellationToken,
    ) -> Result<Self, EtlError> {
        Self::with_parts(
            client,
            concurrency,
            Arc::new(ApiRateLimiter::from_config(config)),
            RetryPolicy::from_config(config),
            cancel,
        )
    }

    /// Creates an executor from explicit parts.
    ///
    /// # Errors
    ///
    /// Returns [`EtlError::BadInput`] if `concurrency` is outside 1..=100.
    pub fn with_parts(
        client: ApiClient,
        concurrency: usize,
        limiter: Arc<ApiRateLimiter>,
        retry_policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> Result<Self, EtlError> {
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&concurrency) {
            return Err(EtlError::bad_input(format!(
                "invalid concurrency value {concurrency}: must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}"
            )));
        }
        debug!(
            concurrency,
            max_attempts = retry_policy.max_attempts(),
            static_interval = ?limiter.static_interval(),
            "creating async API client"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                client,
                semaphore: Semaphore::new(concurrency),
                concurrency,
                limiter,
                retry_policy,
                deriver: None,
                cancel,
                stats: RequestStats::default(),
            }),
        })
    }

    /// Derives live rate-limit observations from every response.
    ///
    /// Must be called before the client is cloned.
    ///
    /// # Errors
    ///
    /// Returns [`EtlError::Default`] if the client is already shared.
    pub fn with_rate_limit_deriver(mut self, deriver: RateLimitDeriver) -> Result<Self, EtlError> {
        let inner = Arc::get_mut(&mut self.inner)
            .ok_or_else(|| EtlError::other("cannot configure a shared AsyncApiClient"))?;
        inner.deriver = Some(deriver);
        Ok(self)
    }

    /// The wrapped client.
    #[must_use]
    pub fn client(&self) -> &ApiClient {
        &self.inner.client
    }

    /// The shared rate limiter.
    #[must_use]
    pub fn limiter(&self) -> &Arc<ApiRateLimiter> {
        &self.inner.limiter
    }

    /// Maximum number of requests in flight.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.inner.concurrency
    }

    /// Request counters.
    #[must_use]
    pub fn stats(&self) -> &RequestStats {
        &self.inner.stats
    }

    /// The cancellation token observed by this client.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// Sends a GET request.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn get(
        &self,
        path: &str,
        query: Vec<(String, String)>,
    ) -> Result<Option<ApiResponse>, EtlError> {
        self.send(&ApiRequest::get(path, query)).await
    }

    /// Sends a request with concurrency bounding, rate limiting and retries.
    ///
    /// Returns `Ok(None)` when the after-response hook ignored the response.
    ///
    /// # Errors
    ///
    /// Returns [`EtlError::Cancelled`] once cancelled, the hook's error
    /// (e.g. [`EtlError::Unauthorized`]), or the last failure after retries.
    #[instrument(skip(self, request), fields(method = %request.method, path = %request.path))]
    pub async fn send(&self, request: &ApiRequest) -> Result<Option<ApiResponse>, EtlError> {
        let inner = &self.inner;
        let _permit = tokio::select! {
            () = inner.cancel.cancelled() => return Err(EtlError::Cancelled),
            permit = inner.semaphore.acquire() => {
                permit.map_err(|_| EtlError::other("request semaphore closed"))?
            }
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            tokio::select! {
                () = inner.cancel.cancelled() => return Err(EtlError::Cancelled),
                () = inner.limiter.acquire() => {}
            }

            let (result, retry_after) = self.attempt(request).await;
            let error = match result {
                Ok(Some(response)) => {
                    inner.stats.succeeded.fetch_add(1, Ordering::SeqCst);
                    return Ok(Some(response));
                }
                Ok(None) => {
                    inner.stats.ignored.fetch_add(1, Ordering::SeqCst);
                    return Ok(None);
                }
                Err(error) => error,
            };

            let failure_type = classify_error(&error);
            match inner.retry_policy.should_retry(failure_type, attempt) {
                RetryDecision::Retry {
                    delay: backoff,
                    attempt: next_attempt,
                } => {
                    let delay = if failure_type == FailureType::RateLimited {
                        retry_after.unwrap_or(backoff)
                    } else {
                        backoff
                    };
                    info!(
                        path = %request.path,
                        attempt = next_attempt,
                        max_attempts = inner.retry_policy.max_attempts(),
                        delay_ms = delay.as_millis(),
                        using_retry_after = retry_after.is_some(),
                        %error,
                        "retrying request"
                    );
                    inner.stats.retried.fetch_add(1, Ordering::SeqCst);
                    tokio::select! {
                        () = inner.cancel.cancelled() => return Err(EtlError::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                RetryDecision::DoNotRetry { reason } => {
                    debug!(path = %request.path, %reason, attempts = attempt, "not retrying request");
                    inner.stats.failed.fetch_add(1, Ordering::SeqCst);
                    return Err(error);
                }
            }
        }
    }

    async fn attempt(
        &self,
        request: &ApiRequest,
    ) -> (
        Result<Option<ApiResponse>, EtlError>,
        Option<std::time::Duration>,
    ) {
        let inner = &self.inner;
        inner.stats.sent.fetch_add(1, Ordering::SeqCst);

        let response = match inner.client.send_raw(request).await {
            Ok(response) => response,
            Err(error) => return (Err(error), None),
        };

        if let Some(observation) = inner.deriver.as_ref().and_then(|derive| derive(&response)) {
            inner.limiter.observe(observation).await;
        }
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);

        (inner.client.check_response(response), retry_after)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use wiremock::matchers::{method, path};
    use wiremock::{Mock, ResponseTemplate};

    use super::*;
    use crate::api::client::ignore_http_status;
    use crate::error::ErrorKind;
    use crate::test_support::socket_guard::start_mock_server_or_skip;

    fn fast_pool(uri: &str, concurrency: usize) -> AsyncApiClient {
        let client = ApiClient::new(uri, &EngineConfig::default()).unwrap();
        AsyncApiClient::with_parts(
            client,
            concurrency,
            Arc::new(ApiRateLimiter::unthrottled()),
            RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(20), 2.0),
            CancellationToken::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_rejects_invalid_concurrency() {
        let client = ApiClient::new("https://api.example.com/", &EngineConfig::default()).unwrap();
        for concurrency in [0, 101] {
            let err = AsyncApiClient::new(
                client.clone(),
                &EngineConfig::default(),
                concurrency,
                CancellationToken::new(),
            )
            .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::BadInput);
        }
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
            .mount(&mock_server)
            .await;

        let pool = fast_pool(&mock_server.uri(), 2);
        let response = pool.get("flaky", Vec::new()).await.unwrap();
        assert!(response.is_some());
        assert_eq!(pool.stats().sent(), 3);
        assert_eq!(pool.stats().retried(), 2);
        assert_eq!(pool.stats().succeeded(), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&mock_server)
            .await;

        let pool = fast_pool(&mock_server.uri(), 1);
        let err = pool.get("broken", Vec::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HttpStatus(500));
        assert_eq!(pool.stats().sent(), 3);
        assert_eq!(pool.stats().failed(), 1);
    }

    #[tokio::test]
    async fn test_unauthorized_is_not_retried() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&mock_server)
            .await;

        let pool = fast_pool(&mock_server.uri(), 1);
        let err = pool.get("private", Vec::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn test_ignored_response_returns_none() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let client = ApiClient::new(&mock_server.uri(), &EngineConfig::default())
            .unwrap()
            .with_after_response(ignore_http_status(&[404]));
        let pool = AsyncApiClient::with_parts(
            client,
            1,
            Arc::new(ApiRateLimiter::unthrottled()),
            RetryPolicy::default(),
            CancellationToken::new(),
        )
        .unwrap();

        assert!(pool.get("gone", Vec::new()).await.unwrap().is_none());
        assert_eq!(pool.stats().ignored(), 1);
    }

    #[tokio::test]
    async fn test_honors_retry_after_on_429() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "1"))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&mock_server)
            .await;

        let pool = fast_pool(&mock_server.uri(), 1);
        let started = std::time::Instant::now();
        assert!(pool.get("limited", Vec::new()).await.unwrap().is_some());
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_cancelled_before_send() {
        let client = ApiClient::new("http://127.0.0.1:9/", &EngineConfig::default()).unwrap();
        let cancel = CancellationToken::new();
        let pool = AsyncApiClient::new(client, &EngineConfig::default(), 1, cancel.clone()).unwrap();
        cancel.cancel();

        let err = pool.get("anything", Vec::new()).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(pool.stats().sent(), 0);
    }

    #[tokio::test]
    async fn test_rate_limit_deriver_feeds_limiter() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("X-RateLimit-Remaining", "0")
                    .insert_header("X-RateLimit-Reset", "1"),
            )
            .mount(&mock_server)
            .await;

        let pool = fast_pool(&mock_server.uri(), 1)
            .with_rate_limit_deriver(crate::api::rate_limiter::header_deriver(
                "X-RateLimit-Remaining",
                "X-RateLimit-Reset",
            ))
            .unwrap();

        pool.get("a", Vec::new()).await.unwrap();
        let started = std::time::Instant::now();
        pool.get("b", Vec::new()).await.unwrap();
        // Budget exhausted: the second request waits for the 1s window reset.
        assert!(started.elapsed() >= Duration::from_millis(900));
    }
}
