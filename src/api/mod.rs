//! HTTP side of collection.
//!
//! - [`client`] - plain reqwest wrapper and response hook
//! - [`rate_limiter`] - static and header-derived request pacing
//! - [`retry`] - retry policy and failure classification
//! - [`async_client`] - bounded-concurrency executor combining the above
//! - [`pagination`] - pagers, URL templates and total-page signals

pub mod async_client;
pub mod client;
pub mod pagination;
pub mod rate_limiter;
pub mod retry;

pub use async_client::{AsyncApiClient, RequestStats};
pub use client::{
    AfterResponse, ApiClient, ApiRequest, ApiResponse, ResponseAction, default_after_response,
    ignore_http_status,
};
pub use pagination::{
    BodyFn, NextPageFn, Pager, QueryFn, RequestData, TotalPagesFn, last_page_from_link,
    page_query, render_url_template, total_pages_from_header, total_pages_from_link_header,
};
pub use rate_limiter::{
    ApiRateLimiter, RateLimitDeriver, RateLimitObservation, header_deriver,
    observation_from_headers, parse_retry_after,
};
pub use retry::{FailureType, RetryDecision, RetryPolicy, classify_error};
