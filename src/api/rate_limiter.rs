//! Request-rate limiting for API collection.
//!
//! [`ApiRateLimiter`] spaces out requests so that the issued rate stays
//! under the upstream budget. The budget comes from two sources:
//!
//! - a static ceiling (`API_REQUESTS_PER_HOUR`), used when nothing better is
//!   known; zero disables throttling entirely;
//! - live observations derived from response headers
//!   ([`RateLimitObservation`]), which govern until their window resets and
//!   then revert to the static ceiling.
//!
//! Both are damped: with `remaining` requests left in a window of length `W`,
//! requests are issued at most every `W / (remaining * damping)`.
//!
//! All workers of a collection share one limiter. Each caller reserves the
//! next free slot under the internal mutex and sleeps after releasing it, so
//! the spacing holds globally while observations are recorded without delay.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use devflow_core::api::{ApiRateLimiter, RateLimitObservation};
//!
//! # async fn example() {
//! let limiter = ApiRateLimiter::new(18_000, 0.98);
//! limiter.acquire().await;
//!
//! // The upstream says 50 requests are left for the next minute.
//! limiter.observe(RateLimitObservation::new(50, Duration::from_secs(60))).await;
//! limiter.acquire().await;
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use reqwest::header::HeaderMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::client::ApiResponse;
use crate::config::EngineConfig;

/// Warning threshold for cumulative throttling delay.
const CUMULATIVE_DELAY_WARNING_THRESHOLD: Duration = Duration::from_secs(300);

/// Maximum Retry-After value honored.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Values above this in a reset header are Unix timestamps, not deltas.
const EPOCH_THRESHOLD: u64 = 1_000_000_000;

/// A rate-limit reading taken from a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitObservation {
    /// Requests left in the current window.
    pub remaining: u32,
    /// Time until the window resets.
    pub reset_in: Duration,
}

impl RateLimitObservation {
    /// Creates an observation.
    #[must_use]
    pub fn new(remaining: u32, reset_in: Duration) -> Self {
        Self {
            remaining,
            reset_in,
        }
    }
}

/// Derives a [`RateLimitObservation`] from a response, if it carries one.
pub type RateLimitDeriver = Arc<dyn Fn(&ApiResponse) -> Option<RateLimitObservation> + Send + Sync>;

/// Reads `remaining` / `reset` headers (e.g. `X-RateLimit-Remaining`,
/// `X-RateLimit-Reset`).
///
/// The reset value may be seconds until reset or a Unix timestamp.
/// Returns `None` when either header is missing or unparsable.
#[must_use]
pub fn observation_from_headers(
    headers: &HeaderMap,
    remaining_header: &str,
    reset_header: &str,
) -> Option<RateLimitObservation> {
    let read = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
    };
    let remaining = u32::try_from(read(remaining_header)?).unwrap_or(u32::MAX);
    let reset = read(reset_header)?;

    let reset_in = if reset > EPOCH_THRESHOLD {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        Duration::from_secs(reset.saturating_sub(now))
    } else {
        Duration::from_secs(reset)
    };
    Some(RateLimitObservation::new(remaining, reset_in))
}

/// A deriver reading the given header pair.
#[must_use]
pub fn header_deriver(remaining_header: &'static str, reset_header: &'static str) -> RateLimitDeriver {
    Arc::new(move |response: &ApiResponse| {
        observation_from_headers(response.headers(), remaining_header, reset_header)
    })
}

#[derive(Debug)]
struct DynamicWindow {
    ends_at: Instant,
    remaining: u32,
    interval: Duration,
}

#[derive(Debug, Default)]
struct LimiterState {
    last_issue: Option<Instant>,
    dynamic: Option<DynamicWindow>,
    min_interval: Option<Duration>,
}

/// Shared request limiter for one collection run.
#[derive(Debug)]
pub struct ApiRateLimiter {
    /// Spacing derived from the static ceiling; `None` means unthrottled.
    static_interval: Option<Duration>,
    damping: f64,
    state: Mutex<LimiterState>,
    cumulative_delay_ms: AtomicU64,
}

impl ApiRateLimiter {
    /// Creates a limiter for `requests_per_hour` (0 = no static throttling).
    #[must_use]
    #[instrument]
    pub fn new(requests_per_hour: u32, damping: f64) -> Self {
        let damping = if damping > 0.0 && damping <= 1.0 {
            damping
        } else {
            1.0
        };
        let static_interval = (requests_per_hour > 0)
            .then(|| interval_for(Duration::from_secs(3600), requests_per_hour, damping));
        debug!(?static_interval, "creating API rate limiter");
        Self {
            static_interval,
            damping,
            state: Mutex::new(LimiterState::default()),
            cumulative_delay_ms: AtomicU64::new(0),
        }
    }

    /// Creates a limiter from engine configuration.
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.api_requests_per_hour, config.rate_limit_damping)
    }

    /// A limiter that never delays (until an observation arrives).
    #[must_use]
    pub fn unthrottled() -> Self {
        Self::new(0, 1.0)
    }

    /// Spacing derived from the static ceiling.
    #[must_use]
    pub fn static_interval(&self) -> Option<Duration> {
        self.static_interval
    }

    /// Total time callers have been delayed.
    #[must_use]
    pub fn total_delay(&self) -> Duration {
        Duration::from_millis(self.cumulative_delay_ms.load(Ordering::Relaxed))
    }

    /// Sets a minimum spacing between requests, or clears it with `None`.
    pub async fn set_min_interval(&self, interval: Option<Duration>) {
        self.state.lock().await.min_interval = interval;
    }

    /// Current minimum spacing.
    pub async fn min_interval(&self) -> Option<Duration> {
        self.state.lock().await.min_interval
    }

    /// Records a live budget reading; it replaces any previous reading.
    pub async fn observe(&self, observation: RateLimitObservation) {
        let mut state = self.state.lock().await;
        let interval = if observation.remaining == 0 {
            observation.reset_in
        } else {
            interval_for(observation.reset_in, observation.remaining, self.damping)
        };
        debug!(
            remaining = observation.remaining,
            reset_in_ms = observation.reset_in.as_millis(),
            interval_ms = interval.as_millis(),
            "rate limit observed"
        );
        state.dynamic = Some(DynamicWindow {
            ends_at: Instant::now() + observation.reset_in,
            remaining: observation.remaining,
            interval,
        });
    }

    /// Claims the next issue slot, then waits for it.
    ///
    /// The slot is reserved under the lock; the wait happens after the lock
    /// is released.
    pub async fn acquire(&self) {
        let slot = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            if state.dynamic.as_ref().is_some_and(|w| now >= w.ends_at) {
                debug!("rate limit window reset, reverting to static budget");
                state.dynamic = None;
            }

            let mut earliest = now;
            let mut interval = self.static_interval.unwrap_or(Duration::ZERO);
            if let Some(window) = state.dynamic.as_mut() {
                if window.remaining == 0 {
                    debug!(
                        delay_ms = window.ends_at.saturating_duration_since(now).as_millis(),
                        "budget exhausted, waiting for window reset"
                    );
                    earliest = window.ends_at;
                    state.dynamic = None;
                } else {
                    window.remaining -= 1;
                    interval = window.interval;
                }
            }
            if let Some(min_interval) = state.min_interval {
                interval = interval.max(min_interval);
            }
            if let Some(last_issue) = state.last_issue {
                earliest = earliest.max(last_issue + interval);
            }
            state.last_issue = Some(earliest);
            earliest
        };

        let delay = slot.saturating_duration_since(Instant::now());
        if !delay.is_zero() {
            tokio::time::sleep_until(slot).await;
            self.record_delay(delay);
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn record_delay(&self, delay: Duration) {
        let delay_ms = delay.as_millis() as u64;
        let total = self
            .cumulative_delay_ms
            .fetch_add(delay_ms, Ordering::Relaxed)
            + delay_ms;
        if Duration::from_millis(total) >= CUMULATIVE_DELAY_WARNING_THRESHOLD
            && Duration::from_millis(total - delay_ms) < CUMULATIVE_DELAY_WARNING_THRESHOLD
        {
            warn!(
                cumulative_delay_secs = total / 1000,
                "requests heavily throttled by rate limit"
            );
        }
    }
}

#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn interval_for(window: Duration, budget: u32, damping: f64) -> Duration {
    let effective = f64::from(budget) * damping;
    if effective <= 0.0 {
        return window;
    }
    Duration::from_secs_f64(window.as_secs_f64() / effective)
}

/// Parses a Retry-After header value.
///
/// Accepts integer seconds (`120`) or an HTTP-date. Values are capped at one
/// hour; dates in the past yield zero. Returns `None` when unparsable.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use devflow_core::api::parse_retry_after;
///
/// assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("invalid"), None);
/// ```
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        let seconds = u64::try_from(seconds).ok()?;
        return Some(Duration::from_secs(seconds).min(MAX_RETRY_AFTER));
    }

    let date = httpdate::parse_http_date(header_value).ok()?;
    Some(
        date.duration_since(std::time::SystemTime::now())
            .map_or(Duration::ZERO, |d| d.min(MAX_RETRY_AFTER)),
    )
}
