//! Retry policy for transient API request failures.
//!
//! Failed requests are classified into a [`FailureType`]; the [`RetryPolicy`]
//! then decides whether and when to try again, using exponential backoff
//! with jitter. Only transient failures and rate limiting are retried.
//! A rejected credential or a missing resource is final.
//!
//! # Example
//!
//! ```
//! use devflow_core::EtlError;
//! use devflow_core::api::{RetryDecision, RetryPolicy, classify_error};
//!
//! let policy = RetryPolicy::default();
//! let error = EtlError::http_status("https://api.example.com/issues", 503, "");
//!
//! match policy.should_retry(classify_error(&error), 1) {
//!     RetryDecision::Retry { delay, attempt } => {
//!         println!("retrying in {delay:?} (attempt {attempt})");
//!     }
//!     RetryDecision::DoNotRetry { reason } => println!("giving up: {reason}"),
//! }
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument};

use crate::config::EngineConfig;
use crate::error::EtlError;

/// Default base delay for exponential backoff.
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default maximum delay cap.
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(32);

/// Default backoff multiplier (doubles each attempt).
const DEFAULT_BACKOFF_MULTIPLIER: f32 = 2.0;

/// Upper bound of the jitter added to delays.
const MAX_JITTER: Duration = Duration::from_millis(500);

/// Classification of a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// May succeed on retry: timeouts, connection failures, 5xx.
    Transient,
    /// Will not succeed on retry: most 4xx, bad input.
    Permanent,
    /// Credentials rejected (401/403).
    NeedsAuth,
    /// Upstream throttling (429); retried after Retry-After or backoff.
    RateLimited,
    /// The run was cancelled; never retried.
    Cancelled,
}

/// Decision on whether to retry a failed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after `delay`.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Number of the next attempt (the first retry is attempt 2).
        attempt: u32,
    },
    /// Give up.
    DoNotRetry {
        /// Why no retry is attempted.
        reason: String,
    },
}

/// Exponential backoff configuration.
///
/// `delay = min(base_delay * multiplier^(attempt-1), max_delay) + jitter`,
/// where jitter is at most half the base delay, capped at 500ms.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the initial one.
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: crate::config::DEFAULT_API_RETRY + 1,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with custom settings; `max_attempts` is at least 1.
    #[must_use]
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f32,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            backoff_multiplier,
        }
    }

    /// Policy allowing `config.api_retry` retries after the initial attempt.
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_attempts: config.api_retry.saturating_add(1),
            ..Self::default()
        }
    }

    /// Same policy with a different base delay (the cap is raised if needed).
    #[must_use]
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = self.max_delay.max(base_delay);
        self
    }

    /// Maximum number of attempts, including the initial one.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decides whether to retry after `attempt` (1-indexed) failed.
    #[instrument(skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        match failure_type {
            FailureType::Permanent => {
                return RetryDecision::DoNotRetry {
                    reason: "permanent failure".to_string(),
                };
            }
            FailureType::NeedsAuth => {
                return RetryDecision::DoNotRetry {
                    reason: "credentials rejected".to_string(),
                };
            }
            FailureType::Cancelled => {
                return RetryDecision::DoNotRetry {
                    reason: "run cancelled".to_string(),
                };
            }
            FailureType::Transient | FailureType::RateLimited => {}
        }

        if attempt >= self.max_attempts {
            debug!(attempt, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = self.calculate_delay(attempt);
        debug!(attempt, delay_ms = delay.as_millis(), "will retry");
        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let exponent = f64::from(attempt.saturating_sub(1));
        let delay_ms = base_ms * f64::from(self.backoff_multiplier).powf(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        Duration::from_millis(capped_ms as u64) + self.calculate_jitter()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn calculate_jitter(&self) -> Duration {
        let bound = (self.base_delay / 2).min(MAX_JITTER).as_millis() as u64;
        if bound == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=bound))
    }
}

/// Classifies an error for retry decisions.
///
/// | Error | Type |
/// |-------|------|
/// | `HttpStatus` 401, 403 | `NeedsAuth` |
/// | `HttpStatus` 408, 5xx | `Transient` |
/// | `HttpStatus` 429 | `RateLimited` |
/// | `HttpStatus` other | `Permanent` |
/// | `Timeout`, `Network` (non-TLS) | `Transient` |
/// | `Network` (TLS) | `Permanent` |
/// | `Unauthorized` | `NeedsAuth` |
/// | `Cancelled` | `Cancelled` |
/// | anything else | `Permanent` |
#[must_use]
pub fn classify_error(error: &EtlError) -> FailureType {
    match error {
        EtlError::HttpStatus { status, .. } => classify_http_status(*status),
        EtlError::Timeout { .. } => FailureType::Transient,
        EtlError::Network { source, .. } => {
            if is_tls_error(source) {
                FailureType::Permanent
            } else {
                FailureType::Transient
            }
        }
        EtlError::Unauthorized { .. } => FailureType::NeedsAuth,
        EtlError::Cancelled => FailureType::Cancelled,
        EtlError::BadInput { .. }
        | EtlError::Database(_)
        | EtlError::Json(_)
        | EtlError::Default { .. } => FailureType::Permanent,
    }
}

#[allow(clippy::match_same_arms)]
fn classify_http_status(status: u16) -> FailureType {
    match status {
        401 | 403 => FailureType::NeedsAuth,
        408 => FailureType::Transient,
        429 => FailureType::RateLimited,
        status if (400..500).contains(&status) => FailureType::Permanent,
        status if (500..600).contains(&status) => FailureType::Transient,
        _ => FailureType::Permanent,
    }
}

fn is_tls_error(error: &reqwest::Error) -> bool {
    let message = error.to_string().to_lowercase();
    message.contains("certificate") || message.contains("tls") || message.contains("handshake")
}
