//! Error taxonomy shared by collectors, extractors, converters and the task runner.
//!
//! Every fallible operation in the crate returns [`EtlError`]. Callers that need
//! to branch on the failure category use [`EtlError::kind`] (or
//! [`EtlError::root_kind`] when the error has been wrapped with context).
//!
//! # Example
//!
//! ```
//! use devflow_core::{ErrorKind, EtlError};
//!
//! let error = EtlError::http_status("https://api.example.com/repos", 404, "");
//! assert_eq!(error.kind(), ErrorKind::HttpStatus(404));
//!
//! let wrapped = error.wrap("error collecting issues");
//! assert_eq!(wrapped.kind(), ErrorKind::Default);
//! assert_eq!(wrapped.root_kind(), ErrorKind::HttpStatus(404));
//! assert_eq!(wrapped.cause_chain().len(), 2);
//! ```

use std::error::Error as StdError;
use std::fmt;

use thiserror::Error;

use crate::db::DbError;

/// Boxed error used as the cause of wrapped errors.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Category of an [`EtlError`], used for retry and propagation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed options or configuration; never retried.
    BadInput,
    /// Authentication rejected by the remote API; aborts the run.
    Unauthorized,
    /// Non-success HTTP status; terminal unless whitelisted by a response hook.
    HttpStatus(u16),
    /// Lock acquisition, rate window or request timeout.
    Timeout,
    /// Cooperative cancellation was observed.
    Cancelled,
    /// Generic internal failure.
    Default,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadInput => write!(f, "bad_input"),
            Self::Unauthorized => write!(f, "unauthorized"),
            Self::HttpStatus(status) => write!(f, "http_status_{status}"),
            Self::Timeout => write!(f, "timeout"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Default => write!(f, "default"),
        }
    }
}

/// Errors produced by the ETL framework.
#[derive(Debug, Error)]
pub enum EtlError {
    /// Invalid options, configuration or arguments.
    #[error("bad input: {message}")]
    BadInput {
        /// What was wrong with the input.
        message: String,
        /// Underlying parse/validation error, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// The remote API rejected our credentials (HTTP 401).
    #[error("unauthorized: {message}")]
    Unauthorized {
        /// Human-readable reason.
        message: String,
    },

    /// The remote API answered with an error status.
    #[error("HTTP {status} calling {url}")]
    HttpStatus {
        /// Requested URL.
        url: String,
        /// HTTP status code.
        status: u16,
        /// Response body (truncated) for diagnostics.
        body: String,
    },

    /// Something did not complete in time.
    #[error("timed out: {message}")]
    Timeout {
        /// What timed out.
        message: String,
    },

    /// Run was cancelled cooperatively.
    #[error("operation cancelled")]
    Cancelled,

    /// Transport-level failure (DNS, connection refused, TLS, body read).
    #[error("network error calling {url}: {source}")]
    Network {
        /// Requested URL.
        url: String,
        /// The underlying client error.
        #[source]
        source: reqwest::Error,
    },

    /// Database failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON (de)serialization failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic failure, usually wrapping a cause with extra context.
    #[error("{message}")]
    Default {
        /// Context message.
        message: String,
        /// Wrapped cause.
        #[source]
        source: Option<BoxError>,
    },
}

/// Maximum number of response body bytes kept in [`EtlError::HttpStatus`].
const MAX_BODY_IN_ERROR: usize = 512;

impl EtlError {
    /// Creates a `BadInput` error.
    pub fn bad_input(message: impl Into<String>) -> Self {
        Self::BadInput {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a `BadInput` error caused by `source`.
    pub fn bad_input_from(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::BadInput {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Creates an `Unauthorized` error.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }

    /// Creates an `HttpStatus` error, truncating the body for logs.
    pub fn http_status(url: impl Into<String>, status: u16, body: &str) -> Self {
        let body = if body.len() > MAX_BODY_IN_ERROR {
            let mut end = MAX_BODY_IN_ERROR;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}...", &body[..end])
        } else {
            body.to_string()
        };
        Self::HttpStatus {
            url: url.into(),
            status,
            body,
        }
    }

    /// Creates a `Timeout` error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Creates a transport error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates a generic error without a cause.
    pub fn other(message: impl Into<String>) -> Self {
        Self::Default {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a generic error wrapping an arbitrary cause.
    pub fn from_cause(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Default {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Wraps this error with a context message.
    ///
    /// The result is always `Default`; the original category stays reachable
    /// through [`root_kind`](Self::root_kind).
    #[must_use]
    pub fn wrap(self, message: impl Into<String>) -> Self {
        Self::Default {
            message: message.into(),
            source: Some(Box::new(self)),
        }
    }

    /// Returns the category of this error (not looking at causes).
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BadInput { .. } => ErrorKind::BadInput,
            Self::Unauthorized { .. } => ErrorKind::Unauthorized,
            Self::HttpStatus { status, .. } => ErrorKind::HttpStatus(*status),
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Network { .. } | Self::Database(_) | Self::Json(_) | Self::Default { .. } => {
                ErrorKind::Default
            }
        }
    }

    /// Returns the first non-`Default` category found walking the cause chain,
    /// or `Default` when there is none.
    #[must_use]
    pub fn root_kind(&self) -> ErrorKind {
        let kind = self.kind();
        if kind != ErrorKind::Default {
            return kind;
        }
        let mut current = StdError::source(self);
        while let Some(error) = current {
            if let Some(etl) = error.downcast_ref::<EtlError>() {
                let inner = etl.kind();
                if inner != ErrorKind::Default {
                    return inner;
                }
            }
            current = error.source();
        }
        ErrorKind::Default
    }

    /// Returns `true` if this error (or one of its causes) is a cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.root_kind() == ErrorKind::Cancelled
    }

    /// Returns every message from this error down to its innermost cause.
    #[must_use]
    pub fn cause_chain(&self) -> Vec<String> {
        let mut chain = vec![self.to_string()];
        let mut current = StdError::source(self);
        while let Some(error) = current {
            chain.push(error.to_string());
            current = error.source();
        }
        chain
    }
}

impl From<DbError> for EtlError {
    fn from(error: DbError) -> Self {
        Self::from_cause("database initialization failed", error)
    }
}
