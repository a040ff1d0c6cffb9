//! Engine configuration and typed task options.
//!
//! [`EngineConfig`] holds the engine-wide knobs (retries, timeouts, request
//! budget, batching). It is built once (usually from the environment) and then
//! passed to each component; nothing in the crate reads configuration from
//! process-wide state after that.
//!
//! [`TaskOptions`] is the per-run option set. It is decoded exactly once from
//! the JSON options attached to a task, validated, and then handed around as a
//! typed struct. Plugin-specific scope fields (owner, repo, board id...) live
//! in the generic `scope` field.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::EtlError;

/// Default number of attempts for a failing request (initial attempt excluded).
pub const DEFAULT_API_RETRY: u32 = 3;

/// Default request timeout.
pub const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(120);

/// Default global request budget.
pub const DEFAULT_REQUESTS_PER_HOUR: u32 = 18_000;

/// Share of the theoretical request budget actually used.
pub const DEFAULT_RATE_LIMIT_DAMPING: f64 = 0.98;

/// Default number of rows flushed per batch insert.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Default page size when a task does not specify one.
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// Default number of concurrent requests.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Minimum allowed concurrency value.
pub const MIN_CONCURRENCY: usize = 1;

/// Maximum allowed concurrency value.
pub const MAX_CONCURRENCY: usize = 100;

/// Engine-wide configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Retries for transient request failures (`API_RETRY`).
    pub api_retry: u32,
    /// Per-request timeout (`API_TIMEOUT`).
    pub api_timeout: Duration,
    /// Static request ceiling; 0 disables throttling (`API_REQUESTS_PER_HOUR`).
    pub api_requests_per_hour: u32,
    /// Share of the computed budget that is actually issued.
    pub rate_limit_damping: f64,
    /// When a total-pages callback is supplied, use it instead of the empty-page heuristic.
    pub prefer_total_pages_header: bool,
    /// Rows per batch insert (`BATCH_SIZE`).
    pub batch_size: usize,
    /// Page size used when task options omit it.
    pub default_page_size: u32,
    /// Concurrency used when task options omit it.
    pub default_concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_retry: DEFAULT_API_RETRY,
            api_timeout: DEFAULT_API_TIMEOUT,
            api_requests_per_hour: DEFAULT_REQUESTS_PER_HOUR,
            rate_limit_damping: DEFAULT_RATE_LIMIT_DAMPING,
            prefer_total_pages_header: true,
            batch_size: DEFAULT_BATCH_SIZE,
            default_page_size: DEFAULT_PAGE_SIZE,
            default_concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

impl EngineConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    ///
    /// # Errors
    ///
    /// Returns [`EtlError::BadInput`] when a variable is set but unparsable.
    pub fn from_env() -> Result<Self, EtlError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through an arbitrary key lookup.
    ///
    /// Recognized keys: `API_RETRY`, `API_TIMEOUT`, `API_REQUESTS_PER_HOUR`,
    /// `API_RATE_LIMIT_DAMPING`, `BATCH_SIZE`, `PAGE_SIZE`, `CONCURRENCY`.
    ///
    /// # Errors
    ///
    /// Returns [`EtlError::BadInput`] when a value is unparsable or out of range.
    #[instrument(skip(lookup))]
    pub fn from_lookup<F>(lookup: F) -> Result<Self, EtlError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = non_empty(lookup("API_RETRY")) {
            config.api_retry = parse_number("API_RETRY", &value)?;
        }
        if let Some(value) = non_empty(lookup("API_TIMEOUT")) {
            config.api_timeout = parse_duration(&value)
                .map_err(|e| e.wrap("failed to parse API_TIMEOUT"))?;
        }
        if let Some(value) = non_empty(lookup("API_REQUESTS_PER_HOUR")) {
            config.api_requests_per_hour = parse_number("API_REQUESTS_PER_HOUR", &value)?;
        }
        if let Some(value) = non_empty(lookup("API_RATE_LIMIT_DAMPING")) {
            let damping: f64 = parse_number("API_RATE_LIMIT_DAMPING", &value)?;
            if !(damping > 0.0 && damping <= 1.0) {
                return Err(EtlError::bad_input(format!(
                    "API_RATE_LIMIT_DAMPING must be in (0, 1], got {damping}"
                )));
            }
            config.rate_limit_damping = damping;
        }
        if let Some(value) = non_empty(lookup("BATCH_SIZE")) {
            config.batch_size = parse_number("BATCH_SIZE", &value)?;
            if config.batch_size == 0 {
                return Err(EtlError::bad_input("BATCH_SIZE must be greater than 0"));
            }
        }
        if let Some(value) = non_empty(lookup("PAGE_SIZE")) {
            config.default_page_size = parse_number("PAGE_SIZE", &value)?;
        }
        if let Some(value) = non_empty(lookup("CONCURRENCY")) {
            let concurrency = parse_number("CONCURRENCY", &value)?;
            validate_concurrency(concurrency)?;
            config.default_concurrency = concurrency;
        }

        debug!(?config, "engine configuration loaded");
        Ok(config)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_number<T>(key: &str, value: &str) -> Result<T, EtlError>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .map_err(|e| EtlError::bad_input_from(format!("failed to parse {key}={value}"), e))
}

/// Parses durations such as `120`, `120s`, `2m`, `500ms` or `1h`.
///
/// A bare number is interpreted as seconds.
///
/// # Errors
///
/// Returns [`EtlError::BadInput`] for unknown units or non-numeric values.
pub fn parse_duration(value: &str) -> Result<Duration, EtlError> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let amount: u64 = number
        .parse()
        .map_err(|e| EtlError::bad_input_from(format!("invalid duration '{value}'"), e))?;
    match unit {
        "" | "s" => Ok(Duration::from_secs(amount)),
        "ms" => Ok(Duration::from_millis(amount)),
        "m" => Ok(Duration::from_secs(amount * 60)),
        "h" => Ok(Duration::from_secs(amount * 3600)),
        other => Err(EtlError::bad_input(format!(
            "invalid duration unit '{other}' in '{value}'"
        ))),
    }
}

fn validate_concurrency(concurrency: usize) -> Result<(), EtlError> {
    if (MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&concurrency) {
        Ok(())
    } else {
        Err(EtlError::bad_input(format!(
            "invalid concurrency value {concurrency}: must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}"
        )))
    }
}

/// Typed options for one task run.
///
/// `S` is the plugin-specific scope (e.g. `{ owner, repo }`), flattened into
/// the same JSON object as the common fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOptions<S> {
    /// Tenant key: which configured connection this run collects for.
    pub connection_id: u64,
    /// High-water mark; presence switches collection to incremental mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    /// Requested page size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<u32>,
    /// Requested request concurrency.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    /// Explicit incremental flag; usually derived from `since`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incremental: Option<bool>,
    /// Subtask names to run; empty means "enabled by default".
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subtasks: Vec<String>,
    /// Domain types the caller needs; empty means "all".
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domain_types: Vec<String>,
    /// Plugin-specific scope.
    #[serde(flatten)]
    pub scope: S,
}

impl<S> TaskOptions<S>
where
    S: DeserializeOwned,
{
    /// Decodes and validates options from a JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`EtlError::BadInput`] if the value does not match the schema or
    /// fails validation.
    pub fn decode(value: serde_json::Value) -> Result<Self, EtlError> {
        let options: Self = serde_json::from_value(value)
            .map_err(|e| EtlError::bad_input_from("failed to decode task options", e))?;
        options.validate()?;
        Ok(options)
    }
}

impl<S> TaskOptions<S> {
    /// Checks value ranges that the schema cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`EtlError::BadInput`] describing the first invalid field.
    pub fn validate(&self) -> Result<(), EtlError> {
        if self.connection_id == 0 {
            return Err(EtlError::bad_input("connectionId is required"));
        }
        if self.page_size == Some(0) {
            return Err(EtlError::bad_input("pageSize must be greater than 0"));
        }
        if let Some(concurrency) = self.concurrency {
            validate_concurrency(concurrency)?;
        }
        if self.incremental == Some(true) && self.since.is_none() {
            return Err(EtlError::bad_input(
                "incremental collection requires a since timestamp",
            ));
        }
        Ok(())
    }

    /// Effective page size.
    #[must_use]
    pub fn page_size_or(&self, config: &EngineConfig) -> u32 {
        self.page_size.unwrap_or(config.default_page_size)
    }

    /// Effective concurrency.
    #[must_use]
    pub fn concurrency_or(&self, config: &EngineConfig) -> usize {
        self.concurrency.unwrap_or(config.default_concurrency)
    }

    /// Whether this run collects incrementally (explicit flag, else `since` presence).
    #[must_use]
    pub fn is_incremental(&self) -> bool {
        self.incremental.unwrap_or(self.since.is_some())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use super::*;
    use crate::error::ErrorKind;

    #[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
    struct RepoScope {
        owner: String,
        repo: String,
    }

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_engine_config_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.api_retry, 3);
        assert_eq!(config.api_requests_per_hour, 18_000);
        assert!((config.rate_limit_damping - 0.98).abs() < f64::EPSILON);
    }

    #[test]
    fn test_engine_config_overrides() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("API_RETRY", "5"),
            ("API_TIMEOUT", "30s"),
            ("API_REQUESTS_PER_HOUR", "0"),
            ("BATCH_SIZE", "50"),
            ("CONCURRENCY", "4"),
        ]))
        .unwrap();
        assert_eq!(config.api_retry, 5);
        assert_eq!(config.api_timeout, Duration::from_secs(30));
        assert_eq!(config.api_requests_per_hour, 0);
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.default_concurrency, 4);
    }

    #[test]
    fn test_engine_config_rejects_garbage() {
        let err = EngineConfig::from_lookup(lookup(&[("API_RETRY", "lots")])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadInput);

        let err = EngineConfig::from_lookup(lookup(&[("CONCURRENCY", "0")])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadInput);

        let err =
            EngineConfig::from_lookup(lookup(&[("API_RATE_LIMIT_DAMPING", "1.5")])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadInput);
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("120").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("10d").is_err());
        assert!(parse_duration("abc").is_err());
    }

    #[test]
    fn test_task_options_decode_with_scope() {
        let options: TaskOptions<RepoScope> = TaskOptions::decode(json!({
            "connectionId": 1,
            "owner": "apache",
            "repo": "incubator",
            "since": "2024-01-02T03:04:05Z",
            "pageSize": 50
        }))
        .unwrap();

        assert_eq!(options.connection_id, 1);
        assert_eq!(options.scope.owner, "apache");
        assert_eq!(options.page_size, Some(50));
        assert!(options.is_incremental());
        assert_eq!(
            options.since.unwrap().to_rfc3339(),
            "2024-01-02T03:04:05+00:00"
        );
    }

    #[test]
    fn test_task_options_defaults_from_engine_config() {
        let options: TaskOptions<RepoScope> = TaskOptions::decode(json!({
            "connectionId": 7, "owner": "o", "repo": "r"
        }))
        .unwrap();
        let config = EngineConfig::default();
        assert_eq!(options.page_size_or(&config), DEFAULT_PAGE_SIZE);
        assert_eq!(options.concurrency_or(&config), DEFAULT_CONCURRENCY);
        assert!(!options.is_incremental());
    }

    #[test]
    fn test_task_options_validation_failures() {
        let missing = TaskOptions::<RepoScope>::decode(json!({"owner": "o", "repo": "r"}));
        assert_eq!(missing.unwrap_err().kind(), ErrorKind::BadInput);

        let zero = TaskOptions::<RepoScope>::decode(json!({
            "connectionId": 0, "owner": "o", "repo": "r"
        }));
        assert_eq!(zero.unwrap_err().kind(), ErrorKind::BadInput);

        let page = TaskOptions::<RepoScope>::decode(json!({
            "connectionId": 1, "owner": "o", "repo": "r", "pageSize": 0
        }));
        assert_eq!(page.unwrap_err().kind(), ErrorKind::BadInput);

        let incremental = TaskOptions::<RepoScope>::decode(json!({
            "connectionId": 1, "owner": "o", "repo": "r", "incremental": true
        }));
        assert_eq!(incremental.unwrap_err().kind(), ErrorKind::BadInput);

        let bad_since = TaskOptions::<RepoScope>::decode(json!({
            "connectionId": 1, "owner": "o", "repo": "r", "since": "yesterday"
        }));
        assert_eq!(bad_since.unwrap_err().kind(), ErrorKind::BadInput);
    }
}
