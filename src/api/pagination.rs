//! Page cursors, URL templates and total-page signals.
//!
//! Collectors describe each request with a [`RequestData`]: the current
//! [`Pager`], the run's scope parameters, the fan-out input row (if any) and
//! custom data carried over from the previous response (cursor pagination).
//!
//! URL templates use `{name}` placeholders:
//!
//! | Placeholder | Value |
//! |-------------|-------|
//! | `{page}`, `{pageSize}`, `{skip}` | current pager |
//! | `{input.field}` | field of the fan-out input row (dotted paths allowed) |
//! | `{field}` | field of the scope parameters (dotted paths allowed) |
//!
//! Substituted values are percent-encoded.
//!
//! # Example
//!
//! ```
//! use devflow_core::api::{Pager, RequestData, render_url_template};
//! use serde_json::json;
//!
//! let params = json!({"connectionId": 1, "owner": "apache", "repo": "incubator-devlake"});
//! let input = json!({"number": 42});
//! let data = RequestData::new(Pager::new(1, 100), &params).with_input(&input);
//!
//! let url = render_url_template("repos/{owner}/{repo}/pulls/{input.number}/commits", &data).unwrap();
//! assert_eq!(url, "repos/apache/incubator-devlake/pulls/42/commits");
//! ```

use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde_json::Value;
use url::Url;

use super::client::ApiResponse;
use crate::error::EtlError;

/// `{name}` placeholders in URL templates.
#[allow(clippy::expect_used)]
static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([A-Za-z0-9_.]+)\}").expect("placeholder regex is valid")
});

/// The `rel="last"` entry of a `Link` header.
#[allow(clippy::expect_used)]
static LINK_LAST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<([^>]+)>\s*;\s*rel="?last"?"#).expect("link regex is valid")
});

/// Position of one page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pager {
    /// 1-based page number.
    pub page: u32,
    /// Requested page size (0 in single-request mode).
    pub size: u32,
    /// Items before this page, `(page - 1) * size`.
    pub skip: u32,
}

impl Pager {
    /// Creates a pager; `page` is clamped to at least 1.
    #[must_use]
    pub fn new(page: u32, size: u32) -> Self {
        let page = page.max(1);
        Self {
            page,
            size,
            skip: (page - 1).saturating_mul(size),
        }
    }

    /// The pager for the following page.
    #[must_use]
    pub fn next(&self) -> Self {
        Self::new(self.page.saturating_add(1), self.size)
    }
}

/// Everything a request builder can see.
#[derive(Debug, Clone, Copy)]
pub struct RequestData<'a> {
    pub pager: Pager,
    /// Scope parameters of the run (connection id, owner, repo, ...).
    pub params: &'a Value,
    /// Current fan-out input row.
    pub input: Option<&'a Value>,
    /// Data extracted from the previous response in sequential mode.
    pub custom_data: Option<&'a Value>,
}

impl<'a> RequestData<'a> {
    #[must_use]
    pub fn new(pager: Pager, params: &'a Value) -> Self {
        Self {
            pager,
            params,
            input: None,
            custom_data: None,
        }
    }

    #[must_use]
    pub fn with_input(mut self, input: &'a Value) -> Self {
        self.input = Some(input);
        self
    }

    #[must_use]
    pub fn with_custom_data(mut self, custom_data: &'a Value) -> Self {
        self.custom_data = Some(custom_data);
        self
    }
}

/// Reads the total number of pages from the first page's response.
///
/// `Ok(None)` means the response carries no usable signal.
pub type TotalPagesFn =
    Arc<dyn Fn(&ApiResponse) -> Result<Option<u32>, EtlError> + Send + Sync>;

/// Builds the query string pairs of one request.
pub type QueryFn =
    Arc<dyn Fn(&RequestData<'_>) -> Result<Vec<(String, String)>, EtlError> + Send + Sync>;

/// Builds the JSON body of one request (`None` sends no body).
pub type BodyFn =
    Arc<dyn Fn(&RequestData<'_>) -> Result<Option<Value>, EtlError> + Send + Sync>;

/// Derives the custom data of the next request from the current response.
///
/// Returning `Ok(None)` ends sequential pagination.
pub type NextPageFn =
    Arc<dyn Fn(&RequestData<'_>, &ApiResponse) -> Result<Option<Value>, EtlError> + Send + Sync>;

/// Substitutes `{placeholder}` variables in a URL template.
///
/// # Errors
///
/// Returns [`EtlError::BadInput`] for a placeholder with no value, or one
/// whose value is an object or array.
pub fn render_url_template(template: &str, data: &RequestData<'_>) -> Result<String, EtlError> {
    let mut rendered = String::with_capacity(template.len());
    let mut last = 0;

    for captures in PLACEHOLDER.captures_iter(template) {
        let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        rendered.push_str(&template[last..whole.start()]);
        let value = lookup(name.as_str(), data).ok_or_else(|| {
            EtlError::bad_input(format!(
                "url template variable {{{}}} has no value",
                name.as_str()
            ))
        })?;
        rendered.push_str(&urlencoding::encode(&value));
        last = whole.end();
    }
    rendered.push_str(&template[last..]);
    Ok(rendered)
}

fn lookup(name: &str, data: &RequestData<'_>) -> Option<String> {
    match name {
        "page" => return Some(data.pager.page.to_string()),
        "pageSize" => return Some(data.pager.size.to_string()),
        "skip" => return Some(data.pager.skip.to_string()),
        _ => {}
    }
    let value = match name.strip_prefix("input.") {
        Some(path) => walk(data.input?, path)?,
        None => walk(data.params, name)?,
    };
    scalar_text(value)
}

fn walk<'v>(root: &'v Value, path: &str) -> Option<&'v Value> {
    path.split('.').try_fold(root, |value, key| value.get(key))
}

/// Renders a scalar JSON value the way it appears in a URL.
pub(crate) fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// Reads the page count from a numeric header such as `X-Total-Pages`.
#[must_use]
pub fn total_pages_from_header(header: &'static str) -> TotalPagesFn {
    Arc::new(move |response: &ApiResponse| {
        let Some(value) = response.header_str(header) else {
            return Ok(None);
        };
        value.trim().parse::<u32>().map(Some).map_err(|e| {
            EtlError::bad_input_from(format!("invalid {header} header value {value:?}"), e)
        })
    })
}

/// Reads the page count from the `rel="last"` entry of a `Link` header.
#[must_use]
pub fn total_pages_from_link_header() -> TotalPagesFn {
    Arc::new(|response: &ApiResponse| -> Result<Option<u32>, EtlError> {
        Ok(response
            .header_str("link")
            .and_then(last_page_from_link))
    })
}

/// Extracts the `page` query parameter of the `rel="last"` link.
#[must_use]
pub fn last_page_from_link(link: &str) -> Option<u32> {
    let target = LINK_LAST.captures(link)?.get(1)?.as_str();
    let url = Url::parse(target)
        .or_else(|_| Url::parse("http://placeholder.invalid/")?.join(target))
        .ok()?;
    url.query_pairs()
        .find(|(key, _)| key == "page")
        .and_then(|(_, value)| value.parse().ok())
}

/// Query builder adding `page` and `per_page` style parameters.
#[must_use]
pub fn page_query(page_param: &'static str, size_param: &'static str) -> QueryFn {
    Arc::new(move |data: &RequestData<'_>| -> Result<Vec<(String, String)>, EtlError> {
        Ok(vec![
            (page_param.to_string(), data.pager.page.to_string()),
            (size_param.to_string(), data.pager.size.to_string()),
        ])
    })
}
