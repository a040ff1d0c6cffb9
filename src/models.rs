//! Shared row model: raw-layer rows, provenance, typed records and domain ids.
//!
//! Tool-layer and domain-layer rows are plain structs that implement
//! [`Record`]. A record describes its own table and columns, so batch writers
//! can create the table on first use and upsert rows without per-type SQL.
//!
//! # Example
//!
//! ```
//! use devflow_core::models::{Column, Provenance, RawDataOrigin, Record, SqlValue};
//!
//! #[derive(Debug, Clone, Default)]
//! struct GithubIssue {
//!     connection_id: u64,
//!     github_id: i64,
//!     title: String,
//!     origin: RawDataOrigin,
//! }
//!
//! impl Provenance for GithubIssue {
//!     fn origin(&self) -> &RawDataOrigin { &self.origin }
//!     fn origin_mut(&mut self) -> &mut RawDataOrigin { &mut self.origin }
//! }
//!
//! impl Record for GithubIssue {
//!     fn table(&self) -> &'static str { "_tool_github_issues" }
//!     fn columns(&self) -> &'static [Column] {
//!         const COLUMNS: &[Column] = &[
//!             Column::key("connection_id", "INTEGER"),
//!             Column::key("github_id", "INTEGER"),
//!             Column::field("title", "TEXT"),
//!         ];
//!         COLUMNS
//!     }
//!     fn values(&self) -> Vec<SqlValue> {
//!         vec![self.connection_id.into(), self.github_id.into(), self.title.clone().into()]
//!     }
//! }
//! ```

use std::fmt::Debug;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, QueryBuilder, Sqlite};

/// One captured API response fragment in a `_raw_<plugin>_<entity>` table.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct RawData {
    /// Auto-increment id, referenced by provenance columns.
    pub id: i64,
    /// Scope discriminator, e.g. `connectionId=1,owner=x,repo=y`.
    pub params: String,
    /// Opaque JSON fragment.
    pub data: Vec<u8>,
    /// Request URL that produced the fragment.
    #[sqlx(default)]
    pub url: Option<String>,
    /// Serialized upstream input for fan-out requests.
    #[sqlx(default)]
    pub input: Option<String>,
    /// RFC3339 creation timestamp.
    pub created_at: String,
}

impl RawData {
    /// Parses the fragment as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` is not valid JSON for `T`.
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.data)
    }

    /// Parses the stored upstream input, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if `input` is present but not valid JSON for `T`.
    pub fn parse_input<T: serde::de::DeserializeOwned>(
        &self,
    ) -> Result<Option<T>, serde_json::Error> {
        self.input.as_deref().map(serde_json::from_str).transpose()
    }
}

/// DDL for a raw table; the caller must pass a quoted identifier.
pub(crate) fn raw_table_ddl(quoted_table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {quoted_table} (\
         id INTEGER PRIMARY KEY AUTOINCREMENT, \
         params TEXT NOT NULL, \
         data BLOB NOT NULL, \
         url TEXT, \
         input TEXT, \
         created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')))"
    )
}

/// Provenance columns stamped on every tool and domain row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct RawDataOrigin {
    /// Params of the source raw row.
    #[sqlx(rename = "_raw_data_params", default)]
    pub raw_data_params: String,
    /// Raw table the row came from.
    #[sqlx(rename = "_raw_data_table", default)]
    pub raw_data_table: String,
    /// Id of the source raw row.
    #[sqlx(rename = "_raw_data_id", default)]
    pub raw_data_id: i64,
    /// Free-form remark (e.g. which extractor produced the row).
    #[sqlx(rename = "_raw_data_remark", default)]
    pub raw_data_remark: String,
}

impl RawDataOrigin {
    /// Provenance column names, in the order of [`values`](Self::values).
    pub const COLUMNS: [Column; 4] = [
        Column::field("_raw_data_params", "TEXT"),
        Column::field("_raw_data_table", "TEXT"),
        Column::field("_raw_data_id", "INTEGER"),
        Column::field("_raw_data_remark", "TEXT"),
    ];

    /// Builds the provenance of `raw` read from `table`.
    #[must_use]
    pub fn from_raw(table: &str, raw: &RawData) -> Self {
        Self {
            raw_data_params: raw.params.clone(),
            raw_data_table: table.to_string(),
            raw_data_id: raw.id,
            raw_data_remark: String::new(),
        }
    }

    /// Whether no provenance has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.raw_data_table.is_empty() && self.raw_data_id == 0
    }

    /// Column values in [`COLUMNS`](Self::COLUMNS) order.
    #[must_use]
    pub fn values(&self) -> Vec<SqlValue> {
        vec![
            self.raw_data_params.clone().into(),
            self.raw_data_table.clone().into(),
            self.raw_data_id.into(),
            self.raw_data_remark.clone().into(),
        ]
    }
}

/// A column of a [`Record`] table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    /// Column name.
    pub name: &'static str,
    /// SQLite type affinity (`INTEGER`, `TEXT`, `REAL`, `BLOB`).
    pub sql_type: &'static str,
    /// Part of the primary key.
    pub primary_key: bool,
}

impl Column {
    /// A primary-key column.
    #[must_use]
    pub const fn key(name: &'static str, sql_type: &'static str) -> Self {
        Self {
            name,
            sql_type,
            primary_key: true,
        }
    }

    /// A regular column.
    #[must_use]
    pub const fn field(name: &'static str, sql_type: &'static str) -> Self {
        Self {
            name,
            sql_type,
            primary_key: false,
        }
    }
}

/// A value bound into generated SQL.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// SQL NULL.
    Null,
    /// 64-bit integer.
    Int(i64),
    /// Floating point.
    Real(f64),
    /// Text.
    Text(String),
    /// Binary blob.
    Bytes(Vec<u8>),
    /// Boolean (stored as 0/1).
    Bool(bool),
}

impl SqlValue {
    pub(crate) fn bind_to<'args>(&self, builder: &mut QueryBuilder<'args, Sqlite>) {
        match self {
            Self::Null => {
                builder.push_bind(Option::<i64>::None);
            }
            Self::Int(v) => {
                builder.push_bind(*v);
            }
            Self::Real(v) => {
                builder.push_bind(*v);
            }
            Self::Text(v) => {
                builder.push_bind(v.clone());
            }
            Self::Bytes(v) => {
                builder.push_bind(v.clone());
            }
            Self::Bool(v) => {
                builder.push_bind(*v);
            }
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u32> for SqlValue {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u64> for SqlValue {
    fn from(v: u64) -> Self {
        // SQLite integers are signed 64-bit; ids above i64::MAX do not occur in practice.
        Self::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        Self::Real(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Text(v.to_rfc3339())
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// Access to a row's provenance columns.
pub trait Provenance {
    /// The row's provenance.
    fn origin(&self) -> &RawDataOrigin;
    /// Mutable provenance, stamped by extractors and converters.
    fn origin_mut(&mut self) -> &mut RawDataOrigin;
}

/// A tool-layer or domain-layer row that knows how to persist itself.
///
/// `values()` must return one value per entry of `columns()`, in the same
/// order. Provenance columns are appended by the writer and must not be
/// listed in `columns()`.
pub trait Record: Provenance + Debug + Send + Sync + 'static {
    /// Destination table.
    fn table(&self) -> &'static str;
    /// Column layout of the destination table (provenance excluded).
    fn columns(&self) -> &'static [Column];
    /// Column values in `columns()` order.
    fn values(&self) -> Vec<SqlValue>;
}

/// Generates deterministic cross-tool domain ids.
///
/// The format is `<plugin>:<Entity>:<id>:<id>...`, where the ids are the
/// connection id followed by the entity's external key parts.
///
/// # Example
///
/// ```
/// use devflow_core::models::DomainIdGenerator;
///
/// let issues = DomainIdGenerator::new("github", "GithubIssue");
/// assert_eq!(issues.generate(&[&1, &42]), "github:GithubIssue:1:42");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainIdGenerator {
    prefix: String,
}

impl DomainIdGenerator {
    /// Creates a generator for one plugin entity.
    #[must_use]
    pub fn new(plugin: &str, entity: &str) -> Self {
        Self {
            prefix: format!("{plugin}:{entity}"),
        }
    }

    /// Generates an id from the connection id and external key parts.
    #[must_use]
    pub fn generate(&self, parts: &[&dyn std::fmt::Display]) -> String {
        let mut id = self.prefix.clone();
        for part in parts {
            id.push(':');
            id.push_str(&part.to_string());
        }
        id
    }

    /// Splits a generated id back into its key parts (after plugin and entity).
    ///
    /// Returns `None` when `id` was not produced by this generator.
    #[must_use]
    pub fn parts<'a>(&self, id: &'a str) -> Option<Vec<&'a str>> {
        let rest = id.strip_prefix(&self.prefix)?;
        let rest = rest.strip_prefix(':')?;
        Some(rest.split(':').collect())
    }
}
