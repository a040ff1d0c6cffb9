//! Typed SELECT builder used by converters and database-driven input iterators.
//!
//! Clauses are explicit builder calls rather than a variadic clause list. Values
//! are always bound, never interpolated; each `?` in a `where` fragment consumes
//! one bound value in order.
//!
//! # Example
//!
//! ```
//! use devflow_core::SelectQuery;
//! use devflow_core::models::SqlValue;
//!
//! let query = SelectQuery::from("_tool_github_issues i")
//!     .select(&["i.id", "i.title", "r.name AS repo_name"])
//!     .join("LEFT JOIN _tool_github_repos r ON r.id = i.repo_id")
//!     .where_clause("i.connection_id = ? AND i.state = ?", vec![SqlValue::Int(1), "open".into()])
//!     .order_by("i.id")
//!     .limit(100);
//!
//! assert_eq!(
//!     query.to_sql(),
//!     "SELECT i.id, i.title, r.name AS repo_name FROM _tool_github_issues i \
//!      LEFT JOIN _tool_github_repos r ON r.id = i.repo_id \
//!      WHERE (i.connection_id = ? AND i.state = ?) ORDER BY i.id LIMIT 100"
//! );
//! ```

use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, QueryBuilder, Row, Sqlite, TypeInfo, ValueRef};

use crate::error::EtlError;
use crate::models::SqlValue;

/// A SELECT statement assembled from typed parts.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectQuery {
    columns: Vec<String>,
    from: String,
    joins: Vec<String>,
    wheres: Vec<(String, Vec<SqlValue>)>,
    order_by: Vec<String>,
    limit: Option<u64>,
    offset: Option<u64>,
}

impl SelectQuery {
    /// Starts a query over `table` (may include an alias).
    #[must_use]
    pub fn from(table: impl Into<String>) -> Self {
        Self {
            from: table.into(),
            ..Self::default()
        }
    }

    /// Sets the selected columns; `*` is used when none are given.
    #[must_use]
    pub fn select(mut self, columns: &[&str]) -> Self {
        self.columns = columns.iter().map(|c| (*c).to_string()).collect();
        self
    }

    /// Appends a join clause, e.g. `LEFT JOIN b ON b.id = a.b_id`.
    #[must_use]
    pub fn join(mut self, clause: impl Into<String>) -> Self {
        self.joins.push(clause.into());
        self
    }

    /// Adds a condition; fragments are AND-ed together.
    #[must_use]
    pub fn where_clause(mut self, fragment: impl Into<String>, binds: Vec<SqlValue>) -> Self {
        self.wheres.push((fragment.into(), binds));
        self
    }

    /// Appends an ORDER BY term.
    #[must_use]
    pub fn order_by(mut self, term: impl Into<String>) -> Self {
        self.order_by.push(term.into());
        self
    }

    /// Sets the LIMIT.
    #[must_use]
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sets the OFFSET.
    #[must_use]
    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Renders the statement with `?` placeholders (for logging and tests).
    #[must_use]
    pub fn to_sql(&self) -> String {
        let mut sql = self.head();
        self.push_tail_sql(&mut sql);
        sql
    }

    fn head(&self) -> String {
        let columns = if self.columns.is_empty() {
            "*".to_string()
        } else {
            self.columns.join(", ")
        };
        let mut sql = format!("SELECT {columns} FROM {}", self.from);
        for join in &self.joins {
            sql.push(' ');
            sql.push_str(join);
        }
        if !self.wheres.is_empty() {
            let conditions: Vec<String> = self
                .wheres
                .iter()
                .map(|(fragment, _)| format!("({fragment})"))
                .collect();
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql
    }

    fn push_tail_sql(&self, sql: &mut String) {
        if !self.order_by.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&self.order_by.join(", "));
        }
        match (self.limit, self.offset) {
            (Some(limit), Some(offset)) => sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}")),
            (Some(limit), None) => sql.push_str(&format!(" LIMIT {limit}")),
            (None, Some(offset)) => sql.push_str(&format!(" LIMIT -1 OFFSET {offset}")),
            (None, None) => {}
        }
    }

    /// Builds an executable query with all values bound.
    ///
    /// # Errors
    ///
    /// Returns [`EtlError::BadInput`] when the table is missing or a fragment's
    /// placeholder count does not match its bound values.
    pub fn build(&self) -> Result<QueryBuilder<'static, Sqlite>, EtlError> {
        let mut builder = self.builder_head()?;
        let mut tail = String::new();
        self.push_tail_sql(&mut tail);
        builder.push(tail);
        Ok(builder)
    }

    /// Builds `SELECT COUNT(*)` over the same FROM/JOIN/WHERE.
    ///
    /// # Errors
    ///
    /// Same as [`build`](Self::build).
    pub fn build_count(&self) -> Result<QueryBuilder<'static, Sqlite>, EtlError> {
        self.build_aggregate("COUNT(*)")
    }

    /// Builds `SELECT <expression>` over the same FROM/JOIN/WHERE, e.g. `MAX(i.id)`.
    ///
    /// # Errors
    ///
    /// Same as [`build`](Self::build).
    pub fn build_aggregate(&self, expression: &str) -> Result<QueryBuilder<'static, Sqlite>, EtlError> {
        let aggregate = Self {
            columns: vec![expression.to_string()],
            order_by: Vec::new(),
            limit: None,
            offset: None,
            ..self.clone()
        };
        aggregate.builder_head()
    }

    /// The FROM clause as given, e.g. `_tool_github_issues i`.
    #[must_use]
    pub fn from_table(&self) -> &str {
        &self.from
    }

    /// One keyset page: rows with `after < key <= upper`, ordered by `key`,
    /// with the key selected as `alias`. Any previous ordering, limit and
    /// offset are replaced.
    #[must_use]
    pub fn keyset_page(&self, key: &str, alias: &str, after: Option<i64>, upper: i64, limit: u64) -> Self {
        let mut page = self.clone();
        if page.columns.is_empty() {
            page.columns.push("*".to_string());
        }
        page.columns.push(format!("{key} AS {alias}"));
        match after {
            Some(after) => {
                page = page.where_clause(
                    format!("{key} > ? AND {key} <= ?"),
                    vec![SqlValue::Int(after), SqlValue::Int(upper)],
                );
            }
            None => page = page.where_clause(format!("{key} <= ?"), vec![SqlValue::Int(upper)]),
        }
        page.order_by = vec![key.to_string()];
        page.limit = Some(limit);
        page.offset = None;
        page
    }

    fn builder_head(&self) -> Result<QueryBuilder<'static, Sqlite>, EtlError> {
        if self.from.trim().is_empty() {
            return Err(EtlError::bad_input("select query requires a FROM table"));
        }
        let columns = if self.columns.is_empty() {
            "*".to_string()
        } else {
            self.columns.join(", ")
        };
        let mut builder = QueryBuilder::new(format!("SELECT {columns} FROM {}", self.from));
        for join in &self.joins {
            builder.push(" ");
            builder.push(join);
        }
        for (index, (fragment, binds)) in self.wheres.iter().enumerate() {
            builder.push(if index == 0 { " WHERE (" } else { " AND (" });
            push_fragment(&mut builder, fragment, binds)?;
            builder.push(")");
        }
        Ok(builder)
    }
}

fn push_fragment(
    builder: &mut QueryBuilder<'static, Sqlite>,
    fragment: &str,
    binds: &[SqlValue],
) -> Result<(), EtlError> {
    let parts: Vec<&str> = fragment.split('?').collect();
    if parts.len() - 1 != binds.len() {
        return Err(EtlError::bad_input(format!(
            "where clause '{fragment}' has {} placeholders but {} values",
            parts.len() - 1,
            binds.len()
        )));
    }
    for (index, part) in parts.iter().enumerate() {
        builder.push(*part);
        if let Some(value) = binds.get(index) {
            value.bind_to(builder);
        }
    }
    Ok(())
}

/// Converts a dynamically-typed row into a JSON object keyed by column name.
///
/// # Errors
///
/// Returns an error if a column value cannot be decoded.
pub fn row_to_json(row: &SqliteRow) -> Result<Value, EtlError> {
    let mut object = Map::new();
    for (index, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(index)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            let type_name = raw.type_info().name().to_ascii_uppercase();
            match type_name.as_str() {
                "INTEGER" | "INT8" | "BIGINT" | "BOOLEAN" => {
                    Value::from(row.try_get_unchecked::<i64, _>(index)?)
                }
                "REAL" | "NUMERIC" => Value::from(row.try_get_unchecked::<f64, _>(index)?),
                "BLOB" => {
                    let bytes = row.try_get_unchecked::<Vec<u8>, _>(index)?;
                    Value::from(String::from_utf8_lossy(&bytes).into_owned())
                }
                _ => Value::from(row.try_get_unchecked::<String, _>(index)?),
            }
        };
        object.insert(column.name().to_string(), value);
    }
    Ok(Value::Object(object))
}
