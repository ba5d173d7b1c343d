//! Database contract used by the permission resolver.
//!
//! The resolver only needs two calls: `read(sql, params) -> rows` and
//! `write(sql, params) -> affected`. Rows come back as JSON objects keyed by
//! column name, so scanners can pick out `issuer_user_id`, `permission` and
//! `extra` without caring which engine produced them.

mod directory;
mod sqlite;

pub use directory::{AppLookup, Directory};
pub use sqlite::SqliteDatabase;

use async_trait::async_trait;
use serde_json::{Map, Value};

use cumulus_types::{CoreError, CoreResult};

/// One result row: column name → value.
pub type Row = Map<String, Value>;

#[async_trait]
pub trait Database: Send + Sync {
    /// Run a query and collect every row.
    async fn read(&self, sql: &str, params: &[Value]) -> CoreResult<Vec<Row>>;

    /// Run a statement; returns the number of affected rows.
    async fn write(&self, sql: &str, params: &[Value]) -> CoreResult<u64>;
}

/// Build `(col = ? OR col = ? ...)` for `count` placeholders.
///
/// The parentheses keep the disjunction from binding to the surrounding
/// `AND`.
pub fn any_of(column: &str, count: usize) -> String {
    let clause = vec![format!("{} = ?", column); count].join(" OR ");
    if count > 1 {
        format!("({})", clause)
    } else {
        clause
    }
}

/// Integer column, or an internal error naming the column.
pub fn row_i64(row: &Row, column: &str) -> CoreResult<i64> {
    row.get(column)
        .and_then(Value::as_i64)
        .ok_or_else(|| CoreError::Internal(format!("row is missing integer column {}", column)))
}

/// Text column, or an internal error naming the column.
pub fn row_str<'r>(row: &'r Row, column: &str) -> CoreResult<&'r str> {
    row.get(column)
        .and_then(Value::as_str)
        .ok_or_else(|| CoreError::Internal(format!("row is missing text column {}", column)))
}

/// Decode the `extra` JSON column of a grant row. Absent or empty → `{}`.
pub fn row_extra(row: &Row) -> Value {
    match row.get("extra") {
        Some(Value::String(s)) if !s.is_empty() => {
            serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.clone()))
        }
        Some(Value::Null) | None => Value::Object(Map::new()),
        Some(Value::String(_)) => Value::Object(Map::new()),
        Some(other) => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn any_of_parenthesizes_multiple() {
        assert_eq!(any_of("permission", 1), "permission = ?");
        assert_eq!(
            any_of("p.permission", 3),
            "(p.permission = ? OR p.permission = ? OR p.permission = ?)"
        );
    }

    #[test]
    fn extra_column_decodes() {
        let mut row = Row::new();
        assert_eq!(row_extra(&row), json!({}));
        row.insert("extra".into(), json!("{\"note\":1}"));
        assert_eq!(row_extra(&row), json!({"note": 1}));
        row.insert("extra".into(), json!(null));
        assert_eq!(row_extra(&row), json!({}));
    }

    #[test]
    fn typed_columns_report_missing() {
        let mut row = Row::new();
        row.insert("id".into(), json!(3));
        assert_eq!(row_i64(&row, "id").unwrap(), 3);
        assert_eq!(row_str(&row, "id").unwrap_err().code(), "internal");
    }
}
