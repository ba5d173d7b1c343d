//! SQLite implementation of [`Database`].

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, OpenFlags, params_from_iter};
use serde_json::{Map, Number, Value};

use cumulus_types::{CoreError, CoreResult};

use super::{Database, Row};

/// Schema SQL embedded from schema/permissions.sql.
const SCHEMA_SQL: &str = include_str!("../../../../schema/permissions.sql");

fn db_err(err: rusqlite::Error) -> CoreError {
    CoreError::Internal(format!("database: {}", err))
}

/// Permission store backed by SQLite.
pub struct SqliteDatabase {
    conn: Mutex<Connection>,
}

impl SqliteDatabase {
    /// Open or create a database at the given path.
    ///
    /// Creates parent directories and initializes schema if needed.
    pub fn open(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(db_err)?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Create an in-memory database (for tests and ephemeral kernels).
    pub fn in_memory() -> CoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> CoreResult<()> {
        self.conn()?.execute_batch(SCHEMA_SQL).map_err(db_err)
    }

    fn conn(&self) -> CoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| CoreError::Internal("database lock poisoned".to_string()))
    }
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(*b as i64),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        // Structured values are stored as JSON text, like `extra`.
        other => SqlValue::Text(other.to_string()),
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Array(b.iter().map(|byte| Value::from(*byte)).collect()),
    }
}

#[async_trait]
impl Database for SqliteDatabase {
    async fn read(&self, sql: &str, params: &[Value]) -> CoreResult<Vec<Row>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

        let mut rows = stmt
            .query(params_from_iter(params.iter().map(to_sql)))
            .map_err(db_err)?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(db_err)? {
            let mut map = Map::new();
            for (i, name) in columns.iter().enumerate() {
                let value = row.get_ref(i).map_err(db_err)?;
                map.insert(name.clone(), from_sql(value));
            }
            out.push(map);
        }
        tracing::trace!(sql, rows = out.len(), "db read");
        Ok(out)
    }

    async fn write(&self, sql: &str, params: &[Value]) -> CoreResult<u64> {
        let conn = self.conn()?;
        let affected = conn
            .execute(sql, params_from_iter(params.iter().map(to_sql)))
            .map_err(db_err)?;
        tracing::trace!(sql, affected, "db write");
        Ok(affected as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn read_returns_named_columns() {
        let db = SqliteDatabase::in_memory().unwrap();
        db.write(
            "INSERT INTO user (uuid, username) VALUES (?, ?)",
            &[json!("00000000-0000-0000-0000-000000000001"), json!("alice")],
        )
        .await
        .unwrap();

        let rows = db
            .read("SELECT id, username, email FROM user WHERE username = ?", &[json!("alice")])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["username"], json!("alice"));
        assert_eq!(rows[0]["email"], Value::Null);
        assert!(rows[0]["id"].as_i64().is_some());
    }

    #[tokio::test]
    async fn structured_params_store_as_json_text() {
        let db = SqliteDatabase::in_memory().unwrap();
        for name in ["a", "b"] {
            db.write(
                "INSERT INTO user (uuid, username) VALUES (?, ?)",
                &[json!(format!("uuid-{}", name)), json!(name)],
            )
            .await
            .unwrap();
        }
        let affected = db
            .write(
                "INSERT INTO user_to_user_permissions (holder_user_id, issuer_user_id, permission, extra) \
                 VALUES (1, 2, 'fs:x:read', ?)",
                &[json!({"note": "hi"})],
            )
            .await
            .unwrap();
        assert_eq!(affected, 1);

        let rows = db
            .read("SELECT extra FROM user_to_user_permissions", &[])
            .await
            .unwrap();
        assert_eq!(crate::db::row_extra(&rows[0]), json!({"note": "hi"}));
    }

    #[test]
    fn open_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/perms.db");
        SqliteDatabase::open(&path).unwrap();
        assert!(path.exists());
    }
}
