//! `sql` requests against a local libSQL database file.

use std::path::{Path, PathBuf};

use libsql::params::Params;
use serde_json::{Map, Value, json};
use tokio::sync::OnceCell;
use tracing::info;

use crate::error::ExecutorError;

/// Maximum rows returned from one query.
const MAX_ROWS: usize = 1000;

/// Lazily opened libSQL database.
pub struct SqlCapability {
    path: PathBuf,
    db: OnceCell<libsql::Database>,
}

impl std::fmt::Debug for SqlCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlCapability")
            .field("path", &self.path)
            .field("open", &self.db.initialized())
            .finish()
    }
}

impl SqlCapability {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            db: OnceCell::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn connect(&self) -> Result<libsql::Connection, ExecutorError> {
        let db = self
            .db
            .get_or_try_init(|| async {
                if let Some(parent) = self.path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let db = libsql::Builder::new_local(&self.path)
                    .build()
                    .await
                    .map_err(|e| ExecutorError::Sql(format!("Failed to open database: {e}")))?;
                info!(path = %self.path.display(), "SQL database opened");
                Ok::<_, ExecutorError>(db)
            })
            .await?;
        db.connect()
            .map_err(|e| ExecutorError::Sql(format!("Failed to create connection: {e}")))
    }

    /// Run one statement. Row-returning statements yield `columns` and
    /// `rows`; anything else yields `rows_affected`.
    pub async fn run(&self, query: &str, params: &[Value]) -> Result<Value, ExecutorError> {
        let conn = self.connect().await?;
        let params = Params::Positional(params.iter().map(to_sql_value).collect());

        if !returns_rows(query) {
            let affected = conn
                .execute(query, params)
                .await
                .map_err(|e| ExecutorError::Sql(e.to_string()))?;
            return Ok(json!({ "rows_affected": affected }));
        }

        let mut rows = conn
            .query(query, params)
            .await
            .map_err(|e| ExecutorError::Sql(e.to_string()))?;
        let columns: Vec<String> = (0..rows.column_count())
            .map(|i| rows.column_name(i).unwrap_or_default().to_string())
            .collect();

        let mut out = Vec::new();
        let mut truncated = false;
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| ExecutorError::Sql(e.to_string()))?
        {
            if out.len() == MAX_ROWS {
                truncated = true;
                break;
            }
            let mut record = Map::new();
            for (i, name) in columns.iter().enumerate() {
                let value = row
                    .get_value(i as i32)
                    .map_err(|e| ExecutorError::Sql(e.to_string()))?;
                record.insert(name.clone(), from_sql_value(value));
            }
            out.push(Value::Object(record));
        }

        Ok(json!({
            "columns": columns,
            "row_count": out.len(),
            "rows": out,
            "truncated": truncated,
        }))
    }
}

fn returns_rows(query: &str) -> bool {
    let head = query
        .trim_start()
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    matches!(
        head.as_str(),
        "SELECT" | "WITH" | "PRAGMA" | "EXPLAIN" | "VALUES"
    ) || query.to_ascii_uppercase().contains(" RETURNING ")
}

fn to_sql_value(value: &Value) -> libsql::Value {
    match value {
        Value::Null => libsql::Value::Null,
        Value::Bool(b) => libsql::Value::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => libsql::Value::Integer(i),
            None => libsql::Value::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => libsql::Value::Text(s.clone()),
        other => libsql::Value::Text(other.to_string()),
    }
}

fn from_sql_value(value: libsql::Value) -> Value {
    match value {
        libsql::Value::Null => Value::Null,
        libsql::Value::Integer(i) => json!(i),
        libsql::Value::Real(f) => json!(f),
        libsql::Value::Text(s) => Value::String(s),
        libsql::Value::Blob(bytes) => {
            Value::String(bytes.iter().map(|b| format!("{b:02x}")).collect())
        }
    }
}
