//! SQLite executor (prefixed dialect)

use std::path::Path;
use std::time::Duration;

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde_json::{Number, Value};
use tracing::{debug, info};

use super::{Executor, Record};
use crate::catalog;
use crate::dialect::Dialect;
use crate::error::EngineResult;

/// Executor over a borrowed connection or open transaction
pub struct SqliteExecutor<'c> {
    conn: &'c Connection,
}

impl<'c> SqliteExecutor<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        SqliteExecutor { conn }
    }
}

impl Executor for SqliteExecutor<'_> {
    fn dialect(&self) -> Dialect {
        Dialect::Prefixed
    }

    fn execute(&self, sql: &str, params: &[Value]) -> EngineResult<usize> {
        let mut stmt = self.conn.prepare(sql)?;
        Ok(stmt.execute(params_from_iter(params.iter().map(to_sql)))?)
    }

    fn query(&self, sql: &str, params: &[Value]) -> EngineResult<Vec<Record>> {
        let mut stmt = self.conn.prepare(sql)?;
        let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let mut rows = stmt.query(params_from_iter(params.iter().map(to_sql)))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut record = Record::new();
            for (i, name) in names.iter().enumerate() {
                record.insert(name.clone(), from_sql(row.get_ref(i)?));
            }
            out.push(record);
        }
        Ok(out)
    }
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Number(i.into()),
        ValueRef::Real(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(bytes.iter().map(|b| format!("{b:02x}")).collect()),
    }
}

/// Open or create a database file and bring the catalog up to date.
pub fn open_database(path: &Path, busy_timeout: Duration) -> EngineResult<Connection> {
    info!(path = %path.display(), "open_database");
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            crate::error::EngineError::Corrupt(format!(
                "cannot create {}: {e}",
                parent.display()
            ))
        })?;
    }

    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;")?;
    conn.busy_timeout(busy_timeout)?;
    catalog::migrate(&SqliteExecutor::new(&conn))?;
    Ok(conn)
}

/// In-memory database with the catalog installed (tests, previews)
pub fn open_in_memory() -> EngineResult<Connection> {
    debug!("open_in_memory");
    let conn = Connection::open_in_memory()?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    catalog::migrate(&SqliteExecutor::new(&conn))?;
    Ok(conn)
}
