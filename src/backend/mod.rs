//! Backend execution seam
//!
//! The engine never opens, begins or commits anything. Callers hand it an
//! [`Executor`] bound to an open transaction; every statement of one engine
//! call runs inside that transaction.

pub mod sqlite;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use tracing::debug;

use crate::dialect::Dialect;
use crate::error::{EngineError, EngineResult};

pub use sqlite::{open_database, open_in_memory, SqliteExecutor};

/// One result row, column name to value, in select order
pub type Record = Map<String, Value>;

pub trait Executor {
    fn dialect(&self) -> Dialect;

    /// Run a catalog or data statement; returns rows affected.
    fn execute(&self, sql: &str, params: &[Value]) -> EngineResult<usize>;

    fn query(&self, sql: &str, params: &[Value]) -> EngineResult<Vec<Record>>;

    fn query_one(&self, sql: &str, params: &[Value]) -> EngineResult<Option<Record>> {
        Ok(self.query(sql, params)?.into_iter().next())
    }

    /// Run physical DDL against tenant tables.
    fn execute_ddl(&self, sql: &str) -> EngineResult<()> {
        debug!(sql = %sql, "ddl");
        self.execute(sql, &[]).map(|_| ()).map_err(|e| EngineError::Ddl {
            statement: sql.to_string(),
            message: e.to_string(),
        })
    }
}

/// Run a `?`-templated statement.
pub fn run(exec: &dyn Executor, template: &str, params: &[Value]) -> EngineResult<usize> {
    exec.execute(&exec.dialect().render(template), params)
}

/// Query with a `?`-templated statement.
pub fn fetch(exec: &dyn Executor, template: &str, params: &[Value]) -> EngineResult<Vec<Record>> {
    exec.query(&exec.dialect().render(template), params)
}

pub fn fetch_one(exec: &dyn Executor, template: &str, params: &[Value]) -> EngineResult<Option<Record>> {
    exec.query_one(&exec.dialect().render(template), params)
}

/// Catalog booleans are stored as 0/1 on every backend.
pub fn flag(value: bool) -> Value {
    Value::from(i64::from(value))
}

/// Canonical timestamp text stored in the catalog
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(raw: &str) -> EngineResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| EngineError::Corrupt(format!("bad timestamp '{raw}': {e}")))
}

/// Typed column access for catalog rows
pub trait RowExt {
    fn text(&self, col: &str) -> EngineResult<String>;
    fn opt_text(&self, col: &str) -> Option<String>;
    fn int(&self, col: &str) -> EngineResult<i64>;
    fn flag(&self, col: &str) -> bool;
    fn time(&self, col: &str) -> EngineResult<DateTime<Utc>>;
    fn opt_time(&self, col: &str) -> EngineResult<Option<DateTime<Utc>>>;
    fn json(&self, col: &str) -> EngineResult<Value>;
}

impl RowExt for Record {
    fn text(&self, col: &str) -> EngineResult<String> {
        self.opt_text(col)
            .ok_or_else(|| EngineError::Corrupt(format!("column '{col}' is missing or null")))
    }

    fn opt_text(&self, col: &str) -> Option<String> {
        match self.get(col)? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    fn int(&self, col: &str) -> EngineResult<i64> {
        self.get(col)
            .and_then(Value::as_i64)
            .ok_or_else(|| EngineError::Corrupt(format!("column '{col}' is not an integer")))
    }

    fn flag(&self, col: &str) -> bool {
        match self.get(col) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
            _ => false,
        }
    }

    fn time(&self, col: &str) -> EngineResult<DateTime<Utc>> {
        parse_timestamp(&self.text(col)?)
    }

    fn opt_time(&self, col: &str) -> EngineResult<Option<DateTime<Utc>>> {
        self.opt_text(col).map(|raw| parse_timestamp(&raw)).transpose()
    }

    fn json(&self, col: &str) -> EngineResult<Value> {
        match self.opt_text(col) {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Value::Null),
        }
    }
}

/// Positional parameter list that hands out dialect placeholders
#[derive(Debug)]
pub struct Binds {
    dialect: Dialect,
    values: Vec<Value>,
}

impl Binds {
    pub fn new(dialect: Dialect) -> Self {
        Binds {
            dialect,
            values: Vec::new(),
        }
    }

    /// Add a value and return its placeholder.
    pub fn push(&mut self, value: impl Into<Value>) -> String {
        self.values.push(value.into());
        self.dialect.placeholder(self.values.len())
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}
