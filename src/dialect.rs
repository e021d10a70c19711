//! Table Reference Resolution
//!
//! Two physical layouts are supported for tenant tables:
//!
//! - `Namespaced`: one database schema per tenant (`"p_<id>"."orders"`),
//!   native boolean and timestamp types, foreign keys, `$n` placeholders.
//! - `Prefixed`: every tenant table lives in one namespace with a
//!   tenant prefix (`"p_<id>__orders"`), SQLite storage classes, `?n`
//!   placeholders.
//!
//! Everything above this module asks the dialect for quoted references and
//! physical types instead of branching on the backend.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::catalog::FieldType;
use crate::ident::quote;

/// Physical DDL dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    Namespaced,
    #[default]
    Prefixed,
}

/// Deterministic tenant namespace derived from the project id
pub fn namespace_name(project_id: &str) -> String {
    format!("p_{}", project_id.replace('-', "_"))
}

/// An already-quoted physical table reference
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef(String);

impl TableRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Types that may be changed in place, and nothing else
pub const SAFE_CONVERSIONS: &[(FieldType, FieldType)] = &[
    (FieldType::Int, FieldType::Float),
    (FieldType::String, FieldType::Text),
    (FieldType::Date, FieldType::Datetime),
];

pub fn is_safe_conversion(from: FieldType, to: FieldType) -> bool {
    SAFE_CONVERSIONS.contains(&(from, to))
}

impl Dialect {
    pub fn table_ref(self, project_id: &str, table: &str) -> TableRef {
        let ns = namespace_name(project_id);
        match self {
            Dialect::Namespaced => TableRef(format!("{}.{}", quote(&ns), quote(table))),
            Dialect::Prefixed => TableRef(quote(&format!("{ns}__{table}"))),
        }
    }

    /// Reference to a tenant index for `DROP INDEX`.
    pub fn index_ref(self, project_id: &str, index: &str) -> String {
        match self {
            Dialect::Namespaced => format!("{}.{}", quote(&namespace_name(project_id)), quote(index)),
            Dialect::Prefixed => quote(index),
        }
    }

    /// Bind placeholder for the `n`th parameter (1-based).
    pub fn placeholder(self, n: usize) -> String {
        match self {
            Dialect::Namespaced => format!("${n}"),
            Dialect::Prefixed => format!("?{n}"),
        }
    }

    /// Rewrite `?` markers in a fixed statement into this dialect's
    /// placeholders. Templates never carry `?` inside literals.
    pub fn render(self, template: &str) -> String {
        match self {
            Dialect::Prefixed => template.to_string(),
            Dialect::Namespaced => {
                let mut out = String::with_capacity(template.len() + 8);
                let mut n = 0;
                for ch in template.chars() {
                    if ch == '?' {
                        n += 1;
                        out.push_str(&self.placeholder(n));
                    } else {
                        out.push(ch);
                    }
                }
                out
            }
        }
    }

    pub fn physical_type(self, field_type: FieldType) -> &'static str {
        match self {
            Dialect::Namespaced => match field_type {
                FieldType::String | FieldType::Text => "text",
                FieldType::Int | FieldType::Relation => "bigint",
                FieldType::Float => "double precision",
                FieldType::Bool => "boolean",
                FieldType::Date => "date",
                FieldType::Datetime => "timestamptz",
                FieldType::Uuid => "uuid",
            },
            Dialect::Prefixed => match field_type {
                FieldType::String
                | FieldType::Text
                | FieldType::Date
                | FieldType::Datetime
                | FieldType::Uuid => "TEXT",
                FieldType::Int | FieldType::Bool | FieldType::Relation => "INTEGER",
                FieldType::Float => "REAL",
            },
        }
    }

    pub fn bool_literal(self, value: bool) -> &'static str {
        match (self, value) {
            (Dialect::Namespaced, true) => "true",
            (Dialect::Namespaced, false) => "false",
            (Dialect::Prefixed, true) => "1",
            (Dialect::Prefixed, false) => "0",
        }
    }

    /// Whether relation columns carry a physical foreign key
    pub fn supports_foreign_keys(self) -> bool {
        matches!(self, Dialect::Namespaced)
    }

    pub fn create_namespace(self, project_id: &str) -> Option<String> {
        match self {
            Dialect::Namespaced => Some(format!(
                "CREATE SCHEMA IF NOT EXISTS {}",
                quote(&namespace_name(project_id))
            )),
            Dialect::Prefixed => None,
        }
    }

    /// `CREATE TABLE` with the fixed system columns and no user fields.
    pub fn create_table(self, table: &TableRef) -> String {
        let (key, ts, actor) = match self {
            Dialect::Namespaced => (
                "BIGSERIAL PRIMARY KEY",
                "timestamptz NOT NULL DEFAULT now()",
                "text NULL",
            ),
            Dialect::Prefixed => (
                "INTEGER PRIMARY KEY AUTOINCREMENT",
                "TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))",
                "TEXT NULL",
            ),
        };
        format!(
            "CREATE TABLE {table} (id {key}, created_at {ts}, updated_at {ts}, \
             created_by_user_id {actor}, created_by_app_user_id {actor})"
        )
    }

    pub fn add_column(self, table: &TableRef, column: &str, column_def: &str) -> String {
        format!("ALTER TABLE {table} ADD COLUMN {} {column_def}", quote(column))
    }

    pub fn create_index(
        self,
        table: &TableRef,
        index: &str,
        column: &str,
        unique: bool,
    ) -> String {
        let kind = if unique { "UNIQUE INDEX" } else { "INDEX" };
        format!("CREATE {kind} {} ON {table} ({})", quote(index), quote(column))
    }

    pub fn drop_index(self, project_id: &str, index: &str) -> String {
        format!("DROP INDEX IF EXISTS {}", self.index_ref(project_id, index))
    }

    pub fn add_foreign_key(
        self,
        table: &TableRef,
        constraint: &str,
        column: &str,
        target: &TableRef,
        on_delete: &str,
    ) -> Option<String> {
        self.supports_foreign_keys().then(|| {
            format!(
                "ALTER TABLE {table} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {target} (id) ON DELETE {on_delete}",
                quote(constraint),
                quote(column)
            )
        })
    }

    /// Rename within the tenant namespace; the new name is never qualified.
    pub fn rename_table(self, project_id: &str, table: &TableRef, new_table: &str) -> String {
        let new_name = match self {
            Dialect::Namespaced => new_table.to_string(),
            Dialect::Prefixed => format!("{}__{new_table}", namespace_name(project_id)),
        };
        format!("ALTER TABLE {table} RENAME TO {}", quote(&new_name))
    }

    pub fn rename_column(self, table: &TableRef, old: &str, new: &str) -> String {
        format!(
            "ALTER TABLE {table} RENAME COLUMN {} TO {}",
            quote(old),
            quote(new)
        )
    }

    pub fn drop_column(self, table: &TableRef, column: &str) -> String {
        format!("ALTER TABLE {table} DROP COLUMN {}", quote(column))
    }

    /// Physical statements for a whitelisted type change. The prefixed
    /// layout stores values by storage class, so only the catalog changes.
    pub fn change_column_type(
        self,
        table: &TableRef,
        column: &str,
        from: FieldType,
        to: FieldType,
    ) -> Vec<String> {
        if self == Dialect::Prefixed {
            return Vec::new();
        }
        let col = quote(column);
        let physical = self.physical_type(to);
        let base = format!("ALTER TABLE {table} ALTER COLUMN {col} TYPE {physical}");
        match (from, to) {
            (FieldType::String, FieldType::Text) => vec![base],
            _ => vec![format!("{base} USING CAST({col} AS {physical})")],
        }
    }

    /// Lock probe for the advisory schema lock, if the backend has one.
    pub fn advisory_lock_probe(self) -> Option<String> {
        match self {
            Dialect::Namespaced => Some(format!(
                "SELECT pg_try_advisory_xact_lock({}) AS locked",
                self.placeholder(1)
            )),
            Dialect::Prefixed => None,
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Namespaced => write!(f, "namespaced"),
            Dialect::Prefixed => write!(f, "prefixed"),
        }
    }
}
