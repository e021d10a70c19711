//! Catalog table definitions
//!
//! Plain `TEXT`/`INTEGER` columns only, so the same statements install the
//! catalog on either backend. Booleans are stored as 0/1 and timestamps as
//! RFC 3339 UTC text.

use serde_json::json;
use tracing::info;

use crate::backend::Executor;
use crate::error::EngineResult;

/// Current catalog layout version
pub const CATALOG_VERSION: i64 = 1;

const CATALOG_TABLES: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS catalog_version (
        version INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS projects (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS collections (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL REFERENCES projects(id),
        name TEXT NOT NULL,
        display_name TEXT,
        sql_table_name TEXT NOT NULL,
        is_active INTEGER NOT NULL DEFAULT 1,
        is_system INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS ix_collections_project ON collections (project_id, name)",
    "CREATE TABLE IF NOT EXISTS fields (
        id TEXT PRIMARY KEY,
        collection_id TEXT NOT NULL REFERENCES collections(id),
        name TEXT NOT NULL,
        display_name TEXT,
        field_type TEXT NOT NULL,
        sql_column_name TEXT NOT NULL,
        is_required INTEGER NOT NULL DEFAULT 0,
        is_unique INTEGER NOT NULL DEFAULT 0,
        is_indexed INTEGER NOT NULL DEFAULT 0,
        default_value TEXT,
        is_deleted INTEGER NOT NULL DEFAULT 0,
        deleted_at TEXT,
        is_system INTEGER NOT NULL DEFAULT 0,
        is_hidden INTEGER NOT NULL DEFAULT 0,
        relation_target_collection_id TEXT,
        relation_type TEXT,
        relation_on_delete TEXT,
        relation_display_field TEXT,
        created_at TEXT NOT NULL,
        UNIQUE (collection_id, name)
    )",
    "CREATE TABLE IF NOT EXISTS collection_aliases (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL,
        collection_id TEXT NOT NULL REFERENCES collections(id),
        old_name TEXT NOT NULL,
        expires_at TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS ix_collection_aliases_name ON collection_aliases (project_id, old_name)",
    "CREATE TABLE IF NOT EXISTS field_aliases (
        id TEXT PRIMARY KEY,
        collection_id TEXT NOT NULL,
        field_id TEXT NOT NULL,
        old_name TEXT NOT NULL,
        expires_at TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS ix_field_aliases_name ON field_aliases (collection_id, old_name)",
    "CREATE TABLE IF NOT EXISTS schema_ops (
        id TEXT PRIMARY KEY,
        seq INTEGER NOT NULL,
        project_id TEXT NOT NULL,
        collection_id TEXT,
        op_type TEXT NOT NULL,
        payload_json TEXT NOT NULL,
        status TEXT NOT NULL,
        actor_user_id TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS ix_schema_ops_project ON schema_ops (project_id, seq)",
    "CREATE TABLE IF NOT EXISTS policies (
        id TEXT PRIMARY KEY,
        collection_id TEXT NOT NULL,
        name TEXT NOT NULL,
        description TEXT,
        action TEXT NOT NULL,
        effect TEXT NOT NULL,
        condition_json TEXT,
        priority INTEGER NOT NULL DEFAULT 0,
        is_active INTEGER NOT NULL DEFAULT 1,
        allowed_principals TEXT,
        require_email_verified INTEGER NOT NULL DEFAULT 0,
        allowed_roles TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS ix_policies_collection ON policies (collection_id)",
    "CREATE TABLE IF NOT EXISTS roles (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL,
        name TEXT NOT NULL,
        description TEXT,
        is_default INTEGER NOT NULL DEFAULT 0,
        is_system INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        UNIQUE (project_id, name)
    )",
    "CREATE TABLE IF NOT EXISTS app_user_roles (
        id TEXT PRIMARY KEY,
        app_user_id TEXT NOT NULL,
        role_id TEXT NOT NULL REFERENCES roles(id),
        created_at TEXT NOT NULL,
        UNIQUE (app_user_id, role_id)
    )",
    "CREATE TABLE IF NOT EXISTS views (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL,
        collection_id TEXT NOT NULL,
        name TEXT NOT NULL,
        description TEXT,
        version INTEGER NOT NULL,
        definition_json TEXT NOT NULL,
        default_limit INTEGER NOT NULL,
        max_limit INTEGER NOT NULL,
        is_active INTEGER NOT NULL DEFAULT 1,
        created_by_user_id TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS ix_views_project ON views (project_id, name)",
    "CREATE TABLE IF NOT EXISTS view_versions (
        id TEXT PRIMARY KEY,
        view_id TEXT NOT NULL REFERENCES views(id),
        version INTEGER NOT NULL,
        definition_json TEXT NOT NULL,
        default_limit INTEGER NOT NULL,
        max_limit INTEGER NOT NULL,
        created_by_user_id TEXT,
        created_at TEXT NOT NULL,
        UNIQUE (view_id, version)
    )",
    "CREATE TABLE IF NOT EXISTS validation_rules (
        id TEXT PRIMARY KEY,
        field_id TEXT NOT NULL,
        rule_json TEXT NOT NULL,
        error_message TEXT,
        priority INTEGER NOT NULL DEFAULT 0,
        is_active INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS ix_validation_rules_field ON validation_rules (field_id)",
    "CREATE TABLE IF NOT EXISTS audit_events (
        id TEXT PRIMARY KEY,
        seq INTEGER NOT NULL,
        project_id TEXT NOT NULL,
        collection_id TEXT NOT NULL,
        record_id INTEGER NOT NULL,
        action TEXT NOT NULL,
        actor_user_id TEXT,
        actor_app_user_id TEXT,
        actor_api_key_id TEXT,
        old_data_json TEXT,
        new_data_json TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS ix_audit_events_project ON audit_events (project_id, seq)",
];

/// Install or upgrade the catalog. Idempotent.
pub fn migrate(exec: &dyn Executor) -> EngineResult<()> {
    for stmt in CATALOG_TABLES {
        exec.execute(stmt, &[])?;
    }

    let current = exec
        .query_one("SELECT MAX(version) AS version FROM catalog_version", &[])?
        .and_then(|row| row.get("version").and_then(serde_json::Value::as_i64));

    if current.is_none() {
        let p = exec.dialect().placeholder(1);
        exec.execute(
            &format!("INSERT INTO catalog_version (version) VALUES ({p})"),
            &[json!(CATALOG_VERSION)],
        )?;
        info!(version = CATALOG_VERSION, "catalog_installed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SqliteExecutor;
    use rusqlite::Connection;

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        let exec = SqliteExecutor::new(&conn);
        migrate(&exec).unwrap();
        migrate(&exec).unwrap();

        let rows = exec.query("SELECT version FROM catalog_version", &[]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["version"], serde_json::json!(CATALOG_VERSION));
    }
}
