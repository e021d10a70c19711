//! Catalog reads and writes

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use super::model::*;
use crate::backend::{fetch, fetch_one, flag, run, timestamp, Executor, Record, RowExt};
use crate::error::{EngineError, EngineResult};

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn opt(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |s| json!(s))
}

fn opt_time(value: Option<DateTime<Utc>>) -> Value {
    value.map_or(Value::Null, |t| json!(timestamp(t)))
}

fn parse<T: std::str::FromStr<Err = String>>(raw: &str) -> EngineResult<T> {
    raw.parse().map_err(EngineError::Corrupt)
}

// ── Projects ────────────────────────────────────────────────────────────

pub fn insert_project(exec: &dyn Executor, name: &str) -> EngineResult<Project> {
    let project = Project {
        id: new_id(),
        name: name.to_string(),
        created_at: Utc::now(),
    };
    run(
        exec,
        "INSERT INTO projects (id, name, created_at) VALUES (?, ?, ?)",
        &[
            json!(project.id),
            json!(project.name),
            json!(timestamp(project.created_at)),
        ],
    )?;
    Ok(project)
}

pub fn get_project(exec: &dyn Executor, id: &str) -> EngineResult<Project> {
    let row = fetch_one(
        exec,
        "SELECT id, name, created_at FROM projects WHERE id = ?",
        &[json!(id)],
    )?
    .ok_or_else(|| EngineError::not_found("Project", id))?;
    Ok(Project {
        id: row.text("id")?,
        name: row.text("name")?,
        created_at: row.time("created_at")?,
    })
}

// ── Collections ─────────────────────────────────────────────────────────

const COLLECTION_COLUMNS: &str = "id, project_id, name, display_name, sql_table_name, is_active, \
                                  is_system, created_at, updated_at";

fn collection_from_row(row: &Record) -> EngineResult<Collection> {
    Ok(Collection {
        id: row.text("id")?,
        project_id: row.text("project_id")?,
        name: row.text("name")?,
        display_name: row.opt_text("display_name"),
        sql_table_name: row.text("sql_table_name")?,
        is_active: row.flag("is_active"),
        is_system: row.flag("is_system"),
        created_at: row.time("created_at")?,
        updated_at: row.time("updated_at")?,
    })
}

pub fn insert_collection(exec: &dyn Executor, c: &Collection) -> EngineResult<()> {
    run(
        exec,
        &format!("INSERT INTO collections ({COLLECTION_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"),
        &[
            json!(c.id),
            json!(c.project_id),
            json!(c.name),
            opt(c.display_name.as_deref()),
            json!(c.sql_table_name),
            flag(c.is_active),
            flag(c.is_system),
            json!(timestamp(c.created_at)),
            json!(timestamp(c.updated_at)),
        ],
    )?;
    Ok(())
}

pub fn get_collection(exec: &dyn Executor, id: &str) -> EngineResult<Collection> {
    let row = fetch_one(
        exec,
        &format!("SELECT {COLLECTION_COLUMNS} FROM collections WHERE id = ?"),
        &[json!(id)],
    )?
    .ok_or_else(|| EngineError::not_found("Collection", id))?;
    collection_from_row(&row)
}

/// Active collection by its current name
pub fn find_collection(
    exec: &dyn Executor,
    project_id: &str,
    name: &str,
) -> EngineResult<Option<Collection>> {
    fetch_one(
        exec,
        &format!(
            "SELECT {COLLECTION_COLUMNS} FROM collections \
             WHERE project_id = ? AND name = ? AND is_active = 1"
        ),
        &[json!(project_id), json!(name)],
    )?
    .as_ref()
    .map(collection_from_row)
    .transpose()
}

/// Any collection, active or not, whose name or table is `name`. A
/// deactivated collection keeps its table, so its names stay taken.
pub fn find_collection_claiming(
    exec: &dyn Executor,
    project_id: &str,
    name: &str,
) -> EngineResult<Option<Collection>> {
    fetch_one(
        exec,
        &format!(
            "SELECT {COLLECTION_COLUMNS} FROM collections \
             WHERE project_id = ? AND (name = ? OR sql_table_name = ?) \
             ORDER BY is_active DESC LIMIT 1"
        ),
        &[json!(project_id), json!(name), json!(name)],
    )?
    .as_ref()
    .map(collection_from_row)
    .transpose()
}

pub fn list_collections(exec: &dyn Executor, project_id: &str) -> EngineResult<Vec<Collection>> {
    fetch(
        exec,
        &format!(
            "SELECT {COLLECTION_COLUMNS} FROM collections \
             WHERE project_id = ? AND is_active = 1 ORDER BY name"
        ),
        &[json!(project_id)],
    )?
    .iter()
    .map(collection_from_row)
    .collect()
}

pub fn update_collection(exec: &dyn Executor, c: &Collection) -> EngineResult<()> {
    run(
        exec,
        "UPDATE collections SET name = ?, display_name = ?, sql_table_name = ?, is_active = ?, \
         updated_at = ? WHERE id = ?",
        &[
            json!(c.name),
            opt(c.display_name.as_deref()),
            json!(c.sql_table_name),
            flag(c.is_active),
            json!(timestamp(c.updated_at)),
            json!(c.id),
        ],
    )?;
    Ok(())
}

// ── Fields ──────────────────────────────────────────────────────────────

const FIELD_COLUMNS: &str = "id, collection_id, name, display_name, field_type, sql_column_name, \
                             is_required, is_unique, is_indexed, default_value, is_deleted, \
                             deleted_at, is_system, is_hidden, relation_target_collection_id, \
                             relation_type, relation_on_delete, relation_display_field, created_at";

fn field_from_row(row: &Record) -> EngineResult<Field> {
    let relation = match row.opt_text("relation_target_collection_id") {
        Some(target_collection_id) => Some(RelationSpec {
            target_collection_id,
            relation_type: parse(&row.opt_text("relation_type").unwrap_or_else(|| "many_to_one".into()))?,
            on_delete: parse(&row.opt_text("relation_on_delete").unwrap_or_else(|| "RESTRICT".into()))?,
            display_field: row.opt_text("relation_display_field"),
        }),
        None => None,
    };
    Ok(Field {
        id: row.text("id")?,
        collection_id: row.text("collection_id")?,
        name: row.text("name")?,
        display_name: row.opt_text("display_name"),
        field_type: parse(&row.text("field_type")?)?,
        sql_column_name: row.text("sql_column_name")?,
        is_required: row.flag("is_required"),
        is_unique: row.flag("is_unique"),
        is_indexed: row.flag("is_indexed"),
        default_value: row.opt_text("default_value"),
        is_deleted: row.flag("is_deleted"),
        deleted_at: row.opt_time("deleted_at")?,
        is_system: row.flag("is_system"),
        is_hidden: row.flag("is_hidden"),
        relation,
        created_at: row.time("created_at")?,
    })
}

fn field_params(f: &Field) -> Vec<Value> {
    let rel = f.relation.as_ref();
    vec![
        json!(f.id),
        json!(f.collection_id),
        json!(f.name),
        opt(f.display_name.as_deref()),
        json!(f.field_type.as_str()),
        json!(f.sql_column_name),
        flag(f.is_required),
        flag(f.is_unique),
        flag(f.is_indexed),
        opt(f.default_value.as_deref()),
        flag(f.is_deleted),
        opt_time(f.deleted_at),
        flag(f.is_system),
        flag(f.is_hidden),
        opt(rel.map(|r| r.target_collection_id.as_str())),
        opt(rel.map(|_| "many_to_one")),
        opt(rel.map(|r| r.on_delete.as_sql())),
        opt(rel.and_then(|r| r.display_field.as_deref())),
        json!(timestamp(f.created_at)),
    ]
}

pub fn insert_field(exec: &dyn Executor, f: &Field) -> EngineResult<()> {
    let marks = vec!["?"; 19].join(", ");
    run(
        exec,
        &format!("INSERT INTO fields ({FIELD_COLUMNS}) VALUES ({marks})"),
        &field_params(f),
    )?;
    Ok(())
}

/// Rewrite every mutable column of a field row.
pub fn update_field(exec: &dyn Executor, f: &Field) -> EngineResult<()> {
    run(
        exec,
        "UPDATE fields SET name = ?, display_name = ?, field_type = ?, sql_column_name = ?, \
         is_required = ?, is_unique = ?, is_indexed = ?, default_value = ?, is_deleted = ?, \
         deleted_at = ?, is_hidden = ? WHERE id = ?",
        &[
            json!(f.name),
            opt(f.display_name.as_deref()),
            json!(f.field_type.as_str()),
            json!(f.sql_column_name),
            flag(f.is_required),
            flag(f.is_unique),
            flag(f.is_indexed),
            opt(f.default_value.as_deref()),
            flag(f.is_deleted),
            opt_time(f.deleted_at),
            flag(f.is_hidden),
            json!(f.id),
        ],
    )?;
    Ok(())
}

pub fn get_field(exec: &dyn Executor, id: &str) -> EngineResult<Field> {
    let row = fetch_one(
        exec,
        &format!("SELECT {FIELD_COLUMNS} FROM fields WHERE id = ?"),
        &[json!(id)],
    )?
    .ok_or_else(|| EngineError::not_found("Field", id))?;
    field_from_row(&row)
}

/// Field by current name, deleted or not
pub fn find_field(
    exec: &dyn Executor,
    collection_id: &str,
    name: &str,
) -> EngineResult<Option<Field>> {
    fetch_one(
        exec,
        &format!("SELECT {FIELD_COLUMNS} FROM fields WHERE collection_id = ? AND name = ?"),
        &[json!(collection_id), json!(name)],
    )?
    .as_ref()
    .map(field_from_row)
    .transpose()
}

pub fn list_fields(
    exec: &dyn Executor,
    collection_id: &str,
    include_deleted: bool,
) -> EngineResult<Vec<Field>> {
    let filter = if include_deleted { "" } else { " AND is_deleted = 0" };
    fetch(
        exec,
        &format!(
            "SELECT {FIELD_COLUMNS} FROM fields WHERE collection_id = ?{filter} \
             ORDER BY created_at, name"
        ),
        &[json!(collection_id)],
    )?
    .iter()
    .map(field_from_row)
    .collect()
}

/// Relation fields anywhere in the project that point at `collection_id`
pub fn list_fields_targeting(exec: &dyn Executor, collection_id: &str) -> EngineResult<Vec<Field>> {
    fetch(
        exec,
        &format!(
            "SELECT {FIELD_COLUMNS} FROM fields \
             WHERE relation_target_collection_id = ? AND is_deleted = 0 ORDER BY name"
        ),
        &[json!(collection_id)],
    )?
    .iter()
    .map(field_from_row)
    .collect()
}

/// Remove a field row together with its aliases and validation rules.
pub fn delete_field(exec: &dyn Executor, field_id: &str) -> EngineResult<()> {
    run(exec, "DELETE FROM field_aliases WHERE field_id = ?", &[json!(field_id)])?;
    run(exec, "DELETE FROM validation_rules WHERE field_id = ?", &[json!(field_id)])?;
    run(exec, "DELETE FROM fields WHERE id = ?", &[json!(field_id)])?;
    Ok(())
}

// ── Aliases ─────────────────────────────────────────────────────────────

pub fn insert_collection_alias(exec: &dyn Executor, a: &CollectionAlias) -> EngineResult<()> {
    run(
        exec,
        "INSERT INTO collection_aliases (id, project_id, collection_id, old_name, expires_at, created_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
        &[
            json!(a.id),
            json!(a.project_id),
            json!(a.collection_id),
            json!(a.old_name),
            opt_time(a.expires_at),
            json!(timestamp(a.created_at)),
        ],
    )?;
    Ok(())
}

pub fn insert_field_alias(exec: &dyn Executor, a: &FieldAlias) -> EngineResult<()> {
    run(
        exec,
        "INSERT INTO field_aliases (id, collection_id, field_id, old_name, expires_at, created_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
        &[
            json!(a.id),
            json!(a.collection_id),
            json!(a.field_id),
            json!(a.old_name),
            opt_time(a.expires_at),
            json!(timestamp(a.created_at)),
        ],
    )?;
    Ok(())
}

fn collection_alias_from_row(row: &Record) -> EngineResult<CollectionAlias> {
    Ok(CollectionAlias {
        id: row.text("id")?,
        project_id: row.text("project_id")?,
        collection_id: row.text("collection_id")?,
        old_name: row.text("old_name")?,
        expires_at: row.opt_time("expires_at")?,
        created_at: row.time("created_at")?,
    })
}

fn field_alias_from_row(row: &Record) -> EngineResult<FieldAlias> {
    Ok(FieldAlias {
        id: row.text("id")?,
        collection_id: row.text("collection_id")?,
        field_id: row.text("field_id")?,
        old_name: row.text("old_name")?,
        expires_at: row.opt_time("expires_at")?,
        created_at: row.time("created_at")?,
    })
}

/// Collection aliases for a project, newest first; `old_name` narrows.
pub fn collection_aliases(
    exec: &dyn Executor,
    project_id: &str,
    old_name: Option<&str>,
) -> EngineResult<Vec<CollectionAlias>> {
    let rows = match old_name {
        Some(name) => fetch(
            exec,
            "SELECT * FROM collection_aliases WHERE project_id = ? AND old_name = ? \
             ORDER BY created_at DESC",
            &[json!(project_id), json!(name)],
        )?,
        None => fetch(
            exec,
            "SELECT * FROM collection_aliases WHERE project_id = ? ORDER BY created_at DESC",
            &[json!(project_id)],
        )?,
    };
    rows.iter().map(collection_alias_from_row).collect()
}

pub fn field_aliases(
    exec: &dyn Executor,
    collection_id: &str,
    old_name: Option<&str>,
) -> EngineResult<Vec<FieldAlias>> {
    let rows = match old_name {
        Some(name) => fetch(
            exec,
            "SELECT * FROM field_aliases WHERE collection_id = ? AND old_name = ? \
             ORDER BY created_at DESC",
            &[json!(collection_id), json!(name)],
        )?,
        None => fetch(
            exec,
            "SELECT * FROM field_aliases WHERE collection_id = ? ORDER BY created_at DESC",
            &[json!(collection_id)],
        )?,
    };
    rows.iter().map(field_alias_from_row).collect()
}

// ── Schema ledger ───────────────────────────────────────────────────────

fn schema_op_from_row(row: &Record) -> EngineResult<SchemaOp> {
    Ok(SchemaOp {
        id: row.text("id")?,
        project_id: row.text("project_id")?,
        collection_id: row.opt_text("collection_id"),
        op_type: parse(&row.text("op_type")?)?,
        payload: row.json("payload_json")?,
        status: row.text("status")?,
        actor_user_id: row.opt_text("actor_user_id"),
        created_at: row.time("created_at")?,
    })
}

/// Append an applied op to the ledger.
pub fn log_op(
    exec: &dyn Executor,
    project_id: &str,
    collection_id: Option<&str>,
    op_type: OpType,
    payload: Value,
    actor_user_id: Option<&str>,
) -> EngineResult<SchemaOp> {
    let op = SchemaOp {
        id: new_id(),
        project_id: project_id.to_string(),
        collection_id: collection_id.map(str::to_string),
        op_type,
        payload,
        status: "applied".to_string(),
        actor_user_id: actor_user_id.map(str::to_string),
        created_at: Utc::now(),
    };
    run(
        exec,
        "INSERT INTO schema_ops (id, seq, project_id, collection_id, op_type, payload_json, status, \
         actor_user_id, created_at) \
         VALUES (?, (SELECT COALESCE(MAX(seq), 0) + 1 FROM schema_ops), ?, ?, ?, ?, ?, ?, ?)",
        &[
            json!(op.id),
            json!(op.project_id),
            opt(op.collection_id.as_deref()),
            json!(op.op_type.as_str()),
            json!(op.payload.to_string()),
            json!(op.status),
            opt(op.actor_user_id.as_deref()),
            json!(timestamp(op.created_at)),
        ],
    )?;
    debug!(project = %project_id, op = %op_type, "schema_op_logged");
    Ok(op)
}

/// Ledger entries, newest first
pub fn list_schema_ops(
    exec: &dyn Executor,
    project_id: &str,
    collection_id: Option<&str>,
    limit: usize,
) -> EngineResult<Vec<SchemaOp>> {
    let rows = match collection_id {
        Some(cid) => fetch(
            exec,
            "SELECT * FROM schema_ops WHERE project_id = ? AND collection_id = ? \
             ORDER BY seq DESC LIMIT ?",
            &[json!(project_id), json!(cid), json!(limit)],
        )?,
        None => fetch(
            exec,
            "SELECT * FROM schema_ops WHERE project_id = ? ORDER BY seq DESC LIMIT ?",
            &[json!(project_id), json!(limit)],
        )?,
    };
    rows.iter().map(schema_op_from_row).collect()
}

pub fn has_op(exec: &dyn Executor, project_id: &str, op_type: OpType) -> EngineResult<bool> {
    Ok(fetch_one(
        exec,
        "SELECT id FROM schema_ops WHERE project_id = ? AND op_type = ? LIMIT 1",
        &[json!(project_id), json!(op_type.as_str())],
    )?
    .is_some())
}
