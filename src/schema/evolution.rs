//! Schema Evolution Engine
//!
//! Life cycle of a field: `active -> (rename)* -> active`,
//! `active -> soft_deleted -> (restore -> active | hard_deleted)`.
//! Collections are only ever renamed or deactivated.
//!
//! Every rename leaves an alias behind so the old name keeps resolving for
//! the configured grace period. Name lookups therefore go through
//! [`TenantScope::resolve_collection`] and [`TenantScope::resolve_field`]
//! on every access path.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::info;

use crate::backend::timestamp;
use crate::catalog::{
    alias_is_live, new_id, store, Collection, CollectionAlias, Field, FieldAlias, FieldType,
    OpType,
};
use crate::dialect::is_safe_conversion;
use crate::engine::TenantScope;
use crate::error::{EngineError, EngineResult};
use crate::ident::{is_system_column, require_slug};

/// Human-readable list of the conversions `change_field_type` accepts
pub const SUPPORTED_CONVERSIONS: &str = "int→float, string→text, date→datetime";

/// Aliases that still resolve
#[derive(Debug, Clone, Default, Serialize)]
pub struct ActiveAliases {
    pub collections: Vec<CollectionAlias>,
    pub fields: Vec<FieldAlias>,
}

impl TenantScope<'_> {
    /// Active collection by current name, else by a live alias.
    pub fn resolve_collection(&self, name: &str) -> EngineResult<Collection> {
        self.resolve_collection_at(name, self.now())
    }

    pub fn resolve_collection_at(&self, name: &str, now: DateTime<Utc>) -> EngineResult<Collection> {
        if let Some(c) = store::find_collection(self.exec, &self.project.id, name)? {
            return Ok(c);
        }
        for alias in store::collection_aliases(self.exec, &self.project.id, Some(name))? {
            if !alias_is_live(alias.expires_at, now) {
                continue;
            }
            let target = store::get_collection(self.exec, &alias.collection_id)?;
            if target.is_active {
                return Ok(target);
            }
        }
        Err(EngineError::not_found("Collection", name))
    }

    /// Live field by current name, else by a live alias.
    pub fn resolve_field(&self, collection: &Collection, name: &str) -> EngineResult<Field> {
        self.resolve_field_at(collection, name, self.now())
    }

    pub fn resolve_field_at(
        &self,
        collection: &Collection,
        name: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<Field> {
        if let Some(f) = store::find_field(self.exec, &collection.id, name)? {
            if !f.is_deleted {
                return Ok(f);
            }
        }
        for alias in store::field_aliases(self.exec, &collection.id, Some(name))? {
            if !alias_is_live(alias.expires_at, now) {
                continue;
            }
            let target = store::get_field(self.exec, &alias.field_id)?;
            if !target.is_deleted {
                return Ok(target);
            }
        }
        Err(EngineError::not_found("Field", name))
    }

    /// Every alias of this project that has not expired yet.
    pub fn active_aliases(&self) -> EngineResult<ActiveAliases> {
        let now = self.now();
        let collections = store::collection_aliases(self.exec, &self.project.id, None)?
            .into_iter()
            .filter(|a| alias_is_live(a.expires_at, now))
            .collect();
        let mut fields = Vec::new();
        for c in store::list_collections(self.exec, &self.project.id)? {
            fields.extend(
                store::field_aliases(self.exec, &c.id, None)?
                    .into_iter()
                    .filter(|a| alias_is_live(a.expires_at, now)),
            );
        }
        Ok(ActiveAliases { collections, fields })
    }

    fn alias_expiry(&self) -> DateTime<Utc> {
        self.now() + self.config().schema.alias_grace()
    }

    pub fn rename_collection(
        &self,
        collection: &Collection,
        new_name: &str,
    ) -> EngineResult<Collection> {
        if collection.is_system {
            return Err(EngineError::validation(format!(
                "System collection '{}' cannot be renamed",
                collection.name
            )));
        }
        require_slug(new_name, "Collection")?;
        if new_name == collection.name {
            return Err(EngineError::validation(format!(
                "Collection is already named '{new_name}'"
            )));
        }

        let _guard = self.lock_collection(&collection.id)?;
        let current = store::get_collection(self.exec, &collection.id)?;
        if !current.is_active {
            return Err(EngineError::not_found("Collection", &collection.name));
        }
        if current.name != collection.name {
            return Err(EngineError::conflict(format!(
                "Collection '{}' was renamed to '{}' by another change",
                collection.name, current.name
            )));
        }
        self.check_collection_name_free(new_name)?;

        let table = self.table_ref(&current);
        self.exec
            .execute_ddl(&self.dialect().rename_table(&self.project.id, &table, new_name))?;

        let now = self.now();
        let expires_at = self.alias_expiry();
        store::insert_collection_alias(
            self.exec,
            &CollectionAlias {
                id: new_id(),
                project_id: self.project.id.clone(),
                collection_id: current.id.clone(),
                old_name: current.name.clone(),
                expires_at: Some(expires_at),
                created_at: now,
            },
        )?;

        let renamed = Collection {
            name: new_name.to_string(),
            sql_table_name: new_name.to_string(),
            updated_at: now,
            ..current.clone()
        };
        store::update_collection(self.exec, &renamed)?;
        store::log_op(
            self.exec,
            &self.project.id,
            Some(&current.id),
            OpType::RenameTable,
            json!({
                "old_name": current.name,
                "new_name": new_name,
                "old_sql_table_name": current.sql_table_name,
                "new_sql_table_name": renamed.sql_table_name,
                "alias_expires_at": timestamp(expires_at),
            }),
            self.actor_user_id(),
        )?;
        info!(
            project = %self.project.id,
            old_name = %current.name,
            new_name = %new_name,
            "rename_table"
        );
        Ok(renamed)
    }

    /// Re-read a field under the lock and make sure nobody changed it.
    fn reload_field(&self, field: &Field) -> EngineResult<Field> {
        let current = store::get_field(self.exec, &field.id)?;
        if current.name != field.name {
            return Err(EngineError::conflict(format!(
                "Field '{}' was renamed to '{}' by another change",
                field.name, current.name
            )));
        }
        Ok(current)
    }

    pub fn rename_field(
        &self,
        collection: &Collection,
        field: &Field,
        new_name: &str,
    ) -> EngineResult<Field> {
        if field.is_system {
            return Err(EngineError::validation(format!(
                "System field '{}' cannot be renamed",
                field.name
            )));
        }
        if field.is_deleted {
            return Err(EngineError::validation(format!(
                "Field '{}' is deleted; restore it before renaming",
                field.name
            )));
        }
        require_slug(new_name, "Field")?;
        if is_system_column(new_name) {
            return Err(EngineError::validation(format!(
                "'{new_name}' is a reserved system column"
            )));
        }
        if new_name == field.name {
            return Err(EngineError::validation(format!(
                "Field is already named '{new_name}'"
            )));
        }

        let _guard = self.lock_collection(&collection.id)?;
        let current = self.reload_field(field)?;
        if store::find_field(self.exec, &collection.id, new_name)?.is_some() {
            return Err(EngineError::conflict(format!(
                "Field '{new_name}' already exists in collection '{}'",
                collection.name
            )));
        }
        let new_column = if current.field_type == FieldType::Relation {
            format!("{new_name}_id")
        } else {
            new_name.to_string()
        };
        self.ensure_column_free(collection, &new_column)?;

        let table = self.table_ref(collection);
        self.exec.execute_ddl(&self.dialect().rename_column(
            &table,
            &current.sql_column_name,
            &new_column,
        ))?;

        let now = self.now();
        let expires_at = self.alias_expiry();
        store::insert_field_alias(
            self.exec,
            &FieldAlias {
                id: new_id(),
                collection_id: collection.id.clone(),
                field_id: current.id.clone(),
                old_name: current.name.clone(),
                expires_at: Some(expires_at),
                created_at: now,
            },
        )?;

        let renamed = Field {
            name: new_name.to_string(),
            sql_column_name: new_column,
            ..current.clone()
        };
        store::update_field(self.exec, &renamed)?;
        store::log_op(
            self.exec,
            &self.project.id,
            Some(&collection.id),
            OpType::RenameColumn,
            json!({
                "field_id": current.id,
                "old_name": current.name,
                "new_name": new_name,
                "old_sql_column_name": current.sql_column_name,
                "new_sql_column_name": renamed.sql_column_name,
                "alias_expires_at": timestamp(expires_at),
            }),
            self.actor_user_id(),
        )?;
        info!(
            collection = %collection.name,
            old_name = %current.name,
            new_name = %new_name,
            "rename_column"
        );
        Ok(renamed)
    }

    /// Catalog-only delete: the column and its data stay in place.
    pub fn soft_delete_field(&self, collection: &Collection, field: &Field) -> EngineResult<Field> {
        if field.is_system {
            return Err(EngineError::validation(format!(
                "System field '{}' cannot be deleted",
                field.name
            )));
        }
        let _guard = self.lock_collection(&collection.id)?;
        let current = self.reload_field(field)?;
        if current.is_deleted {
            return Err(EngineError::validation(format!(
                "Field '{}' is already deleted",
                field.name
            )));
        }

        let deleted = Field {
            is_deleted: true,
            deleted_at: Some(self.now()),
            ..current
        };
        store::update_field(self.exec, &deleted)?;
        store::log_op(
            self.exec,
            &self.project.id,
            Some(&collection.id),
            OpType::SoftDeleteColumn,
            json!({
                "field_id": deleted.id,
                "field_name": deleted.name,
                "column_name": deleted.sql_column_name,
            }),
            self.actor_user_id(),
        )?;
        info!(collection = %collection.name, field = %deleted.name, "soft_delete_column");
        Ok(deleted)
    }

    pub fn restore_field(&self, collection: &Collection, field: &Field) -> EngineResult<Field> {
        let _guard = self.lock_collection(&collection.id)?;
        let current = self.reload_field(field)?;
        if !current.is_deleted {
            return Err(EngineError::validation(format!(
                "Field '{}' is not deleted",
                field.name
            )));
        }

        let restored = Field {
            is_deleted: false,
            deleted_at: None,
            ..current
        };
        store::update_field(self.exec, &restored)?;
        store::log_op(
            self.exec,
            &self.project.id,
            Some(&collection.id),
            OpType::RestoreColumn,
            json!({
                "field_id": restored.id,
                "field_name": restored.name,
            }),
            self.actor_user_id(),
        )?;
        info!(collection = %collection.name, field = %restored.name, "restore_column");
        Ok(restored)
    }

    /// Drop the column and the field row. Irreversible.
    pub fn hard_delete_field(
        &self,
        collection: &Collection,
        field: &Field,
        force: bool,
    ) -> EngineResult<()> {
        check_hard_delete(field, force)?;

        let _guard = self.lock_collection(&collection.id)?;
        let current = self.reload_field(field)?;
        // A restore may have landed since the caller read the field
        check_hard_delete(&current, force)?;
        let table = self.table_ref(collection);
        for stmt in drop_column_statements(self, &table, &current) {
            self.exec.execute_ddl(&stmt)?;
        }
        store::delete_field(self.exec, &current.id)?;
        store::log_op(
            self.exec,
            &self.project.id,
            Some(&collection.id),
            OpType::DropColumn,
            json!({
                "field_id": current.id,
                "field_name": current.name,
                "column_name": current.sql_column_name,
                "forced": force && !current.is_deleted,
            }),
            self.actor_user_id(),
        )?;
        info!(collection = %collection.name, field = %current.name, "drop_column");
        Ok(())
    }

    /// Change the logical type along one of the safe conversions.
    pub fn change_field_type(
        &self,
        collection: &Collection,
        field: &Field,
        new_type: FieldType,
    ) -> EngineResult<Field> {
        check_type_change(field, new_type)?;

        let _guard = self.lock_collection(&collection.id)?;
        let current = self.reload_field(field)?;
        check_type_change(&current, new_type)?;
        let table = self.table_ref(collection);
        for stmt in self.dialect().change_column_type(
            &table,
            &current.sql_column_name,
            current.field_type,
            new_type,
        ) {
            self.exec.execute_ddl(&stmt)?;
        }

        let changed = Field {
            field_type: new_type,
            ..current.clone()
        };
        store::update_field(self.exec, &changed)?;
        store::log_op(
            self.exec,
            &self.project.id,
            Some(&collection.id),
            OpType::ChangeColumnType,
            json!({
                "field_id": changed.id,
                "column_name": changed.sql_column_name,
                "old_type": current.field_type,
                "new_type": new_type,
            }),
            self.actor_user_id(),
        )?;
        info!(
            collection = %collection.name,
            field = %changed.name,
            old_type = %current.field_type,
            new_type = %new_type,
            "change_column_type"
        );
        Ok(changed)
    }
}

fn check_hard_delete(field: &Field, force: bool) -> EngineResult<()> {
    if field.is_system {
        return Err(EngineError::validation(format!(
            "System field '{}' cannot be deleted",
            field.name
        )));
    }
    if !field.is_deleted && !force {
        return Err(EngineError::validation(format!(
            "Field '{}' must be soft-deleted first (or use force=true)",
            field.name
        )));
    }
    Ok(())
}

/// Rejections shared by execution and preview; nothing here touches the backend.
pub(crate) fn check_type_change(field: &Field, new_type: FieldType) -> EngineResult<()> {
    if field.is_system {
        return Err(EngineError::validation(format!(
            "System field '{}' cannot change type",
            field.name
        )));
    }
    if field.is_deleted {
        return Err(EngineError::validation(format!(
            "Field '{}' is deleted",
            field.name
        )));
    }
    if field.field_type == new_type {
        return Err(EngineError::validation(format!(
            "Field '{}' is already of type {new_type}",
            field.name
        )));
    }
    if !is_safe_conversion(field.field_type, new_type) {
        return Err(EngineError::validation(format!(
            "Unsafe type conversion: {} → {new_type}. Supported: {SUPPORTED_CONVERSIONS}",
            field.field_type
        )));
    }
    Ok(())
}

/// Index drops followed by the column drop.
pub(crate) fn drop_column_statements(
    scope: &TenantScope<'_>,
    table: &crate::dialect::TableRef,
    field: &Field,
) -> Vec<String> {
    let dialect = scope.dialect();
    let pid = &scope.project().id;
    vec![
        dialect.drop_index(pid, &field.index_name()),
        dialect.drop_index(pid, &field.unique_index_name()),
        dialect.drop_column(table, &field.sql_column_name),
    ]
}
