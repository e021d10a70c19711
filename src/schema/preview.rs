//! Migration previews
//!
//! Builds the statement list and warnings for an evolution op without
//! running anything. Statements come from the same builders the executing
//! path uses, so a preview always shows what would really run.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::evolution::{check_type_change, drop_column_statements, SUPPORTED_CONVERSIONS};
use crate::catalog::{store, Collection, Field, FieldType};
use crate::dialect::is_safe_conversion;
use crate::engine::TenantScope;
use crate::error::{EngineError, EngineResult};
use crate::ident::require_slug;

/// A proposed evolution op
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum MigrationRequest {
    RenameCollection { new_name: String },
    RenameField { field: String, new_name: String },
    SoftDeleteField { field: String },
    HardDeleteField { field: String },
    ChangeFieldType { field: String, new_type: FieldType },
}

impl MigrationRequest {
    pub fn operation(&self) -> &'static str {
        match self {
            MigrationRequest::RenameCollection { .. } => "rename_collection",
            MigrationRequest::RenameField { .. } => "rename_field",
            MigrationRequest::SoftDeleteField { .. } => "soft_delete_field",
            MigrationRequest::HardDeleteField { .. } => "hard_delete_field",
            MigrationRequest::ChangeFieldType { .. } => "change_field_type",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationPreview {
    pub operation: String,
    pub collection: String,
    pub steps: Vec<String>,
    pub warnings: Vec<String>,
    pub params: Value,
}

impl TenantScope<'_> {
    /// Field by name or alias, soft-deleted ones included.
    fn preview_field(&self, collection: &Collection, name: &str) -> EngineResult<Field> {
        match store::find_field(self.exec, &collection.id, name)? {
            Some(f) => Ok(f),
            None => self.resolve_field(collection, name),
        }
    }

    /// Statements and warnings for `request`; reads the catalog only.
    pub fn preview_migration(
        &self,
        collection: &Collection,
        request: &MigrationRequest,
    ) -> EngineResult<MigrationPreview> {
        let dialect = self.dialect();
        let table = self.table_ref(collection);
        let grace_days = self.config().schema.alias_grace_days;
        let mut steps = Vec::new();
        let mut warnings = Vec::new();

        let params = match request {
            MigrationRequest::RenameCollection { new_name } => {
                require_slug(new_name, "Collection")?;
                if collection.is_system {
                    return Err(EngineError::validation(format!(
                        "System collection '{}' cannot be renamed",
                        collection.name
                    )));
                }
                steps.push(dialect.rename_table(&self.project.id, &table, new_name));
                warnings.push(format!(
                    "Old name '{}' will be aliased for {grace_days} days",
                    collection.name
                ));
                json!({ "old_name": collection.name, "new_name": new_name })
            }
            MigrationRequest::RenameField { field, new_name } => {
                require_slug(new_name, "Field")?;
                let f = self.resolve_field(collection, field)?;
                let new_column = if f.field_type == FieldType::Relation {
                    format!("{new_name}_id")
                } else {
                    new_name.clone()
                };
                steps.push(dialect.rename_column(&table, &f.sql_column_name, &new_column));
                warnings.push(format!(
                    "Old field name '{}' will be aliased for {grace_days} days",
                    f.name
                ));
                json!({ "field": f.name, "new_name": new_name })
            }
            MigrationRequest::SoftDeleteField { field } => {
                let f = self.resolve_field(collection, field)?;
                steps.push(format!(
                    "-- Mark field '{}' as deleted in catalog (no DDL)",
                    f.name
                ));
                warnings.push("Field will be hidden from UI and writes will be blocked".into());
                warnings.push("Data is preserved; use hard_delete to remove column".into());
                json!({ "field": f.name })
            }
            MigrationRequest::HardDeleteField { field } => {
                let f = self.preview_field(collection, field)?;
                steps.extend(drop_column_statements(self, &table, &f));
                warnings.push("THIS WILL PERMANENTLY DELETE ALL DATA IN THIS COLUMN".into());
                warnings.push("This action cannot be undone".into());
                if !f.is_deleted {
                    warnings.push(format!(
                        "Field '{}' is not soft-deleted; force=true is required",
                        f.name
                    ));
                }
                json!({ "field": f.name, "is_deleted": f.is_deleted })
            }
            MigrationRequest::ChangeFieldType { field, new_type } => {
                let f = self.resolve_field(collection, field)?;
                if is_safe_conversion(f.field_type, *new_type) {
                    check_type_change(&f, *new_type)?;
                    steps.extend(dialect.change_column_type(
                        &table,
                        &f.sql_column_name,
                        f.field_type,
                        *new_type,
                    ));
                    if steps.is_empty() {
                        steps.push(format!(
                            "-- Update type of field '{}' in catalog (no DDL)",
                            f.name
                        ));
                    }
                } else {
                    warnings.push(format!(
                        "UNSAFE: Cannot convert {} → {new_type} directly",
                        f.field_type
                    ));
                    warnings.push(format!("Supported conversions: {SUPPORTED_CONVERSIONS}"));
                    warnings.push("Use migration wizard: create new column, migrate data, swap".into());
                }
                json!({ "field": f.name, "old_type": f.field_type, "new_type": new_type })
            }
        };

        Ok(MigrationPreview {
            operation: request.operation().to_string(),
            collection: collection.name.clone(),
            steps,
            warnings,
            params,
        })
    }
}
