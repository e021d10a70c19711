//! Schema Manager: physical DDL synthesis from catalog entries

use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::catalog::{new_id, store, Collection, Field, FieldType, OpType};
use crate::dialect::{Dialect, TableRef};
use crate::engine::TenantScope;
use crate::error::{EngineError, EngineResult};
use crate::ident::{is_system_column, quote_literal, require_slug};

/// Name of the built-in users collection
pub const USERS_COLLECTION: &str = "_users";

/// Definition of a new non-relation field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub field_type: FieldType,
    #[serde(default)]
    pub is_required: bool,
    #[serde(default)]
    pub is_unique: bool,
    #[serde(default)]
    pub is_indexed: bool,
    #[serde(default)]
    pub default_value: Option<String>,
    #[serde(default)]
    pub is_hidden: bool,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        FieldSpec {
            name: name.into(),
            display_name: None,
            field_type,
            is_required: false,
            is_unique: false,
            is_indexed: false,
            default_value: None,
            is_hidden: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.is_required = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.is_unique = true;
        self
    }

    pub fn indexed(mut self) -> Self {
        self.is_indexed = true;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.is_hidden = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<String>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    pub(crate) fn into_field(self, collection_id: &str, is_system: bool) -> Field {
        Field {
            id: new_id(),
            collection_id: collection_id.to_string(),
            sql_column_name: self.name.clone(),
            name: self.name,
            display_name: self.display_name,
            field_type: self.field_type,
            is_required: self.is_required,
            is_unique: self.is_unique,
            is_indexed: self.is_indexed,
            default_value: self.default_value,
            is_deleted: false,
            deleted_at: None,
            is_system,
            is_hidden: self.is_hidden,
            relation: None,
            created_at: chrono::Utc::now(),
        }
    }
}

/// Render a default as a DDL literal after checking it against the type.
pub fn render_default(dialect: Dialect, field_type: FieldType, raw: &str) -> EngineResult<String> {
    let invalid = || {
        EngineError::validation(format!(
            "Default value '{raw}' is not a valid {field_type}"
        ))
    };
    match field_type {
        FieldType::String | FieldType::Text => Ok(quote_literal(raw)),
        FieldType::Int => raw.trim().parse::<i64>().map(|v| v.to_string()).map_err(|_| invalid()),
        FieldType::Float => match raw.trim().parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(v.to_string()),
            _ => Err(invalid()),
        },
        FieldType::Bool => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(dialect.bool_literal(true).to_string()),
            "false" | "0" => Ok(dialect.bool_literal(false).to_string()),
            _ => Err(invalid()),
        },
        FieldType::Date => NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
            .map(|_| quote_literal(raw.trim()))
            .map_err(|_| invalid()),
        FieldType::Datetime => DateTime::parse_from_rfc3339(raw.trim())
            .map(|_| quote_literal(raw.trim()))
            .map_err(|_| invalid()),
        FieldType::Uuid => Uuid::parse_str(raw.trim())
            .map(|u| quote_literal(&u.to_string()))
            .map_err(|_| invalid()),
        FieldType::Relation => Err(EngineError::validation(
            "Relation fields cannot have a default value",
        )),
    }
}

/// Column type, nullability and default for a field.
///
/// Only a required field that also has a default becomes `NOT NULL`; a
/// required field without one stays nullable so existing rows remain valid.
pub fn column_definition(dialect: Dialect, field: &Field) -> EngineResult<String> {
    let mut def = dialect.physical_type(field.field_type).to_string();
    let default = field
        .default_value
        .as_deref()
        .map(|raw| render_default(dialect, field.field_type, raw))
        .transpose()?;

    if field.is_required && default.is_some() {
        def.push_str(" NOT NULL");
    } else {
        def.push_str(" NULL");
    }
    if let Some(literal) = default {
        def.push_str(" DEFAULT ");
        def.push_str(&literal);
    }
    Ok(def)
}

/// Index statement for a field, if it wants one.
pub fn index_statement(
    dialect: Dialect,
    table: &TableRef,
    field: &Field,
) -> Option<String> {
    if field.is_unique {
        Some(dialect.create_index(table, &field.unique_index_name(), &field.sql_column_name, true))
    } else if field.is_indexed {
        Some(dialect.create_index(table, &field.index_name(), &field.sql_column_name, false))
    } else {
        None
    }
}

impl TenantScope<'_> {
    /// Create the tenant namespace if absent; logs `create_schema` once.
    pub fn ensure_tenant_namespace(&self) -> EngineResult<bool> {
        if store::has_op(self.exec, &self.project.id, OpType::CreateSchema)? {
            return Ok(false);
        }
        if let Some(ddl) = self.dialect().create_namespace(&self.project.id) {
            self.exec.execute_ddl(&ddl)?;
        }
        store::log_op(
            self.exec,
            &self.project.id,
            None,
            OpType::CreateSchema,
            json!({ "schema_name": self.project.namespace() }),
            self.actor_user_id(),
        )?;
        info!(project = %self.project.id, namespace = %self.project.namespace(), "create_schema");
        Ok(true)
    }

    /// Create the physical table with system columns only.
    pub fn create_collection_table(&self, collection: &Collection) -> EngineResult<()> {
        let table = self.table_ref(collection);
        self.exec.execute_ddl(&self.dialect().create_table(&table))?;
        store::log_op(
            self.exec,
            &self.project.id,
            Some(&collection.id),
            OpType::CreateTable,
            json!({
                "table_name": collection.sql_table_name,
                "collection_name": collection.name,
            }),
            self.actor_user_id(),
        )?;
        info!(project = %self.project.id, table = %collection.sql_table_name, "create_table");
        Ok(())
    }

    /// Add the physical column (and index) for a catalog field.
    pub fn add_column(&self, collection: &Collection, field: &Field) -> EngineResult<()> {
        let dialect = self.dialect();
        let table = self.table_ref(collection);
        let definition = column_definition(dialect, field)?;

        self.exec
            .execute_ddl(&dialect.add_column(&table, &field.sql_column_name, &definition))?;
        if let Some(index) = index_statement(dialect, &table, field) {
            self.exec.execute_ddl(&index)?;
        }

        store::log_op(
            self.exec,
            &self.project.id,
            Some(&collection.id),
            OpType::AddColumn,
            json!({
                "table_name": collection.sql_table_name,
                "column_name": field.sql_column_name,
                "field_type": field.field_type,
                "is_required": field.is_required,
                "is_unique": field.is_unique,
                "is_indexed": field.is_indexed,
            }),
            self.actor_user_id(),
        )?;
        info!(
            table = %collection.sql_table_name,
            column = %field.sql_column_name,
            field_type = %field.field_type,
            "add_column"
        );
        Ok(())
    }

    /// Register a collection and create its table.
    pub fn create_collection(
        &self,
        name: &str,
        display_name: Option<&str>,
    ) -> EngineResult<Collection> {
        require_slug(name, "Collection")?;
        self.create_collection_unchecked(name, display_name, false)
    }

    fn create_collection_unchecked(
        &self,
        name: &str,
        display_name: Option<&str>,
        is_system: bool,
    ) -> EngineResult<Collection> {
        let _guard = self.lock_collection(&format!("new:{name}"))?;
        self.check_collection_name_free(name)?;
        self.ensure_tenant_namespace()?;

        let now = self.now();
        let collection = Collection {
            id: new_id(),
            project_id: self.project.id.clone(),
            name: name.to_string(),
            display_name: display_name.map(str::to_string),
            sql_table_name: name.to_string(),
            is_active: true,
            is_system,
            created_at: now,
            updated_at: now,
        };
        store::insert_collection(self.exec, &collection)?;
        self.create_collection_table(&collection)?;
        Ok(collection)
    }

    /// Conflict when an active or deactivated collection already holds
    /// `name` as its name or table.
    pub(crate) fn check_collection_name_free(&self, name: &str) -> EngineResult<()> {
        match store::find_collection_claiming(self.exec, &self.project.id, name)? {
            None => Ok(()),
            Some(existing) if existing.is_active => Err(EngineError::conflict(format!(
                "Collection '{name}' already exists"
            ))),
            Some(_) => Err(EngineError::conflict(format!(
                "Collection name '{name}' is held by a deactivated collection"
            ))),
        }
    }

    /// Add a scalar field: catalog row, column and index.
    pub fn add_field(&self, collection: &Collection, spec: FieldSpec) -> EngineResult<Field> {
        require_slug(&spec.name, "Field")?;
        if spec.field_type == FieldType::Relation {
            return Err(EngineError::validation(
                "Use add_relation_field to create relation fields",
            ));
        }
        self.add_field_unchecked(collection, spec, false)
    }

    fn add_field_unchecked(
        &self,
        collection: &Collection,
        spec: FieldSpec,
        is_system: bool,
    ) -> EngineResult<Field> {
        if is_system_column(&spec.name) {
            return Err(EngineError::validation(format!(
                "'{}' is a reserved system column",
                spec.name
            )));
        }
        let field = spec.into_field(&collection.id, is_system);
        // Reject bad defaults before any statement runs.
        column_definition(self.dialect(), &field)?;

        let _guard = self.lock_collection(&collection.id)?;
        if store::find_field(self.exec, &collection.id, &field.name)?.is_some() {
            return Err(EngineError::conflict(format!(
                "Field '{}' already exists in collection '{}'",
                field.name, collection.name
            )));
        }
        self.ensure_column_free(collection, &field.sql_column_name)?;
        store::insert_field(self.exec, &field)?;
        self.add_column(collection, &field)?;
        Ok(field)
    }

    /// Reject a physical column name that a system column or another field
    /// (deleted or not) already occupies.
    pub(crate) fn ensure_column_free(&self, collection: &Collection, column: &str) -> EngineResult<()> {
        if is_system_column(column) {
            return Err(EngineError::validation(format!(
                "'{column}' is a reserved system column"
            )));
        }
        let taken = store::list_fields(self.exec, &collection.id, true)?
            .iter()
            .any(|f| f.sql_column_name == column);
        if taken {
            return Err(EngineError::conflict(format!(
                "Column '{column}' is already used in collection '{}'",
                collection.name
            )));
        }
        Ok(())
    }

    pub fn list_collections(&self) -> EngineResult<Vec<Collection>> {
        store::list_collections(self.exec, &self.project.id)
    }

    /// Fields in creation order; soft-deleted ones only on request.
    pub fn list_fields(
        &self,
        collection: &Collection,
        include_deleted: bool,
    ) -> EngineResult<Vec<Field>> {
        store::list_fields(self.exec, &collection.id, include_deleted)
    }

    /// Hide a collection from every lookup; its table is kept.
    pub fn deactivate_collection(&self, collection: &Collection) -> EngineResult<Collection> {
        if collection.is_system {
            return Err(EngineError::validation(format!(
                "System collection '{}' cannot be deactivated",
                collection.name
            )));
        }
        let mut updated = collection.clone();
        updated.is_active = false;
        updated.updated_at = self.now();
        store::update_collection(self.exec, &updated)?;
        info!(collection = %collection.name, "collection_deactivated");
        Ok(updated)
    }

    /// The built-in users collection, created on first use.
    pub fn ensure_users_collection(&self) -> EngineResult<Collection> {
        if let Some(existing) = store::find_collection(self.exec, &self.project.id, USERS_COLLECTION)? {
            return Ok(existing);
        }
        let collection = self.create_collection_unchecked(USERS_COLLECTION, Some("Users"), true)?;
        let system_fields = [
            FieldSpec::new("email", FieldType::String).required().unique(),
            FieldSpec::new("password_hash", FieldType::String).hidden(),
            FieldSpec::new("is_email_verified", FieldType::Bool).default_value("false"),
            FieldSpec::new("is_disabled", FieldType::Bool).default_value("false"),
        ];
        for spec in system_fields {
            self.add_field_unchecked(&collection, spec, true)?;
        }
        Ok(collection)
    }
}
