//! Relation fields
//!
//! A relation field is a many-to-one link stored as an integer column
//! `<name>_id` holding the target row's id. The namespaced layout backs it
//! with a real foreign key; on the prefixed layout the engine checks targets
//! on write and applies `on_delete` itself.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::backend::{fetch_one, Record};
use crate::catalog::{
    new_id, store, Collection, Field, FieldType, OnDelete, OpType, RelationSpec, RelationType,
};
use crate::engine::TenantScope;
use crate::error::{EngineError, EngineResult};
use crate::ident::{is_system_column, require_slug};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationFieldSpec {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Target collection name (or a live alias of it)
    pub target: String,
    #[serde(default)]
    pub relation_type: RelationType,
    #[serde(default)]
    pub on_delete: OnDelete,
    #[serde(default)]
    pub display_field: Option<String>,
    #[serde(default)]
    pub is_required: bool,
}

impl RelationFieldSpec {
    pub fn new(name: impl Into<String>, target: impl Into<String>) -> Self {
        RelationFieldSpec {
            name: name.into(),
            display_name: None,
            target: target.into(),
            relation_type: RelationType::ManyToOne,
            on_delete: OnDelete::Restrict,
            display_field: None,
            is_required: false,
        }
    }

    pub fn on_delete(mut self, on_delete: OnDelete) -> Self {
        self.on_delete = on_delete;
        self
    }

    pub fn display_field(mut self, field: impl Into<String>) -> Self {
        self.display_field = Some(field.into());
        self
    }

    pub fn required(mut self) -> Self {
        self.is_required = true;
        self
    }
}

/// A relation field elsewhere that points at a collection
#[derive(Debug, Clone, Serialize)]
pub struct ReverseRelation {
    pub collection: Collection,
    pub field: Field,
}

/// Integer id carried by a relation value, if it is one.
pub fn relation_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn foreign_key_name(field: &Field) -> String {
    format!("fk_{}", field.id.replace('-', ""))
}

impl TenantScope<'_> {
    pub fn add_relation_field(
        &self,
        collection: &Collection,
        spec: RelationFieldSpec,
    ) -> EngineResult<Field> {
        require_slug(&spec.name, "Field")?;
        if is_system_column(&spec.name) {
            return Err(EngineError::validation(format!(
                "'{}' is a reserved system column",
                spec.name
            )));
        }
        let target = self.resolve_collection(&spec.target)?;
        if target.id == collection.id {
            return Err(EngineError::validation(
                "Cannot create a self-referencing relation",
            ));
        }
        if let Some(display) = &spec.display_field {
            self.resolve_field(&target, display)?;
        }

        let _guard = self.lock_collection(&collection.id)?;
        if store::find_field(self.exec, &collection.id, &spec.name)?.is_some() {
            return Err(EngineError::conflict(format!(
                "Field '{}' already exists in collection '{}'",
                spec.name, collection.name
            )));
        }
        let column = format!("{}_id", spec.name);
        self.ensure_column_free(collection, &column)?;

        let field = Field {
            id: new_id(),
            collection_id: collection.id.clone(),
            name: spec.name,
            display_name: spec.display_name,
            field_type: FieldType::Relation,
            sql_column_name: column,
            is_required: spec.is_required,
            is_unique: false,
            is_indexed: true,
            default_value: None,
            is_deleted: false,
            deleted_at: None,
            is_system: false,
            is_hidden: false,
            relation: Some(RelationSpec {
                target_collection_id: target.id.clone(),
                relation_type: spec.relation_type,
                on_delete: spec.on_delete,
                display_field: spec.display_field,
            }),
            created_at: self.now(),
        };
        store::insert_field(self.exec, &field)?;
        self.add_relation_column(collection, &target, &field)?;
        Ok(field)
    }

    /// Nullable integer column, its index and (where supported) the FK.
    pub fn add_relation_column(
        &self,
        collection: &Collection,
        target: &Collection,
        field: &Field,
    ) -> EngineResult<()> {
        let dialect = self.dialect();
        let table = self.table_ref(collection);
        let target_table = self.table_ref(target);
        let on_delete = field
            .relation
            .as_ref()
            .map_or(OnDelete::Restrict, |r| r.on_delete);

        let definition = format!("{} NULL", dialect.physical_type(FieldType::Relation));
        self.exec
            .execute_ddl(&dialect.add_column(&table, &field.sql_column_name, &definition))?;
        self.exec.execute_ddl(&dialect.create_index(
            &table,
            &field.index_name(),
            &field.sql_column_name,
            false,
        ))?;
        if let Some(fk) = dialect.add_foreign_key(
            &table,
            &foreign_key_name(field),
            &field.sql_column_name,
            &target_table,
            on_delete.as_sql(),
        ) {
            self.exec.execute_ddl(&fk)?;
        }

        store::log_op(
            self.exec,
            &self.project.id,
            Some(&collection.id),
            OpType::AddRelationColumn,
            json!({
                "table_name": collection.sql_table_name,
                "column_name": field.sql_column_name,
                "target_collection_id": target.id,
                "target_table_name": target.sql_table_name,
                "relation_type": "many_to_one",
                "on_delete": on_delete.as_sql(),
            }),
            self.actor_user_id(),
        )?;
        info!(
            table = %collection.sql_table_name,
            column = %field.sql_column_name,
            target = %target.sql_table_name,
            "add_relation_column"
        );
        Ok(())
    }

    fn relation_target(&self, field: &Field) -> EngineResult<Collection> {
        let spec = field.relation.as_ref().ok_or_else(|| {
            EngineError::validation(format!("Field '{}' is not a relation", field.name))
        })?;
        store::get_collection(self.exec, &spec.target_collection_id)
    }

    /// Null passes; anything else must be the id of an existing target row.
    pub fn validate_relation_value(&self, field: &Field, value: &Value) -> EngineResult<()> {
        if value.is_null() {
            return Ok(());
        }
        let id = relation_id(value).ok_or_else(|| {
            EngineError::validation(format!(
                "Relation field '{}' expects an integer id",
                field.name
            ))
        })?;
        let target = self.relation_target(field)?;
        let exists = fetch_one(
            self.exec,
            &format!("SELECT id FROM {} WHERE id = ?", self.table_ref(&target)),
            &[json!(id)],
        )?
        .is_some();
        if !exists {
            return Err(EngineError::validation(format!(
                "Related record {id} not found in '{}'",
                target.name
            )));
        }
        Ok(())
    }

    /// The target row of a relation, hidden fields stripped.
    pub fn expand_relation(&self, field: &Field, id: i64) -> EngineResult<Option<Record>> {
        let target = self.relation_target(field)?;
        self.fetch_record(&target, id)
    }

    /// Relation fields in other active collections that point here.
    pub fn reverse_relations(&self, collection: &Collection) -> EngineResult<Vec<ReverseRelation>> {
        let mut out = Vec::new();
        for field in store::list_fields_targeting(self.exec, &collection.id)? {
            let owner = store::get_collection(self.exec, &field.collection_id)?;
            if owner.is_active {
                out.push(ReverseRelation {
                    collection: owner,
                    field,
                });
            }
        }
        Ok(out)
    }
}
