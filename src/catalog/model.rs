//! Catalog entities
//!
//! The catalog is the source of truth for logical schema. Physical tables
//! follow it; never the other way round.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::dialect::namespace_name;

/// Logical field type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Text,
    Int,
    Float,
    Bool,
    Date,
    Datetime,
    Uuid,
    Relation,
}

impl FieldType {
    pub const ALL: [FieldType; 9] = [
        FieldType::String,
        FieldType::Text,
        FieldType::Int,
        FieldType::Float,
        FieldType::Bool,
        FieldType::Date,
        FieldType::Datetime,
        FieldType::Uuid,
        FieldType::Relation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Text => "text",
            FieldType::Int => "int",
            FieldType::Float => "float",
            FieldType::Bool => "bool",
            FieldType::Date => "date",
            FieldType::Datetime => "datetime",
            FieldType::Uuid => "uuid",
            FieldType::Relation => "relation",
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, FieldType::Int | FieldType::Float)
    }

    pub fn is_textual(self) -> bool {
        matches!(self, FieldType::String | FieldType::Text)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FieldType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| {
                format!(
                    "Unknown field type '{s}'. Valid types: string, text, int, float, bool, date, datetime, uuid, relation"
                )
            })
    }
}

/// Referential action for relation columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OnDelete {
    #[default]
    #[serde(rename = "RESTRICT")]
    Restrict,
    #[serde(rename = "CASCADE")]
    Cascade,
    #[serde(rename = "SET NULL")]
    SetNull,
}

impl OnDelete {
    pub fn as_sql(self) -> &'static str {
        match self {
            OnDelete::Restrict => "RESTRICT",
            OnDelete::Cascade => "CASCADE",
            OnDelete::SetNull => "SET NULL",
        }
    }
}

impl FromStr for OnDelete {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "RESTRICT" => Ok(OnDelete::Restrict),
            "CASCADE" => Ok(OnDelete::Cascade),
            "SET NULL" => Ok(OnDelete::SetNull),
            _ => Err(format!(
                "Invalid on_delete '{s}'. Must be one of: RESTRICT, CASCADE, SET NULL"
            )),
        }
    }
}

/// Only many-to-one relations are stored as columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    #[default]
    ManyToOne,
}

impl FromStr for RelationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "many_to_one" => Ok(RelationType::ManyToOne),
            _ => Err(format!(
                "Invalid relation type '{s}'. Supported: many_to_one"
            )),
        }
    }
}

/// Tenant root
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Project {
    /// Physical namespace for this tenant; fixed for the project's lifetime.
    pub fn namespace(&self) -> String {
        namespace_name(&self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub display_name: Option<String>,
    pub sql_table_name: String,
    pub is_active: bool,
    pub is_system: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Relation attributes of a `relation` field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationSpec {
    pub target_collection_id: String,
    pub relation_type: RelationType,
    pub on_delete: OnDelete,
    pub display_field: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub id: String,
    pub collection_id: String,
    pub name: String,
    pub display_name: Option<String>,
    pub field_type: FieldType,
    pub sql_column_name: String,
    pub is_required: bool,
    pub is_unique: bool,
    pub is_indexed: bool,
    pub default_value: Option<String>,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub is_system: bool,
    pub is_hidden: bool,
    pub relation: Option<RelationSpec>,
    pub created_at: DateTime<Utc>,
}

impl Field {
    /// Physical index names are keyed by field id so they survive renames.
    pub fn index_name(&self) -> String {
        format!("ix_{}", self.id.replace('-', ""))
    }

    pub fn unique_index_name(&self) -> String {
        format!("uq_{}", self.id.replace('-', ""))
    }

    /// Visible to readers: not soft-deleted and not hidden
    pub fn is_visible(&self) -> bool {
        !self.is_deleted && !self.is_hidden
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionAlias {
    pub id: String,
    pub project_id: String,
    pub collection_id: String,
    pub old_name: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldAlias {
    pub id: String,
    pub collection_id: String,
    pub field_id: String,
    pub old_name: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// An alias is live while its expiry is unset or still ahead of `now`.
pub fn alias_is_live(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    expires_at.is_none_or(|at| at > now)
}

/// Kinds of applied DDL recorded in the schema ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpType {
    CreateSchema,
    CreateTable,
    AddColumn,
    AddRelationColumn,
    RenameTable,
    RenameColumn,
    SoftDeleteColumn,
    RestoreColumn,
    DropColumn,
    ChangeColumnType,
}

impl OpType {
    pub fn as_str(self) -> &'static str {
        match self {
            OpType::CreateSchema => "create_schema",
            OpType::CreateTable => "create_table",
            OpType::AddColumn => "add_column",
            OpType::AddRelationColumn => "add_relation_column",
            OpType::RenameTable => "rename_table",
            OpType::RenameColumn => "rename_column",
            OpType::SoftDeleteColumn => "soft_delete_column",
            OpType::RestoreColumn => "restore_column",
            OpType::DropColumn => "drop_column",
            OpType::ChangeColumnType => "change_column_type",
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| format!("Unknown schema op type '{s}'"))
    }
}

/// Append-only schema ledger entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaOp {
    pub id: String,
    pub project_id: String,
    pub collection_id: Option<String>,
    pub op_type: OpType,
    pub payload: Value,
    pub status: String,
    pub actor_user_id: Option<String>,
    pub created_at: DateTime<Utc>,
}
