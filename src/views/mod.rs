//! # Saved Views
//!
//! A view is a list query frozen under a name: projection, filters, sorts
//! and at most one relation join, each filter or sort optionally bound to a
//! caller parameter at execution time. Every update bumps the version and
//! snapshots the definition in `view_versions`.
//!
//! - [`service`]: definition checks and catalog CRUD
//! - [`execute`]: compiling a view plus parameters into one `SELECT`

pub mod execute;
pub mod service;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::Record;
use crate::query::FilterOp;

pub use execute::{available_operators, OperatorInfo};
pub use service::ViewUpdate;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewFilter {
    pub field: String,
    pub operator: FilterOp,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub is_param: bool,
    /// Defaults to the field name
    #[serde(default)]
    pub param_name: Option<String>,
}

impl ViewFilter {
    pub fn param_key(&self) -> &str {
        self.param_name.as_deref().unwrap_or(&self.field)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewSort {
    pub field: String,
    #[serde(default)]
    pub desc: bool,
    #[serde(default)]
    pub is_param: bool,
    #[serde(default)]
    pub param_name: Option<String>,
    #[serde(default)]
    pub desc_is_param: bool,
    #[serde(default)]
    pub desc_param_name: Option<String>,
}

/// `LEFT JOIN` through a relation field of the base collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewJoin {
    pub field: String,
    #[serde(default)]
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    #[default]
    String,
    Int,
    Float,
    Bool,
    /// Overrides the page size of the call
    Limit,
    /// Overrides the page offset of the call
    Offset,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    #[serde(rename = "type", default)]
    pub param_type: ParamType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewDefinition {
    /// Field names; empty selects every visible column
    #[serde(default)]
    pub projection: Vec<String>,
    #[serde(default)]
    pub filters: Vec<ViewFilter>,
    #[serde(default)]
    pub sorts: Vec<ViewSort>,
    #[serde(default)]
    pub joins: Vec<ViewJoin>,
    #[serde(default)]
    pub params_schema: BTreeMap<String, ParamSpec>,
    #[serde(default)]
    pub default_limit: Option<usize>,
    #[serde(default)]
    pub max_limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct View {
    pub id: String,
    pub project_id: String,
    pub collection_id: String,
    pub name: String,
    pub description: Option<String>,
    pub version: i64,
    pub definition: ViewDefinition,
    pub default_limit: usize,
    pub max_limit: usize,
    pub is_active: bool,
    pub created_by_user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable snapshot of a view definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewVersion {
    pub id: String,
    pub view_id: String,
    pub version: i64,
    pub definition: ViewDefinition,
    pub default_limit: usize,
    pub max_limit: usize,
    pub created_by_user_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViewResult {
    pub data: Vec<Record>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
    pub view_name: String,
    pub view_version: i64,
}
