//! # Query Compiler
//!
//! Compiles filter maps and sort strings into parameterized SQL fragments.
//!
//! ## Filter keys
//!
//! `field` or `field__operator`, where the operator is one of
//! `eq, neq, gt, gte, lt, lte, like, ilike, contains, startswith, endswith,
//! in, notin, isnull, isnotnull`. A suffix that is not an operator is part of
//! the field name.
//!
//! ## Sort
//!
//! Comma separated field names, `-` prefix for descending. Unknown fields
//! are skipped.
//!
//! Identifiers only ever come from the catalog (through [`FieldMap`]);
//! values are always bound.

pub mod crud;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::backend::{Binds, Record};
use crate::catalog::{alias_is_live, Field, FieldAlias, FieldType};
use crate::error::{EngineError, EngineResult};
use crate::ident::{quote, SYSTEM_COLUMNS};

pub use crud::{ListQuery, Page};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    #[serde(alias = "=", alias = "==")]
    Eq,
    #[serde(alias = "!=", alias = "<>")]
    Neq,
    #[serde(alias = ">")]
    Gt,
    #[serde(alias = ">=")]
    Gte,
    #[serde(alias = "<")]
    Lt,
    #[serde(alias = "<=")]
    Lte,
    Like,
    Ilike,
    Contains,
    #[serde(alias = "starts_with")]
    StartsWith,
    #[serde(alias = "ends_with")]
    EndsWith,
    In,
    #[serde(alias = "not_in")]
    NotIn,
    #[serde(alias = "is_null")]
    IsNull,
    #[serde(alias = "is_not_null")]
    IsNotNull,
}

impl FilterOp {
    pub const ALL: [FilterOp; 15] = [
        FilterOp::Eq,
        FilterOp::Neq,
        FilterOp::Gt,
        FilterOp::Gte,
        FilterOp::Lt,
        FilterOp::Lte,
        FilterOp::Like,
        FilterOp::Ilike,
        FilterOp::Contains,
        FilterOp::StartsWith,
        FilterOp::EndsWith,
        FilterOp::In,
        FilterOp::NotIn,
        FilterOp::IsNull,
        FilterOp::IsNotNull,
    ];

    /// Canonical spelling used in filter keys
    pub fn as_str(self) -> &'static str {
        match self {
            FilterOp::Eq => "eq",
            FilterOp::Neq => "neq",
            FilterOp::Gt => "gt",
            FilterOp::Gte => "gte",
            FilterOp::Lt => "lt",
            FilterOp::Lte => "lte",
            FilterOp::Like => "like",
            FilterOp::Ilike => "ilike",
            FilterOp::Contains => "contains",
            FilterOp::StartsWith => "startswith",
            FilterOp::EndsWith => "endswith",
            FilterOp::In => "in",
            FilterOp::NotIn => "notin",
            FilterOp::IsNull => "isnull",
            FilterOp::IsNotNull => "isnotnull",
        }
    }

    /// Null checks carry no comparison value.
    pub fn needs_value(self) -> bool {
        !matches!(self, FilterOp::IsNull | FilterOp::IsNotNull)
    }

    fn comparison(self) -> Option<&'static str> {
        match self {
            FilterOp::Eq => Some("="),
            FilterOp::Neq => Some("!="),
            FilterOp::Gt => Some(">"),
            FilterOp::Gte => Some(">="),
            FilterOp::Lt => Some("<"),
            FilterOp::Lte => Some("<="),
            _ => None,
        }
    }
}

impl fmt::Display for FilterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FilterOp {
    type Err = String;

    /// Accepts the canonical names and the symbolic aliases.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_string())).map_err(|_| {
            format!(
                "Unknown operator '{s}'. Supported: {}",
                FilterOp::ALL.map(FilterOp::as_str).join(", ")
            )
        })
    }
}

/// Split a filter key into field name and operator.
pub fn parse_filter_key(key: &str) -> (&str, FilterOp) {
    if let Some((field, suffix)) = key.rsplit_once("__") {
        if let Some(op) = FilterOp::ALL.into_iter().find(|op| op.as_str() == suffix) {
            return (field, op);
        }
    }
    (key, FilterOp::Eq)
}

/// A column a query may reference
#[derive(Debug, Clone, Copy)]
pub enum Column<'f> {
    System(&'static str),
    Field(&'f Field),
}

impl Column<'_> {
    pub fn sql_name(&self) -> &str {
        match self {
            Column::System(name) => name,
            Column::Field(f) => &f.sql_column_name,
        }
    }

    pub fn field_type(&self) -> Option<FieldType> {
        match self {
            Column::System("id") => Some(FieldType::Int),
            Column::System(_) => None,
            Column::Field(f) => Some(f.field_type),
        }
    }

    pub fn is_hidden(&self) -> bool {
        matches!(self, Column::Field(f) if f.is_hidden)
    }
}

/// Name lookup over the live fields of one collection.
///
/// Accepts the field name, its physical column name, or a live alias.
#[derive(Debug, Clone)]
pub struct FieldMap {
    fields: Vec<Field>,
    index: HashMap<String, usize>,
}

impl FieldMap {
    /// `fields` should exclude soft-deleted fields.
    pub fn new(fields: Vec<Field>, aliases: &[FieldAlias], now: DateTime<Utc>) -> Self {
        let mut index = HashMap::new();
        for (i, f) in fields.iter().enumerate() {
            index.insert(f.name.clone(), i);
        }
        for (i, f) in fields.iter().enumerate() {
            index.entry(f.sql_column_name.clone()).or_insert(i);
        }
        // Newest alias first, so the most recent rename of a name wins.
        for alias in aliases {
            if !alias_is_live(alias.expires_at, now) {
                continue;
            }
            if let Some(i) = fields.iter().position(|f| f.id == alias.field_id) {
                index.entry(alias.old_name.clone()).or_insert(i);
            }
        }
        FieldMap { fields, index }
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Fields that may appear in output
    pub fn visible(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|f| f.is_visible())
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.index.get(name).map(|&i| &self.fields[i])
    }

    pub fn column(&self, name: &str) -> Option<Column<'_>> {
        if let Some(sys) = SYSTEM_COLUMNS.iter().find(|c| **c == name) {
            return Some(Column::System(*sys));
        }
        self.field(name).map(Column::Field)
    }

    /// Column usable in a filter; hidden fields look exactly like unknown ones.
    pub fn filter_column(&self, name: &str) -> EngineResult<Column<'_>> {
        match self.column(name) {
            Some(col) if !col.is_hidden() => Ok(col),
            _ => Err(EngineError::validation(format!("Unknown field: {name}"))),
        }
    }

    /// Quoted select list: system columns then visible fields.
    pub fn select_list(&self, qualifier: Option<&str>) -> Vec<String> {
        SYSTEM_COLUMNS
            .iter()
            .copied()
            .chain(self.visible().map(|f| f.sql_column_name.as_str()))
            .map(|col| qualify(qualifier, col))
            .collect()
    }

    /// Normalize storage values by logical type (0/1 booleans, integral floats).
    pub fn decode_row(&self, mut row: Record) -> Record {
        for f in self.visible() {
            if let Some(v) = row.get_mut(&f.sql_column_name) {
                *v = decode_value(f.field_type, std::mem::take(v));
            }
        }
        row
    }
}

pub fn qualify(qualifier: Option<&str>, column: &str) -> String {
    match qualifier {
        Some(q) => format!("{q}.{}", quote(column)),
        None => quote(column),
    }
}

pub fn decode_value(field_type: FieldType, value: Value) -> Value {
    if let Value::Number(n) = &value {
        match field_type {
            FieldType::Bool => return Value::Bool(n.as_f64().unwrap_or(0.0) != 0.0),
            FieldType::Float if !n.is_f64() => {
                if let Some(f) = n.as_f64() {
                    return Value::from(f);
                }
            }
            _ => {}
        }
    }
    value
}

/// Coerce loosely typed input (query strings, JSON) to the column's type.
pub fn coerce_value(field_type: Option<FieldType>, value: &Value) -> Value {
    let Value::String(s) = value else {
        return value.clone();
    };
    let s = s.trim();
    match field_type {
        Some(FieldType::Int | FieldType::Relation) => {
            s.parse::<i64>().map_or_else(|_| value.clone(), Value::from)
        }
        Some(FieldType::Float) => s
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .map_or_else(|| value.clone(), Value::from),
        Some(FieldType::Bool) => match s.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Value::Bool(true),
            "false" | "0" | "no" => Value::Bool(false),
            _ => value.clone(),
        },
        _ => value.clone(),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64() == Some(1),
        Value::String(s) => matches!(s.to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
        _ => false,
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn list_of(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.clone(),
        Value::String(s) => s
            .split(',')
            .map(|part| Value::String(part.trim().to_string()))
            .collect(),
        other => vec![other.clone()],
    }
}

/// One condition on an already qualified column expression.
pub fn compile_condition(
    column_sql: &str,
    field_type: Option<FieldType>,
    op: FilterOp,
    value: &Value,
    binds: &mut Binds,
) -> String {
    match op {
        FilterOp::IsNull | FilterOp::IsNotNull => {
            let want_null = truthy(value) == (op == FilterOp::IsNull);
            if want_null {
                format!("{column_sql} IS NULL")
            } else {
                format!("{column_sql} IS NOT NULL")
            }
        }
        FilterOp::In | FilterOp::NotIn => {
            let items = list_of(value);
            if items.is_empty() {
                return if op == FilterOp::In { "1 = 0" } else { "1 = 1" }.to_string();
            }
            let marks: Vec<String> = items
                .iter()
                .map(|v| binds.push(coerce_value(field_type, v)))
                .collect();
            let kw = if op == FilterOp::In { "IN" } else { "NOT IN" };
            format!("{column_sql} {kw} ({})", marks.join(", "))
        }
        FilterOp::Like => format!("{column_sql} LIKE {}", binds.push(text_of(value))),
        FilterOp::Ilike => format!(
            "LOWER({column_sql}) LIKE LOWER({})",
            binds.push(format!("%{}%", text_of(value)))
        ),
        FilterOp::Contains => format!(
            "{column_sql} LIKE {}",
            binds.push(format!("%{}%", text_of(value)))
        ),
        FilterOp::StartsWith => format!(
            "{column_sql} LIKE {}",
            binds.push(format!("{}%", text_of(value)))
        ),
        FilterOp::EndsWith => format!(
            "{column_sql} LIKE {}",
            binds.push(format!("%{}", text_of(value)))
        ),
        FilterOp::Eq if value.is_null() => format!("{column_sql} IS NULL"),
        FilterOp::Neq if value.is_null() => format!("{column_sql} IS NOT NULL"),
        cmp => {
            let sym = cmp.comparison().unwrap_or("=");
            format!(
                "{column_sql} {sym} {}",
                binds.push(coerce_value(field_type, value))
            )
        }
    }
}

/// `AND` of every filter in the map; `None` when there are none.
///
/// Unknown and hidden fields are rejected.
pub fn compile_filters(
    map: &FieldMap,
    filters: &Map<String, Value>,
    qualifier: Option<&str>,
    binds: &mut Binds,
) -> EngineResult<Option<String>> {
    let mut conditions = Vec::with_capacity(filters.len());
    for (key, value) in filters {
        let (name, op) = parse_filter_key(key);
        let column = map.filter_column(name)?;
        let column_sql = qualify(qualifier, column.sql_name());
        conditions.push(compile_condition(
            &column_sql,
            column.field_type(),
            op,
            value,
            binds,
        ));
    }
    Ok((!conditions.is_empty()).then(|| conditions.join(" AND ")))
}

/// `ORDER BY` body; unknown or hidden fields are skipped, default `id DESC`.
pub fn compile_sort(map: &FieldMap, sort: Option<&str>, qualifier: Option<&str>) -> String {
    let parts: Vec<String> = sort
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|item| {
            let (name, dir) = match item.strip_prefix('-') {
                Some(rest) => (rest, "DESC"),
                None => (item, "ASC"),
            };
            let column = map.column(name).filter(|c| !c.is_hidden())?;
            Some(format!("{} {dir}", qualify(qualifier, column.sql_name())))
        })
        .collect();
    if parts.is_empty() {
        format!("{} DESC", qualify(qualifier, "id"))
    } else {
        parts.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::new_id;
    use crate::dialect::Dialect;
    use serde_json::json;

    fn field(name: &str, field_type: FieldType) -> Field {
        Field {
            id: new_id(),
            collection_id: "c".into(),
            name: name.into(),
            display_name: None,
            field_type,
            sql_column_name: name.into(),
            is_required: false,
            is_unique: false,
            is_indexed: false,
            default_value: None,
            is_deleted: false,
            deleted_at: None,
            is_system: false,
            is_hidden: false,
            relation: None,
            created_at: Utc::now(),
        }
    }

    fn map() -> FieldMap {
        let mut secret = field("secret", FieldType::String);
        secret.is_hidden = true;
        let mut author = field("author", FieldType::Relation);
        author.sql_column_name = "author_id".into();
        FieldMap::new(
            vec![
                field("title", FieldType::String),
                field("price", FieldType::Float),
                field("published", FieldType::Bool),
                secret,
                author,
            ],
            &[],
            Utc::now(),
        )
    }

    fn filters(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_parse_filter_key() {
        assert_eq!(parse_filter_key("price"), ("price", FilterOp::Eq));
        assert_eq!(parse_filter_key("price__gte"), ("price", FilterOp::Gte));
        assert_eq!(parse_filter_key("first__name"), ("first__name", FilterOp::Eq));
        assert_eq!(
            parse_filter_key("first__name__startswith"),
            ("first__name", FilterOp::StartsWith)
        );
    }

    #[test]
    fn test_operator_aliases() {
        assert_eq!(">=".parse::<FilterOp>().unwrap(), FilterOp::Gte);
        assert_eq!("not_in".parse::<FilterOp>().unwrap(), FilterOp::NotIn);
        assert_eq!("is_not_null".parse::<FilterOp>().unwrap(), FilterOp::IsNotNull);
        assert_eq!("contains".parse::<FilterOp>().unwrap(), FilterOp::Contains);
        assert!("between".parse::<FilterOp>().is_err());
    }

    #[test]
    fn test_range_filter_binds_values() {
        let mut binds = Binds::new(Dialect::Prefixed);
        let sql = compile_filters(
            &map(),
            &filters(json!({"price__gte": 100, "price__lte": "500"})),
            None,
            &mut binds,
        )
        .unwrap()
        .unwrap();
        assert_eq!(sql, "\"price\" >= ?1 AND \"price\" <= ?2");
        assert_eq!(binds.values(), &[json!(100), json!(500.0)]);
    }

    #[test]
    fn test_unknown_and_hidden_fields_are_rejected() {
        let mut binds = Binds::new(Dialect::Prefixed);
        let err = compile_filters(&map(), &filters(json!({"nope": 1})), None, &mut binds)
            .unwrap_err();
        assert_eq!(err.to_string(), "Unknown field: nope");
        assert!(compile_filters(&map(), &filters(json!({"secret": "x"})), None, &mut binds).is_err());
        assert!(compile_filters(&map(), &filters(json!({"price__between": 1})), None, &mut binds).is_err());
    }

    #[test]
    fn test_text_operators() {
        let mut binds = Binds::new(Dialect::Namespaced);
        let sql = compile_filters(
            &map(),
            &filters(json!({
                "title__contains": "rust",
                "title__startswith": "A",
                "title__ilike": "Ab"
            })),
            Some("t"),
            &mut binds,
        )
        .unwrap()
        .unwrap();
        assert_eq!(
            sql,
            "t.\"title\" LIKE $1 AND t.\"title\" LIKE $2 AND LOWER(t.\"title\") LIKE LOWER($3)"
        );
        assert_eq!(binds.values(), &[json!("%rust%"), json!("A%"), json!("%Ab%")]);
    }

    #[test]
    fn test_in_and_null_checks() {
        let mut binds = Binds::new(Dialect::Prefixed);
        let sql = compile_filters(
            &map(),
            &filters(json!({
                "title__in": "a, b",
                "author__notin": [1, 2],
                "published__isnull": "false"
            })),
            None,
            &mut binds,
        )
        .unwrap()
        .unwrap();
        assert_eq!(
            sql,
            "\"title\" IN (?1, ?2) AND \"author_id\" NOT IN (?3, ?4) AND \"published\" IS NOT NULL"
        );
        assert_eq!(binds.values(), &[json!("a"), json!("b"), json!(1), json!(2)]);
    }

    #[test]
    fn test_sort_skips_unknown_fields() {
        let m = map();
        assert_eq!(compile_sort(&m, None, None), "\"id\" DESC");
        assert_eq!(
            compile_sort(&m, Some("-price, nope, title,secret"), None),
            "\"price\" DESC, \"title\" ASC"
        );
        assert_eq!(compile_sort(&m, Some("created_at"), Some("t")), "t.\"created_at\" ASC");
    }

    #[test]
    fn test_aliases_resolve_to_renamed_field() {
        let renamed = field("headline", FieldType::String);
        let alias = FieldAlias {
            id: new_id(),
            collection_id: "c".into(),
            field_id: renamed.id.clone(),
            old_name: "title".into(),
            expires_at: Some(Utc::now() + chrono::Duration::days(1)),
            created_at: Utc::now(),
        };
        let map = FieldMap::new(vec![renamed], &[alias.clone()], Utc::now());
        assert_eq!(map.field("title").unwrap().name, "headline");

        let expired = FieldMap::new(
            map.fields().to_vec(),
            &[alias],
            Utc::now() + chrono::Duration::days(2),
        );
        assert!(expired.field("title").is_none());
    }

    #[test]
    fn test_decode_row() {
        let row = json!({"id": 1, "price": 3, "published": 1, "title": "x"})
            .as_object()
            .cloned()
            .unwrap();
        let decoded = map().decode_row(row);
        assert_eq!(decoded["price"], json!(3.0));
        assert_eq!(decoded["published"], json!(true));
        assert_eq!(decoded["id"], json!(1));
    }
}
