//! View execution
//!
//! The base table is aliased `t` and the optional join target `j`. Joined
//! columns come back as `<relation field>__<column>`. Count and page share
//! one compiled predicate.

use std::collections::HashSet;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use super::{ParamType, View, ViewDefinition, ViewResult};
use crate::backend::Binds;
use crate::catalog::{store, FieldType};
use crate::engine::TenantScope;
use crate::error::{EngineError, EngineResult};
use crate::ident::{quote, SYSTEM_COLUMNS};
use crate::query::{compile_condition, decode_value, qualify, FilterOp};

const BASE: &str = "t";
const JOINED: &str = "j";
/// Param names a parameterized sort reads when the sort names none
const SORT_FIELD_PARAM: &str = "sort_field";
const SORT_DESC_PARAM: &str = "sort_desc";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperatorInfo {
    pub operator: &'static str,
    pub requires_value: bool,
    pub aliases: &'static [&'static str],
}

fn operator_aliases(op: FilterOp) -> &'static [&'static str] {
    match op {
        FilterOp::Eq => &["="],
        FilterOp::Neq => &["!="],
        FilterOp::Gt => &[">"],
        FilterOp::Gte => &[">="],
        FilterOp::Lt => &["<"],
        FilterOp::Lte => &["<="],
        FilterOp::StartsWith => &["starts_with"],
        FilterOp::EndsWith => &["ends_with"],
        FilterOp::NotIn => &["not_in"],
        FilterOp::IsNull => &["is_null"],
        FilterOp::IsNotNull => &["is_not_null"],
        _ => &[],
    }
}

/// Operators a view filter may use.
pub fn available_operators() -> Vec<OperatorInfo> {
    FilterOp::ALL
        .iter()
        .map(|&op| OperatorInfo {
            operator: op.as_str(),
            requires_value: op.needs_value(),
            aliases: operator_aliases(op),
        })
        .collect()
}

/// Sort direction parameter: `true`, `"true"`, `"desc"`, `1`, `"1"` mean descending.
fn desc_flag(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64() == Some(1),
        Value::String(s) => matches!(s.as_str(), "true" | "desc" | "DESC" | "1"),
        _ => false,
    }
}

fn coerce_param(name: &str, param_type: ParamType, value: Value) -> EngineResult<Value> {
    let invalid = |what: &str| EngineError::validation(format!("Parameter '{name}' must be {what}"));
    match param_type {
        ParamType::String => Ok(value),
        ParamType::Int | ParamType::Limit | ParamType::Offset => {
            if value.is_i64() || value.is_u64() {
                return Ok(value);
            }
            value
                .as_str()
                .and_then(|s| s.trim().parse::<i64>().ok())
                .map(Value::from)
                .ok_or_else(|| invalid("an integer"))
        }
        ParamType::Float => {
            if value.is_number() {
                return Ok(value);
            }
            value
                .as_str()
                .and_then(|s| s.trim().parse::<f64>().ok())
                .map(Value::from)
                .ok_or_else(|| invalid("a number"))
        }
        ParamType::Bool => match (&value, value.as_i64()) {
            (Value::Bool(b), _) => Ok(Value::Bool(*b)),
            (_, Some(n @ (0 | 1))) => Ok(Value::Bool(n == 1)),
            (Value::String(s), _) => match s.to_ascii_lowercase().as_str() {
                "true" | "1" => Ok(Value::Bool(true)),
                "false" | "0" => Ok(Value::Bool(false)),
                _ => Err(invalid("a boolean")),
            },
            _ => Err(invalid("a boolean")),
        },
    }
}

/// Caller params merged with declared defaults and coerced to their types.
fn resolve_params(definition: &ViewDefinition, params: &Map<String, Value>) -> EngineResult<Map<String, Value>> {
    let mut resolved = params.clone();
    for (name, spec) in &definition.params_schema {
        let value = params
            .get(name)
            .filter(|v| !v.is_null())
            .cloned()
            .or_else(|| spec.default.clone());
        match value {
            Some(v) => {
                resolved.insert(name.clone(), coerce_param(name, spec.param_type, v)?);
            }
            None if spec.required => {
                return Err(EngineError::validation(format!(
                    "Missing required parameter: {name}"
                )));
            }
            None => {
                resolved.remove(name);
            }
        }
    }
    Ok(resolved)
}

/// Value of the first declared param of `param_type` that the call bound.
fn window_param(
    definition: &ViewDefinition,
    params: &Map<String, Value>,
    param_type: ParamType,
) -> EngineResult<Option<usize>> {
    for (name, spec) in &definition.params_schema {
        if spec.param_type != param_type {
            continue;
        }
        if let Some(v) = params.get(name) {
            let n = v
                .as_u64()
                .ok_or_else(|| EngineError::validation(format!("Parameter '{name}' must not be negative")))?;
            return Ok(Some(n as usize));
        }
    }
    Ok(None)
}

impl TenantScope<'_> {
    pub fn execute_view(
        &self,
        view: &View,
        params: &Map<String, Value>,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> EngineResult<ViewResult> {
        let collection = store::get_collection(self.exec, &view.collection_id)?;
        if !collection.is_active {
            return Err(EngineError::not_found("Collection", collection.name));
        }
        let definition = &view.definition;
        let params = resolve_params(definition, params)?;
        let map = self.field_map(&collection)?;

        let mut projected: Vec<(String, Option<FieldType>)> = SYSTEM_COLUMNS
            .iter()
            .map(|c| ((*c).to_string(), None))
            .collect();
        if definition.projection.is_empty() {
            projected.extend(
                map.visible()
                    .map(|f| (f.sql_column_name.clone(), Some(f.field_type))),
            );
        } else {
            for name in &definition.projection {
                let column = map.filter_column(name)?;
                if !projected.iter().any(|(c, _)| c == column.sql_name()) {
                    projected.push((column.sql_name().to_string(), column.field_type()));
                }
            }
        }
        let sortable: HashSet<&str> = projected.iter().map(|(c, _)| c.as_str()).collect();
        let mut select: Vec<String> = projected
            .iter()
            .map(|(c, _)| format!("{} AS {}", qualify(Some(BASE), c), quote(c)))
            .collect();

        let base_from = format!("{} {BASE}", self.table_ref(&collection));
        let mut from = base_from.clone();
        let mut joined: Vec<(String, Option<FieldType>)> = Vec::new();
        if let Some(join) = definition.joins.first() {
            let field = map
                .field(&join.field)
                .filter(|f| f.field_type == FieldType::Relation)
                .ok_or_else(|| {
                    EngineError::validation(format!("Join field '{}' is not a relation field", join.field))
                })?;
            let target_id = field
                .relation
                .as_ref()
                .map(|r| r.target_collection_id.as_str())
                .unwrap_or_default();
            let target = store::get_collection(self.exec, target_id)?;
            let target_map = self.field_map(&target)?;
            let columns: Vec<(String, Option<FieldType>)> = if join.columns.is_empty() {
                target_map
                    .visible()
                    .map(|f| (f.sql_column_name.clone(), Some(f.field_type)))
                    .collect()
            } else {
                join.columns
                    .iter()
                    .map(|name| {
                        target_map
                            .filter_column(name)
                            .map(|c| (c.sql_name().to_string(), c.field_type()))
                    })
                    .collect::<EngineResult<_>>()?
            };
            from.push_str(&format!(
                " LEFT JOIN {} {JOINED} ON {} = {}",
                self.table_ref(&target),
                qualify(Some(JOINED), "id"),
                qualify(Some(BASE), &field.sql_column_name)
            ));
            for (column, field_type) in columns {
                let alias = format!("{}__{column}", join.field);
                select.push(format!("{} AS {}", qualify(Some(JOINED), &column), quote(&alias)));
                joined.push((alias, field_type));
            }
        }

        let mut binds = Binds::new(self.dialect());
        let mut conditions = Vec::with_capacity(definition.filters.len());
        for filter in &definition.filters {
            let value = if filter.is_param {
                match params.get(filter.param_key()) {
                    Some(v) => v.clone(),
                    None => continue,
                }
            } else if let Some(v) = &filter.value {
                v.clone()
            } else if filter.operator.needs_value() {
                Value::Null
            } else {
                Value::Bool(true)
            };
            let column = map.filter_column(&filter.field)?;
            conditions.push(compile_condition(
                &qualify(Some(BASE), column.sql_name()),
                column.field_type(),
                filter.operator,
                &value,
                &mut binds,
            ));
        }
        let predicate = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };

        let mut order = Vec::new();
        for sort in &definition.sorts {
            let (mut name, mut desc) = (sort.field.clone(), sort.desc);
            // Without the param the stored field and direction apply
            if sort.is_param {
                if let Some(Value::String(s)) =
                    params.get(sort.param_name.as_deref().unwrap_or(SORT_FIELD_PARAM))
                {
                    match s.strip_prefix('-') {
                        Some(rest) => (name, desc) = (rest.to_string(), true),
                        None => name.clone_from(s),
                    }
                }
            }
            if sort.desc_is_param {
                if let Some(v) = params.get(sort.desc_param_name.as_deref().unwrap_or(SORT_DESC_PARAM)) {
                    desc = desc_flag(v);
                }
            }
            let Some(column) = map.column(&name).filter(|c| !c.is_hidden()) else {
                continue;
            };
            if sort.is_param && !sortable.contains(column.sql_name()) {
                continue;
            }
            let dir = if desc { "DESC" } else { "ASC" };
            order.push(format!("{} {dir}", qualify(Some(BASE), column.sql_name())));
        }
        if order.is_empty() {
            order.push(format!("{} DESC", qualify(Some(BASE), "id")));
        }

        let cap = self.config().limits.view_max_rows.max(1);
        let limit = window_param(definition, &params, ParamType::Limit)?
            .or(limit)
            .filter(|l| *l > 0)
            .unwrap_or(view.default_limit)
            .min(view.max_limit)
            .min(cap);
        let offset = window_param(definition, &params, ParamType::Offset)?
            .or(offset)
            .unwrap_or(0);

        let total = self.count_where(&base_from, &predicate, binds.values())?;

        let limit_mark = binds.push(limit);
        let offset_mark = binds.push(offset);
        let sql = format!(
            "SELECT {} FROM {from}{predicate} ORDER BY {} LIMIT {limit_mark} OFFSET {offset_mark}",
            select.join(", "),
            order.join(", ")
        );
        debug!(view = %view.name, version = view.version, sql = %sql, "execute_view");

        let data = self
            .exec
            .query(&sql, binds.values())?
            .into_iter()
            .map(|mut row| {
                for (column, field_type) in projected.iter().chain(&joined) {
                    if let (Some(t), Some(v)) = (field_type, row.get_mut(column)) {
                        *v = decode_value(*t, std::mem::take(v));
                    }
                }
                row
            })
            .collect();

        Ok(ViewResult {
            data,
            total,
            limit,
            offset,
            view_name: view.name.clone(),
            view_version: view.version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::views::ParamSpec;
    use serde_json::json;

    fn definition(params: Value) -> ViewDefinition {
        serde_json::from_value(json!({ "params_schema": params })).unwrap()
    }

    #[test]
    fn test_desc_flag_spellings() {
        for v in [json!(true), json!("true"), json!("desc"), json!("DESC"), json!(1), json!("1")] {
            assert!(desc_flag(&v), "{v}");
        }
        for v in [json!(false), json!("asc"), json!(0), json!(null)] {
            assert!(!desc_flag(&v), "{v}");
        }
    }

    #[test]
    fn test_required_param_missing() {
        let def = definition(json!({"status": {"type": "string", "required": true}}));
        let err = resolve_params(&def, &Map::new()).unwrap_err();
        assert!(err.to_string().ends_with("Missing required parameter: status"));
    }

    #[test]
    fn test_params_take_defaults_and_types() {
        let def = definition(json!({
            "min_price": {"type": "float", "default": 10},
            "page_size": {"type": "limit"},
            "flag": {"type": "bool"}
        }));
        let mut params = Map::new();
        params.insert("page_size".into(), json!("5"));
        params.insert("flag".into(), json!("true"));
        let resolved = resolve_params(&def, &params).unwrap();
        assert_eq!(resolved["min_price"], json!(10));
        assert_eq!(resolved["page_size"], json!(5));
        assert_eq!(resolved["flag"], json!(true));
        assert_eq!(window_param(&def, &resolved, ParamType::Limit).unwrap(), Some(5));
        assert_eq!(window_param(&def, &resolved, ParamType::Offset).unwrap(), None);
    }

    #[test]
    fn test_bad_param_type() {
        let mut def = ViewDefinition::default();
        def.params_schema.insert(
            "n".into(),
            ParamSpec {
                param_type: ParamType::Int,
                ..ParamSpec::default()
            },
        );
        let mut params = Map::new();
        params.insert("n".into(), json!("many"));
        assert!(resolve_params(&def, &params).is_err());
    }

    #[test]
    fn test_available_operators() {
        let ops = available_operators();
        assert_eq!(ops.len(), 15);
        let isnull = ops.iter().find(|o| o.operator == "isnull").unwrap();
        assert!(!isnull.requires_value);
        assert_eq!(isnull.aliases, &["is_null"]);
    }
}
