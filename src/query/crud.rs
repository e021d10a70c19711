//! Record CRUD against tenant tables
//!
//! Input keys may be field names, physical column names or live aliases.
//! Output rows always carry physical column names, never hidden fields.

use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::info;
use uuid::Uuid;

use super::{coerce_value, compile_filters, compile_sort, FieldMap};
use crate::audit::{RecordAction, RecordEvent};
use crate::backend::{fetch, fetch_one, run, timestamp, Binds, Record, RowExt};
use crate::catalog::{store, Collection, Field, FieldType, OnDelete};
use crate::engine::TenantScope;
use crate::error::{EngineError, EngineResult};
use crate::ident::{is_system_column, quote};
use crate::validation::{rule_violations, violations_error};

/// Filters, sort and page window for `list_records`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub filters: Map<String, Value>,
    #[serde(default)]
    pub sort: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

impl ListQuery {
    pub fn filter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.insert(key.into(), value.into());
        self
    }

    pub fn sort(mut self, sort: impl Into<String>) -> Self {
        self.sort = Some(sort.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page {
    pub data: Vec<Record>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

fn where_clause(predicate: Option<String>) -> String {
    predicate.map(|p| format!(" WHERE {p}")).unwrap_or_default()
}

/// Shape check of one input value against its field type.
fn check_value(field: &Field, value: &Value) -> Result<(), String> {
    let ok = match (field.field_type, value) {
        (_, Value::Null) => true,
        (FieldType::Int | FieldType::Relation, v) => v.as_i64().is_some(),
        (FieldType::Float, v) => v.is_number(),
        (FieldType::Bool, Value::Bool(_)) => true,
        (FieldType::Bool, v) => matches!(v.as_i64(), Some(0 | 1)),
        (FieldType::String | FieldType::Text, Value::String(_)) => true,
        (FieldType::Date, Value::String(s)) => NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok(),
        (FieldType::Datetime, Value::String(s)) => DateTime::parse_from_rfc3339(s).is_ok(),
        (FieldType::Uuid, Value::String(s)) => Uuid::parse_str(s).is_ok(),
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(format!(
            "Field '{}' expects a {} value",
            field.name, field.field_type
        ))
    }
}

impl TenantScope<'_> {
    /// Live fields of a collection, addressable by name, column or alias.
    pub fn field_map(&self, collection: &Collection) -> EngineResult<FieldMap> {
        let fields = store::list_fields(self.exec, &collection.id, false)?;
        let aliases = store::field_aliases(self.exec, &collection.id, None)?;
        Ok(FieldMap::new(fields, &aliases, self.now()))
    }

    fn fetch_with(
        &self,
        map: &FieldMap,
        collection: &Collection,
        id: i64,
    ) -> EngineResult<Option<Record>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE id = ?",
            map.select_list(None).join(", "),
            self.table_ref(collection)
        );
        Ok(fetch_one(self.exec, &sql, &[json!(id)])?.map(|row| map.decode_row(row)))
    }

    pub(crate) fn fetch_record(
        &self,
        collection: &Collection,
        id: i64,
    ) -> EngineResult<Option<Record>> {
        let map = self.field_map(collection)?;
        self.fetch_with(&map, collection, id)
    }

    pub fn get_record(&self, collection: &Collection, id: i64) -> EngineResult<Record> {
        self.fetch_record(collection, id)?
            .ok_or_else(|| EngineError::not_found("Record", id.to_string()))
    }

    /// Resolve, coerce and check caller input. System columns are dropped.
    fn writable_values<'m>(
        &self,
        map: &'m FieldMap,
        data: &Record,
    ) -> EngineResult<Vec<(&'m Field, Value)>> {
        let mut out: Vec<(&Field, Value)> = Vec::with_capacity(data.len());
        let mut errors = Vec::new();
        for (key, raw) in data {
            if is_system_column(key) {
                continue;
            }
            let field = map
                .field(key)
                .ok_or_else(|| EngineError::validation(format!("Unknown field: {key}")))?;
            if out.iter().any(|(f, _)| f.id == field.id) {
                return Err(EngineError::validation(format!(
                    "Field '{}' is given more than once",
                    field.name
                )));
            }
            let value = coerce_value(Some(field.field_type), raw);
            if let Err(e) = check_value(field, &value) {
                errors.push(e);
                continue;
            }
            if field.field_type == FieldType::Relation {
                self.validate_relation_value(field, &value)?;
            }
            out.push((field, value));
        }
        if !errors.is_empty() {
            return Err(EngineError::validation(errors.join("; ")));
        }
        Ok(out)
    }

    fn check_rules(&self, values: &[(&Field, Value)]) -> EngineResult<()> {
        let violations = rule_violations(self.exec, values.iter().map(|(f, v)| (*f, v)))?;
        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations_error(&violations))
        }
    }

    fn emit(
        &self,
        collection: &Collection,
        record_id: i64,
        action: RecordAction,
        old_data: Option<Record>,
        new_data: Option<Record>,
    ) -> EngineResult<()> {
        let event = RecordEvent {
            project_id: self.project.id.clone(),
            collection_id: collection.id.clone(),
            collection_name: collection.name.clone(),
            record_id,
            action,
            old_data,
            new_data,
            actor: self.actor.clone(),
        };
        self.engine.events().record_changed(self.exec, &event)?;
        info!(
            collection = %collection.name,
            record_id,
            action = %action,
            "record_mutated"
        );
        Ok(())
    }

    /// Insert a row; `created_by_*` come from the scope's actor.
    pub fn insert_record(&self, collection: &Collection, data: &Record) -> EngineResult<Record> {
        let map = self.field_map(collection)?;
        let values = self.writable_values(&map, data)?;

        let missing: Vec<&str> = map
            .fields()
            .iter()
            .filter(|f| f.is_required && f.default_value.is_none())
            .filter(|f| {
                !values
                    .iter()
                    .any(|(given, v)| given.id == f.id && !v.is_null())
            })
            .map(|f| f.name.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(EngineError::validation(format!(
                "Missing required fields: {}",
                missing.join(", ")
            )));
        }
        self.check_rules(&values)?;

        let mut binds = Binds::new(self.dialect());
        let mut columns = vec![quote("created_by_user_id"), quote("created_by_app_user_id")];
        let mut marks = vec![
            binds.push(self.actor.user_id.clone()),
            binds.push(self.actor.app_user_id.clone()),
        ];
        for (field, value) in &values {
            columns.push(quote(&field.sql_column_name));
            marks.push(binds.push(value.clone()));
        }
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) RETURNING id",
            self.table_ref(collection),
            columns.join(", "),
            marks.join(", ")
        );
        let id = self
            .exec
            .query_one(&sql, binds.values())?
            .ok_or_else(|| EngineError::Corrupt("insert returned no id".into()))?
            .int("id")?;

        let record = self
            .fetch_with(&map, collection, id)?
            .ok_or_else(|| EngineError::not_found("Record", id.to_string()))?;
        self.emit(collection, id, RecordAction::Create, None, Some(record.clone()))?;
        Ok(record)
    }

    /// Partial update; bumps `updated_at`.
    pub fn update_record(
        &self,
        collection: &Collection,
        id: i64,
        data: &Record,
    ) -> EngineResult<Record> {
        let map = self.field_map(collection)?;
        let old = self
            .fetch_with(&map, collection, id)?
            .ok_or_else(|| EngineError::not_found("Record", id.to_string()))?;
        let values = self.writable_values(&map, data)?;

        let cleared: Vec<&str> = values
            .iter()
            .filter(|(f, v)| f.is_required && v.is_null())
            .map(|(f, _)| f.name.as_str())
            .collect();
        if !cleared.is_empty() {
            return Err(EngineError::validation(format!(
                "Required fields cannot be null: {}",
                cleared.join(", ")
            )));
        }
        self.check_rules(&values)?;

        let mut binds = Binds::new(self.dialect());
        let mut sets: Vec<String> = values
            .iter()
            .map(|(field, value)| {
                format!(
                    "{} = {}",
                    quote(&field.sql_column_name),
                    binds.push(value.clone())
                )
            })
            .collect();
        sets.push(format!("updated_at = {}", binds.push(timestamp(self.now()))));
        let id_mark = binds.push(id);
        let sql = format!(
            "UPDATE {} SET {} WHERE id = {id_mark}",
            self.table_ref(collection),
            sets.join(", ")
        );
        self.exec.execute(&sql, binds.values())?;

        let new = self
            .fetch_with(&map, collection, id)?
            .ok_or_else(|| EngineError::not_found("Record", id.to_string()))?;
        self.emit(collection, id, RecordAction::Update, Some(old), Some(new.clone()))?;
        Ok(new)
    }

    /// Delete a row. Without backend foreign keys the relation `on_delete`
    /// actions of referencing fields are applied here.
    pub fn delete_record(&self, collection: &Collection, id: i64) -> EngineResult<()> {
        let map = self.field_map(collection)?;
        let old = self
            .fetch_with(&map, collection, id)?
            .ok_or_else(|| EngineError::not_found("Record", id.to_string()))?;

        let dependents = if self.dialect().supports_foreign_keys() {
            Vec::new()
        } else {
            self.reverse_relations(collection)?
        };
        let on_delete = |f: &Field| f.relation.as_ref().map_or(OnDelete::Restrict, |r| r.on_delete);

        for dep in dependents.iter().filter(|d| on_delete(&d.field) == OnDelete::Restrict) {
            let referenced = fetch_one(
                self.exec,
                &format!(
                    "SELECT id FROM {} WHERE {} = ? LIMIT 1",
                    self.table_ref(&dep.collection),
                    quote(&dep.field.sql_column_name)
                ),
                &[json!(id)],
            )?;
            if referenced.is_some() {
                return Err(EngineError::conflict(format!(
                    "Record {id} is referenced by '{}.{}'",
                    dep.collection.name, dep.field.name
                )));
            }
        }

        run(
            self.exec,
            &format!("DELETE FROM {} WHERE id = ?", self.table_ref(collection)),
            &[json!(id)],
        )?;

        for dep in &dependents {
            let table = self.table_ref(&dep.collection);
            let column = quote(&dep.field.sql_column_name);
            match on_delete(&dep.field) {
                OnDelete::Restrict => {}
                OnDelete::Cascade => {
                    let rows = fetch(
                        self.exec,
                        &format!("SELECT id FROM {table} WHERE {column} = ?"),
                        &[json!(id)],
                    )?;
                    for row in rows {
                        self.delete_record(&dep.collection, row.int("id")?)?;
                    }
                }
                OnDelete::SetNull => {
                    run(
                        self.exec,
                        &format!("UPDATE {table} SET {column} = NULL, updated_at = ? WHERE {column} = ?"),
                        &[json!(timestamp(self.now())), json!(id)],
                    )?;
                }
            }
        }

        self.emit(collection, id, RecordAction::Delete, Some(old), None)
    }

    /// One page plus the total for the same predicate.
    pub fn list_records(&self, collection: &Collection, query: &ListQuery) -> EngineResult<Page> {
        let limits = &self.config().limits;
        let limit = query
            .limit
            .filter(|l| *l > 0)
            .unwrap_or(limits.list_default_limit)
            .min(limits.list_max_limit);

        let map = self.field_map(collection)?;
        let table = self.table_ref(collection);
        let mut binds = Binds::new(self.dialect());
        let predicate = where_clause(compile_filters(&map, &query.filters, None, &mut binds)?);

        let total = self.count_where(&table.to_string(), &predicate, binds.values())?;

        let order = compile_sort(&map, query.sort.as_deref(), None);
        let limit_mark = binds.push(limit);
        let offset_mark = binds.push(query.offset);
        let sql = format!(
            "SELECT {} FROM {table}{predicate} ORDER BY {order} LIMIT {limit_mark} OFFSET {offset_mark}",
            map.select_list(None).join(", ")
        );
        let data = self
            .exec
            .query(&sql, binds.values())?
            .into_iter()
            .map(|row| map.decode_row(row))
            .collect();

        Ok(Page {
            data,
            total,
            limit,
            offset: query.offset,
        })
    }

    pub fn count_records(
        &self,
        collection: &Collection,
        filters: &Map<String, Value>,
    ) -> EngineResult<usize> {
        let map = self.field_map(collection)?;
        let mut binds = Binds::new(self.dialect());
        let predicate = where_clause(compile_filters(&map, filters, None, &mut binds)?);
        self.count_where(&self.table_ref(collection).to_string(), &predicate, binds.values())
    }

    /// `from` is a quoted table reference or join expression.
    pub(crate) fn count_where(
        &self,
        from: &str,
        predicate: &str,
        params: &[Value],
    ) -> EngineResult<usize> {
        let row = self
            .exec
            .query_one(&format!("SELECT COUNT(*) AS n FROM {from}{predicate}"), params)?;
        Ok(row.map_or(Ok(0), |r| r.int("n"))? as usize)
    }
}
