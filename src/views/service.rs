//! View catalog: definition checks, create/update/delete and versions

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use super::{View, ViewDefinition, ViewVersion};
use crate::backend::{fetch, fetch_one, flag, run, timestamp, Record, RowExt};
use crate::catalog::{new_id, store, Collection, FieldType};
use crate::engine::TenantScope;
use crate::error::{EngineError, EngineResult};
use crate::ident::require_slug;

const VIEW_COLUMNS: &str = "id, project_id, collection_id, name, description, version, \
                            definition_json, default_limit, max_limit, is_active, \
                            created_by_user_id, created_at, updated_at";

/// Changes for `update_view`; `None` keeps the current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ViewUpdate {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub definition: Option<ViewDefinition>,
}

fn view_from_row(row: &Record) -> EngineResult<View> {
    Ok(View {
        id: row.text("id")?,
        project_id: row.text("project_id")?,
        collection_id: row.text("collection_id")?,
        name: row.text("name")?,
        description: row.opt_text("description"),
        version: row.int("version")?,
        definition: serde_json::from_value(row.json("definition_json")?)?,
        default_limit: row.int("default_limit")? as usize,
        max_limit: row.int("max_limit")? as usize,
        is_active: row.flag("is_active"),
        created_by_user_id: row.opt_text("created_by_user_id"),
        created_at: row.time("created_at")?,
        updated_at: row.time("updated_at")?,
    })
}

fn version_from_row(row: &Record) -> EngineResult<ViewVersion> {
    Ok(ViewVersion {
        id: row.text("id")?,
        view_id: row.text("view_id")?,
        version: row.int("version")?,
        definition: serde_json::from_value(row.json("definition_json")?)?,
        default_limit: row.int("default_limit")? as usize,
        max_limit: row.int("max_limit")? as usize,
        created_by_user_id: row.opt_text("created_by_user_id"),
        created_at: row.time("created_at")?,
    })
}

impl TenantScope<'_> {
    /// Reject definitions that reference unknown or hidden columns, or that
    /// exceed the filter and join caps. Clamps the limits in place.
    pub(crate) fn check_view_definition(
        &self,
        collection: &Collection,
        definition: &mut ViewDefinition,
    ) -> EngineResult<()> {
        let limits = &self.config().limits;
        if definition.filters.len() > limits.view_max_filters {
            return Err(EngineError::validation(format!(
                "A view may have at most {} filters",
                limits.view_max_filters
            )));
        }
        if definition.joins.len() > limits.view_max_joins {
            return Err(EngineError::validation(format!(
                "A view may have at most {} join(s)",
                limits.view_max_joins
            )));
        }

        let map = self.field_map(collection)?;
        for name in &definition.projection {
            map.filter_column(name)?;
        }
        for filter in &definition.filters {
            map.filter_column(&filter.field)?;
            if !filter.is_param && filter.operator.needs_value() && filter.value.is_none() {
                return Err(EngineError::validation(format!(
                    "Filter on '{}' with operator '{}' needs a value",
                    filter.field, filter.operator
                )));
            }
        }
        for sort in definition.sorts.iter().filter(|s| !s.is_param) {
            map.filter_column(&sort.field)?;
        }

        if let Some(join) = definition.joins.first() {
            let relation = map
                .field(&join.field)
                .filter(|f| f.field_type == FieldType::Relation)
                .and_then(|f| f.relation.as_ref())
                .ok_or_else(|| {
                    EngineError::validation(format!(
                        "Join field '{}' is not a relation field",
                        join.field
                    ))
                })?;
            let target = store::get_collection(self.exec, &relation.target_collection_id)?;
            let target_map = self.field_map(&target)?;
            for column in &join.columns {
                target_map.filter_column(column).map_err(|_| {
                    EngineError::validation(format!(
                        "Unknown column '{column}' on joined collection '{}'",
                        target.name
                    ))
                })?;
            }
        }

        let cap = limits.view_max_rows.max(1);
        let max_limit = definition.max_limit.unwrap_or(cap).clamp(1, cap);
        let default_limit = definition
            .default_limit
            .unwrap_or(limits.list_default_limit)
            .clamp(1, max_limit);
        definition.max_limit = Some(max_limit);
        definition.default_limit = Some(default_limit);
        Ok(())
    }

    fn insert_view_version(&self, view: &View) -> EngineResult<()> {
        run(
            self.exec,
            "INSERT INTO view_versions (id, view_id, version, definition_json, default_limit, \
             max_limit, created_by_user_id, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            &[
                json!(new_id()),
                json!(view.id),
                json!(view.version),
                json!(serde_json::to_string(&view.definition)?),
                json!(view.default_limit),
                json!(view.max_limit),
                json!(view.created_by_user_id),
                json!(timestamp(view.updated_at)),
            ],
        )?;
        Ok(())
    }

    fn find_view(&self, name: &str) -> EngineResult<Option<View>> {
        fetch_one(
            self.exec,
            &format!(
                "SELECT {VIEW_COLUMNS} FROM views WHERE project_id = ? AND name = ? AND is_active = 1"
            ),
            &[json!(self.project.id), json!(name)],
        )?
        .map(|row| view_from_row(&row))
        .transpose()
    }

    pub fn create_view(
        &self,
        collection: &Collection,
        name: &str,
        description: Option<&str>,
        mut definition: ViewDefinition,
    ) -> EngineResult<View> {
        require_slug(name, "View")?;
        if !collection.is_active {
            return Err(EngineError::not_found("Collection", collection.name.clone()));
        }
        self.check_view_definition(collection, &mut definition)?;

        let _guard = self.lock_collection(&format!("view:{name}"))?;
        if self.find_view(name)?.is_some() {
            return Err(EngineError::conflict(format!("View '{name}' already exists")));
        }

        let now = self.now();
        let view = View {
            id: new_id(),
            project_id: self.project.id.clone(),
            collection_id: collection.id.clone(),
            name: name.to_string(),
            description: description.map(str::to_string),
            version: 1,
            default_limit: definition.default_limit.unwrap_or(1),
            max_limit: definition.max_limit.unwrap_or(1),
            definition,
            is_active: true,
            created_by_user_id: self.actor_user_id().map(str::to_string),
            created_at: now,
            updated_at: now,
        };
        run(
            self.exec,
            &format!("INSERT INTO views ({VIEW_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"),
            &[
                json!(view.id),
                json!(view.project_id),
                json!(view.collection_id),
                json!(view.name),
                json!(view.description),
                json!(view.version),
                json!(serde_json::to_string(&view.definition)?),
                json!(view.default_limit),
                json!(view.max_limit),
                flag(true),
                json!(view.created_by_user_id),
                json!(timestamp(now)),
                json!(timestamp(now)),
            ],
        )?;
        self.insert_view_version(&view)?;
        info!(view = %view.name, collection = %collection.name, "view_created");
        Ok(view)
    }

    pub fn get_view(&self, name: &str) -> EngineResult<View> {
        self.find_view(name)?
            .ok_or_else(|| EngineError::not_found("View", name))
    }

    /// Active views, optionally only those over one collection.
    pub fn list_views(&self, collection: Option<&Collection>) -> EngineResult<Vec<View>> {
        let rows = match collection {
            Some(c) => fetch(
                self.exec,
                &format!(
                    "SELECT {VIEW_COLUMNS} FROM views WHERE project_id = ? AND collection_id = ? \
                     AND is_active = 1 ORDER BY name"
                ),
                &[json!(self.project.id), json!(c.id)],
            )?,
            None => fetch(
                self.exec,
                &format!(
                    "SELECT {VIEW_COLUMNS} FROM views WHERE project_id = ? AND is_active = 1 ORDER BY name"
                ),
                &[json!(self.project.id)],
            )?,
        };
        rows.iter().map(view_from_row).collect()
    }

    /// Apply `update` as a new version.
    pub fn update_view(&self, view: &View, update: ViewUpdate) -> EngineResult<View> {
        let collection = store::get_collection(self.exec, &view.collection_id)?;
        let mut updated = view.clone();
        if let Some(mut definition) = update.definition {
            self.check_view_definition(&collection, &mut definition)?;
            updated.default_limit = definition.default_limit.unwrap_or(view.default_limit);
            updated.max_limit = definition.max_limit.unwrap_or(view.max_limit);
            updated.definition = definition;
        }
        if let Some(description) = update.description {
            updated.description = Some(description);
        }
        updated.version = view.version + 1;
        updated.updated_at = self.now();
        if let Some(user) = self.actor_user_id() {
            updated.created_by_user_id = Some(user.to_string());
        }

        let changed = run(
            self.exec,
            "UPDATE views SET description = ?, version = ?, definition_json = ?, default_limit = ?, \
             max_limit = ?, updated_at = ? WHERE id = ? AND version = ? AND is_active = 1",
            &[
                json!(updated.description),
                json!(updated.version),
                json!(serde_json::to_string(&updated.definition)?),
                json!(updated.default_limit),
                json!(updated.max_limit),
                json!(timestamp(updated.updated_at)),
                json!(view.id),
                json!(view.version),
            ],
        )?;
        if changed == 0 {
            return Err(EngineError::conflict(format!(
                "View '{}' was modified concurrently",
                view.name
            )));
        }
        self.insert_view_version(&updated)?;
        info!(view = %updated.name, version = updated.version, "view_updated");
        Ok(updated)
    }

    /// Soft delete; versions are kept.
    pub fn delete_view(&self, view: &View) -> EngineResult<()> {
        run(
            self.exec,
            "UPDATE views SET is_active = ?, updated_at = ? WHERE id = ?",
            &[flag(false), json!(timestamp(self.now())), json!(view.id)],
        )?;
        info!(view = %view.name, "view_deleted");
        Ok(())
    }

    /// Newest first
    pub fn get_view_versions(&self, view: &View) -> EngineResult<Vec<ViewVersion>> {
        fetch(
            self.exec,
            "SELECT * FROM view_versions WHERE view_id = ? ORDER BY version DESC",
            &[json!(view.id)],
        )?
        .iter()
        .map(version_from_row)
        .collect()
    }

    pub fn get_view_version(&self, view: &View, version: i64) -> EngineResult<ViewVersion> {
        let row = fetch_one(
            self.exec,
            "SELECT * FROM view_versions WHERE view_id = ? AND version = ?",
            &[json!(view.id), json!(version)],
        )?
        .ok_or_else(|| EngineError::not_found("View version", format!("{} v{version}", view.name)))?;
        version_from_row(&row)
    }
}
