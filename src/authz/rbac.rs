//! Project roles and app-user role assignment

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::backend::{fetch, fetch_one, flag, run, timestamp, Record, RowExt};
use crate::catalog::new_id;
use crate::engine::TenantScope;
use crate::error::{EngineError, EngineResult};
use crate::ident::require_slug;

/// Roles every project starts with: name, description, is_default
pub const DEFAULT_ROLES: &[(&str, &str, bool)] = &[
    ("admin", "Full access to application data", false),
    ("member", "Standard application user", true),
    ("viewer", "Read-only access", false),
];

const ROLE_COLUMNS: &str = "id, project_id, name, description, is_default, is_system, created_at";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Role {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub description: Option<String>,
    pub is_default: bool,
    pub is_system: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoleUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_default: Option<bool>,
}

fn role_from_row(row: &Record) -> EngineResult<Role> {
    Ok(Role {
        id: row.text("id")?,
        project_id: row.text("project_id")?,
        name: row.text("name")?,
        description: row.opt_text("description"),
        is_default: row.flag("is_default"),
        is_system: row.flag("is_system"),
        created_at: row.time("created_at")?,
    })
}

impl TenantScope<'_> {
    fn find_role(&self, name: &str) -> EngineResult<Option<Role>> {
        fetch_one(
            self.exec,
            &format!("SELECT {ROLE_COLUMNS} FROM roles WHERE project_id = ? AND name = ?"),
            &[json!(self.project.id), json!(name)],
        )?
        .map(|row| role_from_row(&row))
        .transpose()
    }

    fn clear_default_role(&self) -> EngineResult<()> {
        run(
            self.exec,
            "UPDATE roles SET is_default = ? WHERE project_id = ? AND is_default = ?",
            &[flag(false), json!(self.project.id), flag(true)],
        )?;
        Ok(())
    }

    fn insert_role(
        &self,
        name: &str,
        description: Option<&str>,
        is_default: bool,
        is_system: bool,
    ) -> EngineResult<Role> {
        require_slug(name, "Role")?;
        if self.find_role(name)?.is_some() {
            return Err(EngineError::conflict(format!("Role '{name}' already exists")));
        }
        if is_default {
            self.clear_default_role()?;
        }
        let role = Role {
            id: new_id(),
            project_id: self.project.id.clone(),
            name: name.to_string(),
            description: description.map(str::to_string),
            is_default,
            is_system,
            created_at: self.now(),
        };
        run(
            self.exec,
            &format!("INSERT INTO roles ({ROLE_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?)"),
            &[
                json!(role.id),
                json!(role.project_id),
                json!(role.name),
                json!(role.description),
                flag(role.is_default),
                flag(role.is_system),
                json!(timestamp(role.created_at)),
            ],
        )?;
        info!(project = %self.project.id, role = %role.name, "role_created");
        Ok(role)
    }

    /// A new role; marking it default takes the flag from the current default.
    pub fn create_role(
        &self,
        name: &str,
        description: Option<&str>,
        is_default: bool,
    ) -> EngineResult<Role> {
        self.insert_role(name, description, is_default, false)
    }

    pub fn update_role(&self, role: &Role, update: RoleUpdate) -> EngineResult<Role> {
        if role.is_system {
            return Err(EngineError::validation(format!(
                "System role '{}' cannot be modified",
                role.name
            )));
        }
        let mut updated = role.clone();
        if let Some(name) = update.name.filter(|n| *n != role.name) {
            require_slug(&name, "Role")?;
            if self.find_role(&name)?.is_some() {
                return Err(EngineError::conflict(format!("Role '{name}' already exists")));
            }
            updated.name = name;
        }
        if let Some(description) = update.description {
            updated.description = Some(description);
        }
        if let Some(is_default) = update.is_default {
            if is_default && !role.is_default {
                self.clear_default_role()?;
            }
            updated.is_default = is_default;
        }
        run(
            self.exec,
            "UPDATE roles SET name = ?, description = ?, is_default = ? WHERE id = ?",
            &[
                json!(updated.name),
                json!(updated.description),
                flag(updated.is_default),
                json!(updated.id),
            ],
        )?;
        Ok(updated)
    }

    /// Removes the role and every assignment of it.
    pub fn delete_role(&self, role: &Role) -> EngineResult<()> {
        if role.is_system {
            return Err(EngineError::validation(format!(
                "System role '{}' cannot be deleted",
                role.name
            )));
        }
        run(self.exec, "DELETE FROM app_user_roles WHERE role_id = ?", &[json!(role.id)])?;
        run(self.exec, "DELETE FROM roles WHERE id = ?", &[json!(role.id)])?;
        info!(project = %self.project.id, role = %role.name, "role_deleted");
        Ok(())
    }

    pub fn list_roles(&self) -> EngineResult<Vec<Role>> {
        fetch(
            self.exec,
            &format!("SELECT {ROLE_COLUMNS} FROM roles WHERE project_id = ? ORDER BY name"),
            &[json!(self.project.id)],
        )?
        .iter()
        .map(role_from_row)
        .collect()
    }

    pub fn get_role_by_name(&self, name: &str) -> EngineResult<Role> {
        self.find_role(name)?
            .ok_or_else(|| EngineError::not_found("Role", name))
    }

    pub fn assign_role(&self, app_user_id: &str, role: &Role) -> EngineResult<()> {
        let existing = fetch_one(
            self.exec,
            "SELECT id FROM app_user_roles WHERE app_user_id = ? AND role_id = ?",
            &[json!(app_user_id), json!(role.id)],
        )?;
        if existing.is_some() {
            return Err(EngineError::conflict(format!(
                "User already has role '{}'",
                role.name
            )));
        }
        run(
            self.exec,
            "INSERT INTO app_user_roles (id, app_user_id, role_id, created_at) VALUES (?, ?, ?, ?)",
            &[
                json!(new_id()),
                json!(app_user_id),
                json!(role.id),
                json!(timestamp(self.now())),
            ],
        )?;
        info!(app_user = %app_user_id, role = %role.name, "role_assigned");
        Ok(())
    }

    pub fn remove_role(&self, app_user_id: &str, role: &Role) -> EngineResult<()> {
        let removed = run(
            self.exec,
            "DELETE FROM app_user_roles WHERE app_user_id = ? AND role_id = ?",
            &[json!(app_user_id), json!(role.id)],
        )?;
        if removed == 0 {
            return Err(EngineError::not_found(
                "Role assignment",
                format!("{app_user_id}/{}", role.name),
            ));
        }
        Ok(())
    }

    /// Role names assigned to an app user within this project.
    pub fn get_user_roles(&self, app_user_id: &str) -> EngineResult<Vec<String>> {
        fetch(
            self.exec,
            "SELECT r.name AS name FROM app_user_roles ur JOIN roles r ON r.id = ur.role_id \
             WHERE ur.app_user_id = ? AND r.project_id = ? ORDER BY r.name",
            &[json!(app_user_id), json!(self.project.id)],
        )?
        .iter()
        .map(|row| row.text("name"))
        .collect()
    }

    pub fn user_has_role(&self, app_user_id: &str, role: &str) -> EngineResult<bool> {
        Ok(self.get_user_roles(app_user_id)?.iter().any(|r| r == role))
    }

    pub fn user_has_any_role(&self, app_user_id: &str, roles: &[&str]) -> EngineResult<bool> {
        Ok(self
            .get_user_roles(app_user_id)?
            .iter()
            .any(|r| roles.contains(&r.as_str())))
    }

    /// Give a new app user the project's default role, if there is one.
    pub fn assign_default_role_to_user(&self, app_user_id: &str) -> EngineResult<Option<Role>> {
        let row = fetch_one(
            self.exec,
            &format!("SELECT {ROLE_COLUMNS} FROM roles WHERE project_id = ? AND is_default = ?"),
            &[json!(self.project.id), flag(true)],
        )?;
        let Some(role) = row.map(|r| role_from_row(&r)).transpose()? else {
            return Ok(None);
        };
        if !self.user_has_role(app_user_id, &role.name)? {
            self.assign_role(app_user_id, &role)?;
        }
        Ok(Some(role))
    }

    /// Create the built-in roles that are missing. Idempotent.
    pub fn initialize_default_roles(&self) -> EngineResult<Vec<Role>> {
        let mut created = Vec::new();
        for (name, description, is_default) in DEFAULT_ROLES {
            if self.find_role(name)?.is_none() {
                created.push(self.insert_role(name, Some(description), *is_default, true)?);
            }
        }
        Ok(created)
    }
}
