//! Policy catalog and the decision algorithm

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{Condition, Decision, Principal, PrincipalKind};
use crate::backend::{fetch, fetch_one, flag, run, timestamp, Record, RowExt};
use crate::catalog::{new_id, store, Collection};
use crate::engine::TenantScope;
use crate::error::{EngineError, EngineResult};

/// Principals allowed everything on a collection without policies, and the
/// principal set of a policy that names none
pub const DEFAULT_PRINCIPALS: &[PrincipalKind] = &[PrincipalKind::AdminUser, PrincipalKind::ApiKey];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
    Create,
    Read,
    Update,
    Delete,
    List,
}

impl PolicyAction {
    pub fn as_str(self) -> &'static str {
        match self {
            PolicyAction::Create => "create",
            PolicyAction::Read => "read",
            PolicyAction::Update => "update",
            PolicyAction::Delete => "delete",
            PolicyAction::List => "list",
        }
    }
}

impl fmt::Display for PolicyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Allow,
    Deny,
}

fn default_principals() -> Vec<PrincipalKind> {
    DEFAULT_PRINCIPALS.to_vec()
}

/// An empty principal list stands for [`DEFAULT_PRINCIPALS`].
fn effective_principals(principals: Vec<PrincipalKind>) -> Vec<PrincipalKind> {
    if principals.is_empty() {
        default_principals()
    } else {
        principals
    }
}

/// New policy as submitted by a tenant admin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub action: PolicyAction,
    pub effect: Effect,
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default = "default_principals")]
    pub allowed_principals: Vec<PrincipalKind>,
    #[serde(default)]
    pub require_email_verified: bool,
    #[serde(default)]
    pub allowed_roles: Vec<String>,
}

impl PolicySpec {
    pub fn new(name: impl Into<String>, action: PolicyAction, effect: Effect) -> Self {
        PolicySpec {
            name: name.into(),
            description: None,
            action,
            effect,
            condition: None,
            priority: 0,
            allowed_principals: default_principals(),
            require_email_verified: false,
            allowed_roles: Vec::new(),
        }
    }

    /// Parse untrusted JSON; unknown actions, effects, principal types and
    /// condition nodes are validation errors.
    pub fn from_json(value: Value) -> EngineResult<Self> {
        serde_json::from_value(value).map_err(|e| EngineError::validation(format!("Invalid policy: {e}")))
    }

    pub fn condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn principals(mut self, principals: &[PrincipalKind]) -> Self {
        self.allowed_principals = principals.to_vec();
        self
    }

    pub fn roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn require_email_verified(mut self) -> Self {
        self.require_email_verified = true;
        self
    }

    fn check(&self) -> EngineResult<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::validation("Policy name must not be empty"));
        }
        if let Some(condition) = &self.condition {
            condition
                .check()
                .map_err(|e| EngineError::validation(format!("Invalid condition: {e}")))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyUpdate {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub is_active: Option<bool>,
    #[serde(default)]
    pub allowed_principals: Option<Vec<PrincipalKind>>,
    #[serde(default)]
    pub require_email_verified: Option<bool>,
    #[serde(default)]
    pub allowed_roles: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    pub collection_id: String,
    pub name: String,
    pub description: Option<String>,
    pub action: PolicyAction,
    pub effect: Effect,
    pub condition: Option<Condition>,
    pub priority: i64,
    pub is_active: bool,
    pub allowed_principals: Vec<PrincipalKind>,
    pub require_email_verified: bool,
    pub allowed_roles: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Policy {
    /// Every gate except the action: principal type, verification, roles
    /// and the condition tree.
    pub fn admits(&self, principal: &Principal, roles: &[String], record: Option<&Record>) -> bool {
        let principals = if self.allowed_principals.is_empty() {
            DEFAULT_PRINCIPALS
        } else {
            self.allowed_principals.as_slice()
        };
        if !principals.contains(&principal.kind) {
            return false;
        }
        if self.require_email_verified && !principal.is_email_verified() {
            return false;
        }
        if principal.kind == PrincipalKind::AppUser
            && !self.allowed_roles.is_empty()
            && !self.allowed_roles.iter().any(|r| roles.contains(r))
        {
            return false;
        }
        self.condition
            .as_ref()
            .is_none_or(|c| c.evaluate(principal, record))
    }
}

fn optional_json<T: Serialize>(value: Option<&T>) -> EngineResult<Value> {
    Ok(match value {
        Some(v) => json!(serde_json::to_string(v)?),
        None => Value::Null,
    })
}

fn parse_enum<T: for<'de> Deserialize<'de>>(raw: &str) -> EngineResult<T> {
    serde_json::from_value(Value::String(raw.to_string()))
        .map_err(|_| EngineError::Corrupt(format!("unexpected policy value '{raw}'")))
}

fn policy_from_row(row: &Record) -> EngineResult<Policy> {
    let condition = match row.get("condition_json") {
        Some(Value::Null) | None => None,
        Some(_) => Some(serde_json::from_value(row.json("condition_json")?)?),
    };
    let principals = match row.get("allowed_principals") {
        Some(Value::Null) | None => default_principals(),
        Some(_) => effective_principals(serde_json::from_value(row.json("allowed_principals")?)?),
    };
    let roles = match row.get("allowed_roles") {
        Some(Value::Null) | None => Vec::new(),
        Some(_) => serde_json::from_value(row.json("allowed_roles")?)?,
    };
    Ok(Policy {
        id: row.text("id")?,
        collection_id: row.text("collection_id")?,
        name: row.text("name")?,
        description: row.opt_text("description"),
        action: parse_enum(&row.text("action")?)?,
        effect: parse_enum(&row.text("effect")?)?,
        condition,
        priority: row.int("priority")?,
        is_active: row.flag("is_active"),
        allowed_principals: principals,
        require_email_verified: row.flag("require_email_verified"),
        allowed_roles: roles,
        created_at: row.time("created_at")?,
        updated_at: row.time("updated_at")?,
    })
}

impl TenantScope<'_> {
    pub fn create_policy(&self, collection: &Collection, spec: PolicySpec) -> EngineResult<Policy> {
        spec.check()?;
        let now = self.now();
        let policy = Policy {
            id: new_id(),
            collection_id: collection.id.clone(),
            name: spec.name,
            description: spec.description,
            action: spec.action,
            effect: spec.effect,
            condition: spec.condition,
            priority: spec.priority,
            is_active: true,
            allowed_principals: effective_principals(spec.allowed_principals),
            require_email_verified: spec.require_email_verified,
            allowed_roles: spec.allowed_roles,
            created_at: now,
            updated_at: now,
        };
        run(
            self.exec,
            "INSERT INTO policies (id, collection_id, name, description, action, effect, condition_json, \
             priority, is_active, allowed_principals, require_email_verified, allowed_roles, \
             created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            &[
                json!(policy.id),
                json!(policy.collection_id),
                json!(policy.name),
                json!(policy.description),
                json!(policy.action.as_str()),
                json!(policy.effect),
                optional_json(policy.condition.as_ref())?,
                json!(policy.priority),
                flag(true),
                json!(serde_json::to_string(&policy.allowed_principals)?),
                flag(policy.require_email_verified),
                optional_json(Some(&policy.allowed_roles).filter(|r| !r.is_empty()))?,
                json!(timestamp(now)),
                json!(timestamp(now)),
            ],
        )?;
        info!(
            collection = %collection.name,
            policy = %policy.name,
            action = %policy.action,
            "policy_created"
        );
        Ok(policy)
    }

    /// Every policy of the collection, highest priority first.
    pub fn list_policies(&self, collection: &Collection) -> EngineResult<Vec<Policy>> {
        fetch(
            self.exec,
            "SELECT * FROM policies WHERE collection_id = ? ORDER BY priority DESC, created_at",
            &[json!(collection.id)],
        )?
        .iter()
        .map(policy_from_row)
        .collect()
    }

    /// A policy of any collection in this project.
    pub fn get_policy(&self, id: &str) -> EngineResult<Policy> {
        let row = fetch_one(self.exec, "SELECT * FROM policies WHERE id = ?", &[json!(id)])?
            .ok_or_else(|| EngineError::not_found("Policy", id))?;
        let policy = policy_from_row(&row)?;
        let collection = store::get_collection(self.exec, &policy.collection_id)?;
        if collection.project_id != self.project.id {
            return Err(EngineError::not_found("Policy", id));
        }
        Ok(policy)
    }

    pub fn update_policy(&self, id: &str, update: PolicyUpdate) -> EngineResult<Policy> {
        let mut policy = self.get_policy(id)?;
        if let Some(description) = update.description {
            policy.description = Some(description);
        }
        if let Some(condition) = update.condition {
            condition
                .check()
                .map_err(|e| EngineError::validation(format!("Invalid condition: {e}")))?;
            policy.condition = Some(condition);
        }
        if let Some(priority) = update.priority {
            policy.priority = priority;
        }
        if let Some(active) = update.is_active {
            policy.is_active = active;
        }
        if let Some(principals) = update.allowed_principals {
            policy.allowed_principals = effective_principals(principals);
        }
        if let Some(required) = update.require_email_verified {
            policy.require_email_verified = required;
        }
        if let Some(roles) = update.allowed_roles {
            policy.allowed_roles = roles;
        }
        policy.updated_at = self.now();

        run(
            self.exec,
            "UPDATE policies SET description = ?, condition_json = ?, priority = ?, is_active = ?, \
             allowed_principals = ?, require_email_verified = ?, allowed_roles = ?, updated_at = ? \
             WHERE id = ?",
            &[
                json!(policy.description),
                optional_json(policy.condition.as_ref())?,
                json!(policy.priority),
                flag(policy.is_active),
                json!(serde_json::to_string(&policy.allowed_principals)?),
                flag(policy.require_email_verified),
                optional_json(Some(&policy.allowed_roles).filter(|r| !r.is_empty()))?,
                json!(timestamp(policy.updated_at)),
                json!(policy.id),
            ],
        )?;
        info!(policy = %policy.name, "policy_updated");
        Ok(policy)
    }

    pub fn delete_policy(&self, id: &str) -> EngineResult<()> {
        let policy = self.get_policy(id)?;
        run(self.exec, "DELETE FROM policies WHERE id = ?", &[json!(policy.id)])?;
        info!(policy = %policy.name, "policy_deleted");
        Ok(())
    }

    /// Decide whether `principal` may perform `action` on `collection`,
    /// optionally against one record.
    pub fn evaluate(
        &self,
        principal: &Principal,
        collection: &Collection,
        action: PolicyAction,
        record: Option<&Record>,
    ) -> EngineResult<Decision> {
        if principal.kind == PrincipalKind::AdminUser {
            return Ok(Decision::Allow);
        }

        let policies: Vec<Policy> = self
            .list_policies(collection)?
            .into_iter()
            .filter(|p| p.is_active)
            .collect();
        if policies.is_empty() {
            return Ok(if DEFAULT_PRINCIPALS.contains(&principal.kind) {
                Decision::Allow
            } else {
                Decision::Deny(format!(
                    "No policies on '{}'; {} access is not allowed",
                    collection.name, principal.kind
                ))
            });
        }

        let roles = match (&principal.roles, principal.kind, &principal.app_user_id) {
            (Some(roles), _, _) => roles.clone(),
            (None, PrincipalKind::AppUser, Some(id)) => self.get_user_roles(id)?,
            _ => Vec::new(),
        };

        for policy in policies.iter().filter(|p| p.action == action) {
            if policy.admits(principal, &roles, record) {
                debug!(policy = %policy.name, effect = ?policy.effect, "policy_matched");
                return Ok(match policy.effect {
                    Effect::Allow => Decision::Allow,
                    Effect::Deny => Decision::Deny(format!("Denied by policy '{}'", policy.name)),
                });
            }
        }
        Ok(Decision::Deny(format!(
            "No policy allows {} on '{}'",
            action, collection.name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(spec: PolicySpec) -> Policy {
        Policy {
            id: "p".into(),
            collection_id: "c".into(),
            name: spec.name,
            description: None,
            action: spec.action,
            effect: spec.effect,
            condition: spec.condition,
            priority: spec.priority,
            is_active: true,
            allowed_principals: spec.allowed_principals,
            require_email_verified: spec.require_email_verified,
            allowed_roles: spec.allowed_roles,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_admits_checks_principal_verification_and_roles() {
        let p = policy(
            PolicySpec::new("editors", PolicyAction::Update, Effect::Allow)
                .principals(&[PrincipalKind::AppUser])
                .roles(["editor"])
                .require_email_verified(),
        );
        let verified = Principal::app_user("a1").with_email("a@b.io", true);
        assert!(p.admits(&verified, &["editor".into()], None));
        assert!(!p.admits(&verified, &["viewer".into()], None));
        assert!(!p.admits(&Principal::app_user("a1"), &["editor".into()], None));
        assert!(!p.admits(&Principal::api_key("k"), &[], None));
    }

    #[test]
    fn test_spec_from_json_rejects_unknown_values() {
        let ok = PolicySpec::from_json(json!({
            "name": "read own",
            "action": "read",
            "effect": "allow",
            "condition": {"type": "owner"}
        }))
        .unwrap();
        assert_eq!(ok.allowed_principals, DEFAULT_PRINCIPALS);
        let empty = PolicySpec::from_json(json!({
            "name": "x", "action": "read", "effect": "allow", "allowed_principals": []
        }))
        .unwrap();
        assert!(empty.allowed_principals.is_empty());
        assert!(PolicySpec::from_json(json!({"name": "x", "action": "fly", "effect": "allow"})).is_err());
        assert!(PolicySpec::from_json(json!({"name": "x", "action": "read", "effect": "maybe"})).is_err());
        assert!(PolicySpec::from_json(json!({
            "name": "x", "action": "read", "effect": "allow", "allowed_principals": ["robot"]
        }))
        .is_err());
        assert!(PolicySpec::from_json(json!({
            "name": "x", "action": "read", "effect": "allow", "condition": {"type": "magic"}
        }))
        .is_err());
    }

    #[test]
    fn test_spec_check() {
        assert!(PolicySpec::new(" ", PolicyAction::Read, Effect::Allow).check().is_err());
        assert!(PolicySpec::new("x", PolicyAction::Read, Effect::Allow)
            .principals(&[])
            .check()
            .is_ok());
    }

    #[test]
    fn test_empty_principal_list_admits_defaults() {
        let p = policy(PolicySpec::new("keys", PolicyAction::Read, Effect::Allow).principals(&[]));
        assert!(p.admits(&Principal::api_key("k"), &[], None));
        assert!(!p.admits(&Principal::app_user("a1"), &[], None));
        assert!(!p.admits(&Principal::anonymous(), &[], None));
    }
}
