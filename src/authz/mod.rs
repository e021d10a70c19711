//! # Authorization
//!
//! Per-collection policies decide whether a principal may perform an action,
//! optionally against one record. Evaluation is a pure scan over the active
//! policies; denial is a [`Decision`], not an error.
//!
//! - [`condition`]: the JSON condition tree and its evaluator
//! - [`policy`]: policy CRUD and the decision algorithm
//! - [`rbac`]: project roles and their assignment to app users

pub mod condition;
pub mod policy;
pub mod rbac;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use condition::Condition;
pub use policy::{Effect, Policy, PolicyAction, PolicySpec, PolicyUpdate};
pub use rbac::{Role, RoleUpdate, DEFAULT_ROLES};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalKind {
    AdminUser,
    AppUser,
    ApiKey,
    Anonymous,
}

impl PrincipalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PrincipalKind::AdminUser => "admin_user",
            PrincipalKind::AppUser => "app_user",
            PrincipalKind::ApiKey => "api_key",
            PrincipalKind::Anonymous => "anonymous",
        }
    }
}

impl fmt::Display for PrincipalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PrincipalKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin_user" => Ok(PrincipalKind::AdminUser),
            "app_user" => Ok(PrincipalKind::AppUser),
            "api_key" => Ok(PrincipalKind::ApiKey),
            "anonymous" => Ok(PrincipalKind::Anonymous),
            other => Err(format!("Unknown principal type: {other}")),
        }
    }
}

/// The caller, as resolved by the transport layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Principal {
    pub kind: PrincipalKind,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub app_user_id: Option<String>,
    #[serde(default)]
    pub api_key_id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub email_verified: bool,
    /// Role names; loaded from the catalog when absent
    #[serde(default)]
    pub roles: Option<Vec<String>>,
}

impl Principal {
    fn of(kind: PrincipalKind) -> Self {
        Principal {
            kind,
            user_id: None,
            app_user_id: None,
            api_key_id: None,
            email: None,
            email_verified: false,
            roles: None,
        }
    }

    pub fn admin(user_id: impl Into<String>) -> Self {
        Principal {
            user_id: Some(user_id.into()),
            ..Principal::of(PrincipalKind::AdminUser)
        }
    }

    pub fn app_user(app_user_id: impl Into<String>) -> Self {
        Principal {
            app_user_id: Some(app_user_id.into()),
            ..Principal::of(PrincipalKind::AppUser)
        }
    }

    pub fn api_key(api_key_id: impl Into<String>) -> Self {
        Principal {
            api_key_id: Some(api_key_id.into()),
            ..Principal::of(PrincipalKind::ApiKey)
        }
    }

    pub fn anonymous() -> Self {
        Principal::of(PrincipalKind::Anonymous)
    }

    pub fn with_email(mut self, email: impl Into<String>, verified: bool) -> Self {
        self.email = Some(email.into());
        self.email_verified = verified;
        self
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = Some(roles.into_iter().map(Into::into).collect());
        self
    }

    pub fn is_authenticated(&self) -> bool {
        self.kind != PrincipalKind::Anonymous
    }

    /// Admins count as verified.
    pub fn is_email_verified(&self) -> bool {
        self.kind == PrincipalKind::AdminUser || self.email_verified
    }

    /// Id compared against ownership columns
    pub fn owner_id(&self) -> Option<&str> {
        match self.kind {
            PrincipalKind::AppUser => self.app_user_id.as_deref(),
            PrincipalKind::ApiKey => self.api_key_id.as_deref(),
            PrincipalKind::AdminUser => self.user_id.as_deref(),
            PrincipalKind::Anonymous => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", content = "reason", rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Deny(String),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_principal_kind_roundtrip() {
        for kind in [
            PrincipalKind::AdminUser,
            PrincipalKind::AppUser,
            PrincipalKind::ApiKey,
            PrincipalKind::Anonymous,
        ] {
            assert_eq!(kind.as_str().parse::<PrincipalKind>(), Ok(kind));
        }
        assert!("root".parse::<PrincipalKind>().is_err());
    }

    #[test]
    fn test_principal_flags() {
        assert!(Principal::admin("u1").is_email_verified());
        assert!(!Principal::app_user("a1").is_email_verified());
        assert!(Principal::app_user("a1").with_email("a@b.io", true).is_email_verified());
        assert!(!Principal::anonymous().is_authenticated());
        assert_eq!(Principal::app_user("a1").owner_id(), Some("a1"));
        assert_eq!(Principal::anonymous().owner_id(), None);
    }

    #[test]
    fn test_decision_serializes_with_reason() {
        let json = serde_json::to_value(Decision::Deny("no".into())).unwrap();
        assert_eq!(json, serde_json::json!({"decision": "deny", "reason": "no"}));
        assert_eq!(
            serde_json::to_value(Decision::Allow).unwrap(),
            serde_json::json!({"decision": "allow"})
        );
    }
}
