//! Policy condition trees
//!
//! Conditions are stored as JSON tagged by `type`. Evaluation is a pure
//! function of the node, the principal and the record; a missing record or
//! field makes the condition false.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Principal;
use crate::backend::Record;

/// Ownership column written on insert by app users
pub const DEFAULT_OWNER_FIELD: &str = "created_by_app_user_id";

fn default_owner_field() -> String {
    DEFAULT_OWNER_FIELD.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    Authenticated,
    Owner {
        #[serde(default = "default_owner_field")]
        field: String,
    },
    AppUserOwner,
    /// `value` may be `principal.user_id`, `principal.email` or
    /// `principal.app_user_id`.
    FieldEquals { field: String, value: Value },
    And { conditions: Vec<Condition> },
    Or { conditions: Vec<Condition> },
    Not { condition: Box<Condition> },
}

fn principal_value(principal: &Principal, reference: &str) -> Option<Option<String>> {
    let value = match reference {
        "principal.user_id" => principal.user_id.clone(),
        "principal.email" => principal.email.clone(),
        "principal.app_user_id" => principal.app_user_id.clone(),
        _ => return None,
    };
    Some(value)
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn owned_by(record: Option<&Record>, field: &str, principal: &Principal) -> bool {
    let (Some(record), Some(owner)) = (record, principal.owner_id()) else {
        return false;
    };
    record
        .get(field)
        .and_then(scalar_text)
        .is_some_and(|v| v == owner)
}

impl Condition {
    pub fn evaluate(&self, principal: &Principal, record: Option<&Record>) -> bool {
        match self {
            Condition::Authenticated => principal.is_authenticated(),
            Condition::Owner { field } => owned_by(record, field, principal),
            Condition::AppUserOwner => owned_by(record, DEFAULT_OWNER_FIELD, principal),
            Condition::FieldEquals { field, value } => {
                let Some(actual) = record.and_then(|r| r.get(field)) else {
                    return false;
                };
                let expected = match value.as_str().and_then(|s| principal_value(principal, s)) {
                    Some(Some(id)) => Value::String(id),
                    Some(None) => return false,
                    None => value.clone(),
                };
                actual == &expected
                    || matches!(
                        (scalar_text(actual), scalar_text(&expected)),
                        (Some(a), Some(b)) if a == b
                    )
            }
            Condition::And { conditions } => conditions.iter().all(|c| c.evaluate(principal, record)),
            Condition::Or { conditions } => conditions.iter().any(|c| c.evaluate(principal, record)),
            Condition::Not { condition } => !condition.evaluate(principal, record),
        }
    }

    /// Structural checks serde cannot express.
    pub fn check(&self) -> Result<(), String> {
        match self {
            Condition::Owner { field } | Condition::FieldEquals { field, .. } if field.is_empty() => {
                Err("Condition field must not be empty".to_string())
            }
            Condition::And { conditions } | Condition::Or { conditions } => {
                conditions.iter().try_for_each(Condition::check)
            }
            Condition::Not { condition } => condition.check(),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cond(v: Value) -> Condition {
        serde_json::from_value(v).unwrap()
    }

    fn record(v: Value) -> Record {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn test_owner_defaults_to_app_user_column() {
        let c = cond(json!({"type": "owner"}));
        assert_eq!(c, Condition::Owner { field: DEFAULT_OWNER_FIELD.into() });
        let mine = record(json!({"created_by_app_user_id": "a1"}));
        let theirs = record(json!({"created_by_app_user_id": "b2"}));
        let alice = Principal::app_user("a1");
        assert!(c.evaluate(&alice, Some(&mine)));
        assert!(!c.evaluate(&alice, Some(&theirs)));
        assert!(!c.evaluate(&alice, None));
        assert!(!c.evaluate(&Principal::anonymous(), Some(&mine)));
    }

    #[test]
    fn test_field_equals_substitutes_principal() {
        let c = cond(json!({"type": "field_equals", "field": "email", "value": "principal.email"}));
        let row = record(json!({"email": "a@b.io"}));
        let p = Principal::app_user("a1").with_email("a@b.io", true);
        assert!(c.evaluate(&p, Some(&row)));
        assert!(!c.evaluate(&Principal::app_user("a1"), Some(&row)));
    }

    #[test]
    fn test_field_equals_literal_and_missing_field() {
        let c = cond(json!({"type": "field_equals", "field": "status", "value": "published"}));
        let p = Principal::anonymous();
        assert!(c.evaluate(&p, Some(&record(json!({"status": "published"})))));
        assert!(!c.evaluate(&p, Some(&record(json!({"title": "x"})))));
        let n = cond(json!({"type": "field_equals", "field": "n", "value": "3"}));
        assert!(n.evaluate(&p, Some(&record(json!({"n": 3})))));
    }

    #[test]
    fn test_combinators() {
        let c = cond(json!({
            "type": "and",
            "conditions": [
                {"type": "authenticated"},
                {"type": "not", "condition": {"type": "field_equals", "field": "locked", "value": true}}
            ]
        }));
        let p = Principal::api_key("k1");
        assert!(c.evaluate(&p, Some(&record(json!({"locked": false})))));
        assert!(!c.evaluate(&p, Some(&record(json!({"locked": true})))));
        assert!(!cond(json!({"type": "or", "conditions": []})).evaluate(&p, None));
        assert!(cond(json!({"type": "and", "conditions": []})).evaluate(&p, None));
    }

    #[test]
    fn test_unknown_node_type_fails_to_parse() {
        assert!(serde_json::from_value::<Condition>(json!({"type": "always"})).is_err());
    }

    #[test]
    fn test_check_rejects_empty_field() {
        let c = cond(json!({"type": "or", "conditions": [{"type": "owner", "field": ""}]}));
        assert!(c.check().is_err());
        assert!(cond(json!({"type": "app_user_owner"})).check().is_ok());
    }
}
