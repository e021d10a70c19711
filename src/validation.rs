//! Field validation rules
//!
//! Declarative per-field rules checked on every insert and update. Rules are
//! stored as tagged JSON in `validation_rules` and evaluated in ascending
//! priority; every failing rule contributes one message. Null always passes.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{NaiveDate, NaiveDateTime, Utc};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::backend::{fetch, fetch_one, flag, run, timestamp, Executor, Record, RowExt};
use crate::catalog::{new_id, Collection, Field, FieldType};
use crate::engine::TenantScope;
use crate::error::{EngineError, EngineResult};

/// Field name to failure messages
pub type Violations = BTreeMap<String, Vec<String>>;

const TEXTUAL: &[FieldType] = &[FieldType::String, FieldType::Text];
const NUMERIC: &[FieldType] = &[FieldType::Int, FieldType::Float];
const ENUMERABLE: &[FieldType] = &[FieldType::String, FieldType::Text, FieldType::Int];

fn default_date_format() -> String {
    "%Y-%m-%d".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleKind {
    MinLength {
        min: usize,
    },
    MaxLength {
        max: usize,
    },
    /// Anchored at the start of the value; flags `i` and `m`
    #[serde(alias = "custom_regex")]
    Regex {
        pattern: String,
        #[serde(default)]
        flags: String,
    },
    Email,
    Url,
    Uuid,
    NotEmpty,
    DateFormat {
        #[serde(default = "default_date_format")]
        format: String,
    },
    MinValue {
        min: f64,
    },
    MaxValue {
        max: f64,
    },
    Range {
        min: f64,
        max: f64,
    },
    Enum {
        values: Vec<Value>,
    },
}

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").expect("valid email regex")
});

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^https?://[^\s/$.?#].[^\s]*$").expect("valid url regex"));

static UUID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$")
        .expect("valid uuid regex")
});

fn build_pattern(pattern: &str, flags: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(&format!("^(?:{pattern})"))
        .case_insensitive(flags.contains('i'))
        .multi_line(flags.contains('m'))
        .build()
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn number_of(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl RuleKind {
    pub fn rule_type(&self) -> &'static str {
        match self {
            RuleKind::MinLength { .. } => "min_length",
            RuleKind::MaxLength { .. } => "max_length",
            RuleKind::Regex { .. } => "regex",
            RuleKind::Email => "email",
            RuleKind::Url => "url",
            RuleKind::Uuid => "uuid",
            RuleKind::NotEmpty => "not_empty",
            RuleKind::DateFormat { .. } => "date_format",
            RuleKind::MinValue { .. } => "min_value",
            RuleKind::MaxValue { .. } => "max_value",
            RuleKind::Range { .. } => "range",
            RuleKind::Enum { .. } => "enum",
        }
    }

    pub fn applies_to(&self) -> &'static [FieldType] {
        match self {
            RuleKind::MinValue { .. } | RuleKind::MaxValue { .. } | RuleKind::Range { .. } => NUMERIC,
            RuleKind::Enum { .. } => ENUMERABLE,
            _ => TEXTUAL,
        }
    }

    /// Default failure message, or `None` when the value passes.
    pub fn check(&self, value: &Value) -> Option<String> {
        if value.is_null() {
            return None;
        }
        match self {
            RuleKind::MinLength { min } => {
                (text_of(value).chars().count() < *min).then(|| format!("Must be at least {min} characters"))
            }
            RuleKind::MaxLength { max } => {
                (text_of(value).chars().count() > *max).then(|| format!("Must be at most {max} characters"))
            }
            RuleKind::Regex { pattern, flags } => match build_pattern(pattern, flags) {
                Ok(re) => (!re.is_match(&text_of(value))).then(|| "Does not match required pattern".to_string()),
                Err(e) => Some(format!("Validation error: {e}")),
            },
            RuleKind::Email => {
                (!EMAIL_RE.is_match(&text_of(value))).then(|| "Invalid email format".to_string())
            }
            RuleKind::Url => (!URL_RE.is_match(&text_of(value))).then(|| "Invalid URL format".to_string()),
            RuleKind::Uuid => (!UUID_RE.is_match(&text_of(value))).then(|| "Invalid UUID format".to_string()),
            RuleKind::NotEmpty => text_of(value).trim().is_empty().then(|| "Cannot be empty".to_string()),
            RuleKind::DateFormat { format } => {
                let raw = text_of(value);
                let parsed = NaiveDateTime::parse_from_str(&raw, format).is_ok()
                    || NaiveDate::parse_from_str(&raw, format).is_ok();
                (!parsed).then(|| format!("Invalid date format, expected {format}"))
            }
            RuleKind::MinValue { min } => match number_of(value) {
                Some(v) => (v < *min).then(|| format!("Must be at least {min}")),
                None => Some("Validation error: not a number".to_string()),
            },
            RuleKind::MaxValue { max } => match number_of(value) {
                Some(v) => (v > *max).then(|| format!("Must be at most {max}")),
                None => Some("Validation error: not a number".to_string()),
            },
            RuleKind::Range { min, max } => match number_of(value) {
                Some(v) => (v < *min || v > *max).then(|| format!("Must be between {min} and {max}")),
                None => Some("Validation error: not a number".to_string()),
            },
            RuleKind::Enum { values } => (!values.contains(value)).then(|| {
                let allowed: Vec<String> = values.iter().map(text_of).collect();
                format!("Must be one of: {}", allowed.join(", "))
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRule {
    pub id: String,
    pub field_id: String,
    pub rule: RuleKind,
    pub error_message: Option<String>,
    pub priority: i64,
    pub is_active: bool,
    pub created_at: chrono::DateTime<Utc>,
}

impl ValidationRule {
    /// Message for `value`, the custom one taking precedence.
    pub fn validate(&self, value: &Value) -> Option<String> {
        self.rule
            .check(value)
            .map(|default| self.error_message.clone().unwrap_or(default))
    }
}

/// Changes for `update_validation_rule`; `None` keeps the current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleUpdate {
    pub rule: Option<RuleKind>,
    pub error_message: Option<String>,
    pub priority: Option<i64>,
    pub is_active: Option<bool>,
}

fn check_applicable(field: &Field, rule: &RuleKind) -> EngineResult<()> {
    if !rule.applies_to().contains(&field.field_type) {
        return Err(EngineError::validation(format!(
            "Rule type '{}' cannot be applied to field type '{}'",
            rule.rule_type(),
            field.field_type
        )));
    }
    if let RuleKind::Regex { pattern, flags } = rule {
        build_pattern(pattern, flags)
            .map_err(|e| EngineError::validation(format!("Invalid regex pattern: {e}")))?;
    }
    if let RuleKind::Range { min, max } = rule {
        if min > max {
            return Err(EngineError::validation("Range minimum exceeds maximum"));
        }
    }
    Ok(())
}

fn rule_from_row(row: &Record) -> EngineResult<ValidationRule> {
    Ok(ValidationRule {
        id: row.text("id")?,
        field_id: row.text("field_id")?,
        rule: serde_json::from_value(row.json("rule_json")?)?,
        error_message: row.opt_text("error_message"),
        priority: row.int("priority")?,
        is_active: row.flag("is_active"),
        created_at: row.time("created_at")?,
    })
}

pub fn create_validation_rule(
    exec: &dyn Executor,
    field: &Field,
    rule: RuleKind,
    error_message: Option<&str>,
    priority: i64,
) -> EngineResult<ValidationRule> {
    check_applicable(field, &rule)?;
    let created = ValidationRule {
        id: new_id(),
        field_id: field.id.clone(),
        rule,
        error_message: error_message.map(str::to_string),
        priority,
        is_active: true,
        created_at: Utc::now(),
    };
    run(
        exec,
        "INSERT INTO validation_rules (id, field_id, rule_json, error_message, priority, is_active, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        &[
            json!(created.id),
            json!(created.field_id),
            json!(serde_json::to_string(&created.rule)?),
            json!(created.error_message),
            json!(created.priority),
            flag(true),
            json!(timestamp(created.created_at)),
        ],
    )?;
    info!(field = %field.name, rule = created.rule.rule_type(), "validation_rule_created");
    Ok(created)
}

pub fn get_validation_rule(exec: &dyn Executor, id: &str) -> EngineResult<ValidationRule> {
    let row = fetch_one(exec, "SELECT * FROM validation_rules WHERE id = ?", &[json!(id)])?
        .ok_or_else(|| EngineError::not_found("Validation rule", id))?;
    rule_from_row(&row)
}

/// Active rules of a field, lowest priority value first.
pub fn list_field_rules(exec: &dyn Executor, field_id: &str) -> EngineResult<Vec<ValidationRule>> {
    fetch(
        exec,
        "SELECT * FROM validation_rules WHERE field_id = ? AND is_active = 1 \
         ORDER BY priority, created_at",
        &[json!(field_id)],
    )?
    .iter()
    .map(rule_from_row)
    .collect()
}

pub fn update_validation_rule(
    exec: &dyn Executor,
    field: &Field,
    id: &str,
    update: RuleUpdate,
) -> EngineResult<ValidationRule> {
    let mut rule = get_validation_rule(exec, id)?;
    if rule.field_id != field.id {
        return Err(EngineError::not_found("Validation rule", id));
    }
    if let Some(kind) = update.rule {
        check_applicable(field, &kind)?;
        rule.rule = kind;
    }
    if let Some(message) = update.error_message {
        rule.error_message = Some(message);
    }
    if let Some(priority) = update.priority {
        rule.priority = priority;
    }
    if let Some(active) = update.is_active {
        rule.is_active = active;
    }
    run(
        exec,
        "UPDATE validation_rules SET rule_json = ?, error_message = ?, priority = ?, is_active = ? \
         WHERE id = ?",
        &[
            json!(serde_json::to_string(&rule.rule)?),
            json!(rule.error_message),
            json!(rule.priority),
            flag(rule.is_active),
            json!(rule.id),
        ],
    )?;
    Ok(rule)
}

pub fn delete_validation_rule(exec: &dyn Executor, id: &str) -> EngineResult<()> {
    if run(exec, "DELETE FROM validation_rules WHERE id = ?", &[json!(id)])? == 0 {
        return Err(EngineError::not_found("Validation rule", id));
    }
    Ok(())
}

/// Messages for every failing rule of every given field.
pub fn rule_violations<'v>(
    exec: &dyn Executor,
    values: impl IntoIterator<Item = (&'v Field, &'v Value)>,
) -> EngineResult<Violations> {
    let mut violations = Violations::new();
    for (field, value) in values {
        if value.is_null() {
            continue;
        }
        let messages: Vec<String> = list_field_rules(exec, &field.id)?
            .iter()
            .filter_map(|rule| rule.validate(value))
            .collect();
        if !messages.is_empty() {
            violations.insert(field.name.clone(), messages);
        }
    }
    Ok(violations)
}

pub fn violations_error(violations: &Violations) -> EngineError {
    let parts: Vec<String> = violations
        .iter()
        .map(|(field, messages)| format!("{field}: {}", messages.join(", ")))
        .collect();
    EngineError::validation(format!("Validation failed: {}", parts.join("; ")))
}

impl TenantScope<'_> {
    /// Check `data` (keyed by field or column name) against the rules of
    /// every live field of `collection`.
    pub fn validate_record(&self, collection: &Collection, data: &Record) -> EngineResult<Violations> {
        let fields = self.list_fields(collection, false)?;
        let values: Vec<(&Field, &Value)> = fields
            .iter()
            .filter_map(|f| {
                data.get(&f.name)
                    .or_else(|| data.get(&f.sql_column_name))
                    .map(|v| (f, v))
            })
            .collect();
        rule_violations(self.exec, values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(v: Value) -> RuleKind {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn test_string_rules() {
        assert!(rule(json!({"type": "min_length", "min": 3})).check(&json!("ab")).is_some());
        assert!(rule(json!({"type": "max_length", "max": 3})).check(&json!("abc")).is_none());
        assert_eq!(
            rule(json!({"type": "not_empty"})).check(&json!("   ")),
            Some("Cannot be empty".to_string())
        );
        assert!(RuleKind::Email.check(&json!("a@b.io")).is_none());
        assert!(RuleKind::Email.check(&json!("nope")).is_some());
        assert!(RuleKind::Url.check(&json!("https://example.com/x")).is_none());
        assert!(RuleKind::Uuid.check(&json!("6F9619FF-8B86-D011-B42D-00CF4FC964FF")).is_none());
        assert!(RuleKind::Url.check(&json!("ftp://example.com")).is_some());
        assert!(RuleKind::Uuid.check(&json!("6F9619FF-8B86")).is_some());
    }

    #[test]
    fn test_regex_is_anchored_at_start_and_honours_flags() {
        let r = rule(json!({"type": "regex", "pattern": "ab+"}));
        assert!(r.check(&json!("abbb-tail")).is_none());
        assert!(r.check(&json!("xab")).is_some());
        let r = rule(json!({"type": "custom_regex", "pattern": "ab", "flags": "i"}));
        assert!(r.check(&json!("AB")).is_none());
    }

    #[test]
    fn test_numeric_rules() {
        let r = rule(json!({"type": "range", "min": 1, "max": 5}));
        assert!(r.check(&json!(3)).is_none());
        assert_eq!(r.check(&json!(6)), Some("Must be between 1 and 5".to_string()));
        assert!(r.check(&json!("4")).is_none());
        assert!(rule(json!({"type": "min_value", "min": 0})).check(&json!(-1)).is_some());
        assert!(rule(json!({"type": "max_value", "max": 10})).check(&json!("x")).is_some());
    }

    #[test]
    fn test_enum_and_date_format() {
        let r = rule(json!({"type": "enum", "values": ["draft", "published"]}));
        assert!(r.check(&json!("draft")).is_none());
        assert_eq!(
            r.check(&json!("gone")),
            Some("Must be one of: draft, published".to_string())
        );
        let r = rule(json!({"type": "date_format"}));
        assert!(r.check(&json!("2024-02-29")).is_none());
        assert!(r.check(&json!("29/02/2024")).is_some());
    }

    #[test]
    fn test_null_always_passes() {
        assert!(RuleKind::NotEmpty.check(&Value::Null).is_none());
        assert!(rule(json!({"type": "min_value", "min": 1})).check(&Value::Null).is_none());
    }

    #[test]
    fn test_custom_message_wins() {
        let r = ValidationRule {
            id: "r".into(),
            field_id: "f".into(),
            rule: RuleKind::NotEmpty,
            error_message: Some("Title please".into()),
            priority: 0,
            is_active: true,
            created_at: Utc::now(),
        };
        assert_eq!(r.validate(&json!("")), Some("Title please".to_string()));
    }

    #[test]
    fn test_applicability() {
        let mut field = crate::schema::FieldSpec::new("n", FieldType::Int).into_field("c", false);
        assert!(check_applicable(&field, &RuleKind::Range { min: 0.0, max: 1.0 }).is_ok());
        assert!(check_applicable(&field, &RuleKind::Email).is_err());
        field.field_type = FieldType::Text;
        assert!(check_applicable(&field, &RuleKind::MinLength { min: 1 }).is_ok());
        let bad = RuleKind::Regex {
            pattern: "(".into(),
            flags: String::new(),
        };
        assert!(check_applicable(&field, &bad).is_err());
    }
}
