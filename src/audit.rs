//! Record change events and the audit trail
//!
//! Every successful insert/update/delete hands a [`RecordEvent`] to the
//! engine's [`EventSink`] inside the caller's transaction. The default sink
//! appends it to `audit_events`; delivery to webhooks or workflows belongs
//! to whoever consumes those rows or replaces the sink.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use tracing::info;

use crate::backend::{fetch, fetch_one, run, timestamp, Executor, Record, RowExt};
use crate::catalog::new_id;
use crate::error::{EngineError, EngineResult};

/// Who performed a mutation, for `created_by_*` columns and the audit trail
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: Option<String>,
    pub app_user_id: Option<String>,
    pub api_key_id: Option<String>,
}

impl Actor {
    pub fn admin(user_id: impl Into<String>) -> Self {
        Actor {
            user_id: Some(user_id.into()),
            ..Actor::default()
        }
    }

    pub fn app_user(app_user_id: impl Into<String>) -> Self {
        Actor {
            app_user_id: Some(app_user_id.into()),
            ..Actor::default()
        }
    }

    pub fn api_key(api_key_id: impl Into<String>) -> Self {
        Actor {
            api_key_id: Some(api_key_id.into()),
            ..Actor::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordAction {
    Create,
    Update,
    Delete,
}

impl RecordAction {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordAction::Create => "create",
            RecordAction::Update => "update",
            RecordAction::Delete => "delete",
        }
    }

    /// Name used for asynchronous delivery
    pub fn event_name(self) -> &'static str {
        match self {
            RecordAction::Create => "record.created",
            RecordAction::Update => "record.updated",
            RecordAction::Delete => "record.deleted",
        }
    }
}

impl fmt::Display for RecordAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(RecordAction::Create),
            "update" => Ok(RecordAction::Update),
            "delete" => Ok(RecordAction::Delete),
            _ => Err(format!("Unknown record action '{s}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordEvent {
    pub project_id: String,
    pub collection_id: String,
    pub collection_name: String,
    pub record_id: i64,
    pub action: RecordAction,
    pub old_data: Option<Record>,
    pub new_data: Option<Record>,
    pub actor: Actor,
}

impl RecordEvent {
    pub fn name(&self) -> &'static str {
        self.action.event_name()
    }
}

pub trait EventSink: Send + Sync {
    fn record_changed(&self, exec: &dyn Executor, event: &RecordEvent) -> EngineResult<()>;
}

/// Persists every event to `audit_events` in the same transaction.
pub struct AuditLogSink;

impl EventSink for AuditLogSink {
    fn record_changed(&self, exec: &dyn Executor, event: &RecordEvent) -> EngineResult<()> {
        log_audit_event(exec, event)?;
        Ok(())
    }
}

/// Emits a tracing event and stores nothing.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record_changed(&self, _exec: &dyn Executor, event: &RecordEvent) -> EngineResult<()> {
        info!(
            event = event.name(),
            collection = %event.collection_name,
            record_id = event.record_id,
            "record_event"
        );
        Ok(())
    }
}

/// Stored audit trail entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub project_id: String,
    pub collection_id: String,
    pub record_id: i64,
    pub action: RecordAction,
    pub actor: Actor,
    pub old_data: Option<Value>,
    pub new_data: Option<Value>,
    pub created_at: DateTime<Utc>,
}

fn json_text(data: Option<&Record>) -> Value {
    data.map_or(Value::Null, |d| json!(Value::Object(d.clone()).to_string()))
}

fn opt(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |s| json!(s))
}

pub fn log_audit_event(exec: &dyn Executor, event: &RecordEvent) -> EngineResult<String> {
    let id = new_id();
    run(
        exec,
        "INSERT INTO audit_events (id, seq, project_id, collection_id, record_id, action, \
         actor_user_id, actor_app_user_id, actor_api_key_id, old_data_json, new_data_json, created_at) \
         VALUES (?, (SELECT COALESCE(MAX(seq), 0) + 1 FROM audit_events), ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        &[
            json!(id),
            json!(event.project_id),
            json!(event.collection_id),
            json!(event.record_id),
            json!(event.action.as_str()),
            opt(event.actor.user_id.as_deref()),
            opt(event.actor.app_user_id.as_deref()),
            opt(event.actor.api_key_id.as_deref()),
            json_text(event.old_data.as_ref()),
            json_text(event.new_data.as_ref()),
            json!(timestamp(Utc::now())),
        ],
    )?;
    info!(
        event = event.name(),
        collection = %event.collection_name,
        record_id = event.record_id,
        "audit_event_logged"
    );
    Ok(id)
}

fn audit_event_from_row(row: &Record) -> EngineResult<AuditEvent> {
    let data = |col: &str| -> EngineResult<Option<Value>> {
        Ok(match row.json(col)? {
            Value::Null => None,
            v => Some(v),
        })
    };
    Ok(AuditEvent {
        id: row.text("id")?,
        project_id: row.text("project_id")?,
        collection_id: row.text("collection_id")?,
        record_id: row.int("record_id")?,
        action: row.text("action")?.parse().map_err(EngineError::Corrupt)?,
        actor: Actor {
            user_id: row.opt_text("actor_user_id"),
            app_user_id: row.opt_text("actor_app_user_id"),
            api_key_id: row.opt_text("actor_api_key_id"),
        },
        old_data: data("old_data_json")?,
        new_data: data("new_data_json")?,
        created_at: row.time("created_at")?,
    })
}

/// Filter for [`list_audit_events`]
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub collection_id: Option<String>,
    pub record_id: Option<i64>,
    pub action: Option<RecordAction>,
    pub limit: usize,
    pub offset: usize,
}

/// Newest first; returns the page and the total matching count.
pub fn list_audit_events(
    exec: &dyn Executor,
    project_id: &str,
    query: &AuditQuery,
) -> EngineResult<(Vec<AuditEvent>, usize)> {
    let mut clauses = vec!["project_id = ?"];
    let mut params = vec![json!(project_id)];
    if let Some(cid) = &query.collection_id {
        clauses.push("collection_id = ?");
        params.push(json!(cid));
    }
    if let Some(rid) = query.record_id {
        clauses.push("record_id = ?");
        params.push(json!(rid));
    }
    if let Some(action) = query.action {
        clauses.push("action = ?");
        params.push(json!(action.as_str()));
    }
    let predicate = clauses.join(" AND ");

    let total = fetch_one(
        exec,
        &format!("SELECT COUNT(*) AS n FROM audit_events WHERE {predicate}"),
        &params,
    )?
    .map_or(Ok(0), |row| row.int("n"))?;

    let limit = if query.limit == 0 { 100 } else { query.limit };
    params.push(json!(limit));
    params.push(json!(query.offset));
    let events = fetch(
        exec,
        &format!(
            "SELECT * FROM audit_events WHERE {predicate} ORDER BY seq DESC LIMIT ? OFFSET ?"
        ),
        &params,
    )?
    .iter()
    .map(audit_event_from_row)
    .collect::<EngineResult<Vec<_>>>()?;

    Ok((events, total as usize))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{open_in_memory, SqliteExecutor};

    fn event(record_id: i64, action: RecordAction) -> RecordEvent {
        let data = json!({"id": record_id, "title": "hello"})
            .as_object()
            .cloned()
            .unwrap();
        RecordEvent {
            project_id: "p1".into(),
            collection_id: "c1".into(),
            collection_name: "articles".into(),
            record_id,
            action,
            old_data: None,
            new_data: Some(data),
            actor: Actor::app_user("u1"),
        }
    }

    #[test]
    fn test_event_names() {
        assert_eq!(event(1, RecordAction::Create).name(), "record.created");
        assert_eq!(RecordAction::Update.event_name(), "record.updated");
        assert_eq!(RecordAction::Delete.event_name(), "record.deleted");
    }

    #[test]
    fn test_audit_log_roundtrip_and_filters() {
        let conn = open_in_memory().unwrap();
        let exec = SqliteExecutor::new(&conn);
        let sink = AuditLogSink;
        sink.record_changed(&exec, &event(1, RecordAction::Create)).unwrap();
        sink.record_changed(&exec, &event(1, RecordAction::Update)).unwrap();
        sink.record_changed(&exec, &event(2, RecordAction::Create)).unwrap();

        let (all, total) = list_audit_events(&exec, "p1", &AuditQuery::default()).unwrap();
        assert_eq!(total, 3);
        assert_eq!(all[0].record_id, 2);
        assert_eq!(all[2].action, RecordAction::Create);
        assert_eq!(all[0].actor.app_user_id.as_deref(), Some("u1"));
        assert_eq!(all[0].new_data.as_ref().unwrap()["title"], json!("hello"));

        let query = AuditQuery {
            record_id: Some(1),
            action: Some(RecordAction::Update),
            ..AuditQuery::default()
        };
        let (events, total) = list_audit_events(&exec, "p1", &query).unwrap();
        assert_eq!(total, 1);
        assert_eq!(events[0].action, RecordAction::Update);

        let (events, total) = list_audit_events(&exec, "other", &AuditQuery::default()).unwrap();
        assert!(events.is_empty());
        assert_eq!(total, 0);
    }
}
