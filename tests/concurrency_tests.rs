//! Concurrent schema changes against one database file.
//!
//! Each thread opens its own connection and runs its change inside an
//! immediate transaction, the way a request handler would.

use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use rusqlite::{Connection, TransactionBehavior};
use serde_json::json;
use tenantcore::backend::{open_database, SqliteExecutor};
use tenantcore::catalog::get_project;
use tenantcore::error::ErrorKind;
use tenantcore::schema::lock::{acquire, LockKey};
use tenantcore::schema::InProcessLock;
use tenantcore::{Actor, Config, Engine, EngineResult, FieldSpec, FieldType, Project, TenantScope};
use tempfile::TempDir;

const BUSY: Duration = Duration::from_secs(10);

/// Run `f` in its own connection and transaction; commits on success.
fn in_transaction<T>(
    path: &Path,
    engine: &Engine,
    project_id: &str,
    f: impl FnOnce(&TenantScope<'_>) -> EngineResult<T>,
) -> EngineResult<T> {
    let mut conn: Connection = open_database(path, BUSY)?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let result = {
        let exec = SqliteExecutor::new(&tx);
        let project = get_project(&exec, project_id)?;
        let scope = engine.scope(&exec, &project).with_actor(Actor::admin("owner"));
        f(&scope)
    };
    match result {
        Ok(v) => {
            tx.commit()?;
            Ok(v)
        }
        Err(e) => Err(e),
    }
}

fn seed(path: &Path, engine: &Engine) -> Project {
    let conn = open_database(path, BUSY).unwrap();
    let exec = SqliteExecutor::new(&conn);
    let project = engine.create_project(&exec, "acme", Actor::admin("owner")).unwrap();
    let scope = engine.scope(&exec, &project);
    let orders = scope.create_collection("orders", None).unwrap();
    scope
        .add_field(&orders, FieldSpec::new("total", FieldType::Float))
        .unwrap();
    project
}

#[test]
fn test_concurrent_renames_keep_one_identity() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tenants.db");
    let engine = Engine::new(Config::default());
    let project = seed(&path, &engine);

    let threads = 4;
    let barrier = Barrier::new(threads);
    let outcomes: Vec<EngineResult<String>> = thread::scope(|s| {
        let handles: Vec<_> = (0..threads)
            .map(|i| {
                let (path, engine, barrier, project_id) = (&path, &engine, &barrier, &project.id);
                s.spawn(move || {
                    barrier.wait();
                    in_transaction(path, engine, project_id, |scope| {
                        let current = scope.resolve_collection("orders")?;
                        let renamed = scope.rename_collection(&current, &format!("orders_{i}"))?;
                        Ok(renamed.id)
                    })
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for outcome in &outcomes {
        if let Err(e) = outcome {
            assert!(
                matches!(e.kind(), ErrorKind::Conflict | ErrorKind::Backend),
                "unexpected failure: {e}"
            );
        }
    }
    let succeeded: Vec<&String> = outcomes.iter().filter_map(|o| o.as_ref().ok()).collect();
    assert!(!succeeded.is_empty());

    let ids = in_transaction(&path, &engine, &project.id, |scope| {
        let mut names = vec!["orders".to_string()];
        names.extend((0..threads).map(|i| format!("orders_{i}")));
        let mut ids = Vec::new();
        for name in names {
            if let Ok(c) = scope.resolve_collection(&name) {
                ids.push(c.id);
            }
        }
        Ok(ids)
    })
    .unwrap();
    assert!(ids.len() > succeeded.len());
    assert!(ids.iter().all(|id| id == succeeded[0]));
}

#[test]
fn test_concurrent_field_adds_with_same_name() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tenants.db");
    let engine = Engine::new(Config::default());
    let project = seed(&path, &engine);

    let threads = 4;
    let barrier = Barrier::new(threads);
    let outcomes: Vec<EngineResult<()>> = thread::scope(|s| {
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let (path, engine, barrier, project_id) = (&path, &engine, &barrier, &project.id);
                s.spawn(move || {
                    barrier.wait();
                    in_transaction(path, engine, project_id, |scope| {
                        let orders = scope.resolve_collection("orders")?;
                        scope.add_field(&orders, FieldSpec::new("status", FieldType::String))?;
                        Ok(())
                    })
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 1);
    let fields = in_transaction(&path, &engine, &project.id, |scope| {
        let orders = scope.resolve_collection("orders")?;
        scope.list_fields(&orders, true)
    })
    .unwrap();
    assert_eq!(fields.iter().filter(|f| f.name == "status").count(), 1);
}

#[test]
fn test_held_lock_rejects_second_change() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tenants.db");
    let lock = Arc::new(InProcessLock::new(Duration::ZERO));
    let engine = Engine::new(Config::default()).with_lock(lock.clone());
    let project = seed(&path, &engine);

    let conn = open_database(&path, BUSY).unwrap();
    let exec = SqliteExecutor::new(&conn);
    let scope = engine.scope(&exec, &project);
    let orders = scope.resolve_collection("orders").unwrap();

    let key = LockKey::new(&project.id, &orders.id);
    let guard = acquire(lock.as_ref(), &exec, key.clone()).unwrap();
    assert!(lock.is_held(&key));

    let err = scope.rename_collection(&orders, "purchases").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert!(err.to_string().contains("Schema lock held"));
    assert_eq!(scope.resolve_collection("orders").unwrap().name, "orders");

    drop(guard);
    assert!(!lock.is_held(&key));
    let renamed = scope.rename_collection(&orders, "purchases").unwrap();
    assert_eq!(renamed.name, "purchases");

    let ops = tenantcore::catalog::list_schema_ops(&exec, &project.id, Some(&orders.id), 1).unwrap();
    assert_eq!(ops[0].payload["new_name"], json!("purchases"));
}
