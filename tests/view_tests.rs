//! Saved views: definition checks, parameters, joins, limits and versions.

use serde_json::{json, Map, Value};
use tenantcore::backend::{open_in_memory, SqliteExecutor};
use tenantcore::error::ErrorKind;
use tenantcore::views::{ParamSpec, ParamType, ViewFilter, ViewJoin, ViewSort, ViewUpdate};
use tenantcore::{
    Actor, Collection, Config, Engine, FieldSpec, FieldType, FilterOp, RelationFieldSpec,
    TenantScope, ViewDefinition,
};

fn setup(config: Config, f: impl FnOnce(&TenantScope<'_>)) {
    let conn = open_in_memory().unwrap();
    let exec = SqliteExecutor::new(&conn);
    let engine = Engine::new(config);
    let project = engine
        .create_project(&exec, "acme", Actor::admin("owner"))
        .unwrap();
    let scope = engine.scope(&exec, &project).with_actor(Actor::admin("owner"));
    f(&scope);
}

fn record(v: Value) -> Map<String, Value> {
    v.as_object().unwrap().clone()
}

fn params(v: Value) -> Map<String, Value> {
    record(v)
}

/// customers(name, city) and orders(total, status, customer → customers)
fn shop(scope: &TenantScope<'_>) -> (Collection, Collection) {
    let customers = scope.create_collection("customers", None).unwrap();
    scope
        .add_field(&customers, FieldSpec::new("name", FieldType::String))
        .unwrap();
    scope
        .add_field(&customers, FieldSpec::new("city", FieldType::String))
        .unwrap();
    let orders = scope.create_collection("orders", None).unwrap();
    scope
        .add_field(&orders, FieldSpec::new("total", FieldType::Float))
        .unwrap();
    scope
        .add_field(&orders, FieldSpec::new("status", FieldType::String))
        .unwrap();
    scope
        .add_relation_field(&orders, RelationFieldSpec::new("customer", "customers"))
        .unwrap();

    let ann = scope
        .insert_record(&customers, &record(json!({"name": "ann", "city": "Oslo"})))
        .unwrap();
    let ann_id = ann["id"].clone();
    for (i, status) in ["open", "paid", "open", "paid", "open"].iter().enumerate() {
        scope
            .insert_record(
                &orders,
                &record(json!({ "total": (i + 1) * 10, "status": status, "customer": ann_id })),
            )
            .unwrap();
    }
    (customers, orders)
}

fn filter(field: &str, operator: FilterOp, value: Value) -> ViewFilter {
    ViewFilter {
        field: field.to_string(),
        operator,
        value: Some(value),
        is_param: false,
        param_name: None,
    }
}

fn param_filter(field: &str, operator: FilterOp) -> ViewFilter {
    ViewFilter {
        field: field.to_string(),
        operator,
        value: None,
        is_param: true,
        param_name: None,
    }
}

fn sort(field: &str, desc: bool) -> ViewSort {
    ViewSort {
        field: field.to_string(),
        desc,
        is_param: false,
        param_name: None,
        desc_is_param: false,
        desc_param_name: None,
    }
}

#[test]
fn test_static_view() {
    setup(Config::default(), |scope| {
        let (_, orders) = shop(scope);
        let definition = ViewDefinition {
            projection: vec!["total".into()],
            filters: vec![filter("status", FilterOp::Eq, json!("open"))],
            sorts: vec![sort("total", true)],
            ..ViewDefinition::default()
        };
        let view = scope
            .create_view(&orders, "open_orders", Some("Open orders"), definition)
            .unwrap();
        assert_eq!(view.version, 1);

        let result = scope.execute_view(&view, &Map::new(), None, None).unwrap();
        assert_eq!(result.total, 3);
        assert_eq!(result.view_name, "open_orders");
        let totals: Vec<f64> = result.data.iter().map(|r| r["total"].as_f64().unwrap()).collect();
        assert_eq!(totals, vec![50.0, 30.0, 10.0]);
        assert!(result.data[0].get("status").is_none());
        assert!(result.data[0].get("id").is_some());
    });
}

#[test]
fn test_parameterized_filter() {
    setup(Config::default(), |scope| {
        let (_, orders) = shop(scope);
        let mut definition = ViewDefinition {
            filters: vec![param_filter("status", FilterOp::Eq)],
            ..ViewDefinition::default()
        };
        definition.params_schema.insert(
            "status".into(),
            ParamSpec {
                param_type: ParamType::String,
                required: true,
                ..ParamSpec::default()
            },
        );
        let view = scope.create_view(&orders, "by_status", None, definition).unwrap();

        let paid = scope
            .execute_view(&view, &params(json!({"status": "paid"})), None, None)
            .unwrap();
        assert_eq!(paid.total, 2);

        let err = scope.execute_view(&view, &Map::new(), None, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("Missing required parameter: status"));
    });
}

#[test]
fn test_optional_param_uses_default_or_is_skipped() {
    setup(Config::default(), |scope| {
        let (_, orders) = shop(scope);
        let mut definition = ViewDefinition {
            filters: vec![param_filter("total", FilterOp::Gte)],
            ..ViewDefinition::default()
        };
        definition.params_schema.insert(
            "total".into(),
            ParamSpec {
                param_type: ParamType::Float,
                ..ParamSpec::default()
            },
        );
        let view = scope.create_view(&orders, "big_orders", None, definition).unwrap();

        let all = scope.execute_view(&view, &Map::new(), None, None).unwrap();
        assert_eq!(all.total, 5);
        let big = scope
            .execute_view(&view, &params(json!({"total": "35"})), None, None)
            .unwrap();
        assert_eq!(big.total, 2);

        let err = scope
            .execute_view(&view, &params(json!({"total": "lots"})), None, None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    });
}

#[test]
fn test_join_columns_are_prefixed() {
    setup(Config::default(), |scope| {
        let (_, orders) = shop(scope);
        let definition = ViewDefinition {
            projection: vec!["total".into()],
            joins: vec![ViewJoin {
                field: "customer".into(),
                columns: vec!["name".into(), "city".into()],
            }],
            ..ViewDefinition::default()
        };
        let view = scope.create_view(&orders, "with_customer", None, definition).unwrap();
        let result = scope.execute_view(&view, &Map::new(), Some(1), None).unwrap();
        assert_eq!(result.total, 5);
        assert_eq!(result.data.len(), 1);
        assert_eq!(result.data[0]["customer__name"], json!("ann"));
        assert_eq!(result.data[0]["customer__city"], json!("Oslo"));
    });
}

#[test]
fn test_join_must_use_relation_and_known_columns() {
    setup(Config::default(), |scope| {
        let (_, orders) = shop(scope);
        let not_relation = ViewDefinition {
            joins: vec![ViewJoin {
                field: "status".into(),
                columns: vec![],
            }],
            ..ViewDefinition::default()
        };
        let err = scope.create_view(&orders, "bad", None, not_relation).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let unknown_column = ViewDefinition {
            joins: vec![ViewJoin {
                field: "customer".into(),
                columns: vec!["phone".into()],
            }],
            ..ViewDefinition::default()
        };
        let err = scope.create_view(&orders, "bad", None, unknown_column).unwrap_err();
        assert!(err.to_string().contains("phone"));
    });
}

#[test]
fn test_filter_and_join_caps() {
    let mut config = Config::default();
    config.limits.view_max_filters = 2;
    setup(config, |scope| {
        let (_, orders) = shop(scope);
        let definition = ViewDefinition {
            filters: vec![
                filter("status", FilterOp::Eq, json!("open")),
                filter("total", FilterOp::Gt, json!(1)),
                filter("total", FilterOp::Lt, json!(100)),
            ],
            ..ViewDefinition::default()
        };
        let err = scope.create_view(&orders, "too_many", None, definition).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let join = ViewJoin {
            field: "customer".into(),
            columns: vec![],
        };
        let definition = ViewDefinition {
            joins: vec![join.clone(), join],
            ..ViewDefinition::default()
        };
        let err = scope.create_view(&orders, "two_joins", None, definition).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    });
}

#[test]
fn test_limit_never_exceeds_caps() {
    let mut config = Config::default();
    config.limits.view_max_rows = 3;
    setup(config, |scope| {
        let (_, orders) = shop(scope);
        let definition = ViewDefinition {
            max_limit: Some(500),
            default_limit: Some(400),
            ..ViewDefinition::default()
        };
        let view = scope.create_view(&orders, "capped", None, definition).unwrap();
        assert_eq!(view.max_limit, 3);
        assert_eq!(view.default_limit, 3);

        for requested in [None, Some(0), Some(1), Some(3), Some(10_000)] {
            let result = scope.execute_view(&view, &Map::new(), requested, None).unwrap();
            assert!(result.limit <= 3, "{requested:?}");
            assert!(result.data.len() <= 3);
            assert_eq!(result.total, 5);
        }
    });
}

#[test]
fn test_limit_param_overrides_call() {
    setup(Config::default(), |scope| {
        let (_, orders) = shop(scope);
        let mut definition = ViewDefinition::default();
        definition.params_schema.insert(
            "page_size".into(),
            ParamSpec {
                param_type: ParamType::Limit,
                ..ParamSpec::default()
            },
        );
        let view = scope.create_view(&orders, "paged", None, definition).unwrap();
        let result = scope
            .execute_view(&view, &params(json!({"page_size": "2"})), Some(4), Some(1))
            .unwrap();
        assert_eq!(result.limit, 2);
        assert_eq!(result.offset, 1);
        assert_eq!(result.data.len(), 2);
    });
}

#[test]
fn test_param_sort_must_be_projected() {
    setup(Config::default(), |scope| {
        let (_, orders) = shop(scope);
        let definition = ViewDefinition {
            projection: vec!["total".into()],
            sorts: vec![ViewSort {
                field: "total".into(),
                desc: false,
                is_param: true,
                param_name: Some("order".into()),
                desc_is_param: false,
                desc_param_name: None,
            }],
            ..ViewDefinition::default()
        };
        let view = scope.create_view(&orders, "sorted", None, definition).unwrap();

        let result = scope
            .execute_view(&view, &params(json!({"order": "-total"})), None, None)
            .unwrap();
        assert_eq!(result.data[0]["total"], json!(50.0));

        // Not projected: ignored, default order applies
        let result = scope
            .execute_view(&view, &params(json!({"order": "status"})), None, None)
            .unwrap();
        assert_eq!(result.total, 5);
    });
}

#[test]
fn test_param_sort_falls_back_to_stored_field() {
    setup(Config::default(), |scope| {
        let (_, orders) = shop(scope);
        let definition = ViewDefinition {
            projection: vec!["total".into(), "status".into()],
            sorts: vec![ViewSort {
                field: "total".into(),
                desc: false,
                is_param: true,
                param_name: None,
                desc_is_param: true,
                desc_param_name: None,
            }],
            ..ViewDefinition::default()
        };
        let view = scope.create_view(&orders, "by_total", None, definition).unwrap();
        let totals = |p: Value| -> Vec<f64> {
            scope
                .execute_view(&view, &params(p), None, None)
                .unwrap()
                .data
                .iter()
                .map(|r| r["total"].as_f64().unwrap())
                .collect()
        };

        // No params: stored field, ascending, not id order
        assert_eq!(totals(json!({})), vec![10.0, 20.0, 30.0, 40.0, 50.0]);
        assert_eq!(totals(json!({"sort_desc": "desc"}))[0], 50.0);
        assert_eq!(totals(json!({"sort_field": "-total"}))[0], 50.0);
    });
}

#[test]
fn test_versions_and_soft_delete() {
    setup(Config::default(), |scope| {
        let (_, orders) = shop(scope);
        let view = scope
            .create_view(&orders, "recent", None, ViewDefinition::default())
            .unwrap();
        let err = scope
            .create_view(&orders, "recent", None, ViewDefinition::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let updated = scope
            .update_view(
                &view,
                ViewUpdate {
                    description: Some("Most recent".into()),
                    definition: Some(ViewDefinition {
                        sorts: vec![sort("total", true)],
                        ..ViewDefinition::default()
                    }),
                },
            )
            .unwrap();
        assert_eq!(updated.version, 2);

        // A stale copy cannot overwrite the newer version
        let err = scope.update_view(&view, ViewUpdate::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let versions = scope.get_view_versions(&updated).unwrap();
        assert_eq!(versions.iter().map(|v| v.version).collect::<Vec<_>>(), vec![2, 1]);
        let first = scope.get_view_version(&updated, 1).unwrap();
        assert!(first.definition.sorts.is_empty());

        assert_eq!(scope.list_views(Some(&orders)).unwrap().len(), 1);
        scope.delete_view(&updated).unwrap();
        assert_eq!(
            scope.get_view("recent").unwrap_err().kind(),
            ErrorKind::NotFound
        );
    });
}
