//! Query performance benchmarks: filtered listing, counting and saved views.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rusqlite::Connection;
use serde_json::{json, Map};
use std::hint::black_box;
use std::time::Duration;
use tenantcore::backend::{open_in_memory, SqliteExecutor};
use tenantcore::views::{ViewFilter, ViewJoin};
use tenantcore::{
    Actor, Collection, Config, Engine, FieldSpec, FieldType, FilterOp, ListQuery, Project,
    RelationFieldSpec, TenantScope, ViewDefinition,
};

/// `customers` and `orders` with `size` orders spread over 50 customers
fn seed(scope: &TenantScope<'_>, size: u32) -> Collection {
    let customers = scope.create_collection("customers", None).expect("customers");
    scope
        .add_field(&customers, FieldSpec::new("name", FieldType::String))
        .expect("name");
    let orders = scope.create_collection("orders", None).expect("orders");
    scope
        .add_field(&orders, FieldSpec::new("price", FieldType::Float).indexed())
        .expect("price");
    scope
        .add_field(&orders, FieldSpec::new("status", FieldType::String))
        .expect("status");
    scope
        .add_relation_field(&orders, RelationFieldSpec::new("customer", "customers"))
        .expect("customer");

    let mut customer_ids = Vec::new();
    for i in 0..50 {
        let row = json!({ "name": format!("customer {i}") });
        let rec = scope
            .insert_record(&customers, row.as_object().expect("object"))
            .expect("insert customer");
        customer_ids.push(rec["id"].clone());
    }
    for i in 0..size {
        let status = if i % 3 == 0 { "paid" } else { "open" };
        let row = json!({
            "price": f64::from(i % 500),
            "status": status,
            "customer": customer_ids[(i % 50) as usize],
        });
        scope
            .insert_record(&orders, row.as_object().expect("object"))
            .expect("insert order");
    }
    orders
}

fn make_bench_db() -> (Connection, Engine) {
    let conn = open_in_memory().expect("database");
    let engine = Engine::new(Config::default());
    (conn, engine)
}

fn create_project(engine: &Engine, exec: &SqliteExecutor<'_>) -> Project {
    engine
        .create_project(exec, "bench", Actor::admin("bench"))
        .expect("project")
}

fn bench_filtered_list(c: &mut Criterion) {
    let mut group = c.benchmark_group("filtered_list");
    for size in [100u32, 1_000, 10_000] {
        let (conn, engine) = make_bench_db();
        let exec = SqliteExecutor::new(&conn);
        let project = create_project(&engine, &exec);
        let scope = engine.scope(&exec, &project);
        let orders = seed(&scope, size);

        let query = ListQuery::default()
            .filter("price__gte", 100)
            .filter("price__lte", 200)
            .filter("status", "open")
            .sort("-price")
            .limit(50);
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| black_box(scope.list_records(&orders, &query).expect("list")));
        });
    }
    group.finish();
}

fn bench_count(c: &mut Criterion) {
    let mut group = c.benchmark_group("count_records");
    for size in [1_000u32, 10_000] {
        let (conn, engine) = make_bench_db();
        let exec = SqliteExecutor::new(&conn);
        let project = create_project(&engine, &exec);
        let scope = engine.scope(&exec, &project);
        let orders = seed(&scope, size);

        let mut filters = Map::new();
        filters.insert("status__in".into(), json!(["open", "paid"]));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| black_box(scope.count_records(&orders, &filters).expect("count")));
        });
    }
    group.finish();
}

fn bench_view_with_join(c: &mut Criterion) {
    let mut group = c.benchmark_group("view_with_join");
    for size in [100u32, 1_000, 10_000] {
        let (conn, engine) = make_bench_db();
        let exec = SqliteExecutor::new(&conn);
        let project = create_project(&engine, &exec);
        let scope = engine.scope(&exec, &project);
        let orders = seed(&scope, size);

        let definition = ViewDefinition {
            projection: vec!["price".into(), "status".into()],
            filters: vec![ViewFilter {
                field: "status".into(),
                operator: FilterOp::Eq,
                value: None,
                is_param: true,
                param_name: None,
            }],
            joins: vec![ViewJoin {
                field: "customer".into(),
                columns: vec!["name".into()],
            }],
            ..ViewDefinition::default()
        };
        let view = scope
            .create_view(&orders, "orders_by_status", None, definition)
            .expect("view");
        let mut params = Map::new();
        params.insert("status".into(), json!("paid"));

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| black_box(scope.execute_view(&view, &params, Some(100), None).expect("view")));
        });
    }
    group.finish();
}

criterion_group! {
    name = benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(10))
        .sample_size(20);
    targets = bench_filtered_list, bench_count, bench_view_with_join
}
criterion_main!(benches);
