//! Policy evaluation, ownership conditions and project roles.

use serde_json::{json, Map, Value};
use tenantcore::authz::{Effect, PolicyUpdate, RoleUpdate};
use tenantcore::backend::{open_in_memory, SqliteExecutor};
use tenantcore::error::ErrorKind;
use tenantcore::{
    Actor, Collection, Condition, Config, Decision, Engine, FieldSpec, FieldType, PolicyAction,
    PolicySpec, Principal, PrincipalKind, TenantScope,
};

fn setup(f: impl FnOnce(&TenantScope<'_>)) {
    let conn = open_in_memory().unwrap();
    let exec = SqliteExecutor::new(&conn);
    let engine = Engine::new(Config::default());
    let project = engine
        .create_project(&exec, "acme", Actor::admin("owner"))
        .unwrap();
    let scope = engine.scope(&exec, &project).with_actor(Actor::admin("owner"));
    f(&scope);
}

fn record(v: Value) -> Map<String, Value> {
    v.as_object().unwrap().clone()
}

fn notes(scope: &TenantScope<'_>) -> Collection {
    let c = scope.create_collection("notes", None).unwrap();
    scope
        .add_field(&c, FieldSpec::new("body", FieldType::Text))
        .unwrap();
    c
}

#[test]
fn test_without_policies_only_admins_and_keys_pass() {
    setup(|scope| {
        let c = notes(scope);
        let allowed = |p: &Principal| {
            scope
                .evaluate(p, &c, PolicyAction::Read, None)
                .unwrap()
                .is_allowed()
        };
        assert!(allowed(&Principal::admin("u1")));
        assert!(allowed(&Principal::api_key("k1")));
        assert!(!allowed(&Principal::app_user("a1")));
        assert!(!allowed(&Principal::anonymous()));
    });
}

#[test]
fn test_admin_bypasses_deny_policies() {
    setup(|scope| {
        let c = notes(scope);
        scope
            .create_policy(
                &c,
                PolicySpec::new("nobody", PolicyAction::Delete, Effect::Deny).principals(&[
                    PrincipalKind::AdminUser,
                    PrincipalKind::AppUser,
                    PrincipalKind::ApiKey,
                ]),
            )
            .unwrap();
        let decision = scope
            .evaluate(&Principal::admin("u1"), &c, PolicyAction::Delete, None)
            .unwrap();
        assert_eq!(decision, Decision::Allow);
        let decision = scope
            .evaluate(&Principal::api_key("k1"), &c, PolicyAction::Delete, None)
            .unwrap();
        assert!(!decision.is_allowed());
    });
}

#[test]
fn test_policy_without_principals_covers_admins_and_keys() {
    setup(|scope| {
        let c = notes(scope);
        let spec = PolicySpec::from_json(json!({
            "name": "readers", "action": "read", "effect": "allow"
        }))
        .unwrap();
        let policy = scope.create_policy(&c, spec).unwrap();
        assert_eq!(
            policy.allowed_principals,
            vec![PrincipalKind::AdminUser, PrincipalKind::ApiKey]
        );

        let read = |p: &Principal| scope.evaluate(p, &c, PolicyAction::Read, None).unwrap();
        assert_eq!(read(&Principal::api_key("k1")), Decision::Allow);
        assert!(!read(&Principal::app_user("a1")).is_allowed());

        // An explicit empty list means the same
        let spec = PolicySpec::from_json(json!({
            "name": "keys_list", "action": "list", "effect": "allow", "allowed_principals": []
        }))
        .unwrap();
        let keys_list = scope.create_policy(&c, spec).unwrap();
        assert_eq!(scope.get_policy(&keys_list.id).unwrap().allowed_principals.len(), 2);
        let list = |p: &Principal| scope.evaluate(p, &c, PolicyAction::List, None).unwrap();
        assert!(list(&Principal::api_key("k1")).is_allowed());
        assert!(!list(&Principal::app_user("a1")).is_allowed());

        let updated = scope
            .update_policy(
                &keys_list.id,
                PolicyUpdate {
                    allowed_principals: Some(Vec::new()),
                    ..PolicyUpdate::default()
                },
            )
            .unwrap();
        assert_eq!(
            updated.allowed_principals,
            vec![PrincipalKind::AdminUser, PrincipalKind::ApiKey]
        );
    });
}

#[test]
fn test_owner_can_update_own_record_only() {
    let conn = open_in_memory().unwrap();
    let exec = SqliteExecutor::new(&conn);
    let engine = Engine::new(Config::default());
    let project = engine.create_project(&exec, "acme", Actor::default()).unwrap();

    let admin = engine.scope(&exec, &project).with_actor(Actor::admin("owner"));
    let c = notes(&admin);
    admin
        .create_policy(
            &c,
            PolicySpec::new("own_notes", PolicyAction::Update, Effect::Allow)
                .principals(&[PrincipalKind::AppUser])
                .condition(Condition::Owner {
                    field: "created_by_app_user_id".into(),
                }),
        )
        .unwrap();

    let as_alice = engine.scope(&exec, &project).with_actor(Actor::app_user("alice"));
    let note = as_alice
        .insert_record(&c, &record(json!({"body": "mine"})))
        .unwrap();
    assert_eq!(note["created_by_app_user_id"], json!("alice"));

    let alice = Principal::app_user("alice");
    let bob = Principal::app_user("bob");
    assert!(admin
        .evaluate(&alice, &c, PolicyAction::Update, Some(&note))
        .unwrap()
        .is_allowed());
    assert!(!admin
        .evaluate(&bob, &c, PolicyAction::Update, Some(&note))
        .unwrap()
        .is_allowed());
    // No record, no ownership
    assert!(!admin
        .evaluate(&alice, &c, PolicyAction::Update, None)
        .unwrap()
        .is_allowed());
    // No read policy exists
    assert!(!admin
        .evaluate(&alice, &c, PolicyAction::Read, Some(&note))
        .unwrap()
        .is_allowed());
}

#[test]
fn test_priority_orders_policies() {
    setup(|scope| {
        let c = notes(scope);
        scope
            .create_policy(
                &c,
                PolicySpec::new("everyone", PolicyAction::List, Effect::Allow)
                    .principals(&[PrincipalKind::AppUser]),
            )
            .unwrap();
        let blocked = scope
            .create_policy(
                &c,
                PolicySpec::new("no_unverified", PolicyAction::List, Effect::Deny)
                    .principals(&[PrincipalKind::AppUser])
                    .priority(10)
                    .condition(Condition::Not {
                        condition: Box::new(Condition::FieldEquals {
                            field: "verified".into(),
                            value: json!(true),
                        }),
                    }),
            )
            .unwrap();

        let policies = scope.list_policies(&c).unwrap();
        assert_eq!(policies[0].id, blocked.id);

        let user = Principal::app_user("a1");
        let decision = scope
            .evaluate(&user, &c, PolicyAction::List, Some(&record(json!({"verified": false}))))
            .unwrap();
        assert_eq!(decision, Decision::Deny("Denied by policy 'no_unverified'".into()));
        let decision = scope
            .evaluate(&user, &c, PolicyAction::List, Some(&record(json!({"verified": true}))))
            .unwrap();
        assert_eq!(decision, Decision::Allow);

        scope
            .update_policy(
                &blocked.id,
                PolicyUpdate {
                    is_active: Some(false),
                    ..PolicyUpdate::default()
                },
            )
            .unwrap();
        let decision = scope
            .evaluate(&user, &c, PolicyAction::List, Some(&record(json!({"verified": false}))))
            .unwrap();
        assert_eq!(decision, Decision::Allow);

        scope.delete_policy(&blocked.id).unwrap();
        assert_eq!(
            scope.get_policy(&blocked.id).unwrap_err().kind(),
            ErrorKind::NotFound
        );
    });
}

#[test]
fn test_policy_from_json() {
    setup(|scope| {
        let c = notes(scope);
        let spec = PolicySpec::from_json(json!({
            "name": "verified_writers",
            "action": "create",
            "effect": "allow",
            "allowed_principals": ["app_user"],
            "require_email_verified": true,
            "condition": {"type": "authenticated"}
        }))
        .unwrap();
        scope.create_policy(&c, spec).unwrap();

        let unverified = Principal::app_user("a1").with_email("a@b.io", false);
        let verified = Principal::app_user("a1").with_email("a@b.io", true);
        assert!(!scope
            .evaluate(&unverified, &c, PolicyAction::Create, None)
            .unwrap()
            .is_allowed());
        assert!(scope
            .evaluate(&verified, &c, PolicyAction::Create, None)
            .unwrap()
            .is_allowed());

        let err = PolicySpec::from_json(json!({
            "name": "x", "action": "explode", "effect": "allow"
        }))
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    });
}

#[test]
fn test_role_restricted_policy_loads_roles() {
    setup(|scope| {
        let c = notes(scope);
        scope
            .create_policy(
                &c,
                PolicySpec::new("editors_update", PolicyAction::Update, Effect::Allow)
                    .principals(&[PrincipalKind::AppUser])
                    .roles(["editor"]),
            )
            .unwrap();
        let editor = scope.create_role("editor", Some("Edits notes"), false).unwrap();

        let user = Principal::app_user("a1");
        assert!(!scope
            .evaluate(&user, &c, PolicyAction::Update, None)
            .unwrap()
            .is_allowed());

        scope.assign_role("a1", &editor).unwrap();
        assert!(scope
            .evaluate(&user, &c, PolicyAction::Update, None)
            .unwrap()
            .is_allowed());

        // Roles supplied by the caller take precedence over the catalog
        let claimed = Principal::app_user("a1").with_roles(["viewer"]);
        assert!(!scope
            .evaluate(&claimed, &c, PolicyAction::Update, None)
            .unwrap()
            .is_allowed());
    });
}

#[test]
fn test_role_assignment_lifecycle() {
    setup(|scope| {
        let member = scope.get_role_by_name("member").unwrap();
        assert!(member.is_default);
        assert!(member.is_system);

        let assigned = scope.assign_default_role_to_user("a1").unwrap().unwrap();
        assert_eq!(assigned.name, "member");
        // Second call keeps the single assignment
        scope.assign_default_role_to_user("a1").unwrap();
        assert_eq!(scope.get_user_roles("a1").unwrap(), vec!["member"]);

        let err = scope.assign_role("a1", &member).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let viewer = scope.get_role_by_name("viewer").unwrap();
        scope.assign_role("a1", &viewer).unwrap();
        assert!(scope.user_has_any_role("a1", &["admin", "viewer"]).unwrap());
        assert!(!scope.user_has_role("a1", "admin").unwrap());

        scope.remove_role("a1", &viewer).unwrap();
        let err = scope.remove_role("a1", &viewer).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    });
}

#[test]
fn test_custom_roles() {
    setup(|scope| {
        let admin = scope.get_role_by_name("admin").unwrap();
        let err = scope.delete_role(&admin).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = scope.create_role("member", None, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let tester = scope.create_role("tester", None, true).unwrap();
        assert!(!scope.get_role_by_name("member").unwrap().is_default);

        let renamed = scope
            .update_role(
                &tester,
                RoleUpdate {
                    name: Some("qa".into()),
                    ..RoleUpdate::default()
                },
            )
            .unwrap();
        assert_eq!(renamed.name, "qa");
        scope.assign_role("a1", &renamed).unwrap();
        scope.delete_role(&renamed).unwrap();
        assert!(scope.get_user_roles("a1").unwrap().is_empty());
    });
}
