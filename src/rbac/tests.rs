use super::*;
use serde_json::json;
use std::sync::Mutex;

/// Test sink capturing every event.
#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl AuditSink for RecordingSink {
    fn record(&self, event: AuditEvent) {
        self.events.lock().unwrap().push(event);
    }
}

fn engine() -> (PermissionEngine, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let engine = PermissionEngine::new(Arc::clone(&sink) as Arc<dyn AuditSink>);
    (engine, sink)
}

fn context(pairs: &[(&str, Value)]) -> Context {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[test]
fn test_wildcard_grants_everything() {
    let perms = vec![Permission::any()];

    assert!(check_permission(&perms, "widget", "update", None, None));
    assert!(check_permission(&perms, "data_source", "delete", Some("ds-1"), None));
    assert!(check_permission(&perms, "anything", "whatever", None, None));
}

#[test]
fn test_exact_resource_and_action() {
    let perms = vec![Permission::new("widget", "read")];

    assert!(check_permission(&perms, "widget", "read", None, None));
    assert!(!check_permission(&perms, "widget", "update", None, None));
    assert!(!check_permission(&perms, "dashboard", "read", None, None));
}

#[test]
fn test_wildcard_action_only() {
    let perms = vec![Permission::new("widget", WILDCARD)];

    assert!(check_permission(&perms, "widget", "read", None, None));
    assert!(check_permission(&perms, "widget", "delete", None, None));
    assert!(!check_permission(&perms, "dashboard", "read", None, None));
}

#[test]
fn test_resource_id_scoping() {
    let perms = vec![Permission::new("widget", "update").scoped_to("W1")];

    assert!(check_permission(&perms, "widget", "update", Some("W1"), None));
    assert!(!check_permission(&perms, "widget", "update", Some("W2"), None));
    // Either side unset: the scope check does not bind
    assert!(check_permission(&perms, "widget", "update", None, None));
}

#[test]
fn test_unscoped_permission_covers_any_id() {
    let perms = vec![Permission::new("widget", "update")];
    assert!(check_permission(&perms, "widget", "update", Some("W2"), None));
}

#[test]
fn test_any_permission_suffices() {
    // OR across permissions: one denial does not mask another grant
    let perms = vec![
        Permission::new("widget", "read"),
        Permission::new("widget", "update").scoped_to("W1"),
    ];

    assert!(check_permission(&perms, "widget", "update", Some("W1"), None));
    assert!(!check_permission(&perms, "widget", "update", Some("W2"), None));
}

#[test]
fn test_condition_eq_requires_matching_context() {
    let perms = vec![Permission::new("widget", "update").when(
        "ownerId",
        ConditionOperator::Eq,
        json!("U1"),
    )];

    let owned = context(&[("ownerId", json!("U1"))]);
    let foreign = context(&[("ownerId", json!("U2"))]);

    assert!(check_permission(&perms, "widget", "update", None, Some(&owned)));
    assert!(!check_permission(&perms, "widget", "update", None, Some(&foreign)));
    // Conditions with no context never match
    assert!(!check_permission(&perms, "widget", "update", None, None));
}

#[test]
fn test_all_conditions_must_hold() {
    let perms = vec![Permission::new("report", "read")
        .when("ownerId", ConditionOperator::Eq, json!("U1"))
        .when("size", ConditionOperator::Lt, json!(100))];

    let good = context(&[("ownerId", json!("U1")), ("size", json!(50))]);
    let bad = context(&[("ownerId", json!("U1")), ("size", json!(500))]);

    assert!(check_permission(&perms, "report", "read", None, Some(&good)));
    assert!(!check_permission(&perms, "report", "read", None, Some(&bad)));
}

#[test]
fn test_condition_operators() {
    let ctx = context(&[
        ("name", json!("staging-eu")),
        ("count", json!(5)),
        ("region", json!("eu")),
    ]);

    let eval = |field: &str, op: ConditionOperator, value: Value| {
        evaluate_condition(
            &PermissionCondition {
                field: field.to_string(),
                operator: op,
                value,
            },
            &ctx,
        )
    };

    assert!(eval("count", ConditionOperator::Eq, json!(5)));
    assert!(eval("count", ConditionOperator::Neq, json!(7)));
    assert!(eval("region", ConditionOperator::In, json!(["eu", "us"])));
    assert!(!eval("region", ConditionOperator::In, json!(["us"])));
    assert!(eval("region", ConditionOperator::NotIn, json!(["us"])));
    assert!(eval("name", ConditionOperator::Contains, json!("staging")));
    assert!(!eval("name", ConditionOperator::Contains, json!("prod")));
    assert!(eval("count", ConditionOperator::Gt, json!(4)));
    assert!(eval("count", ConditionOperator::Gte, json!(5)));
    assert!(eval("count", ConditionOperator::Lt, json!(6)));
    assert!(eval("count", ConditionOperator::Lte, json!(5)));
}

#[test]
fn test_condition_type_mismatch_is_false_not_panic() {
    let ctx = context(&[("count", json!("not-a-number")), ("flag", json!(true))]);

    let eval = |field: &str, op: ConditionOperator, value: Value| {
        evaluate_condition(
            &PermissionCondition {
                field: field.to_string(),
                operator: op,
                value,
            },
            &ctx,
        )
    };

    // Numeric comparisons on non-numbers: false, not an error
    assert!(!eval("count", ConditionOperator::Gt, json!(1)));
    assert!(!eval("count", ConditionOperator::Lte, json!(1)));
    // contains on non-strings: false
    assert!(!eval("flag", ConditionOperator::Contains, json!("tr")));
    assert!(!eval("count", ConditionOperator::Contains, json!(1)));
    // in/notIn against a non-array expected value: false
    assert!(!eval("flag", ConditionOperator::In, json!(true)));
    // Missing field compares as null
    assert!(eval("missing", ConditionOperator::Neq, json!("x")));
    assert!(!eval("missing", ConditionOperator::Eq, json!("x")));
}

#[test]
fn test_create_role_is_idempotent() {
    let (engine, sink) = engine();

    let first = engine.create_role("editor", vec![Permission::new("widget", "update")]);
    let second = engine.create_role("editor", vec![Permission::new("widget", "delete")]);

    // Same name: no duplicate, original permissions kept
    assert_eq!(first.id, second.id);
    assert_eq!(second.permissions.len(), 1);
    assert_eq!(second.permissions[0].action, "update");

    let creates = sink
        .events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.action == "role.create")
        .count();
    assert_eq!(creates, 1);
}

#[test]
fn test_assign_role_is_idempotent() {
    let (engine, _) = engine();
    engine.create_role("viewer", vec![Permission::new("widget", "read")]);

    assert!(engine.assign_role("u1", "viewer"));
    assert!(engine.assign_role("u1", "viewer"));

    assert_eq!(engine.roles_of("u1").len(), 1);
}

#[test]
fn test_assign_unknown_role_fails() {
    let (engine, _) = engine();
    assert!(!engine.assign_role("u1", "ghost"));
    assert!(engine.roles_of("u1").is_empty());
}

#[test]
fn test_remove_role() {
    let (engine, _) = engine();
    engine.create_role("viewer", vec![Permission::new("widget", "read")]);
    engine.assign_role("u1", "viewer");

    assert!(engine.remove_role("u1", "viewer"));
    assert!(!engine.remove_role("u1", "viewer"));
    assert!(engine.roles_of("u1").is_empty());
}

#[test]
fn test_user_permissions_dedup_by_id() {
    let (engine, _) = engine();

    let shared = Permission::new("widget", "read");
    engine.create_role("viewer", vec![shared.clone()]);
    engine.create_role("editor", vec![shared.clone(), Permission::new("widget", "update")]);
    engine.assign_role("u1", "viewer");
    engine.assign_role("u1", "editor");

    let perms = engine.user_permissions("u1");
    assert_eq!(perms.len(), 2);
    assert_eq!(perms.iter().filter(|p| p.id == shared.id).count(), 1);
}

#[test]
fn test_add_permission_to_role_is_idempotent() {
    let (engine, _) = engine();
    engine.create_role("editor", vec![]);

    let permission = Permission::new("widget", "update");
    assert!(engine.add_permission_to_role("editor", permission.clone()));
    assert!(engine.add_permission_to_role("editor", permission.clone()));
    assert!(!engine.add_permission_to_role("ghost", permission));

    engine.assign_role("u1", "editor");
    assert_eq!(engine.user_permissions("u1").len(), 1);
}

#[test]
fn test_system_role_cannot_be_deleted() {
    let sink = Arc::new(RecordingSink::default());
    let engine = PermissionEngine::with_system_roles(sink as Arc<dyn AuditSink>);

    assert!(!engine.delete_role("admin"));

    engine.assign_role("root", "admin");
    assert!(engine.check("root", "anything", "delete", Some("X"), None));
}

#[test]
fn test_delete_role_unassigns_users() {
    let (engine, _) = engine();
    engine.create_role("viewer", vec![Permission::new("widget", "read")]);
    engine.assign_role("u1", "viewer");

    assert!(engine.delete_role("viewer"));
    assert!(engine.roles_of("u1").is_empty());
    assert!(!engine.check("u1", "widget", "read", None, None));
}

#[test]
fn test_check_denies_without_roles() {
    let (engine, _) = engine();
    assert!(!engine.check("nobody", "widget", "read", None, None));
}

#[test]
fn test_check_with_conditions_end_to_end() {
    let (engine, _) = engine();
    engine.create_role(
        "owner-editor",
        vec![Permission::new("widget", "update").when(
            "ownerId",
            ConditionOperator::Eq,
            json!("u1"),
        )],
    );
    engine.assign_role("u1", "owner-editor");

    let own = context(&[("ownerId", json!("u1"))]);
    let other = context(&[("ownerId", json!("u2"))]);

    assert!(engine.check("u1", "widget", "update", Some("W1"), Some(&own)));
    assert!(!engine.check("u1", "widget", "update", Some("W1"), Some(&other)));
}
