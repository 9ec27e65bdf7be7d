//! Role-based permission engine.
//!
//! Evaluation is stateless: [`check_permission`] is a pure function over the
//! permission set the caller supplies (sourced from persistence). The engine
//! additionally holds an in-memory role registry so role mutations stay
//! idempotent without the caller re-implementing the bookkeeping.
//!
//! A denied check must short-circuit the caller before any decrypt or
//! network work — the engine only answers allowed/denied; translating that
//! into a user-visible status is the route layer's job.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditSink, SYSTEM_USER};

#[cfg(test)]
mod tests;

/// Matches any resource or action.
pub const WILDCARD: &str = "*";

/// Caller-supplied evaluation context for conditional permissions.
pub type Context = serde_json::Map<String, Value>;

/// Comparison operator of one [`PermissionCondition`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConditionOperator {
    Eq,
    Neq,
    In,
    NotIn,
    Contains,
    Gt,
    Gte,
    Lt,
    Lte,
}

/// A field-level predicate evaluated against the caller-supplied context.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PermissionCondition {
    pub field: String,
    pub operator: ConditionOperator,
    pub value: Value,
}

/// A single resource/action rule, optionally scoped to one resource id and
/// guarded by conditions. Immutable once checked within one evaluation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Permission {
    pub id: String,
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    pub action: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<PermissionCondition>,
}

impl Permission {
    pub fn new(resource: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            resource: resource.into(),
            resource_id: None,
            action: action.into(),
            conditions: Vec::new(),
        }
    }

    /// Grants every (resource, action) pair.
    pub fn any() -> Self {
        Self::new(WILDCARD, WILDCARD)
    }

    pub fn scoped_to(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn when(
        mut self,
        field: impl Into<String>,
        operator: ConditionOperator,
        value: Value,
    ) -> Self {
        self.conditions.push(PermissionCondition {
            field: field.into(),
            operator,
            value,
        });
        self
    }
}

/// A named bundle of permissions assignable to users.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Role {
    pub id: String,
    pub name: String,
    pub is_system: bool,
    pub permissions: Vec<Permission>,
}

/// True iff any held permission grants `action` on `resource` (OR across
/// permissions, AND within one permission's own checks).
///
/// A permission matches when its resource and action each equal the request
/// or the wildcard, its resource-id scope is compatible (either side unset,
/// or equal), and its conditions — if any — all hold against a supplied
/// context. Conditions with no context never match.
pub fn check_permission(
    permissions: &[Permission],
    resource: &str,
    action: &str,
    resource_id: Option<&str>,
    context: Option<&Context>,
) -> bool {
    permissions
        .iter()
        .any(|p| permission_matches(p, resource, action, resource_id, context))
}

fn permission_matches(
    permission: &Permission,
    resource: &str,
    action: &str,
    resource_id: Option<&str>,
    context: Option<&Context>,
) -> bool {
    if permission.resource != resource && permission.resource != WILDCARD {
        return false;
    }
    if permission.action != action && permission.action != WILDCARD {
        return false;
    }

    // Id scoping binds only when both sides carry an id
    if let (Some(scope), Some(requested)) = (permission.resource_id.as_deref(), resource_id) {
        if scope != requested {
            return false;
        }
    }

    if permission.conditions.is_empty() {
        return true;
    }
    match context {
        Some(ctx) => permission
            .conditions
            .iter()
            .all(|c| evaluate_condition(c, ctx)),
        None => false,
    }
}

/// Evaluates one condition. Type mismatches return false, never panic:
/// numeric operators require numbers on both sides, `contains` requires
/// strings on both sides.
fn evaluate_condition(condition: &PermissionCondition, context: &Context) -> bool {
    let actual = context.get(&condition.field).unwrap_or(&Value::Null);
    let expected = &condition.value;

    match condition.operator {
        ConditionOperator::Eq => actual == expected,
        ConditionOperator::Neq => actual != expected,
        ConditionOperator::In => expected
            .as_array()
            .map_or(false, |values| values.contains(actual)),
        ConditionOperator::NotIn => expected
            .as_array()
            .map_or(false, |values| !values.contains(actual)),
        ConditionOperator::Contains => match (actual.as_str(), expected.as_str()) {
            (Some(haystack), Some(needle)) => haystack.contains(needle),
            _ => false,
        },
        ConditionOperator::Gt
        | ConditionOperator::Gte
        | ConditionOperator::Lt
        | ConditionOperator::Lte => match (actual.as_f64(), expected.as_f64()) {
            (Some(a), Some(e)) => match condition.operator {
                ConditionOperator::Gt => a > e,
                ConditionOperator::Gte => a >= e,
                ConditionOperator::Lt => a < e,
                ConditionOperator::Lte => a <= e,
                _ => unreachable!(),
            },
            _ => false,
        },
    }
}

/// Role registry + evaluation entry point.
///
/// An explicitly constructed service object passed to the route layer —
/// never ambient global state. All mutations are idempotent and audited.
pub struct PermissionEngine {
    /// Roles keyed by name (names are unique)
    roles: DashMap<String, Role>,
    /// Role names held per user id
    user_roles: DashMap<String, Vec<String>>,
    audit: Arc<dyn AuditSink>,
}

impl PermissionEngine {
    pub fn new(audit: Arc<dyn AuditSink>) -> Self {
        Self {
            roles: DashMap::new(),
            user_roles: DashMap::new(),
            audit,
        }
    }

    /// Creates an engine pre-seeded with the built-in `admin` system role
    /// (full wildcard grant). System roles cannot be deleted.
    pub fn with_system_roles(audit: Arc<dyn AuditSink>) -> Self {
        let engine = Self::new(audit);
        engine.roles.insert(
            "admin".to_string(),
            Role {
                id: Uuid::new_v4().to_string(),
                name: "admin".to_string(),
                is_system: true,
                permissions: vec![Permission::any()],
            },
        );
        engine
    }

    /// Creates a role. Idempotent: a name that already exists returns the
    /// existing role unchanged rather than creating a duplicate.
    pub fn create_role(&self, name: &str, permissions: Vec<Permission>) -> Role {
        if let Some(existing) = self.roles.get(name) {
            return existing.clone();
        }

        let role = Role {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            is_system: false,
            permissions,
        };
        // entry() re-checks under the shard lock in case of a concurrent create
        let role = self
            .roles
            .entry(name.to_string())
            .or_insert(role)
            .clone();

        self.audit.record(
            AuditEvent::new(SYSTEM_USER, "role.create", "role").with_resource_id(&role.name),
        );
        role
    }

    /// Deletes a non-system role and unassigns it everywhere. Returns false
    /// for unknown or system roles.
    pub fn delete_role(&self, name: &str) -> bool {
        let is_system = match self.roles.get(name) {
            Some(role) => role.is_system,
            None => return false,
        };
        if is_system {
            debug!(role = %name, "Refusing to delete system role");
            return false;
        }

        if self.roles.remove(name).is_none() {
            return false;
        }
        for mut held in self.user_roles.iter_mut() {
            held.retain(|r| r != name);
        }

        self.audit
            .record(AuditEvent::new(SYSTEM_USER, "role.delete", "role").with_resource_id(name));
        true
    }

    /// Assigns a role to a user. Idempotent: re-assigning a held role is a
    /// no-op. Returns false for unknown roles.
    pub fn assign_role(&self, user_id: &str, role_name: &str) -> bool {
        if !self.roles.contains_key(role_name) {
            return false;
        }

        let mut held = self.user_roles.entry(user_id.to_string()).or_default();
        if held.iter().any(|r| r == role_name) {
            return true;
        }
        held.push(role_name.to_string());
        drop(held);

        self.audit.record(
            AuditEvent::new(SYSTEM_USER, "role.assign", "user")
                .with_resource_id(user_id)
                .with_details(serde_json::json!({ "role": role_name })),
        );
        true
    }

    /// Removes a role from a user. Returns whether it was held.
    pub fn remove_role(&self, user_id: &str, role_name: &str) -> bool {
        let removed = match self.user_roles.get_mut(user_id) {
            Some(mut held) => {
                let before = held.len();
                held.retain(|r| r != role_name);
                held.len() != before
            }
            None => false,
        };

        if removed {
            self.audit.record(
                AuditEvent::new(SYSTEM_USER, "role.unassign", "user")
                    .with_resource_id(user_id)
                    .with_details(serde_json::json!({ "role": role_name })),
            );
        }
        removed
    }

    /// Adds a permission to a role. Idempotent by permission id. Returns
    /// false for unknown roles.
    pub fn add_permission_to_role(&self, role_name: &str, permission: Permission) -> bool {
        let Some(mut role) = self.roles.get_mut(role_name) else {
            return false;
        };
        if role.permissions.iter().any(|p| p.id == permission.id) {
            return true;
        }
        role.permissions.push(permission);
        drop(role);

        self.audit.record(
            AuditEvent::new(SYSTEM_USER, "role.add_permission", "role")
                .with_resource_id(role_name),
        );
        true
    }

    /// All roles currently held by a user.
    pub fn roles_of(&self, user_id: &str) -> Vec<Role> {
        let Some(held) = self.user_roles.get(user_id) else {
            return Vec::new();
        };
        held.iter()
            .filter_map(|name| self.roles.get(name).map(|r| r.clone()))
            .collect()
    }

    /// Union of all permissions across a user's roles, deduplicated by
    /// permission id. Order is not significant.
    pub fn user_permissions(&self, user_id: &str) -> Vec<Permission> {
        let mut seen = std::collections::HashSet::new();
        let mut permissions = Vec::new();
        for role in self.roles_of(user_id) {
            for permission in role.permissions {
                if seen.insert(permission.id.clone()) {
                    permissions.push(permission);
                }
            }
        }
        permissions
    }

    /// Convenience: evaluates a request against everything the user holds.
    pub fn check(
        &self,
        user_id: &str,
        resource: &str,
        action: &str,
        resource_id: Option<&str>,
        context: Option<&Context>,
    ) -> bool {
        check_permission(
            &self.user_permissions(user_id),
            resource,
            action,
            resource_id,
            context,
        )
    }

    /// Full-state wipe for tests/maintenance tooling.
    pub fn reset(&self) {
        self.roles.clear();
        self.user_roles.clear();
    }
}
