//! Audit boundary.
//!
//! The core reports who did what; durable storage belongs to an external
//! collaborator behind [`AuditSink`]. Every mutating action that touches a
//! credentialed resource (connector created/removed, health checked, role
//! mutated) produces one event. Actions performed by the core itself rather
//! than on behalf of a request identity use the `"system"` user id — the
//! route layer records user-attributed events with the identity it holds.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

/// User id recorded for actions the core performs on its own behalf
pub const SYSTEM_USER: &str = "system";

/// One durable audit record.
#[derive(Clone, Debug, Serialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub user_id: String,
    pub action: String,
    pub resource: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        user_id: impl Into<String>,
        action: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            action: action.into(),
            resource: resource.into(),
            resource_id: None,
            details: None,
            ip_address: None,
            user_agent: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_resource_id(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_ip_address(mut self, ip_address: impl Into<String>) -> Self {
        self.ip_address = Some(ip_address.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}

/// Durable log of who did what. The core calls it; it never owns storage.
///
/// Implementations must not block the caller for long — recording happens on
/// the request path.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Default sink: one structured tracing event per audit record.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        info!(
            target: "portico::audit",
            event_id = %event.id,
            user_id = %event.user_id,
            action = %event.action,
            resource = %event.resource,
            resource_id = ?event.resource_id,
            "Audit event"
        );
    }
}
