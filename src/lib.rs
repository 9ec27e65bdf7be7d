// Audit boundary (the core reports, external sinks store)
pub mod audit;

// Outbound auth-header strategies
pub mod auth;

// Generic TTL/tag cache with optional SQLite mirror
pub mod cache;

// Configuration surface (env + TOML)
pub mod config;

// Connector trait, REST implementation, and manager
pub mod connector;

// Role-based permission engine
pub mod rbac;

// Encrypted credential vault
pub mod vault;

pub use audit::{AuditEvent, AuditSink, TracingAuditSink};
pub use auth::AuthConfig;
pub use cache::{CacheOptions, CacheStats, GenericCache};
pub use config::CoreConfig;
pub use connector::{
    ConnectionResult, Connector, ConnectorManager, DataSourceRecord, DataSourceType, FetchError,
    FetchOptions, HealthStatus, ManagerError,
};
pub use rbac::{
    check_permission, ConditionOperator, Permission, PermissionCondition, PermissionEngine, Role,
};
pub use vault::{CredentialVault, VaultError};
