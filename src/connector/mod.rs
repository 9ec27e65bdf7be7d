//! Connectors — authenticated network I/O against external data sources.
//!
//! A [`Connector`] performs requests against one data source using the auth
//! scheme from its [`AuthConfig`](crate::auth::AuthConfig). Implementations
//! are registered per data-source type in the
//! [`ConnectorManager`](manager::ConnectorManager)'s factory map, so adding a
//! new kind (GraphQL, databases) means registering a factory, not editing a
//! dispatch switch.
//!
//! Ordinary network failure is data, not an error: `test_connection` returns
//! a [`ConnectionResult`] with `is_connected = false` rather than an `Err`.
//! Only contract violations (unsupported type, bad configuration) error.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

use crate::auth::AuthConfig;

pub mod manager;
pub mod rest;

pub use manager::{ConnectorManager, ManagerError};
pub use rest::RestConnector;

/// Supported data-source kinds. Only `rest` has a connector today; the
/// remaining kinds are carried by stored records and rejected at
/// construction until their connectors exist.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSourceType {
    Rest,
    Graphql,
    Postgres,
    Mysql,
    Sqlite,
    Mongodb,
}

impl std::fmt::Display for DataSourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DataSourceType::Rest => "rest",
            DataSourceType::Graphql => "graphql",
            DataSourceType::Postgres => "postgres",
            DataSourceType::Mysql => "mysql",
            DataSourceType::Sqlite => "sqlite",
            DataSourceType::Mongodb => "mongodb",
        };
        write!(f, "{}", s)
    }
}

/// Result of the most recent connectivity probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

impl Default for HealthStatus {
    fn default() -> Self {
        HealthStatus::Unknown
    }
}

/// A stored data-source definition, received by value from persistence.
/// The core reads and annotates it; it never persists it directly.
///
/// `auth` holds encrypted secret fields as stored, or decrypted values when
/// the caller already has plaintext (e.g. straight from form submission).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataSourceRecord {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub source_type: DataSourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_endpoint: Option<String>,
    #[serde(default)]
    pub health_status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_health_check: Option<DateTime<Utc>>,
}

/// Outcome of a connectivity probe. Network failure lands in `last_error`,
/// never in a panic or an `Err`.
#[derive(Clone, Debug, Serialize)]
pub struct ConnectionResult {
    pub is_connected: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub last_checked: DateTime<Utc>,
}

/// Per-request options for [`Connector::fetch`].
#[derive(Clone, Debug, Default)]
pub struct FetchOptions {
    /// HTTP method; GET when unset
    pub method: Option<reqwest::Method>,
    /// Query parameters, URL-encoded and appended to the target URL
    pub params: Vec<(String, String)>,
    /// Extra request headers; an explicit `Content-Type` here suppresses
    /// JSON body serialization
    pub headers: HashMap<String, String>,
    /// Request body, serialized as JSON unless `Content-Type` says otherwise
    pub body: Option<Value>,
    /// Per-request timeout; the connector default when unset
    pub timeout: Option<Duration>,
}

/// Fetch failure taxonomy.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchError {
    /// The request exceeded its timeout and was aborted in flight
    TimedOut,
    /// Transport-level failure (DNS, connect, TLS, reset)
    Network(String),
    /// The server answered with a non-2xx status. The body has already been
    /// read, so `detail` can carry server-provided diagnostics.
    Http {
        status: u16,
        status_text: String,
        detail: Option<String>,
    },
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::TimedOut => write!(f, "Request timed out"),
            FetchError::Network(msg) => write!(f, "{}", msg),
            FetchError::Http {
                status,
                status_text,
                ..
            } => write!(f, "HTTP {}: {}", status, status_text),
        }
    }
}

impl std::error::Error for FetchError {}

/// One live, authenticated connection to an external data source.
///
/// A connector is uniquely associated with one data-source id at a time; the
/// manager guarantees at most one live instance per id.
#[async_trait]
pub trait Connector: Send + Sync + std::fmt::Debug {
    /// The data-source id this connector serves.
    fn id(&self) -> &str;

    /// The data-source kind.
    fn source_type(&self) -> DataSourceType;

    /// Probes connectivity against the health-check endpoint (or the base
    /// URL when none is configured) with a bounded timeout.
    async fn test_connection(&self) -> ConnectionResult;

    /// Performs one request against the data source.
    ///
    /// The endpoint path is joined to the normalized base URL; query
    /// parameters from `options` are URL-encoded and appended. JSON
    /// responses are parsed; anything else is wrapped as
    /// `{"text": ..., "_raw": true}`.
    async fn fetch(&self, endpoint: &str, options: FetchOptions) -> Result<Value, FetchError>;
}
