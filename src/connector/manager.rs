//! Connector manager — factory, cache, and health tracking for connectors.
//!
//! Owns the only paths that construct connectors. Credential decryption
//! happens here (via the vault) exactly once per cached connector; callers
//! everywhere else see a ready-to-use instance.
//!
//! # At-most-one-instance invariant
//! One live connector per data-source id: `get_connector` goes through the
//! map's entry API, so two concurrent calls for the same id cannot construct
//! two instances. `remove_connector` must be called whenever a data source's
//! stored configuration changes, or stale credentials silently persist.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{
    ConnectionResult, Connector, DataSourceRecord, DataSourceType, FetchOptions, HealthStatus,
    RestConnector,
};
use crate::audit::{AuditEvent, AuditSink, SYSTEM_USER};
use crate::config::CoreConfig;
use crate::vault::CredentialVault;

/// Data-source id used for throwaway candidate probes. Never cached.
const TEST_CONNECTION_ID: &str = "test-connection";

/// Manager errors. Messages name the data source and the failing field —
/// never decrypted secret values.
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerError {
    /// No connector exists for this data-source type (fatal configuration
    /// error, not retried)
    UnsupportedType {
        source_id: String,
        source_type: DataSourceType,
    },
    /// A secret field failed to decrypt and strict mode is on
    Decryption {
        source_id: String,
        field: &'static str,
    },
    /// The connector variant rejected the record (e.g. missing base URL)
    Construction { source_id: String, reason: String },
}

impl std::fmt::Display for ManagerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ManagerError::UnsupportedType {
                source_id,
                source_type,
            } => write!(
                f,
                "Unsupported data source type '{}' for data source '{}'",
                source_type, source_id
            ),
            ManagerError::Decryption { source_id, field } => write!(
                f,
                "Failed to decrypt credential field '{}' for data source '{}'",
                field, source_id
            ),
            ManagerError::Construction { source_id, reason } => write!(
                f,
                "Failed to construct connector for data source '{}': {}",
                source_id, reason
            ),
        }
    }
}

impl std::error::Error for ManagerError {}

type ConnectorFactory =
    Box<dyn Fn(&DataSourceRecord, Duration, Duration) -> anyhow::Result<Arc<dyn Connector>> + Send + Sync>;

/// Factory + cache of live connectors, plus per-source health status.
///
/// The health cache is a dedicated map, independent of the generic cache —
/// health entries never expire by TTL, they are overwritten on each check.
pub struct ConnectorManager {
    vault: Arc<CredentialVault>,
    factories: HashMap<DataSourceType, ConnectorFactory>,
    connectors: DashMap<String, Arc<dyn Connector>>,
    health: DashMap<String, ConnectionResult>,
    audit: Arc<dyn AuditSink>,
    strict_decrypt: bool,
    test_timeout: Duration,
    fetch_timeout: Duration,
    sample_timeout: Duration,
    decrypt_ops: AtomicU64,
}

impl ConnectorManager {
    /// Creates a manager with the built-in connector factories registered.
    pub fn new(vault: Arc<CredentialVault>, config: &CoreConfig, audit: Arc<dyn AuditSink>) -> Self {
        let mut factories: HashMap<DataSourceType, ConnectorFactory> = HashMap::new();

        // One factory per supported kind; new kinds register here
        factories.insert(
            DataSourceType::Rest,
            Box::new(|record, test_timeout, fetch_timeout| {
                let connector = RestConnector::new(record, test_timeout, fetch_timeout)?;
                Ok(Arc::new(connector) as Arc<dyn Connector>)
            }),
        );

        Self {
            vault,
            factories,
            connectors: DashMap::new(),
            health: DashMap::new(),
            audit,
            strict_decrypt: config.vault.strict_decrypt,
            test_timeout: config.connector.test_timeout(),
            fetch_timeout: config.connector.fetch_timeout(),
            sample_timeout: config.connector.sample_timeout(),
            decrypt_ops: AtomicU64::new(0),
        }
    }

    /// Builds a connector for `record` without caching it.
    ///
    /// With `decrypt_credentials`, every populated secret field of the auth
    /// config is run through the vault first. A failed decrypt falls back to
    /// the stored value (legacy plaintext records) unless strict mode is on,
    /// in which case it is a hard [`ManagerError::Decryption`].
    pub fn create_connector(
        &self,
        record: &DataSourceRecord,
        decrypt_credentials: bool,
    ) -> Result<Arc<dyn Connector>, ManagerError> {
        let factory =
            self.factories
                .get(&record.source_type)
                .ok_or_else(|| ManagerError::UnsupportedType {
                    source_id: record.id.clone(),
                    source_type: record.source_type,
                })?;

        let mut record = record.clone();
        if decrypt_credentials {
            self.decrypt_auth(&mut record)?;
        }

        factory(&record, self.test_timeout, self.fetch_timeout).map_err(|e| {
            ManagerError::Construction {
                source_id: record.id.clone(),
                reason: e.to_string(),
            }
        })
    }

    /// Returns the cached connector for `record.id`, constructing (and
    /// decrypting) on first use. The entry API makes check-then-insert
    /// atomic, so concurrent callers share one instance and the key
    /// derivation cost is paid once.
    pub fn get_connector(
        &self,
        record: &DataSourceRecord,
    ) -> Result<Arc<dyn Connector>, ManagerError> {
        match self.connectors.entry(record.id.clone()) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let connector = self.create_connector(record, true)?;
                entry.insert(Arc::clone(&connector));

                info!(source_id = %record.id, source_type = %record.source_type, "Connector created");
                self.audit.record(
                    AuditEvent::new(SYSTEM_USER, "connector.create", "data_source")
                        .with_resource_id(&record.id),
                );
                Ok(connector)
            }
        }
    }

    /// Evicts the connector and its health entry. Call on every stored
    /// configuration change; the next `get_connector` re-decrypts.
    pub fn remove_connector(&self, id: &str) -> bool {
        let removed = self.connectors.remove(id).is_some();
        self.health.remove(id);

        if removed {
            info!(source_id = %id, "Connector removed");
            self.audit.record(
                AuditEvent::new(SYSTEM_USER, "connector.remove", "data_source").with_resource_id(id),
            );
        }
        removed
    }

    /// Probes a candidate data source whose auth fields are already
    /// decrypted (e.g. straight from form submission, before first persist).
    ///
    /// On success, attempts one best-effort sample fetch with a short
    /// timeout; its failure does not downgrade the result. The throwaway
    /// connector is never cached.
    pub async fn test_connection(&self, candidate: &DataSourceRecord) -> ConnectionResult {
        let mut record = candidate.clone();
        record.id = TEST_CONNECTION_ID.to_string();

        let connector = match self.create_connector(&record, false) {
            Ok(c) => c,
            Err(e) => {
                return ConnectionResult {
                    is_connected: false,
                    latency_ms: 0,
                    last_error: Some(e.to_string()),
                    last_checked: chrono::Utc::now(),
                }
            }
        };

        let result = connector.test_connection().await;

        if result.is_connected {
            let options = FetchOptions {
                timeout: Some(self.sample_timeout),
                ..Default::default()
            };
            if let Err(e) = connector.fetch("", options).await {
                debug!(error = %e, "Sample fetch after successful probe failed");
            }
        }

        result
    }

    /// Probes through the cached connector and records the outcome in the
    /// health cache. Updates `record`'s health fields in place so the caller
    /// can hand the annotated copy back to persistence.
    pub async fn check_health(
        &self,
        record: &mut DataSourceRecord,
    ) -> Result<ConnectionResult, ManagerError> {
        let connector = self.get_connector(record)?;
        let result = connector.test_connection().await;

        record.health_status = if result.is_connected {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };
        record.last_health_check = Some(result.last_checked);

        self.health.insert(record.id.clone(), result.clone());
        self.audit.record(
            AuditEvent::new(SYSTEM_USER, "connector.health_check", "data_source")
                .with_resource_id(&record.id),
        );

        Ok(result)
    }

    /// Most recent probe result for a data source, if any.
    pub fn health_of(&self, id: &str) -> Option<ConnectionResult> {
        self.health.get(id).map(|r| r.clone())
    }

    /// All known probe results, keyed by data-source id.
    pub fn health_snapshot(&self) -> HashMap<String, ConnectionResult> {
        self.health
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Number of credential decrypt operations performed so far.
    pub fn decrypt_count(&self) -> u64 {
        self.decrypt_ops.load(Ordering::Relaxed)
    }

    /// Drops every cached connector and health entry. Test/maintenance
    /// tooling only — not part of normal request handling.
    pub fn reset(&self) {
        self.connectors.clear();
        self.health.clear();
    }

    fn decrypt_auth(&self, record: &mut DataSourceRecord) -> Result<(), ManagerError> {
        let source_id = record.id.clone();
        let strict = self.strict_decrypt;
        let vault = &self.vault;
        let decrypt_ops = &self.decrypt_ops;

        record.auth.try_visit_secrets_mut(|field, value| {
            decrypt_ops.fetch_add(1, Ordering::Relaxed);
            match vault.decrypt(value) {
                Ok(plaintext) => {
                    *value = plaintext;
                    Ok(())
                }
                Err(_) if strict => Err(ManagerError::Decryption {
                    source_id: source_id.clone(),
                    field,
                }),
                Err(e) => {
                    // Legacy records may hold plaintext; use the stored
                    // value as-is. The value itself is never logged.
                    warn!(
                        source_id = %source_id,
                        field = %field,
                        error = %e,
                        "Credential decrypt failed, using stored value unchanged"
                    );
                    Ok(())
                }
            }
        })
    }
}
