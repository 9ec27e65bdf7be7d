use serde::Deserialize;
use std::time::Duration;

use crate::vault::VaultError;

/// Environment variable holding the vault master secret. Read on demand and
/// never stored in configuration files.
pub const MASTER_SECRET_ENV: &str = "PORTICO_MASTER_SECRET";

/// Complete core configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub connector: ConnectorConfig,
    #[serde(default)]
    pub vault: VaultConfig,
}

/// Generic cache configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Entry cap; oldest-inserted entries are evicted beyond it
    #[serde(default = "default_cache_max_size")]
    pub max_size: usize,
    /// TTL applied when a set does not specify one (seconds)
    #[serde(default = "default_cache_ttl")]
    pub default_ttl_secs: u64,
    /// Interval of the background expiry sweep (seconds)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// SQLite path for the durable mirror; in-memory only when unset
    #[serde(default)]
    pub mirror_path: Option<String>,
}

fn default_cache_max_size() -> usize {
    1000
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    60
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: default_cache_max_size(),
            default_ttl_secs: default_cache_ttl(),
            sweep_interval_secs: default_sweep_interval(),
            mirror_path: None,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Connector timeout configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectorConfig {
    /// Connectivity probe timeout (seconds)
    #[serde(default = "default_test_timeout")]
    pub test_timeout_secs: u64,
    /// Default fetch timeout (seconds), overridable per request
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
    /// Best-effort sample fetch timeout after a candidate probe (seconds)
    #[serde(default = "default_sample_timeout")]
    pub sample_timeout_secs: u64,
}

fn default_test_timeout() -> u64 {
    10
}

fn default_fetch_timeout() -> u64 {
    30
}

fn default_sample_timeout() -> u64 {
    5
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            test_timeout_secs: default_test_timeout(),
            fetch_timeout_secs: default_fetch_timeout(),
            sample_timeout_secs: default_sample_timeout(),
        }
    }
}

impl ConnectorConfig {
    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn sample_timeout(&self) -> Duration {
        Duration::from_secs(self.sample_timeout_secs)
    }
}

/// Vault policy configuration
#[derive(Debug, Clone, Deserialize)]
pub struct VaultConfig {
    /// When true, a failed credential decrypt refuses to construct the
    /// connector instead of falling back to the stored value
    #[serde(default)]
    pub strict_decrypt: bool,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            strict_decrypt: false,
        }
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            connector: ConnectorConfig::default(),
            vault: VaultConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Build from env vars, falling back to defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("PORTICO_CACHE_MAX_SIZE") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.cache.max_size = n;
            }
        }
        if let Ok(v) = std::env::var("PORTICO_CACHE_DEFAULT_TTL_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                cfg.cache.default_ttl_secs = n;
            }
        }
        if let Ok(v) = std::env::var("PORTICO_CACHE_SWEEP_INTERVAL_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                cfg.cache.sweep_interval_secs = n;
            }
        }
        if let Ok(v) = std::env::var("PORTICO_CACHE_MIRROR_PATH") {
            if !v.is_empty() {
                cfg.cache.mirror_path = Some(v);
            }
        }
        if let Ok(v) = std::env::var("PORTICO_CONNECTOR_TEST_TIMEOUT_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                cfg.connector.test_timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("PORTICO_CONNECTOR_FETCH_TIMEOUT_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                cfg.connector.fetch_timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("PORTICO_CONNECTOR_SAMPLE_TIMEOUT_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                cfg.connector.sample_timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("PORTICO_VAULT_STRICT_DECRYPT") {
            if let Ok(b) = v.parse::<bool>() {
                cfg.vault.strict_decrypt = b;
            }
        }

        cfg
    }

    /// Reads the vault master secret from the environment.
    ///
    /// Missing or empty is a fatal configuration error — the vault cannot be
    /// constructed without it.
    pub fn master_secret() -> Result<String, VaultError> {
        match std::env::var(MASTER_SECRET_ENV) {
            Ok(secret) if !secret.is_empty() => Ok(secret),
            _ => Err(VaultError::MissingSecret),
        }
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> anyhow::Result<CoreConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config: CoreConfig = toml::from_str(&contents)?;
    Ok(config)
}
