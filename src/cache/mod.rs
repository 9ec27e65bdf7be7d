//! Process-wide generic cache with TTL, FIFO eviction, and tag invalidation.
//!
//! One instance is shared by every subsystem (connector results, UI-level
//! query caching, anything else) — keys and tags are caller-defined strings
//! and the cache has no data-source-specific knowledge. Values are stored as
//! `serde_json::Value` so heterogeneous callers and the durable mirror share
//! one representation; `get`/`set` are generic over serde at the edges.
//!
//! # Expiry
//! Entries expire lazily on read, bounded by a periodic sweep task
//! ([`GenericCache::spawn_sweeper`]). The sweep only ever deletes entries it
//! observed as already expired at sweep time — an entry refreshed after the
//! sweep began is never deleted.
//!
//! # Eviction
//! Before a `set` would exceed `max_size`, the oldest-inserted entries are
//! evicted one at a time (strict FIFO by insertion timestamp, not
//! LRU-by-access) until the cache is under the cap. Each eviction invokes the
//! registered `on_evict` callback.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

mod mirror;
pub use mirror::CacheMirror;

/// A single cached value. Owned exclusively by the cache; lifetime bounded by
/// `expires_at` or explicit delete/clear/tag invalidation.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub data: Value,
    /// Insertion time — the FIFO eviction key. Reads do not refresh it.
    pub timestamp: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub tags: Vec<String>,
}

/// Per-set options.
#[derive(Clone, Debug, Default)]
pub struct CacheOptions {
    /// Entry lifetime; falls back to the cache default when unset
    pub ttl: Option<Duration>,
    /// Labels for bulk invalidation via [`GenericCache::invalidate_by_tag`]
    pub tags: Vec<String>,
}

impl CacheOptions {
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            tags: Vec::new(),
        }
    }

    pub fn with_tags<I: IntoIterator<Item = S>, S: Into<String>>(mut self, tags: I) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// Counter snapshot returned by [`GenericCache::stats`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
    pub evictions: u64,
}

impl CacheStats {
    /// Hit rate in [0, 1]; 0 when nothing has been looked up yet.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

type EvictCallback = Box<dyn Fn(&str, &CacheEntry) + Send + Sync>;

/// Generic key→value store with per-entry TTL, capacity eviction, and tags.
pub struct GenericCache {
    entries: DashMap<String, CacheEntry>,
    max_size: usize,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    on_evict: RwLock<Option<EvictCallback>>,
    mirror: Option<CacheMirror>,
}

impl GenericCache {
    /// Creates an in-memory cache with the given capacity and default TTL.
    pub fn new(max_size: usize, default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            max_size,
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            on_evict: RwLock::new(None),
            mirror: None,
        }
    }

    /// Creates a cache with a durable SQLite mirror and reloads any
    /// unexpired persisted entries.
    ///
    /// Mirror write failures never fail cache callers — the in-memory state
    /// stays authoritative and the error is logged.
    pub fn with_mirror(
        max_size: usize,
        default_ttl: Duration,
        mirror: CacheMirror,
    ) -> anyhow::Result<Self> {
        let mut cache = Self::new(max_size, default_ttl);
        let persisted = mirror.load_all()?;
        for (key, entry) in persisted {
            cache.entries.insert(key, entry);
        }
        cache.mirror = Some(mirror);
        Ok(cache)
    }

    /// Registers the eviction observer. Replaces any previous callback.
    pub fn set_evict_callback<F>(&self, callback: F)
    where
        F: Fn(&str, &CacheEntry) + Send + Sync + 'static,
    {
        *self.on_evict.write().unwrap() = Some(Box::new(callback));
    }

    /// Looks up a value, deserializing it to `T`.
    ///
    /// An entry past its `expires_at` is removed and counted as a miss. A
    /// present entry that fails to deserialize to `T` also counts as a miss
    /// (the caller asked for a shape the entry does not have).
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let now = Utc::now();

        // Read under the shard lock; the guard is dropped before any removal
        let snapshot = self
            .entries
            .get(key)
            .map(|entry| (entry.data.clone(), entry.expires_at > now));

        let value = match snapshot {
            Some((data, true)) => Some(data),
            Some((_, false)) => {
                // Lazy expiry — re-check under the entry lock so a value
                // refreshed since the read survives
                if self
                    .entries
                    .remove_if(key, |_, e| e.expires_at <= now)
                    .is_some()
                {
                    self.mirror_delete(key);
                }
                None
            }
            None => None,
        };

        match value {
            Some(v) => match serde_json::from_value(v) {
                Ok(typed) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    Some(typed)
                }
                Err(e) => {
                    debug!(key = %key, error = %e, "Cached value does not match requested type");
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    None
                }
            },
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Stores a value under `key`, stamping `expires_at` now.
    ///
    /// Evicts oldest-inserted entries first if the insert would exceed
    /// capacity. Serialization failure is a caller bug surfaced as an error.
    pub fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        options: CacheOptions,
    ) -> anyhow::Result<()> {
        let data = serde_json::to_value(value)
            .map_err(|e| anyhow::anyhow!("Failed to serialize cache value for '{}': {}", key, e))?;

        let now = Utc::now();
        let ttl = options.ttl.unwrap_or(self.default_ttl);
        let entry = CacheEntry {
            data,
            timestamp: now,
            expires_at: now
                + chrono::Duration::from_std(ttl)
                    .unwrap_or_else(|_| chrono::Duration::days(36500)),
            tags: options.tags,
        };

        // Replacing an existing key does not change the entry count
        if !self.entries.contains_key(key) {
            self.evict_to_capacity();
        }

        self.mirror_store(key, &entry);
        self.entries.insert(key.to_string(), entry);
        Ok(())
    }

    /// Removes one entry. Returns whether it existed.
    pub fn delete(&self, key: &str) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            self.mirror_delete(key);
        }
        removed
    }

    /// True if `key` holds an unexpired entry. Does not touch hit/miss stats.
    pub fn has(&self, key: &str) -> bool {
        match self.entries.get(key) {
            Some(entry) => entry.expires_at > Utc::now(),
            None => false,
        }
    }

    /// Removes every entry labeled with `tag`; returns the count removed.
    ///
    /// Used to bulk-expire, e.g. all entries for a data source after its
    /// configuration changes.
    pub fn invalidate_by_tag(&self, tag: &str) -> usize {
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().tags.iter().any(|t| t == tag))
            .map(|e| e.key().clone())
            .collect();

        let mut removed = 0;
        for key in keys {
            if self.entries.remove(&key).is_some() {
                self.mirror_delete(&key);
                removed += 1;
            }
        }
        removed
    }

    /// Full-state wipe. Not part of normal request handling — reserved for
    /// tests and maintenance tooling.
    pub fn clear(&self) {
        self.entries.clear();
        if let Some(mirror) = &self.mirror {
            if let Err(e) = mirror.clear() {
                warn!(error = %e, "Cache mirror clear failed");
            }
        }
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: self.entries.len(),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// All current keys (maintenance tooling).
    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Removes entries already expired at the time the sweep started.
    ///
    /// Returns the number removed. `remove_if` re-checks expiry under the
    /// entry lock, so a concurrently refreshed entry survives.
    pub fn sweep_expired(&self) -> usize {
        let sweep_start = Utc::now();
        let candidates: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().expires_at <= sweep_start)
            .map(|e| e.key().clone())
            .collect();

        let mut removed = 0;
        for key in candidates {
            if self
                .entries
                .remove_if(&key, |_, e| e.expires_at <= sweep_start)
                .is_some()
            {
                self.mirror_delete(&key);
                removed += 1;
            }
        }

        if removed > 0 {
            debug!(removed, "Cache sweep removed expired entries");
        }
        removed
    }

    /// Spawns the periodic expiry sweep. The handle can be aborted on
    /// shutdown; dropping the cache does not stop it, so callers own it.
    pub fn spawn_sweeper(cache: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache = Arc::clone(cache);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // consume immediate first tick
            loop {
                ticker.tick().await;
                cache.sweep_expired();
            }
        })
    }

    /// Evicts oldest-inserted entries until one more insert fits under the cap.
    fn evict_to_capacity(&self) {
        while self.entries.len() >= self.max_size {
            // Oldest insertion timestamp wins eviction (strict FIFO)
            let oldest = self
                .entries
                .iter()
                .min_by_key(|e| e.value().timestamp)
                .map(|e| e.key().clone());

            let Some(key) = oldest else { break };
            let Some((key, entry)) = self.entries.remove(&key) else {
                continue;
            };

            self.evictions.fetch_add(1, Ordering::Relaxed);
            self.mirror_delete(&key);

            if let Some(callback) = self.on_evict.read().unwrap().as_ref() {
                callback(&key, &entry);
            }
        }
    }

    fn mirror_store(&self, key: &str, entry: &CacheEntry) {
        if let Some(mirror) = &self.mirror {
            if let Err(e) = mirror.store(key, entry) {
                warn!(key = %key, error = %e, "Cache mirror write failed");
            }
        }
    }

    fn mirror_delete(&self, key: &str) {
        if let Some(mirror) = &self.mirror {
            if let Err(e) = mirror.delete(key) {
                warn!(key = %key, error = %e, "Cache mirror delete failed");
            }
        }
    }
}
