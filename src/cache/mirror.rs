//! Durable mirror for the generic cache, backed by SQLite.
//!
//! The in-memory cache is authoritative; the mirror only exists so warm
//! entries survive a restart. Every write here can fail without failing the
//! caller — the cache logs and moves on.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;

use super::CacheEntry;

/// All mirrored keys share this prefix so the table can host other
/// key-value data without collisions.
const KEY_PREFIX: &str = "portico.cache.";

/// Persists cache entries in SQLite.
pub struct CacheMirror {
    conn: Mutex<Connection>,
}

impl CacheMirror {
    /// Opens (or creates) the SQLite database and ensures the table exists.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open cache mirror DB")?;
        let mirror = Self {
            conn: Mutex::new(conn),
        };
        mirror.create_table()?;
        Ok(mirror)
    }

    fn create_table(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cache_entries (
                key        TEXT PRIMARY KEY,
                data       TEXT NOT NULL,
                timestamp  TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                tags       TEXT NOT NULL
            );",
        )
        .context("Failed to create cache_entries table")?;
        Ok(())
    }

    /// Upserts one entry.
    pub fn store(&self, key: &str, entry: &CacheEntry) -> Result<()> {
        let data = serde_json::to_string(&entry.data).context("Failed to serialize cache data")?;
        let tags = serde_json::to_string(&entry.tags).context("Failed to serialize cache tags")?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO cache_entries (key, data, timestamp, expires_at, tags)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(key) DO UPDATE SET
                data = excluded.data,
                timestamp = excluded.timestamp,
                expires_at = excluded.expires_at,
                tags = excluded.tags",
            params![
                format!("{}{}", KEY_PREFIX, key),
                data,
                entry.timestamp.to_rfc3339(),
                entry.expires_at.to_rfc3339(),
                tags,
            ],
        )
        .context("Failed to store cache entry")?;
        Ok(())
    }

    /// Deletes one entry. Ok whether or not the row exists.
    pub fn delete(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM cache_entries WHERE key = ?1",
            params![format!("{}{}", KEY_PREFIX, key)],
        )
        .context("Failed to delete cache entry")?;
        Ok(())
    }

    /// Deletes every mirrored entry.
    pub fn clear(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM cache_entries WHERE key LIKE ?1",
            params![format!("{}%", KEY_PREFIX)],
        )
        .context("Failed to clear cache mirror")?;
        Ok(())
    }

    /// Loads all persisted entries, skipping any that have already expired.
    pub fn load_all(&self) -> Result<Vec<(String, CacheEntry)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT key, data, timestamp, expires_at, tags FROM cache_entries WHERE key LIKE ?1")
            .context("Failed to prepare load query")?;

        let rows = stmt
            .query_map(params![format!("{}%", KEY_PREFIX)], |row| {
                let key: String = row.get(0)?;
                let data: String = row.get(1)?;
                let timestamp: String = row.get(2)?;
                let expires_at: String = row.get(3)?;
                let tags: String = row.get(4)?;
                Ok((key, data, timestamp, expires_at, tags))
            })
            .context("Failed to query cache entries")?;

        let now = Utc::now();
        let mut entries = Vec::new();
        for row in rows {
            let (key, data, timestamp, expires_at, tags) =
                row.context("Failed to read cache entry row")?;

            let expires_at: DateTime<Utc> = expires_at
                .parse()
                .with_context(|| format!("Failed to parse expires_at for {}", key))?;
            if expires_at <= now {
                continue;
            }

            let timestamp: DateTime<Utc> = timestamp
                .parse()
                .with_context(|| format!("Failed to parse timestamp for {}", key))?;

            let entry = CacheEntry {
                data: serde_json::from_str(&data)
                    .with_context(|| format!("Failed to parse data for {}", key))?,
                timestamp,
                expires_at,
                tags: serde_json::from_str(&tags)
                    .with_context(|| format!("Failed to parse tags for {}", key))?,
            };

            let key = key
                .strip_prefix(KEY_PREFIX)
                .unwrap_or(key.as_str())
                .to_string();
            entries.push((key, entry));
        }

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn sample_entry(expires_in: Duration) -> CacheEntry {
        let now = Utc::now();
        CacheEntry {
            data: json!({"rows": [1, 2, 3]}),
            timestamp: now,
            expires_at: now + expires_in,
            tags: vec!["source:abc".to_string()],
        }
    }

    #[test]
    fn test_store_and_load() {
        let mirror = CacheMirror::new(":memory:").unwrap();
        mirror.store("query:users", &sample_entry(Duration::hours(1))).unwrap();

        let loaded = mirror.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].0, "query:users");
        assert_eq!(loaded[0].1.data, json!({"rows": [1, 2, 3]}));
        assert_eq!(loaded[0].1.tags, vec!["source:abc".to_string()]);
    }

    #[test]
    fn test_load_discards_expired() {
        let mirror = CacheMirror::new(":memory:").unwrap();
        mirror.store("fresh", &sample_entry(Duration::hours(1))).unwrap();
        mirror.store("stale", &sample_entry(Duration::hours(-1))).unwrap();

        let loaded = mirror.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].0, "fresh");
    }

    #[test]
    fn test_delete_and_clear() {
        let mirror = CacheMirror::new(":memory:").unwrap();
        mirror.store("a", &sample_entry(Duration::hours(1))).unwrap();
        mirror.store("b", &sample_entry(Duration::hours(1))).unwrap();

        mirror.delete("a").unwrap();
        assert_eq!(mirror.load_all().unwrap().len(), 1);

        // Deleting a missing key is not an error
        mirror.delete("a").unwrap();

        mirror.clear().unwrap();
        assert!(mirror.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_store_is_upsert() {
        let mirror = CacheMirror::new(":memory:").unwrap();
        mirror.store("k", &sample_entry(Duration::hours(1))).unwrap();

        let mut updated = sample_entry(Duration::hours(2));
        updated.data = json!("replaced");
        mirror.store("k", &updated).unwrap();

        let loaded = mirror.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].1.data, json!("replaced"));
    }
}
