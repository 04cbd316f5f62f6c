//! SQLite-backed key-value store for cached snapshots.
//!
//! Values are opaque strings written by the snapshot cache. The table keeps
//! a write timestamp per key for inspection with the sqlite CLI.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use fleet_sync::KeyValueStore;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Mutex, MutexGuard};

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (or creates) the database and ensures the table exists.
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open snapshot DB at {}", db_path))?;
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key        TEXT PRIMARY KEY,
                value      TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            [],
        )
        .context("Failed to create kv table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("snapshot DB lock poisoned"))
    }
}

impl KeyValueStore for SqliteStore {
    fn read(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
            row.get(0)
        })
        .optional()
        .with_context(|| format!("Failed to read key {}", key))
    }

    fn write(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
            params![key, value, Utc::now().to_rfc3339()],
        )
        .with_context(|| format!("Failed to write key {}", key))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])
            .with_context(|| format!("Failed to delete key {}", key))?;
        Ok(())
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        // substr instead of LIKE so '%' and '_' in the prefix match literally
        let mut stmt = conn.prepare(
            "SELECT key FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key ASC",
        )?;
        let rows = stmt.query_map(params![prefix], |row| row.get::<_, String>(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list keys")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_sync::cache::CacheConfig;
    use fleet_sync::{EntitySnapshot, Position, SnapshotCache};
    use std::collections::HashMap;
    use std::sync::Arc;

    fn in_memory_store() -> SqliteStore {
        SqliteStore::new(":memory:").expect("in-memory store failed")
    }

    #[test]
    fn test_write_and_read() {
        let store = in_memory_store();
        store.write("snap:1", "one").unwrap();
        assert_eq!(store.read("snap:1").unwrap().as_deref(), Some("one"));

        store.write("snap:1", "uno").unwrap();
        assert_eq!(store.read("snap:1").unwrap().as_deref(), Some("uno"));
    }

    #[test]
    fn test_read_missing_returns_none() {
        let store = in_memory_store();
        assert!(store.read("nope").unwrap().is_none());
    }

    #[test]
    fn test_delete_missing_is_noop() {
        let store = in_memory_store();
        store.delete("ghost").unwrap();

        store.write("k", "v").unwrap();
        store.delete("k").unwrap();
        assert!(store.read("k").unwrap().is_none());
    }

    #[test]
    fn test_keys_by_prefix() {
        let store = in_memory_store();
        store.write("snap:2", "b").unwrap();
        store.write("snap:1", "a").unwrap();
        store.write("other:1", "x").unwrap();
        store.write("snapshot", "y").unwrap();

        assert_eq!(store.keys("snap:").unwrap(), vec!["snap:1", "snap:2"]);
        assert_eq!(store.keys("").unwrap().len(), 4);
    }

    #[test]
    fn test_prefix_wildcards_match_literally() {
        let store = in_memory_store();
        store.write("a_1", "x").unwrap();
        store.write("ab1", "y").unwrap();

        assert_eq!(store.keys("a_").unwrap(), vec!["a_1"]);
        assert!(store.keys("a%").unwrap().is_empty());
    }

    #[test]
    fn test_cache_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshots.db");
        let path = path.to_str().unwrap();

        let snapshot = EntitySnapshot::from_position(Position {
            device_id: 42,
            fix_time: Utc::now(),
            latitude: 47.37,
            longitude: 8.54,
            speed: 12.0,
            course: 180.0,
            accuracy: 4.0,
            attributes: HashMap::new(),
        });

        {
            let store = Arc::new(SqliteStore::new(path).unwrap());
            let cache = SnapshotCache::new(CacheConfig::default(), store);
            cache.put(snapshot.clone());
        }

        let store = Arc::new(SqliteStore::new(path).unwrap());
        let cache = SnapshotCache::new(CacheConfig::default(), store);
        let hydrated = cache.load_all();

        assert_eq!(hydrated.len(), 1);
        assert_eq!(hydrated[&42].position.latitude, 47.37);
    }
}
