//! Scalar key/value primitives.
//!
//! This is the whole contract the flat backend and the snapshot cache are
//! allowed to rely on. Multi-key calls are a convenience, not a transaction:
//! an implementation may apply part of a `multi_set` and then fail.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};
use tracing::info;

use crate::error::{Result, StoreError};

pub trait KeyValue: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn multi_get(&self, keys: &[String]) -> Result<Vec<Option<String>>>;
    fn multi_set(&self, entries: &[(String, String)]) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
    fn multi_remove(&self, keys: &[String]) -> Result<()>;
    fn keys(&self) -> Result<Vec<String>>;
    fn clear(&self) -> Result<()>;
}

/// Key/value table in a SQLite file. Each primitive auto-commits on its
/// own; nothing groups keys into one transaction.
pub struct SqliteKv {
    conn: Mutex<Connection>,
}

impl SqliteKv {
    pub fn open(path: &Path, encryption_key: Option<&str>) -> Result<Self> {
        let conn = Connection::open(path)?;
        if let Some(key) = encryption_key.filter(|k| !k.is_empty()) {
            conn.pragma_update(None, "key", key)?;
        }
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let kv = Self::init(conn)?;
        info!("Key/value store opened at {}", path.display());
        Ok(kv)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key    TEXT PRIMARY KEY,
                value  TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))?;
        f(&conn)
    }
}

impl KeyValue for SqliteKv {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row("SELECT value FROM kv WHERE key = ?1", [key], |r| r.get(0))
                .optional()?)
        })
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        })
    }

    fn multi_get(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        keys.iter().map(|key| self.get(key)).collect()
    }

    fn multi_set(&self, entries: &[(String, String)]) -> Result<()> {
        for (key, value) in entries {
            self.set(key, value)?;
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM kv WHERE key = ?1", [key])?;
            Ok(())
        })
    }

    fn multi_remove(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            self.remove(key)?;
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT key FROM kv ORDER BY key")?;
            let keys = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(keys)
        })
    }

    fn clear(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM kv", [])?;
            Ok(())
        })
    }
}

/// Process-local map. Used by tests and as the default snapshot slot store.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut BTreeMap<String, String>) -> T,
    {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))?;
        Ok(f(&mut entries))
    }
}

impl KeyValue for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_entries(|entries| entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.with_entries(|entries| {
            entries.insert(key.to_string(), value.to_string());
        })
    }

    fn multi_get(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        self.with_entries(|entries| keys.iter().map(|k| entries.get(k).cloned()).collect())
    }

    fn multi_set(&self, pairs: &[(String, String)]) -> Result<()> {
        self.with_entries(|entries| {
            for (key, value) in pairs {
                entries.insert(key.clone(), value.clone());
            }
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.with_entries(|entries| {
            entries.remove(key);
        })
    }

    fn multi_remove(&self, keys: &[String]) -> Result<()> {
        self.with_entries(|entries| {
            for key in keys {
                entries.remove(key);
            }
        })
    }

    fn keys(&self) -> Result<Vec<String>> {
        self.with_entries(|entries| entries.keys().cloned().collect())
    }

    fn clear(&self) -> Result<()> {
        self.with_entries(|entries| entries.clear())
    }
}
