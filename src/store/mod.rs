//! Key-value store backed by SQLite.
//!
//! Holds the last-known engine status (read once at startup by auto-preload)
//! and user preferences such as the preferred inference provider.

use anyhow::{Context, Result, anyhow};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};

const KEY_ENGINE_READY: &str = "engine_ready";
const KEY_LAST_MODEL: &str = "last_model_id";
const KEY_LAST_STATUS: &str = "last_status";
const KEY_PROVIDER: &str = "provider";

/// Where the user wants inference to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Local,
    Cloud,
}

impl Provider {
    fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Cloud => "cloud",
        }
    }
}

/// Record written on every `ready`/`unload` transition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedStatus {
    pub engine_ready: bool,
    pub last_model_id: Option<String>,
    pub last_status_snapshot: Option<String>,
}

/// Persistent key-value store.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open or create the store table in the given database.
    /// Use `":memory:"` for tests.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).context("failed to open store database")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
        )
        .context("failed to create kv table")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("store lock poisoned"))
    }

    /// Get a value by key.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT value FROM kv WHERE key = ?1")?;
        let mut rows = stmt.query([key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    /// Set a value (upsert).
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [key, value],
        )?;
        Ok(())
    }

    /// Remove a key.
    pub fn remove(&self, key: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM kv WHERE key = ?1", [key])?;
        Ok(())
    }

    pub fn load_status(&self) -> Result<PersistedStatus> {
        Ok(PersistedStatus {
            engine_ready: self.get(KEY_ENGINE_READY)?.as_deref() == Some("true"),
            last_model_id: self.get(KEY_LAST_MODEL)?,
            last_status_snapshot: self.get(KEY_LAST_STATUS)?,
        })
    }

    /// Write the status record in one transaction.
    pub fn save_status(&self, status: &PersistedStatus) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let upsert = "INSERT INTO kv (key, value) VALUES (?1, ?2)
                      ON CONFLICT(key) DO UPDATE SET value = excluded.value";
        tx.execute(
            upsert,
            [KEY_ENGINE_READY, if status.engine_ready { "true" } else { "false" }],
        )?;
        match &status.last_model_id {
            Some(model) => tx.execute(upsert, [KEY_LAST_MODEL, model.as_str()])?,
            None => tx.execute("DELETE FROM kv WHERE key = ?1", [KEY_LAST_MODEL])?,
        };
        match &status.last_status_snapshot {
            Some(snapshot) => tx.execute(upsert, [KEY_LAST_STATUS, snapshot.as_str()])?,
            None => tx.execute("DELETE FROM kv WHERE key = ?1", [KEY_LAST_STATUS])?,
        };
        tx.commit()?;
        Ok(())
    }

    pub fn clear_status(&self) -> Result<()> {
        for key in [KEY_ENGINE_READY, KEY_LAST_MODEL, KEY_LAST_STATUS] {
            self.remove(key)?;
        }
        Ok(())
    }

    pub fn provider(&self) -> Result<Option<Provider>> {
        Ok(match self.get(KEY_PROVIDER)?.as_deref() {
            Some("local") => Some(Provider::Local),
            Some("cloud") => Some(Provider::Cloud),
            _ => None,
        })
    }

    pub fn set_provider(&self, provider: Provider) -> Result<()> {
        self.set(KEY_PROVIDER, provider.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_store() -> Store {
        Store::in_memory().unwrap()
    }

    #[test]
    fn get_returns_none_for_missing_key() {
        let store = mem_store();
        assert!(store.get("nonexistent").unwrap().is_none());
    }

    #[test]
    fn set_overwrites_existing() {
        let store = mem_store();
        store.set("model", "old").unwrap();
        store.set("model", "new").unwrap();
        assert_eq!(store.get("model").unwrap().unwrap(), "new");
    }

    #[test]
    fn remove_nonexistent_is_ok() {
        let store = mem_store();
        store.remove("nonexistent").unwrap();
    }

    #[test]
    fn empty_store_loads_default_status() {
        let store = mem_store();
        assert_eq!(store.load_status().unwrap(), PersistedStatus::default());
    }

    #[test]
    fn status_round_trips() {
        let store = mem_store();
        let status = PersistedStatus {
            engine_ready: true,
            last_model_id: Some("qwen2.5:1.5b".to_string()),
            last_status_snapshot: Some("ready".to_string()),
        };
        store.save_status(&status).unwrap();
        assert_eq!(store.load_status().unwrap(), status);
    }

    #[test]
    fn saving_none_clears_previous_values() {
        let store = mem_store();
        store
            .save_status(&PersistedStatus {
                engine_ready: true,
                last_model_id: Some("m".to_string()),
                last_status_snapshot: Some("ready".to_string()),
            })
            .unwrap();
        store
            .save_status(&PersistedStatus {
                engine_ready: false,
                last_model_id: None,
                last_status_snapshot: Some("not_initialized".to_string()),
            })
            .unwrap();

        let loaded = store.load_status().unwrap();
        assert!(!loaded.engine_ready);
        assert!(loaded.last_model_id.is_none());
        assert_eq!(loaded.last_status_snapshot.as_deref(), Some("not_initialized"));
    }

    #[test]
    fn clear_status_keeps_preferences() {
        let store = mem_store();
        store.set_provider(Provider::Local).unwrap();
        store
            .save_status(&PersistedStatus {
                engine_ready: true,
                last_model_id: Some("m".to_string()),
                last_status_snapshot: None,
            })
            .unwrap();

        store.clear_status().unwrap();

        assert_eq!(store.load_status().unwrap(), PersistedStatus::default());
        assert_eq!(store.provider().unwrap(), Some(Provider::Local));
    }

    #[test]
    fn unknown_provider_value_reads_as_none() {
        let store = mem_store();
        store.set("provider", "carrier-pigeon").unwrap();
        assert!(store.provider().unwrap().is_none());
    }

    #[test]
    fn persists_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store-test.db");
        let path_str = path.to_str().unwrap();

        {
            let store = Store::open(path_str).unwrap();
            store.set_provider(Provider::Cloud).unwrap();
        }

        {
            let store = Store::open(path_str).unwrap();
            assert_eq!(store.provider().unwrap(), Some(Provider::Cloud));
        }
    }
}
