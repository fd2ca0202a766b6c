use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

/// Key/value snapshot store for dashboard state that must survive restarts.
/// Values are opaque JSON blobs; schema knowledge stays with the callers.
pub(crate) struct StateStore {
    conn: Connection,
}

impl StateStore {
    pub(crate) fn open_default() -> Result<Self> {
        let path = state_file_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create state dir {}", parent.display()))?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("open state db {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS app_state (
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL,
              updated_at INTEGER NOT NULL DEFAULT (unixepoch())
            );
            ",
        )
        .context("init state schema")?;

        Ok(Self { conn })
    }

    #[cfg(test)]
    pub(crate) fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory state db")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS app_state (
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL,
              updated_at INTEGER NOT NULL DEFAULT (unixepoch())
            );
            ",
        )
        .context("init state schema")?;
        Ok(Self { conn })
    }

    pub(crate) fn put_blob(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO app_state(key, value, updated_at) VALUES (?1, ?2, unixepoch())
                 ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = unixepoch()",
                params![key, value],
            )
            .context("upsert state blob")?;
        Ok(())
    }

    pub(crate) fn get_blob(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM app_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .context("read state blob")
    }
}

fn state_file_path() -> PathBuf {
    if let Some(home) = std::env::var_os("HOME") {
        PathBuf::from(home).join(".agentdeck").join("state.db")
    } else {
        PathBuf::from(".agentdeck").join("state.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_round_trips() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_blob("dashboard", "{\"v\":1}").unwrap();
        assert_eq!(
            store.get_blob("dashboard").unwrap().as_deref(),
            Some("{\"v\":1}")
        );
    }

    #[test]
    fn put_overwrites_existing_value() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_blob("dashboard", "old").unwrap();
        store.put_blob("dashboard", "new").unwrap();
        assert_eq!(store.get_blob("dashboard").unwrap().as_deref(), Some("new"));
    }

    #[test]
    fn missing_key_reads_none() {
        let store = StateStore::open_in_memory().unwrap();
        assert_eq!(store.get_blob("absent").unwrap(), None);
    }
}
