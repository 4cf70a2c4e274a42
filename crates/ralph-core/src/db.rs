use crate::error::{RalphError, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use std::path::Path;

pub const SCHEMA_VERSION: i64 = 1;

/// SQLite-backed store for stories, run state, checkpoints, handoffs,
/// the execution log and tasks.
///
/// Operations live next to their domain types (`run_state.rs`,
/// `handoff.rs`, ...) as `impl Store` blocks.
pub struct Store {
    pub(crate) conn: Connection,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    /// Open the project database under `root`.
    pub fn open_project(root: &Path) -> Result<Self> {
        Self::open(crate::paths::db_path(root))
    }

    pub fn schema_version(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<()> {
        let current = self.schema_version()?;
        if current > SCHEMA_VERSION {
            return Err(RalphError::UnsupportedSchema {
                found: current,
                supported: SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_init.sql");
            self.conn.execute_batch(sql)?;
            self.conn.execute("PRAGMA user_version = 1", [])?;
            tracing::debug!("applied schema migration 1");
        }

        self.conn.execute(
            "INSERT OR IGNORE INTO run_state (id, status, updated_at) VALUES (1, 'idle', ?1)",
            params![Utc::now()],
        )?;
        Ok(())
    }
}

/// Decode a JSON text column into `T`.
pub(crate) fn json_col<T: serde::de::DeserializeOwned>(
    row: &rusqlite::Row<'_>,
    name: &str,
) -> rusqlite::Result<T> {
    let raw: String = row.get(name)?;
    serde_json::from_str(&raw).map_err(|e| {
        let idx = row.as_ref().column_index(name).unwrap_or_default();
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Encode a value for a JSON text column.
pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}
