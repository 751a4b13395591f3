use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

pub const PREFS_SCHEMA_VERSION: i64 = 1;

pub const INSTANCE_ORDER_KEY: &str = "instance_order";
pub const SPLIT_SIZES_KEY: &str = "split_sizes";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

/// Pane split ratios of the dashboard layout, in percent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SplitSizes {
    pub vertical: [f32; 2],
    pub horizontal: [f32; 2],
}

impl Default for SplitSizes {
    fn default() -> Self {
        Self {
            vertical: [60.0, 40.0],
            horizontal: [65.0, 35.0],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPref {
    pub key: String,
    pub value_json: String,
    pub updated_at: DateTime<Utc>,
}

/// Key/value preference store backing the display order and layout entries.
pub struct PrefStore {
    conn: Connection,
}

impl PrefStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > PREFS_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: PREFS_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_prefs.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    pub fn pref(&self, key: &str) -> Result<Option<StoredPref>, StorageError> {
        let row = self
            .conn
            .query_row(
                "SELECT pref_key, value_json, updated_at FROM ui_prefs WHERE pref_key = ?1",
                params![key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(key, value_json, updated_at)| {
            Ok(StoredPref {
                key,
                value_json,
                updated_at: parse_timestamp(updated_at)?,
            })
        })
        .transpose()
    }

    pub fn put_pref(&self, key: &str, value_json: &str) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO ui_prefs (pref_key, value_json, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(pref_key) DO UPDATE SET
                value_json = excluded.value_json,
                updated_at = excluded.updated_at
            ",
            params![key, value_json, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        let Some(pref) = self.pref(key)? else {
            return Ok(None);
        };
        serde_json::from_str(&pref.value_json)
            .map(Some)
            .map_err(|err| StorageError::Serialization(err.to_string()))
    }

    pub fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let value_json = serde_json::to_string(value)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        self.put_pref(key, &value_json)
    }

    /// Stored root display order, most preferred first. Empty when never saved.
    pub fn display_order(&self) -> Result<Vec<String>, StorageError> {
        Ok(self
            .get_json::<Vec<String>>(INSTANCE_ORDER_KEY)?
            .unwrap_or_default())
    }

    pub fn save_display_order(&self, ids: &[String]) -> Result<(), StorageError> {
        self.put_json(INSTANCE_ORDER_KEY, &ids)
    }

    /// Stored split ratios; a missing or unreadable entry yields the defaults.
    pub fn split_sizes(&self) -> SplitSizes {
        match self.get_json::<SplitSizes>(SPLIT_SIZES_KEY) {
            Ok(Some(sizes)) if sizes_are_sane(&sizes) => sizes,
            _ => SplitSizes::default(),
        }
    }

    pub fn save_split_sizes(&self, sizes: &SplitSizes) -> Result<(), StorageError> {
        self.put_json(SPLIT_SIZES_KEY, sizes)
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

fn sizes_are_sane(sizes: &SplitSizes) -> bool {
    sizes
        .vertical
        .iter()
        .chain(sizes.horizontal.iter())
        .all(|value| value.is_finite() && *value > 0.0 && *value < 100.0)
}

fn parse_timestamp(value: String) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(format!("{value}: {err}")))
}
