//! SQLite-backed cache storage.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

use super::CacheStorage;
use crate::cache::channel::{ReplayChannel, Subscription};
use crate::cache::traits::{now_millis, CacheEntry, CacheKey, CacheValue};

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- One row per cached key, namespaced by box
CREATE TABLE IF NOT EXISTS cache_entries (
    box_name TEXT NOT NULL,
    entry_key TEXT NOT NULL,
    data BLOB NOT NULL,
    store_time INTEGER NOT NULL,
    PRIMARY KEY (box_name, entry_key)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_box ON cache_entries(box_name);
"#;

/// SQLite-based cache storage. Values are stored as JSON.
///
/// Rows keep their insertion order across updates, so `get_all` and the
/// change feed list values in the order keys were first written.
pub struct SqliteStorage<V> {
  conn: Mutex<Connection>,
  box_name: String,
  feed: ReplayChannel<Vec<V>>,
}

impl<V> SqliteStorage<V>
where
  V: CacheValue + Serialize + DeserializeOwned,
{
  /// Open the box `box_name` in the database at the default location.
  pub fn open(box_name: &str) -> Result<Self> {
    Self::open_at(&Self::default_path()?, box_name)
  }

  /// Open the box `box_name` in the database at `path`.
  pub fn open_at(path: &Path, box_name: &str) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn, box_name)
  }

  /// Open a box in a private in-memory database.
  pub fn open_in_memory(box_name: &str) -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::from_connection(conn, box_name)
  }

  fn from_connection(conn: Connection, box_name: &str) -> Result<Self> {
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    let values = load_values(&conn, box_name)?;

    Ok(Self {
      conn: Mutex::new(conn),
      box_name: box_name.to_string(),
      feed: ReplayChannel::with_value(values),
    })
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("keycache").join("cache.db"))
  }

  /// Run `op` on the connection, then publish the box's value list.
  fn mutate(&self, op: impl FnOnce(&Connection) -> Result<()>) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    op(&conn)?;

    let values = load_values(&conn, &self.box_name)?;
    self.feed.publish(values);
    Ok(())
  }
}

/// Read every value of a box in insertion order, skipping rows that no longer
/// deserialize into `V`.
fn load_values<V: DeserializeOwned>(conn: &Connection, box_name: &str) -> Result<Vec<V>> {
  let mut stmt = conn
    .prepare("SELECT entry_key, data FROM cache_entries WHERE box_name = ? ORDER BY rowid")
    .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

  let rows: Vec<(String, Vec<u8>)> = stmt
    .query_map(params![box_name], |row| Ok((row.get(0)?, row.get(1)?)))
    .map_err(|e| eyre!("Failed to query cache entries: {}", e))?
    .collect::<rusqlite::Result<_>>()
    .map_err(|e| eyre!("Failed to read cache entries: {}", e))?;

  Ok(
    rows
      .into_iter()
      .filter_map(|(key, data)| match serde_json::from_slice(&data) {
        Ok(value) => Some(value),
        Err(e) => {
          warn!(box_name, key = %key, error = %e, "Skipping undecodable cache entry");
          None
        }
      })
      .collect(),
  )
}

#[async_trait]
impl<K, V> CacheStorage<K, V> for SqliteStorage<V>
where
  K: CacheKey,
  V: CacheValue + Serialize + DeserializeOwned,
{
  async fn ensure_initialized(&self) -> Result<()> {
    // Migrations already ran when the storage was opened
    Ok(())
  }

  async fn get(&self, key: &K) -> Result<Option<CacheEntry<V>>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<(Vec<u8>, i64)> = conn
      .query_row(
        "SELECT data, store_time FROM cache_entries WHERE box_name = ? AND entry_key = ?",
        params![self.box_name, key.to_string()],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry {}: {}", key, e))?;

    match row {
      Some((data, store_time)) => {
        let value: V = serde_json::from_slice(&data)
          .map_err(|e| eyre!("Failed to deserialize cache entry {}: {}", key, e))?;
        Ok(Some(CacheEntry::new(value, store_time)))
      }
      None => Ok(None),
    }
  }

  async fn put(&self, key: &K, value: V, store_time: Option<i64>) -> Result<()> {
    let data =
      serde_json::to_vec(&value).map_err(|e| eyre!("Failed to serialize cache entry: {}", e))?;
    let store_time = store_time.unwrap_or_else(now_millis);

    self.mutate(|conn| {
      conn
        .execute(
          "INSERT INTO cache_entries (box_name, entry_key, data, store_time)
           VALUES (?, ?, ?, ?)
           ON CONFLICT (box_name, entry_key)
           DO UPDATE SET data = excluded.data, store_time = excluded.store_time",
          params![self.box_name, key.to_string(), data, store_time],
        )
        .map_err(|e| eyre!("Failed to store cache entry {}: {}", key, e))?;
      Ok(())
    })
  }

  async fn delete(&self, key: &K) -> Result<()> {
    self.mutate(|conn| {
      conn
        .execute(
          "DELETE FROM cache_entries WHERE box_name = ? AND entry_key = ?",
          params![self.box_name, key.to_string()],
        )
        .map_err(|e| eyre!("Failed to delete cache entry {}: {}", key, e))?;
      Ok(())
    })
  }

  async fn clear(&self) -> Result<()> {
    self.mutate(|conn| {
      conn
        .execute(
          "DELETE FROM cache_entries WHERE box_name = ?",
          params![self.box_name],
        )
        .map_err(|e| eyre!("Failed to clear cache box {}: {}", self.box_name, e))?;
      Ok(())
    })
  }

  async fn watch(&self) -> Result<Subscription<Vec<V>>> {
    Ok(self.feed.subscribe())
  }

  async fn get_all(&self) -> Result<Vec<V>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    load_values(&conn, &self.box_name)
  }
}
