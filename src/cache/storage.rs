//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use super::traits::CachedEntry;
use crate::http::{hash_key, Request, Response};

/// Trait for cache storage backends.
///
/// Partitions hold entries in insertion order; re-putting a key moves it to
/// the end.
pub trait CacheStorage: Send + Sync + 'static {
  /// Create the partition if it does not exist.
  fn open_partition(&self, name: &str) -> Result<()>;

  /// Names of all partitions, sorted.
  fn partition_names(&self) -> Result<Vec<String>>;

  /// Delete a partition and all of its entries. Returns whether it existed.
  fn delete_partition(&self, name: &str) -> Result<bool>;

  /// Store an entry, replacing any entry with the same key.
  fn put(&self, partition: &str, request: &Request, response: &Response) -> Result<()>;

  /// Look up an entry in one partition.
  fn get(&self, partition: &str, key: &str) -> Result<Option<CachedEntry>>;

  /// Look up an entry in any partition, first partition by name wins.
  fn find(&self, key: &str) -> Result<Option<CachedEntry>>;

  /// Stored requests in enumeration (insertion) order.
  fn keys(&self, partition: &str) -> Result<Vec<Request>>;

  /// Delete one entry. Returns whether it existed.
  fn delete(&self, partition: &str, key: &str) -> Result<bool>;

  /// Number of entries in a partition.
  fn count(&self, partition: &str) -> Result<usize>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// A throwaway database, used by tests.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;

    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS partitions (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- seq gives the enumeration order used for oldest-first eviction
CREATE TABLE IF NOT EXISTS entries (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    partition TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    request BLOB NOT NULL,
    response BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE (partition, key_hash)
);

CREATE INDEX IF NOT EXISTS idx_entries_partition ON entries(partition, seq);
CREATE INDEX IF NOT EXISTS idx_entries_key ON entries(key_hash);
"#;

impl CacheStorage for SqliteStorage {
  fn open_partition(&self, name: &str) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute(
        "INSERT OR IGNORE INTO partitions (name) VALUES (?)",
        params![name],
      )
      .map_err(|e| eyre!("Failed to open partition {}: {}", name, e))?;

    Ok(())
  }

  fn partition_names(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT name FROM partitions ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list partitions: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read partition name: {}", e))?;

    Ok(names)
  }

  fn delete_partition(&self, name: &str) -> Result<bool> {
    let mut conn = self.lock()?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM entries WHERE partition = ?", params![name])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;
    let removed = tx
      .execute("DELETE FROM partitions WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete partition {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn put(&self, partition: &str, request: &Request, response: &Response) -> Result<()> {
    let mut conn = self.lock()?;
    let key_hash = request.key_hash();
    let request_data =
      serde_json::to_vec(request).map_err(|e| eyre!("Failed to serialize request: {}", e))?;
    let response_data =
      serde_json::to_vec(response).map_err(|e| eyre!("Failed to serialize response: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO partitions (name) VALUES (?)",
      params![partition],
    )
    .map_err(|e| eyre!("Failed to open partition {}: {}", partition, e))?;

    // Delete then insert so a replaced entry moves to the end of the order
    tx.execute(
      "DELETE FROM entries WHERE partition = ? AND key_hash = ?",
      params![partition, key_hash],
    )
    .map_err(|e| eyre!("Failed to replace entry: {}", e))?;

    tx.execute(
      "INSERT INTO entries (partition, key_hash, request, response, cached_at)
       VALUES (?, ?, ?, ?, datetime('now'))",
      params![partition, key_hash, request_data, response_data],
    )
    .map_err(|e| eyre!("Failed to store entry: {}", e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn get(&self, partition: &str, key: &str) -> Result<Option<CachedEntry>> {
    let conn = self.lock()?;

    let row: Option<(Vec<u8>, Vec<u8>, String)> = conn
      .query_row(
        "SELECT request, response, cached_at FROM entries
         WHERE partition = ? AND key_hash = ?",
        params![partition, hash_key(key)],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up entry: {}", e))?;

    row.map(decode_entry).transpose()
  }

  fn find(&self, key: &str) -> Result<Option<CachedEntry>> {
    let conn = self.lock()?;

    let row: Option<(Vec<u8>, Vec<u8>, String)> = conn
      .query_row(
        "SELECT request, response, cached_at FROM entries
         WHERE key_hash = ?
         ORDER BY partition
         LIMIT 1",
        params![hash_key(key)],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up entry: {}", e))?;

    row.map(decode_entry).transpose()
  }

  fn keys(&self, partition: &str) -> Result<Vec<Request>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT request FROM entries WHERE partition = ? ORDER BY seq")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params![partition], |row| row.get::<_, Vec<u8>>(0))
      .map_err(|e| eyre!("Failed to list entries of {}: {}", partition, e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read entry: {}", e))?;

    rows
      .iter()
      .map(|data| {
        serde_json::from_slice(data).map_err(|e| eyre!("Failed to deserialize request: {}", e))
      })
      .collect()
  }

  fn delete(&self, partition: &str, key: &str) -> Result<bool> {
    let conn = self.lock()?;

    let removed = conn
      .execute(
        "DELETE FROM entries WHERE partition = ? AND key_hash = ?",
        params![partition, hash_key(key)],
      )
      .map_err(|e| eyre!("Failed to delete entry: {}", e))?;

    Ok(removed > 0)
  }

  fn count(&self, partition: &str) -> Result<usize> {
    let conn = self.lock()?;

    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM entries WHERE partition = ?",
        params![partition],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries of {}: {}", partition, e))?;

    Ok(count as usize)
  }
}

fn decode_entry((request, response, cached_at): (Vec<u8>, Vec<u8>, String)) -> Result<CachedEntry> {
  Ok(CachedEntry {
    request: serde_json::from_slice(&request)
      .map_err(|e| eyre!("Failed to deserialize request: {}", e))?,
    response: serde_json::from_slice(&response)
      .map_err(|e| eyre!("Failed to deserialize response: {}", e))?,
    cached_at: parse_datetime(&cached_at)?,
  })
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
