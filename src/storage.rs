//! Durable storage for queue metadata and cache snapshots.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;

use crate::cache::{CacheEntry, CacheKey};
use crate::queue::RequestRecord;

/// Storage slot holding the request queue's metadata record.
pub const QUEUE_SLOT: &str = "request_queue";

/// Trait for storage backends.
///
/// Calls are synchronous and expected to be quick; callers never hold a lock
/// from another component while calling into storage.
pub trait Storage: Send + Sync {
  /// Replace the persisted queue metadata.
  fn save_queue(&self, records: &[RequestRecord]) -> Result<()>;

  /// Load the persisted queue metadata, empty if none was written.
  fn load_queue(&self) -> Result<Vec<RequestRecord>>;

  /// Replace the persisted cache snapshot.
  fn save_entries(&self, entries: &[CacheEntry]) -> Result<()>;

  /// Load the persisted cache snapshot.
  fn load_entries(&self) -> Result<Vec<CacheEntry>>;

  /// Remove everything this backend has stored.
  fn clear(&self) -> Result<()>;
}

/// Storage implementation that doesn't persist anything.
/// Used when persistence is disabled - all operations are no-ops.
pub struct NoopStorage;

impl Storage for NoopStorage {
  fn save_queue(&self, _records: &[RequestRecord]) -> Result<()> {
    Ok(()) // Discard
  }

  fn load_queue(&self) -> Result<Vec<RequestRecord>> {
    Ok(Vec::new())
  }

  fn save_entries(&self, _entries: &[CacheEntry]) -> Result<()> {
    Ok(()) // Discard
  }

  fn load_entries(&self) -> Result<Vec<CacheEntry>> {
    Ok(Vec::new())
  }

  fn clear(&self) -> Result<()> {
    Ok(())
  }
}

/// In-process storage, useful for tests and for inspecting what would be written.
#[derive(Default)]
pub struct MemoryStorage {
  queue: Mutex<Vec<RequestRecord>>,
  entries: Mutex<Vec<CacheEntry>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }
}

impl Storage for MemoryStorage {
  fn save_queue(&self, records: &[RequestRecord]) -> Result<()> {
    *self.queue.lock() = records.to_vec();
    Ok(())
  }

  fn load_queue(&self) -> Result<Vec<RequestRecord>> {
    Ok(self.queue.lock().clone())
  }

  fn save_entries(&self, entries: &[CacheEntry]) -> Result<()> {
    *self.entries.lock() = entries.to_vec();
    Ok(())
  }

  fn load_entries(&self) -> Result<Vec<CacheEntry>> {
    Ok(self.entries.lock().clone())
  }

  fn clear(&self) -> Result<()> {
    self.queue.lock().clear();
    self.entries.lock().clear();
    Ok(())
  }
}

/// SQLite-based storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open or create the database at `path`, creating parent directories.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create storage directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Run database migrations.
  fn run_migrations(&self) -> Result<()> {
    self
      .conn
      .lock()
      .execute_batch(SCHEMA)
      .map_err(|e| eyre!("Failed to run migrations: {}", e))?;
    Ok(())
  }
}

/// Schema for persisted state.
const SCHEMA: &str = r#"
-- One JSON record per slot; the queue rewrites its slot on every change
CREATE TABLE IF NOT EXISTS queue_state (
    slot TEXT PRIMARY KEY,
    records TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Cache snapshot, keyed by the SHA-256 of the cache key
CREATE TABLE IF NOT EXISTS cache_entries (
    key_hash TEXT PRIMARY KEY,
    cache_key TEXT NOT NULL,
    data BLOB,
    fetched_at TEXT NOT NULL,
    is_invalidated INTEGER NOT NULL DEFAULT 0
);
"#;

impl Storage for SqliteStorage {
  fn save_queue(&self, records: &[RequestRecord]) -> Result<()> {
    let json =
      serde_json::to_string(records).map_err(|e| eyre!("Failed to serialize queue: {}", e))?;

    self
      .conn
      .lock()
      .execute(
        "INSERT OR REPLACE INTO queue_state (slot, records, updated_at)
         VALUES (?, ?, datetime('now'))",
        params![QUEUE_SLOT, json],
      )
      .map_err(|e| eyre!("Failed to store queue state: {}", e))?;

    Ok(())
  }

  fn load_queue(&self) -> Result<Vec<RequestRecord>> {
    let conn = self.conn.lock();

    let mut stmt = conn
      .prepare("SELECT records FROM queue_state WHERE slot = ?")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let json: String = match stmt.query_row(params![QUEUE_SLOT], |row| row.get(0)) {
      Ok(json) => json,
      Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(Vec::new()),
      Err(e) => return Err(eyre!("Failed to read queue state: {}", e)),
    };

    serde_json::from_str(&json).map_err(|e| eyre!("Failed to parse queue state: {}", e))
  }

  fn save_entries(&self, entries: &[CacheEntry]) -> Result<()> {
    let conn = self.conn.lock();

    // Rolled back on drop if anything below fails
    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM cache_entries", [])
      .map_err(|e| eyre!("Failed to clear cache snapshot: {}", e))?;

    for entry in entries {
      let key =
        serde_json::to_string(&entry.key).map_err(|e| eyre!("Failed to serialize key: {}", e))?;
      let data = entry
        .data
        .as_ref()
        .map(serde_json::to_vec)
        .transpose()
        .map_err(|e| eyre!("Failed to serialize entry {}: {}", entry.key, e))?;

      tx.execute(
        "INSERT OR REPLACE INTO cache_entries (key_hash, cache_key, data, fetched_at, is_invalidated)
         VALUES (?, ?, ?, ?, ?)",
        params![
          entry.key.cache_hash(),
          key,
          data,
          entry.fetched_at.to_rfc3339(),
          entry.is_invalidated
        ],
      )
      .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn load_entries(&self) -> Result<Vec<CacheEntry>> {
    let conn = self.conn.lock();

    let mut stmt = conn
      .prepare("SELECT cache_key, data, fetched_at, is_invalidated FROM cache_entries")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<(String, Option<Vec<u8>>, String, bool)> = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))
      .map_err(|e| eyre!("Failed to query cache entries: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read cache entry row: {}", e))?;

    let mut entries = Vec::with_capacity(rows.len());
    for (key, data, fetched_at, is_invalidated) in rows {
      let key: CacheKey =
        serde_json::from_str(&key).map_err(|e| eyre!("Failed to parse cache key: {}", e))?;
      let data = data
        .map(|bytes| serde_json::from_slice(&bytes))
        .transpose()
        .map_err(|e| eyre!("Failed to parse cache entry {}: {}", key, e))?;

      entries.push(CacheEntry {
        key,
        data,
        fetched_at: parse_datetime(&fetched_at)?,
        is_active: false,
        is_invalidated,
      });
    }

    Ok(entries)
  }

  fn clear(&self) -> Result<()> {
    self
      .conn
      .lock()
      .execute_batch("DELETE FROM queue_state; DELETE FROM cache_entries;")
      .map_err(|e| eyre!("Failed to clear storage: {}", e))?;
    Ok(())
  }
}

/// Parse an RFC 3339 timestamp written by this module.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::queue::{Priority, RequestId};
  use serde_json::json;

  fn record(id: u64, priority: Priority) -> RequestRecord {
    RequestRecord {
      id: RequestId::new(id),
      retry_count: 0,
      max_retries: 3,
      priority,
      timestamp: Utc::now(),
    }
  }

  fn entry(parts: &[&str], data: Option<serde_json::Value>) -> CacheEntry {
    CacheEntry {
      key: CacheKey::new(parts.iter().copied()),
      data,
      fetched_at: parse_datetime("2024-05-01T10:00:00+00:00").unwrap(),
      is_active: false,
      is_invalidated: false,
    }
  }

  #[test]
  fn test_sqlite_queue_round_trip_and_overwrite() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    assert!(storage.load_queue().unwrap().is_empty());

    let records = vec![record(1, Priority::High), record(2, Priority::Low)];
    storage.save_queue(&records).unwrap();
    assert_eq!(storage.load_queue().unwrap(), records);

    // Single slot: a later write replaces the earlier one
    storage.save_queue(&records[1..]).unwrap();
    assert_eq!(storage.load_queue().unwrap(), records[1..].to_vec());
  }

  #[test]
  fn test_sqlite_entries_preserve_data_and_timestamps() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let mut stale = entry(&["users", "list"], Some(json!([{"id": 1}])));
    stale.is_invalidated = true;
    let empty = entry(&["users", "detail", "9"], None);

    storage.save_entries(&[stale.clone(), empty.clone()]).unwrap();
    let mut loaded = storage.load_entries().unwrap();
    loaded.sort_by(|a, b| a.key.cmp(&b.key));

    assert_eq!(loaded, vec![empty, stale]);
  }

  #[test]
  fn test_sqlite_file_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("state.db");

    {
      let storage = SqliteStorage::open(&path).unwrap();
      storage.save_queue(&[record(5, Priority::Normal)]).unwrap();
    }

    let storage = SqliteStorage::open(&path).unwrap();
    assert_eq!(storage.load_queue().unwrap().len(), 1);

    storage.clear().unwrap();
    assert!(storage.load_queue().unwrap().is_empty());
  }

  #[test]
  fn test_sqlite_unreadable_queue_slot_is_an_error() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage
      .conn
      .lock()
      .execute(
        "INSERT INTO queue_state (slot, records) VALUES (?, X'00FF')",
        params![QUEUE_SLOT],
      )
      .unwrap();

    assert!(storage.load_queue().is_err());
  }

  #[test]
  fn test_sqlite_unreadable_entry_row_is_an_error() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage
      .save_entries(&[entry(&["users", "list"], Some(json!([])))])
      .unwrap();
    storage
      .conn
      .lock()
      .execute(
        "INSERT INTO cache_entries (key_hash, cache_key, data, fetched_at, is_invalidated)
         VALUES ('h', '[\"x\"]', NULL, '2024-05-01T10:00:00+00:00', 'not-a-bool')",
        [],
      )
      .unwrap();

    assert!(storage.load_entries().is_err());
  }

  #[test]
  fn test_noop_storage_discards() {
    let storage = NoopStorage;
    storage.save_queue(&[record(1, Priority::Normal)]).unwrap();
    assert!(storage.load_queue().unwrap().is_empty());
  }
}
