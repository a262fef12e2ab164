//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::network::Response;

use super::key::RequestKey;
use super::result::CachedEntry;

/// Handle on one named store (one cache generation).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreHandle {
  name: String,
}

impl StoreHandle {
  pub fn new(name: impl Into<String>) -> Self {
    Self { name: name.into() }
  }

  pub fn name(&self) -> &str {
    &self.name
  }
}

/// Trait for cache storage backends.
///
/// A backend holds any number of named stores, each an independent
/// key to response map. Deleting a store deletes its entries with it.
pub trait CacheStorage: Send + Sync {
  /// Open a store, creating it if absent.
  fn open(&self, name: &str) -> Result<StoreHandle>;

  /// Names of every store, oldest first.
  fn store_names(&self) -> Result<Vec<String>>;

  fn has_store(&self, name: &str) -> Result<bool> {
    Ok(self.store_names()?.iter().any(|n| n == name))
  }

  /// Look up the entry for a request.
  fn get(&self, store: &StoreHandle, key: &RequestKey) -> Result<Option<CachedEntry>>;

  /// Store a response, replacing any previous entry for the key.
  /// Responses that are not cacheable are skipped and `false` is returned.
  /// Writing into a store that no longer exists is an error.
  fn put(&self, store: &StoreHandle, key: &RequestKey, response: &Response) -> Result<bool>;

  /// Create (or reuse) a store and write every entry in one transaction.
  ///
  /// The store row is part of that transaction, so a failed write leaves no
  /// empty store behind. Installs go through here rather than `open`.
  fn put_all(&self, name: &str, entries: &[(RequestKey, Response)]) -> Result<StoreHandle>;

  fn entry_count(&self, store: &StoreHandle) -> Result<usize>;

  /// Delete a store and all of its entries. Returns whether it existed.
  fn delete(&self, name: &str) -> Result<bool>;

  /// Name of the store that serves requests, persisted across restarts.
  fn active_store(&self) -> Result<Option<String>>;

  fn set_active_store(&self, name: &str) -> Result<()>;

  /// Delete every store of `namespace` except `current`, returning the deleted names.
  fn delete_stores_except(&self, namespace: &str, current: &StoreHandle) -> Result<Vec<String>> {
    let prefix = format!("{}-", namespace);
    let mut deleted = Vec::new();

    for name in self.store_names()? {
      if name == current.name() || !name.starts_with(&prefix) {
        continue;
      }
      if self.delete(&name)? {
        deleted.push(name);
      }
    }

    Ok(deleted)
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the database at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Private in-memory database, gone when dropped.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;

    Self::with_connection(conn)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("cachet").join("cache.db"))
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- One row per cache generation
CREATE TABLE IF NOT EXISTS stores (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS entries (
    store_name TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    url TEXT NOT NULL,
    method TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (store_name, key_hash),
    FOREIGN KEY (store_name) REFERENCES stores(name) ON DELETE CASCADE
);

-- Single row remembering which generation serves requests
CREATE TABLE IF NOT EXISTS agent_state (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    active_store TEXT
);
"#;

fn insert_entry(
  conn: &Connection,
  store_name: &str,
  key: &RequestKey,
  response: &Response,
) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO entries (store_name, key_hash, url, method, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        store_name,
        key.cache_hash(),
        key.url(),
        RequestKey::METHOD,
        response.status,
        headers,
        response.body,
      ],
    )
    .map_err(|e| eyre!("Failed to store entry {} in {}: {}", key, store_name, e))?;

  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn open(&self, name: &str) -> Result<StoreHandle> {
    let conn = self.lock()?;

    conn
      .execute("INSERT OR IGNORE INTO stores (name) VALUES (?)", params![name])
      .map_err(|e| eyre!("Failed to open store {}: {}", name, e))?;

    Ok(StoreHandle::new(name))
  }

  fn store_names(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT name FROM stores ORDER BY created_at, name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list stores: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read store name: {}", e))?;

    Ok(names)
  }

  fn get(&self, store: &StoreHandle, key: &RequestKey) -> Result<Option<CachedEntry>> {
    let conn = self.lock()?;

    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, cached_at FROM entries
         WHERE store_name = ? AND key_hash = ?",
        params![store.name(), key.cache_hash()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read entry {}: {}", key, e))?;

    match row {
      Some((status, headers, body, cached_at_str)) => {
        let headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers of {}: {}", key, e))?;
        let cached_at = parse_datetime(&cached_at_str)?;
        Ok(Some(CachedEntry {
          response: Response {
            status,
            headers,
            body,
          },
          cached_at,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, store: &StoreHandle, key: &RequestKey, response: &Response) -> Result<bool> {
    if !response.is_cacheable() {
      return Ok(false);
    }

    let conn = self.lock()?;
    insert_entry(&conn, store.name(), key, response)?;

    Ok(true)
  }

  fn put_all(&self, name: &str, entries: &[(RequestKey, Response)]) -> Result<StoreHandle> {
    let mut conn = self.lock()?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("INSERT OR IGNORE INTO stores (name) VALUES (?)", params![name])
      .map_err(|e| eyre!("Failed to open store {}: {}", name, e))?;

    for (key, response) in entries.iter().filter(|(_, r)| r.is_cacheable()) {
      insert_entry(&tx, name, key, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(StoreHandle::new(name))
  }

  fn entry_count(&self, store: &StoreHandle) -> Result<usize> {
    let conn = self.lock()?;

    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM entries WHERE store_name = ?",
        params![store.name()],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries in {}: {}", store.name(), e))?;

    Ok(count as usize)
  }

  fn delete(&self, name: &str) -> Result<bool> {
    let conn = self.lock()?;

    let removed = conn
      .execute("DELETE FROM stores WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete store {}: {}", name, e))?;

    conn
      .execute(
        "UPDATE agent_state SET active_store = NULL WHERE active_store = ?",
        params![name],
      )
      .map_err(|e| eyre!("Failed to clear active store: {}", e))?;

    Ok(removed > 0)
  }

  fn active_store(&self) -> Result<Option<String>> {
    let conn = self.lock()?;

    let active: Option<Option<String>> = conn
      .query_row(
        "SELECT active_store FROM agent_state WHERE id = 1",
        [],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read active store: {}", e))?;

    Ok(active.flatten())
  }

  fn set_active_store(&self, name: &str) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute(
        "INSERT INTO agent_state (id, active_store) VALUES (1, ?)
         ON CONFLICT(id) DO UPDATE SET active_store = excluded.active_store",
        params![name],
      )
      .map_err(|e| eyre!("Failed to record active store {}: {}", name, e))?;

    Ok(())
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
