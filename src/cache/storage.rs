//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::db;
use crate::net::Response;

use super::traits::PartitionPurpose;

/// A response read back from a partition.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: Response,
  /// When the response was stored
  pub cached_at: DateTime<Utc>,
}

/// Summary of one partition.
#[derive(Debug, Clone)]
pub struct PartitionInfo {
  pub name: String,
  /// None when the partition was created implicitly by a write
  pub purpose: Option<PartitionPurpose>,
  pub entries: usize,
  pub created_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
pub trait CacheStorage: Send + Sync + 'static {
  /// Create the partition if it does not exist yet.
  fn open_partition(&self, name: &str, purpose: PartitionPurpose) -> Result<()>;

  /// All partitions, ordered by name.
  fn partitions(&self) -> Result<Vec<PartitionInfo>>;

  /// Delete a partition and its entries. Returns whether it existed.
  fn delete_partition(&self, name: &str) -> Result<bool>;

  /// Look up a stored response.
  fn get(&self, partition: &str, key: &str) -> Result<Option<CachedResponse>>;

  /// Store a response, replacing any previous one under the same key.
  fn put(&self, partition: &str, key: &str, url: &str, response: &Response) -> Result<()>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    let conn = db::open(path, CACHE_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  #[allow(dead_code)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = db::open_in_memory(CACHE_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Named, versioned buckets
CREATE TABLE IF NOT EXISTS partitions (
    name TEXT PRIMARY KEY,
    purpose TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Stored responses, one per request key per partition
CREATE TABLE IF NOT EXISTS cache_entries (
    partition_name TEXT NOT NULL,
    request_key TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (partition_name, request_key),
    FOREIGN KEY (partition_name) REFERENCES partitions(name) ON DELETE CASCADE
);
"#;

impl CacheStorage for SqliteStorage {
  fn open_partition(&self, name: &str, purpose: PartitionPurpose) -> Result<()> {
    let conn = self.conn()?;

    conn
      .execute(
        "INSERT INTO partitions (name, purpose) VALUES (?, ?)
         ON CONFLICT(name) DO UPDATE SET purpose = COALESCE(partitions.purpose, excluded.purpose)",
        params![name, purpose.as_str()],
      )
      .map_err(|e| eyre!("Failed to open partition {}: {}", name, e))?;

    Ok(())
  }

  fn partitions(&self) -> Result<Vec<PartitionInfo>> {
    let conn = self.conn()?;

    let mut stmt = conn
      .prepare(
        "SELECT p.name, p.purpose, p.created_at, COUNT(e.request_key)
         FROM partitions p
         LEFT JOIN cache_entries e ON e.partition_name = p.name
         GROUP BY p.name
         ORDER BY p.name",
      )
      .map_err(|e| eyre!("Failed to prepare partition query: {}", e))?;

    let rows: Vec<(String, Option<String>, String, i64)> = stmt
      .query_map([], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .map_err(|e| eyre!("Failed to list partitions: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read partition row: {}", e))?;

    rows
      .into_iter()
      .map(|(name, purpose, created_at, entries)| {
        Ok(PartitionInfo {
          name,
          purpose: purpose.as_deref().and_then(PartitionPurpose::parse),
          entries: entries as usize,
          created_at: parse_datetime(&created_at)?,
        })
      })
      .collect()
  }

  fn delete_partition(&self, name: &str) -> Result<bool> {
    let conn = self.conn()?;

    let deleted = conn
      .execute("DELETE FROM partitions WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete partition {}: {}", name, e))?;

    Ok(deleted > 0)
  }

  fn get(&self, partition: &str, key: &str) -> Result<Option<CachedResponse>> {
    let conn = self.conn()?;

    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, cached_at FROM cache_entries
         WHERE partition_name = ? AND request_key = ?",
        params![partition, key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;

    match row {
      Some((status, headers, body, cached_at)) => {
        let headers: Vec<(String, String)> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize cached headers: {}", e))?;
        Ok(Some(CachedResponse {
          response: Response {
            status,
            headers,
            body,
          },
          cached_at: parse_datetime(&cached_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, partition: &str, key: &str, url: &str, response: &Response) -> Result<()> {
    let conn = self.conn()?;
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        "INSERT OR IGNORE INTO partitions (name) VALUES (?)",
        params![partition],
      )
      .map_err(|e| eyre!("Failed to open partition {}: {}", partition, e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO cache_entries (partition_name, request_key, url, status, headers, body, cached_at)
         VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
        params![partition, key, url, response.status, headers, response.body],
      )
      .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

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
