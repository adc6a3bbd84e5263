//! Durable queue of note saves that could not reach the backend.
//!
//! Entries are only ever appended and flagged as synced; nothing is deleted
//! unless the whole queue is cleared on request.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use rusqlite::{params, Connection, Row};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Mutex;
use url::Url;

use crate::db;
use crate::net::Request;

/// Headers the fetcher adds on its own; never persisted.
const CREDENTIAL_HEADERS: [&str; 2] = ["apikey", "authorization"];

/// A note save waiting for (or done with) replay.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedNote {
  /// Store-assigned, increases with every enqueue
  pub id: i64,
  /// The payload's own `id`, when it has one
  pub note_id: Option<String>,
  pub payload: Value,
  pub enqueued_at: DateTime<Utc>,
  pub synced: bool,
  /// The save request the payload was taken from. Entries without one are
  /// replayed as a POST to the sync endpoint.
  pub target: Option<SaveTarget>,
}

/// Method, URL and headers of an intercepted save, kept so the replay is the
/// same request the page made.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveTarget {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
}

impl SaveTarget {
  /// Capture a request's target, dropping credentials.
  pub fn from_request(request: &Request) -> Self {
    let headers = request
      .headers
      .iter()
      .filter(|(name, _)| {
        !CREDENTIAL_HEADERS
          .iter()
          .any(|h| name.eq_ignore_ascii_case(h))
      })
      .cloned()
      .collect();

    Self {
      method: request.method.clone(),
      url: request.url.clone(),
      headers,
    }
  }
}

enum Location {
  File(PathBuf),
  Memory,
}

/// SQLite-backed offline queue. The connection is opened on first use.
pub struct NoteQueue {
  location: Location,
  conn: Mutex<Option<Connection>>,
}

const QUEUE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS offline_notes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    note_id TEXT,
    payload TEXT NOT NULL,
    enqueued_at TEXT NOT NULL,
    synced INTEGER NOT NULL DEFAULT 0,
    method TEXT,
    url TEXT,
    headers TEXT
);

CREATE INDEX IF NOT EXISTS idx_offline_notes_enqueued ON offline_notes(enqueued_at);
CREATE INDEX IF NOT EXISTS idx_offline_notes_synced ON offline_notes(synced, id);
"#;

impl NoteQueue {
  pub fn new(path: PathBuf) -> Self {
    Self {
      location: Location::File(path),
      conn: Mutex::new(None),
    }
  }

  #[allow(dead_code)]
  pub fn in_memory() -> Self {
    Self {
      location: Location::Memory,
      conn: Mutex::new(None),
    }
  }

  fn connect(&self) -> Result<Connection> {
    match &self.location {
      Location::File(path) => {
        let conn = db::open(path, QUEUE_SCHEMA)?;
        tracing::debug!(path = %path.display(), "opened offline queue");
        Ok(conn)
      }
      Location::Memory => db::open_in_memory(QUEUE_SCHEMA),
    }
  }

  /// Run `f` against the connection, opening it first if needed.
  /// A failed open is retried by the next call.
  fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
    let mut guard = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    if guard.is_none() {
      *guard = Some(self.connect()?);
    }
    let conn = guard
      .as_ref()
      .ok_or_else(|| eyre!("Offline queue is not open"))?;

    f(conn)
  }

  /// Append a payload as a new unsynced entry.
  pub fn enqueue(&self, payload: Value, target: Option<SaveTarget>) -> Result<QueuedNote> {
    let note_id = payload_note_id(&payload);
    // Stored with millisecond precision
    let enqueued_at = Utc::now().trunc_subsecs(3);
    let data =
      serde_json::to_string(&payload).map_err(|e| eyre!("Failed to serialize note: {}", e))?;
    let headers = target
      .as_ref()
      .map(|t| serde_json::to_string(&t.headers))
      .transpose()
      .map_err(|e| eyre!("Failed to serialize save headers: {}", e))?;

    let id = self.with_conn(|conn| {
      conn
        .execute(
          "INSERT INTO offline_notes (note_id, payload, enqueued_at, synced, method, url, headers)
           VALUES (?, ?, ?, 0, ?, ?, ?)",
          params![
            note_id,
            data,
            enqueued_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            target.as_ref().map(|t| t.method.as_str()),
            target.as_ref().map(|t| t.url.as_str()),
            headers,
          ],
        )
        .map_err(|e| eyre!("Failed to enqueue note: {}", e))?;
      Ok(conn.last_insert_rowid())
    })?;

    tracing::info!(entry = id, note_id = note_id.as_deref().unwrap_or("-"), "note queued for sync");

    Ok(QueuedNote {
      id,
      note_id,
      payload,
      enqueued_at,
      synced: false,
      target,
    })
  }

  /// Unsynced entries in enqueue order.
  pub fn unsynced(&self) -> Result<Vec<QueuedNote>> {
    self.query(&format!(
      "SELECT {} FROM offline_notes WHERE synced = 0 ORDER BY id",
      ENTRY_COLUMNS
    ))
  }

  /// Every entry, synced or not, in enqueue order.
  pub fn all(&self) -> Result<Vec<QueuedNote>> {
    self.query(&format!(
      "SELECT {} FROM offline_notes ORDER BY id",
      ENTRY_COLUMNS
    ))
  }

  pub fn count_unsynced(&self) -> Result<usize> {
    self.with_conn(|conn| {
      conn
        .query_row(
          "SELECT COUNT(*) FROM offline_notes WHERE synced = 0",
          [],
          |row| row.get::<_, i64>(0),
        )
        .map(|n| n as usize)
        .map_err(|e| eyre!("Failed to count queued notes: {}", e))
    })
  }

  /// Flag an entry as replayed.
  pub fn mark_synced(&self, entry: &mut QueuedNote) -> Result<()> {
    let updated = self.with_conn(|conn| {
      conn
        .execute(
          "UPDATE offline_notes SET synced = 1 WHERE id = ?",
          params![entry.id],
        )
        .map_err(|e| eyre!("Failed to mark entry {} synced: {}", entry.id, e))
    })?;

    if updated == 0 {
      return Err(eyre!("Queued entry {} no longer exists", entry.id));
    }
    entry.synced = true;
    Ok(())
  }

  /// Drop every entry. Returns how many were removed.
  pub fn clear(&self) -> Result<usize> {
    self.with_conn(|conn| {
      conn
        .execute("DELETE FROM offline_notes", [])
        .map_err(|e| eyre!("Failed to clear offline queue: {}", e))
    })
  }

  fn query(&self, sql: &str) -> Result<Vec<QueuedNote>> {
    self.with_conn(|conn| {
      let mut stmt = conn
        .prepare(sql)
        .map_err(|e| eyre!("Failed to prepare queue query: {}", e))?;

      let rows: Vec<RawEntry> = stmt
        .query_map([], RawEntry::from_row)
        .map_err(|e| eyre!("Failed to read offline queue: {}", e))?
        .collect::<rusqlite::Result<_>>()
        .map_err(|e| eyre!("Failed to read queued entry: {}", e))?;

      rows.into_iter().map(RawEntry::into_note).collect()
    })
  }
}

const ENTRY_COLUMNS: &str = "id, note_id, payload, enqueued_at, synced, method, url, headers";

struct RawEntry {
  id: i64,
  note_id: Option<String>,
  payload: String,
  enqueued_at: String,
  synced: bool,
  method: Option<String>,
  url: Option<String>,
  headers: Option<String>,
}

impl RawEntry {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      note_id: row.get(1)?,
      payload: row.get(2)?,
      enqueued_at: row.get(3)?,
      synced: row.get(4)?,
      method: row.get(5)?,
      url: row.get(6)?,
      headers: row.get(7)?,
    })
  }

  fn into_note(self) -> Result<QueuedNote> {
    let payload = serde_json::from_str(&self.payload)
      .map_err(|e| eyre!("Corrupt payload in queued entry {}: {}", self.id, e))?;
    let enqueued_at = DateTime::parse_from_rfc3339(&self.enqueued_at)
      .map(|dt| dt.with_timezone(&Utc))
      .map_err(|e| eyre!("Failed to parse datetime '{}': {}", self.enqueued_at, e))?;

    let target = match (self.method, self.url) {
      (Some(method), Some(url)) => Some(SaveTarget {
        method: Method::from_bytes(method.as_bytes())
          .map_err(|e| eyre!("Invalid method '{}' in queued entry {}: {}", method, self.id, e))?,
        url: Url::parse(&url)
          .map_err(|e| eyre!("Invalid url '{}' in queued entry {}: {}", url, self.id, e))?,
        headers: match self.headers {
          Some(headers) => serde_json::from_str(&headers)
            .map_err(|e| eyre!("Corrupt headers in queued entry {}: {}", self.id, e))?,
          None => Vec::new(),
        },
      }),
      _ => None,
    };

    Ok(QueuedNote {
      id: self.id,
      note_id: self.note_id,
      payload,
      enqueued_at,
      synced: self.synced,
      target,
    })
  }
}

fn payload_note_id(payload: &Value) -> Option<String> {
  match payload.get("id")? {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_enqueue_and_list_unsynced() {
    let queue = NoteQueue::in_memory();
    let a = queue.enqueue(json!({ "id": "n1", "content": "a" }), None).unwrap();
    let b = queue.enqueue(json!({ "title": "untitled" }), None).unwrap();

    assert_eq!(a.note_id.as_deref(), Some("n1"));
    assert_eq!(b.note_id, None);
    assert!(b.id > a.id);

    let unsynced = queue.unsynced().unwrap();
    assert_eq!(unsynced, vec![a, b]);
  }

  #[test]
  fn test_duplicates_are_kept_in_order() {
    let queue = NoteQueue::in_memory();
    queue.enqueue(json!({ "id": 7, "content": "first" }), None).unwrap();
    queue.enqueue(json!({ "id": 7, "content": "second" }), None).unwrap();

    let unsynced = queue.unsynced().unwrap();
    assert_eq!(unsynced.len(), 2);
    assert_eq!(unsynced[0].note_id.as_deref(), Some("7"));
    assert_eq!(unsynced[0].payload["content"], "first");
    assert_eq!(unsynced[1].payload["content"], "second");
  }

  #[test]
  fn test_mark_synced_hides_entry() {
    let queue = NoteQueue::in_memory();
    let mut entry = queue.enqueue(json!({ "id": "n1" }), None).unwrap();
    queue.enqueue(json!({ "id": "n2" }), None).unwrap();

    queue.mark_synced(&mut entry).unwrap();

    assert!(entry.synced);
    assert_eq!(queue.count_unsynced().unwrap(), 1);
    assert_eq!(queue.unsynced().unwrap()[0].note_id.as_deref(), Some("n2"));

    // Synced entries stay in the store
    let all = queue.all().unwrap();
    assert_eq!(all.len(), 2);
    assert!(all[0].synced);
  }

  #[test]
  fn test_mark_synced_missing_entry_is_error() {
    let queue = NoteQueue::in_memory();
    let mut entry = queue.enqueue(json!({}), None).unwrap();
    queue.clear().unwrap();

    assert!(queue.mark_synced(&mut entry).is_err());
    assert!(!entry.synced);
  }

  #[test]
  fn test_entries_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("offline.db");

    {
      let queue = NoteQueue::new(path.clone());
      queue.enqueue(json!({ "id": "n1", "content": "draft" }), None).unwrap();
    }

    let queue = NoteQueue::new(path);
    let unsynced = queue.unsynced().unwrap();
    assert_eq!(unsynced.len(), 1);
    assert_eq!(unsynced[0].payload["content"], "draft");
  }

  #[test]
  fn test_save_target_survives_reopen_without_credentials() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("offline.db");
    let request = Request::new(
      Method::PATCH,
      Url::parse("https://abc.supabase.co/rest/v1/notes?id=eq.5").unwrap(),
    )
    .with_header("Prefer", "return=representation")
    .with_header("apikey", "SECRET")
    .with_header("authorization", "Bearer user-token");

    {
      let queue = NoteQueue::new(path.clone());
      queue
        .enqueue(json!({ "content": "edited" }), Some(SaveTarget::from_request(&request)))
        .unwrap();
    }

    let queue = NoteQueue::new(path);
    let target = queue.unsynced().unwrap().remove(0).target.unwrap();
    assert_eq!(target.method, Method::PATCH);
    assert_eq!(target.url.as_str(), "https://abc.supabase.co/rest/v1/notes?id=eq.5");
    assert_eq!(
      target.headers,
      vec![("Prefer".to_string(), "return=representation".to_string())]
    );
  }

  #[test]
  fn test_open_failure_is_returned_and_retried() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"not a directory").unwrap();

    let queue = NoteQueue::new(blocker.join("offline.db"));
    assert!(queue.enqueue(json!({}), None).is_err());
    assert!(queue.unsynced().is_err());
  }
}
