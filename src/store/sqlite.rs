//! SQLite-backed local store.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::warn;

use super::traits::{LocalStore, QueueContents, StoreError, StoreResult, UnreadableMutation};
use crate::model::{CachedEntity, CachedItem, CachedList, Item, List};
use crate::mutation::{Mutation, MutationKind, NewMutation, QueuedMutation};

/// SQLite-based store implementation.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open the store at the default location.
  pub fn open_default() -> StoreResult<Self> {
    let path = Self::default_path()?;
    Self::open(&path)
  }

  /// Open or create the store at `path`.
  pub fn open(path: &Path) -> StoreResult<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        StoreError::Unavailable(format!("failed to create cache directory: {}", e))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      StoreError::Unavailable(format!(
        "failed to open cache database at {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory database. Not durable; mostly for tests.
  pub fn open_in_memory() -> StoreResult<Self> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> StoreResult<Self> {
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  /// Default database path under the platform data directory.
  pub fn default_path() -> StoreResult<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| StoreError::Unavailable("could not determine data directory".to_string()))?;

    Ok(data_dir.join("listsync").join("cache.db"))
  }

  fn run_migrations(&self) -> StoreResult<()> {
    let conn = self.lock()?;
    conn.execute_batch(STORE_SCHEMA)?;
    Ok(())
  }

  fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| StoreError::Unavailable(format!("lock poisoned: {}", e)))
  }
}

/// Schema for snapshot and queue tables.
const STORE_SCHEMA: &str = r#"
PRAGMA synchronous = FULL;

CREATE TABLE IF NOT EXISTS lists (
    id TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    position INTEGER NOT NULL,
    cached_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS items (
    id TEXT PRIMARY KEY,
    list_id TEXT NOT NULL,
    data BLOB NOT NULL,
    position INTEGER NOT NULL,
    cached_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_items_list ON items(list_id, position);

-- AUTOINCREMENT keeps ids monotonic even after the tail is dequeued
CREATE TABLE IF NOT EXISTS mutation_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    payload BLOB NOT NULL,
    enqueued_at TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0
);
"#;

fn encode<T: serde::Serialize>(key: &str, value: &T) -> StoreResult<Vec<u8>> {
  serde_json::to_vec(value).map_err(|e| StoreError::Corrupt {
    key: key.to_string(),
    message: e.to_string(),
  })
}

fn decode<T: serde::de::DeserializeOwned>(key: &str, data: &[u8]) -> StoreResult<T> {
  serde_json::from_slice(data).map_err(|e| StoreError::Corrupt {
    key: key.to_string(),
    message: e.to_string(),
  })
}

/// Parse a timestamp written by this store.
fn parse_datetime(s: &str) -> StoreResult<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| StoreError::Corrupt {
      key: s.to_string(),
      message: format!("bad timestamp: {}", e),
    })
}

/// A `mutation_queue` row before decoding.
struct QueueRow {
  id: i64,
  kind: Option<String>,
  payload: Option<Vec<u8>>,
  enqueued_at: Option<String>,
  retry_count: Option<u32>,
}

impl QueueRow {
  fn decode(self) -> StoreResult<QueuedMutation> {
    let key = format!("mutation {}", self.id);
    let missing = |column: &str| StoreError::Corrupt {
      key: key.clone(),
      message: format!("unreadable {} column", column),
    };

    let kind: MutationKind = self
      .kind
      .ok_or_else(|| missing("kind"))?
      .parse()
      .map_err(|message| StoreError::Corrupt {
        key: key.clone(),
        message,
      })?;
    let payload = self.payload.ok_or_else(|| missing("payload"))?;
    let mutation: Mutation = decode(&key, &payload)?;
    if mutation.kind() != kind {
      return Err(StoreError::Corrupt {
        key: key.clone(),
        message: format!("kind column {} does not match payload", kind),
      });
    }
    let enqueued_at = parse_datetime(&self.enqueued_at.ok_or_else(|| missing("enqueued_at"))?)?;
    let retry_count = self.retry_count.ok_or_else(|| missing("retry_count"))?;

    Ok(QueuedMutation {
      id: self.id,
      mutation,
      enqueued_at,
      retry_count,
    })
  }
}

fn row_to_cached<T: serde::de::DeserializeOwned>(
  id: &str,
  data: &[u8],
  cached_at: &str,
) -> StoreResult<CachedEntity<T>> {
  Ok(CachedEntity {
    entity: decode(id, data)?,
    cached_at: parse_datetime(cached_at)?,
  })
}

fn insert_item(tx: &Transaction<'_>, item: &Item, position: i64, now: &str) -> StoreResult<()> {
  let data = encode(&item.id, item)?;
  tx.execute(
    "INSERT OR REPLACE INTO items (id, list_id, data, position, cached_at)
     VALUES (?, ?, ?, ?, ?)",
    params![item.id, item.list_id, data, position, now],
  )?;
  Ok(())
}

/// Position for an upserted item: keep its slot, or append to its list.
fn item_position(tx: &Transaction<'_>, item: &Item) -> StoreResult<i64> {
  let existing: Option<i64> = tx
    .query_row(
      "SELECT position FROM items WHERE id = ? AND list_id = ?",
      params![item.id, item.list_id],
      |row| row.get(0),
    )
    .optional()?;

  match existing {
    Some(position) => Ok(position),
    None => Ok(tx.query_row(
      "SELECT COALESCE(MAX(position) + 1, 0) FROM items WHERE list_id = ?",
      params![item.list_id],
      |row| row.get(0),
    )?),
  }
}

impl LocalStore for SqliteStore {
  fn is_durable(&self) -> bool {
    true
  }

  fn put_list(&self, list: &List) -> StoreResult<()> {
    let conn = self.lock()?;
    let data = encode(&list.id, list)?;
    let now = Utc::now().to_rfc3339();

    conn.execute(
      "INSERT INTO lists (id, data, position, cached_at)
       VALUES (?1, ?2, (SELECT COALESCE(MAX(position) + 1, 0) FROM lists), ?3)
       ON CONFLICT(id) DO UPDATE SET data = excluded.data, cached_at = excluded.cached_at",
      params![list.id, data, now],
    )?;

    Ok(())
  }

  fn get_list(&self, id: &str) -> StoreResult<Option<CachedList>> {
    let conn = self.lock()?;

    let row: Option<(Vec<u8>, String)> = conn
      .query_row(
        "SELECT data, cached_at FROM lists WHERE id = ?",
        params![id],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()?;

    row
      .map(|(data, cached_at)| row_to_cached(id, &data, &cached_at))
      .transpose()
  }

  fn get_all_lists(&self) -> StoreResult<Vec<CachedList>> {
    let conn = self.lock()?;

    let mut stmt = conn.prepare("SELECT id, data, cached_at FROM lists ORDER BY position, id")?;
    let rows: Vec<(String, Vec<u8>, String)> = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
      .collect::<Result<_, _>>()?;

    rows
      .iter()
      .map(|(id, data, cached_at)| row_to_cached(id, data, cached_at))
      .collect()
  }

  fn remove_list(&self, id: &str) -> StoreResult<()> {
    let conn = self.lock()?;
    conn.execute("DELETE FROM lists WHERE id = ?", params![id])?;
    Ok(())
  }

  fn put_all_lists(&self, lists: &[List]) -> StoreResult<()> {
    let mut conn = self.lock()?;
    let now = Utc::now().to_rfc3339();

    let tx = conn.transaction()?;
    tx.execute("DELETE FROM lists", [])?;
    for (position, list) in lists.iter().enumerate() {
      let data = encode(&list.id, list)?;
      tx.execute(
        "INSERT OR REPLACE INTO lists (id, data, position, cached_at) VALUES (?, ?, ?, ?)",
        params![list.id, data, position as i64, now],
      )?;
    }
    tx.commit()?;

    Ok(())
  }

  fn put_item(&self, item: &Item) -> StoreResult<()> {
    let mut conn = self.lock()?;
    let now = Utc::now().to_rfc3339();

    let tx = conn.transaction()?;
    let position = item_position(&tx, item)?;
    insert_item(&tx, item, position, &now)?;
    tx.commit()?;

    Ok(())
  }

  fn get_item(&self, id: &str) -> StoreResult<Option<CachedItem>> {
    let conn = self.lock()?;

    let row: Option<(Vec<u8>, String)> = conn
      .query_row(
        "SELECT data, cached_at FROM items WHERE id = ?",
        params![id],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()?;

    row
      .map(|(data, cached_at)| row_to_cached(id, &data, &cached_at))
      .transpose()
  }

  fn get_items_by_list(&self, list_id: &str) -> StoreResult<Vec<CachedItem>> {
    let conn = self.lock()?;

    let mut stmt = conn.prepare(
      "SELECT id, data, cached_at FROM items
       WHERE list_id = ?
       ORDER BY position, id",
    )?;
    let rows: Vec<(String, Vec<u8>, String)> = stmt
      .query_map(params![list_id], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
      })?
      .collect::<Result<_, _>>()?;

    rows
      .iter()
      .map(|(id, data, cached_at)| row_to_cached(id, data, cached_at))
      .collect()
  }

  fn put_all_items(&self, items: &[Item]) -> StoreResult<()> {
    let mut conn = self.lock()?;
    let now = Utc::now().to_rfc3339();

    let tx = conn.transaction()?;
    for item in items {
      let position = item_position(&tx, item)?;
      insert_item(&tx, item, position, &now)?;
    }
    tx.commit()?;

    Ok(())
  }

  fn remove_item(&self, id: &str) -> StoreResult<()> {
    let conn = self.lock()?;
    conn.execute("DELETE FROM items WHERE id = ?", params![id])?;
    Ok(())
  }

  fn remove_items_by_list(&self, list_id: &str) -> StoreResult<()> {
    let conn = self.lock()?;
    conn.execute("DELETE FROM items WHERE list_id = ?", params![list_id])?;
    Ok(())
  }

  fn replace_items_for_list(&self, list_id: &str, items: &[Item]) -> StoreResult<()> {
    let mut conn = self.lock()?;
    let now = Utc::now().to_rfc3339();

    let tx = conn.transaction()?;
    tx.execute("DELETE FROM items WHERE list_id = ?", params![list_id])?;
    for (position, item) in items.iter().enumerate() {
      insert_item(&tx, item, position as i64, &now)?;
    }
    tx.commit()?;

    Ok(())
  }

  fn enqueue_mutation(&self, mutation: &NewMutation) -> StoreResult<i64> {
    let conn = self.lock()?;
    let kind = mutation.mutation.kind();
    let payload = encode(kind.as_str(), &mutation.mutation)?;

    conn.execute(
      "INSERT INTO mutation_queue (kind, payload, enqueued_at, retry_count)
       VALUES (?, ?, ?, 0)",
      params![kind.as_str(), payload, mutation.enqueued_at.to_rfc3339()],
    )?;

    Ok(conn.last_insert_rowid())
  }

  fn read_queue(&self) -> StoreResult<QueueContents> {
    let conn = self.lock()?;

    let mut stmt = conn.prepare(
      "SELECT id, kind, payload, enqueued_at, retry_count FROM mutation_queue ORDER BY id ASC",
    )?;
    // Columns are read leniently so a mistyped value marks one row, not the read.
    let rows: Vec<QueueRow> = stmt
      .query_map([], |row| {
        Ok(QueueRow {
          id: row.get(0)?,
          kind: row.get(1).ok(),
          payload: row.get_ref(2)?.as_bytes().ok().map(<[u8]>::to_vec),
          enqueued_at: row.get(3).ok(),
          retry_count: row.get(4).ok(),
        })
      })?
      .collect::<Result<_, _>>()?;

    let mut contents = QueueContents::default();
    for row in rows {
      let id = row.id;
      match row.decode() {
        Ok(record) => contents.records.push(record),
        Err(e) => {
          warn!(id, error = %e, "skipping unreadable queued mutation");
          contents.unreadable.push(UnreadableMutation {
            id,
            message: e.to_string(),
          });
        }
      }
    }
    Ok(contents)
  }

  fn dequeue_mutation(&self, id: i64) -> StoreResult<()> {
    let conn = self.lock()?;
    conn.execute("DELETE FROM mutation_queue WHERE id = ?", params![id])?;
    Ok(())
  }

  fn update_retry_count(&self, id: i64, retry_count: u32) -> StoreResult<()> {
    let conn = self.lock()?;
    conn.execute(
      "UPDATE mutation_queue SET retry_count = ? WHERE id = ?",
      params![retry_count, id],
    )?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::{item, list};

  #[test]
  fn test_queue_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");

    {
      let store = SqliteStore::open(&path).unwrap();
      store
        .enqueue_mutation(&NewMutation::now(Mutation::add_item("l1", "Milk")))
        .unwrap();
      store
        .enqueue_mutation(&NewMutation::now(Mutation::check_item("l1", "i1")))
        .unwrap();
    }

    let store = SqliteStore::open(&path).unwrap();
    let queued = store.list_queued_mutations().unwrap();
    assert_eq!(queued.len(), 2);
    assert!(queued[0].id < queued[1].id);
    assert_eq!(queued[0].kind(), MutationKind::AddItem);
    assert_eq!(queued[1].kind(), MutationKind::CheckItem);
  }

  #[test]
  fn test_unreadable_rows_do_not_hide_the_rest() {
    let store = SqliteStore::open_in_memory().unwrap();
    let garbled = store
      .enqueue_mutation(&NewMutation::now(Mutation::check_item("l1", "i1")))
      .unwrap();
    let good = store
      .enqueue_mutation(&NewMutation::now(Mutation::uncheck_item("l1", "i1")))
      .unwrap();
    let miscounted = store
      .enqueue_mutation(&NewMutation::now(Mutation::add_item("l1", "Milk")))
      .unwrap();
    {
      let conn = store.lock().unwrap();
      conn
        .execute(
          "UPDATE mutation_queue SET payload = X'00' WHERE id = ?",
          params![garbled],
        )
        .unwrap();
      conn
        .execute(
          "UPDATE mutation_queue SET retry_count = 'many' WHERE id = ?",
          params![miscounted],
        )
        .unwrap();
    }

    let contents = store.read_queue().unwrap();
    let ids: Vec<_> = contents.records.iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![good]);
    let unreadable: Vec<_> = contents.unreadable.iter().map(|u| u.id).collect();
    assert_eq!(unreadable, vec![garbled, miscounted]);
    assert!(contents.unreadable[0].message.contains(&format!("mutation {}", garbled)));

    assert_eq!(store.list_queued_mutations().unwrap().len(), 1);
    store.dequeue_mutation(garbled).unwrap();
    assert_eq!(store.read_queue().unwrap().unreadable.len(), 1);
  }

  #[test]
  fn test_sequence_ids_never_reused() {
    let store = SqliteStore::open_in_memory().unwrap();
    let first = store
      .enqueue_mutation(&NewMutation::now(Mutation::check_item("l1", "i1")))
      .unwrap();
    store.dequeue_mutation(first).unwrap();

    let second = store
      .enqueue_mutation(&NewMutation::now(Mutation::check_item("l1", "i1")))
      .unwrap();
    assert!(second > first);
  }

  #[test]
  fn test_retry_count_persists() {
    let store = SqliteStore::open_in_memory().unwrap();
    let id = store
      .enqueue_mutation(&NewMutation::now(Mutation::uncheck_item("l1", "i1")))
      .unwrap();
    store.update_retry_count(id, 2).unwrap();

    let queued = store.list_queued_mutations().unwrap();
    assert_eq!(queued[0].retry_count, 2);
  }

  #[test]
  fn test_items_indexed_by_list_in_snapshot_order() {
    let store = SqliteStore::open_in_memory().unwrap();
    store
      .replace_items_for_list("l1", &[item("b", "l1"), item("a", "l1")])
      .unwrap();
    store.put_item(&item("x", "l2")).unwrap();

    let ids: Vec<_> = store
      .get_items_by_list("l1")
      .unwrap()
      .into_iter()
      .map(|c| c.entity.id)
      .collect();
    assert_eq!(ids, vec!["b", "a"]);

    // Upsert keeps position; new items append.
    let mut renamed = item("b", "l1");
    renamed.name = "renamed".to_string();
    store.put_all_items(&[renamed, item("c", "l1")]).unwrap();
    let items = store.get_items_by_list("l1").unwrap();
    let ids: Vec<_> = items.iter().map(|c| c.entity.id.as_str()).collect();
    assert_eq!(ids, vec!["b", "a", "c"]);
    assert_eq!(items[0].entity.name, "renamed");

    store.remove_items_by_list("l1").unwrap();
    assert!(store.get_items_by_list("l1").unwrap().is_empty());
    assert!(store.get_item("x").unwrap().is_some());
  }

  #[test]
  fn test_put_all_lists_replaces_set() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.put_list(&list("old")).unwrap();
    store.put_all_lists(&[list("a"), list("b")]).unwrap();

    let ids: Vec<_> = store
      .get_all_lists()
      .unwrap()
      .into_iter()
      .map(|c| c.entity.id)
      .collect();
    assert_eq!(ids, vec!["a", "b"]);
    assert!(store.get_list("old").unwrap().is_none());

    store.remove_list("a").unwrap();
    assert!(store.get_list("a").unwrap().is_none());
    assert!(store.get_list("b").unwrap().is_some());
  }
}
