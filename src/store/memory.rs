//! In-memory store, used when durable storage is unavailable or disabled.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use super::traits::{LocalStore, QueueContents, StoreError, StoreResult};
use crate::model::{CachedEntity, CachedItem, CachedList, Item, List};
use crate::mutation::{NewMutation, QueuedMutation};

struct Slot<T> {
  entity: T,
  position: i64,
  cached_at: DateTime<Utc>,
}

impl<T: Clone> Slot<T> {
  fn cached(&self) -> CachedEntity<T> {
    CachedEntity {
      entity: self.entity.clone(),
      cached_at: self.cached_at,
    }
  }
}

#[derive(Default)]
struct Tables {
  lists: HashMap<String, Slot<List>>,
  items: HashMap<String, Slot<Item>>,
  /// list id -> ids of its cached items
  by_list: HashMap<String, BTreeSet<String>>,
  queue: BTreeMap<i64, QueuedMutation>,
  next_id: i64,
}

impl Tables {
  fn next_list_position(&self) -> i64 {
    self
      .lists
      .values()
      .map(|s| s.position + 1)
      .max()
      .unwrap_or(0)
  }

  fn item_slots(&self, list_id: &str) -> Vec<&Slot<Item>> {
    self
      .by_list
      .get(list_id)
      .into_iter()
      .flatten()
      .filter_map(|id| self.items.get(id))
      .collect()
  }

  fn next_item_position(&self, list_id: &str) -> i64 {
    self
      .item_slots(list_id)
      .iter()
      .map(|s| s.position + 1)
      .max()
      .unwrap_or(0)
  }

  fn insert_item(&mut self, slot: Slot<Item>) {
    let id = slot.entity.id.clone();
    let list_id = slot.entity.list_id.clone();
    if let Some(previous) = self.items.insert(id.clone(), slot) {
      if previous.entity.list_id != list_id {
        self.unindex(&previous.entity.list_id, &id);
      }
    }
    self.by_list.entry(list_id).or_default().insert(id);
  }

  fn upsert_item(&mut self, item: &Item, now: DateTime<Utc>) {
    let position = match self.items.get(&item.id) {
      Some(slot) if slot.entity.list_id == item.list_id => slot.position,
      _ => self.next_item_position(&item.list_id),
    };
    self.insert_item(Slot {
      entity: item.clone(),
      position,
      cached_at: now,
    });
  }

  fn remove_item(&mut self, id: &str) {
    if let Some(slot) = self.items.remove(id) {
      self.unindex(&slot.entity.list_id, id);
    }
  }

  fn remove_list_items(&mut self, list_id: &str) {
    for id in self.by_list.remove(list_id).unwrap_or_default() {
      self.items.remove(&id);
    }
  }

  fn unindex(&mut self, list_id: &str, id: &str) {
    if let Some(ids) = self.by_list.get_mut(list_id) {
      ids.remove(id);
      if ids.is_empty() {
        self.by_list.remove(list_id);
      }
    }
  }
}

/// Non-durable store keeping everything behind a mutex.
///
/// Every operation is applied under a single lock, so bulk writes are atomic
/// with respect to concurrent readers.
pub struct MemoryStore {
  tables: Mutex<Tables>,
}

impl Default for MemoryStore {
  fn default() -> Self {
    Self::new()
  }
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::starting_at(1)
  }

  /// Create a store whose queue ids start at `next_id`.
  ///
  /// Used when taking over from a failed durable store so ids stay monotonic.
  pub fn starting_at(next_id: i64) -> Self {
    Self {
      tables: Mutex::new(Tables {
        next_id: next_id.max(1),
        ..Tables::default()
      }),
    }
  }

  /// Seed the queue with records carried over from another store.
  pub fn adopt_queue(&self, records: Vec<QueuedMutation>) -> StoreResult<()> {
    let mut tables = self.lock()?;
    for record in records {
      tables.next_id = tables.next_id.max(record.id + 1);
      tables.queue.insert(record.id, record);
    }
    Ok(())
  }

  fn lock(&self) -> StoreResult<MutexGuard<'_, Tables>> {
    self
      .tables
      .lock()
      .map_err(|e| StoreError::Unavailable(format!("lock poisoned: {}", e)))
  }
}

fn sorted<T: Clone>(mut slots: Vec<&Slot<T>>, id: impl Fn(&T) -> &str) -> Vec<CachedEntity<T>> {
  slots.sort_by(|a, b| {
    a.position
      .cmp(&b.position)
      .then_with(|| id(&a.entity).cmp(id(&b.entity)))
  });
  slots.into_iter().map(Slot::cached).collect()
}

impl LocalStore for MemoryStore {
  fn is_durable(&self) -> bool {
    false
  }

  fn put_list(&self, list: &List) -> StoreResult<()> {
    let mut tables = self.lock()?;
    let position = match tables.lists.get(&list.id) {
      Some(slot) => slot.position,
      None => tables.next_list_position(),
    };
    tables.lists.insert(
      list.id.clone(),
      Slot {
        entity: list.clone(),
        position,
        cached_at: Utc::now(),
      },
    );
    Ok(())
  }

  fn get_list(&self, id: &str) -> StoreResult<Option<CachedList>> {
    Ok(self.lock()?.lists.get(id).map(Slot::cached))
  }

  fn get_all_lists(&self) -> StoreResult<Vec<CachedList>> {
    let tables = self.lock()?;
    Ok(sorted(tables.lists.values().collect(), |l| l.id.as_str()))
  }

  fn remove_list(&self, id: &str) -> StoreResult<()> {
    self.lock()?.lists.remove(id);
    Ok(())
  }

  fn put_all_lists(&self, lists: &[List]) -> StoreResult<()> {
    let mut tables = self.lock()?;
    let now = Utc::now();
    tables.lists = lists
      .iter()
      .enumerate()
      .map(|(position, list)| {
        (
          list.id.clone(),
          Slot {
            entity: list.clone(),
            position: position as i64,
            cached_at: now,
          },
        )
      })
      .collect();
    Ok(())
  }

  fn put_item(&self, item: &Item) -> StoreResult<()> {
    self.lock()?.upsert_item(item, Utc::now());
    Ok(())
  }

  fn get_item(&self, id: &str) -> StoreResult<Option<CachedItem>> {
    Ok(self.lock()?.items.get(id).map(Slot::cached))
  }

  fn get_items_by_list(&self, list_id: &str) -> StoreResult<Vec<CachedItem>> {
    let tables = self.lock()?;
    Ok(sorted(tables.item_slots(list_id), |i| i.id.as_str()))
  }

  fn put_all_items(&self, items: &[Item]) -> StoreResult<()> {
    let mut tables = self.lock()?;
    let now = Utc::now();
    for item in items {
      tables.upsert_item(item, now);
    }
    Ok(())
  }

  fn remove_item(&self, id: &str) -> StoreResult<()> {
    self.lock()?.remove_item(id);
    Ok(())
  }

  fn remove_items_by_list(&self, list_id: &str) -> StoreResult<()> {
    self.lock()?.remove_list_items(list_id);
    Ok(())
  }

  fn replace_items_for_list(&self, list_id: &str, items: &[Item]) -> StoreResult<()> {
    let mut tables = self.lock()?;
    let now = Utc::now();
    tables.remove_list_items(list_id);
    for (position, item) in items.iter().enumerate() {
      tables.insert_item(Slot {
        entity: item.clone(),
        position: position as i64,
        cached_at: now,
      });
    }
    Ok(())
  }

  fn enqueue_mutation(&self, mutation: &NewMutation) -> StoreResult<i64> {
    let mut tables = self.lock()?;
    let id = tables.next_id;
    tables.next_id += 1;
    tables.queue.insert(
      id,
      QueuedMutation {
        id,
        mutation: mutation.mutation.clone(),
        enqueued_at: mutation.enqueued_at,
        retry_count: 0,
      },
    );
    Ok(id)
  }

  fn read_queue(&self) -> StoreResult<QueueContents> {
    Ok(QueueContents {
      records: self.lock()?.queue.values().cloned().collect(),
      unreadable: Vec::new(),
    })
  }

  fn dequeue_mutation(&self, id: i64) -> StoreResult<()> {
    self.lock()?.queue.remove(&id);
    Ok(())
  }

  fn update_retry_count(&self, id: i64, retry_count: u32) -> StoreResult<()> {
    if let Some(record) = self.lock()?.queue.get_mut(&id) {
      record.retry_count = retry_count;
    }
    Ok(())
  }
}
