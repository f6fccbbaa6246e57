//! Wrapper that falls back to memory when the durable store fails.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{error, warn};

use super::memory::MemoryStore;
use super::traits::{LocalStore, QueueContents, StoreError, StoreResult};
use crate::model::{CachedItem, CachedList, Item, List};
use crate::mutation::NewMutation;

/// Routes every call to a durable primary store until it reports
/// [`StoreError::Unavailable`], then switches permanently to an in-memory
/// store for the rest of the process.
///
/// Callers see degraded durability, never a storage error caused by the
/// primary going away.
pub struct DegradingStore {
  primary: Box<dyn LocalStore>,
  fallback: Mutex<Option<MemoryStore>>,
  degraded: AtomicBool,
}

impl DegradingStore {
  pub fn new(primary: Box<dyn LocalStore>) -> Self {
    Self {
      primary,
      fallback: Mutex::new(None),
      degraded: AtomicBool::new(false),
    }
  }

  pub fn is_degraded(&self) -> bool {
    self.degraded.load(Ordering::SeqCst)
  }

  /// Run `op` against the active backend, degrading on unavailability.
  fn route<T>(&self, op: impl Fn(&dyn LocalStore) -> StoreResult<T>) -> StoreResult<T> {
    if !self.is_degraded() {
      match op(self.primary.as_ref()) {
        Err(StoreError::Unavailable(reason)) => self.degrade(&reason)?,
        other => return other,
      }
    }

    let fallback = self
      .fallback
      .lock()
      .map_err(|e| StoreError::Unavailable(format!("lock poisoned: {}", e)))?;
    match fallback.as_ref() {
      Some(store) => op(store),
      None => Err(StoreError::Unavailable(
        "fallback store missing after degradation".to_string(),
      )),
    }
  }

  fn degrade(&self, reason: &str) -> StoreResult<()> {
    let mut fallback = self
      .fallback
      .lock()
      .map_err(|e| StoreError::Unavailable(format!("lock poisoned: {}", e)))?;
    if fallback.is_some() {
      return Ok(());
    }

    warn!(%reason, "local storage unavailable, continuing in memory");

    // Carry over whatever queue is still readable so pending intents survive.
    let memory = MemoryStore::new();
    match self.primary.list_queued_mutations() {
      Ok(records) => memory.adopt_queue(records)?,
      Err(e) => error!(error = %e, "could not carry queued mutations into memory"),
    }

    *fallback = Some(memory);
    self.degraded.store(true, Ordering::SeqCst);
    Ok(())
  }
}

impl LocalStore for DegradingStore {
  fn is_durable(&self) -> bool {
    !self.is_degraded() && self.primary.is_durable()
  }

  fn put_list(&self, list: &List) -> StoreResult<()> {
    self.route(|s| s.put_list(list))
  }

  fn get_list(&self, id: &str) -> StoreResult<Option<CachedList>> {
    self.route(|s| s.get_list(id))
  }

  fn get_all_lists(&self) -> StoreResult<Vec<CachedList>> {
    self.route(|s| s.get_all_lists())
  }

  fn remove_list(&self, id: &str) -> StoreResult<()> {
    self.route(|s| s.remove_list(id))
  }

  fn put_all_lists(&self, lists: &[List]) -> StoreResult<()> {
    self.route(|s| s.put_all_lists(lists))
  }

  fn put_item(&self, item: &Item) -> StoreResult<()> {
    self.route(|s| s.put_item(item))
  }

  fn get_item(&self, id: &str) -> StoreResult<Option<CachedItem>> {
    self.route(|s| s.get_item(id))
  }

  fn get_items_by_list(&self, list_id: &str) -> StoreResult<Vec<CachedItem>> {
    self.route(|s| s.get_items_by_list(list_id))
  }

  fn put_all_items(&self, items: &[Item]) -> StoreResult<()> {
    self.route(|s| s.put_all_items(items))
  }

  fn remove_item(&self, id: &str) -> StoreResult<()> {
    self.route(|s| s.remove_item(id))
  }

  fn remove_items_by_list(&self, list_id: &str) -> StoreResult<()> {
    self.route(|s| s.remove_items_by_list(list_id))
  }

  fn replace_items_for_list(&self, list_id: &str, items: &[Item]) -> StoreResult<()> {
    self.route(|s| s.replace_items_for_list(list_id, items))
  }

  fn enqueue_mutation(&self, mutation: &NewMutation) -> StoreResult<i64> {
    self.route(|s| s.enqueue_mutation(mutation))
  }

  fn read_queue(&self) -> StoreResult<QueueContents> {
    self.route(|s| s.read_queue())
  }

  fn dequeue_mutation(&self, id: i64) -> StoreResult<()> {
    self.route(|s| s.dequeue_mutation(id))
  }

  fn update_retry_count(&self, id: i64, retry_count: u32) -> StoreResult<()> {
    self.route(|s| s.update_retry_count(id, retry_count))
  }
}
