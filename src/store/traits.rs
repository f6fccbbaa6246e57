//! The storage capability trait shared by every cache backend.

use thiserror::Error;

use crate::model::{CachedItem, CachedList, Item, List};
use crate::mutation::{NewMutation, QueuedMutation};

/// Errors surfaced by a storage backend.
#[derive(Debug, Error)]
pub enum StoreError {
  /// The backing store cannot be opened or written (quota, permissions, I/O).
  #[error("local storage unavailable: {0}")]
  Unavailable(String),
  /// A stored record could not be decoded.
  #[error("corrupt record {key}: {message}")]
  Corrupt { key: String, message: String },
}

impl From<rusqlite::Error> for StoreError {
  fn from(e: rusqlite::Error) -> Self {
    StoreError::Unavailable(e.to_string())
  }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A queued record whose stored form can no longer be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadableMutation {
  pub id: i64,
  pub message: String,
}

/// The mutation queue as read back from storage.
///
/// Records that fail to decode are reported next to the readable ones, so one
/// bad row never hides the rest of the queue.
#[derive(Debug, Clone, Default)]
pub struct QueueContents {
  pub records: Vec<QueuedMutation>,
  pub unreadable: Vec<UnreadableMutation>,
}

/// Durable keyed storage for list/item snapshots and the mutation queue.
///
/// Every write must be persisted before the call returns. Bulk operations are
/// all-or-nothing. Implementations never touch the network.
pub trait LocalStore: Send + Sync {
  /// Whether writes survive a process restart.
  fn is_durable(&self) -> bool;

  // Lists

  fn put_list(&self, list: &List) -> StoreResult<()>;

  fn get_list(&self, id: &str) -> StoreResult<Option<CachedList>>;

  fn get_all_lists(&self) -> StoreResult<Vec<CachedList>>;

  fn remove_list(&self, id: &str) -> StoreResult<()>;

  /// Replace the whole list set in one transaction.
  fn put_all_lists(&self, lists: &[List]) -> StoreResult<()>;

  // Items

  fn put_item(&self, item: &Item) -> StoreResult<()>;

  fn get_item(&self, id: &str) -> StoreResult<Option<CachedItem>>;

  /// Items of one list in snapshot order.
  fn get_items_by_list(&self, list_id: &str) -> StoreResult<Vec<CachedItem>>;

  /// Upsert many items in one transaction.
  fn put_all_items(&self, items: &[Item]) -> StoreResult<()>;

  fn remove_item(&self, id: &str) -> StoreResult<()>;

  fn remove_items_by_list(&self, list_id: &str) -> StoreResult<()>;

  /// Swap a list's cached items for a fresh snapshot in one transaction.
  fn replace_items_for_list(&self, list_id: &str, items: &[Item]) -> StoreResult<()>;

  // Mutation queue

  /// Append to the queue, returning the assigned sequence id.
  fn enqueue_mutation(&self, mutation: &NewMutation) -> StoreResult<i64>;

  /// The whole queue, ascending by sequence id.
  fn read_queue(&self) -> StoreResult<QueueContents>;

  /// Readable queued mutations, ascending by sequence id.
  fn list_queued_mutations(&self) -> StoreResult<Vec<QueuedMutation>> {
    Ok(self.read_queue()?.records)
  }

  fn dequeue_mutation(&self, id: i64) -> StoreResult<()>;

  fn update_retry_count(&self, id: i64, retry_count: u32) -> StoreResult<()>;
}
