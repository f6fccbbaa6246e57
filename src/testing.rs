//! In-process fakes of the backend contracts, for tests and local demos.
//!
//! [`FakeBackend`] keeps server state in memory and applies mutations the way
//! the real backend does, so snapshots fetched after a flush reflect confirmed
//! changes. Failures can be scripted per call.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::model::{CachedItem, CachedList, Item, List};
use crate::mutation::{MutationKind, NewMutation};
use crate::notify::{MutationFailure, Notifier};
use crate::remote::{DispatchContext, DispatchError, RemoteGateway, SnapshotSource};
use crate::store::{LocalStore, MemoryStore, QueueContents, StoreError, StoreResult};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Fixed timestamp used by fixtures.
pub fn epoch() -> DateTime<Utc> {
  Utc.timestamp_opt(1_767_225_600, 0).single().unwrap_or_default()
}

/// An unchecked item with deterministic fields.
pub fn item(id: &str, list_id: &str) -> Item {
  Item {
    id: id.to_string(),
    list_id: list_id.to_string(),
    name: id.to_string(),
    checked: false,
    created_by: "owner".to_string(),
    checked_by: None,
    created_at: epoch(),
    checked_at: None,
    order: None,
    updated_at: None,
  }
}

pub fn list(id: &str) -> List {
  List {
    id: id.to_string(),
    name: id.to_string(),
    owner_id: "owner".to_string(),
    category_id: None,
    created_at: epoch(),
  }
}

/// One mutation call as seen by the fake backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayCall {
  pub kind: MutationKind,
  pub list_id: String,
  /// Item id, or comma-joined ids for a reorder
  pub target: String,
  pub actor: String,
  pub idempotency_key: String,
}

enum Scripted {
  Fail(DispatchError),
  Hang,
  LoseResponse,
}

struct FakeState {
  lists: Vec<List>,
  items: HashMap<String, Vec<Item>>,
  calls: Vec<GatewayCall>,
  applied_keys: HashSet<String>,
  script: VecDeque<Scripted>,
  ping: Result<(), DispatchError>,
  snapshot_error: Option<DispatchError>,
}

/// In-memory backend implementing both [`RemoteGateway`] and [`SnapshotSource`].
#[derive(Clone)]
pub struct FakeBackend {
  state: Arc<Mutex<FakeState>>,
}

impl Default for FakeBackend {
  fn default() -> Self {
    Self::new()
  }
}

impl FakeBackend {
  pub fn new() -> Self {
    Self {
      state: Arc::new(Mutex::new(FakeState {
        lists: Vec::new(),
        items: HashMap::new(),
        calls: Vec::new(),
        applied_keys: HashSet::new(),
        script: VecDeque::new(),
        ping: Ok(()),
        snapshot_error: None,
      })),
    }
  }

  pub fn seed_list(&self, list: List) {
    lock(&self.state).lists.push(list);
  }

  pub fn seed_items(&self, list_id: &str, items: Vec<Item>) {
    lock(&self.state).items.insert(list_id.to_string(), items);
  }

  /// Current server-side items of a list.
  pub fn items(&self, list_id: &str) -> Vec<Item> {
    lock(&self.state)
      .items
      .get(list_id)
      .cloned()
      .unwrap_or_default()
  }

  pub fn calls(&self) -> Vec<GatewayCall> {
    lock(&self.state).calls.clone()
  }

  /// Make the next mutation call fail with `error`. Calls queue up in order.
  pub fn fail_next(&self, error: DispatchError) {
    lock(&self.state).script.push_back(Scripted::Fail(error));
  }

  /// Make the next mutation call never complete.
  pub fn hang_next(&self) {
    lock(&self.state).script.push_back(Scripted::Hang);
  }

  /// Apply the next mutation but report a timeout, as if the response was lost.
  pub fn lose_response_next(&self) {
    lock(&self.state).script.push_back(Scripted::LoseResponse);
  }

  pub fn set_ping(&self, result: Result<(), DispatchError>) {
    lock(&self.state).ping = result;
  }

  /// Make snapshot fetches fail until cleared with `None`.
  pub fn fail_snapshots(&self, error: Option<DispatchError>) {
    lock(&self.state).snapshot_error = error;
  }

  async fn mutate(
    &self,
    call: GatewayCall,
    apply: impl FnOnce(&mut Vec<Item>, &str) -> Result<(), DispatchError>,
  ) -> Result<(), DispatchError> {
    let scripted = {
      let mut state = lock(&self.state);
      state.calls.push(call.clone());
      state.script.pop_front()
    };

    let lose_response = match scripted {
      Some(Scripted::Fail(error)) => return Err(error),
      Some(Scripted::Hang) => std::future::pending::<bool>().await,
      Some(Scripted::LoseResponse) => true,
      None => false,
    };

    let mut state = lock(&self.state);
    if !state.applied_keys.contains(&call.idempotency_key) {
      let items = state.items.entry(call.list_id.clone()).or_default();
      apply(items, &call.actor)?;
      state.applied_keys.insert(call.idempotency_key);
    }

    if lose_response {
      return Err(DispatchError::Timeout("response lost".to_string()));
    }
    Ok(())
  }

  fn call(kind: MutationKind, ctx: DispatchContext<'_>, list_id: &str, target: String) -> GatewayCall {
    GatewayCall {
      kind,
      list_id: list_id.to_string(),
      target,
      actor: ctx.actor.to_string(),
      idempotency_key: ctx.idempotency_key.to_string(),
    }
  }
}

fn set_checked(items: &mut [Item], item_id: &str, actor: &str, checked: bool) -> Result<(), DispatchError> {
  let item = items
    .iter_mut()
    .find(|i| i.id == item_id)
    .ok_or_else(|| DispatchError::Conflict(format!("item {} not found", item_id)))?;
  let now = Utc::now();
  item.checked = checked;
  item.checked_by = checked.then(|| actor.to_string());
  item.checked_at = checked.then_some(now);
  item.updated_at = Some(now);
  Ok(())
}

#[async_trait]
impl RemoteGateway for FakeBackend {
  async fn add_item(
    &self,
    ctx: DispatchContext<'_>,
    list_id: &str,
    item_id: &str,
    name: &str,
    order: Option<i64>,
  ) -> Result<(), DispatchError> {
    let call = Self::call(MutationKind::AddItem, ctx, list_id, item_id.to_string());
    let (list_id, item_id, name) = (list_id.to_string(), item_id.to_string(), name.to_string());
    self
      .mutate(call, move |items, actor| {
        if items.iter().any(|i| i.id == item_id) {
          return Ok(());
        }
        let now = Utc::now();
        items.push(Item {
          id: item_id,
          list_id,
          name,
          checked: false,
          created_by: actor.to_string(),
          checked_by: None,
          created_at: now,
          checked_at: None,
          order,
          updated_at: Some(now),
        });
        Ok(())
      })
      .await
  }

  async fn check_item(
    &self,
    ctx: DispatchContext<'_>,
    list_id: &str,
    item_id: &str,
  ) -> Result<(), DispatchError> {
    let call = Self::call(MutationKind::CheckItem, ctx, list_id, item_id.to_string());
    self
      .mutate(call, |items, actor| set_checked(items, item_id, actor, true))
      .await
  }

  async fn uncheck_item(
    &self,
    ctx: DispatchContext<'_>,
    list_id: &str,
    item_id: &str,
  ) -> Result<(), DispatchError> {
    let call = Self::call(MutationKind::UncheckItem, ctx, list_id, item_id.to_string());
    self
      .mutate(call, |items, actor| set_checked(items, item_id, actor, false))
      .await
  }

  async fn reorder_items(
    &self,
    ctx: DispatchContext<'_>,
    list_id: &str,
    item_ids: &[String],
  ) -> Result<(), DispatchError> {
    let call = Self::call(MutationKind::ReorderItems, ctx, list_id, item_ids.join(","));
    self
      .mutate(call, |items, _| {
        let now = Utc::now();
        for (position, id) in item_ids.iter().enumerate() {
          if let Some(item) = items.iter_mut().find(|i| &i.id == id) {
            item.order = Some(position as i64);
            item.updated_at = Some(now);
          }
        }
        items.sort_by_key(|i| (i.order.is_none(), i.order));
        Ok(())
      })
      .await
  }

  async fn ping(&self) -> Result<(), DispatchError> {
    lock(&self.state).ping.clone()
  }
}

#[async_trait]
impl SnapshotSource for FakeBackend {
  async fn fetch_lists(&self) -> Result<Vec<List>, DispatchError> {
    let state = lock(&self.state);
    match &state.snapshot_error {
      Some(error) => Err(error.clone()),
      None => Ok(state.lists.clone()),
    }
  }

  async fn fetch_items(&self, list_id: &str) -> Result<Vec<Item>, DispatchError> {
    let state = lock(&self.state);
    match &state.snapshot_error {
      Some(error) => Err(error.clone()),
      None => Ok(state.items.get(list_id).cloned().unwrap_or_default()),
    }
  }
}

/// Notifier that keeps every failure for later inspection.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
  failures: Arc<Mutex<Vec<MutationFailure>>>,
}

impl RecordingNotifier {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn failures(&self) -> Vec<MutationFailure> {
    lock(&self.failures).clone()
  }
}

impl Notifier for RecordingNotifier {
  fn notify(&self, failure: MutationFailure) {
    lock(&self.failures).push(failure);
  }
}

const HEALTHY: u8 = 0;
const FAIL_WRITES: u8 = 1;
const CORRUPT_READS: u8 = 2;
const FAIL_ALL: u8 = 3;

/// A store whose writes or reads can be made to fail on demand.
#[derive(Clone)]
pub struct FlakyStore {
  inner: Arc<MemoryStore>,
  mode: Arc<AtomicU8>,
}

impl Default for FlakyStore {
  fn default() -> Self {
    Self::new()
  }
}

impl FlakyStore {
  pub fn new() -> Self {
    Self {
      inner: Arc::new(MemoryStore::new()),
      mode: Arc::new(AtomicU8::new(HEALTHY)),
    }
  }

  pub fn inner(&self) -> &MemoryStore {
    &self.inner
  }

  /// Writes start failing with [`StoreError::Unavailable`]; reads still work.
  pub fn fail_writes(&self) {
    self.mode.store(FAIL_WRITES, Ordering::SeqCst);
  }

  /// Reads and writes both fail with [`StoreError::Unavailable`].
  pub fn fail_everything(&self) {
    self.mode.store(FAIL_ALL, Ordering::SeqCst);
  }

  /// Reads start failing with [`StoreError::Corrupt`].
  pub fn fail_with_corruption(&self) {
    self.mode.store(CORRUPT_READS, Ordering::SeqCst);
  }

  fn write(&self) -> StoreResult<&MemoryStore> {
    match self.mode.load(Ordering::SeqCst) {
      FAIL_WRITES | FAIL_ALL => Err(StoreError::Unavailable("disk full".to_string())),
      _ => Ok(&self.inner),
    }
  }

  fn read(&self) -> StoreResult<&MemoryStore> {
    match self.mode.load(Ordering::SeqCst) {
      CORRUPT_READS => Err(StoreError::Corrupt {
        key: "fixture".to_string(),
        message: "garbled".to_string(),
      }),
      FAIL_ALL => Err(StoreError::Unavailable("database file vanished".to_string())),
      _ => Ok(&self.inner),
    }
  }
}

impl LocalStore for FlakyStore {
  fn is_durable(&self) -> bool {
    true
  }

  fn put_list(&self, list: &List) -> StoreResult<()> {
    self.write()?.put_list(list)
  }

  fn get_list(&self, id: &str) -> StoreResult<Option<CachedList>> {
    self.read()?.get_list(id)
  }

  fn get_all_lists(&self) -> StoreResult<Vec<CachedList>> {
    self.read()?.get_all_lists()
  }

  fn remove_list(&self, id: &str) -> StoreResult<()> {
    self.write()?.remove_list(id)
  }

  fn put_all_lists(&self, lists: &[List]) -> StoreResult<()> {
    self.write()?.put_all_lists(lists)
  }

  fn put_item(&self, item: &Item) -> StoreResult<()> {
    self.write()?.put_item(item)
  }

  fn get_item(&self, id: &str) -> StoreResult<Option<CachedItem>> {
    self.read()?.get_item(id)
  }

  fn get_items_by_list(&self, list_id: &str) -> StoreResult<Vec<CachedItem>> {
    self.read()?.get_items_by_list(list_id)
  }

  fn put_all_items(&self, items: &[Item]) -> StoreResult<()> {
    self.write()?.put_all_items(items)
  }

  fn remove_item(&self, id: &str) -> StoreResult<()> {
    self.write()?.remove_item(id)
  }

  fn remove_items_by_list(&self, list_id: &str) -> StoreResult<()> {
    self.write()?.remove_items_by_list(list_id)
  }

  fn replace_items_for_list(&self, list_id: &str, items: &[Item]) -> StoreResult<()> {
    self.write()?.replace_items_for_list(list_id, items)
  }

  fn enqueue_mutation(&self, mutation: &NewMutation) -> StoreResult<i64> {
    self.write()?.enqueue_mutation(mutation)
  }

  fn read_queue(&self) -> StoreResult<QueueContents> {
    self.read()?.read_queue()
  }

  fn dequeue_mutation(&self, id: i64) -> StoreResult<()> {
    self.write()?.dequeue_mutation(id)
  }

  fn update_retry_count(&self, id: i64, retry_count: u32) -> StoreResult<()> {
    self.write()?.update_retry_count(id, retry_count)
  }
}
