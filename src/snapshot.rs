//! Snapshot layer that pairs remote fetches with the local cache.
//!
//! Fetches are network-first: a fresh snapshot replaces the cached copy in a
//! single write, and when the backend cannot be reached the cached copy is
//! served instead, marked as offline.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::model::{CachedEntity, Item, List};
use crate::remote::SnapshotSource;
use crate::store::LocalStore;

/// Where a snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh from the backend
  Network,
  /// Backend unavailable, served from the local cache
  Offline,
}

/// Result of a snapshot fetch with its provenance.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  pub data: T,
  pub source: CacheSource,
  /// When the cached copy was written (None for network results)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  pub fn offline(data: T, cached_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at,
    }
  }

  pub fn is_offline(&self) -> bool {
    self.source == CacheSource::Offline
  }
}

/// Network-first snapshot fetcher backed by a [`LocalStore`].
#[derive(Clone)]
pub struct SnapshotCache {
  store: Arc<dyn LocalStore>,
  source: Arc<dyn SnapshotSource>,
}

impl SnapshotCache {
  pub fn new(store: Arc<dyn LocalStore>, source: Arc<dyn SnapshotSource>) -> Self {
    Self { store, source }
  }

  /// Items of one list, from the backend or the cache.
  ///
  /// Errors only when the backend fails and nothing usable is cached.
  pub async fn fetch_items(&self, list_id: &str) -> Result<CacheResult<Vec<Item>>> {
    match self.source.fetch_items(list_id).await {
      Ok(items) => {
        if let Err(e) = self.store.replace_items_for_list(list_id, &items) {
          warn!(list_id, error = %e, "could not cache item snapshot");
        }
        debug!(list_id, count = items.len(), "item snapshot from network");
        Ok(CacheResult::from_network(items))
      }
      Err(remote_err) => {
        let cached = self
          .store
          .get_items_by_list(list_id)
          .map_err(|e| eyre!("Failed to fetch items ({}) and cache is unreadable: {}", remote_err, e))?;
        debug!(list_id, count = cached.len(), error = %remote_err, "serving cached items");
        let (items, cached_at) = unzip_cached(cached);
        Ok(CacheResult::offline(items, cached_at))
      }
    }
  }

  /// All lists visible to the actor, from the backend or the cache.
  pub async fn fetch_lists(&self) -> Result<CacheResult<Vec<List>>> {
    match self.source.fetch_lists().await {
      Ok(lists) => {
        if let Err(e) = self.store.put_all_lists(&lists) {
          warn!(error = %e, "could not cache list snapshot");
        }
        Ok(CacheResult::from_network(lists))
      }
      Err(remote_err) => {
        let cached = self
          .store
          .get_all_lists()
          .map_err(|e| eyre!("Failed to fetch lists ({}) and cache is unreadable: {}", remote_err, e))?;
        debug!(count = cached.len(), error = %remote_err, "serving cached lists");
        let (lists, cached_at) = unzip_cached(cached);
        Ok(CacheResult::offline(lists, cached_at))
      }
    }
  }

  /// Cached items without touching the network.
  pub fn cached_items(&self, list_id: &str) -> Result<CacheResult<Vec<Item>>> {
    let cached = self
      .store
      .get_items_by_list(list_id)
      .map_err(|e| eyre!("Failed to read cached items: {}", e))?;
    let (items, cached_at) = unzip_cached(cached);
    Ok(CacheResult::offline(items, cached_at))
  }
}

/// Split cached records, keeping the oldest write time as the snapshot's age.
fn unzip_cached<T>(cached: Vec<CachedEntity<T>>) -> (Vec<T>, Option<DateTime<Utc>>) {
  let oldest = cached.iter().map(|c| c.cached_at).min();
  (cached.into_iter().map(|c| c.entity).collect(), oldest)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::remote::DispatchError;
  use crate::store::MemoryStore;
  use crate::testing::{item, list, FakeBackend};

  fn setup() -> (SnapshotCache, FakeBackend, Arc<MemoryStore>) {
    let backend = FakeBackend::new();
    let store = Arc::new(MemoryStore::new());
    let cache = SnapshotCache::new(store.clone(), Arc::new(backend.clone()));
    (cache, backend, store)
  }

  #[tokio::test]
  async fn test_network_result_replaces_cache() {
    let (cache, backend, store) = setup();
    store.put_item(&item("stale", "l1")).unwrap();
    backend.seed_items("l1", vec![item("a", "l1"), item("b", "l1")]);

    let result = cache.fetch_items("l1").await.unwrap();
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.len(), 2);

    let cached: Vec<_> = store
      .get_items_by_list("l1")
      .unwrap()
      .into_iter()
      .map(|c| c.entity.id)
      .collect();
    assert_eq!(cached, vec!["a", "b"]);
  }

  #[tokio::test]
  async fn test_falls_back_to_cache_when_offline() {
    let (cache, backend, _) = setup();
    backend.seed_items("l1", vec![item("a", "l1")]);
    cache.fetch_items("l1").await.unwrap();

    backend.fail_snapshots(Some(DispatchError::Unreachable("offline".into())));
    let result = cache.fetch_items("l1").await.unwrap();
    assert!(result.is_offline());
    assert!(result.cached_at.is_some());
    assert_eq!(result.data[0].id, "a");
  }

  #[tokio::test]
  async fn test_offline_with_empty_cache_is_empty() {
    let (cache, backend, _) = setup();
    backend.fail_snapshots(Some(DispatchError::Unreachable("offline".into())));

    let result = cache.fetch_items("l1").await.unwrap();
    assert!(result.is_offline());
    assert!(result.data.is_empty());
    assert_eq!(result.cached_at, None);
  }

  #[tokio::test]
  async fn test_lists_round_trip_through_cache() {
    let (cache, backend, _) = setup();
    backend.seed_list(list("l1"));
    backend.seed_list(list("l2"));
    assert_eq!(cache.fetch_lists().await.unwrap().data.len(), 2);

    backend.fail_snapshots(Some(DispatchError::Timeout("slow".into())));
    let result = cache.fetch_lists().await.unwrap();
    assert!(result.is_offline());
    assert_eq!(result.data.len(), 2);
  }
}
