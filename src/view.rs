//! UI-facing view of a single list.
//!
//! Holds the latest authoritative snapshot and republishes the optimistic
//! projection whenever either the snapshot or the mutation queue changes.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::model::Item;
use crate::mutation::Mutation;
use crate::projection::{project, OptimisticItem};
use crate::queue::MutationQueue;
use crate::snapshot::SnapshotCache;

#[derive(Debug, Clone, Default)]
struct RemoteSnapshot {
  items: Vec<Item>,
  using_cache: bool,
}

pub struct ListView {
  list_id: String,
  queue: Arc<MutationQueue>,
  snapshots: SnapshotCache,
  remote: watch::Sender<RemoteSnapshot>,
  items: watch::Sender<Vec<OptimisticItem>>,
}

impl ListView {
  /// Create a view seeded from whatever the local cache holds.
  pub fn new(list_id: impl Into<String>, queue: Arc<MutationQueue>, snapshots: SnapshotCache) -> Self {
    let list_id = list_id.into();
    let seed = match snapshots.cached_items(&list_id) {
      Ok(cached) => RemoteSnapshot {
        items: cached.data,
        using_cache: true,
      },
      Err(e) => {
        warn!(list_id = %list_id, error = %e, "starting view without cached items");
        RemoteSnapshot {
          items: Vec::new(),
          using_cache: true,
        }
      }
    };

    let (remote, _) = watch::channel(seed);
    let (items, _) = watch::channel(Vec::new());
    let view = Self {
      list_id,
      queue,
      snapshots,
      remote,
      items,
    };
    view.reproject();
    view
  }

  pub fn list_id(&self) -> &str {
    &self.list_id
  }

  /// Queue an intent against this list; returns its sequence id.
  ///
  /// The projection reflects the intent before this returns.
  pub fn submit(&self, mutation: Mutation) -> Result<i64> {
    if mutation.list_id() != self.list_id {
      return Err(eyre!(
        "Mutation targets list {} but this view shows {}",
        mutation.list_id(),
        self.list_id
      ));
    }
    let id = self
      .queue
      .submit(mutation)
      .map_err(|e| eyre!("Failed to queue mutation: {}", e))?;
    self.reproject();
    Ok(id)
  }

  /// Current projected rows.
  pub fn items(&self) -> Vec<OptimisticItem> {
    self.items.borrow().clone()
  }

  /// Receiver that changes on every republished projection.
  pub fn subscribe(&self) -> watch::Receiver<Vec<OptimisticItem>> {
    self.items.subscribe()
  }

  /// Whether the base snapshot came from the local cache rather than the backend.
  pub fn is_using_cache(&self) -> bool {
    self.remote.borrow().using_cache
  }

  /// Replace the base snapshot with a fresh delivery from the backend.
  pub fn apply_snapshot(&self, items: Vec<Item>) {
    self.remote.send_replace(RemoteSnapshot {
      items,
      using_cache: false,
    });
    self.reproject();
  }

  /// Fetch a snapshot (falling back to cache) and republish.
  pub async fn refresh(&self) -> Result<()> {
    let result = self.snapshots.fetch_items(&self.list_id).await?;
    let using_cache = result.is_offline();
    self.remote.send_replace(RemoteSnapshot {
      items: result.data,
      using_cache,
    });
    self.reproject();
    Ok(())
  }

  /// Recompute the projection from the stored snapshot and a fresh read of the queue.
  pub fn reproject(&self) {
    // An unreadable queue shows the plain snapshot rather than stale overlays.
    let queue = self.queue.pending().unwrap_or_else(|e| {
      warn!(list_id = %self.list_id, error = %e, "could not read queue, showing snapshot only");
      Vec::new()
    });
    let remote = self.remote.borrow().items.clone();
    let rows = project(&self.list_id, self.queue.actor(), &remote, &queue);
    self.items.send_if_modified(|current| {
      if *current == rows {
        false
      } else {
        *current = rows;
        true
      }
    });
  }

  /// Poll the backend every `interval` and re-project on queue changes.
  ///
  /// Each poll result is a full-replacement snapshot. Runs until dropped.
  pub async fn run(self: Arc<Self>, interval: Duration) {
    let mut revisions = self.queue.subscribe();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        _ = ticker.tick() => {
          if let Err(e) = self.refresh().await {
            debug!(list_id = %self.list_id, error = %e, "snapshot refresh failed");
          }
        }
        changed = revisions.changed() => {
          if changed.is_err() {
            return;
          }
          revisions.borrow_and_update();
          self.reproject();
        }
      }
    }
  }
}
