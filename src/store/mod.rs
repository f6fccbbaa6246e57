//! Local cache store for list snapshots and the pending mutation queue.
//!
//! This module provides:
//! - A [`LocalStore`] capability trait with SQLite and in-memory backends
//! - Bulk snapshot writes that land in a single transaction
//! - An auto-incrementing mutation queue read back in sequence order
//! - Graceful degradation to memory when durable storage is unavailable

mod degrading;
mod memory;
mod sqlite;
mod traits;

use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{StorageBackend, StorageConfig};

pub use degrading::DegradingStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{LocalStore, QueueContents, StoreError, StoreResult, UnreadableMutation};

/// Open the configured store.
///
/// Never fails: if the durable backend cannot be opened the process carries
/// on with an in-memory store.
pub fn open(config: &StorageConfig) -> Arc<dyn LocalStore> {
  match config.backend {
    StorageBackend::Memory => {
      info!("using in-memory local store");
      Arc::new(MemoryStore::new())
    }
    StorageBackend::Sqlite => {
      let opened = match &config.path {
        Some(path) => SqliteStore::open(path),
        None => SqliteStore::open_default(),
      };
      match opened {
        Ok(store) => Arc::new(DegradingStore::new(Box::new(store))),
        Err(e) => {
          warn!(error = %e, "durable local store unavailable, falling back to memory");
          Arc::new(MemoryStore::new())
        }
      }
    }
  }
}
