//! Best-effort online/offline tracking.
//!
//! Status comes from two places: a periodic health probe against the backend,
//! and the outcome of real dispatches reported by the mutation queue. Neither
//! is authoritative, so the queue also flushes on its own timer.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::remote::{DispatchError, RemoteGateway};

pub struct ConnectivityMonitor {
  state: watch::Sender<bool>,
}

impl ConnectivityMonitor {
  pub fn new(initially_online: bool) -> Self {
    let (state, _) = watch::channel(initially_online);
    Self { state }
  }

  /// Current best-known status.
  pub fn is_online(&self) -> bool {
    *self.state.borrow()
  }

  /// Receiver that wakes on every transition.
  ///
  /// Rapid flips between reads collapse into the latest value.
  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.state.subscribe()
  }

  /// Record a status, returning whether it was a transition.
  pub fn set_online(&self, online: bool) -> bool {
    let changed = self.state.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    });
    if changed {
      info!(online, "connectivity changed");
    }
    changed
  }

  /// Fold the outcome of a remote call into the status.
  pub fn observe(&self, outcome: &Result<(), DispatchError>) {
    match outcome {
      Ok(()) => {
        self.set_online(true);
      }
      Err(DispatchError::Unreachable(_)) => {
        self.set_online(false);
      }
      // The backend answered, so the network is up even if the call failed.
      Err(
        DispatchError::Transient(_)
        | DispatchError::Conflict(_)
        | DispatchError::Unauthorized(_)
        | DispatchError::Rejected(_),
      ) => {
        self.set_online(true);
      }
      Err(DispatchError::Timeout(_)) => {}
    }
  }

  /// Ping the backend every `interval` until the task is dropped.
  pub async fn run_probe(self: Arc<Self>, gateway: Arc<dyn RemoteGateway>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
      ticker.tick().await;
      let outcome = gateway.ping().await;
      debug!(ok = outcome.is_ok(), "connectivity probe");
      match outcome {
        Err(DispatchError::Timeout(_)) => {
          self.set_online(false);
        }
        other => self.observe(&other),
      }
    }
  }
}

impl Default for ConnectivityMonitor {
  fn default() -> Self {
    Self::new(true)
  }
}
