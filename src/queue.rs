//! Mutation queue manager.
//!
//! Turns local intents into remote effects. Every intent is persisted before
//! `submit` returns; a background worker replays the queue strictly in
//! sequence order, one dispatch at a time, and is the only code that removes
//! or edits queued records.
//!
//! Per-mutation lifecycle:
//!
//! ```text
//! Queued -> Dispatching -> Confirmed                      (dequeued)
//!                       -> transient failure -> Queued    (retry count + 1, flush halts)
//!                       -> offline / signed out -> Queued  (no retry consumed, flush halts)
//!                       -> rejected / budget spent         (dequeued + notified)
//! ```
//!
//! Records that can no longer be decoded are dequeued and reported without
//! being sent.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::connectivity::ConnectivityMonitor;
use crate::mutation::{Mutation, NewMutation, QueuedMutation};
use crate::notify::{FailureReason, MutationFailure, Notifier};
use crate::remote::{DispatchContext, DispatchError, RemoteGateway};
use crate::store::{LocalStore, StoreResult};

/// Retry budget and timing for dispatch attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Attempts (including the first) before a mutation is abandoned
  pub max_attempts: u32,
  pub base_backoff: Duration,
  pub max_backoff: Duration,
  /// Bound on a single dispatch; exceeding it counts as a timeout
  pub dispatch_timeout: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_backoff: Duration::from_secs(1),
      max_backoff: Duration::from_secs(30),
      dispatch_timeout: Duration::from_secs(10),
    }
  }
}

impl RetryPolicy {
  /// Delay before the next attempt after `failures` consecutive failures.
  ///
  /// `base * 2^(failures - 1)`, capped at `max_backoff`.
  pub fn backoff_for(&self, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    self
      .base_backoff
      .saturating_mul(1u32 << exponent)
      .min(self.max_backoff)
  }
}

/// What happened to a single queued mutation during a flush.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
  Confirmed,
  /// Transient failure; stays queued and the flush stops here.
  Retrying { retry_count: u32, backoff: Duration },
  /// Backend unreachable or credentials refused; stays queued without using
  /// up a retry.
  Waiting,
  /// Permanently failed and removed.
  Abandoned,
}

/// Summary of one flush pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushReport {
  pub dispatched: usize,
  pub confirmed: usize,
  pub failed: usize,
  /// A mutation stayed queued, so later ones were not attempted
  pub halted: bool,
  /// Suggested delay before the next attempt
  pub retry_after: Option<Duration>,
  /// Another flush was already running; nothing was done
  pub coalesced: bool,
}

impl FlushReport {
  pub fn coalesced() -> Self {
    Self {
      coalesced: true,
      ..Self::default()
    }
  }
}

/// Single authority over the pending mutation queue.
pub struct MutationQueue {
  store: Arc<dyn LocalStore>,
  gateway: Arc<dyn RemoteGateway>,
  notifier: Arc<dyn Notifier>,
  monitor: Arc<ConnectivityMonitor>,
  policy: RetryPolicy,
  actor: String,
  flush_lock: Mutex<()>,
  wake: Notify,
  revision: watch::Sender<u64>,
  counter: AtomicU64,
}

impl MutationQueue {
  pub fn new(
    store: Arc<dyn LocalStore>,
    gateway: Arc<dyn RemoteGateway>,
    notifier: Arc<dyn Notifier>,
    monitor: Arc<ConnectivityMonitor>,
    actor: impl Into<String>,
  ) -> Self {
    let (revision, _) = watch::channel(0);
    Self {
      store,
      gateway,
      notifier,
      monitor,
      policy: RetryPolicy::default(),
      actor: actor.into(),
      flush_lock: Mutex::new(()),
      wake: Notify::new(),
      revision,
      counter: AtomicU64::new(0),
    }
  }

  pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
    self.policy = policy;
    self
  }

  pub fn policy(&self) -> &RetryPolicy {
    &self.policy
  }

  pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
    &self.monitor
  }

  /// Identity attributed to every dispatched mutation.
  pub fn actor(&self) -> &str {
    &self.actor
  }

  /// Persist an intent and schedule a dispatch. Does not wait for the backend.
  pub fn submit(&self, mutation: Mutation) -> StoreResult<i64> {
    let kind = mutation.kind();
    let id = self.store.enqueue_mutation(&NewMutation::now(mutation))?;
    debug!(id, %kind, "mutation queued");

    self.bump_revision();
    self.wake.notify_one();
    Ok(id)
  }

  /// Snapshot of the queue in sequence order.
  pub fn pending(&self) -> StoreResult<Vec<QueuedMutation>> {
    self.store.list_queued_mutations()
  }

  /// Receiver that changes whenever the queue gains or loses a record.
  pub fn subscribe(&self) -> watch::Receiver<u64> {
    self.revision.subscribe()
  }

  fn bump_revision(&self) {
    let next = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
    self.revision.send_replace(next);
  }

  /// Replay queued mutations in ascending sequence order.
  ///
  /// Stops at the first mutation that stays queued. If a flush is already in
  /// progress this returns immediately with a coalesced report.
  pub async fn flush(&self) -> FlushReport {
    let Ok(_guard) = self.flush_lock.try_lock() else {
      debug!("flush already in progress");
      return FlushReport::coalesced();
    };

    let contents = match self.store.read_queue() {
      Ok(contents) => contents,
      Err(e) => {
        warn!(error = %e, "could not read mutation queue");
        return FlushReport {
          halted: true,
          ..FlushReport::default()
        };
      }
    };

    let mut report = FlushReport::default();
    // Undecodable records can never be sent; drop them so they stop blocking.
    for record in contents.unreadable {
      warn!(id = record.id, error = %record.message, "dropping unreadable mutation");
      self.remove(record.id);
      self.notifier.notify(MutationFailure {
        id: record.id,
        mutation: None,
        reason: FailureReason::Unreadable(record.message),
      });
      report.failed += 1;
    }

    let queued = contents.records;
    if queued.is_empty() {
      return report;
    }
    debug!(count = queued.len(), "flushing mutation queue");

    for record in &queued {
      report.dispatched += 1;
      match self.dispatch_one(record).await {
        DispatchOutcome::Confirmed => report.confirmed += 1,
        DispatchOutcome::Abandoned => report.failed += 1,
        DispatchOutcome::Retrying { backoff, .. } => {
          report.halted = true;
          report.retry_after = Some(backoff);
          break;
        }
        DispatchOutcome::Waiting => {
          report.halted = true;
          break;
        }
      }
    }

    info!(
      dispatched = report.dispatched,
      confirmed = report.confirmed,
      failed = report.failed,
      halted = report.halted,
      "flush finished"
    );
    report
  }

  async fn dispatch_one(&self, record: &QueuedMutation) -> DispatchOutcome {
    let key = record.idempotency_key(&self.actor);
    let ctx = DispatchContext {
      actor: &self.actor,
      idempotency_key: &key,
    };

    debug!(id = record.id, kind = %record.kind(), attempt = record.retry_count + 1, "dispatching");
    let timeout = self.policy.dispatch_timeout;
    let outcome = match tokio::time::timeout(
      timeout,
      dispatch(self.gateway.as_ref(), ctx, &record.mutation),
    )
    .await
    {
      Ok(result) => result,
      Err(_) => Err(DispatchError::Timeout(format!(
        "no response within {}ms",
        timeout.as_millis()
      ))),
    };
    self.monitor.observe(&outcome);

    match outcome {
      Ok(()) => {
        info!(id = record.id, kind = %record.kind(), "mutation confirmed");
        self.remove(record.id);
        DispatchOutcome::Confirmed
      }
      Err(e) if !e.is_transient() => {
        warn!(id = record.id, kind = %record.kind(), error = %e, "mutation rejected");
        self.abandon(record, FailureReason::Rejected(e));
        DispatchOutcome::Abandoned
      }
      Err(e) if !e.consumes_retry() => {
        debug!(id = record.id, error = %e, "cannot dispatch yet, waiting");
        DispatchOutcome::Waiting
      }
      Err(e) => {
        let attempts = record.retry_count + 1;
        if attempts >= self.policy.max_attempts {
          warn!(id = record.id, kind = %record.kind(), attempts, error = %e, "retry budget exhausted");
          self.abandon(
            record,
            FailureReason::RetryBudgetExhausted {
              attempts,
              last_error: e,
            },
          );
          return DispatchOutcome::Abandoned;
        }

        if let Err(store_err) = self.store.update_retry_count(record.id, attempts) {
          warn!(id = record.id, error = %store_err, "could not persist retry count");
        }
        let backoff = self.policy.backoff_for(attempts);
        info!(id = record.id, attempts, backoff_ms = backoff.as_millis() as u64, error = %e, "dispatch failed, will retry");
        DispatchOutcome::Retrying {
          retry_count: attempts,
          backoff,
        }
      }
    }
  }

  fn remove(&self, id: i64) {
    if let Err(e) = self.store.dequeue_mutation(id) {
      // Left in place it will be replayed; the idempotency key makes that safe.
      warn!(id, error = %e, "could not dequeue mutation");
    }
    self.bump_revision();
  }

  fn abandon(&self, record: &QueuedMutation, reason: FailureReason) {
    self.remove(record.id);
    self.notifier.notify(MutationFailure {
      id: record.id,
      mutation: Some(record.mutation.clone()),
      reason,
    });
  }

  /// Background loop: flush on submit, on reconnect, on a timer, and when a
  /// backoff expires. Runs until the task is dropped.
  pub async fn run(self: Arc<Self>, flush_interval: Duration) {
    let mut online = self.monitor.subscribe();
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut retry_at: Option<Instant> = None;

    loop {
      let backing_off = retry_at.is_some_and(|at| at > Instant::now());

      tokio::select! {
        _ = self.wake.notified() => {
          if backing_off || !self.monitor.is_online() {
            continue;
          }
          debug!("flush triggered by submit");
        }
        changed = online.changed() => {
          if changed.is_err() {
            return;
          }
          if !*online.borrow_and_update() {
            continue;
          }
          debug!("flush triggered by reconnect");
        }
        _ = ticker.tick() => {
          if backing_off {
            continue;
          }
          debug!("periodic flush");
        }
        _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
          debug!("flush triggered by backoff expiry");
        }
      }

      let report = self.flush().await;
      retry_at = if report.coalesced {
        // Someone else is flushing; check back rather than spin.
        Some(Instant::now() + self.policy.base_backoff)
      } else {
        report.retry_after.map(|delay| Instant::now() + delay)
      };
    }
  }
}

async fn dispatch(
  gateway: &dyn RemoteGateway,
  ctx: DispatchContext<'_>,
  mutation: &Mutation,
) -> Result<(), DispatchError> {
  match mutation {
    Mutation::AddItem {
      list_id,
      item_id,
      name,
      order,
    } => gateway.add_item(ctx, list_id, item_id, name, *order).await,
    Mutation::CheckItem { list_id, item_id } => gateway.check_item(ctx, list_id, item_id).await,
    Mutation::UncheckItem { list_id, item_id } => {
      gateway.uncheck_item(ctx, list_id, item_id).await
    }
    Mutation::ReorderItems { list_id, item_ids } => {
      gateway.reorder_items(ctx, list_id, item_ids).await
    }
  }
}
