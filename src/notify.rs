//! Sink for user-visible failure notifications.

use std::fmt;
use tokio::sync::mpsc;
use tracing::warn;

use crate::mutation::{Mutation, MutationKind};
use crate::remote::DispatchError;

/// Why a mutation was abandoned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
  /// The backend rejected the mutation outright.
  Rejected(DispatchError),
  /// Transient failures persisted past the retry budget.
  RetryBudgetExhausted {
    attempts: u32,
    last_error: DispatchError,
  },
  /// The stored record could not be decoded, so it was never sent.
  Unreadable(String),
}

/// A mutation that will never be applied remotely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationFailure {
  pub id: i64,
  /// `None` when the stored record was unreadable
  pub mutation: Option<Mutation>,
  pub reason: FailureReason,
}

impl MutationFailure {
  pub fn kind(&self) -> Option<MutationKind> {
    self.mutation.as_ref().map(Mutation::kind)
  }

  fn describe(&self) -> String {
    match &self.mutation {
      Some(mutation) => mutation.describe(),
      None => format!("apply queued change #{}", self.id),
    }
  }
}

impl fmt::Display for MutationFailure {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.reason {
      FailureReason::Rejected(e) => write!(f, "Couldn't {}: {}", self.describe(), e),
      FailureReason::RetryBudgetExhausted {
        attempts,
        last_error,
      } => write!(
        f,
        "Couldn't {} after {} attempts: {}",
        self.describe(),
        attempts,
        last_error
      ),
      FailureReason::Unreadable(message) => {
        write!(f, "Couldn't {}, it was damaged in storage: {}", self.describe(), message)
      }
    }
  }
}

/// Receives failures the user needs to hear about.
pub trait Notifier: Send + Sync {
  fn notify(&self, failure: MutationFailure);
}

/// Writes failures to the log only.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
  fn notify(&self, failure: MutationFailure) {
    let kind = failure.kind().map(|k| k.as_str());
    warn!(id = failure.id, kind, "{}", failure);
  }
}

/// Forwards failures over a channel to whatever renders them.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  tx: mpsc::UnboundedSender<MutationFailure>,
}

impl ChannelNotifier {
  pub fn new() -> (Self, mpsc::UnboundedReceiver<MutationFailure>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Self { tx }, rx)
  }
}

impl Notifier for ChannelNotifier {
  fn notify(&self, failure: MutationFailure) {
    // Receiver gone means nobody is displaying; fall back to the log.
    if let Err(mpsc::error::SendError(failure)) = self.tx.send(failure) {
      LogNotifier.notify(failure);
    }
  }
}
