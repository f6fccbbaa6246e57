//! Contracts for the hosted backend this subsystem talks to.
//!
//! The queue consumes a [`RemoteGateway`] for mutations and list views consume
//! a [`SnapshotSource`] for authoritative state. [`HttpBackend`] implements
//! both over the backend's JSON API.

mod http;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{Item, List};

pub use http::HttpBackend;

/// Failure of a remote call, classified by whether retrying can help.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
  /// The backend could not be reached at all (no route, DNS, refused).
  #[error("backend unreachable: {0}")]
  Unreachable(String),
  /// The call did not complete in time.
  #[error("request timed out: {0}")]
  Timeout(String),
  /// The backend failed temporarily (5xx, rate limiting).
  #[error("backend temporarily failed: {0}")]
  Transient(String),
  /// The target no longer exists or the change conflicts with remote state.
  #[error("conflict: {0}")]
  Conflict(String),
  /// The credentials were refused. Nothing is wrong with the mutation itself.
  #[error("not authorized: {0}")]
  Unauthorized(String),
  /// The backend rejected the request as invalid.
  #[error("rejected: {0}")]
  Rejected(String),
}

impl DispatchError {
  /// Whether a later attempt might succeed.
  pub fn is_transient(&self) -> bool {
    matches!(
      self,
      DispatchError::Unreachable(_)
        | DispatchError::Timeout(_)
        | DispatchError::Transient(_)
        | DispatchError::Unauthorized(_)
    )
  }

  /// Whether the attempt counts against a mutation's retry budget.
  ///
  /// Being offline or signed out does not: the mutation waits for
  /// connectivity or fresh credentials instead.
  pub fn consumes_retry(&self) -> bool {
    matches!(self, DispatchError::Timeout(_) | DispatchError::Transient(_))
  }
}

/// Identity and dedup data sent with every mutation call.
#[derive(Debug, Clone, Copy)]
pub struct DispatchContext<'a> {
  pub actor: &'a str,
  pub idempotency_key: &'a str,
}

/// Remote mutation calls, one per mutation kind.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
  async fn add_item(
    &self,
    ctx: DispatchContext<'_>,
    list_id: &str,
    item_id: &str,
    name: &str,
    order: Option<i64>,
  ) -> Result<(), DispatchError>;

  async fn check_item(
    &self,
    ctx: DispatchContext<'_>,
    list_id: &str,
    item_id: &str,
  ) -> Result<(), DispatchError>;

  async fn uncheck_item(
    &self,
    ctx: DispatchContext<'_>,
    list_id: &str,
    item_id: &str,
  ) -> Result<(), DispatchError>;

  async fn reorder_items(
    &self,
    ctx: DispatchContext<'_>,
    list_id: &str,
    item_ids: &[String],
  ) -> Result<(), DispatchError>;

  /// Cheap reachability check used by the connectivity monitor.
  async fn ping(&self) -> Result<(), DispatchError>;
}

/// Source of authoritative full-replacement snapshots.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
  async fn fetch_lists(&self) -> Result<Vec<List>, DispatchError>;

  async fn fetch_items(&self, list_id: &str) -> Result<Vec<Item>, DispatchError>;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_classification() {
    let offline = DispatchError::Unreachable("down".into());
    assert!(offline.is_transient());
    assert!(!offline.consumes_retry());

    let signed_out = DispatchError::Unauthorized("401".into());
    assert!(signed_out.is_transient());
    assert!(!signed_out.consumes_retry());

    let timeout = DispatchError::Timeout("slow".into());
    assert!(timeout.is_transient());
    assert!(timeout.consumes_retry());

    for permanent in [
      DispatchError::Conflict("gone".into()),
      DispatchError::Rejected("bad".into()),
    ] {
      assert!(!permanent.is_transient());
      assert!(!permanent.consumes_retry());
    }
  }
}
