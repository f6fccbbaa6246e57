//! Locally-originated mutation intents and their queued form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Discriminant of a [`Mutation`], stored alongside the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
  AddItem,
  CheckItem,
  UncheckItem,
  ReorderItems,
}

impl MutationKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      MutationKind::AddItem => "add_item",
      MutationKind::CheckItem => "check_item",
      MutationKind::UncheckItem => "uncheck_item",
      MutationKind::ReorderItems => "reorder_items",
    }
  }
}

impl fmt::Display for MutationKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for MutationKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "add_item" => Ok(MutationKind::AddItem),
      "check_item" => Ok(MutationKind::CheckItem),
      "uncheck_item" => Ok(MutationKind::UncheckItem),
      "reorder_items" => Ok(MutationKind::ReorderItems),
      other => Err(format!("unknown mutation kind '{}'", other)),
    }
  }
}

/// A state-changing intent originating from the user.
///
/// Payloads reference lists and items by id only, so a queued mutation stays
/// meaningful even after the cached snapshot it was created against is gone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Mutation {
  AddItem {
    list_id: String,
    /// Client-generated id, so later mutations can target the item before
    /// the backend has confirmed it.
    item_id: String,
    name: String,
    #[serde(default)]
    order: Option<i64>,
  },
  CheckItem {
    list_id: String,
    item_id: String,
  },
  UncheckItem {
    list_id: String,
    item_id: String,
  },
  ReorderItems {
    list_id: String,
    item_ids: Vec<String>,
  },
}

impl Mutation {
  /// Build an `AddItem` with a freshly generated item id.
  pub fn add_item(list_id: impl Into<String>, name: impl Into<String>) -> Self {
    Mutation::AddItem {
      list_id: list_id.into(),
      item_id: ulid::Ulid::new().to_string(),
      name: name.into(),
      order: None,
    }
  }

  pub fn check_item(list_id: impl Into<String>, item_id: impl Into<String>) -> Self {
    Mutation::CheckItem {
      list_id: list_id.into(),
      item_id: item_id.into(),
    }
  }

  pub fn uncheck_item(list_id: impl Into<String>, item_id: impl Into<String>) -> Self {
    Mutation::UncheckItem {
      list_id: list_id.into(),
      item_id: item_id.into(),
    }
  }

  pub fn reorder_items(list_id: impl Into<String>, item_ids: Vec<String>) -> Self {
    Mutation::ReorderItems {
      list_id: list_id.into(),
      item_ids,
    }
  }

  pub fn kind(&self) -> MutationKind {
    match self {
      Mutation::AddItem { .. } => MutationKind::AddItem,
      Mutation::CheckItem { .. } => MutationKind::CheckItem,
      Mutation::UncheckItem { .. } => MutationKind::UncheckItem,
      Mutation::ReorderItems { .. } => MutationKind::ReorderItems,
    }
  }

  pub fn list_id(&self) -> &str {
    match self {
      Mutation::AddItem { list_id, .. }
      | Mutation::CheckItem { list_id, .. }
      | Mutation::UncheckItem { list_id, .. }
      | Mutation::ReorderItems { list_id, .. } => list_id,
    }
  }

  /// Human-readable summary used in failure notifications.
  pub fn describe(&self) -> String {
    match self {
      Mutation::AddItem { name, .. } => format!("add \"{}\"", name),
      Mutation::CheckItem { item_id, .. } => format!("check item {}", item_id),
      Mutation::UncheckItem { item_id, .. } => format!("uncheck item {}", item_id),
      Mutation::ReorderItems { item_ids, .. } => format!("reorder {} items", item_ids.len()),
    }
  }
}

/// A mutation about to be enqueued; the store assigns the sequence id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMutation {
  pub mutation: Mutation,
  pub enqueued_at: DateTime<Utc>,
}

impl NewMutation {
  pub fn now(mutation: Mutation) -> Self {
    Self {
      mutation,
      enqueued_at: Utc::now(),
    }
  }
}

/// A mutation persisted in the local queue, pending remote confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMutation {
  /// Monotonic sequence id; replay order
  pub id: i64,
  pub mutation: Mutation,
  pub enqueued_at: DateTime<Utc>,
  pub retry_count: u32,
}

impl QueuedMutation {
  pub fn kind(&self) -> MutationKind {
    self.mutation.kind()
  }

  /// Stable key identifying this mutation to the backend across retries.
  pub fn idempotency_key(&self, actor: &str) -> String {
    let input = format!(
      "{}:{}:{}",
      actor,
      self.id,
      self.enqueued_at.timestamp_micros()
    );

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_kind_round_trips_through_str() {
    for kind in [
      MutationKind::AddItem,
      MutationKind::CheckItem,
      MutationKind::UncheckItem,
      MutationKind::ReorderItems,
    ] {
      assert_eq!(kind.as_str().parse::<MutationKind>(), Ok(kind));
    }
    assert!("delete_item".parse::<MutationKind>().is_err());
  }

  #[test]
  fn test_add_item_generates_unique_ids() {
    let a = Mutation::add_item("l1", "Milk");
    let b = Mutation::add_item("l1", "Milk");
    assert_ne!(a, b);
    assert_eq!(a.kind(), MutationKind::AddItem);
    assert_eq!(a.list_id(), "l1");
  }

  #[test]
  fn test_payload_is_tagged_by_kind() {
    let m = Mutation::check_item("l1", "i1");
    let json = serde_json::to_value(&m).unwrap();
    assert_eq!(json["kind"], "check_item");
    assert_eq!(json["item_id"], "i1");
  }

  #[test]
  fn test_idempotency_key_is_stable_per_record() {
    let queued = QueuedMutation {
      id: 7,
      mutation: Mutation::check_item("l1", "i1"),
      enqueued_at: Utc::now(),
      retry_count: 0,
    };
    let key = queued.idempotency_key("u1");
    assert_eq!(key.len(), 64);
    assert_eq!(key, queued.idempotency_key("u1"));

    let retried = QueuedMutation {
      retry_count: 2,
      ..queued.clone()
    };
    assert_eq!(key, retried.idempotency_key("u1"));
    assert_ne!(key, queued.idempotency_key("u2"));
  }
}
