//! Snapshot records for lists and items.
//!
//! These mirror the shapes the backend returns. Local copies are advisory:
//! they exist for offline display and are replaced wholesale whenever a
//! fresh snapshot arrives.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A shared list as returned by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct List {
  pub id: String,
  pub name: String,
  pub owner_id: String,
  #[serde(default)]
  pub category_id: Option<String>,
  pub created_at: DateTime<Utc>,
}

/// A single list item as returned by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
  pub id: String,
  pub list_id: String,
  pub name: String,
  #[serde(default)]
  pub checked: bool,
  pub created_by: String,
  #[serde(default)]
  pub checked_by: Option<String>,
  pub created_at: DateTime<Utc>,
  #[serde(default)]
  pub checked_at: Option<DateTime<Utc>>,
  /// Manual sort position; `None` keeps the backend's natural order.
  #[serde(default)]
  pub order: Option<i64>,
  /// Server-side last modification time, when the backend reports one.
  #[serde(default)]
  pub updated_at: Option<DateTime<Utc>>,
}

impl Item {
  /// Latest server timestamp known to have touched this item.
  pub fn last_modified(&self) -> Option<DateTime<Utc>> {
    match (self.checked_at, self.updated_at) {
      (Some(a), Some(b)) => Some(a.max(b)),
      (a, b) => a.or(b),
    }
  }
}

/// A record read back from the local cache along with its freshness.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedEntity<T> {
  pub entity: T,
  /// When the record was written to the cache
  pub cached_at: DateTime<Utc>,
}

/// Shorthand for a cached list snapshot.
pub type CachedList = CachedEntity<List>;

/// Shorthand for a cached item snapshot.
pub type CachedItem = CachedEntity<Item>;

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  fn item() -> Item {
    Item {
      id: "i1".to_string(),
      list_id: "l1".to_string(),
      name: "Milk".to_string(),
      checked: false,
      created_by: "u1".to_string(),
      checked_by: None,
      created_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
      checked_at: None,
      order: None,
      updated_at: None,
    }
  }

  #[test]
  fn test_last_modified_prefers_latest() {
    let mut it = item();
    assert_eq!(it.last_modified(), None);

    let early = Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap();
    let late = Utc.with_ymd_and_hms(2026, 1, 3, 0, 0, 0).unwrap();
    it.checked_at = Some(late);
    it.updated_at = Some(early);
    assert_eq!(it.last_modified(), Some(late));

    it.checked_at = None;
    assert_eq!(it.last_modified(), Some(early));
  }

  #[test]
  fn test_item_deserializes_camel_case_with_defaults() {
    let json = r#"{
      "id": "i1",
      "listId": "l1",
      "name": "Eggs",
      "createdBy": "u1",
      "createdAt": "2026-01-01T00:00:00Z"
    }"#;
    let it: Item = serde_json::from_str(json).unwrap();
    assert_eq!(it.list_id, "l1");
    assert!(!it.checked);
    assert_eq!(it.order, None);
  }
}
