//! Optimistic item projection.
//!
//! Merges the latest authoritative snapshot of a list with the mutations still
//! sitting in the queue, producing the rows a UI should render. The merge is a
//! pure function of its inputs: no I/O, no mutation of either side.
//!
//! A queued mutation is considered superseded, and its overlay dropped, once
//! the snapshot shows the server has touched the target at or after the moment
//! the mutation was enqueued:
//!
//! - `AddItem`: the item id is present in the snapshot.
//! - `CheckItem`/`UncheckItem`: the remote item's last modification
//!   (`checked_at` or `updated_at`) is at or after `enqueued_at`.
//! - `ReorderItems`: every mentioned item present remotely was modified at or
//!   after `enqueued_at`.
//!
//! A reorder overlay gives the listed items positions `0..n` in the requested
//! order, exactly as the backend does on confirmation, and leaves every other
//! item's order untouched. Where positions collide the snapshot order breaks
//! the tie, so the projected rows match what the confirmed snapshot will show.
//!
//! Mutations are folded in sequence order, so a later overlay on the same item
//! wins. Finally, any row whose overlaid state equals the remote state is shown
//! as the remote row, unflagged.

use serde::Serialize;
use std::collections::HashMap;

use crate::model::Item;
use crate::mutation::{Mutation, QueuedMutation};

/// An item as rendered, annotated with whether it reflects unconfirmed intent.
///
/// Derived on every projection; never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimisticItem {
  #[serde(flatten)]
  pub item: Item,
  pub is_optimistic: bool,
}

impl OptimisticItem {
  fn confirmed(item: Item) -> Self {
    Self {
      item,
      is_optimistic: false,
    }
  }
}

/// Project `snapshot` through the queued mutations that target `list_id`.
///
/// `actor` is attributed as creator/checker on rows synthesized locally.
/// Snapshot order is kept unless a reorder overlay applies, in which case rows
/// are sorted by manual order with unordered rows last.
pub fn project(
  list_id: &str,
  actor: &str,
  snapshot: &[Item],
  queue: &[QueuedMutation],
) -> Vec<OptimisticItem> {
  let remote: HashMap<&str, &Item> = snapshot.iter().map(|i| (i.id.as_str(), i)).collect();
  let mut rows: Vec<OptimisticItem> = snapshot.iter().cloned().map(OptimisticItem::confirmed).collect();

  let mut ordered: Vec<&QueuedMutation> = queue
    .iter()
    .filter(|m| m.mutation.list_id() == list_id)
    .collect();
  ordered.sort_by_key(|m| m.id);

  let mut reordered = false;
  for record in ordered {
    let superseded = |id: &str| {
      remote
        .get(id)
        .and_then(|i| i.last_modified())
        .is_some_and(|at| at >= record.enqueued_at)
    };

    match &record.mutation {
      Mutation::AddItem {
        item_id,
        name,
        order,
        ..
      } => {
        if remote.contains_key(item_id.as_str()) || rows.iter().any(|r| &r.item.id == item_id) {
          continue;
        }
        rows.push(OptimisticItem {
          item: Item {
            id: item_id.clone(),
            list_id: list_id.to_string(),
            name: name.clone(),
            checked: false,
            created_by: actor.to_string(),
            checked_by: None,
            created_at: record.enqueued_at,
            checked_at: None,
            order: *order,
            updated_at: None,
          },
          is_optimistic: true,
        });
      }
      Mutation::CheckItem { item_id, .. } | Mutation::UncheckItem { item_id, .. } => {
        if superseded(item_id) {
          continue;
        }
        let checked = matches!(record.mutation, Mutation::CheckItem { .. });
        if let Some(row) = rows.iter_mut().find(|r| &r.item.id == item_id) {
          row.item.checked = checked;
          row.item.checked_by = checked.then(|| actor.to_string());
          row.item.checked_at = checked.then_some(record.enqueued_at);
          row.is_optimistic = true;
        }
      }
      Mutation::ReorderItems { item_ids, .. } => {
        let mut mentioned_remote = item_ids.iter().filter(|id| remote.contains_key(id.as_str())).peekable();
        if mentioned_remote.peek().is_some() && mentioned_remote.all(|id| superseded(id)) {
          continue;
        }
        for (position, id) in item_ids.iter().enumerate() {
          if let Some(row) = rows.iter_mut().find(|r| &r.item.id == id) {
            row.item.order = Some(position as i64);
            row.is_optimistic = true;
            reordered = true;
          }
        }
      }
    }
  }

  // Prefer remote truth wherever the overlay ended up agreeing with it.
  for row in rows.iter_mut().filter(|r| r.is_optimistic) {
    if let Some(remote_item) = remote.get(row.item.id.as_str()) {
      if remote_item.checked == row.item.checked && remote_item.order == row.item.order {
        *row = OptimisticItem::confirmed((*remote_item).clone());
      }
    }
  }

  if reordered {
    // Stable, so equal positions keep snapshot order.
    rows.sort_by_key(|r| (r.item.order.is_none(), r.item.order));
  }
  rows
}
