use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use listsync::connectivity::ConnectivityMonitor;
use listsync::mutation::{Mutation, MutationKind};
use listsync::notify::FailureReason;
use listsync::queue::{MutationQueue, RetryPolicy};
use listsync::remote::DispatchError;
use listsync::snapshot::SnapshotCache;
use listsync::store::{DegradingStore, LocalStore, MemoryStore, SqliteStore};
use listsync::testing::{item, FakeBackend, FlakyStore, RecordingNotifier};
use listsync::view::ListView;

struct Client {
  backend: FakeBackend,
  notifier: RecordingNotifier,
  monitor: Arc<ConnectivityMonitor>,
  queue: Arc<MutationQueue>,
  view: Arc<ListView>,
}

fn client_with_store(store: Arc<dyn LocalStore>, backend: FakeBackend, online: bool) -> Client {
  let notifier = RecordingNotifier::new();
  let monitor = Arc::new(ConnectivityMonitor::new(online));
  let queue = Arc::new(
    MutationQueue::new(
      store.clone(),
      Arc::new(backend.clone()),
      Arc::new(notifier.clone()),
      monitor.clone(),
      "u1",
    )
    .with_policy(RetryPolicy {
      dispatch_timeout: Duration::from_millis(500),
      ..RetryPolicy::default()
    }),
  );
  let snapshots = SnapshotCache::new(store, Arc::new(backend.clone()));
  let view = Arc::new(ListView::new("l1", queue.clone(), snapshots));
  Client {
    backend,
    notifier,
    monitor,
    queue,
    view,
  }
}

fn client(online: bool) -> Client {
  client_with_store(Arc::new(MemoryStore::new()), FakeBackend::new(), online)
}

fn ordered(id: &str, order: i64) -> listsync::model::Item {
  let mut it = item(id, "l1");
  it.order = Some(order);
  it
}

fn row_ids(view: &ListView) -> Vec<String> {
  view.items().into_iter().map(|r| r.item.id).collect()
}

#[tokio::test(start_paused = true)]
async fn test_add_offline_then_reconnect_clears_optimistic_flag() {
  let c = client(false);
  let worker = tokio::spawn(c.queue.clone().run(Duration::from_secs(3600)));
  tokio::time::sleep(Duration::from_millis(10)).await;

  c.view.submit(Mutation::add_item("l1", "Milk")).unwrap();
  let rows = c.view.items();
  assert_eq!(rows.len(), 1);
  assert_eq!(rows[0].item.name, "Milk");
  assert!(rows[0].is_optimistic);

  tokio::time::sleep(Duration::from_millis(10)).await;
  assert!(c.backend.calls().is_empty());

  c.monitor.set_online(true);
  tokio::time::sleep(Duration::from_millis(10)).await;
  assert_eq!(c.backend.calls().len(), 1);
  assert_eq!(c.backend.calls()[0].kind, MutationKind::AddItem);
  assert!(c.queue.pending().unwrap().is_empty());

  c.view.refresh().await.unwrap();
  let rows = c.view.items();
  assert_eq!(rows.len(), 1);
  assert_eq!(rows[0].item.name, "Milk");
  assert!(!rows[0].is_optimistic);

  worker.abort();
}

#[tokio::test]
async fn test_check_then_uncheck_dispatch_in_order() {
  let c = client(true);
  c.backend.seed_items("l1", vec![item("x", "l1")]);

  c.view.submit(Mutation::check_item("l1", "x")).unwrap();
  c.view.submit(Mutation::uncheck_item("l1", "x")).unwrap();

  let report = c.queue.flush().await;
  assert_eq!(report.confirmed, 2);

  let kinds: Vec<_> = c.backend.calls().iter().map(|call| call.kind).collect();
  assert_eq!(kinds, vec![MutationKind::CheckItem, MutationKind::UncheckItem]);
  assert!(!c.backend.items("l1")[0].checked);
}

#[tokio::test(start_paused = true)]
async fn test_reorder_exhausting_budget_reverts_order() {
  let c = client(true);
  c.backend
    .seed_items("l1", vec![ordered("a", 0), ordered("b", 1), ordered("c", 2)]);
  c.view.refresh().await.unwrap();

  for _ in 0..3 {
    c.backend.fail_next(DispatchError::Timeout("slow".into()));
  }
  c.view
    .submit(Mutation::reorder_items(
      "l1",
      vec!["c".into(), "a".into(), "b".into()],
    ))
    .unwrap();
  assert_eq!(row_ids(&c.view), vec!["c", "a", "b"]);

  for _ in 0..3 {
    c.queue.flush().await;
  }

  assert!(c.queue.pending().unwrap().is_empty());
  let failures = c.notifier.failures();
  assert_eq!(failures.len(), 1);
  assert!(matches!(
    failures[0].reason,
    FailureReason::RetryBudgetExhausted { attempts: 3, .. }
  ));

  c.view.reproject();
  assert_eq!(row_ids(&c.view), vec!["a", "b", "c"]);
  assert!(c.view.items().iter().all(|r| !r.is_optimistic));
}

#[tokio::test]
async fn test_permanent_failure_rolls_back_and_notifies_once() {
  let c = client(true);
  c.backend.seed_items("l1", vec![item("x", "l1")]);
  c.view.refresh().await.unwrap();

  c.backend
    .fail_next(DispatchError::Conflict("item was deleted".into()));
  let id = c.view.submit(Mutation::check_item("l1", "x")).unwrap();
  assert!(c.view.items()[0].item.checked);

  let report = c.queue.flush().await;
  assert_eq!(report.failed, 1);
  assert!(c.queue.pending().unwrap().iter().all(|m| m.id != id));

  c.view.reproject();
  let rows = c.view.items();
  assert!(!rows[0].item.checked);
  assert!(!rows[0].is_optimistic);

  let failures = c.notifier.failures();
  assert_eq!(failures.len(), 1);
  assert_eq!(failures[0].id, id);
  assert!(failures[0].to_string().starts_with("Couldn't check item x"));
}

#[tokio::test]
async fn test_successful_flush_converges_to_snapshot() {
  let c = client(true);
  c.backend
    .seed_items("l1", vec![item("a", "l1"), item("b", "l1")]);
  c.view.refresh().await.unwrap();

  let bread = Mutation::add_item("l1", "Bread");
  let Mutation::AddItem { item_id: bread_id, .. } = bread.clone() else {
    unreachable!()
  };
  c.view.submit(bread).unwrap();
  c.view.submit(Mutation::check_item("l1", "a")).unwrap();
  c.view.submit(Mutation::check_item("l1", &bread_id)).unwrap();
  c.view
    .submit(Mutation::reorder_items(
      "l1",
      vec![bread_id.clone(), "b".into(), "a".into()],
    ))
    .unwrap();
  c.view.submit(Mutation::uncheck_item("l1", "a")).unwrap();
  assert!(c.view.items().iter().any(|r| r.is_optimistic));

  let report = c.queue.flush().await;
  assert_eq!(report.confirmed, 5);
  assert!(c.queue.pending().unwrap().is_empty());
  assert!(c.notifier.failures().is_empty());

  c.view.refresh().await.unwrap();
  let rows = c.view.items();
  let projected: Vec<_> = rows.iter().map(|r| r.item.clone()).collect();
  assert_eq!(projected, c.backend.items("l1"));
  assert!(rows.iter().all(|r| !r.is_optimistic));
  assert_eq!(row_ids(&c.view), vec![bread_id, "b".to_string(), "a".to_string()]);
}

#[tokio::test]
async fn test_snapshot_arriving_before_dequeue_shows_item_once() {
  let c = client(true);
  c.backend.seed_items("l1", vec![item("x", "l1")]);
  c.view.refresh().await.unwrap();
  c.view.submit(Mutation::check_item("l1", "x")).unwrap();

  // The server has applied the check; the queue has not heard back yet.
  let mut confirmed = item("x", "l1");
  confirmed.checked = true;
  confirmed.checked_by = Some("u1".into());
  confirmed.checked_at = Some(Utc::now());
  c.view.apply_snapshot(vec![confirmed.clone()]);

  assert_eq!(c.queue.pending().unwrap().len(), 1);
  let rows = c.view.items();
  assert_eq!(rows.len(), 1);
  assert_eq!(rows[0].item, confirmed);
  assert!(!rows[0].is_optimistic);
}

#[tokio::test]
async fn test_empty_flush_makes_no_calls() {
  let c = client(true);
  let report = c.queue.flush().await;
  assert_eq!(report.dispatched, 0);
  assert!(!report.halted);
  assert!(c.backend.calls().is_empty());
}

#[tokio::test]
async fn test_queue_survives_restart() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("cache.db");
  let backend = FakeBackend::new();

  {
    let store = Arc::new(SqliteStore::open(&path).unwrap());
    let c = client_with_store(store, backend.clone(), false);
    backend.fail_next(DispatchError::Unreachable("offline".into()));
    c.view.submit(Mutation::add_item("l1", "Milk")).unwrap();
    assert!(c.queue.flush().await.halted);
  }

  let store = Arc::new(SqliteStore::open(&path).unwrap());
  let c = client_with_store(store, backend, true);
  assert_eq!(c.queue.pending().unwrap().len(), 1);
  assert!(c.view.items()[0].is_optimistic);

  assert_eq!(c.queue.flush().await.confirmed, 1);
  assert_eq!(c.backend.items("l1")[0].name, "Milk");
}

#[tokio::test]
async fn test_storage_failure_degrades_without_losing_intents() {
  let flaky = FlakyStore::new();
  let store = Arc::new(DegradingStore::new(Box::new(flaky.clone())));
  let c = client_with_store(store.clone(), FakeBackend::new(), true);

  c.view.submit(Mutation::add_item("l1", "Milk")).unwrap();
  flaky.fail_writes();
  c.view.submit(Mutation::add_item("l1", "Eggs")).unwrap();

  assert!(store.is_degraded());
  assert_eq!(c.queue.pending().unwrap().len(), 2);
  assert_eq!(c.view.items().len(), 2);

  assert_eq!(c.queue.flush().await.confirmed, 2);
  assert_eq!(c.backend.items("l1").len(), 2);
}

#[tokio::test]
async fn test_replayed_mutation_is_applied_once() {
  let c = client(true);
  c.backend.seed_items("l1", vec![item("x", "l1")]);
  c.view.refresh().await.unwrap();
  c.view.submit(Mutation::check_item("l1", "x")).unwrap();

  // The backend applies the check, but the response never arrives.
  c.backend.lose_response_next();
  let report = c.queue.flush().await;
  assert!(report.halted);
  assert!(c.backend.items("l1")[0].checked);
  assert_eq!(c.queue.pending().unwrap()[0].retry_count, 1);

  // Someone else unchecks it before the retry goes out.
  c.backend.seed_items("l1", vec![item("x", "l1")]);

  assert_eq!(c.queue.flush().await.confirmed, 1);
  let calls = c.backend.calls();
  assert_eq!(calls.len(), 2);
  assert_eq!(calls[0].idempotency_key, calls[1].idempotency_key);
  assert!(!c.backend.items("l1")[0].checked);
}
