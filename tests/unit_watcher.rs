//! Watcher behaviour over an in-memory store
//!
//! Dispatch semantics under test:
//! - `ClaimThenDispatch` (default) is exactly-once, even with several
//!   watchers racing over the same groups and a late confirmation
//!   recreating a group between their reads and claims.
//! - `ReapAfterDispatch` is at-least-once: when the reap fails the next tick
//!   fires the handlers again.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parallel_watcher::{
    DispatchMode, KvStore, MemoryStore, Result, TaskResult, Tracker, WatcherConfig, WatcherError,
};

type Calls = Arc<Mutex<Vec<Vec<TaskResult>>>>;

fn config() -> WatcherConfig {
    WatcherConfig::new("memory://").with_poll_interval(Duration::from_millis(10))
}

fn tracker() -> Tracker<MemoryStore> {
    Tracker::with_store(MemoryStore::new(), config()).unwrap()
}

fn record_calls<S: KvStore>(tracker: &Tracker<S>, group_type: &str) -> Calls {
    let calls: Calls = Arc::new(Mutex::new(Vec::new()));
    let sink = calls.clone();
    tracker.on_complete(group_type, move |results: &[TaskResult]| {
        sink.lock().push(results.to_vec());
        Ok(())
    });
    calls
}

/// Store wrapper that fails selected operations on demand
#[derive(Clone, Default)]
struct FlakyStore {
    inner: MemoryStore,
    failing_reads: Arc<Mutex<Vec<String>>>,
    failing_deletes: Arc<AtomicUsize>,
    failing_claims: Arc<AtomicUsize>,
    failing_expires: Arc<AtomicUsize>,
}

impl FlakyStore {
    fn fail_reads_of(&self, key: &str) {
        self.failing_reads.lock().push(key.to_string());
    }

    fn heal_reads(&self) {
        self.failing_reads.lock().clear();
    }

    fn fail_next_deletes(&self, n: usize) {
        self.failing_deletes.store(n, Ordering::SeqCst);
    }

    fn fail_next_claims(&self, n: usize) {
        self.failing_claims.store(n, Ordering::SeqCst);
    }

    fn fail_next_expires(&self, n: usize) {
        self.failing_expires.store(n, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn blip() -> WatcherError {
        WatcherError::Store {
            message: "connection reset".into(),
        }
    }
}

#[async_trait]
impl KvStore for FlakyStore {
    async fn hset(&self, key: &str, fields: &[(&str, &str)]) -> Result<()> {
        self.inner.hset(key, fields).await
    }

    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        self.inner.hset_nx(key, field, value).await
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        if Self::take_failure(&self.failing_claims) {
            return Err(Self::blip());
        }
        self.inner.hdel(key, field).await
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        if self.failing_reads.lock().iter().any(|k| k == key) {
            return Err(Self::blip());
        }
        self.inner.hgetall(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        if Self::take_failure(&self.failing_expires) {
            return Err(Self::blip());
        }
        self.inner.expire(key, ttl).await
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        self.inner.ttl(key).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        if Self::take_failure(&self.failing_deletes) {
            return Err(Self::blip());
        }
        self.inner.delete(key).await
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.keys_with_prefix(prefix).await
    }
}

/// Store where reads yield (so two watchers interleave) and a reporter's
/// retry lands right after the first reap, recreating the key
#[derive(Clone, Default)]
struct LateRetryStore {
    inner: MemoryStore,
    retried: Arc<AtomicBool>,
}

#[async_trait]
impl KvStore for LateRetryStore {
    async fn hset(&self, key: &str, fields: &[(&str, &str)]) -> Result<()> {
        self.inner.hset(key, fields).await
    }

    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        self.inner.hset_nx(key, field, value).await
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        self.inner.hdel(key, field).await
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let fields = self.inner.hgetall(key).await?;
        tokio::task::yield_now().await;
        Ok(fields)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.inner.expire(key, ttl).await
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        self.inner.ttl(key).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let removed = self.inner.delete(key).await?;
        if !self.retried.swap(true, Ordering::SeqCst) {
            self.inner.hset_nx(key, "a", "retry").await?;
        }
        Ok(removed)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.keys_with_prefix(prefix).await
    }
}

#[tokio::test]
async fn test_example_scenario() {
    let tracker = tracker();
    let calls = record_calls(&tracker, "image-resize");

    let g1 = tracker.create_group("image-resize", 3, 60).await.unwrap();
    for task in ["a", "b", "c"] {
        tracker.confirm_task(&g1, &format!("{}.png", task), Some(task)).await.unwrap();
    }

    let summary = tracker.tick().await;
    assert_eq!(summary.completed, 1);

    let calls = calls.lock();
    assert_eq!(calls.len(), 1);
    let mut ids: Vec<&str> = calls[0].iter().map(|r| r.task_id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, vec!["a", "b", "c"]);
    assert!(calls[0]
        .iter()
        .all(|r| r.group_id == g1 && r.group_type == "image-resize"));
    assert!(tracker.groups().read_all(&g1).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_fires_exactly_once_with_n_tuples() {
    let tracker = tracker();
    let calls = record_calls(&tracker, "batch");

    let id = tracker.create_group("batch", 5, 60).await.unwrap();
    for i in 0..4 {
        tracker.confirm_task(&id, "ok", Some(format!("t{}", i).as_str())).await.unwrap();
    }

    let summary = tracker.tick().await;
    assert_eq!(summary.pending, 1);
    assert!(calls.lock().is_empty());

    tracker.confirm_task(&id, "ok", Some("t4")).await.unwrap();
    tracker.tick().await;
    tracker.tick().await;

    let calls = calls.lock();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].len(), 5);
}

#[tokio::test]
async fn test_duplicate_confirmation_keeps_first_result() {
    let tracker = tracker();
    let calls = record_calls(&tracker, "t");

    let id = tracker.create_group("t", 2, 60).await.unwrap();
    tracker.confirm_task(&id, "first", Some("a")).await.unwrap();
    tracker.confirm_task(&id, "second", Some("a")).await.unwrap();

    assert_eq!(tracker.tick().await.pending, 1);

    tracker.confirm_task(&id, "other", Some("b")).await.unwrap();
    tracker.tick().await;

    let calls = calls.lock();
    let a = calls[0].iter().find(|r| r.task_id == "a").unwrap();
    assert_eq!(a.result, "first");
}

#[tokio::test(start_paused = true)]
async fn test_expired_group_never_fires() {
    let tracker = tracker();
    let calls = record_calls(&tracker, "t");

    let id = tracker.create_group("t", 2, 5).await.unwrap();
    tracker.confirm_task(&id, "r", Some("a")).await.unwrap();

    tokio::time::advance(Duration::from_secs(6)).await;

    // A late confirmation recreates a bare record, which is reaped as corrupt.
    tracker.confirm_task(&id, "r", Some("b")).await.unwrap();

    let summary = tracker.tick().await;
    assert_eq!(summary.completed, 0);
    assert_eq!(summary.corrupt, 1);
    assert!(calls.lock().is_empty());
    assert!(tracker.groups().store().is_empty());
}

#[tokio::test]
async fn test_confirmations_do_not_extend_ttl() {
    let tracker = tracker();
    let id = tracker.create_group("t", 3, 60).await.unwrap();
    let before = tracker.groups().ttl(&id).await.unwrap().unwrap();

    tracker.confirm_task(&id, "r", Some("a")).await.unwrap();
    let after = tracker.groups().ttl(&id).await.unwrap().unwrap();
    assert!(after <= before);
}

#[tokio::test]
async fn test_corrupt_groups_reaped_in_one_tick() {
    let tracker = tracker();
    let calls = record_calls(&tracker, "t");
    let store = tracker.groups().store().clone();

    store
        .hset("parallel-watcher:no-count", &[("type", "t"), ("a", "1")])
        .await
        .unwrap();
    store
        .hset("parallel-watcher:bad-count", &[("type", "t"), ("count", "many"), ("a", "1")])
        .await
        .unwrap();
    store
        .hset("parallel-watcher:no-type", &[("count", "1"), ("a", "1")])
        .await
        .unwrap();

    let summary = tracker.tick().await;
    assert_eq!(summary.corrupt, 3);
    assert!(calls.lock().is_empty());
    assert!(store.is_empty());
    assert_eq!(tracker.metrics().groups_corrupt.get(), 3);
}

#[tokio::test]
async fn test_unrelated_types_do_not_cross_trigger() {
    let tracker = tracker();
    let resize = record_calls(&tracker, "resize");
    let encode = record_calls(&tracker, "encode");

    let r = tracker.create_group("resize", 2, 60).await.unwrap();
    let e = tracker.create_group("encode", 2, 60).await.unwrap();

    tracker.confirm_task(&r, "r1", Some("1")).await.unwrap();
    tracker.confirm_task(&e, "e1", Some("1")).await.unwrap();
    tracker.confirm_task(&r, "r2", Some("2")).await.unwrap();

    tracker.tick().await;
    assert_eq!(resize.lock().len(), 1);
    assert!(encode.lock().is_empty());

    tracker.confirm_task(&e, "e2", Some("2")).await.unwrap();
    tracker.tick().await;

    assert_eq!(resize.lock().len(), 1);
    assert_eq!(encode.lock().len(), 1);
    assert!(encode.lock()[0].iter().all(|t| t.group_id == e));
}

#[tokio::test]
async fn test_handlers_share_tuples_in_registration_order() {
    let tracker = tracker();
    let order = Arc::new(Mutex::new(Vec::new()));

    for name in ["first", "second"] {
        let order = order.clone();
        tracker.on_complete("t", move |results: &[TaskResult]| {
            order.lock().push((name, results.to_vec()));
            Ok(())
        });
    }

    let id = tracker.create_group("t", 2, 60).await.unwrap();
    tracker.confirm_task(&id, "x", Some("a")).await.unwrap();
    tracker.confirm_task(&id, "y", Some("b")).await.unwrap();
    tracker.tick().await;

    let order = order.lock();
    assert_eq!(order.len(), 2);
    assert_eq!(order[0].0, "first");
    assert_eq!(order[1].0, "second");
    assert_eq!(order[0].1, order[1].1);
}

#[tokio::test]
async fn test_failing_handler_still_reaps() {
    let tracker = tracker();
    tracker.on_complete("t", |_: &[TaskResult]| Err("downstream unavailable".into()));
    let calls = record_calls(&tracker, "t");

    let id = tracker.create_group("t", 1, 60).await.unwrap();
    tracker.confirm_task(&id, "r", Some("a")).await.unwrap();

    let summary = tracker.tick().await;
    assert_eq!(summary.completed, 1);
    assert_eq!(calls.lock().len(), 1);
    assert_eq!(tracker.metrics().handler_failures.get(), 1);
    assert!(tracker.groups().store().is_empty());
}

#[tokio::test]
async fn test_completed_group_without_handlers_is_reaped() {
    let tracker = tracker();
    let id = tracker.create_group("orphan", 1, 60).await.unwrap();
    tracker.confirm_task(&id, "r", None).await.unwrap();

    assert_eq!(tracker.tick().await.completed, 1);
    assert!(tracker.groups().store().is_empty());
}

#[tokio::test]
async fn test_transient_read_error_skips_only_that_group() {
    let store = FlakyStore::default();
    let tracker = Tracker::with_store(store.clone(), config()).unwrap();
    let calls = record_calls(&tracker, "t");

    let flaky = tracker.create_group("t", 1, 60).await.unwrap();
    let healthy = tracker.create_group("t", 1, 60).await.unwrap();
    tracker.confirm_task(&flaky, "r", Some("a")).await.unwrap();
    tracker.confirm_task(&healthy, "r", Some("a")).await.unwrap();

    store.fail_reads_of(&tracker.groups().key(&flaky));
    let summary = tracker.tick().await;
    assert_eq!(summary.errors, 1);
    assert_eq!(summary.completed, 1);
    assert_eq!(calls.lock()[0][0].group_id, healthy);

    store.heal_reads();
    let summary = tracker.tick().await;
    assert_eq!(summary.completed, 1);
    assert_eq!(calls.lock().len(), 2);
    assert_eq!(calls.lock()[1][0].group_id, flaky);
}

#[tokio::test]
async fn test_claim_mode_failed_claim_retries_without_firing() {
    let store = FlakyStore::default();
    let tracker = Tracker::with_store(store.clone(), config()).unwrap();
    let calls = record_calls(&tracker, "t");

    let id = tracker.create_group("t", 1, 60).await.unwrap();
    tracker.confirm_task(&id, "r", Some("a")).await.unwrap();

    store.fail_next_claims(1);
    let summary = tracker.tick().await;
    assert_eq!(summary.errors, 1);
    assert!(calls.lock().is_empty());

    tracker.tick().await;
    assert_eq!(calls.lock().len(), 1);
}

#[tokio::test]
async fn test_claim_mode_failed_reap_never_refires() {
    let store = FlakyStore::default();
    let tracker = Tracker::with_store(store.clone(), config()).unwrap();
    let calls = record_calls(&tracker, "t");

    let id = tracker.create_group("t", 1, 60).await.unwrap();
    tracker.confirm_task(&id, "r", Some("a")).await.unwrap();

    store.fail_next_deletes(1);
    let summary = tracker.tick().await;
    assert_eq!(summary.completed, 1);
    assert_eq!(calls.lock().len(), 1);

    // The claimed leftover has no count and goes out as corrupt.
    let summary = tracker.tick().await;
    assert_eq!(summary.corrupt, 1);
    assert_eq!(calls.lock().len(), 1);
    assert!(store.inner.is_empty());
}

#[tokio::test]
async fn test_late_retry_between_watchers_fires_once() {
    let store = LateRetryStore::default();
    let tracker = Tracker::with_store(store.clone(), config()).unwrap();
    let calls = record_calls(&tracker, "t");

    let id = tracker.create_group("t", 1, 60).await.unwrap();
    tracker.confirm_task(&id, "r", Some("a")).await.unwrap();

    let first = tracker.watcher();
    let second = tracker.watcher();
    let (a, b) = tokio::join!(first.tick(), second.tick());

    assert_eq!(a.completed + b.completed, 1);
    assert_eq!(calls.lock().len(), 1);

    // The retry left a bare record behind; it is reaped without firing.
    let summary = tracker.tick().await;
    assert_eq!(summary.corrupt, 1);
    assert_eq!(calls.lock().len(), 1);
    assert!(store.inner.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failed_expiry_leaves_no_group_behind() {
    let store = FlakyStore::default();
    let tracker = Tracker::with_store(store.clone(), config()).unwrap();

    store.fail_next_expires(1);
    let err = tracker.create_group("t", 3, 5).await.unwrap_err();
    assert!(err.is_retryable());
    assert!(store.inner.is_empty());

    tokio::time::advance(Duration::from_secs(3600)).await;
    let summary = tracker.tick().await;
    assert_eq!(summary.scanned, 0);
    assert_eq!(summary.pending, 0);
}

#[tokio::test]
async fn test_reap_after_mode_is_at_least_once() {
    let store = FlakyStore::default();
    let config = config().with_dispatch_mode(DispatchMode::ReapAfterDispatch);
    let tracker = Tracker::with_store(store.clone(), config).unwrap();
    let calls = record_calls(&tracker, "t");

    let id = tracker.create_group("t", 1, 60).await.unwrap();
    tracker.confirm_task(&id, "r", Some("a")).await.unwrap();

    store.fail_next_deletes(1);
    tracker.tick().await;
    assert_eq!(calls.lock().len(), 1);

    // The reap failed, so the same completed group is dispatched again.
    tracker.tick().await;
    {
        let calls = calls.lock();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], calls[1]);
    }

    tracker.tick().await;
    assert_eq!(calls.lock().len(), 2);
}

#[tokio::test]
async fn test_racing_watchers_dispatch_once_in_claim_mode() {
    let tracker = tracker();
    let calls = record_calls(&tracker, "t");

    let mut ids = Vec::new();
    for _ in 0..20 {
        let id = tracker.create_group("t", 1, 60).await.unwrap();
        tracker.confirm_task(&id, "r", Some("only")).await.unwrap();
        ids.push(id);
    }

    let first = tracker.watcher();
    let second = tracker.watcher();
    let (a, b) = tokio::join!(first.tick(), second.tick());

    assert_eq!(a.completed + b.completed, 20);
    assert_eq!(calls.lock().len(), 20);
}

#[tokio::test]
async fn test_background_watcher_stops_cleanly() {
    let tracker = tracker();
    let calls = record_calls(&tracker, "t");
    let handle = tracker.spawn_watcher();

    let id = tracker.create_group("t", 2, 60).await.unwrap();
    tracker.confirm_task(&id, "r", Some("a")).await.unwrap();
    tracker.confirm_task(&id, "r", Some("b")).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while calls.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("watcher never dispatched");

    handle.stop().await.unwrap();

    // Nothing runs after stop returns.
    let late = tracker.create_group("t", 1, 60).await.unwrap();
    tracker.confirm_task(&late, "r", Some("a")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.lock().len(), 1);
}
