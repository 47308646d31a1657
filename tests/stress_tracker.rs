//! Stress tests for concurrent reporters and watchers
//!
//! Run with: cargo test --release --test stress_tracker -- --nocapture

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parallel_watcher::{MemoryStore, TaskResult, Tracker, WatcherConfig};

fn tracker(store: MemoryStore) -> Tracker<MemoryStore> {
    let config = WatcherConfig::new("memory://").with_poll_interval(Duration::from_millis(5));
    Tracker::with_store(store, config).unwrap()
}

async fn wait_for(done: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(20), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for completions");
}

/// Many reporters confirming into many groups, then one watcher draining them
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stress_concurrent_reporters() {
    let num_groups = 200;
    let tasks_per_group = 10;

    let tracker = tracker(MemoryStore::new());
    let seen: Arc<Mutex<HashMap<String, usize>>> = Arc::new(Mutex::new(HashMap::new()));
    let sink = seen.clone();
    tracker.on_complete("fanout", move |results: &[TaskResult]| {
        *sink.lock().entry(results[0].group_id.clone()).or_default() += 1;
        assert!(results.iter().all(|r| r.group_id == results[0].group_id));
        Ok(())
    });

    let start = Instant::now();

    let mut groups = Vec::with_capacity(num_groups);
    for _ in 0..num_groups {
        groups.push(tracker.create_group("fanout", tasks_per_group, 60).await.unwrap());
    }

    let mut reporters = Vec::new();
    for group_id in groups.clone() {
        for task in 0..tasks_per_group {
            let tracker = tracker.clone();
            let group_id = group_id.clone();
            reporters.push(tokio::spawn(async move {
                let task_id = format!("task-{}", task);
                // Every task is reported twice; the second is a no-op.
                tracker.confirm_task(&group_id, "done", Some(task_id.as_str())).await.unwrap();
                tracker.confirm_task(&group_id, "again", Some(task_id.as_str())).await.unwrap();
            }));
        }
    }
    for reporter in reporters {
        reporter.await.unwrap();
    }

    // Started late so no duplicate lands on an already reaped group.
    let handle = tracker.spawn_watcher();
    wait_for(|| seen.lock().len() == num_groups).await;
    handle.stop().await.unwrap();

    println!("Concurrent reporter stress test:");
    println!("  Groups: {}", num_groups);
    println!("  Tasks/group: {}", tasks_per_group);
    println!("  Elapsed: {:?}", start.elapsed());

    let seen = seen.lock();
    assert!(groups.iter().all(|g| seen.get(g) == Some(&1)), "a group fired more or less than once");
    assert_eq!(tracker.metrics().duplicate_confirmations.get(), (num_groups as u64) * tasks_per_group);
    assert!(tracker.groups().store().is_empty());
}

/// Several watchers over one store never double-dispatch a group
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stress_competing_watchers() {
    let num_groups = 300;
    let store = MemoryStore::new();

    let fired: Arc<Mutex<HashMap<String, usize>>> = Arc::new(Mutex::new(HashMap::new()));
    let mut trackers = Vec::new();
    let mut handles = Vec::new();
    for _ in 0..3 {
        let tracker = tracker(store.clone());
        let sink = fired.clone();
        tracker.on_complete("job", move |results: &[TaskResult]| {
            *sink.lock().entry(results[0].group_id.clone()).or_default() += 1;
            Ok(())
        });
        handles.push(tracker.spawn_watcher());
        trackers.push(tracker);
    }

    let producer = &trackers[0];
    for i in 0..num_groups {
        let id = producer.create_group("job", 2, 60).await.unwrap();
        producer.confirm_task(&id, "x", Some("a")).await.unwrap();
        producer.confirm_task(&id, &i.to_string(), Some("b")).await.unwrap();
    }

    wait_for(|| fired.lock().len() == num_groups).await;
    for handle in handles {
        handle.stop().await.unwrap();
    }

    let fired = fired.lock();
    assert!(fired.values().all(|&n| n == 1), "a group was dispatched twice");
    let completed: u64 = trackers
        .iter()
        .map(|t| t.metrics().groups_completed.get())
        .sum();
    assert_eq!(completed, num_groups as u64);
}
