//! Keyed task queue scheduling.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use syncable_store::queue::{AddOptions, QueueOptions, TaskQueue};

fn options(max_concurrency: usize) -> QueueOptions {
    QueueOptions {
        max_concurrency,
        delay_when_empty: Duration::ZERO,
    }
}

#[tokio::test]
async fn test_same_version_pending_runs_once() {
    let queue = TaskQueue::new();
    let runs = Arc::new(AtomicUsize::new(0));
    queue.pause();
    queue.start(options(2));

    for _ in 0..2 {
        let runs = runs.clone();
        queue.add("sr-q/file_a", AddOptions::versioned("v1"), move || async move {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    }
    queue.unpause();
    queue.wait().await;

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(queue.stats().coalesced, 1);
    queue.stop().await;
}

#[tokio::test]
async fn test_newer_version_replaces_pending_body() {
    let queue = TaskQueue::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    queue.pause();
    queue.start(options(1));

    for version in ["v1", "v2"] {
        let log = log.clone();
        queue.add("sr-q/file_a", AddOptions::versioned(version), move || async move {
            log.lock().push(version.to_string());
            Ok(())
        });
    }
    queue.unpause();
    queue.wait().await;

    assert_eq!(*log.lock(), vec!["v2".to_string()]);
    queue.stop().await;
}

#[tokio::test]
async fn test_unversioned_adds_are_never_dropped_while_running() {
    let queue = TaskQueue::new();
    let runs = Arc::new(AtomicUsize::new(0));
    queue.start(options(2));

    let first = runs.clone();
    queue.add("key", AddOptions::default(), move || async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        first.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = runs.clone();
    queue.add("key", AddOptions::default(), move || async move {
        second.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    queue.wait().await;

    assert_eq!(runs.load(Ordering::SeqCst), 2);
    queue.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slow_task_does_not_block_others() {
    let queue = TaskQueue::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    queue.pause();
    queue.start(options(2));

    for (key, millis) in [("A", 100u64), ("B", 50), ("C", 0)] {
        let log = log.clone();
        queue.add(key, AddOptions::default(), move || async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            log.lock().push(key);
            Ok(())
        });
    }
    queue.unpause();
    queue.wait().await;

    assert_eq!(*log.lock(), vec!["B", "C", "A"]);
    queue.stop().await;
}

#[tokio::test]
async fn test_failures_are_counted_and_queue_continues() {
    let queue = TaskQueue::new();
    queue.start(options(1));
    queue.add("bad", AddOptions::default(), || async { Err(anyhow::anyhow!("boom")) });
    queue.add("good", AddOptions::default(), || async { Ok(()) });
    queue.wait().await;

    let stats = queue.stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.completed, 1);
    assert!(queue.is_empty());
    queue.stop().await;
}

#[tokio::test]
async fn test_high_priority_runs_first() {
    let queue = TaskQueue::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    queue.pause();
    queue.start(options(1));

    for (key, add) in [
        ("normal", AddOptions::default()),
        ("urgent", AddOptions::default().high()),
    ] {
        let log = log.clone();
        queue.add(key, add, move || async move {
            log.lock().push(key);
            Ok(())
        });
    }
    queue.unpause();
    queue.wait().await;

    assert_eq!(*log.lock(), vec!["urgent", "normal"]);
    queue.stop().await;
}
