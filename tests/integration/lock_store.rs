//! Mutual exclusion across lock store implementations.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use syncable_store::error::LockError;
use syncable_store::lock::{with_lock, AcquireOptions, FileLockStore, LockStore, LockStoreExt, MemoryLockStore};
use tempfile::TempDir;

fn short_timeout() -> AcquireOptions {
    AcquireOptions {
        timeout: Duration::from_millis(150),
        auto_release_after: Some(Duration::from_secs(30)),
    }
}

async fn check_exclusion(store: &dyn LockStore) {
    let first = store.lock("sr-locks/file_a");
    let token = first.acquire(short_timeout()).await.unwrap();

    let err = store.lock("sr-locks/file_a").acquire(short_timeout()).await.unwrap_err();
    assert!(matches!(err, LockError::Timeout(ref key) if key == "sr-locks/file_a"));

    // Other keys are independent.
    let other = store.lock("sr-locks/file_b");
    let other_token = other.acquire(short_timeout()).await.unwrap();
    other.release(&other_token).await;

    first.release(&token).await;
    let again = store.lock("sr-locks/file_a").acquire(short_timeout()).await.unwrap();
    store.release("sr-locks/file_a", &again).await;
}

#[tokio::test]
async fn test_memory_store_excludes() {
    check_exclusion(&MemoryLockStore::new()).await;
}

#[tokio::test]
async fn test_file_store_excludes() {
    let dir = TempDir::new().unwrap();
    check_exclusion(&FileLockStore::new(dir.path()).unwrap()).await;
}

#[tokio::test]
async fn test_release_with_wrong_token_is_ignored() {
    let store = MemoryLockStore::new();
    let lock = store.lock("key");
    let _held = lock.acquire(short_timeout()).await.unwrap();

    let stranger = MemoryLockStore::new();
    let foreign = stranger.lock("key").acquire(short_timeout()).await.unwrap();
    lock.release(&foreign).await;

    assert!(store.lock("key").acquire(short_timeout()).await.is_err());
}

#[tokio::test]
async fn test_abandoned_lock_expires() {
    let store = MemoryLockStore::new();
    let options = AcquireOptions {
        timeout: Duration::from_millis(500),
        auto_release_after: Some(Duration::from_millis(50)),
    };
    let _abandoned = store.lock("key").acquire(options).await.unwrap();
    let token = store.lock("key").acquire(options).await.unwrap();
    store.lock("key").release(&token).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_with_lock_serializes_critical_sections() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileLockStore::new(dir.path()).unwrap());
    let inside = Arc::new(AtomicUsize::new(0));
    let options = AcquireOptions {
        timeout: Duration::from_secs(10),
        auto_release_after: None,
    };

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        let inside = inside.clone();
        handles.push(tokio::spawn(async move {
            with_lock(store.as_ref(), "shared", options, || async {
                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                tokio::time::sleep(Duration::from_millis(10)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, LockError>(())
            })
            .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
}
