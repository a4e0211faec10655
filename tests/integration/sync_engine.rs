//! Push and pull between replicas through an in-process server.

use super::test_utils::{child, creator_context, replica_of};
use std::sync::Arc;
use syncable_store::crypto::CryptoKeySet;
use syncable_store::lock::MemoryLockStore;
use syncable_store::queue::TaskQueue;
use syncable_store::store::maintenance::refresh_hash;
use syncable_store::sync::{EngineOptions, ItemSyncState, RemoteAccessor, SyncEngine, SyncServer};
use syncable_store::ErrorKind;

#[tokio::test]
async fn test_push_then_pull_replicates_tree() {
    let server = Arc::new(SyncServer::in_memory());
    let remote: Arc<dyn RemoteAccessor> = server.clone();

    let alice = creator_context("sync-basic").await;
    let root = alice.root();
    let bob_keys = CryptoKeySet::generate();
    let bob_public = bob_keys.public_keys().clone();
    let folder = alice.create_folder(&root, "team", &[bob_public]).await.unwrap();
    let note = child(&folder, "file_note");
    alice.write_file(&note, b"hello bob".to_vec()).await.unwrap();

    let alice_engine = alice.sync_engine(remote.clone());
    alice_engine
        .ensure_registered("basic", alice.keys().public_keys())
        .await
        .unwrap();
    let report = alice_engine.push(&root).await.unwrap();
    assert!(report.is_success(), "{:?}", report.failures);
    assert!(report.pushed > 0);

    let alice_hash = refresh_hash(alice.backing().as_ref(), &root).await.unwrap();
    let hosted = server.backing(root.storage_root_id()).unwrap();
    assert_eq!(refresh_hash(hosted.as_ref(), &root).await.unwrap(), alice_hash);

    let again = alice_engine.push(&root).await.unwrap();
    assert_eq!(again.pushed, 0);

    let bob = replica_of(&alice, bob_keys).await;
    let bob_engine = bob.sync_engine(remote.clone());
    let pulled = bob_engine.pull(&root).await.unwrap();
    assert!(pulled.is_success(), "{:?}", pulled.failures);
    assert!(pulled.written > 0);
    assert_eq!(bob_engine.state(&root), ItemSyncState::Present);

    assert_eq!(bob.read_file(&note).await.unwrap(), b"hello bob");
    assert!(bob.shared_secret_key(&folder).await.unwrap() == alice.shared_secret_key(&folder).await.unwrap());
    assert_eq!(refresh_hash(bob.backing().as_ref(), &root).await.unwrap(), alice_hash);

    let second = bob_engine.pull(&root).await.unwrap();
    assert_eq!(second.written, 0);
    assert_eq!(second.unchanged, 1);

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn test_registration_is_bound_to_creator() {
    let remote: Arc<dyn RemoteAccessor> = Arc::new(SyncServer::in_memory());
    let alice = creator_context("sync-register").await;
    let engine = alice.sync_engine(remote);

    engine
        .ensure_registered("register", alice.keys().public_keys())
        .await
        .unwrap();
    engine
        .ensure_registered("register", alice.keys().public_keys())
        .await
        .unwrap();

    let mallory = CryptoKeySet::generate();
    let err = engine
        .ensure_registered("register", mallory.public_keys())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    alice.shutdown().await;
}

#[tokio::test]
async fn test_pull_from_unregistered_root_fails() {
    let remote: Arc<dyn RemoteAccessor> = Arc::new(SyncServer::in_memory());
    let alice = creator_context("sync-missing").await;
    let err = alice.sync_engine(remote).pull(&alice.root()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    alice.shutdown().await;
}

#[tokio::test]
async fn test_updates_flow_after_initial_sync() {
    let remote: Arc<dyn RemoteAccessor> = Arc::new(SyncServer::in_memory());
    let alice = creator_context("sync-update").await;
    let root = alice.root();
    let folder = alice.create_folder(&root, "docs", &[]).await.unwrap();
    let readme = child(&folder, "file_readme");
    alice.write_file(&readme, b"v1".to_vec()).await.unwrap();

    let engine = alice.sync_engine(remote.clone());
    engine
        .ensure_registered("update", alice.keys().public_keys())
        .await
        .unwrap();
    engine.push(&root).await.unwrap();

    let laptop = replica_of(&alice, CryptoKeySet::generate()).await;
    let laptop_engine = laptop.sync_engine(remote.clone());
    laptop_engine.pull(&root).await.unwrap();
    assert_eq!(laptop.read_file(&readme).await.unwrap(), b"v1");

    alice.write_file(&readme, b"v2".to_vec()).await.unwrap();
    let pushed = engine.push(&root).await.unwrap();
    assert!(pushed.pushed >= 1);

    let pulled = laptop_engine.pull(&root).await.unwrap();
    assert!(pulled.written >= 1);
    assert_eq!(laptop.read_file(&readme).await.unwrap(), b"v2");

    alice.shutdown().await;
    laptop.shutdown().await;
}

#[tokio::test]
async fn test_engine_without_started_queue_fails() {
    let remote: Arc<dyn RemoteAccessor> = Arc::new(SyncServer::in_memory());
    let alice = creator_context("sync-unstarted").await;
    alice.write_file(&child(&alice.root(), "file_a"), b"a".to_vec()).await.unwrap();

    let engine = SyncEngine::new(
        alice.backing().clone(),
        remote,
        Arc::new(TaskQueue::new()),
        Arc::new(MemoryLockStore::new()),
        alice.trust().clone(),
        EngineOptions::default(),
    );
    let err = engine.push(&alice.root()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Generic);
    let err = engine.pull(&alice.root()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Generic);
    alice.shutdown().await;
}
