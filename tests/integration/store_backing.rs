//! The backing contract, run against every backend.

use std::sync::Arc;
use syncable_store::error::StoreError;
use syncable_store::store::maintenance::{mark_deleted, refresh_hash, sweep_deleted};
use syncable_store::store::{
    ExpectedType, FileSystemBacking, InMemoryBacking, NewFile, NewFolder, SledBacking,
    StoreBacking,
};
use syncable_store::tree::hasher::{compute_file_hash, compute_folder_hash};
use syncable_store::tree::SyncablePath;
use syncable_store::types::{ItemId, ItemType, StorageRootId};
use tempfile::TempDir;

fn path(s: &str) -> SyncablePath {
    s.parse().unwrap()
}

fn file(data: &[u8]) -> NewFile {
    NewFile {
        data: data.to_vec(),
        provenance: None,
    }
}

/// One instance of each backend for `sr-contract`. The temp dirs must
/// outlive the backings.
async fn backings() -> (Vec<(&'static str, Arc<dyn StoreBacking>)>, Vec<TempDir>) {
    let id = StorageRootId::new("sr-contract").unwrap();
    let fs_dir = TempDir::new().unwrap();
    let sled_dir = TempDir::new().unwrap();
    let filesystem = FileSystemBacking::open(fs_dir.path(), id.clone()).await.unwrap();
    let sled = SledBacking::open(sled_dir.path().join("db"), Some("contract"), id.clone()).unwrap();
    (
        vec![
            ("memory", Arc::new(InMemoryBacking::new(id)) as Arc<dyn StoreBacking>),
            ("filesystem", Arc::new(filesystem)),
            ("sled", Arc::new(sled)),
        ],
        vec![fs_dir, sled_dir],
    )
}

async fn populate(store: &dyn StoreBacking) {
    store
        .create_folder_with_path(&path("sr-contract/folder_docs"), NewFolder::default())
        .await
        .unwrap();
    store
        .create_folder_with_path(&path("sr-contract/folder_docs/bundle_album"), NewFolder::default())
        .await
        .unwrap();
    store
        .create_binary_file_with_path(&path("sr-contract/folder_docs/file_a"), file(b"alpha"))
        .await
        .unwrap();
    store
        .create_binary_file_with_path(
            &path("sr-contract/folder_docs/bundle_album/file_b"),
            file(b"beta"),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_traversal_is_exact_or_not_found() {
    let (stores, _dirs) = backings().await;
    for (name, store) in stores {
        populate(store.as_ref()).await;

        let item = store
            .get_at_path(&path("sr-contract/folder_docs/bundle_album/file_b"), ExpectedType::Any)
            .await
            .unwrap();
        assert_eq!(item.into_file_data().unwrap(), b"beta", "{}", name);

        let err = store
            .get_at_path(&path("sr-contract/folder_docs/folder_missing/file_c"), ExpectedType::Any)
            .await
            .unwrap_err();
        match err {
            StoreError::NotFound { walked, .. } => {
                assert_eq!(walked, "sr-contract/folder_docs", "{}", name)
            }
            other => panic!("{}: unexpected error {:?}", name, other),
        }
    }
}

#[tokio::test]
async fn test_create_rules() {
    let (stores, _dirs) = backings().await;
    for (name, store) in stores {
        populate(store.as_ref()).await;

        let duplicate = store
            .create_binary_file_with_path(&path("sr-contract/folder_docs/file_a"), file(b"again"))
            .await;
        assert!(matches!(duplicate, Err(StoreError::Conflict(_))), "{}", name);

        let orphan = store
            .create_binary_file_with_path(&path("sr-contract/folder_none/file_x"), file(b"x"))
            .await;
        assert!(
            matches!(orphan, Err(StoreError::NotFound { ref walked, .. }) if walked == "sr-contract"),
            "{}",
            name
        );

        let wrong = store
            .get_at_path(
                &path("sr-contract/folder_docs/file_a"),
                ExpectedType::Exactly(ItemType::Folder),
            )
            .await;
        assert!(matches!(wrong, Err(StoreError::WrongType { .. })), "{}", name);

        let ids = store
            .get_ids_in_path(&path("sr-contract/folder_docs"), Some(ItemType::File))
            .await
            .unwrap();
        assert_eq!(ids, vec![ItemId::file("a").unwrap()], "{}", name);
    }
}

#[tokio::test]
async fn test_refresh_hash_matches_definition() {
    let (stores, _dirs) = backings().await;
    for (name, store) in stores {
        populate(store.as_ref()).await;
        let root = path("sr-contract");

        let root_hash = refresh_hash(store.as_ref(), &root).await.unwrap();
        let album = compute_folder_hash([(&ItemId::file("b").unwrap(), &compute_file_hash(b"beta"))]);
        let docs = compute_folder_hash([
            (&ItemId::bundle("album").unwrap(), &album),
            (&ItemId::file("a").unwrap(), &compute_file_hash(b"alpha")),
        ]);
        let expected = compute_folder_hash([(&ItemId::folder("docs").unwrap(), &docs)]);
        assert_eq!(root_hash, expected, "{}", name);

        let metadata = store.get_metadata_at_path(&root).await.unwrap();
        assert!(!metadata.local.needs_recompute_hash, "{}", name);
    }
}

#[tokio::test]
async fn test_mark_and_sweep() {
    let (stores, _dirs) = backings().await;
    for (name, store) in stores {
        populate(store.as_ref()).await;
        let root = path("sr-contract");
        let before = refresh_hash(store.as_ref(), &root).await.unwrap();

        let target = path("sr-contract/folder_docs/bundle_album");
        mark_deleted(store.as_ref(), &target).await.unwrap();
        let marked = refresh_hash(store.as_ref(), &root).await.unwrap();
        assert_ne!(before, marked, "{}", name);
        assert!(store.exists_at_path(&target).await.unwrap(), "{}", name);

        assert_eq!(sweep_deleted(store.as_ref(), &root).await.unwrap(), 1, "{}", name);
        assert!(!store.exists_at_path(&target).await.unwrap(), "{}", name);
        assert!(
            !store
                .exists_at_path(&path("sr-contract/folder_docs/bundle_album/file_b"))
                .await
                .unwrap(),
            "{}",
            name
        );
        assert_eq!(refresh_hash(store.as_ref(), &root).await.unwrap(), marked, "{}", name);
    }
}
