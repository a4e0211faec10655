//! Property-based tests for determinism guarantees

use proptest::prelude::*;
use syncable_store::store::maintenance::refresh_hash;
use syncable_store::store::{ExpectedType, InMemoryBacking, NewFile, NewFolder, StoreBacking};
use syncable_store::tree::hasher::{compute_file_hash, compute_folder_hash};
use syncable_store::tree::SyncablePath;
use syncable_store::types::{Hash, ItemId, StorageRootId};

fn name() -> impl Strategy<Value = String> {
    "[a-z0-9][a-z0-9.-]{0,11}".prop_filter("reserved", |n| n != "." && n != "..")
}

/// Folder segments followed by an optional file leaf.
fn path_strategy() -> impl Strategy<Value = SyncablePath> {
    (
        prop::collection::vec(name(), 0..5),
        prop::option::of(name()),
    )
        .prop_map(|(folders, leaf)| {
            let mut path = SyncablePath::root(StorageRootId::new("sr-prop").unwrap());
            for folder in folders {
                path = path.append(ItemId::folder(&folder).unwrap()).unwrap();
            }
            if let Some(leaf) = leaf {
                path = path.append(ItemId::file(&leaf).unwrap()).unwrap();
            }
            path
        })
}

/// Test that rendering and parsing a path is stable
#[test]
fn test_path_text_form_is_stable() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&path_strategy(), |path| {
            let text = path.to_string();
            let parsed: SyncablePath = text.parse().unwrap();
            assert_eq!(parsed, path);
            assert_eq!(parsed.to_string(), text);

            // Every ancestor is a proper prefix, ending with the parent.
            let ancestors = path.ancestors();
            assert_eq!(ancestors.len(), path.ids().len());
            for ancestor in &ancestors {
                assert!(path.starts_with(ancestor));
                assert!(ancestor.ids().len() < path.ids().len());
            }
            assert_eq!(ancestors.last().cloned(), path.parent());

            Ok(())
        })
        .unwrap();
}

/// Test that folder hashes do not depend on child order
#[test]
fn test_folder_hash_order_independent() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(
            &(
                prop::collection::btree_map(name(), any::<Vec<u8>>(), 0..12),
                any::<u64>(),
            ),
            |(children, seed)| {
                let entries: Vec<(ItemId, Hash)> = children
                    .iter()
                    .map(|(name, data)| (ItemId::file(name).unwrap(), compute_file_hash(data)))
                    .collect();

                let mut shuffled = entries.clone();
                // Deterministic rotation plus reversal stands in for a shuffle.
                if !shuffled.is_empty() {
                    let pivot = (seed as usize) % shuffled.len();
                    shuffled.rotate_left(pivot);
                }
                if seed % 2 == 0 {
                    shuffled.reverse();
                }

                let forward = compute_folder_hash(entries.iter().map(|(id, hash)| (id, hash)));
                let mixed = compute_folder_hash(shuffled.iter().map(|(id, hash)| (id, hash)));
                assert_eq!(forward, mixed);

                Ok(())
            },
        )
        .unwrap();
}

async fn build_tree(files: &[(String, String, Vec<u8>)], reverse: bool) -> (InMemoryBacking, SyncablePath) {
    let root = SyncablePath::root(StorageRootId::new("sr-prop").unwrap());
    let backing = InMemoryBacking::new(root.storage_root_id().clone());

    let mut ordered: Vec<&(String, String, Vec<u8>)> = files.iter().collect();
    if reverse {
        ordered.reverse();
    }
    for (folder, file, data) in ordered {
        let folder_path = root.append(ItemId::folder(folder).unwrap()).unwrap();
        if backing.get_metadata_at_path(&folder_path).await.is_err() {
            backing
                .create_folder_with_path(&folder_path, NewFolder::default())
                .await
                .unwrap();
        }
        let file_path = folder_path.append(ItemId::file(file).unwrap()).unwrap();
        backing
            .create_binary_file_with_path(
                &file_path,
                NewFile {
                    data: data.clone(),
                    provenance: None,
                },
            )
            .await
            .unwrap();
    }
    (backing, root)
}

/// Test that traversal and root hashes do not depend on insertion order
#[test]
fn test_tree_hash_independent_of_insertion_order() {
    let mut runner = proptest::test_runner::TestRunner::new(proptest::test_runner::Config {
        cases: 64,
        ..proptest::test_runner::Config::default()
    });
    let rt = tokio::runtime::Runtime::new().unwrap();

    runner
        .run(
            &prop::collection::btree_map((name(), name()), any::<Vec<u8>>(), 1..10),
            |files| {
                let files: Vec<(String, String, Vec<u8>)> = files
                    .into_iter()
                    .map(|((folder, file), data)| (folder, file, data))
                    .collect();

                rt.block_on(async {
                    let (forward, root) = build_tree(&files, false).await;
                    let (backward, _) = build_tree(&files, true).await;

                    let forward_hash = refresh_hash(&forward, &root).await.unwrap();
                    let backward_hash = refresh_hash(&backward, &root).await.unwrap();
                    assert_eq!(forward_hash, backward_hash);
                    assert_eq!(refresh_hash(&forward, &root).await.unwrap(), forward_hash);

                    for (folder, file, data) in &files {
                        let path: SyncablePath = format!("sr-prop/folder_{}/file_{}", folder, file)
                            .parse()
                            .unwrap();
                        let first = forward.get_at_path(&path, ExpectedType::Any).await.unwrap();
                        let second = backward.get_at_path(&path, ExpectedType::Any).await.unwrap();
                        assert_eq!(first.metadata().hash, second.metadata().hash);
                        assert_eq!(first.into_file_data(), Some(data.clone()));
                    }
                });

                Ok(())
            },
        )
        .unwrap();
}
