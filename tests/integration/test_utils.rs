//! Shared fixtures for integration tests.

use std::sync::Arc;
use syncable_store::crypto::CryptoKeySet;
use syncable_store::lock::MemoryLockStore;
use syncable_store::store::InMemoryBacking;
use syncable_store::tree::SyncablePath;
use syncable_store::types::{ItemId, StorageRootId};
use syncable_store::StoreContext;

pub fn root_id(name: &str) -> StorageRootId {
    StorageRootId::new(format!("sr-{}", name)).unwrap()
}

pub fn child(parent: &SyncablePath, id: &str) -> SyncablePath {
    parent.append(id.parse::<ItemId>().unwrap()).unwrap()
}

/// Initialized in-memory context whose key set created the storage root.
pub async fn creator_context(root: &str) -> StoreContext {
    let context = StoreContext::in_memory(CryptoKeySet::generate(), root_id(root));
    context.init().await.unwrap();
    context
}

/// Second replica of `creator`'s storage root, held by `keys`.
pub async fn replica_of(creator: &StoreContext, keys: CryptoKeySet) -> StoreContext {
    let root = creator.root().storage_root_id().clone();
    let context = StoreContext::new(
        keys,
        Arc::new(InMemoryBacking::new(root)),
        Arc::new(MemoryLockStore::new()),
        creator.trust().clone(),
    );
    context.init().await.unwrap();
    context
}
