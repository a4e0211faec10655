//! In-memory backing: the reference implementation of the contract.

use crate::error::StoreError;
use crate::store::{
    check_root, ensure_not_root, new_file_metadata, new_folder_metadata, not_found,
    root_metadata, ExpectedType, ItemMetadata, LocalMetadataPatch, NewFile, NewFolder,
    StoreBacking, StoreItem,
};
use crate::tree::SyncablePath;
use crate::types::{Hash, ItemId, ItemType, StorageRootId};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
enum MemoryNode {
    File {
        metadata: ItemMetadata,
        data: Vec<u8>,
    },
    Folder {
        metadata: ItemMetadata,
        children: BTreeMap<ItemId, MemoryNode>,
    },
}

impl MemoryNode {
    fn metadata(&self) -> &ItemMetadata {
        match self {
            MemoryNode::File { metadata, .. } | MemoryNode::Folder { metadata, .. } => metadata,
        }
    }

    fn metadata_mut(&mut self) -> &mut ItemMetadata {
        match self {
            MemoryNode::File { metadata, .. } | MemoryNode::Folder { metadata, .. } => metadata,
        }
    }

    fn to_item(&self) -> StoreItem {
        match self {
            MemoryNode::File { metadata, data } => StoreItem::File {
                metadata: metadata.clone(),
                data: data.clone(),
            },
            MemoryNode::Folder { metadata, children } => StoreItem::Folder {
                metadata: metadata.clone(),
                child_ids: children.keys().cloned().collect(),
            },
        }
    }
}

/// Walk `path` from the root. Stops at the first missing ID.
fn traverse<'a>(root: &'a MemoryNode, path: &SyncablePath) -> Result<&'a MemoryNode, StoreError> {
    let mut node = root;
    for (depth, id) in path.ids().iter().enumerate() {
        let next = match node {
            MemoryNode::Folder { children, .. } => children.get(id),
            MemoryNode::File { .. } => None,
        };
        node = next.ok_or_else(|| not_found(path, &path.prefix(depth)))?;
    }
    Ok(node)
}

fn traverse_mut<'a>(
    root: &'a mut MemoryNode,
    path: &SyncablePath,
) -> Result<&'a mut MemoryNode, StoreError> {
    let mut node = root;
    for (depth, id) in path.ids().iter().enumerate() {
        let next = match node {
            MemoryNode::Folder { children, .. } => children.get_mut(id),
            MemoryNode::File { .. } => None,
        };
        node = next.ok_or_else(|| not_found(path, &path.prefix(depth)))?;
    }
    Ok(node)
}

fn children_mut<'a>(
    node: &'a mut MemoryNode,
    path: &SyncablePath,
) -> Result<&'a mut BTreeMap<ItemId, MemoryNode>, StoreError> {
    match node {
        MemoryNode::Folder { children, .. } => Ok(children),
        MemoryNode::File { .. } => Err(StoreError::WrongType {
            path: path.to_string(),
            expected: "folder|bundle".to_string(),
            actual: ItemType::File,
        }),
    }
}

/// Flag the root and every existing strict ancestor of `path`.
fn mark_ancestors(root: &mut MemoryNode, path: &SyncablePath) {
    let ids = path.ids();
    let mut node = root;
    node.metadata_mut().local.needs_recompute_hash = true;
    for id in &ids[..ids.len().saturating_sub(1)] {
        node = match node {
            MemoryNode::Folder { children, .. } => match children.get_mut(id) {
                Some(child) => child,
                None => return,
            },
            MemoryNode::File { .. } => return,
        };
        node.metadata_mut().local.needs_recompute_hash = true;
    }
}

/// Tree held entirely in memory behind one lock.
pub struct InMemoryBacking {
    storage_root_id: StorageRootId,
    root: RwLock<MemoryNode>,
}

impl InMemoryBacking {
    pub fn new(storage_root_id: StorageRootId) -> Self {
        Self {
            storage_root_id,
            root: RwLock::new(MemoryNode::Folder {
                metadata: root_metadata(),
                children: BTreeMap::new(),
            }),
        }
    }

    fn insert_child(&self, path: &SyncablePath, child: MemoryNode) -> Result<(), StoreError> {
        check_root(&self.storage_root_id, path)?;
        ensure_not_root(path, "create")
            .map_err(|_| StoreError::Conflict(path.to_string()))?;
        let (parent_path, id) = split(path)?;

        let mut root = self.root.write();
        let parent = traverse_mut(&mut root, &parent_path)?;
        let children = children_mut(parent, &parent_path)?;
        if children.contains_key(&id) {
            return Err(StoreError::Conflict(path.to_string()));
        }
        children.insert(id, child);
        mark_ancestors(&mut root, path);
        Ok(())
    }
}

fn split(path: &SyncablePath) -> Result<(SyncablePath, ItemId), StoreError> {
    match (path.parent(), path.last_id()) {
        (Some(parent), Some(id)) => Ok((parent, id.clone())),
        _ => Err(StoreError::InvalidPath(format!("{} has no parent", path))),
    }
}

#[async_trait]
impl StoreBacking for InMemoryBacking {
    fn storage_root_id(&self) -> &StorageRootId {
        &self.storage_root_id
    }

    async fn exists_at_path(&self, path: &SyncablePath) -> Result<bool, StoreError> {
        check_root(&self.storage_root_id, path)?;
        let root = self.root.read();
        match traverse(&root, path) {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn get_at_path(
        &self,
        path: &SyncablePath,
        expected: ExpectedType,
    ) -> Result<StoreItem, StoreError> {
        check_root(&self.storage_root_id, path)?;
        let root = self.root.read();
        let node = traverse(&root, path)?;
        expected.check(path, node.metadata().item_type)?;
        Ok(node.to_item())
    }

    async fn get_ids_in_path(
        &self,
        path: &SyncablePath,
        item_type: Option<ItemType>,
    ) -> Result<Vec<ItemId>, StoreError> {
        check_root(&self.storage_root_id, path)?;
        let root = self.root.read();
        match traverse(&root, path)? {
            MemoryNode::Folder { children, .. } => Ok(children
                .keys()
                .filter(|id| item_type.map_or(true, |t| id.item_type() == t))
                .cloned()
                .collect()),
            MemoryNode::File { .. } => Err(StoreError::WrongType {
                path: path.to_string(),
                expected: "folder|bundle".to_string(),
                actual: ItemType::File,
            }),
        }
    }

    async fn get_metadata_at_path(&self, path: &SyncablePath) -> Result<ItemMetadata, StoreError> {
        check_root(&self.storage_root_id, path)?;
        let root = self.root.read();
        Ok(traverse(&root, path)?.metadata().clone())
    }

    async fn get_metadata_by_id_in_path(
        &self,
        path: &SyncablePath,
        ids: Option<&[ItemId]>,
    ) -> Result<BTreeMap<ItemId, ItemMetadata>, StoreError> {
        check_root(&self.storage_root_id, path)?;
        let root = self.root.read();
        let children = match traverse(&root, path)? {
            MemoryNode::Folder { children, .. } => children,
            MemoryNode::File { .. } => {
                return Err(StoreError::WrongType {
                    path: path.to_string(),
                    expected: "folder|bundle".to_string(),
                    actual: ItemType::File,
                })
            }
        };
        let selected = match ids {
            Some(ids) => ids
                .iter()
                .filter_map(|id| children.get(id).map(|n| (id.clone(), n.metadata().clone())))
                .collect(),
            None => children
                .iter()
                .map(|(id, n)| (id.clone(), n.metadata().clone()))
                .collect(),
        };
        Ok(selected)
    }

    async fn create_binary_file_with_path(
        &self,
        path: &SyncablePath,
        file: NewFile,
    ) -> Result<(), StoreError> {
        ExpectedType::Exactly(ItemType::File).check(path, path.item_type())?;
        let metadata = new_file_metadata(path, &file)?;
        self.insert_child(
            path,
            MemoryNode::File {
                metadata,
                data: file.data,
            },
        )
    }

    async fn create_folder_with_path(
        &self,
        path: &SyncablePath,
        folder: NewFolder,
    ) -> Result<(), StoreError> {
        ExpectedType::folder_like().check(path, path.item_type())?;
        let metadata = new_folder_metadata(path, &folder)?;
        self.insert_child(
            path,
            MemoryNode::Folder {
                metadata,
                children: BTreeMap::new(),
            },
        )
    }

    async fn update_binary_file_at_path(
        &self,
        path: &SyncablePath,
        file: NewFile,
        expected_hash: Option<Hash>,
    ) -> Result<(), StoreError> {
        check_root(&self.storage_root_id, path)?;
        let replacement = new_file_metadata(path, &file)?;

        let mut root = self.root.write();
        match traverse_mut(&mut root, path)? {
            MemoryNode::File { metadata, data } => {
                if let Some(expected) = expected_hash {
                    if metadata.hash != expected {
                        return Err(StoreError::OutOfDate(path.to_string()));
                    }
                }
                metadata.hash = replacement.hash;
                metadata.provenance = replacement.provenance;
                *data = file.data;
            }
            MemoryNode::Folder { metadata, .. } => {
                return Err(StoreError::WrongType {
                    path: path.to_string(),
                    expected: ItemType::File.to_string(),
                    actual: metadata.item_type,
                })
            }
        }
        mark_ancestors(&mut root, path);
        Ok(())
    }

    async fn delete_at_path(&self, path: &SyncablePath) -> Result<(), StoreError> {
        check_root(&self.storage_root_id, path)?;
        ensure_not_root(path, "delete")?;
        let (parent_path, id) = split(path)?;

        let mut root = self.root.write();
        let parent = traverse_mut(&mut root, &parent_path)?;
        if children_mut(parent, &parent_path)?.remove(&id).is_none() {
            return Err(not_found(path, &parent_path));
        }
        mark_ancestors(&mut root, path);
        Ok(())
    }

    async fn update_local_metadata_at_path(
        &self,
        path: &SyncablePath,
        patch: LocalMetadataPatch,
    ) -> Result<(), StoreError> {
        check_root(&self.storage_root_id, path)?;
        let mut root = self.root.write();
        let node = traverse_mut(&mut root, path)?;
        patch.apply(&mut node.metadata_mut().local);
        Ok(())
    }

    async fn set_hash_at_path(&self, path: &SyncablePath, hash: Hash) -> Result<(), StoreError> {
        check_root(&self.storage_root_id, path)?;
        let mut root = self.root.write();
        let metadata = traverse_mut(&mut root, path)?.metadata_mut();
        metadata.hash = hash;
        metadata.local.needs_recompute_hash = false;
        Ok(())
    }
}
