//! Hash bookkeeping and mark-and-sweep deletion over any [`StoreBacking`].

use crate::error::StoreError;
use crate::store::{ItemMetadata, LocalMetadataPatch, StoreBacking};
use crate::tree::hasher::compute_folder_hash;
use crate::tree::SyncablePath;
use crate::types::Hash;
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::debug;

/// Bring the hash at `path` up to date and return it.
///
/// Only flagged nodes are recomputed. Backings flag every ancestor of a
/// mutation, so an unflagged node has a current subtree.
pub fn refresh_hash<'a>(
    backing: &'a dyn StoreBacking,
    path: &'a SyncablePath,
) -> BoxFuture<'a, Result<Hash, StoreError>> {
    async move {
        let metadata = backing.get_metadata_at_path(path).await?;
        refresh_with_metadata(backing, path, metadata).await
    }
    .boxed()
}

fn refresh_with_metadata<'a>(
    backing: &'a dyn StoreBacking,
    path: &'a SyncablePath,
    metadata: ItemMetadata,
) -> BoxFuture<'a, Result<Hash, StoreError>> {
    async move {
        if !metadata.item_type.is_folder_like() || !metadata.local.needs_recompute_hash {
            return Ok(metadata.hash);
        }

        let children = backing.get_metadata_by_id_in_path(path, None).await?;
        let mut hashes = Vec::with_capacity(children.len());
        for (id, child) in children {
            if child.local.is_deleted_locally {
                continue;
            }
            let child_path = path.append(id.clone())?;
            let hash = refresh_with_metadata(backing, &child_path, child).await?;
            hashes.push((id, hash));
        }

        let hash = compute_folder_hash(hashes.iter().map(|(id, hash)| (id, hash)));
        backing.set_hash_at_path(path, hash).await?;
        debug!(path = %path, hash = %hash, "Recomputed folder hash");
        Ok(hash)
    }
    .boxed()
}

/// Flag `path` for deletion without removing it.
pub async fn mark_deleted(backing: &dyn StoreBacking, path: &SyncablePath) -> Result<(), StoreError> {
    backing
        .update_local_metadata_at_path(
            path,
            LocalMetadataPatch {
                is_deleted_locally: Some(true),
                needs_recompute_hash: None,
            },
        )
        .await?;
    // Deleted children drop out of the parent's hash.
    for ancestor in path.ancestors() {
        backing
            .update_local_metadata_at_path(
                &ancestor,
                LocalMetadataPatch {
                    needs_recompute_hash: Some(true),
                    is_deleted_locally: None,
                },
            )
            .await?;
    }
    Ok(())
}

/// Physically delete every flagged node under `path`. Returns how many
/// nodes were removed; a node that is already gone counts as swept.
pub fn sweep_deleted<'a>(
    backing: &'a dyn StoreBacking,
    path: &'a SyncablePath,
) -> BoxFuture<'a, Result<usize, StoreError>> {
    async move {
        let mut swept = 0;
        let children = backing.get_metadata_by_id_in_path(path, None).await?;
        for (id, child) in children {
            let child_path = path.append(id)?;
            if child.local.is_deleted_locally {
                match backing.delete_at_path(&child_path).await {
                    Ok(()) => swept += 1,
                    Err(err) if err.is_not_found() => {}
                    Err(err) => return Err(err),
                }
            } else if child.item_type.is_folder_like() {
                swept += sweep_deleted(backing, &child_path).await?;
            }
        }
        if swept > 0 {
            debug!(path = %path, swept, "Swept deleted items");
        }
        Ok(swept)
    }
    .boxed()
}
