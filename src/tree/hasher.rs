//! Content hashing for syncable items using SHA-256

use crate::types::{Hash, ItemId};
use sha2::{Digest, Sha256};

/// Hash of a file's encoded bytes.
///
/// hash = sha256("file" || len || bytes)
pub fn compute_file_hash(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(b"file");
    hasher.update((data.len() as u64).to_be_bytes());
    hasher.update(data);
    Hash(hasher.finalize().into())
}

/// Hash of a folder-like node from its children's hashes.
///
/// hash = sha256("folder" || count || (id ":" child_hash)*) with children in
/// ID order, so the result does not depend on insertion order.
pub fn compute_folder_hash<'a, I>(children: I) -> Hash
where
    I: IntoIterator<Item = (&'a ItemId, &'a Hash)>,
{
    let mut sorted: Vec<(&ItemId, &Hash)> = children.into_iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));

    let mut hasher = Sha256::new();
    hasher.update(b"folder");
    hasher.update((sorted.len() as u64).to_be_bytes());
    for (id, hash) in sorted {
        let id = id.to_string();
        hasher.update((id.len() as u64).to_be_bytes());
        hasher.update(id.as_bytes());
        hasher.update(b":");
        hasher.update(hash.as_bytes());
    }
    Hash(hasher.finalize().into())
}

/// Hash of an empty folder.
pub fn empty_folder_hash() -> Hash {
    compute_folder_hash(std::iter::empty())
}

/// Generic SHA-256 of arbitrary bytes.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}
