//! Syncable Tree
//!
//! Path model and content hashing for the hierarchical store. Every node is
//! addressed by a [`path::SyncablePath`] and carries a SHA-256 hash derived
//! from its bytes (files) or its children's hashes (folders and bundles).

pub mod hasher;
pub mod path;

pub use path::SyncablePath;
