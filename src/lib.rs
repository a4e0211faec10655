//! Syncable Store: an encrypted, content-addressed store of files and
//! folders that replicas keep in sync by pushing and pulling over a small
//! wire protocol.
//!
//! Items carry signed provenance checked against per-folder access control
//! documents, folders share symmetric secrets sealed for their members, and
//! sync work runs on a keyed task queue under per-path locks.

pub mod access;
pub mod cli;
pub mod config;
pub mod context;
pub mod crypto;
pub mod error;
pub mod lock;
pub mod logging;
pub mod queue;
pub mod store;
pub mod sync;
pub mod tree;
pub mod types;

pub use context::StoreContext;
pub use error::ErrorKind;
