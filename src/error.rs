//! Error types for the syncable store.
//!
//! Every layer owns a narrow error enum. All of them map onto the closed
//! [`ErrorKind`] taxonomy so callers can match on kinds instead of strings.

use crate::types::{IdError, ItemType};
use thiserror::Error;

/// Closed set of error kinds shared by every layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    WrongType,
    Conflict,
    Untrusted,
    LockTimeout,
    OutOfDate,
    Generic,
}

/// Store backing errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// `walked` is the deepest prefix of `path` that exists.
    #[error("Not found: {path} (walked as far as {walked})")]
    NotFound { path: String, walked: String },

    #[error("Wrong type at {path}: expected {expected}, found {actual}")]
    WrongType {
        path: String,
        expected: String,
        actual: ItemType,
    },

    #[error("Already exists: {0}")]
    Conflict(String),

    /// Optimistic update fencing: the item changed since the caller read it.
    #[error("Out of date: {0}")]
    OutOfDate(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound { .. } => ErrorKind::NotFound,
            StoreError::WrongType { .. } => ErrorKind::WrongType,
            StoreError::Conflict(_) => ErrorKind::Conflict,
            StoreError::OutOfDate(_) => ErrorKind::OutOfDate,
            _ => ErrorKind::Generic,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }

    /// Keep `NotFound`, fold everything else into a backend error.
    ///
    /// For call sites whose contract only advertises `not-found`.
    pub fn expect_not_found_only(self) -> StoreError {
        match self {
            err @ StoreError::NotFound { .. } => err,
            StoreError::Backend(msg) => StoreError::Backend(msg),
            other => StoreError::Backend(format!("unexpected store error: {}", other)),
        }
    }
}

impl From<IdError> for StoreError {
    fn from(err: IdError) -> Self {
        StoreError::InvalidPath(err.to_string())
    }
}

/// Key, signature and sealing errors.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Signature verification failed")]
    BadSignature,

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed")]
    DecryptionFailed,
}

/// Access control and provenance errors.
#[derive(Debug, Error)]
pub enum AccessError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Access document changed concurrently: expected version {expected}, found {actual}")]
    Conflict { expected: usize, actual: usize },

    #[error("Untrusted: {0}")]
    Untrusted(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),
}

impl AccessError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AccessError::NotFound(_) => ErrorKind::NotFound,
            AccessError::Conflict { .. } => ErrorKind::Conflict,
            AccessError::Untrusted(_) | AccessError::Unauthorized(_) => ErrorKind::Untrusted,
            AccessError::Crypto(_) => ErrorKind::Generic,
            AccessError::Store(err) => err.kind(),
            AccessError::Lock(err) => err.kind(),
        }
    }
}

impl From<StoreError> for AccessError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { path, .. } => AccessError::NotFound(path),
            other => AccessError::Store(other),
        }
    }
}

/// Lock store errors.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Timed out acquiring lock {0}")]
    Timeout(String),

    #[error("Lock backend error: {0}")]
    Backend(String),
}

impl LockError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LockError::Timeout(_) => ErrorKind::LockTimeout,
            LockError::Backend(_) => ErrorKind::Generic,
        }
    }
}

impl From<std::io::Error> for LockError {
    fn from(err: std::io::Error) -> Self {
        LockError::Backend(err.to_string())
    }
}

impl From<LockError> for StoreError {
    fn from(err: LockError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl From<redis::RedisError> for LockError {
    fn from(err: redis::RedisError) -> Self {
        LockError::Backend(err.to_string())
    }
}

/// Sync engine and wire protocol errors.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Out of date: {0}")]
    OutOfDate(String),

    #[error("Untrusted: {0}")]
    Untrusted(String),

    #[error("Email unavailable: {0}")]
    EmailUnavailable(String),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Remote transport error: {0}")]
    Transport(String),

    #[error("Internal sync error: {0}")]
    Generic(String),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::NotFound(_) => ErrorKind::NotFound,
            SyncError::Conflict(_) | SyncError::EmailUnavailable(_) => ErrorKind::Conflict,
            SyncError::OutOfDate(_) => ErrorKind::OutOfDate,
            SyncError::Untrusted(_) => ErrorKind::Untrusted,
            SyncError::Lock(err) => err.kind(),
            SyncError::Transport(_) | SyncError::Generic(_) => ErrorKind::Generic,
        }
    }
}

impl From<StoreError> for SyncError {
    /// `wrong-type` is not part of any sync contract and becomes generic.
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { path, .. } => SyncError::NotFound(path),
            StoreError::Conflict(path) => SyncError::Conflict(path),
            StoreError::OutOfDate(path) => SyncError::OutOfDate(path),
            other => SyncError::Generic(other.to_string()),
        }
    }
}

impl From<AccessError> for SyncError {
    fn from(err: AccessError) -> Self {
        match err {
            AccessError::Untrusted(msg) | AccessError::Unauthorized(msg) => {
                SyncError::Untrusted(msg)
            }
            AccessError::Crypto(err) => SyncError::Untrusted(err.to_string()),
            AccessError::NotFound(path) => SyncError::NotFound(path),
            AccessError::Store(err) => SyncError::from(err),
            AccessError::Lock(err) => SyncError::Lock(err),
            AccessError::Conflict { expected, actual } => SyncError::Conflict(format!(
                "access document version {} does not match {}",
                actual, expected
            )),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Invalid(String),

    #[error("Configuration source error: {0}")]
    Source(#[from] config::ConfigError),
}
