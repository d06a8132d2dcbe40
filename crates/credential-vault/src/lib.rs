//! Durable credential storage for the Versecraft client.
//!
//! This crate provides:
//! - A [`KvStore`] trait over simple durable key/value backends
//! - A JSON-file backend ([`FileStore`]) and an in-memory backend
//!   ([`MemoryStore`]) for tests and ephemeral sessions
//! - A [`TokenStore`] holding the current access/refresh token pair, with the
//!   in-memory copy authoritative and every mutation persisted

mod file;
mod keys;
mod memory;
mod tokens;
mod traits;

pub use file::FileStore;
pub use keys::StorageKeys;
pub use memory::MemoryStore;
pub use tokens::{SessionMeta, TokenPair, TokenStore};
pub use traits::KvStore;

use thiserror::Error;

/// Error type for storage operations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Backend-specific storage error
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// Encoding/decoding error
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
