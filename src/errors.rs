//! Error types for the dogma-storage crate.
//!
//! This module defines a unified error enumeration used across object
//! storage, the commit pipeline, read queries, watches, and compaction. It
//! integrates with `thiserror` to provide rich `Display` implementations and
//! error source chaining where applicable.
//!
//! Notes:
//! - Each variant carries contextual details via its message payload.
//! - `ChangeConflict` and `RedundantChange` never leave persistent state
//!   modified; `Storage` may occur mid-commit but the head ref is only
//!   updated last, so the repository stays consistent.

use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
/// Unified error enumeration for the dogma-storage library.
///
/// - Used across the object store, commit pipeline, queries, watches,
///   compaction and the repository manager.
/// - Implements `std::error::Error` via `thiserror`.
pub enum StoreError {
    /// The revision does not exist in the repository.
    #[error("Revision {0} does not exist")]
    RevisionNotFound(i64),

    /// No entry at the given path for the given revision.
    #[error("Entry not found at revision {0}: {1}")]
    EntryNotFound(i64, String),

    /// A change cannot be applied to the current state.
    #[error("Change conflict: {0}")]
    ChangeConflict(String),

    /// The commit would not modify the repository content.
    #[error("Redundant change")]
    RedundantChange,

    /// A repository with the same name already exists.
    #[error("Repository exists already: {0}")]
    RepositoryExists(String),

    /// Repository not found.
    #[error("Repository not found: {0}")]
    RepositoryNotFound(String),

    /// Corrupt or unreadable object, ref, or metadata state.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O error from the underlying filesystem.
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    /// The repository is closing or closed.
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// The request-scoped deadline expired before a blocking step began.
    #[error("Request timed out")]
    RequestTimeout,

    /// Failure while resolving or using a repository encryption key.
    #[error("Encryption key error: {0}")]
    EncryptionKey(String),

    /// Invalid caller input (bad path, bad revision, bad pattern, ...).
    #[error("{0}")]
    InvalidArgument(String),
}

impl StoreError {
    /// Shortcut for a `ChangeConflict` with a formatted message.
    pub fn conflict(msg: impl Into<String>) -> StoreError {
        StoreError::ChangeConflict(msg.into())
    }
}
