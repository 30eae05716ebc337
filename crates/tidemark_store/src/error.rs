//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the store.
///
/// All variants surface to callers as a storage failure: fatal to the
/// operation (or sync cycle) that hit them, never to the process.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of storage.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// The journal is corrupted.
    #[error("journal corrupted: {0}")]
    Corrupted(String),

    /// Another process holds the journal lock.
    #[error("journal locked: another store instance has exclusive access")]
    Locked,

    /// A referenced log entry does not exist.
    #[error("unknown log sequence number: {0}")]
    UnknownSequence(u64),

    /// Update or delete of an entity the store has never seen.
    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    /// Create of an entity that already exists.
    #[error("entity already exists: {0}")]
    EntityExists(String),
}

impl StoreError {
    /// Creates a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted(message.into())
    }
}
