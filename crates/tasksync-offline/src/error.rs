//! Error types for the offline queue.

use thiserror::Error;

use crate::item::ItemStatus;

/// Errors raised by a [`SyncStore`](crate::store::SyncStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record failed its checksum or could not be decoded.
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised by the queue, the conflict resolver and the client transport.
#[derive(Debug, Error)]
pub enum OfflineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// No queue item with this id.
    #[error("queue item not found: {0}")]
    ItemNotFound(String),

    /// No conflict record with this id.
    #[error("conflict not found: {0}")]
    ConflictNotFound(String),

    /// The conflict was already resolved.
    #[error("conflict already resolved: {0}")]
    AlreadyResolved(String),

    /// The item is not in a state that allows the operation.
    #[error("queue item {id} is {status}")]
    InvalidState {
        /// Queue item id.
        id: String,
        /// Current status.
        status: ItemStatus,
    },

    /// The connection to the server failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The server did not answer in time.
    #[error("request timed out")]
    Timeout,
}

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type for offline queue operations.
pub type Result<T> = std::result::Result<T, OfflineError>;
