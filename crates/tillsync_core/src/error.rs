//! Error types for the tillsync core.

use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in tillsync core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error while opening or replaying the store.
    #[error("storage error: {0}")]
    Storage(#[from] tillsync_storage::StorageError),

    /// CBOR codec error.
    #[error("codec error: {0}")]
    Codec(#[from] tillsync_protocol::ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A write could not be made durable. The store is now read-only.
    #[error("storage unavailable: {message}")]
    StorageUnavailable {
        /// Description of the failure.
        message: String,
    },

    /// The requested record does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Record kind.
        kind: &'static str,
        /// Requested id.
        id: String,
    },

    /// The entity was closed and evicted; intents on it are dropped.
    #[error("stale entity: {id}")]
    StaleEntity {
        /// The evicted id.
        id: String,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// The stock collaborator refused a reservation.
    #[error("insufficient stock for {product_id}: requested {requested}, available {available}")]
    StockUnavailable {
        /// Product identifier.
        product_id: String,
        /// Units requested.
        requested: u32,
        /// Units currently available.
        available: u32,
    },

    /// Another process holds the store directory.
    #[error("store locked: another process has exclusive access")]
    Locked,

    /// The on-disk layout is not a tillsync store.
    #[error("invalid store format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },
}

impl CoreError {
    /// Creates a storage unavailable error.
    pub fn storage_unavailable(message: impl Into<String>) -> Self {
        Self::StorageUnavailable {
            message: message.into(),
        }
    }

    /// Creates a not found error.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Creates a stale entity error.
    pub fn stale(id: impl Into<String>) -> Self {
        Self::StaleEntity { id: id.into() }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Returns true if the error means the store can no longer accept writes.
    pub fn is_storage_unavailable(&self) -> bool {
        matches!(self, CoreError::StorageUnavailable { .. })
    }
}
