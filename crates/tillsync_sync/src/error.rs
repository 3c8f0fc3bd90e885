//! Error types for the sync worker.

use thiserror::Error;
use tillsync_core::CoreError;
use tillsync_protocol::RemoteError;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The remote call failed.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// The local replica failed.
    #[error("local replica error: {0}")]
    Local(#[from] CoreError),

    /// The worker task is gone.
    #[error("sync worker stopped")]
    WorkerStopped,
}

impl SyncError {
    /// Returns true if repeating the work later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Remote(err) => err.is_transient(),
            SyncError::Local(err) => err.is_storage_unavailable(),
            SyncError::WorkerStopped => false,
        }
    }
}
