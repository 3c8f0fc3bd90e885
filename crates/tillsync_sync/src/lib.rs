//! # tillsync_sync
//!
//! The background half of tillsync: a tokio actor that drains the
//! [`MutationOutbox`](tillsync_core::MutationOutbox) to a
//! [`RemoteApi`](tillsync_protocol::RemoteApi) and merges what the remote
//! reports back into the local replica.
//!
//! - Per stream FIFO: the head of a stream blocks everything behind it
//!   until it is acknowledged, rejected or skipped.
//! - Transient failures back off exponentially with jitter and never drop
//!   a mutation. Rejections go to the till's error sink.
//! - Creations are linked to their canonical ids on acknowledgement, and an
//!   acknowledged tab close evicts the tab.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tillsync_core::Till;
//! use tillsync_remote::ReferenceRemote;
//! use tillsync_sync::{SyncConfig, SyncWorker};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let till = Arc::new(Till::open_in_memory()?);
//! let handle = SyncWorker::spawn(
//!     Arc::clone(&till),
//!     Arc::new(ReferenceRemote::new()),
//!     SyncConfig::new("till-1"),
//! );
//!
//! let tab = till.open_session(Some("T4".into()))?;
//! let report = handle.force_sync().await?;
//! assert!(report.is_clean());
//! handle.shutdown().await;
//! # let _ = tab;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod applier;
mod config;
mod error;
mod state;
mod worker;

pub use applier::{Applied, Prepared, ReplicaApplier};
pub use config::{RetryConfig, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use state::{SyncReport, SyncState, SyncStats};
pub use worker::{SyncHandle, SyncWorker};
