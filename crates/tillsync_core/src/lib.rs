//! # tillsync core
//!
//! The local replica of a point-of-sale terminal.
//!
//! Every UI intent is applied to the durable local store first and the
//! matching remote mutation is queued in the same atomic write. The UI reads
//! only from the store and is told about changes through the
//! [`BroadcastBus`]. Delivery to the remote happens elsewhere and never
//! blocks an intent.
//!
//! ## Parts
//!
//! - [`LocalStore`] - CRC-framed append-only record log with a sorted
//!   in-memory index and atomic [`WriteBatch`]es
//! - [`BroadcastBus`] - in-process change notifications
//! - [`MutationOutbox`] - durable per-stream FIFO of pending remote work
//! - [`IdentityResolver`] - temporary to canonical id links
//! - [`EvictionLedger`] - removal of closed tabs and the closed-id deny-list
//! - [`ReconciliationPolicy`] - merge rules for remote snapshots
//! - [`Till`] - the intents the UI calls
//!
//! ## Example
//!
//! ```rust
//! use tillsync_core::{Change, Till};
//! use tillsync_protocol::Money;
//!
//! let till = Till::open_in_memory().unwrap();
//! let events = till.bus().subscribe_channel();
//!
//! let order = till.create_order(None).unwrap();
//! till.add_item(&order, "kape", 2, Money::from_major(45)).unwrap();
//!
//! assert_eq!(events.try_recv().unwrap().change, Change::Upserted);
//! assert_eq!(till.pending_mutations(), 2);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod bus;
mod clock;
mod config;
mod dir;
mod error;
mod eviction;
mod identity;
mod log;
mod outbox;
mod reconcile;
mod record;
mod stock;
mod store;
mod till;

pub use bus::{BroadcastBus, Change, Origin, StoreEvent, Subscription};
pub use clock::now_millis;
pub use config::StoreConfig;
pub use dir::StoreDir;
pub use error::{CoreError, CoreResult};
pub use eviction::{EvictedRecord, EvictionLedger, EvictionReport};
pub use identity::{AliasRecord, IdentityResolver};
pub use log::{
    compute_crc32, decode_frames, encode_frame, LogEntry, RecordKind, Replay, LOG_MAGIC, LOG_VERSION,
};
pub use outbox::{
    CollectingSink, ErrorSink, MutationId, MutationOutbox, MutationRecord, MutationState,
    PermanentFailure, TracingSink,
};
pub use reconcile::ReconciliationPolicy;
pub use record::Record;
pub use stock::{InMemoryStock, StockReservations, UnlimitedStock};
pub use store::{CompactionStats, LocalStore, StoreStats, WriteBatch};
pub use till::{EnqueueListener, Housekeeping, Till};
