//! # tillsync_remote
//!
//! An in-memory authoritative remote implementing
//! [`RemoteApi`](tillsync_protocol::RemoteApi).
//!
//! It honors the full idempotency contract (idempotency keys and client
//! references), refuses changes to closed tabs and terminal orders, and can
//! be told to fail, drop replies, go offline, add latency or let totals lag
//! behind writes. The sync worker's tests and the CLI's demo run against it.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod reference;
mod state;

pub use config::RemoteConfig;
pub use reference::{Fault, ReferenceRemote, RemoteCounters};
