//! # tillsync protocol
//!
//! Entity types, outbound operations and the remote API contract shared by
//! the tillsync local replica, its sync worker and the reference remote.
//!
//! This crate provides:
//! - [`EntityId`] with client-minted temporary ids and server canonical ids
//! - [`Money`] and the [`Aggregate`] tagged value for eventually consistent
//!   totals
//! - [`Session`], [`Order`], [`LineItem`] and their remote snapshots
//! - [`Operation`], the unit of outbox delivery, and [`EntityStream`]
//! - the [`RemoteApi`] trait every remote implementation satisfies
//! - CBOR encoding helpers
//!
//! This is a pure data crate with no I/O.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod entity;
mod id;
mod money;
mod operation;
mod remote;

pub use codec::{from_cbor, to_cbor, ProtocolError, ProtocolResult};
pub use entity::{
    EntityKind, LineItem, Order, OrderSnapshot, OrderStatus, Session, SessionSnapshot,
    SessionStatus, MAX_ITEMS_PER_ORDER,
};
pub use id::{EntityId, EntityStream};
pub use money::{Aggregate, Money};
pub use operation::{Operation, OperationType};
pub use remote::{dispatch, RemoteApi, RemoteError, RemoteReply, RemoteResult, ReplyStatus};
