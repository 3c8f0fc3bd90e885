//! The remote API contract.

use crate::entity::{OrderSnapshot, SessionSnapshot};
use crate::id::EntityId;
use crate::money::Money;
use crate::operation::Operation;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for remote calls.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Errors returned by a remote call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// The request may or may not have reached the remote.
    #[error("network error: {0}")]
    Network(String),

    /// No response within the request deadline.
    #[error("request timed out")]
    Timeout,

    /// The remote is temporarily unable to serve requests.
    #[error("remote unavailable: {0}")]
    Unavailable(String),

    /// The remote refused the request; repeating it cannot succeed.
    #[error("rejected: {reason}")]
    Rejected {
        /// Human readable reason.
        reason: String,
    },
}

impl RemoteError {
    /// Creates a rejection.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    /// Returns true if repeating the request later may succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, RemoteError::Rejected { .. })
    }
}

/// Whether a mutating call changed remote state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyStatus {
    /// The call took effect now.
    Applied,
    /// The effect had already landed (same idempotency key or client
    /// reference, or the target already in the requested state).
    AlreadyApplied,
}

/// Response to a mutating call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteReply {
    /// Applied or already applied.
    pub status: ReplyStatus,
    /// Canonical id of the created entity, for creations.
    pub canonical_id: Option<EntityId>,
    /// Fresh view of the affected session.
    pub session: Option<SessionSnapshot>,
    /// Fresh view of the affected order.
    pub order: Option<OrderSnapshot>,
}

impl RemoteReply {
    /// A reply with no payload.
    pub fn new(status: ReplyStatus) -> Self {
        Self {
            status,
            canonical_id: None,
            session: None,
            order: None,
        }
    }

    /// Sets the canonical id.
    #[must_use]
    pub fn with_canonical_id(mut self, id: EntityId) -> Self {
        self.canonical_id = Some(id);
        self
    }

    /// Attaches a session snapshot.
    #[must_use]
    pub fn with_session(mut self, snapshot: SessionSnapshot) -> Self {
        self.session = Some(snapshot);
        self
    }

    /// Attaches an order snapshot.
    #[must_use]
    pub fn with_order(mut self, snapshot: OrderSnapshot) -> Self {
        self.order = Some(snapshot);
        self
    }
}

/// The authoritative remote store.
///
/// Every mutating call must be idempotent: repeating a call whose effect
/// already landed returns [`ReplyStatus::AlreadyApplied`] instead of
/// failing or duplicating. `key` is the idempotency key of the outbox
/// record and is identical across retries. Creations are additionally
/// deduplicated by their client reference (the temporary id), so a double
/// submission of the same tab never creates two sessions.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Opens a tab.
    async fn create_session(
        &self,
        key: &str,
        client_ref: &EntityId,
        table: Option<&str>,
    ) -> RemoteResult<RemoteReply>;

    /// Closes a tab.
    async fn close_session(&self, key: &str, session_id: &EntityId) -> RemoteResult<RemoteReply>;

    /// Creates an order, optionally inside a tab.
    async fn create_order(
        &self,
        key: &str,
        client_ref: &EntityId,
        session_id: Option<&EntityId>,
    ) -> RemoteResult<RemoteReply>;

    /// Adds a line to an order.
    async fn add_order_item(
        &self,
        key: &str,
        order_id: &EntityId,
        client_ref: &EntityId,
        product_id: &str,
        quantity: u32,
        unit_price: Money,
    ) -> RemoteResult<RemoteReply>;

    /// Reduces or removes a line.
    async fn modify_order_item(
        &self,
        key: &str,
        item_id: &EntityId,
        new_quantity: u32,
    ) -> RemoteResult<RemoteReply>;

    /// Confirms an order.
    async fn confirm_order(&self, key: &str, order_id: &EntityId) -> RemoteResult<RemoteReply>;

    /// Voids an order.
    async fn void_order(&self, key: &str, order_id: &EntityId) -> RemoteResult<RemoteReply>;

    /// Reads a tab, `None` if the remote does not know it.
    async fn fetch_session(&self, id: &EntityId) -> RemoteResult<Option<SessionSnapshot>>;

    /// Reads an order, `None` if the remote does not know it.
    async fn fetch_order(&self, id: &EntityId) -> RemoteResult<Option<OrderSnapshot>>;
}

/// Sends an operation through the matching [`RemoteApi`] call.
pub async fn dispatch(
    remote: &dyn RemoteApi,
    key: &str,
    operation: &Operation,
) -> RemoteResult<RemoteReply> {
    match operation {
        Operation::CreateSession { session_id, table } => {
            remote
                .create_session(key, session_id, table.as_deref())
                .await
        }
        Operation::CloseSession { session_id } => remote.close_session(key, session_id).await,
        Operation::CreateOrder {
            order_id,
            session_id,
        } => {
            remote
                .create_order(key, order_id, session_id.as_ref())
                .await
        }
        Operation::AddOrderItem {
            order_id,
            item_id,
            product_id,
            quantity,
            unit_price,
        } => {
            remote
                .add_order_item(key, order_id, item_id, product_id, *quantity, *unit_price)
                .await
        }
        Operation::ModifyOrderItem {
            item_id,
            new_quantity,
            ..
        } => remote.modify_order_item(key, item_id, *new_quantity).await,
        Operation::ConfirmOrder { order_id } => remote.confirm_order(key, order_id).await,
        Operation::VoidOrder { order_id } => remote.void_order(key, order_id).await,
    }
}
