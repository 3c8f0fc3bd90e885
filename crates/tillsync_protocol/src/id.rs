//! Entity identifiers and delivery streams.

use crate::entity::EntityKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Prefix marking a client-minted identifier.
const TEMPORARY_PREFIX: &str = "tmp-";

/// Identifier of a session, order or line item.
///
/// Entities created on the terminal start with a temporary id
/// (`tmp-<uuid>`). Once the remote accepts the creation it assigns a
/// canonical id and the identity resolver links the two.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Mints a new temporary id.
    #[must_use]
    pub fn temporary() -> Self {
        Self(format!("{TEMPORARY_PREFIX}{}", Uuid::new_v4().simple()))
    }

    /// Wraps an id assigned by the remote.
    pub fn canonical(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns true if this id was minted locally and never confirmed.
    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMPORARY_PREFIX)
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// The unit of FIFO delivery ordering.
///
/// A session and everything inside it (its orders and their line items)
/// share one stream so that, for example, "add item" always reaches the
/// remote before "close session". A standalone order is its own stream.
///
/// Streams are named after the id the root entity had when the stream was
/// opened and never change afterwards, even when that id is later resolved
/// to a canonical one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityStream(String);

impl EntityStream {
    /// Stream of a session and its contents.
    pub fn session(id: &EntityId) -> Self {
        Self(format!("session:{id}"))
    }

    /// Stream of a standalone order.
    pub fn order(id: &EntityId) -> Self {
        Self(format!("order:{id}"))
    }

    /// Returns the stream name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the kind and id of the stream's root entity.
    pub fn root(&self) -> Option<(EntityKind, EntityId)> {
        let (kind, id) = self.0.split_once(':')?;
        let kind = match kind {
            "session" => EntityKind::Session,
            "order" => EntityKind::Order,
            _ => return None,
        };
        Some((kind, EntityId(id.to_string())))
    }
}

impl fmt::Display for EntityStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
