//! Typed records over the raw store.

use crate::log::RecordKind;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tillsync_protocol::{LineItem, Order, Session};

/// A value the [`LocalStore`](crate::LocalStore) can persist by type.
pub trait Record: Serialize + DeserializeOwned {
    /// Kind the record is stored under.
    const KIND: RecordKind;

    /// Key within the kind.
    fn key(&self) -> String;
}

impl Record for Session {
    const KIND: RecordKind = RecordKind::Session;

    fn key(&self) -> String {
        self.id.to_string()
    }
}

impl Record for Order {
    const KIND: RecordKind = RecordKind::Order;

    fn key(&self) -> String {
        self.id.to_string()
    }
}

impl Record for LineItem {
    const KIND: RecordKind = RecordKind::LineItem;

    fn key(&self) -> String {
        self.id.to_string()
    }
}
