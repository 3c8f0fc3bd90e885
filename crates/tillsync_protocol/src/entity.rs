//! Sessions, orders, line items and their remote snapshots.

use crate::id::EntityId;
use crate::money::{Aggregate, Money};
use serde::{Deserialize, Serialize};

/// Upper bound on line items per order.
pub const MAX_ITEMS_PER_ORDER: usize = 200;

/// Kind of business entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    /// A customer tab.
    Session,
    /// An order, inside a session or standalone.
    Order,
    /// A line on an order.
    LineItem,
}

impl EntityKind {
    /// Returns a short lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Session => "session",
            EntityKind::Order => "order",
            EntityKind::LineItem => "line_item",
        }
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    /// Accepting orders.
    Open,
    /// Close requested locally, not yet acknowledged.
    Closing,
    /// Closed on the remote.
    Closed,
}

/// Lifecycle of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Being built.
    Draft,
    /// Sent for preparation.
    Confirmed,
    /// Cancelled; excluded from session totals.
    Voided,
    /// Settled.
    Completed,
}

impl OrderStatus {
    /// Returns true if the order can no longer change.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Voided | OrderStatus::Completed)
    }

    /// Returns true if the order contributes to its session's totals.
    pub fn counts_toward_total(&self) -> bool {
        !matches!(self, OrderStatus::Voided)
    }
}

/// An open customer tab aggregating orders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Identifier (temporary until the remote confirms the creation).
    pub id: EntityId,
    /// Table or tab label.
    pub table: Option<String>,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Orders on this tab, in creation order.
    pub order_ids: Vec<EntityId>,
    /// Sum of order totals before discount and tax.
    pub subtotal: Aggregate,
    /// Discount, computed by the remote.
    pub discount: Aggregate,
    /// Tax, computed by the remote.
    pub tax: Aggregate,
    /// Amount due.
    pub total: Aggregate,
    /// Canonical id once a temporary record has been resolved.
    pub alias: Option<EntityId>,
    /// True until the remote has confirmed the creation.
    pub pending_remote: bool,
    /// Revision of this record, bumped on every local change and on every
    /// merge that alters it.
    pub sequence: u64,
    /// Unix milliseconds when the tab was opened.
    pub opened_at: u64,
}

impl Session {
    /// Opens a new tab.
    pub fn open(id: EntityId, table: Option<String>, opened_at: u64) -> Self {
        let pending_remote = id.is_temporary();
        Self {
            id,
            table,
            status: SessionStatus::Open,
            order_ids: Vec::new(),
            subtotal: Aggregate::local(Money::ZERO),
            discount: Aggregate::default(),
            tax: Aggregate::default(),
            total: Aggregate::local(Money::ZERO),
            alias: None,
            pending_remote,
            sequence: 0,
            opened_at,
        }
    }

    /// Returns true if intents may still change this tab.
    pub fn accepts_changes(&self) -> bool {
        self.status == SessionStatus::Open
    }

    /// Recomputes local aggregates from the tab's orders.
    ///
    /// `subtotal` and `total` become the sum of non-voided order totals;
    /// discount and tax are remote computed and keep their last value.
    pub fn recompute(&mut self, orders: &[Order]) {
        let sum: Money = orders
            .iter()
            .filter(|o| o.status.counts_toward_total())
            .map(|o| o.total.value())
            .sum();
        self.subtotal = Aggregate::local(sum);
        self.total = Aggregate::local(sum);
        self.sequence += 1;
    }
}

/// An order of line items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Identifier.
    pub id: EntityId,
    /// Owning session, `None` for a standalone order.
    pub session_id: Option<EntityId>,
    /// Lifecycle status.
    pub status: OrderStatus,
    /// Line items, in creation order.
    pub item_ids: Vec<EntityId>,
    /// Sum of line item totals.
    pub total: Aggregate,
    /// Canonical id once a temporary record has been resolved.
    pub alias: Option<EntityId>,
    /// True until the remote has confirmed the creation.
    pub pending_remote: bool,
    /// Revision of this record, bumped like [`Session::sequence`].
    pub sequence: u64,
    /// Unix milliseconds when the order was created.
    pub created_at: u64,
}

impl Order {
    /// Creates an empty draft order.
    pub fn new(id: EntityId, session_id: Option<EntityId>, created_at: u64) -> Self {
        let pending_remote = id.is_temporary();
        Self {
            id,
            session_id,
            status: OrderStatus::Draft,
            item_ids: Vec::new(),
            total: Aggregate::local(Money::ZERO),
            alias: None,
            pending_remote,
            sequence: 0,
            created_at,
        }
    }

    /// Recomputes the total from the order's current line items.
    pub fn recompute(&mut self, items: &[LineItem]) {
        let sum: Money = items.iter().map(|i| i.total).sum();
        self.total = Aggregate::local(sum);
        self.sequence += 1;
    }
}

/// A product line on an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    /// Identifier.
    pub id: EntityId,
    /// Owning order.
    pub order_id: EntityId,
    /// Product (stock resource) identifier.
    pub product_id: String,
    /// Units ordered.
    pub quantity: u32,
    /// Price per unit.
    pub unit_price: Money,
    /// `quantity × unit_price`.
    pub subtotal: Money,
    /// Line total; equals the subtotal since discounts are remote computed.
    pub total: Money,
    /// Canonical id once a temporary record has been resolved.
    pub alias: Option<EntityId>,
    /// True until the remote has confirmed the creation.
    pub pending_remote: bool,
}

impl LineItem {
    /// Creates a line, `None` if the amount overflows.
    pub fn new(
        id: EntityId,
        order_id: EntityId,
        product_id: impl Into<String>,
        quantity: u32,
        unit_price: Money,
    ) -> Option<Self> {
        let subtotal = unit_price.checked_times(quantity)?;
        let pending_remote = id.is_temporary();
        Some(Self {
            id,
            order_id,
            product_id: product_id.into(),
            quantity,
            unit_price,
            subtotal,
            total: subtotal,
            alias: None,
            pending_remote,
        })
    }

    /// Returns a copy with a new quantity and recomputed amounts.
    pub fn with_quantity(&self, quantity: u32) -> Option<Self> {
        let subtotal = self.unit_price.checked_times(quantity)?;
        Some(Self {
            quantity,
            subtotal,
            total: subtotal,
            ..self.clone()
        })
    }
}

/// Remote view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Canonical id.
    pub id: EntityId,
    /// Remote status.
    pub status: SessionStatus,
    /// Remote subtotal.
    pub subtotal: Money,
    /// Remote discount.
    pub discount: Money,
    /// Remote tax.
    pub tax: Money,
    /// Remote total.
    pub total: Money,
}

/// Remote view of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSnapshot {
    /// Canonical id.
    pub id: EntityId,
    /// Canonical id of the owning session.
    pub session_id: Option<EntityId>,
    /// Remote status.
    pub status: OrderStatus,
    /// Remote total.
    pub total: Money,
}
