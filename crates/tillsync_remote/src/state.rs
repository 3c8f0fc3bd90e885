//! Authoritative entity state of the reference remote.

use std::collections::{BTreeMap, HashMap};
use tillsync_protocol::{
    EntityId, Money, OrderSnapshot, OrderStatus, RemoteError, RemoteResult, SessionSnapshot,
    SessionStatus,
};

#[derive(Debug, Clone)]
pub(crate) struct RemoteSession {
    pub(crate) id: EntityId,
    pub(crate) table: Option<String>,
    pub(crate) status: SessionStatus,
    pub(crate) order_ids: Vec<EntityId>,
    pub(crate) subtotal: Money,
    pub(crate) tax: Money,
    pub(crate) total: Money,
}

#[derive(Debug, Clone)]
pub(crate) struct RemoteOrder {
    pub(crate) id: EntityId,
    pub(crate) session_id: Option<EntityId>,
    pub(crate) status: OrderStatus,
    pub(crate) item_ids: Vec<EntityId>,
    pub(crate) total: Money,
}

#[derive(Debug, Clone)]
pub(crate) struct RemoteItem {
    pub(crate) order_id: EntityId,
    pub(crate) quantity: u32,
    pub(crate) unit_price: Money,
}

impl RemoteItem {
    fn total(&self) -> Money {
        self.unit_price
            .checked_times(self.quantity)
            .unwrap_or(Money::ZERO)
    }
}

/// Entities, client references and the next id counter.
#[derive(Debug, Default)]
pub(crate) struct RemoteState {
    next_id: u64,
    pub(crate) sessions: BTreeMap<EntityId, RemoteSession>,
    pub(crate) orders: BTreeMap<EntityId, RemoteOrder>,
    pub(crate) items: BTreeMap<EntityId, RemoteItem>,
    pub(crate) client_refs: HashMap<EntityId, EntityId>,
}

impl RemoteState {
    pub(crate) fn mint(&mut self, prefix: &str) -> EntityId {
        self.next_id += 1;
        EntityId::canonical(format!("{prefix}-{}", 1000 + self.next_id))
    }

    pub(crate) fn session(&self, id: &EntityId) -> RemoteResult<&RemoteSession> {
        self.sessions
            .get(id)
            .ok_or_else(|| RemoteError::rejected(format!("unknown session {id}")))
    }

    pub(crate) fn open_session_mut(&mut self, id: &EntityId) -> RemoteResult<&mut RemoteSession> {
        let session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| RemoteError::rejected(format!("unknown session {id}")))?;
        if session.status != SessionStatus::Open {
            return Err(RemoteError::rejected(format!("session {id} is closed")));
        }
        Ok(session)
    }

    pub(crate) fn order(&self, id: &EntityId) -> RemoteResult<&RemoteOrder> {
        self.orders
            .get(id)
            .ok_or_else(|| RemoteError::rejected(format!("unknown order {id}")))
    }

    /// Returns the order if it and its tab still accept changes.
    pub(crate) fn editable_order(&self, id: &EntityId) -> RemoteResult<&RemoteOrder> {
        let order = self.order(id)?;
        if order.status.is_terminal() {
            return Err(RemoteError::rejected(format!(
                "order {id} is {:?}",
                order.status
            )));
        }
        if let Some(session_id) = &order.session_id {
            if self.session(session_id)?.status != SessionStatus::Open {
                return Err(RemoteError::rejected(format!(
                    "session {session_id} is closed"
                )));
            }
        }
        Ok(order)
    }

    /// Recomputes one order's total and its tab's aggregates.
    pub(crate) fn recalculate_order(&mut self, id: &EntityId, tax_basis_points: i64) {
        let Some(order) = self.orders.get(id) else {
            return;
        };
        let total: Money = order
            .item_ids
            .iter()
            .filter_map(|item| self.items.get(item))
            .map(RemoteItem::total)
            .sum();
        let session_id = order.session_id.clone();
        if let Some(order) = self.orders.get_mut(id) {
            order.total = total;
        }
        if let Some(session_id) = session_id {
            self.recalculate_session(&session_id, tax_basis_points);
        }
    }

    pub(crate) fn recalculate_session(&mut self, id: &EntityId, tax_basis_points: i64) {
        let Some(session) = self.sessions.get(id) else {
            return;
        };
        let subtotal: Money = session
            .order_ids
            .iter()
            .filter_map(|order| self.orders.get(order))
            .filter(|order| order.status.counts_toward_total())
            .map(|order| order.total)
            .sum();
        let tax = Money::from_minor(subtotal.minor().saturating_mul(tax_basis_points) / 10_000);
        if let Some(session) = self.sessions.get_mut(id) {
            session.subtotal = subtotal;
            session.tax = tax;
            session.total = subtotal + tax;
        }
    }

    pub(crate) fn recalculate_all(&mut self, tax_basis_points: i64) {
        let orders: Vec<EntityId> = self.orders.keys().cloned().collect();
        for id in &orders {
            self.recalculate_order(id, tax_basis_points);
        }
        let sessions: Vec<EntityId> = self.sessions.keys().cloned().collect();
        for id in &sessions {
            self.recalculate_session(id, tax_basis_points);
        }
    }

    pub(crate) fn session_snapshot(&self, id: &EntityId) -> Option<SessionSnapshot> {
        self.sessions.get(id).map(|s| SessionSnapshot {
            id: s.id.clone(),
            status: s.status,
            subtotal: s.subtotal,
            discount: Money::ZERO,
            tax: s.tax,
            total: s.total,
        })
    }

    pub(crate) fn order_snapshot(&self, id: &EntityId) -> Option<OrderSnapshot> {
        self.orders.get(id).map(|o| OrderSnapshot {
            id: o.id.clone(),
            session_id: o.session_id.clone(),
            status: o.status,
            total: o.total,
        })
    }
}
