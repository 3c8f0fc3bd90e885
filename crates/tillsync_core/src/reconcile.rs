//! Merging remote snapshots into local state.

use tillsync_protocol::{
    Aggregate, Money, Order, OrderSnapshot, OrderStatus, Session, SessionSnapshot, SessionStatus,
};

/// How remote snapshots are merged into local records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconciliationPolicy {
    /// Protect local changes the remote has not caught up with.
    ///
    /// While an entity has an outstanding mutation each money aggregate
    /// becomes `max(local, remote)` and stays pending; otherwise the remote
    /// value is taken as confirmed. Status follows the remote, except that a
    /// local close blocks a remote `Open` and an outstanding local void
    /// blocks a remote non-voided status.
    #[default]
    Defensive,
    /// Take every remote value as is. For diagnostics and tests.
    RemoteAuthoritative,
}

impl ReconciliationPolicy {
    fn merge(&self, local: Aggregate, remote: Money, outstanding: bool) -> Aggregate {
        match self {
            ReconciliationPolicy::Defensive => local.merge_remote(remote, outstanding),
            ReconciliationPolicy::RemoteAuthoritative => Aggregate::Confirmed(remote),
        }
    }

    /// Merges a session snapshot. `outstanding` is true while any mutation
    /// on the session's stream awaits acknowledgement.
    #[must_use]
    pub fn merge_session(
        &self,
        local: &Session,
        remote: &SessionSnapshot,
        outstanding: bool,
    ) -> Session {
        let mut merged = local.clone();
        merged.subtotal = self.merge(local.subtotal, remote.subtotal, outstanding);
        merged.discount = self.merge(local.discount, remote.discount, outstanding);
        merged.tax = self.merge(local.tax, remote.tax, outstanding);
        merged.total = self.merge(local.total, remote.total, outstanding);

        merged.status = match (self, local.status, remote.status) {
            (
                ReconciliationPolicy::Defensive,
                SessionStatus::Closing | SessionStatus::Closed,
                SessionStatus::Open,
            ) => local.status,
            (_, _, status) => status,
        };

        if merged != *local {
            merged.sequence += 1;
        }
        merged
    }

    /// Merges an order snapshot. `outstanding` is true while any mutation
    /// naming the order awaits acknowledgement.
    #[must_use]
    pub fn merge_order(&self, local: &Order, remote: &OrderSnapshot, outstanding: bool) -> Order {
        let mut merged = local.clone();
        merged.total = self.merge(local.total, remote.total, outstanding);

        merged.status = match (self, local.status, remote.status) {
            (ReconciliationPolicy::Defensive, OrderStatus::Voided, status)
                if outstanding && status != OrderStatus::Voided =>
            {
                OrderStatus::Voided
            }
            (_, _, status) => status,
        };

        if merged != *local {
            merged.sequence += 1;
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tillsync_protocol::EntityId;

    fn session_with_total(total: i64) -> Session {
        let mut session = Session::open(EntityId::canonical("S-1"), None, 0);
        session.subtotal = Aggregate::local(Money::from_major(total));
        session.total = Aggregate::local(Money::from_major(total));
        session
    }

    fn snapshot(status: SessionStatus, total: i64) -> SessionSnapshot {
        SessionSnapshot {
            id: EntityId::canonical("S-1"),
            status,
            subtotal: Money::from_major(total),
            discount: Money::ZERO,
            tax: Money::ZERO,
            total: Money::from_major(total),
        }
    }

    #[test]
    fn lagging_remote_does_not_regress_pending_total() {
        let local = session_with_total(70);
        let merged = ReconciliationPolicy::Defensive.merge_session(
            &local,
            &snapshot(SessionStatus::Open, 0),
            true,
        );
        assert_eq!(merged.total.value(), Money::from_major(70));
        assert!(merged.total.is_pending());

        let settled = ReconciliationPolicy::Defensive.merge_session(
            &merged,
            &snapshot(SessionStatus::Open, 70),
            false,
        );
        assert_eq!(settled.total, Aggregate::Confirmed(Money::from_major(70)));
    }

    #[test]
    fn remote_authoritative_takes_remote_values() {
        let local = session_with_total(70);
        let merged = ReconciliationPolicy::RemoteAuthoritative.merge_session(
            &local,
            &snapshot(SessionStatus::Open, 0),
            true,
        );
        assert_eq!(merged.total, Aggregate::Confirmed(Money::ZERO));
    }

    #[test]
    fn local_close_blocks_remote_open() {
        let mut local = session_with_total(10);
        local.status = SessionStatus::Closing;
        let merged = ReconciliationPolicy::Defensive.merge_session(
            &local,
            &snapshot(SessionStatus::Open, 10),
            true,
        );
        assert_eq!(merged.status, SessionStatus::Closing);

        let closed = ReconciliationPolicy::Defensive.merge_session(
            &local,
            &snapshot(SessionStatus::Closed, 10),
            false,
        );
        assert_eq!(closed.status, SessionStatus::Closed);
    }

    #[test]
    fn outstanding_void_blocks_remote_status() {
        let mut local = Order::new(EntityId::canonical("O-1"), None, 0);
        local.status = OrderStatus::Voided;
        let remote = OrderSnapshot {
            id: local.id.clone(),
            session_id: None,
            status: OrderStatus::Confirmed,
            total: Money::from_major(5),
        };

        let merged = ReconciliationPolicy::Defensive.merge_order(&local, &remote, true);
        assert_eq!(merged.status, OrderStatus::Voided);

        let merged = ReconciliationPolicy::Defensive.merge_order(&local, &remote, false);
        assert_eq!(merged.status, OrderStatus::Confirmed);
    }

    #[test]
    fn unchanged_merge_keeps_sequence() {
        let mut local = Order::new(EntityId::canonical("O-1"), None, 0);
        local.total = Aggregate::Confirmed(Money::from_major(5));
        local.status = OrderStatus::Confirmed;
        let remote = OrderSnapshot {
            id: local.id.clone(),
            session_id: None,
            status: OrderStatus::Confirmed,
            total: Money::from_major(5),
        };

        let merged = ReconciliationPolicy::Defensive.merge_order(&local, &remote, false);
        assert_eq!(merged.sequence, local.sequence);
    }
}
