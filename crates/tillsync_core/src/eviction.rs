//! Eviction of closed sessions and the closed-id deny-list.
//!
//! Once the remote acknowledges a session closure the session, its orders
//! and its line items are deleted from the replica. Their ids, temporary and
//! canonical, go on a deny-list for [`StoreConfig::evicted_retention`] so a
//! late snapshot or a replayed creation cannot bring them back.
//!
//! [`StoreConfig::evicted_retention`]: crate::StoreConfig::evicted_retention

use crate::bus::{BroadcastBus, Origin, StoreEvent};
use crate::error::CoreResult;
use crate::identity::{AliasRecord, IdentityResolver};
use crate::log::RecordKind;
use crate::record::Record;
use crate::store::{LocalStore, WriteBatch};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tillsync_protocol::{EntityId, EntityKind, LineItem, Order, Session};
use tracing::{debug, info};

/// Deny-list entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictedRecord {
    /// The evicted id.
    pub id: EntityId,
    /// Entity kind.
    pub kind: EntityKind,
    /// Unix milliseconds of eviction.
    pub evicted_at: u64,
}

impl Record for EvictedRecord {
    const KIND: RecordKind = RecordKind::Evicted;

    fn key(&self) -> String {
        self.id.to_string()
    }
}

/// What an eviction removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Session ids removed (temporary and canonical).
    pub sessions: Vec<EntityId>,
    /// Order ids removed.
    pub orders: Vec<EntityId>,
    /// Line items removed.
    pub line_items: usize,
}

impl EvictionReport {
    /// Returns true if nothing was removed.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty() && self.orders.is_empty() && self.line_items == 0
    }

    /// Removal events for the sessions and orders that were deleted.
    pub fn events(&self) -> Vec<StoreEvent> {
        self.sessions
            .iter()
            .map(|id| StoreEvent::removed(EntityKind::Session, id.clone(), Origin::Remote))
            .chain(
                self.orders
                    .iter()
                    .map(|id| StoreEvent::removed(EntityKind::Order, id.clone(), Origin::Remote)),
            )
            .collect()
    }
}

/// Evicts closed sessions and answers deny-list lookups.
#[derive(Debug)]
pub struct EvictionLedger {
    store: Arc<LocalStore>,
    identity: Arc<IdentityResolver>,
    bus: BroadcastBus,
}

impl EvictionLedger {
    /// Creates a ledger over a store.
    pub fn new(store: Arc<LocalStore>, identity: Arc<IdentityResolver>, bus: BroadcastBus) -> Self {
        Self {
            store,
            identity,
            bus,
        }
    }

    /// Returns true if the id was evicted and is still on the deny-list.
    pub fn is_evicted(&self, id: &EntityId) -> bool {
        self.store.contains(RecordKind::Evicted, id.as_str())
    }

    /// Returns every deny-list entry.
    pub fn entries(&self) -> CoreResult<Vec<EvictedRecord>> {
        self.store.records()
    }

    /// Removes a closed session and everything inside it.
    ///
    /// `session_id` may be either the temporary or the canonical id.
    pub fn evict_session(&self, session_id: &EntityId, now: u64) -> CoreResult<EvictionReport> {
        let report = self.remove_session(session_id, now)?;
        self.bus.publish_all(report.events());
        Ok(report)
    }

    /// Evicts like [`evict_session`](Self::evict_session) without
    /// publishing; the caller publishes [`EvictionReport::events`] once it
    /// has released its stream lock.
    pub fn remove_session(&self, session_id: &EntityId, now: u64) -> CoreResult<EvictionReport> {
        let session_ids: HashSet<EntityId> =
            self.identity.known_ids(session_id)?.into_iter().collect();

        let orders = self.store.query_records(|o: &Order| {
            o.session_id
                .as_ref()
                .is_some_and(|s| session_ids.contains(s))
        })?;
        let mut order_ids: HashSet<EntityId> = orders.iter().map(|o| o.id.clone()).collect();
        for order in &orders {
            order_ids.extend(self.identity.known_ids(&order.id)?);
        }

        let items = self
            .store
            .query_records(|i: &LineItem| order_ids.contains(&i.order_id))?;
        let mut item_ids: HashSet<EntityId> = HashSet::new();
        for item in &items {
            item_ids.extend(self.identity.known_ids(&item.id)?);
        }

        let mut report = EvictionReport::default();
        let mut batch = WriteBatch::new();

        for id in &session_ids {
            if self.store.contains(RecordKind::Session, id.as_str()) {
                batch.delete_record::<Session>(id.as_str());
                report.sessions.push(id.clone());
            }
            batch.put_record(&EvictedRecord {
                id: id.clone(),
                kind: EntityKind::Session,
                evicted_at: now,
            })?;
        }
        for id in &order_ids {
            if self.store.contains(RecordKind::Order, id.as_str()) {
                batch.delete_record::<Order>(id.as_str());
                report.orders.push(id.clone());
            }
            batch.put_record(&EvictedRecord {
                id: id.clone(),
                kind: EntityKind::Order,
                evicted_at: now,
            })?;
        }
        for id in &item_ids {
            if self.store.contains(RecordKind::LineItem, id.as_str()) {
                batch.delete_record::<LineItem>(id.as_str());
                report.line_items += 1;
            }
        }
        for id in session_ids.iter().chain(&order_ids).chain(&item_ids) {
            if self.store.contains(RecordKind::Alias, id.as_str()) {
                batch.delete_record::<AliasRecord>(id.as_str());
            }
        }

        self.store.write_batch(batch)?;
        report.sessions.sort();
        report.orders.sort();

        info!(
            session = %session_id,
            orders = report.orders.len(),
            line_items = report.line_items,
            "evicted closed session"
        );
        Ok(report)
    }

    /// Drops deny-list entries older than `retention`.
    pub fn prune(&self, now: u64, retention: Duration) -> CoreResult<usize> {
        let retention_ms = u64::try_from(retention.as_millis()).unwrap_or(u64::MAX);
        let cutoff = now.saturating_sub(retention_ms);

        let mut batch = WriteBatch::new();
        for entry in self
            .store
            .query_records(|e: &EvictedRecord| e.evicted_at < cutoff)?
        {
            batch.delete_record::<EvictedRecord>(entry.key());
        }
        let pruned = batch.len();
        self.store.write_batch(batch)?;
        if pruned > 0 {
            debug!(pruned, "pruned deny-list entries");
        }
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tillsync_protocol::Money;

    struct Fixture {
        store: Arc<LocalStore>,
        identity: Arc<IdentityResolver>,
        ledger: EvictionLedger,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let bus = BroadcastBus::new();
        let identity = Arc::new(IdentityResolver::new(Arc::clone(&store), bus.clone()));
        let ledger = EvictionLedger::new(Arc::clone(&store), Arc::clone(&identity), bus);
        Fixture {
            store,
            identity,
            ledger,
        }
    }

    #[test]
    fn eviction_removes_tab_and_lists_both_ids() {
        let f = fixture();
        let tmp = EntityId::temporary();
        let mut session = Session::open(tmp.clone(), None, 0);
        let mut order = Order::new(EntityId::temporary(), Some(tmp.clone()), 0);
        let item = LineItem::new(
            EntityId::temporary(),
            order.id.clone(),
            "tea",
            2,
            Money::from_major(20),
        )
        .unwrap();
        order.item_ids.push(item.id.clone());
        session.order_ids.push(order.id.clone());
        f.store.put_record(&session).unwrap();
        f.store.put_record(&order).unwrap();
        f.store.put_record(&item).unwrap();
        let canonical = EntityId::canonical("S-9");
        f.identity
            .resolve_creation(EntityKind::Session, &tmp, &canonical, 0)
            .unwrap();

        let report = f.ledger.evict_session(&canonical, 100).unwrap();

        assert_eq!(report.sessions.len(), 2);
        assert_eq!(report.orders, vec![order.id.clone()]);
        assert_eq!(report.line_items, 1);
        assert!(f.ledger.is_evicted(&tmp));
        assert!(f.ledger.is_evicted(&canonical));
        assert!(f.ledger.is_evicted(&order.id));
        assert_eq!(f.store.count(RecordKind::Session), 0);
        assert_eq!(f.store.count(RecordKind::LineItem), 0);
        assert_eq!(f.store.count(RecordKind::Alias), 0);
    }

    #[test]
    fn deny_list_expires_after_retention() {
        let f = fixture();
        let id = EntityId::canonical("S-1");
        f.store.put_record(&Session::open(id.clone(), None, 0)).unwrap();
        f.ledger.evict_session(&id, 1_000).unwrap();

        assert_eq!(f.ledger.prune(1_500, Duration::from_secs(1)).unwrap(), 0);
        assert!(f.ledger.is_evicted(&id));
        assert_eq!(f.ledger.prune(2_001, Duration::from_secs(1)).unwrap(), 1);
        assert!(!f.ledger.is_evicted(&id));
    }
}
