//! Applying remote results to the local replica.
//!
//! Everything here is synchronous and runs under the stream lock of the
//! entity it touches, so remote results interleave with UI intents one at
//! a time. Bus events are published after the lock is released.

use std::collections::HashMap;
use std::sync::Arc;
use tillsync_core::{
    now_millis, CoreResult, MutationRecord, Origin, ReconciliationPolicy, StoreEvent, Till,
};
use tillsync_protocol::{
    EntityId, EntityKind, EntityStream, Operation, Order, OrderSnapshot, RemoteReply, Session,
    SessionSnapshot, SessionStatus,
};
use tracing::{debug, info};

/// What to do with the head of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prepared {
    /// Send this operation, ids already translated to canonical ones.
    Send(Operation),
    /// Drop the mutation silently; it was superseded.
    Skip(String),
    /// Drop the mutation and report it; it can never succeed.
    Reject(String),
}

/// What an acknowledgement changed locally.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Applied {
    /// Canonical id linked to a temporary one.
    pub resolved: Option<EntityId>,
    /// Snapshots merged from the reply.
    pub snapshots_merged: u64,
    /// Mutations dropped behind an acknowledged close.
    pub skipped: u64,
    /// Whether the tab was evicted.
    pub evicted: bool,
}

/// Applies remote replies and snapshots to a [`Till`].
#[derive(Debug)]
pub struct ReplicaApplier {
    till: Arc<Till>,
    policy: ReconciliationPolicy,
}

impl ReplicaApplier {
    /// Creates an applier merging with `policy`.
    pub fn new(till: Arc<Till>, policy: ReconciliationPolicy) -> Self {
        Self { till, policy }
    }

    /// Returns the till.
    pub fn till(&self) -> &Arc<Till> {
        &self.till
    }

    /// Decides whether the head of a stream is still worth sending.
    ///
    /// Ids the mutation references are translated to their canonical form.
    /// The id an operation creates is left alone: it is the client reference
    /// the remote deduplicates creations by.
    pub fn prepare(&self, record: &MutationRecord) -> CoreResult<Prepared> {
        let identity = self.till.identity();
        let ledger = self.till.ledger();
        let operation = &record.operation;
        let created = operation.created_entity().map(|(_, id)| id.clone());

        let mut translated = HashMap::new();
        for id in operation.touches() {
            let resolved = identity.resolve(id)?;
            if ledger.is_evicted(id) || ledger.is_evicted(&resolved) {
                return Ok(Prepared::Skip(format!("{id} was evicted")));
            }
            translated.insert(id.clone(), resolved);
        }

        if operation.is_tab_content() && self.tab_status(&record.stream)? == Some(SessionStatus::Closed)
        {
            return Ok(Prepared::Skip("tab is closed".to_string()));
        }

        let outgoing = operation.map_ids(|id| {
            if created.as_ref() == Some(id) {
                return id.clone();
            }
            translated.get(id).cloned().unwrap_or_else(|| id.clone())
        });

        if let Some(missing) = outgoing
            .touches()
            .into_iter()
            .find(|id| id.is_temporary() && created.as_ref() != Some(*id))
        {
            return Ok(Prepared::Reject(format!(
                "{missing} was never created on the remote"
            )));
        }
        Ok(Prepared::Send(outgoing))
    }

    fn tab_status(&self, stream: &EntityStream) -> CoreResult<Option<SessionStatus>> {
        match stream.root() {
            Some((EntityKind::Session, root)) => {
                Ok(self.till.session(&root)?.map(|session| session.status))
            }
            _ => Ok(None),
        }
    }

    /// Applies a successful (or "already applied") reply and acknowledges
    /// the mutation.
    pub fn apply_reply(&self, record: &MutationRecord, reply: &RemoteReply) -> CoreResult<Applied> {
        let mut events = Vec::new();
        let lock = self.till.stream_lock(&record.stream);
        let applied = {
            let _guard = lock.lock();
            self.apply_reply_locked(record, reply, &mut events)
        };
        self.till.bus().publish_all(events);
        applied
    }

    fn apply_reply_locked(
        &self,
        record: &MutationRecord,
        reply: &RemoteReply,
        events: &mut Vec<StoreEvent>,
    ) -> CoreResult<Applied> {
        let now = now_millis();
        let mut applied = Applied::default();

        if let (Some((kind, temporary)), Some(canonical)) =
            (record.operation.created_entity(), &reply.canonical_id)
        {
            if temporary.is_temporary() && !self.till.ledger().is_evicted(temporary) {
                events.extend(
                    self.till
                        .identity()
                        .link_creation(kind, temporary, canonical, now)?,
                );
                applied.resolved = Some(canonical.clone());
            }
        }

        self.till.outbox().mark_acked(record.id)?;

        if let Operation::CloseSession { session_id } = &record.operation {
            for queued in self.till.outbox().next_batch(&record.stream, usize::MAX)? {
                self.till
                    .outbox()
                    .mark_skipped(queued.id, "tab closed on the remote")?;
                applied.skipped += 1;
            }
            let report = self.till.ledger().remove_session(session_id, now)?;
            events.extend(report.events());
            applied.evicted = !report.is_empty();
            return Ok(applied);
        }

        // A reply's snapshot was taken alongside the write; only a later
        // read may confirm totals.
        if let Some(snapshot) = &reply.session {
            if self.merge_session(&record.stream, snapshot, true, events)? {
                applied.snapshots_merged += 1;
            }
        }
        if let Some(snapshot) = &reply.order {
            if self.merge_order(snapshot, true, events)? {
                applied.snapshots_merged += 1;
            }
        }
        Ok(applied)
    }

    /// Merges a fetched session snapshot.
    ///
    /// Returns false if the snapshot was ignored. A tab the remote reports
    /// closed with nothing left to send is evicted; one that still has
    /// queued work is marked closed and evicted once the stream drains.
    pub fn apply_session_snapshot(&self, snapshot: &SessionSnapshot) -> CoreResult<bool> {
        if self.till.ledger().is_evicted(&snapshot.id) {
            debug!(session = %snapshot.id, "ignoring snapshot of evicted session");
            return Ok(false);
        }
        let stream = self.till.session_stream(&snapshot.id)?;
        let mut events = Vec::new();
        let lock = self.till.stream_lock(&stream);
        let merged = {
            let _guard = lock.lock();
            self.apply_session_snapshot_locked(&stream, snapshot, &mut events)
        };
        self.till.bus().publish_all(events);
        merged
    }

    fn apply_session_snapshot_locked(
        &self,
        stream: &EntityStream,
        snapshot: &SessionSnapshot,
        events: &mut Vec<StoreEvent>,
    ) -> CoreResult<bool> {
        if snapshot.status == SessionStatus::Closed
            && !self.till.outbox().has_outstanding(stream)?
        {
            info!(session = %snapshot.id, "session closed remotely");
            let report = self
                .till
                .ledger()
                .remove_session(&snapshot.id, now_millis())?;
            events.extend(report.events());
            return Ok(!report.is_empty());
        }
        self.merge_session(stream, snapshot, false, events)
    }

    /// Merges a fetched order snapshot. Returns false if it was ignored.
    pub fn apply_order_snapshot(&self, snapshot: &OrderSnapshot) -> CoreResult<bool> {
        if self.till.ledger().is_evicted(&snapshot.id) {
            debug!(order = %snapshot.id, "ignoring snapshot of evicted order");
            return Ok(false);
        }
        let Some(order) = self.till.order(&snapshot.id)? else {
            debug!(order = %snapshot.id, "ignoring snapshot of unknown order");
            return Ok(false);
        };
        let mut events = Vec::new();
        let lock = self.till.stream_lock(&self.till.order_stream(&order)?);
        let merged = {
            let _guard = lock.lock();
            self.merge_order(snapshot, false, &mut events)
        };
        self.till.bus().publish_all(events);
        merged
    }

    // Callers hold the stream lock and publish `events` after releasing it.
    fn merge_session(
        &self,
        stream: &EntityStream,
        snapshot: &SessionSnapshot,
        in_reply: bool,
        events: &mut Vec<StoreEvent>,
    ) -> CoreResult<bool> {
        if self.till.ledger().is_evicted(&snapshot.id) {
            return Ok(false);
        }
        let Some(local) = self.till.session(&snapshot.id)? else {
            debug!(session = %snapshot.id, "ignoring snapshot of unknown session");
            return Ok(false);
        };
        let outstanding = in_reply || self.till.outbox().has_outstanding(stream)?;
        let merged = self.policy.merge_session(&local, snapshot, outstanding);
        if merged == local {
            return Ok(true);
        }
        self.till.store().put_record::<Session>(&merged)?;
        events.push(StoreEvent::upserted(
            EntityKind::Session,
            merged.id,
            Origin::Remote,
        ));
        Ok(true)
    }

    fn merge_order(
        &self,
        snapshot: &OrderSnapshot,
        in_reply: bool,
        events: &mut Vec<StoreEvent>,
    ) -> CoreResult<bool> {
        if self.till.ledger().is_evicted(&snapshot.id) {
            return Ok(false);
        }
        let Some(local) = self.till.order(&snapshot.id)? else {
            return Ok(false);
        };
        let mut outstanding = in_reply;
        for id in self.till.identity().known_ids(&local.id)? {
            outstanding |= self.till.outbox().outstanding_for(&id)?;
        }
        let merged = self.policy.merge_order(&local, snapshot, outstanding);
        if merged == local {
            return Ok(true);
        }
        self.till.store().put_record::<Order>(&merged)?;
        events.push(StoreEvent::upserted(
            EntityKind::Order,
            merged.id,
            Origin::Remote,
        ));
        Ok(true)
    }

    /// Returns canonical ids of tabs and orders worth fetching: open tabs,
    /// their unfinished orders and unfinished standalone orders.
    pub fn tracked(&self) -> CoreResult<(Vec<EntityId>, Vec<EntityId>)> {
        let mut sessions = Vec::new();
        let mut orders = Vec::new();
        for session in self.till.open_sessions()? {
            if session.id.is_temporary() {
                continue;
            }
            for order in self.till.orders_for_session(&session.id)? {
                if !order.id.is_temporary() && !order.status.is_terminal() {
                    orders.push(order.id);
                }
            }
            sessions.push(session.id);
        }
        orders.extend(
            self.till
                .active_standalone_orders()?
                .into_iter()
                .filter(|o| !o.id.is_temporary())
                .map(|o| o.id),
        );
        Ok((sessions, orders))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tillsync_core::{Change, MutationState};
    use tillsync_protocol::{Aggregate, Money, OrderStatus, ReplyStatus};

    fn applier() -> ReplicaApplier {
        ReplicaApplier::new(
            Arc::new(Till::open_in_memory().unwrap()),
            ReconciliationPolicy::Defensive,
        )
    }

    fn head(applier: &ReplicaApplier) -> MutationRecord {
        applier.till().outbox().all().unwrap().remove(0)
    }

    fn ack_head(applier: &ReplicaApplier, canonical: Option<&str>) -> Applied {
        let record = head(applier);
        applier.till().outbox().mark_in_flight(record.id).unwrap();
        let mut reply = RemoteReply::new(ReplyStatus::Applied);
        if let Some(id) = canonical {
            reply = reply.with_canonical_id(EntityId::canonical(id));
        }
        applier.apply_reply(&record, &reply).unwrap()
    }

    #[test]
    fn creation_reply_links_ids() {
        let applier = applier();
        let till = applier.till();
        let tab = till.open_session(Some("T1".into())).unwrap();

        let applied = ack_head(&applier, Some("S-100"));
        assert_eq!(applied.resolved, Some(EntityId::canonical("S-100")));

        let by_temp = till.session(&tab).unwrap().unwrap();
        let by_canonical = till.session(&EntityId::canonical("S-100")).unwrap().unwrap();
        assert_eq!(by_temp, by_canonical);
        assert!(!by_canonical.pending_remote);
        assert_eq!(till.pending_mutations(), 0);
    }

    #[test]
    fn prepare_translates_parent_ids_but_not_the_created_id() {
        let applier = applier();
        let till = applier.till();
        let tab = till.open_session(None).unwrap();
        let order = till.create_order(Some(&tab)).unwrap();
        ack_head(&applier, Some("S-1"));

        let record = head(&applier);
        match applier.prepare(&record).unwrap() {
            Prepared::Send(Operation::CreateOrder {
                order_id,
                session_id,
            }) => {
                assert_eq!(order_id, order);
                assert_eq!(session_id, Some(EntityId::canonical("S-1")));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn dependency_on_rejected_creation_is_rejected() {
        let applier = applier();
        let till = applier.till();
        let order = till.create_order(None).unwrap();
        till.add_item(&order, "halo-halo", 1, Money::from_major(90)).unwrap();

        let creation = head(&applier);
        till.outbox().mark_permanent(creation.id, "menu closed").unwrap();

        let record = head(&applier);
        assert!(matches!(
            applier.prepare(&record).unwrap(),
            Prepared::Reject(_)
        ));
    }

    #[test]
    fn acknowledged_close_evicts_and_skips_the_rest() {
        let applier = applier();
        let till = applier.till();
        let tab = till.open_session(Some("T9".into())).unwrap();
        ack_head(&applier, Some("S-9"));
        till.close_session(&tab).unwrap();

        let close = head(&applier);
        // A straggler queued behind the close.
        till.outbox()
            .enqueue(
                close.stream.clone(),
                Operation::CreateOrder {
                    order_id: EntityId::temporary(),
                    session_id: Some(EntityId::canonical("S-9")),
                },
                0,
            )
            .unwrap();

        let applied = ack_head(&applier, None);
        assert!(applied.evicted);
        assert_eq!(applied.skipped, 1);
        assert_eq!(till.pending_mutations(), 0);
        assert!(till.session(&tab).unwrap().is_none());
        assert!(till.ledger().is_evicted(&EntityId::canonical("S-9")));
    }

    #[test]
    fn snapshots_of_evicted_sessions_are_ignored() {
        let applier = applier();
        let till = applier.till();
        let tab = till.open_session(None).unwrap();
        ack_head(&applier, Some("S-5"));
        till.ledger().evict_session(&tab, now_millis()).unwrap();

        let snapshot = SessionSnapshot {
            id: EntityId::canonical("S-5"),
            status: SessionStatus::Open,
            subtotal: Money::from_major(10),
            discount: Money::ZERO,
            tax: Money::ZERO,
            total: Money::from_major(10),
        };
        assert!(!applier.apply_session_snapshot(&snapshot).unwrap());
        assert!(till.session(&EntityId::canonical("S-5")).unwrap().is_none());
    }

    #[test]
    fn order_snapshot_confirms_total_once_nothing_is_outstanding() {
        let applier = applier();
        let till = applier.till();
        let order = till.create_order(None).unwrap();
        till.add_item(&order, "ube", 2, Money::from_major(20)).unwrap();
        ack_head(&applier, Some("O-1"));

        let snapshot = OrderSnapshot {
            id: EntityId::canonical("O-1"),
            session_id: None,
            status: OrderStatus::Draft,
            total: Money::ZERO,
        };
        assert!(applier.apply_order_snapshot(&snapshot).unwrap());
        let merged = till.order(&order).unwrap().unwrap();
        assert_eq!(merged.total.value(), Money::from_major(40));
        assert!(merged.total.is_pending());

        let item = head(&applier);
        assert_eq!(item.state, MutationState::Pending);
        ack_head(&applier, Some("I-1"));
        let snapshot = OrderSnapshot {
            total: Money::from_major(40),
            ..snapshot
        };
        applier.apply_order_snapshot(&snapshot).unwrap();
        let merged = till.order(&order).unwrap().unwrap();
        assert_eq!(merged.total, Aggregate::Confirmed(Money::from_major(40)));
    }

    #[test]
    fn reply_snapshot_never_confirms_a_total() {
        let applier = applier();
        let till = applier.till();
        let order = till.create_order(None).unwrap();
        till.add_item(&order, "turon", 1, Money::from_major(25)).unwrap();
        ack_head(&applier, Some("O-7"));

        let record = head(&applier);
        applier.till().outbox().mark_in_flight(record.id).unwrap();
        let lagging = OrderSnapshot {
            id: EntityId::canonical("O-7"),
            session_id: None,
            status: OrderStatus::Draft,
            total: Money::ZERO,
        };
        let reply = RemoteReply::new(ReplyStatus::Applied)
            .with_canonical_id(EntityId::canonical("I-7"))
            .with_order(lagging);
        applier.apply_reply(&record, &reply).unwrap();

        let merged = till.order(&order).unwrap().unwrap();
        assert_eq!(merged.total.value(), Money::from_major(25));
        assert!(merged.total.is_pending());
    }

    #[test]
    fn tab_closed_remotely_with_queued_work_is_evicted_once_drained() {
        let applier = applier();
        let till = applier.till();
        let tab = till.open_session(Some("T3".into())).unwrap();
        ack_head(&applier, Some("S-3"));
        let order = till.create_order(Some(&tab)).unwrap();

        let closed = SessionSnapshot {
            id: EntityId::canonical("S-3"),
            status: SessionStatus::Closed,
            subtotal: Money::ZERO,
            discount: Money::ZERO,
            tax: Money::ZERO,
            total: Money::ZERO,
        };
        assert!(applier.apply_session_snapshot(&closed).unwrap());
        assert_eq!(
            till.session(&tab).unwrap().unwrap().status,
            SessionStatus::Closed
        );
        assert_eq!(applier.tracked().unwrap(), (vec![], vec![]));

        let record = head(&applier);
        assert!(matches!(
            applier.prepare(&record).unwrap(),
            Prepared::Skip(_)
        ));
        // Still queued: nothing to evict yet.
        assert!(!till.evict_if_closed(&record.stream).unwrap());
        till.outbox().mark_skipped(record.id, "tab is closed").unwrap();

        assert!(till.evict_if_closed(&record.stream).unwrap());
        assert!(till.session(&tab).unwrap().is_none());
        assert!(till.ledger().is_evicted(&EntityId::canonical("S-3")));
        assert!(till.ledger().is_evicted(&tab));
        assert!(till.order(&order).unwrap().is_none());
    }

    #[test]
    fn handlers_may_call_intents_while_replies_are_applied() {
        let applier = applier();
        let till = Arc::clone(applier.till());
        let tab = till.open_session(Some("T8".into())).unwrap();

        let weak = Arc::downgrade(&till);
        let opened = Arc::new(parking_lot::Mutex::new(None));
        let slot = Arc::clone(&opened);
        let _subscription = till.bus().subscribe(move |event| {
            if event.kind != EntityKind::Session || !matches!(event.change, Change::Aliased { .. }) {
                return;
            }
            if let Some(till) = weak.upgrade() {
                *slot.lock() = Some(till.create_order(Some(&event.id)).unwrap());
            }
        });

        let applied = ack_head(&applier, Some("S-8"));
        assert_eq!(applied.resolved, Some(EntityId::canonical("S-8")));

        let order = opened.lock().clone().expect("handler ran");
        let order = till.order(&order).unwrap().unwrap();
        assert_eq!(order.session_id, Some(EntityId::canonical("S-8")));
        assert_eq!(till.orders_for_session(&tab).unwrap().len(), 1);
    }

    #[test]
    fn tracked_lists_only_canonical_entities() {
        let applier = applier();
        let till = applier.till();
        let tab = till.open_session(None).unwrap();
        till.create_order(None).unwrap();
        assert_eq!(applier.tracked().unwrap(), (vec![], vec![]));

        ack_head(&applier, Some("S-2"));
        let (sessions, orders) = applier.tracked().unwrap();
        assert_eq!(sessions, vec![EntityId::canonical("S-2")]);
        assert!(orders.is_empty());
        assert!(till.session(&tab).unwrap().is_some());
    }
}
