//! Temporary to canonical id resolution.
//!
//! Entities created offline carry a client-minted temporary id. When the
//! remote acknowledges the creation it returns a canonical id, and the
//! resolver links the two:
//!
//! - the record is written under the canonical id, confirmed
//! - the temporary record gets a forward `alias` and stays readable
//! - an [`AliasRecord`] maps temporary to canonical
//! - child references are re-pointed at the canonical id
//!
//! All four happen in one store batch. Reading either id afterwards yields
//! the same logical entity.

use crate::bus::{BroadcastBus, Origin, StoreEvent};
use crate::error::{CoreError, CoreResult};
use crate::log::RecordKind;
use crate::outbox::MutationOutbox;
use crate::record::Record;
use crate::store::{LocalStore, WriteBatch};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tillsync_protocol::{EntityId, EntityKind, EntityStream, LineItem, Order, Session};
use tracing::{debug, info, warn};

// Aliases never chain in practice; the bound guards against a corrupt loop.
const MAX_ALIAS_HOPS: usize = 4;

/// Link from a temporary id to its canonical id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasRecord {
    /// Client-minted id.
    pub temporary: EntityId,
    /// Remote-assigned id.
    pub canonical: EntityId,
    /// Entity kind.
    pub kind: EntityKind,
    /// Unix milliseconds when the link was recorded.
    pub created_at: u64,
}

impl Record for AliasRecord {
    const KIND: RecordKind = RecordKind::Alias;

    fn key(&self) -> String {
        self.temporary.to_string()
    }
}

/// Maps a stored entity kind to its record kind.
pub(crate) fn record_kind(kind: EntityKind) -> RecordKind {
    match kind {
        EntityKind::Session => RecordKind::Session,
        EntityKind::Order => RecordKind::Order,
        EntityKind::LineItem => RecordKind::LineItem,
    }
}

fn replace_id(ids: &mut [EntityId], from: &EntityId, to: &EntityId) -> bool {
    let mut changed = false;
    for id in ids.iter_mut().filter(|id| *id == from) {
        *id = to.clone();
        changed = true;
    }
    changed
}

/// Resolves and links temporary ids.
#[derive(Debug)]
pub struct IdentityResolver {
    store: Arc<LocalStore>,
    bus: BroadcastBus,
}

impl IdentityResolver {
    /// Creates a resolver over a store.
    pub fn new(store: Arc<LocalStore>, bus: BroadcastBus) -> Self {
        Self { store, bus }
    }

    /// Returns the alias record for a temporary id.
    pub fn alias_of(&self, temporary: &EntityId) -> CoreResult<Option<AliasRecord>> {
        self.store.get_record(temporary.as_str())
    }

    /// Follows aliases to the id the entity is currently stored under.
    pub fn resolve(&self, id: &EntityId) -> CoreResult<EntityId> {
        let mut current = id.clone();
        for _ in 0..MAX_ALIAS_HOPS {
            match self.alias_of(&current)? {
                Some(alias) => current = alias.canonical,
                None => break,
            }
        }
        Ok(current)
    }

    /// Returns the temporary id a canonical id was created under, if any.
    pub fn origin_of(&self, canonical: &EntityId) -> CoreResult<Option<EntityId>> {
        Ok(self
            .store
            .query_records(|a: &AliasRecord| &a.canonical == canonical)?
            .into_iter()
            .next()
            .map(|a| a.temporary))
    }

    /// Returns every id the entity is known by: itself and its temporary
    /// origin.
    pub fn known_ids(&self, id: &EntityId) -> CoreResult<Vec<EntityId>> {
        let canonical = self.resolve(id)?;
        let mut ids = vec![canonical.clone()];
        if let Some(origin) = self.origin_of(&canonical)? {
            ids.push(origin);
        }
        Ok(ids)
    }

    /// Returns every alias record.
    pub fn aliases(&self) -> CoreResult<Vec<AliasRecord>> {
        self.store.records()
    }

    /// Links `temporary` to the `canonical` id the remote assigned.
    ///
    /// Returns false if the link already existed.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if `temporary` is already linked to a
    /// different canonical id.
    pub fn resolve_creation(
        &self,
        kind: EntityKind,
        temporary: &EntityId,
        canonical: &EntityId,
        now: u64,
    ) -> CoreResult<bool> {
        let events = self.link_creation(kind, temporary, canonical, now)?;
        let linked = !events.is_empty();
        self.bus.publish_all(events);
        Ok(linked)
    }

    /// Writes the link like [`resolve_creation`](Self::resolve_creation)
    /// and returns the events instead of publishing them, for callers that
    /// hold a stream lock.
    pub fn link_creation(
        &self,
        kind: EntityKind,
        temporary: &EntityId,
        canonical: &EntityId,
        now: u64,
    ) -> CoreResult<Vec<StoreEvent>> {
        if temporary == canonical {
            return Ok(Vec::new());
        }
        if let Some(existing) = self.alias_of(temporary)? {
            if &existing.canonical == canonical {
                return Ok(Vec::new());
            }
            warn!(%temporary, %canonical, existing = %existing.canonical, "conflicting canonical id");
            return Err(CoreError::invalid_operation(format!(
                "{temporary} is already linked to {}",
                existing.canonical
            )));
        }

        let mut batch = WriteBatch::new();
        match kind {
            EntityKind::Session => self.stage_session(&mut batch, temporary, canonical)?,
            EntityKind::Order => self.stage_order(&mut batch, temporary, canonical)?,
            EntityKind::LineItem => self.stage_line_item(&mut batch, temporary, canonical)?,
        }
        batch.put_record(&AliasRecord {
            temporary: temporary.clone(),
            canonical: canonical.clone(),
            kind,
            created_at: now,
        })?;
        self.store.write_batch(batch)?;

        info!(kind = kind.as_str(), %temporary, %canonical, "resolved temporary id");
        Ok(vec![
            StoreEvent::aliased(kind, temporary.clone(), canonical.clone()),
            StoreEvent::upserted(kind, canonical.clone(), Origin::Remote),
        ])
    }

    fn stage_session(
        &self,
        batch: &mut WriteBatch,
        temporary: &EntityId,
        canonical: &EntityId,
    ) -> CoreResult<()> {
        let Some(mut session) = self.store.get_record::<Session>(temporary.as_str())? else {
            return Ok(());
        };
        let mut confirmed = session.clone();
        confirmed.id = canonical.clone();
        confirmed.alias = None;
        confirmed.pending_remote = false;
        batch.put_record(&confirmed)?;

        session.alias = Some(canonical.clone());
        session.pending_remote = false;
        batch.put_record(&session)?;

        for mut order in self
            .store
            .query_records(|o: &Order| o.session_id.as_ref() == Some(temporary))?
        {
            order.session_id = Some(canonical.clone());
            batch.put_record(&order)?;
        }
        Ok(())
    }

    fn stage_order(
        &self,
        batch: &mut WriteBatch,
        temporary: &EntityId,
        canonical: &EntityId,
    ) -> CoreResult<()> {
        let Some(mut order) = self.store.get_record::<Order>(temporary.as_str())? else {
            return Ok(());
        };
        let mut confirmed = order.clone();
        confirmed.id = canonical.clone();
        confirmed.alias = None;
        confirmed.pending_remote = false;
        batch.put_record(&confirmed)?;

        order.alias = Some(canonical.clone());
        order.pending_remote = false;
        batch.put_record(&order)?;

        for mut item in self
            .store
            .query_records(|i: &LineItem| &i.order_id == temporary)?
        {
            item.order_id = canonical.clone();
            batch.put_record(&item)?;
        }

        if let Some(session_id) = &confirmed.session_id {
            let session_id = self.resolve(session_id)?;
            if let Some(mut session) = self.store.get_record::<Session>(session_id.as_str())? {
                if replace_id(&mut session.order_ids, temporary, canonical) {
                    batch.put_record(&session)?;
                }
            }
        }
        Ok(())
    }

    fn stage_line_item(
        &self,
        batch: &mut WriteBatch,
        temporary: &EntityId,
        canonical: &EntityId,
    ) -> CoreResult<()> {
        let Some(mut item) = self.store.get_record::<LineItem>(temporary.as_str())? else {
            return Ok(());
        };
        let mut confirmed = item.clone();
        confirmed.id = canonical.clone();
        confirmed.alias = None;
        confirmed.pending_remote = false;
        batch.put_record(&confirmed)?;

        item.alias = Some(canonical.clone());
        item.pending_remote = false;
        batch.put_record(&item)?;

        let order_id = self.resolve(&confirmed.order_id)?;
        if let Some(mut order) = self.store.get_record::<Order>(order_id.as_str())? {
            if replace_id(&mut order.item_ids, temporary, canonical) {
                batch.put_record(&order)?;
            }
        }
        Ok(())
    }

    /// Drops the temporary copy of a resolved entity.
    ///
    /// Unresolved temporary records are the only copy and are never
    /// evicted. The alias record stays until [`prune`](Self::prune) finds
    /// nothing queued that still names the temporary id.
    pub fn evict_temporary(&self, temporary: &EntityId) -> CoreResult<bool> {
        let Some(alias) = self.alias_of(temporary)? else {
            return Ok(false);
        };
        if !self
            .store
            .delete(record_kind(alias.kind), temporary.as_str())?
        {
            return Ok(false);
        }
        debug!(%temporary, canonical = %alias.canonical, "evicted temporary record");
        self.bus.publish(StoreEvent::removed(
            alias.kind,
            temporary.clone(),
            Origin::Local,
        ));
        Ok(true)
    }

    /// Removes alias records no longer needed to translate queued work.
    ///
    /// An alias is kept while its temporary record is still readable, while
    /// any queued mutation names the temporary id, and while the stream
    /// rooted at it has queued work.
    pub fn prune(&self, outbox: &MutationOutbox) -> CoreResult<usize> {
        let mut batch = WriteBatch::new();
        for alias in self.aliases()? {
            let temporary = &alias.temporary;
            if self
                .store
                .contains(record_kind(alias.kind), temporary.as_str())
            {
                continue;
            }
            if outbox.outstanding_for(temporary)?
                || outbox.has_outstanding(&EntityStream::session(temporary))?
                || outbox.has_outstanding(&EntityStream::order(temporary))?
            {
                continue;
            }
            batch.delete_record::<AliasRecord>(alias.key());
        }
        let pruned = batch.len();
        self.store.write_batch(batch)?;
        if pruned > 0 {
            debug!(pruned, "pruned alias records");
        }
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tillsync_protocol::{Money, Operation};

    fn setup() -> (Arc<LocalStore>, IdentityResolver) {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let resolver = IdentityResolver::new(Arc::clone(&store), BroadcastBus::new());
        (store, resolver)
    }

    #[test]
    fn session_resolution_links_and_repoints() {
        let (store, resolver) = setup();
        let tmp = EntityId::temporary();
        let mut session = Session::open(tmp.clone(), Some("T2".into()), 0);
        let order = Order::new(EntityId::canonical("O-1"), Some(tmp.clone()), 0);
        session.order_ids.push(order.id.clone());
        store.put_record(&session).unwrap();
        store.put_record(&order).unwrap();

        let canonical = EntityId::canonical("S-1");
        assert!(resolver
            .resolve_creation(EntityKind::Session, &tmp, &canonical, 10)
            .unwrap());

        assert_eq!(resolver.resolve(&tmp).unwrap(), canonical);
        let confirmed: Session = store.get_record("S-1").unwrap().unwrap();
        assert!(!confirmed.pending_remote);
        assert_eq!(confirmed.alias, None);
        let old: Session = store.get_record(tmp.as_str()).unwrap().unwrap();
        assert_eq!(old.alias, Some(canonical.clone()));
        let order: Order = store.get_record("O-1").unwrap().unwrap();
        assert_eq!(order.session_id, Some(canonical.clone()));
        assert_eq!(resolver.origin_of(&canonical).unwrap(), Some(tmp));
    }

    #[test]
    fn repeated_resolution_is_a_noop() {
        let (store, resolver) = setup();
        let tmp = EntityId::temporary();
        store
            .put_record(&Order::new(tmp.clone(), None, 0))
            .unwrap();
        let canonical = EntityId::canonical("O-7");

        assert!(resolver
            .resolve_creation(EntityKind::Order, &tmp, &canonical, 0)
            .unwrap());
        assert!(!resolver
            .resolve_creation(EntityKind::Order, &tmp, &canonical, 0)
            .unwrap());
        assert!(resolver
            .resolve_creation(EntityKind::Order, &tmp, &EntityId::canonical("O-8"), 0)
            .is_err());
    }

    #[test]
    fn item_resolution_updates_parent_order() {
        let (store, resolver) = setup();
        let mut order = Order::new(EntityId::canonical("O-1"), None, 0);
        let item = LineItem::new(
            EntityId::temporary(),
            order.id.clone(),
            "coffee",
            1,
            Money::from_major(30),
        )
        .unwrap();
        order.item_ids.push(item.id.clone());
        store.put_record(&order).unwrap();
        store.put_record(&item).unwrap();

        resolver
            .resolve_creation(EntityKind::LineItem, &item.id, &EntityId::canonical("I-1"), 0)
            .unwrap();

        let order: Order = store.get_record("O-1").unwrap().unwrap();
        assert_eq!(order.item_ids, vec![EntityId::canonical("I-1")]);
    }

    #[test]
    fn alias_outlives_eviction_while_mutations_name_it() {
        let (store, resolver) = setup();
        let outbox = MutationOutbox::open(Arc::clone(&store)).unwrap();
        let tmp = EntityId::temporary();
        store.put_record(&Order::new(tmp.clone(), None, 0)).unwrap();
        resolver
            .resolve_creation(EntityKind::Order, &tmp, &EntityId::canonical("O-3"), 0)
            .unwrap();
        let queued = outbox
            .enqueue(
                EntityStream::order(&tmp),
                Operation::ConfirmOrder {
                    order_id: tmp.clone(),
                },
                0,
            )
            .unwrap();

        assert!(!resolver.evict_temporary(&EntityId::temporary()).unwrap());
        assert!(resolver.evict_temporary(&tmp).unwrap());
        assert!(store.get_record::<Order>(tmp.as_str()).unwrap().is_none());

        assert_eq!(resolver.prune(&outbox).unwrap(), 0);
        assert_eq!(resolver.resolve(&tmp).unwrap(), EntityId::canonical("O-3"));

        outbox.mark_acked(queued).unwrap();
        assert_eq!(resolver.prune(&outbox).unwrap(), 1);
        assert_eq!(resolver.resolve(&tmp).unwrap(), tmp);
    }
}
