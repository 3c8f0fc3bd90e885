//! The terminal facade: UI intents and reads.

use crate::bus::{BroadcastBus, Origin, StoreEvent};
use crate::clock::now_millis;
use crate::config::StoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::eviction::EvictionLedger;
use crate::identity::IdentityResolver;
use crate::outbox::{ErrorSink, MutationOutbox};
use crate::stock::{StockReservations, UnlimitedStock};
use crate::store::{LocalStore, WriteBatch};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tillsync_protocol::{
    EntityId, EntityKind, EntityStream, LineItem, Money, Operation, Order, OrderStatus, Session,
    SessionStatus,
};
use tracing::debug;

/// Called after an intent enqueued a mutation on a stream.
pub type EnqueueListener = Arc<dyn Fn(&EntityStream) + Send + Sync>;

// Stream locks nobody holds are dropped once the map grows past this.
const STREAM_LOCK_SWEEP: usize = 256;

/// What a [`Till::housekeeping`] pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Housekeeping {
    /// Closed tabs evicted.
    pub sessions_evicted: usize,
    /// Alias records pruned.
    pub aliases_pruned: usize,
    /// Deny-list entries past their retention.
    pub deny_list_pruned: usize,
}

/// Point-of-sale replica for one terminal.
///
/// Every intent validates against the local replica, writes the entity
/// change and its outbox record in one batch, publishes on the bus and
/// returns. Nothing here waits on the network.
///
/// # Example
///
/// ```rust
/// use tillsync_core::Till;
/// use tillsync_protocol::Money;
///
/// let till = Till::open_in_memory().unwrap();
/// let tab = till.open_session(Some("T4".into())).unwrap();
/// let order = till.create_order(Some(&tab)).unwrap();
/// till.add_item(&order, "adobo", 1, Money::from_major(30)).unwrap();
/// till.add_item(&order, "sinigang", 1, Money::from_major(40)).unwrap();
///
/// let session = till.session(&tab).unwrap().unwrap();
/// assert_eq!(session.total.value(), Money::from_major(70));
/// ```
pub struct Till {
    config: StoreConfig,
    store: Arc<LocalStore>,
    bus: BroadcastBus,
    outbox: Arc<MutationOutbox>,
    identity: Arc<IdentityResolver>,
    ledger: Arc<EvictionLedger>,
    stock: Arc<dyn StockReservations>,
    streams: Mutex<HashMap<EntityStream, Arc<Mutex<()>>>>,
    // Serializes the duplicate-table check with tab creation.
    tabs: Mutex<()>,
    listener: RwLock<Option<EnqueueListener>>,
}

impl Till {
    /// Builds a till over an open store.
    pub fn new(store: Arc<LocalStore>) -> CoreResult<Self> {
        let bus = BroadcastBus::new();
        let outbox = Arc::new(MutationOutbox::open(Arc::clone(&store))?);
        let identity = Arc::new(IdentityResolver::new(Arc::clone(&store), bus.clone()));
        let ledger = Arc::new(EvictionLedger::new(
            Arc::clone(&store),
            Arc::clone(&identity),
            bus.clone(),
        ));
        Ok(Self {
            config: store.config().clone(),
            store,
            bus,
            outbox,
            identity,
            ledger,
            stock: Arc::new(UnlimitedStock),
            streams: Mutex::new(HashMap::new()),
            tabs: Mutex::new(()),
            listener: RwLock::new(None),
        })
    }

    /// Opens a store directory and builds a till over it.
    pub fn open(path: &Path, config: StoreConfig) -> CoreResult<Self> {
        Self::new(Arc::new(LocalStore::open(path, config)?))
    }

    /// Builds a till over a fresh in-memory store.
    pub fn open_in_memory() -> CoreResult<Self> {
        Self::new(Arc::new(LocalStore::open_in_memory()?))
    }

    /// Sets the stock collaborator.
    #[must_use]
    pub fn with_stock(mut self, stock: Arc<dyn StockReservations>) -> Self {
        self.stock = stock;
        self
    }

    /// Sets the sink for mutations the remote refuses.
    pub fn set_error_sink(&self, sink: Arc<dyn ErrorSink>) {
        self.outbox.set_error_sink(sink);
    }

    /// Sets the callback run after every enqueue.
    pub fn set_enqueue_listener(&self, listener: EnqueueListener) {
        *self.listener.write() = Some(listener);
    }

    /// Returns the store.
    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    /// Returns the bus.
    pub fn bus(&self) -> &BroadcastBus {
        &self.bus
    }

    /// Returns the outbox.
    pub fn outbox(&self) -> &Arc<MutationOutbox> {
        &self.outbox
    }

    /// Returns the identity resolver.
    pub fn identity(&self) -> &Arc<IdentityResolver> {
        &self.identity
    }

    /// Returns the eviction ledger.
    pub fn ledger(&self) -> &Arc<EvictionLedger> {
        &self.ledger
    }

    /// Returns the configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // ---------------------------------------------------------------------
    // Streams
    // ---------------------------------------------------------------------

    /// Returns the lock serializing writes to a stream.
    ///
    /// Anything that reads, merges and rewrites an entity of the stream
    /// holds it, intents and remote application alike.
    pub fn stream_lock(&self, stream: &EntityStream) -> Arc<Mutex<()>> {
        let mut streams = self.streams.lock();
        if streams.len() > STREAM_LOCK_SWEEP {
            streams.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        Arc::clone(streams.entry(stream.clone()).or_default())
    }

    /// Returns the delivery stream of a session.
    ///
    /// Streams are named after the id the tab was opened with, so they stay
    /// stable when that id is resolved.
    pub fn session_stream(&self, session_id: &EntityId) -> CoreResult<EntityStream> {
        let resolved = self.identity.resolve(session_id)?;
        let root = self.identity.origin_of(&resolved)?.unwrap_or(resolved);
        Ok(EntityStream::session(&root))
    }

    /// Returns the delivery stream of an order.
    pub fn order_stream(&self, order: &Order) -> CoreResult<EntityStream> {
        if let Some(session_id) = &order.session_id {
            return self.session_stream(session_id);
        }
        let root = self
            .identity
            .origin_of(&order.id)?
            .unwrap_or_else(|| order.id.clone());
        Ok(EntityStream::order(&root))
    }

    fn on_stream<T, F>(&self, stream: &EntityStream, intent: F) -> CoreResult<T>
    where
        F: FnOnce() -> CoreResult<(T, Vec<StoreEvent>)>,
    {
        let lock = self.stream_lock(stream);
        let (value, events) = {
            let _guard = lock.lock();
            intent()?
        };
        let enqueued = !events.is_empty();
        self.bus.publish_all(events);
        if enqueued {
            self.notify(stream);
        }
        Ok(value)
    }

    fn notify(&self, stream: &EntityStream) {
        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            listener(stream);
        }
    }

    // ---------------------------------------------------------------------
    // Loading
    // ---------------------------------------------------------------------

    fn check_live(&self, id: &EntityId) -> CoreResult<()> {
        if self.ledger.is_evicted(id) {
            debug!(%id, "dropping intent on evicted entity");
            return Err(CoreError::stale(id.as_str()));
        }
        Ok(())
    }

    fn load_session(&self, id: &EntityId) -> CoreResult<Session> {
        self.check_live(id)?;
        let resolved = self.identity.resolve(id)?;
        self.check_live(&resolved)?;
        self.store
            .get_record(resolved.as_str())?
            .ok_or_else(|| CoreError::not_found("session", id.as_str()))
    }

    fn load_order(&self, id: &EntityId) -> CoreResult<Order> {
        self.check_live(id)?;
        let resolved = self.identity.resolve(id)?;
        self.check_live(&resolved)?;
        self.store
            .get_record(resolved.as_str())?
            .ok_or_else(|| CoreError::not_found("order", id.as_str()))
    }

    fn load_item(&self, id: &EntityId) -> CoreResult<LineItem> {
        let resolved = self.identity.resolve(id)?;
        self.store
            .get_record(resolved.as_str())?
            .ok_or_else(|| CoreError::not_found("line_item", id.as_str()))
    }

    fn items_of(&self, order: &Order) -> CoreResult<Vec<LineItem>> {
        let mut items = Vec::with_capacity(order.item_ids.len());
        for id in &order.item_ids {
            if let Some(item) = self.store.get_record(id.as_str())? {
                items.push(item);
            }
        }
        Ok(items)
    }

    fn orders_of(&self, session: &Session) -> CoreResult<Vec<Order>> {
        let mut orders = Vec::with_capacity(session.order_ids.len());
        for id in &session.order_ids {
            if let Some(order) = self.store.get_record(id.as_str())? {
                orders.push(order);
            }
        }
        Ok(orders)
    }

    /// Recomputes `order` from its items, with `changed` standing in for
    /// the stored copy of the same line.
    fn recompute_order(&self, order: &mut Order, changed: Option<&LineItem>) -> CoreResult<()> {
        let mut items = self.items_of(order)?;
        if let Some(changed) = changed {
            match items.iter_mut().find(|i| i.id == changed.id) {
                Some(slot) => *slot = changed.clone(),
                None if order.item_ids.contains(&changed.id) => items.push(changed.clone()),
                None => {}
            }
        }
        order.recompute(&items);
        Ok(())
    }

    /// Loads the owning session of `order` and recomputes it with `order`
    /// standing in for the stored copy.
    fn recompute_parent(&self, order: &Order) -> CoreResult<Option<Session>> {
        let Some(session_id) = &order.session_id else {
            return Ok(None);
        };
        let mut session = self.load_session(session_id)?;
        let mut orders = self.orders_of(&session)?;
        match orders.iter_mut().find(|o| o.id == order.id) {
            Some(slot) => *slot = order.clone(),
            None => orders.push(order.clone()),
        }
        session.recompute(&orders);
        Ok(Some(session))
    }

    fn ensure_session_accepts(&self, order: &Order) -> CoreResult<()> {
        if let Some(session_id) = &order.session_id {
            let session = self.load_session(session_id)?;
            if !session.accepts_changes() {
                return Err(CoreError::invalid_operation(format!(
                    "session {} is {:?}",
                    session.id, session.status
                )));
            }
        }
        Ok(())
    }

    fn stage(
        &self,
        batch: &mut WriteBatch,
        stream: &EntityStream,
        operation: Operation,
        now: u64,
    ) -> CoreResult<()> {
        let record = self.outbox.stage(stream.clone(), operation, now);
        batch.put_record(&record)
    }

    // ---------------------------------------------------------------------
    // Intents
    // ---------------------------------------------------------------------

    /// Opens a tab.
    ///
    /// If the table already has an open or closing tab its id is returned
    /// instead, so a double tap cannot open two tabs for one table.
    pub fn open_session(&self, table: Option<String>) -> CoreResult<EntityId> {
        let _tabs = self.tabs.lock();
        if let Some(label) = &table {
            if let Some(existing) = self
                .open_sessions()?
                .into_iter()
                .find(|s| s.table.as_deref() == Some(label.as_str()))
            {
                debug!(table = %label, session = %existing.id, "table already has a tab");
                return Ok(existing.id);
            }
        }

        let id = EntityId::temporary();
        let stream = EntityStream::session(&id);
        self.on_stream(&stream, || {
            let now = now_millis();
            let session = Session::open(id.clone(), table.clone(), now);

            let mut batch = WriteBatch::new();
            batch.put_record(&session)?;
            self.stage(
                &mut batch,
                &stream,
                Operation::CreateSession {
                    session_id: id.clone(),
                    table: table.clone(),
                },
                now,
            )?;
            self.store.write_batch(batch)?;

            let events = vec![StoreEvent::upserted(
                EntityKind::Session,
                id.clone(),
                Origin::Local,
            )];
            Ok((id.clone(), events))
        })
    }

    /// Creates an order inside a tab, or standalone with `None`.
    pub fn create_order(&self, session_id: Option<&EntityId>) -> CoreResult<EntityId> {
        let order_id = EntityId::temporary();

        let Some(session_id) = session_id else {
            let stream = EntityStream::order(&order_id);
            return self.on_stream(&stream, || {
                let now = now_millis();
                let order = Order::new(order_id.clone(), None, now);
                let mut batch = WriteBatch::new();
                batch.put_record(&order)?;
                self.stage(
                    &mut batch,
                    &stream,
                    Operation::CreateOrder {
                        order_id: order_id.clone(),
                        session_id: None,
                    },
                    now,
                )?;
                self.store.write_batch(batch)?;
                let events = vec![StoreEvent::upserted(
                    EntityKind::Order,
                    order_id.clone(),
                    Origin::Local,
                )];
                Ok((order_id.clone(), events))
            });
        };

        self.check_live(session_id)?;
        let stream = self.session_stream(session_id)?;
        self.on_stream(&stream, || {
            let now = now_millis();
            let mut session = self.load_session(session_id)?;
            if !session.accepts_changes() {
                return Err(CoreError::invalid_operation(format!(
                    "session {} is {:?}",
                    session.id, session.status
                )));
            }

            let order = Order::new(order_id.clone(), Some(session.id.clone()), now);
            session.order_ids.push(order.id.clone());
            let orders = self.orders_of(&session)?;
            session.recompute(&orders);

            let mut batch = WriteBatch::new();
            batch.put_record(&order)?;
            batch.put_record(&session)?;
            self.stage(
                &mut batch,
                &stream,
                Operation::CreateOrder {
                    order_id: order_id.clone(),
                    session_id: Some(session.id.clone()),
                },
                now,
            )?;
            self.store.write_batch(batch)?;

            let events = vec![
                StoreEvent::upserted(EntityKind::Order, order_id.clone(), Origin::Local),
                StoreEvent::upserted(EntityKind::Session, session.id.clone(), Origin::Local),
            ];
            Ok((order_id.clone(), events))
        })
    }

    /// Adds a line to an order.
    ///
    /// # Errors
    ///
    /// - `InvalidOperation` for a zero quantity, a finished order, a closing
    ///   tab or a full order
    /// - `StockUnavailable` if the stock collaborator refuses
    pub fn add_item(
        &self,
        order_id: &EntityId,
        product_id: &str,
        quantity: u32,
        unit_price: Money,
    ) -> CoreResult<EntityId> {
        if quantity == 0 {
            return Err(CoreError::invalid_operation("quantity must be positive"));
        }
        let stream = self.order_stream(&self.load_order(order_id)?)?;

        self.on_stream(&stream, || {
            let now = now_millis();
            let mut order = self.load_order(order_id)?;
            if order.status.is_terminal() {
                return Err(CoreError::invalid_operation(format!(
                    "order {} is {:?}",
                    order.id, order.status
                )));
            }
            self.ensure_session_accepts(&order)?;
            if order.item_ids.len() >= self.config.max_items_per_order {
                return Err(CoreError::invalid_operation(format!(
                    "order {} already has {} items",
                    order.id,
                    order.item_ids.len()
                )));
            }

            let item = LineItem::new(
                EntityId::temporary(),
                order.id.clone(),
                product_id,
                quantity,
                unit_price,
            )
            .ok_or_else(|| CoreError::invalid_operation("line amount overflows"))?;

            order.item_ids.push(item.id.clone());
            self.recompute_order(&mut order, Some(&item))?;
            let session = self.recompute_parent(&order)?;

            let mut batch = WriteBatch::new();
            batch.put_record(&item)?;
            batch.put_record(&order)?;
            if let Some(session) = &session {
                batch.put_record(session)?;
            }
            self.stage(
                &mut batch,
                &stream,
                Operation::AddOrderItem {
                    order_id: order.id.clone(),
                    item_id: item.id.clone(),
                    product_id: product_id.to_string(),
                    quantity,
                    unit_price,
                },
                now,
            )?;

            self.stock.reserve(product_id, quantity)?;
            if let Err(err) = self.store.write_batch(batch) {
                self.stock.release(product_id, quantity);
                return Err(err);
            }

            let mut events = vec![
                StoreEvent::upserted(EntityKind::LineItem, item.id.clone(), Origin::Local),
                StoreEvent::upserted(EntityKind::Order, order.id.clone(), Origin::Local),
            ];
            if let Some(session) = session {
                events.push(StoreEvent::upserted(
                    EntityKind::Session,
                    session.id,
                    Origin::Local,
                ));
            }
            Ok((item.id, events))
        })
    }

    /// Changes a line's quantity; zero removes the line.
    pub fn update_item_quantity(&self, item_id: &EntityId, new_quantity: u32) -> CoreResult<()> {
        let item = self.load_item(item_id)?;
        let stream = self.order_stream(&self.load_order(&item.order_id)?)?;

        self.on_stream(&stream, || {
            let now = now_millis();
            let item = self.load_item(item_id)?;
            let mut order = self.load_order(&item.order_id)?;
            if order.status.is_terminal() {
                return Err(CoreError::invalid_operation(format!(
                    "order {} is {:?}",
                    order.id, order.status
                )));
            }
            self.ensure_session_accepts(&order)?;
            if new_quantity == item.quantity {
                return Ok(((), Vec::new()));
            }

            let mut batch = WriteBatch::new();
            let mut events = Vec::new();
            if new_quantity == 0 {
                order.item_ids.retain(|id| id != &item.id);
                self.recompute_order(&mut order, None)?;
                batch.delete_record::<LineItem>(item.id.as_str());
                events.push(StoreEvent::removed(
                    EntityKind::LineItem,
                    item.id.clone(),
                    Origin::Local,
                ));
            } else {
                let changed = item
                    .with_quantity(new_quantity)
                    .ok_or_else(|| CoreError::invalid_operation("line amount overflows"))?;
                self.recompute_order(&mut order, Some(&changed))?;
                batch.put_record(&changed)?;
                events.push(StoreEvent::upserted(
                    EntityKind::LineItem,
                    item.id.clone(),
                    Origin::Local,
                ));
            }
            let session = self.recompute_parent(&order)?;

            batch.put_record(&order)?;
            if let Some(session) = &session {
                batch.put_record(session)?;
            }
            self.stage(
                &mut batch,
                &stream,
                Operation::ModifyOrderItem {
                    order_id: order.id.clone(),
                    item_id: item.id.clone(),
                    new_quantity,
                },
                now,
            )?;

            if new_quantity > item.quantity {
                self.stock
                    .reserve(&item.product_id, new_quantity - item.quantity)?;
                if let Err(err) = self.store.write_batch(batch) {
                    self.stock
                        .release(&item.product_id, new_quantity - item.quantity);
                    return Err(err);
                }
            } else {
                self.store.write_batch(batch)?;
                self.stock
                    .release(&item.product_id, item.quantity - new_quantity);
            }

            events.push(StoreEvent::upserted(
                EntityKind::Order,
                order.id.clone(),
                Origin::Local,
            ));
            if let Some(session) = session {
                events.push(StoreEvent::upserted(
                    EntityKind::Session,
                    session.id,
                    Origin::Local,
                ));
            }
            Ok(((), events))
        })
    }

    /// Removes a line.
    pub fn remove_item(&self, item_id: &EntityId) -> CoreResult<()> {
        self.update_item_quantity(item_id, 0)
    }

    /// Sends a draft order for preparation. Confirming twice is a no-op.
    pub fn confirm_order(&self, order_id: &EntityId) -> CoreResult<()> {
        let stream = self.order_stream(&self.load_order(order_id)?)?;
        self.on_stream(&stream, || {
            let now = now_millis();
            let mut order = self.load_order(order_id)?;
            match order.status {
                OrderStatus::Draft => {}
                OrderStatus::Confirmed => return Ok(((), Vec::new())),
                status => {
                    return Err(CoreError::invalid_operation(format!(
                        "order {} is {status:?}",
                        order.id
                    )))
                }
            }
            self.ensure_session_accepts(&order)?;

            order.status = OrderStatus::Confirmed;
            order.sequence += 1;

            let mut batch = WriteBatch::new();
            batch.put_record(&order)?;
            self.stage(
                &mut batch,
                &stream,
                Operation::ConfirmOrder {
                    order_id: order.id.clone(),
                },
                now,
            )?;
            self.store.write_batch(batch)?;

            let events = vec![StoreEvent::upserted(
                EntityKind::Order,
                order.id,
                Origin::Local,
            )];
            Ok(((), events))
        })
    }

    /// Voids an order; it stops counting toward the tab total and its stock
    /// is released. Voiding twice is a no-op.
    pub fn void_order(&self, order_id: &EntityId) -> CoreResult<()> {
        let stream = self.order_stream(&self.load_order(order_id)?)?;
        self.on_stream(&stream, || {
            let now = now_millis();
            let mut order = self.load_order(order_id)?;
            match order.status {
                OrderStatus::Draft | OrderStatus::Confirmed => {}
                OrderStatus::Voided => return Ok(((), Vec::new())),
                OrderStatus::Completed => {
                    return Err(CoreError::invalid_operation(format!(
                        "order {} is completed",
                        order.id
                    )))
                }
            }
            self.ensure_session_accepts(&order)?;

            order.status = OrderStatus::Voided;
            order.sequence += 1;
            let session = self.recompute_parent(&order)?;
            let items = self.items_of(&order)?;

            let mut batch = WriteBatch::new();
            batch.put_record(&order)?;
            if let Some(session) = &session {
                batch.put_record(session)?;
            }
            self.stage(
                &mut batch,
                &stream,
                Operation::VoidOrder {
                    order_id: order.id.clone(),
                },
                now,
            )?;
            self.store.write_batch(batch)?;
            for item in &items {
                self.stock.release(&item.product_id, item.quantity);
            }

            let mut events = vec![StoreEvent::upserted(
                EntityKind::Order,
                order.id,
                Origin::Local,
            )];
            if let Some(session) = session {
                events.push(StoreEvent::upserted(
                    EntityKind::Session,
                    session.id,
                    Origin::Local,
                ));
            }
            Ok(((), events))
        })
    }

    /// Requests closing a tab. Closing twice is a no-op.
    pub fn close_session(&self, session_id: &EntityId) -> CoreResult<()> {
        self.check_live(session_id)?;
        let stream = self.session_stream(session_id)?;
        self.on_stream(&stream, || {
            let now = now_millis();
            let mut session = self.load_session(session_id)?;
            if session.status != SessionStatus::Open {
                return Ok(((), Vec::new()));
            }

            session.status = SessionStatus::Closing;
            session.sequence += 1;

            let mut batch = WriteBatch::new();
            batch.put_record(&session)?;
            self.stage(
                &mut batch,
                &stream,
                Operation::CloseSession {
                    session_id: session.id.clone(),
                },
                now,
            )?;
            self.store.write_batch(batch)?;

            let events = vec![StoreEvent::upserted(
                EntityKind::Session,
                session.id,
                Origin::Local,
            )];
            Ok(((), events))
        })
    }

    /// Drops the temporary copy of a resolved entity once the UI navigated
    /// away from it.
    pub fn evict_temporary(&self, temporary: &EntityId) -> CoreResult<bool> {
        self.identity.evict_temporary(temporary)
    }

    /// Evicts the tab rooting `stream` if the remote closed it and nothing
    /// is left to send on the stream. Returns true if it was evicted.
    pub fn evict_if_closed(&self, stream: &EntityStream) -> CoreResult<bool> {
        let Some((EntityKind::Session, root)) = stream.root() else {
            return Ok(false);
        };
        let lock = self.stream_lock(stream);
        let report = {
            let _guard = lock.lock();
            let Some(session) = self.session(&root)? else {
                return Ok(false);
            };
            if session.status != SessionStatus::Closed || self.outbox.has_outstanding(stream)? {
                return Ok(false);
            }
            self.ledger.remove_session(&session.id, now_millis())?
        };
        self.bus.publish_all(report.events());
        Ok(!report.is_empty())
    }

    /// Evicts drained closed tabs, then prunes aliases and deny-list
    /// entries that are no longer needed.
    pub fn housekeeping(&self) -> CoreResult<Housekeeping> {
        let mut report = Housekeeping::default();
        for session in self
            .store
            .query_records(|s: &Session| s.alias.is_none() && s.status == SessionStatus::Closed)?
        {
            if self.evict_if_closed(&self.session_stream(&session.id)?)? {
                report.sessions_evicted += 1;
            }
        }
        report.aliases_pruned = self.identity.prune(&self.outbox)?;
        report.deny_list_pruned = self
            .ledger
            .prune(now_millis(), self.config.evicted_retention)?;
        Ok(report)
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    /// Reads a tab by temporary or canonical id. Evicted tabs read as `None`.
    pub fn session(&self, id: &EntityId) -> CoreResult<Option<Session>> {
        if self.ledger.is_evicted(id) {
            return Ok(None);
        }
        let resolved = self.identity.resolve(id)?;
        self.store.get_record(resolved.as_str())
    }

    /// Reads an order by temporary or canonical id.
    pub fn order(&self, id: &EntityId) -> CoreResult<Option<Order>> {
        if self.ledger.is_evicted(id) {
            return Ok(None);
        }
        let resolved = self.identity.resolve(id)?;
        self.store.get_record(resolved.as_str())
    }

    /// Reads a line by temporary or canonical id.
    pub fn line_item(&self, id: &EntityId) -> CoreResult<Option<LineItem>> {
        let resolved = self.identity.resolve(id)?;
        self.store.get_record(resolved.as_str())
    }

    /// Returns an order's lines in the order they were added.
    pub fn line_items(&self, order_id: &EntityId) -> CoreResult<Vec<LineItem>> {
        match self.order(order_id)? {
            Some(order) => self.items_of(&order),
            None => Ok(Vec::new()),
        }
    }

    /// Returns a tab's orders in creation order.
    pub fn orders_for_session(&self, session_id: &EntityId) -> CoreResult<Vec<Order>> {
        match self.session(session_id)? {
            Some(session) => self.orders_of(&session),
            None => Ok(Vec::new()),
        }
    }

    /// Returns tabs that are not closed, oldest first.
    ///
    /// Temporary copies of resolved tabs are skipped.
    pub fn open_sessions(&self) -> CoreResult<Vec<Session>> {
        let mut sessions = self.store.query_records(|s: &Session| {
            s.alias.is_none() && s.status != SessionStatus::Closed
        })?;
        sessions.sort_by_key(|s| s.opened_at);
        Ok(sessions)
    }

    /// Returns standalone orders that are not finished, oldest first.
    pub fn active_standalone_orders(&self) -> CoreResult<Vec<Order>> {
        let mut orders = self.store.query_records(|o: &Order| {
            o.alias.is_none() && o.session_id.is_none() && !o.status.is_terminal()
        })?;
        orders.sort_by_key(|o| o.created_at);
        Ok(orders)
    }

    /// Returns the number of mutations awaiting the remote.
    pub fn pending_mutations(&self) -> usize {
        self.outbox.pending_count()
    }
}

impl std::fmt::Debug for Till {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Till")
            .field("store", &self.store)
            .field("outbox", &self.outbox)
            .finish_non_exhaustive()
    }
}
