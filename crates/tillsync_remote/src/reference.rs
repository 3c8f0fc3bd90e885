//! The in-memory reference remote.

use crate::config::RemoteConfig;
use crate::state::{RemoteItem, RemoteOrder, RemoteSession, RemoteState};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tillsync_protocol::{
    EntityId, Money, OrderSnapshot, OrderStatus, RemoteApi, RemoteError, RemoteReply,
    RemoteResult, ReplyStatus, SessionSnapshot, SessionStatus,
};
use tracing::debug;

/// An injected failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Fail the call before it has any effect.
    Fail(RemoteError),
    /// Apply the call, then lose the reply with a network error.
    LoseReply,
}

/// Call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteCounters {
    /// Every call received, including failed ones.
    pub calls: u64,
    /// Calls that changed state.
    pub applied: u64,
    /// Calls answered "already applied".
    pub duplicates: u64,
    /// Calls refused.
    pub rejected: u64,
    /// Snapshot reads.
    pub fetches: u64,
}

/// Authoritative remote kept in memory.
///
/// Every mutating call is idempotent twice over: a repeated idempotency key
/// replays the original outcome, and a creation repeated with the same
/// client reference returns the entity created the first time. Both are
/// answered with [`ReplyStatus::AlreadyApplied`].
///
/// # Example
///
/// ```rust
/// use tillsync_protocol::{EntityId, RemoteApi, ReplyStatus};
/// use tillsync_remote::ReferenceRemote;
///
/// # tokio_test_block(async {
/// let remote = ReferenceRemote::new();
/// let tab = EntityId::temporary();
/// let first = remote.create_session("k1", &tab, Some("T1")).await.unwrap();
/// let again = remote.create_session("k2", &tab, Some("T1")).await.unwrap();
/// assert_eq!(first.canonical_id, again.canonical_id);
/// assert_eq!(again.status, ReplyStatus::AlreadyApplied);
/// # });
/// # fn tokio_test_block(f: impl std::future::Future<Output = ()>) {
/// #     tokio::runtime::Runtime::new().unwrap().block_on(f)
/// # }
/// ```
#[derive(Debug, Default)]
pub struct ReferenceRemote {
    config: RemoteConfig,
    state: Mutex<RemoteState>,
    replies: Mutex<HashMap<String, RemoteReply>>,
    faults: Mutex<VecDeque<Fault>>,
    offline: AtomicBool,
    calls: AtomicU64,
    applied: AtomicU64,
    duplicates: AtomicU64,
    rejected: AtomicU64,
    fetches: AtomicU64,
}

impl ReferenceRemote {
    /// Creates a remote with immediate totals.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a remote with a configuration.
    pub fn with_config(config: RemoteConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Queues a fault for the next call.
    pub fn inject(&self, fault: Fault) {
        self.faults.lock().push_back(fault);
    }

    /// Queues `count` copies of a fault.
    pub fn inject_n(&self, count: usize, fault: Fault) {
        let mut faults = self.faults.lock();
        for _ in 0..count {
            faults.push_back(fault.clone());
        }
    }

    /// While offline every call fails with a network error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Runs the total recalculation that lagging mode defers.
    pub fn recalculate(&self) {
        self.state.lock().recalculate_all(self.config.tax_basis_points);
    }

    /// Returns the call counters.
    pub fn counters(&self) -> RemoteCounters {
        RemoteCounters {
            calls: self.calls.load(Ordering::SeqCst),
            applied: self.applied.load(Ordering::SeqCst),
            duplicates: self.duplicates.load(Ordering::SeqCst),
            rejected: self.rejected.load(Ordering::SeqCst),
            fetches: self.fetches.load(Ordering::SeqCst),
        }
    }

    /// Returns the number of tabs ever created.
    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Returns the number of live lines on an order.
    pub fn item_count(&self, order_id: &EntityId) -> usize {
        self.state
            .lock()
            .orders
            .get(order_id)
            .map_or(0, |order| order.item_ids.len())
    }

    /// Reads a tab without counting a call.
    pub fn peek_session(&self, id: &EntityId) -> Option<SessionSnapshot> {
        self.state.lock().session_snapshot(id)
    }

    /// Reads an order without counting a call.
    pub fn peek_order(&self, id: &EntityId) -> Option<OrderSnapshot> {
        self.state.lock().order_snapshot(id)
    }

    async fn enter(&self) -> RemoteResult<Option<Fault>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.config.latency.is_zero() {
            tokio::time::sleep(self.config.latency).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Network("remote unreachable".to_string()));
        }
        match self.faults.lock().pop_front() {
            Some(Fault::Fail(err)) => Err(err),
            other => Ok(other),
        }
    }

    /// Runs a mutating call with idempotency, fault and counter handling.
    async fn mutate<F>(&self, key: &str, apply: F) -> RemoteResult<RemoteReply>
    where
        F: FnOnce(&mut RemoteState) -> RemoteResult<RemoteReply>,
    {
        let fault = self.enter().await?;

        let replayed = self.replies.lock().get(key).cloned();
        let reply = match replayed {
            Some(previous) => {
                debug!(key, "replaying idempotent reply");
                self.duplicates.fetch_add(1, Ordering::SeqCst);
                Ok(self.refresh(RemoteReply {
                    status: ReplyStatus::AlreadyApplied,
                    ..previous
                }))
            }
            None => {
                let outcome = {
                    let mut state = self.state.lock();
                    apply(&mut state)
                };
                match outcome {
                    Ok(reply) => {
                        let counter = match reply.status {
                            ReplyStatus::Applied => &self.applied,
                            ReplyStatus::AlreadyApplied => &self.duplicates,
                        };
                        counter.fetch_add(1, Ordering::SeqCst);
                        self.replies.lock().insert(key.to_string(), reply.clone());
                        Ok(self.refresh(reply))
                    }
                    Err(err) => {
                        self.rejected.fetch_add(1, Ordering::SeqCst);
                        Err(err)
                    }
                }
            }
        };

        match fault {
            Some(Fault::LoseReply) if reply.is_ok() => {
                Err(RemoteError::Network("connection reset".to_string()))
            }
            _ => reply,
        }
    }

    fn refresh(&self, mut reply: RemoteReply) -> RemoteReply {
        let state = self.state.lock();
        if let Some(session) = &reply.session {
            reply.session = state.session_snapshot(&session.id);
        }
        if let Some(order) = &reply.order {
            reply.order = state.order_snapshot(&order.id);
        }
        reply
    }

    fn after_write(&self, state: &mut RemoteState, order: Option<&EntityId>, session: Option<&EntityId>) {
        if self.config.lagging_totals {
            return;
        }
        let tax = self.config.tax_basis_points;
        if let Some(order) = order {
            state.recalculate_order(order, tax);
        }
        if let Some(session) = session {
            state.recalculate_session(session, tax);
        }
    }

    fn reply_for(state: &RemoteState, status: ReplyStatus, order: Option<&EntityId>, session: Option<&EntityId>) -> RemoteReply {
        let mut reply = RemoteReply::new(status);
        if let Some(snapshot) = session.and_then(|id| state.session_snapshot(id)) {
            reply = reply.with_session(snapshot);
        }
        if let Some(snapshot) = order.and_then(|id| state.order_snapshot(id)) {
            reply = reply.with_order(snapshot);
        }
        reply
    }
}

#[async_trait]
impl RemoteApi for ReferenceRemote {
    async fn create_session(
        &self,
        key: &str,
        client_ref: &EntityId,
        table: Option<&str>,
    ) -> RemoteResult<RemoteReply> {
        self.mutate(key, |state| {
            if let Some(existing) = state.client_refs.get(client_ref).cloned() {
                return Ok(Self::reply_for(state, ReplyStatus::AlreadyApplied, None, Some(&existing))
                    .with_canonical_id(existing));
            }
            let open_for_table = table.and_then(|label| {
                state
                    .sessions
                    .values()
                    .find(|s| s.status == SessionStatus::Open && s.table.as_deref() == Some(label))
                    .map(|s| s.id.clone())
            });
            if let Some(existing) = open_for_table {
                state.client_refs.insert(client_ref.clone(), existing.clone());
                return Ok(Self::reply_for(state, ReplyStatus::AlreadyApplied, None, Some(&existing))
                    .with_canonical_id(existing));
            }

            let id = state.mint("S");
            state.sessions.insert(
                id.clone(),
                RemoteSession {
                    id: id.clone(),
                    table: table.map(str::to_string),
                    status: SessionStatus::Open,
                    order_ids: Vec::new(),
                    subtotal: Money::ZERO,
                    tax: Money::ZERO,
                    total: Money::ZERO,
                },
            );
            state.client_refs.insert(client_ref.clone(), id.clone());
            Ok(Self::reply_for(state, ReplyStatus::Applied, None, Some(&id)).with_canonical_id(id))
        })
        .await
    }

    async fn close_session(&self, key: &str, session_id: &EntityId) -> RemoteResult<RemoteReply> {
        self.mutate(key, |state| {
            let session = state
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| RemoteError::rejected(format!("unknown session {session_id}")))?;
            let status = if session.status == SessionStatus::Closed {
                ReplyStatus::AlreadyApplied
            } else {
                session.status = SessionStatus::Closed;
                ReplyStatus::Applied
            };
            Ok(Self::reply_for(state, status, None, Some(session_id)))
        })
        .await
    }

    async fn create_order(
        &self,
        key: &str,
        client_ref: &EntityId,
        session_id: Option<&EntityId>,
    ) -> RemoteResult<RemoteReply> {
        self.mutate(key, |state| {
            if let Some(existing) = state.client_refs.get(client_ref).cloned() {
                return Ok(Self::reply_for(state, ReplyStatus::AlreadyApplied, Some(&existing), session_id)
                    .with_canonical_id(existing));
            }
            if let Some(session_id) = session_id {
                state.open_session_mut(session_id)?;
            }

            let id = state.mint("O");
            state.orders.insert(
                id.clone(),
                RemoteOrder {
                    id: id.clone(),
                    session_id: session_id.cloned(),
                    status: OrderStatus::Draft,
                    item_ids: Vec::new(),
                    total: Money::ZERO,
                },
            );
            if let Some(session_id) = session_id {
                state.open_session_mut(session_id)?.order_ids.push(id.clone());
            }
            state.client_refs.insert(client_ref.clone(), id.clone());
            Ok(Self::reply_for(state, ReplyStatus::Applied, Some(&id), session_id).with_canonical_id(id))
        })
        .await
    }

    async fn add_order_item(
        &self,
        key: &str,
        order_id: &EntityId,
        client_ref: &EntityId,
        _product_id: &str,
        quantity: u32,
        unit_price: Money,
    ) -> RemoteResult<RemoteReply> {
        self.mutate(key, |state| {
            let session_id = state.order(order_id)?.session_id.clone();
            if let Some(existing) = state.client_refs.get(client_ref).cloned() {
                return Ok(Self::reply_for(
                    state,
                    ReplyStatus::AlreadyApplied,
                    Some(order_id),
                    session_id.as_ref(),
                )
                .with_canonical_id(existing));
            }
            if quantity == 0 {
                return Err(RemoteError::rejected("quantity must be positive"));
            }
            state.editable_order(order_id)?;

            let id = state.mint("I");
            state.items.insert(
                id.clone(),
                RemoteItem {
                    order_id: order_id.clone(),
                    quantity,
                    unit_price,
                },
            );
            if let Some(order) = state.orders.get_mut(order_id) {
                order.item_ids.push(id.clone());
            }
            state.client_refs.insert(client_ref.clone(), id.clone());
            self.after_write(state, Some(order_id), session_id.as_ref());
            Ok(Self::reply_for(state, ReplyStatus::Applied, Some(order_id), session_id.as_ref())
                .with_canonical_id(id))
        })
        .await
    }

    async fn modify_order_item(
        &self,
        key: &str,
        item_id: &EntityId,
        new_quantity: u32,
    ) -> RemoteResult<RemoteReply> {
        self.mutate(key, |state| {
            let Some(item) = state.items.get(item_id).cloned() else {
                return Err(RemoteError::rejected(format!("unknown item {item_id}")));
            };
            let session_id = state.editable_order(&item.order_id)?.session_id.clone();

            if new_quantity == 0 {
                state.items.remove(item_id);
                if let Some(order) = state.orders.get_mut(&item.order_id) {
                    order.item_ids.retain(|id| id != item_id);
                }
            } else if let Some(item) = state.items.get_mut(item_id) {
                item.quantity = new_quantity;
            }
            self.after_write(state, Some(&item.order_id), session_id.as_ref());
            Ok(Self::reply_for(
                state,
                ReplyStatus::Applied,
                Some(&item.order_id),
                session_id.as_ref(),
            ))
        })
        .await
    }

    async fn confirm_order(&self, key: &str, order_id: &EntityId) -> RemoteResult<RemoteReply> {
        self.mutate(key, |state| {
            let order = state.order(order_id)?;
            let (session_id, current) = (order.session_id.clone(), order.status);
            let status = match current {
                OrderStatus::Confirmed => ReplyStatus::AlreadyApplied,
                OrderStatus::Draft => {
                    state.editable_order(order_id)?;
                    if let Some(order) = state.orders.get_mut(order_id) {
                        order.status = OrderStatus::Confirmed;
                    }
                    ReplyStatus::Applied
                }
                other => {
                    return Err(RemoteError::rejected(format!(
                        "order {order_id} is {other:?}"
                    )))
                }
            };
            Ok(Self::reply_for(state, status, Some(order_id), session_id.as_ref()))
        })
        .await
    }

    async fn void_order(&self, key: &str, order_id: &EntityId) -> RemoteResult<RemoteReply> {
        self.mutate(key, |state| {
            let order = state.order(order_id)?;
            let (session_id, current) = (order.session_id.clone(), order.status);
            let status = match current {
                OrderStatus::Voided => ReplyStatus::AlreadyApplied,
                OrderStatus::Completed => {
                    return Err(RemoteError::rejected(format!(
                        "order {order_id} is completed"
                    )))
                }
                OrderStatus::Draft | OrderStatus::Confirmed => {
                    if let Some(session_id) = &session_id {
                        state.open_session_mut(session_id)?;
                    }
                    if let Some(order) = state.orders.get_mut(order_id) {
                        order.status = OrderStatus::Voided;
                    }
                    self.after_write(state, None, session_id.as_ref());
                    ReplyStatus::Applied
                }
            };
            Ok(Self::reply_for(state, status, Some(order_id), session_id.as_ref()))
        })
        .await
    }

    async fn fetch_session(&self, id: &EntityId) -> RemoteResult<Option<SessionSnapshot>> {
        if let Some(Fault::LoseReply) = self.enter().await? {
            return Err(RemoteError::Network("connection reset".to_string()));
        }
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.lock().session_snapshot(id))
    }

    async fn fetch_order(&self, id: &EntityId) -> RemoteResult<Option<OrderSnapshot>> {
        if let Some(Fault::LoseReply) = self.enter().await? {
            return Err(RemoteError::Network("connection reset".to_string()));
        }
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.lock().order_snapshot(id))
    }
}
