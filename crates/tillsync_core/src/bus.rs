//! Same-device change notifications.
//!
//! The bus tells other views on this terminal that an entity changed so
//! they can re-read it from the [`LocalStore`](crate::LocalStore). Delivery
//! is best effort and at most once; the store stays the source of truth.
//!
//! ```rust,ignore
//! let subscription = bus.subscribe(|event| println!("{event:?}"));
//! // ... dropping the subscription detaches the handler
//! drop(subscription);
//! ```

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Weak};
use tillsync_protocol::{EntityId, EntityKind};

/// What happened to the entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// Created or updated.
    Upserted,
    /// Deleted or evicted.
    Removed,
    /// A temporary id was linked to its canonical id.
    Aliased {
        /// The canonical id.
        canonical: EntityId,
    },
}

/// Who caused the change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A UI intent on this terminal.
    Local,
    /// A remote acknowledgement or snapshot.
    Remote,
}

/// A change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    /// Bus-assigned sequence number, increasing per bus.
    pub sequence: u64,
    /// Entity kind.
    pub kind: EntityKind,
    /// Entity id.
    pub id: EntityId,
    /// Change type.
    pub change: Change,
    /// Cause.
    pub origin: Origin,
}

impl StoreEvent {
    /// An upsert; the sequence is assigned on publish.
    pub fn upserted(kind: EntityKind, id: EntityId, origin: Origin) -> Self {
        Self {
            sequence: 0,
            kind,
            id,
            change: Change::Upserted,
            origin,
        }
    }

    /// A removal; the sequence is assigned on publish.
    pub fn removed(kind: EntityKind, id: EntityId, origin: Origin) -> Self {
        Self {
            sequence: 0,
            kind,
            id,
            change: Change::Removed,
            origin,
        }
    }

    /// An alias link; the sequence is assigned on publish.
    pub fn aliased(kind: EntityKind, temporary: EntityId, canonical: EntityId) -> Self {
        Self {
            sequence: 0,
            kind,
            id: temporary,
            change: Change::Aliased { canonical },
            origin: Origin::Remote,
        }
    }
}

type Handler = Arc<dyn Fn(&StoreEvent) + Send + Sync>;

#[derive(Default)]
struct Inner {
    handlers: RwLock<Vec<(u64, Handler)>>,
    channels: RwLock<Vec<Sender<StoreEvent>>>,
    next_handler: AtomicU64,
    sequence: AtomicU64,
}

/// Fan-out of [`StoreEvent`]s to handlers and channels.
///
/// Cloning yields another handle to the same bus.
#[derive(Clone, Default)]
pub struct BroadcastBus {
    inner: Arc<Inner>,
}

impl BroadcastBus {
    /// Creates a bus with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes an event and returns the sequence it was given.
    ///
    /// Handlers run on the caller's thread, outside any bus lock, so a
    /// handler may itself subscribe or publish.
    pub fn publish(&self, mut event: StoreEvent) -> u64 {
        event.sequence = self.inner.sequence.fetch_add(1, Ordering::AcqRel) + 1;

        let handlers: Vec<Handler> = self
            .inner
            .handlers
            .read()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in handlers {
            handler(&event);
        }

        self.inner
            .channels
            .write()
            .retain(|tx| tx.send(event.clone()).is_ok());

        event.sequence
    }

    /// Publishes several events in order.
    pub fn publish_all(&self, events: impl IntoIterator<Item = StoreEvent>) {
        for event in events {
            self.publish(event);
        }
    }

    /// Attaches a handler until the returned subscription is dropped.
    ///
    /// Handlers run on the publishing thread, which is the sync worker for
    /// remote changes. Both intents and remote application publish after
    /// releasing their stream lock, so a handler may call
    /// [`Till`](crate::Till) intents, at the cost of stalling the publisher.
    #[must_use = "dropping the subscription detaches the handler"]
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&StoreEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_handler.fetch_add(1, Ordering::Relaxed);
        self.inner.handlers.write().push((id, Arc::new(handler)));
        Subscription {
            bus: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Returns a receiver of every future event.
    ///
    /// The channel is dropped from the bus on the first publish after the
    /// receiver goes away.
    pub fn subscribe_channel(&self) -> Receiver<StoreEvent> {
        let (tx, rx) = mpsc::channel();
        self.inner.channels.write().push(tx);
        rx
    }

    /// Returns the last assigned sequence number.
    pub fn latest_sequence(&self) -> u64 {
        self.inner.sequence.load(Ordering::Acquire)
    }

    /// Returns the number of attached handlers and channels.
    pub fn subscriber_count(&self) -> usize {
        self.inner.handlers.read().len() + self.inner.channels.read().len()
    }
}

impl std::fmt::Debug for BroadcastBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastBus")
            .field("subscribers", &self.subscriber_count())
            .field("sequence", &self.latest_sequence())
            .finish()
    }
}

/// Handle that keeps a handler attached.
#[derive(Debug)]
pub struct Subscription {
    bus: Weak<Inner>,
    id: u64,
}

impl Subscription {
    /// Detaches the handler now.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.handlers.write().retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn event(id: &str) -> StoreEvent {
        StoreEvent::upserted(EntityKind::Session, EntityId::from(id), Origin::Local)
    }

    #[test]
    fn handlers_receive_in_order() {
        let bus = BroadcastBus::new();
        let seen = Arc::new(RwLock::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = bus.subscribe(move |e| sink.write().push(e.sequence));

        bus.publish(event("a"));
        bus.publish(event("b"));

        assert_eq!(*seen.read(), vec![1, 2]);
        assert_eq!(bus.latest_sequence(), 2);
    }

    #[test]
    fn dropping_subscription_detaches() {
        let bus = BroadcastBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let sub = bus.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(event("a"));
        sub.unsubscribe();
        bus.publish(event("b"));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn channel_subscribers_are_pruned() {
        let bus = BroadcastBus::new();
        let rx = bus.subscribe_channel();

        bus.publish(event("a"));
        let received = rx.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(received.id, EntityId::from("a"));

        drop(rx);
        bus.publish(event("b"));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn handler_may_subscribe_while_handling() {
        let bus = BroadcastBus::new();
        let inner_bus = bus.clone();
        let nested = Arc::new(RwLock::new(Vec::new()));
        let keep = Arc::clone(&nested);
        let _sub = bus.subscribe(move |_| {
            keep.write().push(inner_bus.subscribe(|_| {}));
        });

        bus.publish(event("a"));
        assert_eq!(nested.read().len(), 1);
    }
}
