//! Integration tests for the sync worker against the reference remote.

use std::sync::Arc;
use std::time::Duration;
use tillsync_core::{CollectingSink, MutationState, StoreConfig, Till};
use tillsync_protocol::{
    Aggregate, EntityStream, Money, Operation, RemoteApi, RemoteError, SessionStatus,
};
use tillsync_remote::{Fault, ReferenceRemote, RemoteConfig};
use tillsync_sync::{RetryConfig, SyncConfig, SyncHandle, SyncState, SyncWorker};

/// Timers far enough out that only commands drive the worker.
fn quiet_config() -> SyncConfig {
    SyncConfig::new("test-till")
        .with_drain_interval(Duration::from_secs(3600))
        .with_snapshot_interval(Duration::from_secs(3600))
        .with_request_timeout(Duration::from_secs(5))
        .with_retry(RetryConfig::new(
            Duration::from_secs(60),
            Duration::from_secs(600),
        ))
}

async fn start(remote: Arc<ReferenceRemote>, config: SyncConfig) -> (Arc<Till>, SyncHandle) {
    let till = Arc::new(Till::open_in_memory().unwrap());
    let handle = SyncWorker::spawn(Arc::clone(&till), remote, config);
    // Let the first timer ticks pass while there is nothing to do.
    tokio::time::sleep(Duration::from_millis(20)).await;
    (till, handle)
}

async fn settle(till: &Till) {
    for _ in 0..400 {
        if till.pending_mutations() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("outbox never drained: {} left", till.pending_mutations());
}

async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never held");
}

async fn wait_for_state(handle: &SyncHandle, wanted: SyncState) {
    let mut states = handle.subscribe_state();
    tokio::time::timeout(Duration::from_secs(2), states.wait_for(|s| *s == wanted))
        .await
        .expect("state not reached")
        .expect("worker gone");
}

#[tokio::test]
async fn lagging_remote_total_does_not_regress_local_total() {
    let remote = Arc::new(ReferenceRemote::with_config(
        RemoteConfig::new().with_lagging_totals(true),
    ));
    let (till, handle) = start(Arc::clone(&remote), quiet_config()).await;

    let tab = till.open_session(Some("T1".into())).unwrap();
    let order = till.create_order(Some(&tab)).unwrap();
    till.add_item(&order, "lumpia", 1, Money::from_major(30)).unwrap();
    till.add_item(&order, "pancit", 1, Money::from_major(40)).unwrap();
    assert_eq!(till.session(&tab).unwrap().unwrap().total.value(), Money::from_major(70));

    // Every reply so far carried a total of zero.
    settle(&till).await;
    let session = till.session(&tab).unwrap().unwrap();
    assert_eq!(session.total.value(), Money::from_major(70));
    assert!(session.total.is_pending());

    remote.recalculate();
    handle.force_sync().await.unwrap();

    let session = till.session(&tab).unwrap().unwrap();
    assert_eq!(session.total, Aggregate::Confirmed(Money::from_major(70)));
    let canonical = till.identity().resolve(&tab).unwrap();
    assert_eq!(remote.peek_session(&canonical).unwrap().total, Money::from_major(70));
    let order = till.order(&order).unwrap().unwrap();
    assert_eq!(order.total, Aggregate::Confirmed(Money::from_major(70)));

    handle.shutdown().await;
}

#[tokio::test]
async fn lost_reply_is_retried_without_duplicating() {
    let remote = Arc::new(ReferenceRemote::new());
    let (till, handle) = start(Arc::clone(&remote), quiet_config()).await;

    remote.inject(Fault::LoseReply);
    let tab = till.open_session(Some("T2".into())).unwrap();
    let order = till.create_order(Some(&tab)).unwrap();
    till.add_item(&order, "sisig", 2, Money::from_major(180)).unwrap();

    let report = handle.force_sync().await.unwrap();
    assert_eq!(report.acked, 3);
    assert_eq!(till.pending_mutations(), 0);
    assert_eq!(remote.session_count(), 1);
    assert_eq!(remote.counters().duplicates, 1);

    let canonical_order = till.identity().resolve(&order).unwrap();
    assert!(!canonical_order.is_temporary());
    assert_eq!(remote.item_count(&canonical_order), 1);

    let stats = handle.stats();
    assert_eq!(stats.mutations_retried, 1);
    assert_eq!(handle.state(), SyncState::Idle);

    handle.shutdown().await;
}

#[tokio::test]
async fn temporary_and_canonical_ids_read_the_same() {
    let remote = Arc::new(ReferenceRemote::new());
    let (till, handle) = start(Arc::clone(&remote), quiet_config()).await;

    let tab = till.open_session(None).unwrap();
    let order = till.create_order(Some(&tab)).unwrap();
    till.add_item(&order, "adobo", 1, Money::from_major(150)).unwrap();
    handle.force_sync().await.unwrap();

    let canonical_tab = till.identity().resolve(&tab).unwrap();
    let canonical_order = till.identity().resolve(&order).unwrap();
    assert_ne!(canonical_tab, tab);
    assert_eq!(till.session(&tab).unwrap(), till.session(&canonical_tab).unwrap());
    assert_eq!(
        till.line_items(&order).unwrap(),
        till.line_items(&canonical_order).unwrap()
    );

    // A screen still holding the temporary id keeps working.
    till.add_item(&order, "rice", 2, Money::from_major(20)).unwrap();
    handle.force_sync().await.unwrap();
    assert_eq!(remote.item_count(&canonical_order), 2);
    assert_eq!(
        till.session(&canonical_tab).unwrap().unwrap().total,
        Aggregate::Confirmed(Money::from_major(190))
    );

    handle.shutdown().await;
}

#[tokio::test]
async fn closed_tab_is_not_resurrected_by_a_late_duplicate() {
    let remote = Arc::new(ReferenceRemote::new());
    let (till, handle) = start(Arc::clone(&remote), quiet_config()).await;

    let tab = till.open_session(Some("T5".into())).unwrap();
    handle.force_sync().await.unwrap();
    let canonical = till.identity().resolve(&tab).unwrap();

    till.close_session(&tab).unwrap();
    assert_eq!(
        till.session(&tab).unwrap().unwrap().status,
        SessionStatus::Closing
    );
    handle.force_sync().await.unwrap();
    assert!(till.session(&tab).unwrap().is_none());
    assert!(till.ledger().is_evicted(&canonical));
    assert_eq!(
        remote.peek_session(&canonical).unwrap().status,
        SessionStatus::Closed
    );

    // A retried "open tab" for the same table arrives after the close.
    till.outbox()
        .enqueue(
            EntityStream::session(&tab),
            Operation::CreateSession {
                session_id: tab.clone(),
                table: Some("T5".into()),
            },
            0,
        )
        .unwrap();
    let report = handle.force_sync().await.unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(report.sent, 0);
    assert_eq!(remote.session_count(), 1);
    assert!(till.session(&tab).unwrap().is_none());
    assert!(till.session(&canonical).unwrap().is_none());
    assert!(till.open_sessions().unwrap().is_empty());

    handle.shutdown().await;
}

#[tokio::test]
async fn tab_closed_elsewhere_is_evicted_after_its_queue_drains() {
    let remote = Arc::new(ReferenceRemote::new());
    let config = quiet_config().with_snapshot_interval(Duration::from_millis(25));
    let (till, handle) = start(Arc::clone(&remote), config).await;

    let tab = till.open_session(Some("T7".into())).unwrap();
    handle.force_sync().await.unwrap();
    let canonical = till.identity().resolve(&tab).unwrap();

    // The order cannot be sent before another terminal closes the tab.
    remote.inject(Fault::Fail(RemoteError::Unavailable("503".into())));
    let order = till.create_order(Some(&tab)).unwrap();
    wait_until(|| till.outbox().all().unwrap()[0].state == MutationState::Retryable).await;
    remote.close_session("other-till", &canonical).await.unwrap();

    wait_until(|| {
        till.session(&tab).unwrap().map(|s| s.status) == Some(SessionStatus::Closed)
    })
    .await;
    assert_eq!(till.pending_mutations(), 1);

    let report = handle.force_sync().await.unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(report.sent, 0);
    assert_eq!(till.pending_mutations(), 0);
    assert!(till.session(&tab).unwrap().is_none());
    assert!(till.order(&order).unwrap().is_none());
    assert!(till.ledger().is_evicted(&canonical));
    assert!(till.open_sessions().unwrap().is_empty());

    handle.shutdown().await;
}

#[tokio::test]
async fn offline_remote_backs_off_and_recovers() {
    let remote = Arc::new(ReferenceRemote::new());
    remote.set_offline(true);
    let (till, handle) = start(Arc::clone(&remote), quiet_config()).await;

    let tab = till.open_session(Some("T6".into())).unwrap();
    let order = till.create_order(Some(&tab)).unwrap();
    till.add_item(&order, "halo-halo", 1, Money::from_major(95)).unwrap();
    wait_for_state(&handle, SyncState::Offline).await;

    // Nothing is lost and the head waits out its backoff.
    assert_eq!(till.pending_mutations(), 3);
    let head = till.outbox().all().unwrap().remove(0);
    assert_eq!(head.state, MutationState::Retryable);
    assert_eq!(head.attempts, 1);
    assert!(head.last_error.is_some());
    assert_eq!(remote.counters().calls, 1);
    assert_eq!(till.order(&order).unwrap().unwrap().total.value(), Money::from_major(95));

    remote.set_offline(false);
    handle.connectivity_restored().await.unwrap();
    settle(&till).await;
    wait_for_state(&handle, SyncState::Idle).await;
    assert_eq!(remote.session_count(), 1);
    assert!(!till.identity().resolve(&order).unwrap().is_temporary());

    handle.shutdown().await;
}

#[tokio::test]
async fn rejection_reaches_the_error_sink_and_the_stream_moves_on() {
    let remote = Arc::new(ReferenceRemote::new());
    let (till, handle) = start(Arc::clone(&remote), quiet_config()).await;
    let sink = Arc::new(CollectingSink::new());
    till.set_error_sink(sink.clone());

    let order = till.create_order(None).unwrap();
    handle.force_sync().await.unwrap();

    remote.inject(Fault::Fail(RemoteError::rejected("item unavailable")));
    till.add_item(&order, "lechon", 1, Money::from_major(500)).unwrap();
    till.add_item(&order, "buko", 1, Money::from_major(60)).unwrap();
    handle.force_sync().await.unwrap();

    let failures = sink.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].reason, "item unavailable");
    assert!(failures[0].message().contains("item unavailable"));

    let stream = till.order_stream(&till.order(&order).unwrap().unwrap()).unwrap();
    assert!(till.outbox().is_degraded(&stream));
    assert_eq!(till.pending_mutations(), 0);
    let canonical = till.identity().resolve(&order).unwrap();
    assert_eq!(remote.item_count(&canonical), 1);
    assert_eq!(handle.stats().mutations_rejected, 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn slow_remote_times_out_as_transient() {
    let remote = Arc::new(ReferenceRemote::with_config(
        RemoteConfig::new().with_latency(Duration::from_millis(300)),
    ));
    let config = quiet_config().with_request_timeout(Duration::from_millis(30));
    let (till, handle) = start(Arc::clone(&remote), config).await;

    till.open_session(None).unwrap();
    wait_for_state(&handle, SyncState::Offline).await;

    let head = till.outbox().all().unwrap().remove(0);
    assert_eq!(head.state, MutationState::Retryable);
    assert_eq!(
        head.last_error.as_deref(),
        Some(RemoteError::Timeout.to_string().as_str())
    );
    assert!(till.outbox().degraded_streams().is_empty());

    handle.shutdown().await;
}

#[tokio::test]
async fn shutdown_reports_stopped() {
    let remote = Arc::new(ReferenceRemote::new());
    let (_till, handle) = start(remote, quiet_config()).await;
    let states = handle.subscribe_state();
    handle.shutdown().await;
    assert_eq!(*states.borrow(), SyncState::Stopped);
}

#[tokio::test]
async fn temporary_id_never_reaches_the_remote_as_a_reference() {
    let remote = Arc::new(ReferenceRemote::new());
    let (till, handle) = start(Arc::clone(&remote), quiet_config()).await;

    let tab = till.open_session(None).unwrap();
    let order = till.create_order(Some(&tab)).unwrap();
    handle.force_sync().await.unwrap();

    let canonical_tab = till.identity().resolve(&tab).unwrap();
    let canonical_order = till.identity().resolve(&order).unwrap();
    let snapshot = remote.peek_order(&canonical_order).unwrap();
    assert_eq!(snapshot.session_id, Some(canonical_tab));
    assert!(remote.peek_session(&tab).is_none());

    handle.shutdown().await;
}

#[tokio::test]
async fn outbox_written_before_a_restart_drains_afterwards() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("till");

    let (tab, order) = {
        let till = Till::open(&path, StoreConfig::default()).unwrap();
        let tab = till.open_session(Some("T9".into())).unwrap();
        let order = till.create_order(Some(&tab)).unwrap();
        till.add_item(&order, "bulalo", 1, Money::from_major(320)).unwrap();
        (tab, order)
    };

    let till = Arc::new(Till::open(&path, StoreConfig::default()).unwrap());
    assert_eq!(till.pending_mutations(), 3);
    let remote = Arc::new(ReferenceRemote::new());
    let handle = SyncWorker::spawn(Arc::clone(&till), Arc::<ReferenceRemote>::clone(&remote), quiet_config());
    handle.force_sync().await.unwrap();

    assert_eq!(till.pending_mutations(), 0);
    let canonical_order = till.identity().resolve(&order).unwrap();
    assert_eq!(remote.item_count(&canonical_order), 1);
    assert_eq!(
        till.session(&tab).unwrap().unwrap().total,
        Aggregate::Confirmed(Money::from_major(320))
    );

    handle.shutdown().await;
}
