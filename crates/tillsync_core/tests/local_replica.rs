//! Integration tests for the local replica.

use proptest::prelude::*;
use std::sync::Arc;
use tillsync_core::{MutationState, RecordKind, StoreConfig, Till};
use tillsync_protocol::{Money, Operation, OrderStatus};

#[derive(Debug, Clone)]
enum Intent {
    Add { order: usize, price: i64, qty: u32 },
    Update { line: usize, qty: u32 },
    Void { order: usize },
    NewOrder,
}

fn intent() -> impl Strategy<Value = Intent> {
    prop_oneof![
        4 => (0usize..4, 1i64..500, 1u32..5).prop_map(|(order, price, qty)| Intent::Add { order, price, qty }),
        2 => (0usize..16, 0u32..5).prop_map(|(line, qty)| Intent::Update { line, qty }),
        1 => (0usize..4).prop_map(|order| Intent::Void { order }),
        1 => Just(Intent::NewOrder),
    ]
}

proptest! {
    #[test]
    fn tab_total_is_sum_of_live_lines(intents in prop::collection::vec(intent(), 1..40)) {
        let till = Till::open_in_memory().unwrap();
        let tab = till.open_session(Some("P1".into())).unwrap();
        let mut orders = vec![till.create_order(Some(&tab)).unwrap()];
        let mut lines = Vec::new();

        for intent in intents {
            match intent {
                Intent::Add { order, price, qty } => {
                    let order = &orders[order % orders.len()];
                    if let Ok(line) = till.add_item(order, "dish", qty, Money::from_minor(price)) {
                        lines.push(line);
                    }
                }
                Intent::Update { line, qty } => {
                    if !lines.is_empty() {
                        let line = lines[line % lines.len()].clone();
                        let _ = till.update_item_quantity(&line, qty);
                    }
                }
                Intent::Void { order } => {
                    let _ = till.void_order(&orders[order % orders.len()]);
                }
                Intent::NewOrder => orders.push(till.create_order(Some(&tab)).unwrap()),
            }
        }

        let mut expected = Money::ZERO;
        for order_id in &orders {
            let order = till.order(order_id).unwrap().unwrap();
            let items: Money = till.line_items(order_id).unwrap().iter().map(|i| i.total).sum();
            prop_assert_eq!(order.total.value(), items);
            if order.status != OrderStatus::Voided {
                expected = expected + items;
            }
        }
        let session = till.session(&tab).unwrap().unwrap();
        prop_assert_eq!(session.total.value(), expected);
        prop_assert!(session.total.is_pending());
    }
}

#[test]
fn replica_and_outbox_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("till");

    let (tab, order) = {
        let till = Till::open(&path, StoreConfig::default()).unwrap();
        let tab = till.open_session(Some("T2".into())).unwrap();
        let order = till.create_order(Some(&tab)).unwrap();
        till.add_item(&order, "adobo", 1, Money::from_major(30)).unwrap();
        till.add_item(&order, "sinigang", 1, Money::from_major(40)).unwrap();
        let first = till.outbox().all().unwrap()[0].id;
        till.outbox().mark_in_flight(first).unwrap();
        (tab, order)
    };

    let till = Till::open(&path, StoreConfig::default()).unwrap();
    let session = till.session(&tab).unwrap().unwrap();
    assert_eq!(session.total.value(), Money::from_major(70));
    assert_eq!(till.line_items(&order).unwrap().len(), 2);

    let records = till.outbox().all().unwrap();
    assert_eq!(records.len(), 4);
    assert!(records.iter().all(|r| r.state == MutationState::Pending));
    assert!(matches!(records[0].operation, Operation::CreateSession { .. }));

    let next = till.create_order(Some(&tab)).unwrap();
    let ids: Vec<_> = till.outbox().all().unwrap().iter().map(|r| r.id).collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
    assert!(till.order(&next).unwrap().is_some());
}

#[test]
fn second_open_of_same_directory_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let _till = Till::open(dir.path(), StoreConfig::default()).unwrap();
    assert!(Till::open(dir.path(), StoreConfig::default()).is_err());
}

#[test]
fn concurrent_intents_on_one_tab_keep_totals_consistent() {
    let till = Arc::new(Till::open_in_memory().unwrap());
    let tab = till.open_session(None).unwrap();
    let order = till.create_order(Some(&tab)).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let till = Arc::clone(&till);
            let order = order.clone();
            std::thread::spawn(move || {
                for _ in 0..25 {
                    till.add_item(&order, "pandesal", 1, Money::from_major(5)).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(till.line_items(&order).unwrap().len(), 100);
    assert_eq!(
        till.session(&tab).unwrap().unwrap().total.value(),
        Money::from_major(500)
    );
    assert_eq!(till.store().count(RecordKind::Mutation), 102);
}
