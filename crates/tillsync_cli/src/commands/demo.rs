//! Demo command implementation.
//!
//! Rings up the ₱30 + ₱40 tab against the reference remote and prints how
//! the local total moves while the worker syncs.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tillsync_core::{StoreConfig, Till};
use tillsync_protocol::{EntityId, Money};
use tillsync_remote::{ReferenceRemote, RemoteConfig};
use tillsync_sync::{SyncConfig, SyncWorker};

/// Runs the demo, on disk at `path` or in memory.
pub async fn run(path: Option<&Path>, lagging: bool) -> Result<(), Box<dyn std::error::Error>> {
    let till = Arc::new(match path {
        Some(path) => Till::open(path, StoreConfig::new())?,
        None => Till::open_in_memory()?,
    });
    let remote = Arc::new(ReferenceRemote::with_config(
        RemoteConfig::new().with_lagging_totals(lagging),
    ));
    let config = SyncConfig::new("demo-till")
        .with_drain_interval(Duration::from_secs(3600))
        .with_snapshot_interval(Duration::from_secs(3600));
    let handle = SyncWorker::spawn(Arc::clone(&till), remote.clone(), config);

    let tab = till.open_session(Some("Table 7".into()))?;
    let order = till.create_order(Some(&tab))?;
    till.add_item(&order, "lumpia", 1, Money::from_major(30))?;
    till.add_item(&order, "pancit", 1, Money::from_major(40))?;
    show(&till, &tab, "after ringing up")?;

    // Each intent woke the worker; wait for the eager sends to finish.
    for _ in 0..500 {
        if till.pending_mutations() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    show(&till, &tab, "after the outbox drained")?;

    if lagging {
        remote.recalculate();
    }
    let report = handle.force_sync().await?;
    println!("  fetched: {} snapshots merged", report.snapshots_merged);
    show(&till, &tab, "after a fresh read")?;

    till.close_session(&tab)?;
    handle.force_sync().await?;
    println!(
        "closed: tab {}",
        if till.session(&tab)?.is_none() {
            "evicted"
        } else {
            "still cached"
        }
    );

    let stats = handle.stats();
    println!(
        "worker: {} passes, {} mutations acknowledged, {} retried",
        stats.drain_passes, stats.mutations_acked, stats.mutations_retried
    );
    handle.shutdown().await;
    Ok(())
}

fn show(till: &Till, tab: &EntityId, moment: &str) -> Result<(), Box<dyn std::error::Error>> {
    let Some(session) = till.session(tab)? else {
        println!("{moment}: tab gone");
        return Ok(());
    };
    println!(
        "{moment}: tab {} total ₱{}{} ({} queued)",
        session.id,
        session.total.value(),
        if session.total.is_pending() {
            " pending"
        } else {
            ""
        },
        till.pending_mutations()
    );
    Ok(())
}
