//! Inspect command implementation.

use super::LogImage;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tillsync_core::{MutationRecord, RecordKind};
use tillsync_protocol::{Order, Session, SessionStatus};

/// Replica inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Replica path.
    pub path: String,
    /// Record log size in bytes.
    pub log_size: u64,
    /// Frames in the log.
    pub frames: usize,
    /// Bytes past the last valid frame.
    pub torn_bytes: u64,
    /// Live records per kind.
    pub records: BTreeMap<String, usize>,
    /// Queued mutations per stream.
    pub outbox: BTreeMap<String, usize>,
    /// Open tabs (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sessions: Option<Vec<SessionSummary>>,
}

/// One open tab.
#[derive(Debug, Serialize)]
pub struct SessionSummary {
    /// Id the tab is stored under.
    pub id: String,
    /// Table label.
    pub table: Option<String>,
    /// Lifecycle status.
    pub status: String,
    /// Orders on the tab.
    pub orders: usize,
    /// Amount due, two decimals.
    pub total: String,
    /// Whether the remote has yet to confirm the total.
    pub total_pending: bool,
    /// Record revision.
    pub revision: u64,
}

/// Runs the inspect command.
pub fn run(path: &Path, show_sessions: bool, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let result = inspect(path, show_sessions)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

pub(crate) fn inspect(
    path: &Path,
    show_sessions: bool,
) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let image = LogImage::load(path)?;

    let records = RecordKind::ALL
        .iter()
        .map(|kind| (kind.as_str().to_string(), image.count(*kind)))
        .collect();

    let mut outbox = BTreeMap::new();
    for mutation in image.decode::<MutationRecord>()? {
        *outbox.entry(mutation.stream.to_string()).or_insert(0) += 1;
    }

    let sessions = if show_sessions {
        let orders: Vec<Order> = image.decode()?;
        let summaries = image
            .decode::<Session>()?
            .into_iter()
            // Resolved tabs are stored twice; the forwarded copy is skipped.
            .filter(|s| s.alias.is_none() && s.status != SessionStatus::Closed)
            .map(|s| SessionSummary {
                orders: orders
                    .iter()
                    .filter(|o| o.alias.is_none() && o.session_id.as_ref() == Some(&s.id))
                    .count(),
                id: s.id.to_string(),
                table: s.table,
                status: format!("{:?}", s.status),
                total: s.total.value().to_string(),
                total_pending: s.total.is_pending(),
                revision: s.sequence,
            })
            .collect();
        Some(summaries)
    } else {
        None
    };

    Ok(InspectResult {
        path: path.display().to_string(),
        log_size: image.log_bytes,
        frames: image.frames,
        torn_bytes: image.torn_bytes,
        records,
        outbox,
        sessions,
    })
}

fn print_text_output(result: &InspectResult) {
    println!("tillsync Replica Inspection");
    println!("===========================");
    println!();
    println!("Path: {}", result.path);
    println!();
    println!("Log:");
    println!("  Size:       {}", format_size(result.log_size));
    println!("  Frames:     {}", result.frames);
    if result.torn_bytes > 0 {
        println!("  Torn tail:  {} bytes (dropped on next open)", result.torn_bytes);
    }
    println!();
    println!("Records:");
    for (kind, count) in &result.records {
        println!("  {kind:<10} {count}");
    }
    println!();
    println!("Outbox:");
    if result.outbox.is_empty() {
        println!("  empty");
    }
    for (stream, count) in &result.outbox {
        println!("  {stream}: {count} queued");
    }

    if let Some(sessions) = &result.sessions {
        println!();
        println!("Open tabs:");
        for s in sessions {
            println!(
                "  {} [{}] rev {}, {} orders, total {}{}",
                s.id,
                s.table.as_deref().unwrap_or("-"),
                s.revision,
                s.orders,
                s.total,
                if s.total_pending { " (pending)" } else { "" }
            );
        }
    }
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} bytes")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
