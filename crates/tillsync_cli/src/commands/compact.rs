//! Compact command implementation.

use super::LogImage;
use std::path::Path;
use tillsync_core::{encode_frame, CompactionStats, LocalStore, LogEntry, StoreConfig};

/// Runs the compact command.
pub fn run(path: &Path, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    println!("Compacting replica at {}", path.display());
    if dry_run {
        println!("(dry run - no changes will be made)");
    }
    println!();

    let stats = if dry_run {
        estimate(path)?
    } else {
        // Takes the store lock; fails while a till has the replica open.
        let store = LocalStore::open(path, StoreConfig::new().create_if_missing(false))?;
        store.compact()?
    };

    println!("Compaction:");
    println!("  Live records: {}", stats.records);
    println!("  Size before:  {} bytes", stats.bytes_before);
    println!("  Size after:   {} bytes", stats.bytes_after);
    let saved = stats.bytes_before.saturating_sub(stats.bytes_after);
    println!(
        "  Space saved:  {} bytes ({:.1}%)",
        saved,
        if stats.bytes_before > 0 {
            saved as f64 / stats.bytes_before as f64 * 100.0
        } else {
            0.0
        }
    );
    if !dry_run {
        println!();
        println!("✓ Compaction complete");
    }

    Ok(())
}

/// Computes what compaction would produce without touching the replica.
pub(crate) fn estimate(path: &Path) -> Result<CompactionStats, Box<dyn std::error::Error>> {
    let image = LogImage::load(path)?;
    let entries: Vec<LogEntry> = image
        .records
        .iter()
        .flat_map(|(kind, records)| {
            records.iter().map(|(key, value)| LogEntry::Put {
                kind: *kind,
                key: key.clone(),
                value: value.clone(),
            })
        })
        .collect();
    let bytes_after = if entries.is_empty() {
        0
    } else {
        encode_frame(&entries)?.len() as u64
    };
    Ok(CompactionStats {
        bytes_before: image.log_bytes,
        bytes_after,
        records: entries.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::fixture;
    use tempfile::tempdir;

    #[test]
    fn estimate_matches_real_compaction() {
        let dir = tempdir().unwrap();
        fixture::seed(dir.path());

        let estimated = estimate(dir.path()).unwrap();
        assert!(estimated.bytes_after < estimated.bytes_before);

        let store = LocalStore::open(dir.path(), StoreConfig::new()).unwrap();
        let actual = store.compact().unwrap();
        assert_eq!(actual, estimated);
    }
}
