//! CLI command implementations.

pub mod compact;
pub mod demo;
pub mod dump_outbox;
pub mod inspect;
pub mod verify;

use std::collections::BTreeMap;
use std::path::Path;
use tillsync_core::{decode_frames, LogEntry, Record, RecordKind, StoreDir};
use tillsync_protocol::from_cbor;
use tillsync_storage::{FileBackend, StorageBackend};
use tracing::debug;

/// The live records of a log, rebuilt without opening the store.
///
/// Reading this way takes no lock and never truncates a torn tail, so it is
/// safe next to a running till.
#[derive(Debug, Default)]
pub struct LogImage {
    /// Live records per kind, keyed as in the store.
    pub records: BTreeMap<RecordKind, BTreeMap<String, Vec<u8>>>,
    /// Frames replayed.
    pub frames: usize,
    /// Bytes in the log file.
    pub log_bytes: u64,
    /// Bytes past the last valid frame.
    pub torn_bytes: u64,
}

impl LogImage {
    /// Replays the log of the replica at `path`.
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let data = read_log(path)?;
        let replay = decode_frames(&data);

        debug!(
            frames = replay.batches.len(),
            valid_bytes = replay.valid_len,
            "replayed log image"
        );
        let mut image = LogImage {
            frames: replay.batches.len(),
            log_bytes: data.len() as u64,
            torn_bytes: replay.torn_bytes(data.len() as u64),
            ..LogImage::default()
        };
        for entry in replay.batches.into_iter().flatten() {
            match entry {
                LogEntry::Put { kind, key, value } => {
                    image.records.entry(kind).or_default().insert(key, value);
                }
                LogEntry::Delete { kind, key } => {
                    if let Some(records) = image.records.get_mut(&kind) {
                        records.remove(&key);
                    }
                }
            }
        }
        Ok(image)
    }

    /// Returns the number of live records of `kind`.
    pub fn count(&self, kind: RecordKind) -> usize {
        self.records.get(&kind).map_or(0, BTreeMap::len)
    }

    /// Decodes every live record of type `R`, in key order.
    pub fn decode<R: Record>(&self) -> Result<Vec<R>, Box<dyn std::error::Error>> {
        let Some(records) = self.records.get(&R::KIND) else {
            return Ok(Vec::new());
        };
        records
            .values()
            .map(|value| from_cbor::<R>(value).map_err(Into::into))
            .collect()
    }
}

/// Reads the whole record log of the replica at `path`.
pub fn read_log(path: &Path) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let log_path = StoreDir::log_file(path);
    if !log_path.exists() {
        return Err(format!("No replica found at {}", path.display()).into());
    }
    let backend = FileBackend::open(&log_path)?;
    Ok(backend.read_all()?)
}

#[cfg(test)]
pub(crate) mod fixture {
    use std::path::Path;
    use tillsync_core::{StoreConfig, Till};
    use tillsync_protocol::{EntityId, Money};

    /// Writes a replica with one open tab and an order of two lines.
    pub fn seed(path: &Path) -> (EntityId, EntityId) {
        let till = Till::open(path, StoreConfig::new()).unwrap();
        let tab = till.open_session(Some("T1".into())).unwrap();
        let order = till.create_order(Some(&tab)).unwrap();
        till.add_item(&order, "lumpia", 1, Money::from_major(30)).unwrap();
        till.add_item(&order, "pancit", 1, Money::from_major(40)).unwrap();
        (tab, order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tillsync_core::MutationRecord;
    use tillsync_protocol::Session;

    #[test]
    fn image_matches_the_written_replica() {
        let dir = tempdir().unwrap();
        let (tab, _) = fixture::seed(dir.path());

        let image = LogImage::load(dir.path()).unwrap();
        assert_eq!(image.torn_bytes, 0);
        assert_eq!(image.count(RecordKind::Session), 1);
        assert_eq!(image.count(RecordKind::LineItem), 2);

        let sessions: Vec<Session> = image.decode().unwrap();
        assert_eq!(sessions[0].id, tab);
        let mutations: Vec<MutationRecord> = image.decode().unwrap();
        assert_eq!(mutations.len(), 4);
    }

    #[test]
    fn missing_replica_is_reported() {
        let dir = tempdir().unwrap();
        assert!(LogImage::load(&dir.path().join("nowhere")).is_err());
    }
}
