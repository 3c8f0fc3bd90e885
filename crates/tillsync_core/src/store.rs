//! The local replica.

use crate::config::StoreConfig;
use crate::dir::StoreDir;
use crate::error::{CoreError, CoreResult};
use crate::log::{decode_frames, encode_frame, LogEntry, RecordKind};
use crate::record::Record;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tillsync_protocol::{from_cbor, to_cbor};
use tillsync_storage::{FileBackend, InMemoryBackend, StorageBackend};
use tracing::{debug, info, warn};

type Index = BTreeMap<RecordKind, BTreeMap<String, Vec<u8>>>;

/// A set of changes committed as one log frame.
///
/// Either every change in the batch survives a crash or none does.
#[derive(Debug, Default, Clone)]
pub struct WriteBatch {
    entries: Vec<LogEntry>,
}

impl WriteBatch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages a raw put.
    pub fn put(&mut self, kind: RecordKind, key: impl Into<String>, value: Vec<u8>) {
        self.entries.push(LogEntry::Put {
            kind,
            key: key.into(),
            value,
        });
    }

    /// Stages a delete.
    pub fn delete(&mut self, kind: RecordKind, key: impl Into<String>) {
        self.entries.push(LogEntry::Delete {
            kind,
            key: key.into(),
        });
    }

    /// Stages a typed put.
    pub fn put_record<R: Record>(&mut self, record: &R) -> CoreResult<()> {
        self.put(R::KIND, record.key(), to_cbor(record)?);
        Ok(())
    }

    /// Stages a typed delete.
    pub fn delete_record<R: Record>(&mut self, key: impl Into<String>) {
        self.delete(R::KIND, key);
    }

    /// Returns the number of staged changes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Result of a compaction pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CompactionStats {
    /// Log size before compaction.
    pub bytes_before: u64,
    /// Log size after compaction.
    pub bytes_after: u64,
    /// Live records written.
    pub records: usize,
}

/// Point-in-time summary of a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Record count per kind.
    pub records: BTreeMap<String, usize>,
    /// Current log size in bytes.
    pub log_bytes: u64,
    /// Whether writes are refused.
    pub read_only: bool,
}

/// Durable on-device key/value store of entity and outbox records.
///
/// Reads are served from an in-memory index rebuilt from the record log on
/// open. Writes append one CRC-framed batch to the log, sync it, and only
/// then update the index, so a reader never observes a change that could
/// be lost in a crash. Writes are serialized through one writer lock.
///
/// After a failed write the store turns read-only: reads keep working and
/// every further write returns [`CoreError::StorageUnavailable`].
pub struct LocalStore {
    config: StoreConfig,
    dir: Option<StoreDir>,
    backend: Mutex<Box<dyn StorageBackend>>,
    index: RwLock<Index>,
    read_only: AtomicBool,
}

impl LocalStore {
    /// Opens a store directory, replaying its log.
    ///
    /// # Errors
    ///
    /// Returns `Locked` if another process has the directory open.
    pub fn open(path: &Path, config: StoreConfig) -> CoreResult<Self> {
        let dir = StoreDir::open(path, config.create_if_missing)?;
        let backend = FileBackend::open(&dir.log_path())?;
        Self::with_parts(Some(dir), Box::new(backend), config)
    }

    /// Opens a store over an existing backend.
    pub fn with_backend(backend: Box<dyn StorageBackend>, config: StoreConfig) -> CoreResult<Self> {
        Self::with_parts(None, backend, config)
    }

    /// Opens a fresh in-memory store for testing.
    pub fn open_in_memory() -> CoreResult<Self> {
        Self::with_backend(Box::new(InMemoryBackend::new()), StoreConfig::default())
    }

    fn with_parts(
        dir: Option<StoreDir>,
        mut backend: Box<dyn StorageBackend>,
        config: StoreConfig,
    ) -> CoreResult<Self> {
        let data = backend.read_all()?;
        let replay = decode_frames(&data);

        let torn = replay.torn_bytes(data.len() as u64);
        if torn > 0 {
            warn!(
                torn_bytes = torn,
                valid_bytes = replay.valid_len,
                "truncating torn record log tail"
            );
            backend.truncate(replay.valid_len)?;
            backend.sync()?;
        }

        let mut index = Index::new();
        let batches = replay.batches.len();
        for batch in replay.batches {
            apply(&mut index, batch);
        }
        debug!(batches, "replayed record log");

        let store = Self {
            config,
            dir,
            backend: Mutex::new(backend),
            index: RwLock::new(index),
            read_only: AtomicBool::new(false),
        };

        if store.needs_compaction()? {
            store.compact()?;
        }

        Ok(store)
    }

    /// Returns the store configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Returns the store directory, `None` for backend-only stores.
    pub fn path(&self) -> Option<&Path> {
        self.dir.as_ref().map(StoreDir::path)
    }

    /// Returns true once a write has failed.
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    /// Inserts or replaces a record.
    pub fn put(&self, kind: RecordKind, key: &str, value: Vec<u8>) -> CoreResult<()> {
        let mut batch = WriteBatch::new();
        batch.put(kind, key, value);
        self.write_batch(batch)
    }

    /// Reads a record.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no record exists under the key.
    pub fn get(&self, kind: RecordKind, key: &str) -> CoreResult<Vec<u8>> {
        self.try_get(kind, key)
            .ok_or_else(|| CoreError::not_found(kind.as_str(), key))
    }

    /// Reads a record if present.
    pub fn try_get(&self, kind: RecordKind, key: &str) -> Option<Vec<u8>> {
        self.index
            .read()
            .get(&kind)
            .and_then(|records| records.get(key))
            .cloned()
    }

    /// Returns true if a record exists under the key.
    pub fn contains(&self, kind: RecordKind, key: &str) -> bool {
        self.index
            .read()
            .get(&kind)
            .is_some_and(|records| records.contains_key(key))
    }

    /// Removes a record. Returns false if there was nothing to remove.
    pub fn delete(&self, kind: RecordKind, key: &str) -> CoreResult<bool> {
        if !self.contains(kind, key) {
            return Ok(false);
        }
        let mut batch = WriteBatch::new();
        batch.delete(kind, key);
        self.write_batch(batch)?;
        Ok(true)
    }

    /// Returns every record of a kind accepted by `predicate`, in key order.
    pub fn query<F>(&self, kind: RecordKind, predicate: F) -> Vec<(String, Vec<u8>)>
    where
        F: Fn(&str, &[u8]) -> bool,
    {
        self.index
            .read()
            .get(&kind)
            .map(|records| {
                records
                    .iter()
                    .filter(|(key, value)| predicate(key, value))
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns the number of records of a kind.
    pub fn count(&self, kind: RecordKind) -> usize {
        self.index.read().get(&kind).map_or(0, BTreeMap::len)
    }

    /// Commits a batch atomically.
    pub fn write_batch(&self, batch: WriteBatch) -> CoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        if self.is_read_only() {
            return Err(CoreError::storage_unavailable(
                "store is read-only after a failed write",
            ));
        }

        let frame = encode_frame(&batch.entries)?;

        let mut backend = self.backend.lock();
        let written = backend.append(&frame).and_then(|_| {
            if self.config.sync_on_write {
                backend.sync()
            } else {
                Ok(())
            }
        });
        if let Err(err) = written {
            self.read_only.store(true, Ordering::Release);
            warn!(error = %err, "record log write failed, store is now read-only");
            return Err(CoreError::storage_unavailable(err.to_string()));
        }

        // Index updates stay under the writer lock so readers see batches
        // in log order.
        apply(&mut self.index.write(), batch.entries);
        Ok(())
    }

    /// Writes a typed record.
    pub fn put_record<R: Record>(&self, record: &R) -> CoreResult<()> {
        self.put(R::KIND, &record.key(), to_cbor(record)?)
    }

    /// Reads a typed record.
    pub fn get_record<R: Record>(&self, key: &str) -> CoreResult<Option<R>> {
        self.try_get(R::KIND, key)
            .map(|bytes| from_cbor(&bytes))
            .transpose()
            .map_err(CoreError::from)
    }

    /// Removes a typed record.
    pub fn delete_record<R: Record>(&self, key: &str) -> CoreResult<bool> {
        self.delete(R::KIND, key)
    }

    /// Returns every record of a type, in key order.
    pub fn records<R: Record>(&self) -> CoreResult<Vec<R>> {
        self.query_records(|_: &R| true)
    }

    /// Returns every record of a type accepted by `predicate`, in key order.
    pub fn query_records<R, F>(&self, predicate: F) -> CoreResult<Vec<R>>
    where
        R: Record,
        F: Fn(&R) -> bool,
    {
        let index = self.index.read();
        let Some(records) = index.get(&R::KIND) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for bytes in records.values() {
            let record: R = from_cbor(bytes)?;
            if predicate(&record) {
                out.push(record);
            }
        }
        Ok(out)
    }

    /// Returns the current log size in bytes.
    pub fn log_size(&self) -> CoreResult<u64> {
        Ok(self.backend.lock().size()?)
    }

    /// Returns record counts and log size.
    pub fn stats(&self) -> CoreResult<StoreStats> {
        let records = RecordKind::ALL
            .iter()
            .map(|kind| (kind.as_str().to_string(), self.count(*kind)))
            .collect();
        Ok(StoreStats {
            records,
            log_bytes: self.log_size()?,
            read_only: self.is_read_only(),
        })
    }

    fn live_bytes(&self) -> u64 {
        self.index
            .read()
            .values()
            .flat_map(BTreeMap::iter)
            .map(|(key, value)| (key.len() + value.len()) as u64)
            .sum()
    }

    /// Returns true if the log has outgrown the threshold and is mostly
    /// superseded records.
    pub fn needs_compaction(&self) -> CoreResult<bool> {
        let size = self.log_size()?;
        Ok(size > self.config.compaction_threshold && size > 2 * self.live_bytes())
    }

    /// Rewrites the log as a single frame of live records.
    ///
    /// The new log replaces the old one atomically; a crash during
    /// compaction leaves the previous log intact.
    pub fn compact(&self) -> CoreResult<CompactionStats> {
        if self.is_read_only() {
            return Err(CoreError::storage_unavailable(
                "store is read-only after a failed write",
            ));
        }

        let mut backend = self.backend.lock();
        let bytes_before = backend.size()?;

        let entries: Vec<LogEntry> = self
            .index
            .read()
            .iter()
            .flat_map(|(kind, records)| {
                records.iter().map(|(key, value)| LogEntry::Put {
                    kind: *kind,
                    key: key.clone(),
                    value: value.clone(),
                })
            })
            .collect();
        let records = entries.len();

        let data = if entries.is_empty() {
            Vec::new()
        } else {
            encode_frame(&entries)?
        };
        backend.replace(&data)?;

        let stats = CompactionStats {
            bytes_before,
            bytes_after: data.len() as u64,
            records,
        };
        info!(
            bytes_before = stats.bytes_before,
            bytes_after = stats.bytes_after,
            records,
            "compacted record log"
        );
        Ok(stats)
    }
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("path", &self.path())
            .field("read_only", &self.is_read_only())
            .finish_non_exhaustive()
    }
}

fn apply(index: &mut Index, entries: Vec<LogEntry>) {
    for entry in entries {
        match entry {
            LogEntry::Put { kind, key, value } => {
                index.entry(kind).or_default().insert(key, value);
            }
            LogEntry::Delete { kind, key } => {
                if let Some(records) = index.get_mut(&kind) {
                    records.remove(&key);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tillsync_protocol::{EntityId, Session};

    fn reopen(backend: &InMemoryBackend) -> LocalStore {
        LocalStore::with_backend(Box::new(backend.clone()), StoreConfig::default()).unwrap()
    }

    #[test]
    fn put_get_delete() {
        let store = LocalStore::open_in_memory().unwrap();
        store.put(RecordKind::Order, "O-1", vec![1, 2]).unwrap();

        assert_eq!(store.get(RecordKind::Order, "O-1").unwrap(), vec![1, 2]);
        assert!(store.try_get(RecordKind::Session, "O-1").is_none());

        assert!(store.delete(RecordKind::Order, "O-1").unwrap());
        assert!(!store.delete(RecordKind::Order, "O-1").unwrap());
        assert!(matches!(
            store.get(RecordKind::Order, "O-1"),
            Err(CoreError::NotFound { kind: "order", .. })
        ));
    }

    #[test]
    fn query_filters_by_kind_and_predicate() {
        let store = LocalStore::open_in_memory().unwrap();
        store.put(RecordKind::Order, "a", vec![1]).unwrap();
        store.put(RecordKind::Order, "b", vec![2]).unwrap();
        store.put(RecordKind::Session, "c", vec![2]).unwrap();

        let hits = store.query(RecordKind::Order, |_, value| value == [2]);
        assert_eq!(hits, vec![("b".to_string(), vec![2])]);
        assert_eq!(store.count(RecordKind::Order), 2);
    }

    #[test]
    fn batches_survive_reopen() {
        let backend = InMemoryBackend::new();
        {
            let store = reopen(&backend);
            let mut batch = WriteBatch::new();
            batch.put(RecordKind::Session, "S-1", vec![1]);
            batch.put(RecordKind::Mutation, "0001", vec![2]);
            store.write_batch(batch).unwrap();
            store.delete(RecordKind::Mutation, "0001").unwrap();
        }

        let store = reopen(&backend);
        assert_eq!(store.get(RecordKind::Session, "S-1").unwrap(), vec![1]);
        assert!(!store.contains(RecordKind::Mutation, "0001"));
    }

    #[test]
    fn torn_batch_is_dropped_whole() {
        let backend = InMemoryBackend::new();
        {
            let store = reopen(&backend);
            store.put(RecordKind::Session, "kept", vec![1]).unwrap();
        }
        let intact = backend.data().len();

        let mut batch = WriteBatch::new();
        batch.put(RecordKind::Session, "torn-a", vec![2]);
        batch.put(RecordKind::Session, "torn-b", vec![3]);
        let frame = encode_frame(&batch.entries).unwrap();
        let mut data = backend.data();
        data.extend_from_slice(&frame[..frame.len() / 2]);
        let crashed = InMemoryBackend::with_data(data);

        let store = reopen(&crashed);
        assert!(store.contains(RecordKind::Session, "kept"));
        assert!(!store.contains(RecordKind::Session, "torn-a"));
        assert!(!store.contains(RecordKind::Session, "torn-b"));
        assert_eq!(store.log_size().unwrap(), intact as u64);
    }

    #[test]
    fn failed_write_degrades_to_read_only() {
        let backend = InMemoryBackend::new();
        let faults = backend.fault_switch();
        let store = reopen(&backend);
        store.put(RecordKind::Order, "O-1", vec![1]).unwrap();

        faults.fail_writes(true);
        let err = store.put(RecordKind::Order, "O-2", vec![2]).unwrap_err();
        assert!(err.is_storage_unavailable());
        assert!(store.is_read_only());

        faults.fail_writes(false);
        assert!(store.put(RecordKind::Order, "O-3", vec![3]).is_err());
        assert_eq!(store.get(RecordKind::Order, "O-1").unwrap(), vec![1]);
        assert!(!store.contains(RecordKind::Order, "O-2"));
    }

    #[test]
    fn typed_records() {
        let store = LocalStore::open_in_memory().unwrap();
        let session = Session::open(EntityId::temporary(), Some("T1".into()), 5);
        store.put_record(&session).unwrap();

        let loaded: Session = store.get_record(session.id.as_str()).unwrap().unwrap();
        assert_eq!(loaded, session);

        let open: Vec<Session> = store.query_records(|s: &Session| s.table.is_some()).unwrap();
        assert_eq!(open.len(), 1);
        assert!(store
            .get_record::<Session>("missing")
            .unwrap()
            .is_none());
    }

    #[test]
    fn compaction_keeps_live_records_only() {
        let backend = InMemoryBackend::new();
        let store = reopen(&backend);
        for i in 0..50u8 {
            store.put(RecordKind::Order, "hot", vec![i; 64]).unwrap();
        }
        store.put(RecordKind::Session, "S-1", vec![7]).unwrap();

        let stats = store.compact().unwrap();
        assert_eq!(stats.records, 2);
        assert!(stats.bytes_after < stats.bytes_before);
        drop(store);

        let store = reopen(&backend);
        assert_eq!(store.get(RecordKind::Order, "hot").unwrap(), vec![49; 64]);
        assert_eq!(store.get(RecordKind::Session, "S-1").unwrap(), vec![7]);
    }

    #[test]
    fn file_store_reopens() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("till");
        {
            let store = LocalStore::open(&path, StoreConfig::default()).unwrap();
            store.put(RecordKind::Alias, "tmp-1", vec![9]).unwrap();
            assert!(matches!(
                LocalStore::open(&path, StoreConfig::default()),
                Err(CoreError::Locked)
            ));
        }

        let store = LocalStore::open(&path, StoreConfig::default()).unwrap();
        assert_eq!(store.get(RecordKind::Alias, "tmp-1").unwrap(), vec![9]);
        assert_eq!(store.path(), Some(path.as_path()));
    }
}
