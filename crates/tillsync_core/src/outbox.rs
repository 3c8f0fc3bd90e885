//! Durable queue of operations awaiting remote acknowledgement.
//!
//! ```text
//! Pending → InFlight → Acked                (deleted)
//!                    → Retryable → Pending  (after backoff)
//!                    → Permanent            (deleted, reported)
//! ```
//!
//! Records are keyed by a zero-padded, monotonically increasing id so key
//! order is creation order. Delivery order is FIFO per [`EntityStream`];
//! nothing is ordered across streams.

use crate::error::{CoreError, CoreResult};
use crate::log::RecordKind;
use crate::record::Record;
use crate::store::{LocalStore, WriteBatch};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tillsync_protocol::{EntityId, EntityStream, Operation, OperationType};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Identifier of an outbox record.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MutationId(u64);

impl MutationId {
    /// Wraps a raw id.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw id.
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Store key; zero padded so key order is id order.
    pub fn key(self) -> String {
        format!("{:020}", self.0)
    }
}

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// Delivery state of a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationState {
    /// Waiting to be sent.
    Pending,
    /// Sent, no answer yet.
    InFlight,
    /// Confirmed by the remote.
    Acked,
    /// Failed transiently; waiting for its backoff deadline.
    Retryable,
    /// Rejected by the remote.
    Permanent,
}

/// An outbox entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationRecord {
    /// Record id.
    pub id: MutationId,
    /// Delivery stream.
    pub stream: EntityStream,
    /// The operation, with the ids known at enqueue time.
    pub operation: Operation,
    /// Sent with every attempt so the remote can deduplicate.
    pub idempotency_key: String,
    /// Unix milliseconds at enqueue.
    pub created_at: u64,
    /// Delivery state.
    pub state: MutationState,
    /// Number of send attempts.
    pub attempts: u32,
    /// Unix milliseconds before which a retry must not start.
    pub not_before: Option<u64>,
    /// Last failure text.
    pub last_error: Option<String>,
}

impl MutationRecord {
    /// Returns true if the record may be sent at `now`.
    pub fn is_due(&self, now: u64) -> bool {
        match self.state {
            MutationState::Pending => true,
            MutationState::Retryable => self.not_before.map_or(true, |t| t <= now),
            _ => false,
        }
    }
}

impl Record for MutationRecord {
    const KIND: RecordKind = RecordKind::Mutation;

    fn key(&self) -> String {
        self.id.key()
    }
}

/// A mutation the remote refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermanentFailure {
    /// The removed mutation.
    pub mutation: MutationRecord,
    /// Remote reason.
    pub reason: String,
}

impl PermanentFailure {
    /// Operation type of the failed mutation.
    pub fn operation(&self) -> OperationType {
        self.mutation.operation.op_type()
    }

    /// Text suitable for showing to staff.
    pub fn message(&self) -> String {
        let target = self
            .mutation
            .operation
            .touches()
            .first()
            .map(|id| id.to_string())
            .unwrap_or_default();
        format!(
            "The server refused {} for {}: {}. The local change was kept but will not be synced; \
             review the tab and re-enter it if needed.",
            self.operation(),
            target,
            self.reason
        )
    }
}

/// Receives mutations the remote refused.
pub trait ErrorSink: Send + Sync {
    /// Reports one refused mutation.
    fn report(&self, failure: &PermanentFailure);
}

/// Logs refused mutations.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ErrorSink for TracingSink {
    fn report(&self, failure: &PermanentFailure) {
        warn!(
            mutation = %failure.mutation.id,
            stream = %failure.mutation.stream,
            operation = %failure.operation(),
            reason = %failure.reason,
            "mutation permanently rejected"
        );
    }
}

/// Keeps refused mutations in memory for display.
#[derive(Debug, Default)]
pub struct CollectingSink {
    failures: Mutex<Vec<PermanentFailure>>,
}

impl CollectingSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns everything reported so far.
    pub fn failures(&self) -> Vec<PermanentFailure> {
        self.failures.lock().clone()
    }

    /// Removes and returns everything reported so far.
    pub fn drain(&self) -> Vec<PermanentFailure> {
        std::mem::take(&mut *self.failures.lock())
    }
}

impl ErrorSink for CollectingSink {
    fn report(&self, failure: &PermanentFailure) {
        self.failures.lock().push(failure.clone());
    }
}

/// The mutation outbox.
pub struct MutationOutbox {
    store: Arc<LocalStore>,
    next_id: AtomicU64,
    sink: RwLock<Arc<dyn ErrorSink>>,
    degraded: RwLock<HashSet<EntityStream>>,
    // Serializes read-modify-write of a single record.
    update: Mutex<()>,
}

impl MutationOutbox {
    /// Opens the outbox over a store.
    ///
    /// Records left InFlight by a crash are returned to Pending: the remote
    /// may or may not have applied them, and the idempotency key makes a
    /// resend safe.
    pub fn open(store: Arc<LocalStore>) -> CoreResult<Self> {
        let records: Vec<MutationRecord> = store.records()?;
        let next_id = records.last().map_or(1, |r| r.id.as_u64() + 1);

        let mut batch = WriteBatch::new();
        for mut record in records
            .into_iter()
            .filter(|r| r.state == MutationState::InFlight)
        {
            record.state = MutationState::Pending;
            batch.put_record(&record)?;
        }
        if !batch.is_empty() {
            info!(count = batch.len(), "requeued in-flight mutations");
            store.write_batch(batch)?;
        }

        Ok(Self {
            store,
            next_id: AtomicU64::new(next_id),
            sink: RwLock::new(Arc::new(TracingSink)),
            degraded: RwLock::new(HashSet::new()),
            update: Mutex::new(()),
        })
    }

    /// Replaces the sink that receives refused mutations.
    pub fn set_error_sink(&self, sink: Arc<dyn ErrorSink>) {
        *self.sink.write() = sink;
    }

    /// Builds a Pending record without persisting it.
    ///
    /// The caller writes it with [`WriteBatch::put_record`] in the same batch
    /// as the entity change it describes.
    pub fn stage(&self, stream: EntityStream, operation: Operation, now: u64) -> MutationRecord {
        let id = MutationId(self.next_id.fetch_add(1, Ordering::AcqRel));
        MutationRecord {
            id,
            stream,
            operation,
            idempotency_key: Uuid::new_v4().to_string(),
            created_at: now,
            state: MutationState::Pending,
            attempts: 0,
            not_before: None,
            last_error: None,
        }
    }

    /// Persists a new Pending record.
    pub fn enqueue(
        &self,
        stream: EntityStream,
        operation: Operation,
        now: u64,
    ) -> CoreResult<MutationId> {
        let record = self.stage(stream, operation, now);
        self.store.put_record(&record)?;
        debug!(mutation = %record.id, stream = %record.stream, "enqueued mutation");
        Ok(record.id)
    }

    /// Reads one record.
    pub fn get(&self, id: MutationId) -> CoreResult<Option<MutationRecord>> {
        self.store.get_record(&id.key())
    }

    /// Returns every record, in creation order.
    pub fn all(&self) -> CoreResult<Vec<MutationRecord>> {
        self.store.records()
    }

    /// Returns up to `limit` records of a stream, in creation order.
    ///
    /// The head of the stream comes first whatever its state; a stream is
    /// blocked while its head is not due.
    pub fn next_batch(&self, stream: &EntityStream, limit: usize) -> CoreResult<Vec<MutationRecord>> {
        let mut records = self
            .store
            .query_records(|r: &MutationRecord| &r.stream == stream)?;
        records.truncate(limit);
        Ok(records)
    }

    /// Returns every stream with queued work, ordered by its oldest record.
    pub fn streams(&self) -> CoreResult<Vec<EntityStream>> {
        let mut seen = HashSet::new();
        Ok(self
            .all()?
            .into_iter()
            .filter_map(|r| seen.insert(r.stream.clone()).then_some(r.stream))
            .collect())
    }

    /// Returns the number of queued records.
    pub fn pending_count(&self) -> usize {
        self.store.count(RecordKind::Mutation)
    }

    /// Returns the number of queued records per stream.
    pub fn pending_by_stream(&self) -> CoreResult<BTreeMap<EntityStream, usize>> {
        let mut counts = BTreeMap::new();
        for record in self.all()? {
            *counts.entry(record.stream).or_insert(0) += 1;
        }
        Ok(counts)
    }

    /// Returns true if any queued record references `id`.
    pub fn outstanding_for(&self, id: &EntityId) -> CoreResult<bool> {
        Ok(!self
            .store
            .query_records(|r: &MutationRecord| r.operation.touches().contains(&id))?
            .is_empty())
    }

    /// Returns true if the stream has queued records.
    pub fn has_outstanding(&self, stream: &EntityStream) -> CoreResult<bool> {
        Ok(!self.next_batch(stream, 1)?.is_empty())
    }

    fn update<F>(&self, id: MutationId, change: F) -> CoreResult<MutationRecord>
    where
        F: FnOnce(&mut MutationRecord),
    {
        let _guard = self.update.lock();
        let mut record = self
            .get(id)?
            .ok_or_else(|| CoreError::not_found("mutation", id.to_string()))?;
        change(&mut record);
        self.store.put_record(&record)?;
        Ok(record)
    }

    fn remove(&self, id: MutationId) -> CoreResult<MutationRecord> {
        let _guard = self.update.lock();
        let record = self
            .get(id)?
            .ok_or_else(|| CoreError::not_found("mutation", id.to_string()))?;
        self.store.delete(RecordKind::Mutation, &id.key())?;
        Ok(record)
    }

    /// Marks a record as sent and counts the attempt.
    pub fn mark_in_flight(&self, id: MutationId) -> CoreResult<MutationRecord> {
        self.update(id, |r| {
            r.state = MutationState::InFlight;
            r.attempts += 1;
        })
    }

    /// Removes an acknowledged record.
    pub fn mark_acked(&self, id: MutationId) -> CoreResult<MutationRecord> {
        let mut record = self.remove(id)?;
        record.state = MutationState::Acked;
        debug!(mutation = %id, attempts = record.attempts, "mutation acknowledged");
        Ok(record)
    }

    /// Schedules a retry after `delay`.
    pub fn mark_retryable(
        &self,
        id: MutationId,
        delay: Duration,
        now: u64,
        error: &str,
    ) -> CoreResult<MutationRecord> {
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.update(id, |r| {
            r.state = MutationState::Retryable;
            r.not_before = Some(now.saturating_add(delay_ms));
            r.last_error = Some(error.to_string());
        })
    }

    /// Returns Retryable records whose deadline has passed to Pending.
    pub fn promote_due(&self, now: u64) -> CoreResult<usize> {
        let _guard = self.update.lock();
        let due = self.store.query_records(|r: &MutationRecord| {
            r.state == MutationState::Retryable && r.not_before.map_or(true, |t| t <= now)
        })?;
        let mut batch = WriteBatch::new();
        for mut record in due {
            record.state = MutationState::Pending;
            record.not_before = None;
            batch.put_record(&record)?;
        }
        let promoted = batch.len();
        self.store.write_batch(batch)?;
        Ok(promoted)
    }

    /// Removes a refused record, flags its stream and reports it.
    pub fn mark_permanent(&self, id: MutationId, reason: &str) -> CoreResult<PermanentFailure> {
        let mut record = self.remove(id)?;
        record.state = MutationState::Permanent;
        record.last_error = Some(reason.to_string());
        self.degraded.write().insert(record.stream.clone());

        let failure = PermanentFailure {
            mutation: record,
            reason: reason.to_string(),
        };
        let sink = Arc::clone(&self.sink.read());
        sink.report(&failure);
        Ok(failure)
    }

    /// Removes a record that no longer needs delivering.
    pub fn mark_skipped(&self, id: MutationId, reason: &str) -> CoreResult<MutationRecord> {
        let record = self.remove(id)?;
        debug!(
            mutation = %id,
            operation = %record.operation.op_type(),
            reason,
            "skipped superseded mutation"
        );
        Ok(record)
    }

    /// Returns true if a mutation on the stream was refused.
    pub fn is_degraded(&self, stream: &EntityStream) -> bool {
        self.degraded.read().contains(stream)
    }

    /// Returns every degraded stream.
    pub fn degraded_streams(&self) -> Vec<EntityStream> {
        let mut streams: Vec<_> = self.degraded.read().iter().cloned().collect();
        streams.sort();
        streams
    }

    /// Clears the degraded flag once staff reviewed the stream.
    pub fn clear_degraded(&self, stream: &EntityStream) -> bool {
        self.degraded.write().remove(stream)
    }
}

impl fmt::Debug for MutationOutbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationOutbox")
            .field("pending", &self.pending_count())
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
