//! The sync worker actor.
//!
//! One tokio task owns every network await. It is fed by a command channel
//! (enqueue notifications from the till, connectivity changes, forced syncs)
//! and by two timers: a drain timer sweeping the whole outbox and a
//! snapshot timer fetching tracked tabs and orders. All sync state is
//! mutated inside the task only.

use crate::applier::{Prepared, ReplicaApplier};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::state::{SyncReport, SyncState, SyncStats};
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tillsync_core::{now_millis, Housekeeping, MutationRecord, MutationState, Till};
use tillsync_protocol::{dispatch, EntityStream, RemoteApi, RemoteError};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

enum Command {
    Enqueued(EntityStream),
    ConnectivityRestored,
    ForceSync(oneshot::Sender<SyncResult<SyncReport>>),
    Shutdown,
}

/// Drains the outbox and merges remote snapshots.
pub struct SyncWorker {
    config: SyncConfig,
    till: Arc<Till>,
    remote: Arc<dyn RemoteApi>,
    applier: ReplicaApplier,
    commands: mpsc::Receiver<Command>,
    state: watch::Sender<SyncState>,
    stats: Arc<RwLock<SyncStats>>,
}

impl SyncWorker {
    /// Starts the worker on the current tokio runtime.
    ///
    /// The till's enqueue listener is replaced so every intent wakes the
    /// worker for an eager send.
    pub fn spawn(till: Arc<Till>, remote: Arc<dyn RemoteApi>, config: SyncConfig) -> SyncHandle {
        let (tx, rx) = mpsc::channel(config.command_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(SyncState::Idle);
        let stats = Arc::new(RwLock::new(SyncStats::default()));

        let notify = tx.clone();
        till.set_enqueue_listener(Arc::new(move |stream: &EntityStream| {
            // A full channel is fine: the drain timer picks the stream up.
            let _ = notify.try_send(Command::Enqueued(stream.clone()));
        }));

        let worker = SyncWorker {
            applier: ReplicaApplier::new(Arc::clone(&till), config.policy),
            config,
            till,
            remote,
            commands: rx,
            state: state_tx,
            stats: Arc::clone(&stats),
        };
        info!(device = %worker.config.device_id, "starting sync worker");
        let task = tokio::spawn(worker.run());

        SyncHandle {
            commands: tx,
            state: state_rx,
            stats,
            task: Some(task),
        }
    }

    async fn run(mut self) {
        let mut drain = tokio::time::interval(self.config.drain_interval);
        drain.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut snapshots = tokio::time::interval(self.config.snapshot_interval);
        snapshots.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Enqueued(stream)) => {
                        let before = self.set_state(SyncState::Draining);
                        let mut report = SyncReport::default();
                        let result = self.drain_stream(&stream, &mut report).await;
                        self.log_failure(result);
                        self.finish_pass(&report, before);
                    }
                    Some(Command::ConnectivityRestored) => {
                        info!("connectivity restored");
                        self.log_failure(self.release_backoff().map(|_| ()));
                        let result = self.drain_all().await.map(|_| ());
                        self.log_failure(result);
                    }
                    Some(Command::ForceSync(reply)) => {
                        let result = self.sync_now().await;
                        let _ = reply.send(result);
                    }
                    Some(Command::Shutdown) | None => break,
                },
                _ = drain.tick() => {
                    let result = self.drain_all().await.map(|_| ());
                    self.log_failure(result);
                }
                _ = snapshots.tick() => {
                    let result = self.pull_snapshots().await.map(|_| ());
                    self.log_failure(result);
                    let result = self
                        .till
                        .housekeeping()
                        .map(|report| {
                            if report != Housekeeping::default() {
                                debug!(?report, "housekeeping");
                            }
                        })
                        .map_err(SyncError::from);
                    self.log_failure(result);
                }
            }
        }

        self.set_state(SyncState::Stopped);
        info!(device = %self.config.device_id, "sync worker stopped");
    }

    /// Publishes `state` and returns the previous one.
    fn set_state(&self, state: SyncState) -> SyncState {
        self.state.send_replace(state)
    }

    fn log_failure(&self, result: SyncResult<()>) {
        if let Err(err) = result {
            warn!(error = %err, "sync pass failed");
            self.stats.write().last_error = Some(err.to_string());
        }
    }

    /// A pass that sent nothing keeps an earlier Offline state: its
    /// streams are still waiting out their backoff.
    fn finish_pass(&self, report: &SyncReport, before: SyncState) {
        {
            let mut stats = self.stats.write();
            stats.record(report);
            stats.drain_passes += 1;
            stats.last_sync_time = Some(Instant::now());
        }
        let offline =
            report.retried > 0 || (report.sent == 0 && before == SyncState::Offline);
        self.set_state(if offline {
            SyncState::Offline
        } else {
            SyncState::Idle
        });
    }

    /// Moves every backed-off mutation back to Pending.
    fn release_backoff(&self) -> SyncResult<usize> {
        Ok(self.till.outbox().promote_due(u64::MAX)?)
    }

    async fn sync_now(&self) -> SyncResult<SyncReport> {
        let started = Instant::now();
        self.release_backoff()?;
        let mut report = self.drain_all().await?;
        let pulled = self.pull_snapshots().await?;
        report.absorb(&pulled);
        report.duration = started.elapsed();
        Ok(report)
    }

    async fn drain_all(&self) -> SyncResult<SyncReport> {
        self.till.outbox().promote_due(now_millis())?;
        let streams = self.till.outbox().streams()?;
        if streams.is_empty() {
            if *self.state.borrow() != SyncState::Offline {
                self.set_state(SyncState::Idle);
            }
            return Ok(SyncReport::default());
        }

        let before = self.set_state(SyncState::Draining);
        let mut report = SyncReport::default();
        let mut outcome = Ok(());
        for stream in streams {
            if let Err(err) = self.drain_stream(&stream, &mut report).await {
                outcome = Err(err);
                break;
            }
        }
        self.finish_pass(&report, before);
        outcome.map(|()| report)
    }

    /// Sends the head of `stream` until it is empty, blocked by a backoff,
    /// or the batch limit is reached.
    async fn drain_stream(
        &self,
        stream: &EntityStream,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        for _ in 0..self.config.stream_batch_size {
            let Some(record) = self.till.outbox().next_batch(stream, 1)?.pop() else {
                // A tab closed remotely while work was queued is kept until
                // that work has been skipped.
                if self.till.evict_if_closed(stream)? {
                    info!(%stream, "evicted tab closed on the remote");
                }
                return Ok(());
            };
            if record.state != MutationState::Pending {
                debug!(%stream, mutation = %record.id, state = ?record.state, "stream blocked");
                return Ok(());
            }

            let operation = match self.applier.prepare(&record)? {
                Prepared::Send(operation) => operation,
                Prepared::Skip(reason) => {
                    self.till.outbox().mark_skipped(record.id, &reason)?;
                    report.skipped += 1;
                    continue;
                }
                Prepared::Reject(reason) => {
                    self.till.outbox().mark_permanent(record.id, &reason)?;
                    report.rejected += 1;
                    continue;
                }
            };

            let record = self.till.outbox().mark_in_flight(record.id)?;
            report.sent += 1;
            let call = dispatch(self.remote.as_ref(), &record.idempotency_key, &operation);
            match self.with_timeout(call).await {
                Ok(reply) => {
                    let applied = self.applier.apply_reply(&record, &reply)?;
                    report.acked += 1;
                    report.skipped += applied.skipped;
                    report.snapshots_merged += applied.snapshots_merged;
                }
                Err(err) if err.is_transient() => {
                    self.schedule_retry(&record, &err)?;
                    report.retried += 1;
                    return Ok(());
                }
                Err(err) => {
                    let reason = match err {
                        RemoteError::Rejected { reason } => reason,
                        other => other.to_string(),
                    };
                    self.till.outbox().mark_permanent(record.id, &reason)?;
                    report.rejected += 1;
                }
            }
        }
        Ok(())
    }

    fn schedule_retry(&self, record: &MutationRecord, err: &RemoteError) -> SyncResult<()> {
        let delay = self.config.retry.delay_for_attempt(record.attempts);
        debug!(
            mutation = %record.id,
            attempts = record.attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "remote unavailable, backing off"
        );
        self.till
            .outbox()
            .mark_retryable(record.id, delay, now_millis(), &err.to_string())?;
        Ok(())
    }

    async fn with_timeout<T>(
        &self,
        call: impl Future<Output = Result<T, RemoteError>>,
    ) -> Result<T, RemoteError> {
        match tokio::time::timeout(self.config.request_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout),
        }
    }

    /// Fetches every tracked tab and order and merges what came back.
    async fn pull_snapshots(&self) -> SyncResult<SyncReport> {
        let (sessions, orders) = self.applier.tracked()?;
        let mut report = SyncReport::default();
        if sessions.is_empty() && orders.is_empty() {
            return Ok(report);
        }

        let before = self.set_state(SyncState::Pulling);
        let mut ignored = 0u64;
        for id in &sessions {
            match self.with_timeout(self.remote.fetch_session(id)).await {
                Ok(Some(snapshot)) => {
                    if self.applier.apply_session_snapshot(&snapshot)? {
                        report.snapshots_merged += 1;
                    } else {
                        ignored += 1;
                    }
                }
                Ok(None) => ignored += 1,
                Err(err) if err.is_transient() => {
                    self.set_state(SyncState::Offline);
                    return Err(err.into());
                }
                Err(err) => warn!(session = %id, error = %err, "snapshot refused"),
            }
        }
        for id in &orders {
            match self.with_timeout(self.remote.fetch_order(id)).await {
                Ok(Some(snapshot)) => {
                    if self.applier.apply_order_snapshot(&snapshot)? {
                        report.snapshots_merged += 1;
                    } else {
                        ignored += 1;
                    }
                }
                Ok(None) => ignored += 1,
                Err(err) if err.is_transient() => {
                    self.set_state(SyncState::Offline);
                    return Err(err.into());
                }
                Err(err) => warn!(order = %id, error = %err, "snapshot refused"),
            }
        }

        {
            let mut stats = self.stats.write();
            stats.snapshots_merged += report.snapshots_merged;
            stats.snapshots_ignored += ignored;
        }
        let backed_off = before == SyncState::Offline && self.till.pending_mutations() > 0;
        self.set_state(if backed_off {
            SyncState::Offline
        } else {
            SyncState::Idle
        });
        Ok(report)
    }
}

/// Handle to a running [`SyncWorker`].
#[derive(Debug)]
pub struct SyncHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<SyncState>,
    stats: Arc<RwLock<SyncStats>>,
    task: Option<JoinHandle<()>>,
}

impl SyncHandle {
    /// Drains the outbox now, ignoring backoff deadlines, then pulls
    /// snapshots.
    pub async fn force_sync(&self) -> SyncResult<SyncReport> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::ForceSync(tx))
            .await
            .map_err(|_| SyncError::WorkerStopped)?;
        rx.await.map_err(|_| SyncError::WorkerStopped)?
    }

    /// Tells the worker the network is back.
    pub async fn connectivity_restored(&self) -> SyncResult<()> {
        self.commands
            .send(Command::ConnectivityRestored)
            .await
            .map_err(|_| SyncError::WorkerStopped)
    }

    /// Returns the current state.
    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    /// Returns a receiver that observes state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.state.clone()
    }

    /// Returns a copy of the counters.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Stops the worker and waits for it to exit.
    pub async fn shutdown(mut self) {
        let _ = self.commands.send(Command::Shutdown).await;
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(error = %err, "sync worker task failed");
            }
        }
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Enqueued(stream) => f.debug_tuple("Enqueued").field(stream).finish(),
            Command::ConnectivityRestored => f.write_str("ConnectivityRestored"),
            Command::ForceSync(_) => f.write_str("ForceSync"),
            Command::Shutdown => f.write_str("Shutdown"),
        }
    }
}
