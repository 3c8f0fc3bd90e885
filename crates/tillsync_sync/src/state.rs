//! Worker state and statistics.

use std::time::{Duration, Instant};

/// What the sync worker is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Nothing to send.
    Idle,
    /// Sending queued mutations.
    Draining,
    /// Fetching snapshots of tracked entities.
    Pulling,
    /// The last remote call failed transiently; queued work waits for its
    /// backoff or for connectivity to return.
    Offline,
    /// The worker has shut down.
    Stopped,
}

impl SyncState {
    /// Returns true while the worker is talking to the remote.
    pub fn is_active(&self) -> bool {
        matches!(self, SyncState::Draining | SyncState::Pulling)
    }
}

/// Counters over the worker's lifetime.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Completed drain passes.
    pub drain_passes: u64,
    /// Mutations handed to the remote.
    pub mutations_sent: u64,
    /// Mutations acknowledged, including "already applied" replies.
    pub mutations_acked: u64,
    /// Transient failures scheduled for retry.
    pub mutations_retried: u64,
    /// Mutations the remote refused.
    pub mutations_rejected: u64,
    /// Mutations dropped because their tab was closed.
    pub mutations_skipped: u64,
    /// Snapshots merged into the replica.
    pub snapshots_merged: u64,
    /// Snapshots ignored, for evicted or unknown entities.
    pub snapshots_ignored: u64,
    /// When the last drain pass finished.
    pub last_sync_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Outcome of one forced sync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Mutations handed to the remote.
    pub sent: u64,
    /// Mutations acknowledged.
    pub acked: u64,
    /// Mutations scheduled for retry.
    pub retried: u64,
    /// Mutations refused by the remote.
    pub rejected: u64,
    /// Mutations dropped as superseded.
    pub skipped: u64,
    /// Snapshots merged.
    pub snapshots_merged: u64,
    /// Wall time of the sync.
    pub duration: Duration,
}

impl SyncReport {
    /// Adds `other`'s counters to this report.
    pub fn absorb(&mut self, other: &SyncReport) {
        self.sent += other.sent;
        self.acked += other.acked;
        self.retried += other.retried;
        self.rejected += other.rejected;
        self.skipped += other.skipped;
        self.snapshots_merged += other.snapshots_merged;
    }

    /// Returns true if every sent mutation was acknowledged.
    pub fn is_clean(&self) -> bool {
        self.retried == 0 && self.rejected == 0
    }
}

impl SyncStats {
    pub(crate) fn record(&mut self, report: &SyncReport) {
        self.mutations_sent += report.sent;
        self.mutations_acked += report.acked;
        self.mutations_retried += report.retried;
        self.mutations_rejected += report.rejected;
        self.mutations_skipped += report.skipped;
        self.snapshots_merged += report.snapshots_merged;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_state_checks() {
        assert!(SyncState::Draining.is_active());
        assert!(SyncState::Pulling.is_active());
        assert!(!SyncState::Idle.is_active());
        assert!(!SyncState::Offline.is_active());
    }

    #[test]
    fn reports_accumulate_into_stats() {
        let mut total = SyncReport::default();
        total.absorb(&SyncReport {
            sent: 3,
            acked: 2,
            retried: 1,
            ..SyncReport::default()
        });
        total.absorb(&SyncReport {
            sent: 1,
            acked: 1,
            ..SyncReport::default()
        });
        assert_eq!(total.sent, 4);
        assert!(!total.is_clean());

        let mut stats = SyncStats::default();
        stats.record(&total);
        assert_eq!(stats.mutations_acked, 3);
        assert_eq!(stats.mutations_retried, 1);
    }
}
