//! Configuration for the sync worker.

use rand::Rng;
use std::time::Duration;
use tillsync_core::ReconciliationPolicy;

/// Configuration for the sync worker.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Terminal identifier, used in logs.
    pub device_id: String,
    /// How often the whole outbox is drained without a trigger.
    pub drain_interval: Duration,
    /// How often tracked tabs and orders are fetched and merged.
    pub snapshot_interval: Duration,
    /// Deadline for a single remote call.
    pub request_timeout: Duration,
    /// Maximum mutations sent from one stream per pass.
    pub stream_batch_size: usize,
    /// Capacity of the worker's command channel.
    pub command_capacity: usize,
    /// How snapshots are merged.
    pub policy: ReconciliationPolicy,
    /// Backoff for transient failures.
    pub retry: RetryConfig,
}

impl SyncConfig {
    /// Creates a configuration with defaults for a terminal.
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            drain_interval: Duration::from_secs(5),
            snapshot_interval: Duration::from_secs(15),
            request_timeout: Duration::from_secs(10),
            stream_batch_size: 64,
            command_capacity: 256,
            policy: ReconciliationPolicy::Defensive,
            retry: RetryConfig::default(),
        }
    }

    /// Sets the drain interval.
    pub fn with_drain_interval(mut self, interval: Duration) -> Self {
        self.drain_interval = interval;
        self
    }

    /// Sets the snapshot interval.
    pub fn with_snapshot_interval(mut self, interval: Duration) -> Self {
        self.snapshot_interval = interval;
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the per-stream batch size.
    pub fn with_stream_batch_size(mut self, size: usize) -> Self {
        self.stream_batch_size = size.max(1);
        self
    }

    /// Sets the reconciliation policy.
    pub fn with_policy(mut self, policy: ReconciliationPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("till")
    }
}

/// Backoff for transient failures.
///
/// There is no attempt limit: a mutation stays queued until the remote
/// answers, the delay just stops growing at `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Upper bound on the delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% random jitter.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a configuration without jitter.
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            backoff_multiplier: 2.0,
            add_jitter: false,
        }
    }

    /// Retries immediately. For tests.
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Calculates the delay after the given failed attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let delay_secs = base.min(self.max_delay.as_secs_f64());

        if self.add_jitter && delay_secs > 0.0 {
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(60)).with_jitter(true)
    }
}
