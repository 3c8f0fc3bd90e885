//! Store configuration.

use std::time::Duration;
use tillsync_protocol::MAX_ITEMS_PER_ORDER;

/// Configuration for opening a [`LocalStore`](crate::LocalStore) and the
/// [`Till`](crate::Till) built on it.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Whether to create the store directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Whether to sync the record log after every batch.
    pub sync_on_write: bool,

    /// How long evicted session ids stay on the deny-list.
    pub evicted_retention: Duration,

    /// Log size above which opening the store compacts it.
    pub compaction_threshold: u64,

    /// Upper bound on line items per order.
    pub max_items_per_order: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            sync_on_write: true,
            evicted_retention: Duration::from_secs(24 * 60 * 60),
            compaction_threshold: 8 * 1024 * 1024, // 8 MB
            max_items_per_order: MAX_ITEMS_PER_ORDER,
        }
    }
}

impl StoreConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the store if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether to sync the log on every batch.
    #[must_use]
    pub const fn sync_on_write(mut self, value: bool) -> Self {
        self.sync_on_write = value;
        self
    }

    /// Sets the deny-list retention window.
    #[must_use]
    pub const fn evicted_retention(mut self, retention: Duration) -> Self {
        self.evicted_retention = retention;
        self
    }

    /// Sets the compaction threshold in bytes.
    #[must_use]
    pub const fn compaction_threshold(mut self, bytes: u64) -> Self {
        self.compaction_threshold = bytes;
        self
    }

    /// Sets the per-order line item limit.
    #[must_use]
    pub const fn max_items_per_order(mut self, max: usize) -> Self {
        self.max_items_per_order = max;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = StoreConfig::default();
        assert!(config.create_if_missing);
        assert!(config.sync_on_write);
        assert_eq!(config.evicted_retention, Duration::from_secs(86_400));
        assert_eq!(config.max_items_per_order, 200);
    }

    #[test]
    fn builder_pattern() {
        let config = StoreConfig::new()
            .sync_on_write(false)
            .evicted_retention(Duration::from_secs(60))
            .max_items_per_order(3);

        assert!(!config.sync_on_write);
        assert_eq!(config.evicted_retention, Duration::from_secs(60));
        assert_eq!(config.max_items_per_order, 3);
    }
}
