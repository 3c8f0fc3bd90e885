//! Configuration for the reference remote.

use std::time::Duration;

/// Configuration for [`ReferenceRemote`](crate::ReferenceRemote).
#[derive(Debug, Clone, Default)]
pub struct RemoteConfig {
    /// Delay added to every call.
    pub latency: Duration,
    /// When set, session and order totals are only refreshed by
    /// [`ReferenceRemote::recalculate`](crate::ReferenceRemote::recalculate),
    /// like a database trigger that runs behind the writes.
    pub lagging_totals: bool,
    /// Tax added on top of the subtotal, in basis points.
    pub tax_basis_points: i64,
}

impl RemoteConfig {
    /// Creates a configuration with no latency and immediate totals.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-call latency.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Enables lagging totals.
    pub fn with_lagging_totals(mut self, lagging: bool) -> Self {
        self.lagging_totals = lagging;
        self
    }

    /// Sets the tax rate in basis points.
    pub fn with_tax_basis_points(mut self, basis_points: i64) -> Self {
        self.tax_basis_points = basis_points;
        self
    }
}
