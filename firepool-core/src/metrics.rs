//! Metrics capability injected into the pool controller and VM manager.

use std::time::Duration;

use crate::runner::RunnerCounts;

/// Receiver for operational metrics.
///
/// Every hook defaults to a no-op so sinks only implement what they record.
/// Implementations must be cheap: hooks are called while the pool lock is held.
pub trait MetricsSink: Send + Sync {
    /// Configured scaling limits of a pool.
    fn pool_limits(&self, _pool: &str, _min: usize, _max: usize) {}

    /// Pool active (`true`) or paused (`false`).
    fn pool_active(&self, _pool: &str, _active: bool) {}

    /// Runner gauges, refreshed on every reconciliation pass.
    fn runner_counts(&self, _pool: &str, _counts: &RunnerCounts) {}

    fn scale_requested(&self, _pool: &str) {}

    fn scale_succeeded(&self, _pool: &str) {}

    fn scale_failed(&self, _pool: &str) {}

    /// A CI provider API call was issued.
    fn provider_request(&self, _pool: &str, _operation: &str) {}

    /// A CI provider API call failed.
    fn provider_error(&self, _pool: &str, _operation: &str) {}

    /// Time from spawn decision to a booted VM.
    fn vm_created(&self, _pool: &str, _elapsed: Duration) {}

    /// Time from spawn decision to VM exit.
    fn vm_lifetime(&self, _pool: &str, _elapsed: Duration) {}

    /// Time spent pulling a container image into the pool namespace.
    fn image_pulled(&self, _pool: &str, _elapsed: Duration) {}
}

/// Sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}
