use commonware_runtime::Metrics as RuntimeMetrics;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};

/// Metrics for the [Reconciler](super::Reconciler).
#[derive(Clone, Default)]
pub struct Metrics {
    /// Number of tallies read from the ledger and stored
    pub synced: Counter,
    /// Number of syncs skipped because the session was not live
    pub skipped: Counter,
    /// Number of tallies discarded because a newer one was stored
    pub stale: Counter,
    /// Number of failed syncs
    pub failed: Counter,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given context.
    pub fn init<E: RuntimeMetrics>(context: &E) -> Self {
        let metrics = Self::default();
        context.register(
            "synced",
            "Number of tallies read from the ledger and stored",
            metrics.synced.clone(),
        );
        context.register(
            "skipped",
            "Number of syncs skipped because the session was not live",
            metrics.skipped.clone(),
        );
        context.register(
            "stale",
            "Number of tallies discarded because a newer one was stored",
            metrics.stale.clone(),
        );
        context.register("failed", "Number of failed syncs", metrics.failed.clone());
        metrics
    }
}

/// Metrics for the [Engine](super::Engine).
#[derive(Clone, Default)]
pub struct EngineMetrics {
    /// Number of sessions synced on an interval
    pub tracked: Gauge,
    /// Number of scheduled syncs deferred to respect the minimum spacing
    pub deferred: Counter,
}

impl EngineMetrics {
    /// Create and return a new set of metrics, registered with the given context.
    pub fn init<E: RuntimeMetrics>(context: &E) -> Self {
        let metrics = Self::default();
        context.register(
            "tracked",
            "Number of sessions synced on an interval",
            metrics.tracked.clone(),
        );
        context.register(
            "deferred",
            "Number of scheduled syncs deferred to respect the minimum spacing",
            metrics.deferred.clone(),
        );
        metrics
    }
}
