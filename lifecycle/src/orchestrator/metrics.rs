use commonware_runtime::Metrics as RuntimeMetrics;
use prometheus_client::metrics::counter::Counter;

/// Metrics for the [Orchestrator](super::Orchestrator).
#[derive(Clone, Default)]
pub struct Metrics {
    /// Number of sessions deployed and recorded
    pub deployments: Counter,
    /// Number of deployments that failed before anything was recorded
    pub deploy_failures: Counter,
    /// Number of deployments confirmed by the ledger but not recorded
    pub partial_failures: Counter,
    /// Number of deployments that lost the race to record a contract
    pub orphaned: Counter,
    /// Number of sessions ended
    pub ends: Counter,
    /// Number of sessions ended without confirmation from the ledger
    pub ledger_warnings: Counter,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given context.
    pub fn init<E: RuntimeMetrics>(context: &E) -> Self {
        let metrics = Self::default();
        context.register(
            "deployments",
            "Number of sessions deployed and recorded",
            metrics.deployments.clone(),
        );
        context.register(
            "deploy_failures",
            "Number of deployments that failed before anything was recorded",
            metrics.deploy_failures.clone(),
        );
        context.register(
            "partial_failures",
            "Number of deployments confirmed by the ledger but not recorded",
            metrics.partial_failures.clone(),
        );
        context.register(
            "orphaned",
            "Number of deployments that lost the race to record a contract",
            metrics.orphaned.clone(),
        );
        context.register("ends", "Number of sessions ended", metrics.ends.clone());
        context.register(
            "ledger_warnings",
            "Number of sessions ended without confirmation from the ledger",
            metrics.ledger_warnings.clone(),
        );
        metrics
    }
}
