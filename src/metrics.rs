use std::sync::Arc;

use prometheus_client::metrics::counter::Counter;
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every metric exposed by the coordination layer.
pub struct Metrics {
    // -- segment leads --
    pub lead_acquisitions: Counter,
    pub lead_conflicts: Counter,
    pub lead_renewal_failures: Counter,
    pub lead_releases: Counter,

    // -- node locks --
    pub node_lock_acquisitions: Counter,
    pub node_lock_conflicts: Counter,
    pub node_lock_releases: Counter,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let lead_acquisitions = Counter::default();
        registry.register(
            "scythe_lead_acquisitions_total",
            "Segment leads taken by this instance",
            lead_acquisitions.clone(),
        );

        let lead_conflicts = Counter::default();
        registry.register(
            "scythe_lead_conflicts_total",
            "Segment lead attempts lost to a peer",
            lead_conflicts.clone(),
        );

        let lead_renewal_failures = Counter::default();
        registry.register(
            "scythe_lead_renewal_failures_total",
            "Segment lead renewals that found the lease gone or stolen",
            lead_renewal_failures.clone(),
        );

        let lead_releases = Counter::default();
        registry.register(
            "scythe_lead_releases_total",
            "Segment leads released explicitly",
            lead_releases.clone(),
        );

        let node_lock_acquisitions = Counter::default();
        registry.register(
            "scythe_node_lock_acquisitions_total",
            "Replica-set lock batches applied",
            node_lock_acquisitions.clone(),
        );

        let node_lock_conflicts = Counter::default();
        registry.register(
            "scythe_node_lock_conflicts_total",
            "Replica-set lock batches blocked by a peer",
            node_lock_conflicts.clone(),
        );

        let node_lock_releases = Counter::default();
        registry.register(
            "scythe_node_lock_releases_total",
            "Replica-set lock batches released explicitly",
            node_lock_releases.clone(),
        );

        Self {
            lead_acquisitions,
            lead_conflicts,
            lead_renewal_failures,
            lead_releases,
            node_lock_acquisitions,
            node_lock_conflicts,
            node_lock_releases,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper bundling the registry with the pre-registered
/// coordination metrics.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all coordination metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }
}
