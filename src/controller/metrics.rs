//! Self-metrics of the controller.

use prometheus::{IntCounter, IntGauge, Opts, Registry};

/// Controller metrics, registered on the operator-provided registry.
#[derive(Clone)]
pub(crate) struct ControllerMetrics {
    /// Number of component workers currently running.
    pub running_components: IntGauge,
    /// Total number of component workers started. A reload that restarts no
    /// worker leaves this unchanged.
    pub started_components: IntCounter,
    /// Total number of component evaluations performed.
    pub evaluations: IntCounter,
    /// Number of nodes currently waiting for re-evaluation.
    pub queue_size: IntGauge,
}

impl ControllerMetrics {
    pub fn register(registry: &Registry) -> anyhow::Result<Self> {
        let running_components = IntGauge::with_opts(Opts::new(
            "rill_controller_running_components",
            "Number of component workers currently running",
        ))?;
        let started_components = IntCounter::with_opts(Opts::new(
            "rill_controller_started_components_total",
            "Total number of component workers started",
        ))?;
        let evaluations = IntCounter::with_opts(Opts::new(
            "rill_controller_evaluations_total",
            "Total number of component evaluations performed",
        ))?;
        let queue_size = IntGauge::with_opts(Opts::new(
            "rill_controller_queue_size",
            "Number of nodes waiting for re-evaluation",
        ))?;

        registry.register(Box::new(running_components.clone()))?;
        registry.register(Box::new(started_components.clone()))?;
        registry.register(Box::new(evaluations.clone()))?;
        registry.register(Box::new(queue_size.clone()))?;

        Ok(Self {
            running_components,
            started_components,
            evaluations,
            queue_size,
        })
    }
}
