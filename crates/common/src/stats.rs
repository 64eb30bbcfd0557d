use std::sync::Arc;

use crate::metrics::MetricsRegistry;

/// Per-stage statistics sink threaded through plugin invocations.
///
/// The engine only reports counts; it never reads them back. Implementations
/// must be safe to call from sink worker threads.
pub trait StageStatisticsCollector: Send + Sync {
    /// Counts records entering the stage.
    fn inc_records_in(&self, n: u64);
    /// Counts records emitted as normal or port output.
    fn inc_records_out(&self, n: u64);
    /// Counts error records emitted by the stage.
    fn inc_errors(&self, n: u64);
    /// Counts alerts emitted by the stage.
    fn inc_alerts(&self, n: u64);
}

/// Collector used for stages that have no statistics configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStageStatisticsCollector;

impl StageStatisticsCollector for NoopStageStatisticsCollector {
    fn inc_records_in(&self, _n: u64) {}
    fn inc_records_out(&self, _n: u64) {}
    fn inc_errors(&self, _n: u64) {}
    fn inc_alerts(&self, _n: u64) {}
}

/// Collector backed by a [`MetricsRegistry`], labeled by run and stage.
#[derive(Debug, Clone)]
pub struct MetricsStageStatisticsCollector {
    registry: MetricsRegistry,
    run_id: Arc<str>,
    stage: Arc<str>,
}

impl MetricsStageStatisticsCollector {
    /// Creates a collector reporting into `registry` under the given labels.
    pub fn new(registry: MetricsRegistry, run_id: &str, stage: &str) -> Self {
        Self {
            registry,
            run_id: Arc::from(run_id),
            stage: Arc::from(stage),
        }
    }
}

impl StageStatisticsCollector for MetricsStageStatisticsCollector {
    fn inc_records_in(&self, n: u64) {
        self.registry
            .inc_stage_records_in(&self.run_id, &self.stage, n);
    }

    fn inc_records_out(&self, n: u64) {
        self.registry
            .inc_stage_records_out(&self.run_id, &self.stage, n);
    }

    fn inc_errors(&self, n: u64) {
        self.registry.inc_stage_errors(&self.run_id, &self.stage, n);
    }

    fn inc_alerts(&self, n: u64) {
        self.registry.inc_stage_alerts(&self.run_id, &self.stage, n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_collector_reports_into_registry() {
        let registry = MetricsRegistry::new();
        let collector = MetricsStageStatisticsCollector::new(registry.clone(), "r7", "clean");
        collector.inc_records_in(5);
        collector.inc_records_out(4);
        collector.inc_errors(1);
        let text = registry.render_prometheus();
        assert!(text.contains("clean"));
        assert!(text.contains("weir_stage_errors_total"));
    }
}
