use std::sync::{Arc, OnceLock};

use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

/// Registry of pipeline-execution metrics with Prometheus rendering.
#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    stage_records_in: CounterVec,
    stage_records_out: CounterVec,
    stage_errors: CounterVec,
    stage_alerts: CounterVec,
    sink_time_seconds: HistogramVec,
    sink_failures: CounterVec,
}

impl MetricsRegistry {
    /// Creates an empty registry with all metric families registered.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    /// Counts records entering a stage.
    pub fn inc_stage_records_in(&self, run_id: &str, stage: &str, n: u64) {
        self.inner
            .stage_records_in
            .with_label_values(&[run_id, stage])
            .inc_by(n as f64);
    }

    /// Counts records emitted by a stage as normal or port output.
    pub fn inc_stage_records_out(&self, run_id: &str, stage: &str, n: u64) {
        self.inner
            .stage_records_out
            .with_label_values(&[run_id, stage])
            .inc_by(n as f64);
    }

    /// Counts error records emitted by a stage.
    pub fn inc_stage_errors(&self, run_id: &str, stage: &str, n: u64) {
        self.inner
            .stage_errors
            .with_label_values(&[run_id, stage])
            .inc_by(n as f64);
    }

    /// Counts alerts emitted by a stage.
    pub fn inc_stage_alerts(&self, run_id: &str, stage: &str, n: u64) {
        self.inner
            .stage_alerts
            .with_label_values(&[run_id, stage])
            .inc_by(n as f64);
    }

    /// Records wall-clock time spent materializing one sink task.
    pub fn observe_sink_time(&self, run_id: &str, stage: &str, secs: f64) {
        self.inner
            .sink_time_seconds
            .with_label_values(&[run_id, stage])
            .observe(secs.max(0.0));
    }

    /// Counts failed sink tasks.
    pub fn inc_sink_failure(&self, run_id: &str, stage: &str) {
        self.inner
            .sink_failures
            .with_label_values(&[run_id, stage])
            .inc();
    }

    /// Renders all registered metric families in Prometheus text format.
    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let stage_records_in = counter_vec(
            &registry,
            "weir_stage_records_in_total",
            "Input records processed per stage",
            &["run_id", "stage"],
        );
        let stage_records_out = counter_vec(
            &registry,
            "weir_stage_records_out_total",
            "Output records produced per stage",
            &["run_id", "stage"],
        );
        let stage_errors = counter_vec(
            &registry,
            "weir_stage_errors_total",
            "Error records emitted per stage",
            &["run_id", "stage"],
        );
        let stage_alerts = counter_vec(
            &registry,
            "weir_stage_alerts_total",
            "Alerts emitted per stage",
            &["run_id", "stage"],
        );
        let sink_time_seconds = histogram_vec(
            &registry,
            "weir_sink_time_seconds",
            "Time spent materializing each sink task",
            &["run_id", "stage"],
        );
        let sink_failures = counter_vec(
            &registry,
            "weir_sink_failures_total",
            "Failed sink tasks",
            &["run_id", "stage"],
        );

        Self {
            registry,
            stage_records_in,
            stage_records_out,
            stage_errors,
            stage_alerts,
            sink_time_seconds,
            sink_failures,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help), labels).expect("histogram vec");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

/// Returns the process-wide metrics registry.
pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::MetricsRegistry;

    #[test]
    fn renders_prometheus_text() {
        let m = MetricsRegistry::new();
        m.inc_stage_records_in("r1", "parse", 10);
        m.inc_stage_records_out("r1", "parse", 8);
        let text = m.render_prometheus();
        assert!(text.contains("weir_stage_records_in_total"));
        assert!(text.contains("parse"));
    }

    #[test]
    fn renders_all_metric_families() {
        let m = MetricsRegistry::new();
        m.inc_stage_records_in("r1", "parse", 10);
        m.inc_stage_records_out("r1", "parse", 8);
        m.inc_stage_errors("r1", "parse", 2);
        m.inc_stage_alerts("r1", "parse", 1);
        m.observe_sink_time("r1", "store", 0.25);
        m.inc_sink_failure("r1", "store");
        let text = m.render_prometheus();

        assert!(text.contains("weir_stage_records_in_total"));
        assert!(text.contains("weir_stage_records_out_total"));
        assert!(text.contains("weir_stage_errors_total"));
        assert!(text.contains("weir_stage_alerts_total"));
        assert!(text.contains("weir_sink_time_seconds"));
        assert!(text.contains("weir_sink_failures_total"));
    }
}
