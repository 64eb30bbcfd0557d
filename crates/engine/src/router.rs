//! Emit router and cache policy.
//!
//! The router splits a stage's combined tagged stream into the sub-streams
//! downstream stages actually consume. Deriving more than one sub-stream
//! from an uncached stream would recompute the stage once per derivation, so
//! the combined stream is cached whenever errors, alerts, or multiple ports
//! are in play, and each derived stream is cached when the policy says the
//! stage's output is read more than once.

use std::collections::BTreeSet;

use weir_plan::{PipelinePlan, PluginKind, StageSpec};

use crate::collection::{AlertPassFn, ErrorPassFn, RecordPassFn, TaggedRef};
use crate::record::RecordInfo;
use crate::records::EmittedRecordsBuilder;

/// Whether a stage's output should be memoized to avoid recomputation.
///
/// True iff the stage fans out to more than one downstream stage, or any
/// downstream stage has more than one input (the union there would evaluate
/// this stage once per operand). Stage cost is deliberately not considered.
pub fn should_cache(plan: &PipelinePlan, stage: &str) -> bool {
    let outputs = plan.stage_outputs(stage);
    if outputs.len() > 1 {
        return true;
    }
    outputs
        .iter()
        .any(|downstream| plan.stage_inputs(downstream).len() > 1)
}

/// Which record kinds downstream stages consume from `stage`.
///
/// Errors and alerts are only worth deriving when an error transform or an
/// alert publisher is actually connected.
pub(crate) fn downstream_flags(plan: &PipelinePlan, stage: &str) -> (bool, bool) {
    let mut has_errors = false;
    let mut has_alerts = false;
    for output in plan.stage_outputs(stage) {
        match plan.stage(output).map(|s| s.plugin_kind) {
            Some(PluginKind::ErrorTransform) => has_errors = true,
            Some(PluginKind::AlertPublisher) => has_alerts = true,
            _ => {}
        }
    }
    (has_errors, has_alerts)
}

/// Pass filter keeping normal output records.
pub fn output_pass<T: Clone + Send + Sync + 'static>() -> RecordPassFn<T> {
    std::sync::Arc::new(|info| match info {
        RecordInfo::Output(record) => Some(record.clone()),
        _ => None,
    })
}

/// Pass filter keeping records routed to `port`.
pub fn port_pass<T: Clone + Send + Sync + 'static>(port: &str) -> RecordPassFn<T> {
    let port = port.to_string();
    std::sync::Arc::new(move |info| match info {
        RecordInfo::PortOutput { port: p, record } if *p == port => Some(record.clone()),
        _ => None,
    })
}

/// Pass filter keeping error records.
pub fn error_pass<T: Clone + Send + Sync + 'static>() -> ErrorPassFn<T> {
    std::sync::Arc::new(|info| match info {
        RecordInfo::Error(error) => Some(error.clone()),
        _ => None,
    })
}

/// Pass filter keeping alerts.
pub fn alert_pass<T: Clone + Send + Sync + 'static>() -> AlertPassFn<T> {
    std::sync::Arc::new(|info| match info {
        RecordInfo::Alert(alert) => Some(alert.clone()),
        _ => None,
    })
}

/// Routes a stage's combined tagged stream into the builder.
///
/// Splitters get one collection per declared port; everything else gets a
/// single normal-output collection. Error/alert sub-streams are derived only
/// when consumed downstream.
pub(crate) fn add_emitted<T: Clone + Send + Sync + 'static>(
    mut builder: EmittedRecordsBuilder<T>,
    plan: &PipelinePlan,
    spec: &StageSpec,
    combined: TaggedRef<T>,
    has_errors: bool,
    has_alerts: bool,
) -> EmittedRecordsBuilder<T> {
    let ports: BTreeSet<&str> = spec.output_ports.values().map(|p| p.name.as_str()).collect();

    // Every derivation below re-evaluates the stage unless the combined
    // stream is memoized first.
    let combined = if has_errors || has_alerts || ports.len() > 1 {
        combined.cache()
    } else {
        combined
    };

    let cache_derived = should_cache(plan, &spec.name);

    if has_errors {
        let mut errors = combined.flat_map_errors(error_pass());
        if cache_derived {
            errors = errors.cache();
        }
        builder = builder.set_errors(errors);
    }
    if has_alerts {
        let mut alerts = combined.flat_map_alerts(alert_pass());
        if cache_derived {
            alerts = alerts.cache();
        }
        builder = builder.set_alerts(alerts);
    }

    if spec.plugin_kind == PluginKind::Splitter {
        for port in ports {
            let mut records = combined.flat_map_records(port_pass(port));
            if cache_derived {
                records = records.cache();
            }
            builder = builder.add_port(port, records);
        }
    } else {
        let mut records = combined.flat_map_records(output_pass());
        if cache_derived {
            records = records.cache();
        }
        builder = builder.set_output(records);
    }

    builder
}

#[cfg(test)]
mod tests {
    use super::*;
    use weir_plan::{PipelinePlan, StageSpec};

    fn connections(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .collect()
    }

    #[test]
    fn fan_out_forces_cache() {
        let plan = PipelinePlan::new(
            [
                StageSpec::new("source", PluginKind::Source, "mock"),
                StageSpec::new("a", PluginKind::Sink, "t1"),
                StageSpec::new("b", PluginKind::Sink, "t2"),
            ],
            connections(&[("source", "a"), ("source", "b")]),
        )
        .expect("plan");
        assert!(should_cache(&plan, "source"));
        assert!(!should_cache(&plan, "a"));
    }

    #[test]
    fn downstream_union_forces_cache() {
        let plan = PipelinePlan::new(
            [
                StageSpec::new("left", PluginKind::Source, "mock"),
                StageSpec::new("right", PluginKind::Source, "mock"),
                StageSpec::new("merge", PluginKind::Transform, "concat"),
            ],
            connections(&[("left", "merge"), ("right", "merge")]),
        )
        .expect("plan");
        assert!(should_cache(&plan, "left"));
        assert!(should_cache(&plan, "right"));
        assert!(!should_cache(&plan, "merge"));
    }

    #[test]
    fn linear_pipeline_never_caches() {
        let plan = PipelinePlan::new(
            [
                StageSpec::new("source", PluginKind::Source, "mock"),
                StageSpec::new("parse", PluginKind::Transform, "parser"),
                StageSpec::new("store", PluginKind::Sink, "table"),
            ],
            connections(&[("source", "parse"), ("parse", "store")]),
        )
        .expect("plan");
        assert!(!should_cache(&plan, "source"));
        assert!(!should_cache(&plan, "parse"));
        assert!(!should_cache(&plan, "store"));
    }

    #[test]
    fn error_and_alert_flags_follow_downstream_kinds() {
        let plan = PipelinePlan::new(
            [
                StageSpec::new("parse", PluginKind::Transform, "parser"),
                StageSpec::new("errors", PluginKind::ErrorTransform, "reshape"),
                StageSpec::new("pager", PluginKind::AlertPublisher, "pager"),
                StageSpec::new("store", PluginKind::Sink, "table"),
            ],
            connections(&[
                ("parse", "errors"),
                ("parse", "pager"),
                ("parse", "store"),
            ]),
        )
        .expect("plan");
        assert_eq!(downstream_flags(&plan, "parse"), (true, true));
        assert_eq!(downstream_flags(&plan, "errors"), (false, false));
    }

    #[test]
    fn pass_filters_select_one_kind() {
        let infos: Vec<RecordInfo<i64>> = vec![
            RecordInfo::Output(1),
            RecordInfo::PortOutput {
                port: "p".to_string(),
                record: 2,
            },
            RecordInfo::Error(crate::record::ErrorRecord {
                record: 3,
                message: "bad".to_string(),
                code: 1,
                stage: "s".to_string(),
            }),
        ];
        let outputs: Vec<i64> = infos.iter().filter_map(|i| output_pass()(i)).collect();
        assert_eq!(outputs, vec![1]);
        let ported: Vec<i64> = infos.iter().filter_map(|i| port_pass("p")(i)).collect();
        assert_eq!(ported, vec![2]);
        let errors: Vec<_> = infos.iter().filter_map(|i| error_pass()(i)).collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].record, 3);
    }
}
