//! Pipeline driver: topological traversal and per-stage dispatch.
//!
//! Traversal is single-threaded; every stage sees the emitted records of all
//! its same-plan predecessors before it is dispatched. Building collection
//! handles never moves data, so the whole traversal is cheap; data moves when
//! the sink scheduler flushes at the end (and eagerly for alert publishers).

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, info_span};
use weir_common::config::{args, ExecutionContext};
use weir_common::stats::{NoopStageStatisticsCollector, StageStatisticsCollector};
use weir_common::{Result, WeirError};
use weir_plan::{PipelinePlan, PluginKind, StageSpec};

use crate::backend::PipelineBackend;
use crate::collection::{AlertRef, ErrorRef, RecordRef};
use crate::join::{plan_auto_join, plan_explicit_join, AutoJoinerContext, JoinStage};
use crate::plugin::{FunctionContext, MacroEvaluator, PluginContext, PluginInstance, SinkFunction};
use crate::records::{EmittedRecords, RecordsRegistry};
use crate::router::{add_emitted, downstream_flags};
use crate::sink::SinkScheduler;

/// Executes one pipeline phase against `backend`.
///
/// Stages are dispatched in the DAG's stable topological order; sink stages
/// enqueue deferred store tasks which run after traversal, sequentially by
/// default or in parallel when the `pipeline.spark.parallel.sinks.enabled` runtime
/// argument is true.
///
/// An input edge whose upstream stage is not part of this plan (an action
/// from another phase, say) is skipped when assembling stage inputs.
///
/// # Errors
///
/// Fails fast on dispatch and planning errors; sink failures are collected
/// by the scheduler and the first one (by enqueue order) is surfaced after
/// the remaining workers are shut down. Side effects of already-completed
/// sinks are not rolled back.
pub fn run_pipeline<T>(
    plan: &PipelinePlan,
    source_kind: PluginKind,
    ctx: &ExecutionContext,
    backend: &dyn PipelineBackend<T>,
    stage_partitions: &BTreeMap<String, usize>,
    plugin_context: Arc<dyn PluginContext<T>>,
    collectors: &BTreeMap<String, Arc<dyn StageStatisticsCollector>>,
) -> Result<()>
where
    T: Clone + Send + Sync + 'static,
{
    let dag = plan.dag().ok_or_else(|| {
        WeirError::MalformedPipeline("pipeline phase has no connections".to_string())
    })?;

    info!(
        run_id = %ctx.run_id,
        namespace = %ctx.namespace,
        stages = dag.node_count(),
        "pipeline run started"
    );

    let macros = MacroEvaluator::new(ctx);
    let mut registry = RecordsRegistry::new();
    let mut sinks = SinkScheduler::new();

    for stage_name in dag.topological_order() {
        let Some(spec) = plan.stage(stage_name) else {
            // Stage from another phase; nothing to execute here.
            continue;
        };
        let span = info_span!("stage_dispatch", stage = %stage_name, kind = %spec.plugin_kind);
        let _entered = span.enter();

        let (has_errors, has_alerts) = downstream_flags(plan, stage_name);
        let collector: Arc<dyn StageStatisticsCollector> = collectors
            .get(stage_name)
            .cloned()
            .unwrap_or_else(|| Arc::new(NoopStageStatisticsCollector));
        let fx = FunctionContext::new(
            spec.clone(),
            ctx.clone(),
            Arc::clone(&plugin_context),
            collector,
            macros.clone(),
        );

        let inputs = assemble_inputs(plan, &registry, spec);
        let stage_data = fold_inputs(spec.plugin_kind, &inputs);

        let emitted = dispatch(
            StageRun {
                plan,
                backend,
                registry: &registry,
                spec,
                fx,
                source_kind,
                stage_data,
                inputs,
                partitions: stage_partitions.get(stage_name).copied(),
                has_errors,
                has_alerts,
            },
            &mut sinks,
        )?;
        registry.insert(stage_name, emitted);
    }

    let parallel = ctx.arguments.get_bool(args::PARALLEL_SINKS_ENABLED);
    debug!(parallel, sinks = sinks.len(), "flushing sink tasks");
    sinks.run(parallel)?;

    info!(run_id = %ctx.run_id, "pipeline run completed");
    Ok(())
}

/// Per-stage dispatch context.
struct StageRun<'a, T> {
    plan: &'a PipelinePlan,
    backend: &'a dyn PipelineBackend<T>,
    registry: &'a RecordsRegistry<T>,
    spec: &'a StageSpec,
    fx: FunctionContext<T>,
    source_kind: PluginKind,
    stage_data: Option<RecordRef<T>>,
    inputs: BTreeMap<String, RecordRef<T>>,
    partitions: Option<usize>,
    has_errors: bool,
    has_alerts: bool,
}

/// Looks up the collection each same-plan upstream stage feeds this one.
///
/// A per-port collection is used when the upstream declares a port for this
/// stage and neither side is a connector (connector boundaries always carry
/// normal output). Upstream stages that emitted nothing consumable here are
/// skipped; kinds that require record input surface that as `MissingInput`.
fn assemble_inputs<T: Clone + Send + Sync + 'static>(
    plan: &PipelinePlan,
    registry: &RecordsRegistry<T>,
    spec: &StageSpec,
) -> BTreeMap<String, RecordRef<T>> {
    let mut inputs = BTreeMap::new();
    for input_name in plan.stage_inputs(&spec.name) {
        let Some(input_spec) = plan.stage(input_name) else {
            // Input lives in another phase; tolerated, not executable here.
            continue;
        };
        let port = if input_spec.plugin_kind != PluginKind::Connector
            && spec.plugin_kind != PluginKind::Connector
        {
            input_spec.port_for(&spec.name)
        } else {
            None
        };
        let records = registry.get(input_name).and_then(|emitted| match port {
            Some(p) => emitted.port(p).cloned(),
            None => emitted.output().cloned(),
        });
        match records {
            Some(records) => {
                inputs.insert(input_name.clone(), records);
            }
            None => {
                debug!(input = %input_name, "upstream stage emitted no records for this stage");
            }
        }
    }
    inputs
}

/// Folds the input map into a single collection via union, except for
/// joiners and error transforms which consume their inputs individually.
/// Union order is the map's key order.
fn fold_inputs<T: Clone + Send + Sync + 'static>(
    kind: PluginKind,
    inputs: &BTreeMap<String, RecordRef<T>>,
) -> Option<RecordRef<T>> {
    let mut iter = inputs.values();
    let first = iter.next()?.clone();
    if matches!(kind, PluginKind::Joiner | PluginKind::ErrorTransform) {
        return Some(first);
    }
    Some(iter.fold(first, |acc, next| acc.union(next.clone())))
}

fn dispatch<T>(run: StageRun<'_, T>, sinks: &mut SinkScheduler) -> Result<EmittedRecords<T>>
where
    T: Clone + Send + Sync + 'static,
{
    let StageRun {
        plan,
        backend,
        registry,
        spec,
        fx,
        source_kind,
        stage_data,
        inputs,
        partitions,
        has_errors,
        has_alerts,
    } = run;
    let stage_name = spec.name.as_str();
    let kind = spec.plugin_kind;
    let is_connector_source =
        kind == PluginKind::Connector && plan.sources().contains(stage_name);
    let is_connector_sink = kind == PluginKind::Connector && plan.sinks().contains(stage_name);

    // No upstream collections: only sources (or connector sources) are legal.
    let Some(stage_data) = stage_data else {
        if kind == source_kind || is_connector_source {
            let combined = backend.get_source(fx)?;
            return Ok(add_emitted(
                EmittedRecords::builder(),
                plan,
                spec,
                combined,
                has_errors,
                has_alerts,
            )
            .build());
        }
        return Err(WeirError::MissingInput {
            stage: stage_name.to_string(),
        });
    };

    match kind {
        PluginKind::Source => Err(WeirError::MalformedPipeline(format!(
            "source stage '{stage_name}' has upstream inputs"
        ))),

        PluginKind::Connector => {
            if is_connector_sink {
                sinks.enqueue(stage_data.create_store_task(fx, SinkFunction::Batch));
                Ok(EmittedRecords::empty())
            } else {
                Err(WeirError::MalformedPipeline(format!(
                    "connector stage '{stage_name}' is neither a phase source nor a phase sink"
                )))
            }
        }

        PluginKind::Sink => {
            sinks.enqueue(stage_data.create_store_task(fx, SinkFunction::Batch));
            Ok(EmittedRecords::empty())
        }

        PluginKind::Transform => {
            let combined = stage_data.transform(fx)?;
            Ok(add_emitted(
                EmittedRecords::builder(),
                plan,
                spec,
                combined,
                has_errors,
                has_alerts,
            )
            .build())
        }

        PluginKind::Splitter => {
            let combined = stage_data.multi_output_transform(fx)?;
            Ok(add_emitted(
                EmittedRecords::builder(),
                plan,
                spec,
                combined,
                has_errors,
                has_alerts,
            )
            .build())
        }

        PluginKind::ErrorTransform => {
            // Union the error streams of every upstream stage that has one.
            let mut merged: Option<ErrorRef<T>> = None;
            for input_name in plan.stage_inputs(stage_name) {
                let Some(errors) = registry
                    .get(input_name)
                    .and_then(|emitted| emitted.errors().cloned())
                else {
                    continue;
                };
                merged = Some(match merged {
                    None => errors,
                    Some(acc) => acc.union(errors),
                });
            }
            match merged {
                None => Ok(EmittedRecords::empty()),
                Some(errors) => {
                    let combined = errors.error_transform(fx)?;
                    Ok(add_emitted(
                        EmittedRecords::builder(),
                        plan,
                        spec,
                        combined,
                        has_errors,
                        has_alerts,
                    )
                    .build())
                }
            }
        }

        PluginKind::Compute => {
            let plugin = match fx.instantiate()? {
                PluginInstance::Compute(plugin) => plugin,
                other => return Err(plugin_mismatch(stage_name, "compute", &other)),
            };
            let output = stage_data.compute(fx, plugin)?;
            Ok(EmittedRecords::builder().set_output(output).build())
        }

        PluginKind::ComputeSink => {
            let plugin = match fx.instantiate()? {
                PluginInstance::ComputeSink(plugin) => plugin,
                other => return Err(plugin_mismatch(stage_name, "compute sink", &other)),
            };
            sinks.enqueue(stage_data.create_store_task(fx, SinkFunction::Compute(plugin)));
            Ok(EmittedRecords::empty())
        }

        PluginKind::Aggregator => {
            let combined = stage_data.aggregate(fx, partitions)?;
            Ok(add_emitted(
                EmittedRecords::builder(),
                plan,
                spec,
                combined,
                has_errors,
                has_alerts,
            )
            .build())
        }

        PluginKind::ReducibleAggregator => {
            let combined = stage_data.reduce_aggregate(fx, partitions)?;
            Ok(add_emitted(
                EmittedRecords::builder(),
                plan,
                spec,
                combined,
                has_errors,
                has_alerts,
            )
            .build())
        }

        PluginKind::Joiner => {
            let output = handle_join(plan, backend, &fx, spec, &inputs, partitions)?;
            Ok(EmittedRecords::builder().set_output(output).build())
        }

        PluginKind::Windower => {
            let plugin = match fx.instantiate()? {
                PluginInstance::Windower(plugin) => plugin,
                other => return Err(plugin_mismatch(stage_name, "windower", &other)),
            };
            let output = stage_data.window(fx, plugin)?;
            Ok(EmittedRecords::builder().set_output(output).build())
        }

        PluginKind::AlertPublisher => {
            // Union the alert streams of every upstream stage that has one,
            // then publish eagerly.
            let mut merged: Option<AlertRef<T>> = None;
            for input_name in plan.stage_inputs(stage_name) {
                let Some(alerts) = registry
                    .get(input_name)
                    .and_then(|emitted| emitted.alerts().cloned())
                else {
                    continue;
                };
                merged = Some(match merged {
                    None => alerts,
                    Some(acc) => acc.union(alerts),
                });
            }
            if let Some(alerts) = merged {
                alerts.publish_alerts(fx)?;
            }
            Ok(EmittedRecords::empty())
        }
    }
}

/// Dispatches a joiner stage to the explicit or declarative planner.
fn handle_join<T>(
    plan: &PipelinePlan,
    backend: &dyn PipelineBackend<T>,
    fx: &FunctionContext<T>,
    spec: &StageSpec,
    inputs: &BTreeMap<String, RecordRef<T>>,
    partitions: Option<usize>,
) -> Result<RecordRef<T>>
where
    T: Clone + Send + Sync + 'static,
{
    match fx.instantiate()? {
        PluginInstance::Joiner(joiner) => {
            plan_explicit_join(backend, fx, joiner, inputs, partitions)
        }
        PluginInstance::AutoJoiner(auto) => {
            let mut input_stages = BTreeMap::new();
            for input_name in plan.stage_inputs(&spec.name) {
                let Some(input_spec) = plan.stage(input_name) else {
                    continue;
                };
                input_stages.insert(
                    input_name.clone(),
                    JoinStage::new(input_name.clone(), input_spec.output_schema.clone()),
                );
            }
            let definition = auto.define(&AutoJoinerContext { input_stages })?;
            plan_auto_join(&spec.name, definition, inputs)
        }
        _ => Err(WeirError::UnknownJoinerType {
            stage: spec.name.clone(),
        }),
    }
}

fn plugin_mismatch<T>(stage: &str, expected: &str, got: &PluginInstance<T>) -> WeirError {
    WeirError::PluginInstantiation {
        stage: stage.to_string(),
        reason: format!("expected a {expected} plugin, got {got:?}"),
    }
}
