//! Plugin contracts and per-stage function context.
//!
//! Plugins implement a stage's semantics; the engine only dispatches to them.
//! Most plugins are materialized lazily inside backend collection operations
//! through [`FunctionContext::instantiate`]; compute, compute-sink, windower,
//! and joiner plugins are materialized eagerly by the driver because their
//! contracts are part of the dispatch itself.

use std::fmt;
use std::sync::Arc;

use weir_common::config::ExecutionContext;
use weir_common::stats::StageStatisticsCollector;
use weir_common::{Result, WeirError};
use weir_plan::StageSpec;

use crate::join::{AutoJoinerContext, JoinConfig, JoinDefinition, JoinRow, JoinerRuntimeContext};
use crate::record::{Alert, Emitter, ErrorRecord};

/// Resolves `${...}` tokens in plugin configuration at materialization time.
///
/// Lookup order: the reserved names `logical.start.time` and `namespace`,
/// then runtime arguments. Unresolvable tokens are an error because plugin
/// configuration was validated against the same argument set at deployment.
#[derive(Debug, Clone)]
pub struct MacroEvaluator {
    run: ExecutionContext,
}

impl MacroEvaluator {
    /// Creates an evaluator over the run's arguments and identity.
    pub fn new(run: &ExecutionContext) -> Self {
        Self { run: run.clone() }
    }

    /// Resolves a single macro name.
    pub fn lookup(&self, name: &str) -> Option<String> {
        match name {
            "logical.start.time" => Some(self.run.logical_start_time_millis.to_string()),
            "namespace" => Some(self.run.namespace.clone()),
            _ => self.run.arguments.get(name).map(str::to_string),
        }
    }

    /// Substitutes every `${name}` token in `text`.
    ///
    /// # Errors
    ///
    /// Returns [`WeirError::Backend`] for an unterminated token or an
    /// unresolvable name.
    pub fn evaluate(&self, text: &str) -> Result<String> {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after.find('}').ok_or_else(|| {
                WeirError::Backend(format!("unterminated macro in '{text}'"))
            })?;
            let name = &after[..end];
            let value = self
                .lookup(name)
                .ok_or_else(|| WeirError::Backend(format!("unresolved macro '{name}'")))?;
            out.push_str(&value);
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

/// Reads records from external storage into the stage's emitter.
pub trait BatchSource<T>: Send + Sync {
    /// Reads the full source, emitting tagged records.
    fn read(&self, emitter: &mut Emitter<T>) -> Result<()>;
}

/// Writes a materialized input collection to external storage.
pub trait BatchSink<T>: Send + Sync {
    /// Writes all records; called once per run from a sink task.
    fn write(&self, records: Vec<T>) -> Result<()>;
}

/// Record-at-a-time transform.
pub trait Transform<T>: Send + Sync {
    /// Transforms one record, emitting any number of tagged records.
    fn transform(&self, record: T, emitter: &mut Emitter<T>) -> Result<()>;
}

/// Transform that routes each record to one of several named output ports.
pub trait SplitterTransform<T>: Send + Sync {
    /// Routes one record; emission goes through [`Emitter::emit_port`].
    fn transform(&self, record: T, emitter: &mut Emitter<T>) -> Result<()>;
}

/// Transform over the error records of upstream stages.
pub trait ErrorTransform<T>: Send + Sync {
    /// Transforms one failed record back into the normal stream.
    fn transform(&self, error: ErrorRecord<T>, emitter: &mut Emitter<T>) -> Result<()>;
}

/// Whole-collection transform; receives every record of the stage input.
pub trait BatchCompute<T>: Send + Sync {
    /// Produces the stage output from the full input.
    fn compute(&self, records: Vec<T>) -> Result<Vec<T>>;
}

/// Whole-collection sink; receives every record of the stage input.
pub trait ComputeSink<T>: Send + Sync {
    /// Consumes the full input; called once per run from a sink task.
    fn run(&self, records: Vec<T>) -> Result<()>;
}

/// Group-and-aggregate plugin.
pub trait BatchAggregator<T>: Send + Sync {
    /// Group keys for one record; a record may land in several groups.
    fn group_keys(&self, record: &T) -> Result<Vec<T>>;
    /// Aggregates one group, emitting tagged records.
    fn aggregate(&self, key: &T, records: Vec<T>, emitter: &mut Emitter<T>) -> Result<()>;
}

/// Aggregator with an associative partial-reduce form.
pub trait ReducibleAggregator<T>: Send + Sync {
    /// Group keys for one record.
    fn group_keys(&self, record: &T) -> Result<Vec<T>>;
    /// Creates the accumulator from the group's first record.
    fn initialize(&self, record: T) -> Result<T>;
    /// Folds one more record into the accumulator.
    fn merge(&self, accumulated: T, record: T) -> Result<T>;
    /// Emits the group's output from the final accumulator.
    fn finalize(&self, key: &T, accumulated: T, emitter: &mut Emitter<T>) -> Result<()>;
}

/// Explicit multi-input joiner: the plugin supplies keys and merges rows.
pub trait BatchJoiner<T>: Send + Sync {
    /// One-time setup with the resolved input/output schemas.
    fn initialize(&self, context: &JoinerRuntimeContext) -> Result<()>;
    /// Which inputs use inner-join semantics.
    fn join_config(&self) -> JoinConfig;
    /// The join key of `record` arriving from `input_stage`.
    fn join_key(&self, input_stage: &str, record: &T) -> Result<T>;
    /// Merges one joined row into zero or more output records.
    fn merge(&self, key: &T, row: &JoinRow<T>) -> Result<Vec<T>>;
}

/// Declarative joiner: the plugin describes the join, the backend executes it.
pub trait AutoJoiner: Send + Sync {
    /// Produces the join definition for the given input stages.
    fn define(&self, context: &AutoJoinerContext) -> Result<JoinDefinition>;
}

/// Assigns records to windows.
pub trait Windower<T>: Send + Sync {
    /// Partitions the input into windows; output preserves window order.
    fn windows(&self, records: &[T]) -> Result<Vec<Vec<T>>>;
}

/// Publishes the alerts of upstream stages to an external system.
pub trait AlertPublisher: Send + Sync {
    /// Publishes all alerts; called eagerly during dispatch.
    fn publish(&self, alerts: Vec<Alert>) -> Result<()>;
}

/// A materialized plugin instance, tagged by contract.
#[derive(Clone)]
pub enum PluginInstance<T> {
    /// Batch source.
    Source(Arc<dyn BatchSource<T>>),
    /// Batch sink.
    Sink(Arc<dyn BatchSink<T>>),
    /// Record transform.
    Transform(Arc<dyn Transform<T>>),
    /// Port splitter.
    Splitter(Arc<dyn SplitterTransform<T>>),
    /// Error transform.
    ErrorTransform(Arc<dyn ErrorTransform<T>>),
    /// Whole-collection compute.
    Compute(Arc<dyn BatchCompute<T>>),
    /// Whole-collection sink.
    ComputeSink(Arc<dyn ComputeSink<T>>),
    /// Group aggregator.
    Aggregator(Arc<dyn BatchAggregator<T>>),
    /// Reducible aggregator.
    ReducibleAggregator(Arc<dyn ReducibleAggregator<T>>),
    /// Explicit joiner.
    Joiner(Arc<dyn BatchJoiner<T>>),
    /// Declarative joiner.
    AutoJoiner(Arc<dyn AutoJoiner>),
    /// Windower.
    Windower(Arc<dyn Windower<T>>),
    /// Alert publisher.
    AlertPublisher(Arc<dyn AlertPublisher>),
}

impl<T> fmt::Debug for PluginInstance<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            PluginInstance::Source(_) => "Source",
            PluginInstance::Sink(_) => "Sink",
            PluginInstance::Transform(_) => "Transform",
            PluginInstance::Splitter(_) => "Splitter",
            PluginInstance::ErrorTransform(_) => "ErrorTransform",
            PluginInstance::Compute(_) => "Compute",
            PluginInstance::ComputeSink(_) => "ComputeSink",
            PluginInstance::Aggregator(_) => "Aggregator",
            PluginInstance::ReducibleAggregator(_) => "ReducibleAggregator",
            PluginInstance::Joiner(_) => "Joiner",
            PluginInstance::AutoJoiner(_) => "AutoJoiner",
            PluginInstance::Windower(_) => "Windower",
            PluginInstance::AlertPublisher(_) => "AlertPublisher",
        };
        write!(f, "PluginInstance::{kind}")
    }
}

/// Materializes configured plugin objects for stages.
///
/// Implementations resolve the stage's `plugin_name` against whatever
/// artifact/registry mechanism the host provides, evaluating configuration
/// macros with the supplied evaluator.
pub trait PluginContext<T>: Send + Sync {
    /// Creates a new plugin instance for `stage`.
    ///
    /// # Errors
    ///
    /// Returns [`WeirError::PluginInstantiation`] when the stage has no
    /// registered plugin or its configuration cannot be evaluated.
    fn new_plugin_instance(
        &self,
        stage: &str,
        macros: &MacroEvaluator,
    ) -> Result<PluginInstance<T>>;
}

/// The sink function handed to `create_store_task`.
#[derive(Clone)]
pub enum SinkFunction<T> {
    /// Batch sink plugin, materialized lazily from the stage's context when
    /// the task runs.
    Batch,
    /// Pre-materialized compute sink driven directly by the backend.
    Compute(Arc<dyn ComputeSink<T>>),
}

impl<T> fmt::Debug for SinkFunction<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkFunction::Batch => f.write_str("SinkFunction::Batch"),
            SinkFunction::Compute(_) => f.write_str("SinkFunction::Compute"),
        }
    }
}

/// Everything a backend needs to run one stage's plugin functions lazily:
/// the stage spec, the plugin context, the statistics collector, and the run
/// facts. Cheap to clone into deferred collection thunks.
#[derive(Clone)]
pub struct FunctionContext<T> {
    inner: Arc<FunctionContextInner<T>>,
}

struct FunctionContextInner<T> {
    spec: StageSpec,
    run: ExecutionContext,
    plugins: Arc<dyn PluginContext<T>>,
    collector: Arc<dyn StageStatisticsCollector>,
    macros: MacroEvaluator,
}

impl<T> FunctionContext<T> {
    /// Bundles the per-stage collaborators.
    pub fn new(
        spec: StageSpec,
        run: ExecutionContext,
        plugins: Arc<dyn PluginContext<T>>,
        collector: Arc<dyn StageStatisticsCollector>,
        macros: MacroEvaluator,
    ) -> Self {
        Self {
            inner: Arc::new(FunctionContextInner {
                spec,
                run,
                plugins,
                collector,
                macros,
            }),
        }
    }

    /// The stage this context belongs to.
    pub fn stage_spec(&self) -> &StageSpec {
        &self.inner.spec
    }

    /// Shorthand for the stage name.
    pub fn stage_name(&self) -> &str {
        &self.inner.spec.name
    }

    /// The run facts (arguments, namespace, logical start time).
    pub fn run_info(&self) -> &ExecutionContext {
        &self.inner.run
    }

    /// The stage's statistics collector.
    pub fn collector(&self) -> &Arc<dyn StageStatisticsCollector> {
        &self.inner.collector
    }

    /// Materializes this stage's plugin instance.
    pub fn instantiate(&self) -> Result<PluginInstance<T>> {
        self.inner
            .plugins
            .new_plugin_instance(&self.inner.spec.name, &self.inner.macros)
    }
}

impl<T> fmt::Debug for FunctionContext<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionContext")
            .field("stage", &self.inner.spec.name)
            .field("kind", &self.inner.spec.plugin_kind)
            .field("run_id", &self.inner.run.run_id)
            .finish_non_exhaustive()
    }
}
