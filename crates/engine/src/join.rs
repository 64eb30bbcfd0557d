//! Join model and the join planner.
//!
//! Two flavors reach the planner. An **explicit** joiner plugin supplies join
//! keys and merges rows itself; the planner lowers it to a sequence of keyed
//! backend joins (inner over required inputs in declared order, then outer
//! over the rest). An **auto** joiner declares the join; the planner orders
//! the sides so broadcast sides come last and hands the backend a single
//! [`JoinRequest`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use arrow_schema::Schema;
use weir_common::{Result, WeirError};
use weir_plan::StageSpec;

use crate::backend::PipelineBackend;
use crate::collection::{JoinFlattenFn, JoinSeedFn, JoinedRef, KeyedRef, RecordRef};
use crate::plugin::{BatchJoiner, FunctionContext};

/// One record tagged with the input stage it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinElement<T> {
    /// Input stage that produced the record.
    pub stage: Arc<str>,
    /// The record itself.
    pub record: T,
}

/// Accumulated per-key row across already-joined inputs.
pub type JoinRow<T> = Vec<JoinElement<T>>;

/// Value produced by one keyed join step, before flattening.
///
/// Inner joins populate both sides; left-outer joins may lack `right`;
/// full-outer joins may lack either.
#[derive(Debug, Clone)]
pub struct JoinMatch<T> {
    /// Accumulated row from the inputs joined so far.
    pub row: Option<JoinRow<T>>,
    /// Matching record from the newly joined input.
    pub right: Option<T>,
}

/// Join behavior declared by an explicit joiner plugin.
#[derive(Debug, Clone, Default)]
pub struct JoinConfig {
    /// Inputs with inner-join semantics, in join order. Inputs not listed
    /// here join with outer semantics.
    pub required_inputs: Vec<String>,
}

/// Schemas handed to an explicit joiner's `initialize`.
#[derive(Debug, Clone)]
pub struct JoinerRuntimeContext {
    /// Input-stage-name -> schema of records arriving from it.
    pub input_schemas: BTreeMap<String, Schema>,
    /// Schema of the merged output, if declared.
    pub output_schema: Option<Schema>,
}

impl JoinerRuntimeContext {
    /// Builds the context from the joiner's stage spec.
    pub fn from_spec(spec: &StageSpec) -> Self {
        Self {
            input_schemas: spec.input_schemas.clone(),
            output_schema: spec.output_schema.clone(),
        }
    }
}

/// One side of a declarative join.
#[derive(Debug, Clone)]
pub struct JoinStage {
    /// Input stage name.
    pub stage: String,
    /// Schema of that input, if known.
    pub schema: Option<Schema>,
    /// Whether a row must match this side to survive.
    pub required: bool,
    /// Whether this side should be replicated instead of shuffled.
    pub broadcast: bool,
}

impl JoinStage {
    /// A required, non-broadcast side; the common default.
    pub fn new(stage: impl Into<String>, schema: Option<Schema>) -> Self {
        Self {
            stage: stage.into(),
            schema,
            required: true,
            broadcast: false,
        }
    }

    /// Marks this side optional (outer semantics).
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Marks this side for broadcast.
    pub fn broadcast(mut self) -> Self {
        self.broadcast = true;
        self
    }
}

/// Key fields contributed by one stage to a key-equality condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinKey {
    /// Stage name.
    pub stage: String,
    /// Key field names, positionally matched across stages.
    pub fields: Vec<String>,
}

/// Declarative join condition.
#[derive(Debug, Clone)]
pub enum JoinCondition {
    /// Positional key equality across all stages.
    OnKeys {
        /// Per-stage key field lists.
        keys: Vec<JoinKey>,
        /// Whether null key values compare equal.
        null_safe: bool,
    },
    /// Free-form expression; not executable by this engine.
    OnExpression {
        /// The expression text, reported in the rejection error.
        expression: String,
    },
}

/// One selected output field of a declarative join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinField {
    /// Stage the field is read from.
    pub stage: String,
    /// Field name within that stage's records.
    pub field: String,
    /// Output name; defaults to the field name.
    pub alias: Option<String>,
}

/// A declarative join produced by an auto joiner's `define`.
#[derive(Debug, Clone)]
pub struct JoinDefinition {
    /// All sides of the join, in plugin-declared order.
    pub stages: Vec<JoinStage>,
    /// The join condition.
    pub condition: JoinCondition,
    /// Output projection; empty selects every field of every side.
    pub selected_fields: Vec<JoinField>,
    /// Declared output schema, if any.
    pub output_schema: Option<Schema>,
}

/// Input facts handed to an auto joiner's `define`.
#[derive(Debug, Clone)]
pub struct AutoJoinerContext {
    /// Per-input join stages carrying the upstream output schemas.
    pub input_stages: BTreeMap<String, JoinStage>,
}

/// One non-left side of a planned declarative join, bound to its collection.
#[derive(Clone)]
pub struct JoinCollection<T> {
    /// Input stage name.
    pub stage: String,
    /// The side's collection handle.
    pub collection: RecordRef<T>,
    /// Schema of that input, if known.
    pub schema: Option<Schema>,
    /// Key field names.
    pub keys: Vec<String>,
    /// Whether a row must match this side to survive.
    pub required: bool,
    /// Whether this side should be replicated instead of shuffled.
    pub broadcast: bool,
}

/// A fully planned declarative join: the left side plus one or more other
/// sides. After planning, the left side is never a broadcast side unless it
/// is the only stage.
#[derive(Clone)]
pub struct JoinRequest<T> {
    /// Left-side stage name.
    pub left_stage: String,
    /// Left-side key field names.
    pub left_keys: Vec<String>,
    /// Left-side schema, if known.
    pub left_schema: Option<Schema>,
    /// Whether rows must match the left side to survive.
    pub left_required: bool,
    /// Whether null key values compare equal.
    pub null_safe: bool,
    /// Output projection; empty selects every field of every side.
    pub selected_fields: Vec<JoinField>,
    /// Declared output schema, if any.
    pub output_schema: Option<Schema>,
    /// The remaining sides, in planned join order.
    pub right: Vec<JoinCollection<T>>,
}

/// Seeds a join row with a single element from `stage`.
pub fn initial_join<T: Send + Sync + 'static>(stage: &str) -> JoinSeedFn<T> {
    let stage: Arc<str> = Arc::from(stage);
    Arc::new(move |record| {
        vec![JoinElement {
            stage: Arc::clone(&stage),
            record,
        }]
    })
}

/// Appends the newly joined side's record (when matched) to the accumulated
/// row. Used after inner, left-outer, and full-outer steps alike; the join
/// flavor itself decides which sides may be absent.
pub fn join_flatten<T: Send + Sync + 'static>(stage: &str) -> JoinFlattenFn<T> {
    let stage: Arc<str> = Arc::from(stage);
    Arc::new(move |matched: JoinMatch<T>| {
        let mut row = matched.row.unwrap_or_default();
        if let Some(record) = matched.right {
            row.push(JoinElement {
                stage: Arc::clone(&stage),
                record,
            });
        }
        row
    })
}

/// Reorders join sides so broadcast sides come last.
///
/// The first side after ordering becomes the left of the n-way join; the
/// left is never broadcast (broadcasting both sides of a step is invalid)
/// and non-broadcast left sides shuffle less. The sort is stable, so sides
/// with equal broadcast flags keep their declared order.
pub(crate) fn order_join_stages(mut stages: Vec<JoinStage>) -> Vec<JoinStage> {
    stages.sort_by_key(|s| s.broadcast);
    stages
}

/// Lowers an explicit joiner stage to keyed backend joins.
///
/// Required inputs inner-join in declared order; the remaining inputs join
/// with outer semantics in lexicographic order (full-outer when no input was
/// required, left-outer otherwise). The merged result is cached because the
/// joiner output commonly fans out.
pub(crate) fn plan_explicit_join<T>(
    backend: &dyn PipelineBackend<T>,
    fx: &FunctionContext<T>,
    joiner: Arc<dyn BatchJoiner<T>>,
    inputs: &BTreeMap<String, RecordRef<T>>,
    partitions: Option<usize>,
) -> Result<RecordRef<T>>
where
    T: Clone + Send + Sync + 'static,
{
    joiner.initialize(&JoinerRuntimeContext::from_spec(fx.stage_spec()))?;

    let mut keyed: BTreeMap<&str, KeyedRef<T>> = BTreeMap::new();
    for (name, collection) in inputs {
        keyed.insert(
            name.as_str(),
            backend.add_join_key(fx.clone(), name, collection.clone())?,
        );
    }

    let config = joiner.join_config();
    let mut remaining: BTreeSet<&str> = inputs.keys().map(String::as_str).collect();
    let mut joined: Option<JoinedRef<T>> = None;

    for input in &config.required_inputs {
        let pre = keyed.get(input.as_str()).ok_or_else(|| {
            WeirError::MalformedPipeline(format!(
                "join stage '{}' requires unknown input '{input}'",
                fx.stage_name()
            ))
        })?;
        joined = Some(match joined {
            None => pre.map_values(initial_join(input)),
            Some(acc) => acc
                .join(pre.clone(), partitions)
                .map_values(join_flatten(input)),
        });
        remaining.remove(input.as_str());
    }

    let is_full_outer = joined.is_none();
    for input in remaining {
        let pre = &keyed[input];
        joined = Some(match joined {
            None => pre.map_values(initial_join(input)),
            Some(acc) => {
                let matched = if is_full_outer {
                    acc.full_outer_join(pre.clone(), partitions)
                } else {
                    acc.left_outer_join(pre.clone(), partitions)
                };
                matched.map_values(join_flatten(input))
            }
        });
    }

    let joined = joined.ok_or_else(|| WeirError::MissingInput {
        stage: fx.stage_name().to_string(),
    })?;
    Ok(backend.merge_join_results(fx.clone(), joined)?.cache())
}

/// Lowers a declarative join definition to a single backend [`JoinRequest`].
pub(crate) fn plan_auto_join<T>(
    stage_name: &str,
    definition: JoinDefinition,
    inputs: &BTreeMap<String, RecordRef<T>>,
) -> Result<RecordRef<T>>
where
    T: Clone + Send + Sync + 'static,
{
    let (keys, null_safe) = match definition.condition {
        JoinCondition::OnKeys { keys, null_safe } => (keys, null_safe),
        JoinCondition::OnExpression { expression } => {
            return Err(WeirError::UnsupportedJoinCondition(format!(
                "join stage '{stage_name}' uses an expression condition: {expression}"
            )))
        }
    };
    let mut stage_keys: BTreeMap<String, Vec<String>> =
        keys.into_iter().map(|k| (k.stage, k.fields)).collect();

    let mut order = order_join_stages(definition.stages).into_iter();
    let left = order.next().ok_or_else(|| {
        WeirError::MalformedPipeline(format!("join stage '{stage_name}' defines no stages"))
    })?;
    let left_collection = lookup_collection(stage_name, inputs, &left.stage)?;
    let left_keys = take_keys(stage_name, &mut stage_keys, &left.stage)?;

    let mut right = Vec::new();
    for side in order {
        let collection = lookup_collection(stage_name, inputs, &side.stage)?.clone();
        let keys = take_keys(stage_name, &mut stage_keys, &side.stage)?;
        right.push(JoinCollection {
            stage: side.stage,
            collection,
            schema: side.schema,
            keys,
            required: side.required,
            broadcast: side.broadcast,
        });
    }

    left_collection.join(JoinRequest {
        left_stage: left.stage,
        left_keys,
        left_schema: left.schema,
        left_required: left.required,
        null_safe,
        selected_fields: definition.selected_fields,
        output_schema: definition.output_schema,
        right,
    })
}

fn lookup_collection<'a, T>(
    stage_name: &str,
    inputs: &'a BTreeMap<String, RecordRef<T>>,
    input: &str,
) -> Result<&'a RecordRef<T>> {
    inputs.get(input).ok_or_else(|| {
        WeirError::MalformedPipeline(format!(
            "join stage '{stage_name}' has no input collection for '{input}'"
        ))
    })
}

fn take_keys(
    stage_name: &str,
    stage_keys: &mut BTreeMap<String, Vec<String>>,
    input: &str,
) -> Result<Vec<String>> {
    stage_keys.remove(input).ok_or_else(|| {
        WeirError::UnsupportedJoinCondition(format!(
            "join stage '{stage_name}' has no key fields for input '{input}'"
        ))
    })
}
