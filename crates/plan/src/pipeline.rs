use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use weir_common::{Result, WeirError};

use crate::dag::Dag;
use crate::stage::StageSpec;

static EMPTY: BTreeSet<String> = BTreeSet::new();

/// A frozen, validated pipeline phase handed to the execution engine.
///
/// The DAG may reference stages that live in other phases of the same
/// deployment (for example actions that gate this phase); such stages have no
/// [`StageSpec`] here and the engine skips them when assembling inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelinePlan {
    stages: BTreeMap<String, StageSpec>,
    dag: Option<Dag>,
    sources: BTreeSet<String>,
    sinks: BTreeSet<String>,
}

impl PipelinePlan {
    /// Assembles a plan from stage specs and `(from, to)` connections.
    ///
    /// Source/sink sets are derived structurally: a stage of this plan with
    /// no inbound connections is a source, one with no outbound connections
    /// is a sink. A plan without connections has no DAG and is rejected by
    /// the driver at run time.
    ///
    /// # Errors
    ///
    /// Returns [`WeirError::MalformedPipeline`] for duplicate stage names or
    /// an invalid connection set (self-loop, cycle).
    pub fn new<S, C>(stages: S, connections: C) -> Result<Self>
    where
        S: IntoIterator<Item = StageSpec>,
        C: IntoIterator<Item = (String, String)>,
    {
        let mut stage_map = BTreeMap::new();
        for spec in stages {
            let name = spec.name.clone();
            if stage_map.insert(name.clone(), spec).is_some() {
                return Err(WeirError::MalformedPipeline(format!(
                    "duplicate stage name '{name}'"
                )));
            }
        }

        let connections: Vec<(String, String)> = connections.into_iter().collect();
        let dag = if connections.is_empty() {
            None
        } else {
            Some(Dag::new(connections)?)
        };

        // Only connections between stages of this plan count: an inbound edge
        // from another phase (an action, say) does not stop a stage from
        // being this phase's source.
        let mut sources = BTreeSet::new();
        let mut sinks = BTreeSet::new();
        for name in stage_map.keys() {
            let (no_inputs, no_outputs) = match &dag {
                Some(dag) => (
                    !dag.inputs(name).iter().any(|s| stage_map.contains_key(s)),
                    !dag.outputs(name).iter().any(|s| stage_map.contains_key(s)),
                ),
                None => (true, true),
            };
            if no_inputs {
                sources.insert(name.clone());
            }
            if no_outputs {
                sinks.insert(name.clone());
            }
        }

        Ok(Self {
            stages: stage_map,
            dag,
            sources,
            sinks,
        })
    }

    /// Looks up a stage spec by name; `None` for cross-phase stages.
    pub fn stage(&self, name: &str) -> Option<&StageSpec> {
        self.stages.get(name)
    }

    /// All stage specs of this plan in name order.
    pub fn stages(&self) -> impl Iterator<Item = &StageSpec> {
        self.stages.values()
    }

    /// The stage DAG, absent for a phase without connections.
    pub fn dag(&self) -> Option<&Dag> {
        self.dag.as_ref()
    }

    /// Upstream stage names of `stage` according to the DAG.
    pub fn stage_inputs(&self, stage: &str) -> &BTreeSet<String> {
        self.dag.as_ref().map_or(&EMPTY, |dag| dag.inputs(stage))
    }

    /// Downstream stage names of `stage` according to the DAG.
    pub fn stage_outputs(&self, stage: &str) -> &BTreeSet<String> {
        self.dag.as_ref().map_or(&EMPTY, |dag| dag.outputs(stage))
    }

    /// Stages of this plan with no inbound connections.
    pub fn sources(&self) -> &BTreeSet<String> {
        &self.sources
    }

    /// Stages of this plan with no outbound connections.
    pub fn sinks(&self) -> &BTreeSet<String> {
        &self.sinks
    }
}
