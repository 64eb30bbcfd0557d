use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use weir_common::{Result, WeirError};

static EMPTY: BTreeSet<String> = BTreeSet::new();

/// Directed acyclic stage graph with a precomputed, stable topological order.
///
/// Construction rejects self-loops and cycles. The topological order is
/// computed with Kahn's algorithm over lexicographically ordered ready sets,
/// so it is identical for identical connection sets regardless of input
/// order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dag {
    /// stage -> downstream stages
    outputs: BTreeMap<String, BTreeSet<String>>,
    /// stage -> upstream stages
    inputs: BTreeMap<String, BTreeSet<String>>,
    topological_order: Vec<String>,
}

impl Dag {
    /// Builds a DAG from `(from, to)` connections.
    ///
    /// # Errors
    ///
    /// Returns [`WeirError::MalformedPipeline`] for an empty connection set,
    /// a self-loop, or a cycle.
    pub fn new<I>(connections: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut outputs: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut inputs: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        let mut empty = true;
        for (from, to) in connections {
            empty = false;
            if from == to {
                return Err(WeirError::MalformedPipeline(format!(
                    "stage '{from}' is connected to itself"
                )));
            }
            outputs.entry(to.clone()).or_default();
            inputs.entry(from.clone()).or_default();
            outputs.entry(from.clone()).or_default().insert(to.clone());
            inputs.entry(to).or_default().insert(from);
        }
        if empty {
            return Err(WeirError::MalformedPipeline(
                "pipeline phase has no connections".to_string(),
            ));
        }

        let topological_order = topological_sort(&outputs, &inputs)?;
        Ok(Self {
            outputs,
            inputs,
            topological_order,
        })
    }

    /// Stage names in dependency order; upstream stages always come first.
    /// Ties break lexicographically by stage name.
    pub fn topological_order(&self) -> &[String] {
        &self.topological_order
    }

    /// Downstream stages of `stage` (empty for unknown stages).
    pub fn outputs(&self, stage: &str) -> &BTreeSet<String> {
        self.outputs.get(stage).unwrap_or(&EMPTY)
    }

    /// Upstream stages of `stage` (empty for unknown stages).
    pub fn inputs(&self, stage: &str) -> &BTreeSet<String> {
        self.inputs.get(stage).unwrap_or(&EMPTY)
    }

    /// Whether `stage` participates in any connection.
    pub fn contains(&self, stage: &str) -> bool {
        self.outputs.contains_key(stage)
    }

    /// Number of stages in the graph.
    pub fn node_count(&self) -> usize {
        self.outputs.len()
    }
}

/// Kahn's algorithm with a `BTreeSet` ready set for a stable order.
fn topological_sort(
    outputs: &BTreeMap<String, BTreeSet<String>>,
    inputs: &BTreeMap<String, BTreeSet<String>>,
) -> Result<Vec<String>> {
    let mut in_degree: BTreeMap<&str, usize> = outputs
        .keys()
        .map(|name| (name.as_str(), inputs.get(name).map_or(0, BTreeSet::len)))
        .collect();

    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(name, _)| *name)
        .collect();

    let mut order = Vec::with_capacity(outputs.len());
    while let Some(name) = ready.pop_first() {
        order.push(name.to_string());
        if let Some(targets) = outputs.get(name) {
            for target in targets {
                let deg = in_degree
                    .get_mut(target.as_str())
                    .expect("edge target registered as node");
                *deg -= 1;
                if *deg == 0 {
                    ready.insert(target.as_str());
                }
            }
        }
    }

    if order.len() < outputs.len() {
        let stuck = in_degree
            .iter()
            .find(|(_, deg)| **deg > 0)
            .map(|(name, _)| (*name).to_string())
            .unwrap_or_default();
        return Err(WeirError::MalformedPipeline(format!(
            "cycle detected involving stage '{stuck}'"
        )));
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connections(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .collect()
    }

    #[test]
    fn topological_order_respects_dependencies() {
        let dag = Dag::new(connections(&[
            ("source", "parse"),
            ("parse", "store"),
            ("parse", "audit"),
        ]))
        .expect("dag");
        let order = dag.topological_order();
        let pos = |name: &str| order.iter().position(|s| s == name).expect("present");
        assert!(pos("source") < pos("parse"));
        assert!(pos("parse") < pos("store"));
        assert!(pos("parse") < pos("audit"));
    }

    #[test]
    fn topological_order_is_stable_under_input_order() {
        let a = Dag::new(connections(&[("s", "b"), ("s", "a"), ("a", "t"), ("b", "t")]))
            .expect("dag");
        let b = Dag::new(connections(&[("b", "t"), ("a", "t"), ("s", "a"), ("s", "b")]))
            .expect("dag");
        assert_eq!(a.topological_order(), b.topological_order());
        // a and b are both ready after s; lexicographic tie-break puts a first.
        assert_eq!(a.topological_order(), ["s", "a", "b", "t"]);
    }

    #[test]
    fn rejects_cycles() {
        let err = Dag::new(connections(&[("a", "b"), ("b", "c"), ("c", "a")]))
            .expect_err("cycle must be rejected");
        assert!(matches!(err, WeirError::MalformedPipeline(_)));
    }

    #[test]
    fn rejects_self_loops_and_empty_graphs() {
        assert!(Dag::new(connections(&[("a", "a")])).is_err());
        assert!(Dag::new(connections(&[])).is_err());
    }

    #[test]
    fn adjacency_lookup() {
        let dag = Dag::new(connections(&[("s", "a"), ("s", "b"), ("a", "t"), ("b", "t")]))
            .expect("dag");
        let outs: Vec<&str> = dag.outputs("s").iter().map(String::as_str).collect();
        assert_eq!(outs, ["a", "b"]);
        let ins: Vec<&str> = dag.inputs("t").iter().map(String::as_str).collect();
        assert_eq!(ins, ["a", "b"]);
        assert!(dag.inputs("s").is_empty());
        assert!(dag.outputs("unknown").is_empty());
    }
}
