use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::RunId;

/// Well-known runtime argument keys consumed by the engine.
pub mod args {
    /// Enables parallel execution of queued sink tasks (`"true"`/`"false"`, default false).
    pub const PARALLEL_SINKS_ENABLED: &str = "pipeline.spark.parallel.sinks.enabled";
}

/// Immutable key/value arguments supplied when a pipeline run starts.
///
/// Iteration order is lexicographic by key so anything derived from the
/// arguments is stable across runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeArguments {
    entries: BTreeMap<String, String>,
}

impl RuntimeArguments {
    /// Creates arguments from raw key/value pairs.
    pub fn new(entries: BTreeMap<String, String>) -> Self {
        Self { entries }
    }

    /// Returns the raw value for `key`, if set.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Parses `key` as a boolean; anything other than `"true"` (case-insensitive)
    /// including absence is `false`.
    pub fn get_bool(&self, key: &str) -> bool {
        matches!(self.get(key), Some(v) if v.eq_ignore_ascii_case("true"))
    }

    /// Iterates all arguments in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl FromIterator<(String, String)> for RuntimeArguments {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Per-run execution facts handed to the engine by the caller.
///
/// The engine never mutates this; it is threaded into plugin materialization
/// (macro lookups) and logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Identifier for this run, used in logs and metrics labels.
    pub run_id: RunId,
    /// Namespace the pipeline is deployed in.
    pub namespace: String,
    /// Logical start time of the run in epoch milliseconds.
    pub logical_start_time_millis: i64,
    /// Caller-supplied runtime arguments.
    pub arguments: RuntimeArguments,
}

impl ExecutionContext {
    /// Creates a context with the given run identity and arguments.
    pub fn new(
        run_id: RunId,
        namespace: impl Into<String>,
        logical_start_time_millis: i64,
        arguments: RuntimeArguments,
    ) -> Self {
        Self {
            run_id,
            namespace: namespace.into(),
            logical_start_time_millis,
            arguments,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arguments(pairs: &[(&str, &str)]) -> RuntimeArguments {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn bool_parsing_defaults_to_false() {
        let args = arguments(&[
            (args::PARALLEL_SINKS_ENABLED, "TRUE"),
            ("other.flag", "yes"),
        ]);
        assert!(args.get_bool(args::PARALLEL_SINKS_ENABLED));
        assert!(!args.get_bool("other.flag"));
        assert!(!args.get_bool("absent.flag"));
    }

    #[test]
    fn iteration_is_key_ordered() {
        let args = arguments(&[("b", "2"), ("a", "1"), ("c", "3")]);
        let keys: Vec<&str> = args.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }
}
