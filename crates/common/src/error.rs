use thiserror::Error;

/// Canonical weir error taxonomy used across crates.
///
/// Classification guidance:
/// - [`WeirError::MalformedPipeline`]: plan-structure violations discovered when a run starts
/// - [`WeirError::MissingInput`] / [`WeirError::UnknownJoinerType`]: per-stage contract
///   violations raised by the dispatcher
/// - [`WeirError::UnsupportedJoinCondition`]: declarative join shapes the planner cannot lower
/// - [`WeirError::PluginInstantiation`]: plugin materialization failures from the plugin context
/// - [`WeirError::Sink`] / [`WeirError::Interrupted`]: failures surfaced by the sink scheduler
/// - [`WeirError::Backend`]: collection evaluation or plugin invocation failures at runtime
#[derive(Debug, Error)]
pub enum WeirError {
    /// Pipeline plan is missing required structure.
    ///
    /// Examples:
    /// - a phase with no connections (no DAG)
    /// - an input stage that was never executed
    /// - a connector stage that is neither a source nor a sink of its phase
    #[error("malformed pipeline: {0}")]
    MalformedPipeline(String),

    /// A stage with no input collections that is not the phase's source kind.
    #[error("stage '{stage}' has no input and is not a source")]
    MissingInput {
        /// Offending stage name.
        stage: String,
    },

    /// Declarative join condition uses an operator other than key equality.
    #[error("unsupported join condition: {0}")]
    UnsupportedJoinCondition(String),

    /// A joiner stage materialized a plugin that is neither an explicit nor an auto joiner.
    #[error("stage '{stage}' is an unknown joiner type")]
    UnknownJoinerType {
        /// Offending stage name.
        stage: String,
    },

    /// Plugin materialization failed.
    #[error("failed to instantiate plugin for stage '{stage}': {reason}")]
    PluginInstantiation {
        /// Stage whose plugin could not be materialized.
        stage: String,
        /// Underlying failure description.
        reason: String,
    },

    /// First sink failure surfaced by the sink scheduler.
    ///
    /// Wraps the failing task's underlying error; the scheduler never nests
    /// this variant, so `source()` is always the original cause.
    #[error("sink stage '{stage}' failed: {source}")]
    Sink {
        /// Stage whose sink task failed.
        stage: String,
        /// Original failure raised by the sink task.
        #[source]
        source: Box<WeirError>,
    },

    /// Sink execution stopped before all queued tasks were awaited.
    #[error("interrupted: {0}")]
    Interrupted(String),

    /// Collection evaluation or plugin invocation failure after dispatch succeeded.
    ///
    /// Examples:
    /// - a transform rejecting a record with a hard failure
    /// - a backend handed a collection it did not produce
    #[error("backend error: {0}")]
    Backend(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Standard weir result alias.
pub type Result<T> = std::result::Result<T, WeirError>;
