//! Validated pipeline plan model shared between plan compilation and execution.
//!
//! A [`PipelinePlan`] is the frozen output of validation and compilation:
//! a set of [`StageSpec`]s plus a [`Dag`] over stage names with a precomputed,
//! stable topological order. The execution engine consumes plans as-is and
//! never re-validates schemas or connections.

pub mod dag;
pub mod pipeline;
pub mod stage;

pub use dag::Dag;
pub use pipeline::PipelinePlan;
pub use stage::{PluginKind, Port, StageSpec};
