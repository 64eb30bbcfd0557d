//! Batch pipeline execution engine.
//!
//! Given a validated [`weir_plan::PipelinePlan`], a set of plugin instances
//! reachable through a [`plugin::PluginContext`], and a compute backend
//! implementing the [`collection`] contracts plus [`backend::PipelineBackend`],
//! [`driver::run_pipeline`] evaluates the stage DAG: it routes normal, port,
//! error, and alert records between stages, plans explicit and declarative
//! joins, memoizes intermediate collections under fan-out, and defers all
//! sink writes to a final scheduled flush.
//!
//! The driver is synchronous and single-threaded; the only concurrency is
//! optional parallel sink execution (see [`sink::SinkScheduler`]).

pub mod backend;
pub mod collection;
pub mod driver;
pub mod join;
pub mod plugin;
pub mod record;
pub mod records;
pub mod router;
pub mod sink;

pub use backend::PipelineBackend;
pub use collection::{
    AlertCollection, AlertRef, ErrorCollection, ErrorRef, JoinedCollection, JoinedRef,
    KeyedCollection, KeyedRef, MatchedCollection, MatchedRef, RecordCollection, RecordRef,
    TaggedCollection, TaggedRef,
};
pub use driver::run_pipeline;
pub use join::{
    AutoJoinerContext, JoinCollection, JoinCondition, JoinConfig, JoinDefinition, JoinElement,
    JoinField, JoinKey, JoinMatch, JoinRequest, JoinRow, JoinStage, JoinerRuntimeContext,
};
pub use plugin::{
    FunctionContext, MacroEvaluator, PluginContext, PluginInstance, SinkFunction,
};
pub use record::{Alert, Emitter, ErrorRecord, RecordInfo};
pub use records::{EmittedRecords, EmittedRecordsBuilder, RecordsRegistry};
pub use router::should_cache;
pub use sink::{SinkScheduler, SinkTask};
