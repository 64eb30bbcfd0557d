//! Object-safe lazy collection contracts the engine executes against.
//!
//! A backend exposes distributed datasets as cheap handles; building a handle
//! never blocks on data. The engine composes handles during DAG traversal and
//! only the sink phase (plus alert publishing) moves data. One trait exists
//! per element kind so every method stays object-safe; handles are `Arc`s and
//! must be safe to read concurrently from sink worker threads.
//!
//! The `as_any` hooks exist so a backend can recover its own concrete
//! collection type when handed a foreign handle (union and join operands).

use std::any::Any;
use std::sync::Arc;

use weir_common::Result;

use crate::join::{JoinMatch, JoinRequest, JoinRow};
use crate::plugin::{BatchCompute, FunctionContext, SinkFunction, Windower};
use crate::record::{Alert, ErrorRecord, RecordInfo};
use crate::sink::SinkTask;

/// Handle to a collection of plain records.
pub type RecordRef<T> = Arc<dyn RecordCollection<T>>;
/// Handle to a collection of tagged records.
pub type TaggedRef<T> = Arc<dyn TaggedCollection<T>>;
/// Handle to a collection of error records.
pub type ErrorRef<T> = Arc<dyn ErrorCollection<T>>;
/// Handle to a collection of alerts.
pub type AlertRef<T> = Arc<dyn AlertCollection<T>>;
/// Handle to a keyed `(key, record)` pair collection.
pub type KeyedRef<T> = Arc<dyn KeyedCollection<T>>;
/// Handle to a keyed collection of accumulated join rows.
pub type JoinedRef<T> = Arc<dyn JoinedCollection<T>>;
/// Handle to the result of one keyed join step, before value flattening.
pub type MatchedRef<T> = Arc<dyn MatchedCollection<T>>;

/// Pass filter deriving plain records from a tagged stream.
pub type RecordPassFn<T> = Arc<dyn Fn(&RecordInfo<T>) -> Option<T> + Send + Sync>;
/// Pass filter deriving error records from a tagged stream.
pub type ErrorPassFn<T> = Arc<dyn Fn(&RecordInfo<T>) -> Option<ErrorRecord<T>> + Send + Sync>;
/// Pass filter deriving alerts from a tagged stream.
pub type AlertPassFn<T> = Arc<dyn Fn(&RecordInfo<T>) -> Option<Alert> + Send + Sync>;
/// Seeds a join row from a single keyed record.
pub type JoinSeedFn<T> = Arc<dyn Fn(T) -> JoinRow<T> + Send + Sync>;
/// Value flatten applied after a keyed join step.
pub type JoinFlattenFn<T> = Arc<dyn Fn(JoinMatch<T>) -> JoinRow<T> + Send + Sync>;

/// Collection of plain records flowing between stages.
pub trait RecordCollection<T>: Send + Sync {
    /// Concatenates this collection with `other` (same backend).
    fn union(&self, other: RecordRef<T>) -> RecordRef<T>;

    /// Returns a memoized handle; evaluating it twice computes once.
    fn cache(&self) -> RecordRef<T>;

    /// Runs the stage's transform plugin over every record.
    fn transform(&self, fx: FunctionContext<T>) -> Result<TaggedRef<T>>;

    /// Runs the stage's splitter plugin over every record.
    fn multi_output_transform(&self, fx: FunctionContext<T>) -> Result<TaggedRef<T>>;

    /// Runs a materialized whole-collection compute plugin.
    fn compute(&self, fx: FunctionContext<T>, plugin: Arc<dyn BatchCompute<T>>)
        -> Result<RecordRef<T>>;

    /// Runs a materialized windower plugin.
    fn window(&self, fx: FunctionContext<T>, plugin: Arc<dyn Windower<T>>)
        -> Result<RecordRef<T>>;

    /// Groups and aggregates via the stage's aggregator plugin.
    fn aggregate(&self, fx: FunctionContext<T>, partitions: Option<usize>)
        -> Result<TaggedRef<T>>;

    /// Groups and reduce-aggregates via the stage's reducible aggregator.
    fn reduce_aggregate(
        &self,
        fx: FunctionContext<T>,
        partitions: Option<usize>,
    ) -> Result<TaggedRef<T>>;

    /// Executes a declarative n-way join with this collection on the left.
    fn join(&self, request: JoinRequest<T>) -> Result<RecordRef<T>>;

    /// Defers materialization of this collection into the stage's sink.
    fn create_store_task(&self, fx: FunctionContext<T>, sink: SinkFunction<T>) -> SinkTask;

    /// Backend downcast hook.
    fn as_any(&self) -> &dyn Any;
}

/// Collection of tagged records as emitted by one stage.
pub trait TaggedCollection<T>: Send + Sync {
    /// Returns a memoized handle.
    fn cache(&self) -> TaggedRef<T>;

    /// Derives a record sub-collection via `pass`.
    fn flat_map_records(&self, pass: RecordPassFn<T>) -> RecordRef<T>;

    /// Derives the error sub-collection via `pass`.
    fn flat_map_errors(&self, pass: ErrorPassFn<T>) -> ErrorRef<T>;

    /// Derives the alert sub-collection via `pass`.
    fn flat_map_alerts(&self, pass: AlertPassFn<T>) -> AlertRef<T>;

    /// Backend downcast hook.
    fn as_any(&self) -> &dyn Any;
}

/// Collection of error records routed to error transforms.
pub trait ErrorCollection<T>: Send + Sync {
    /// Concatenates this collection with `other` (same backend).
    fn union(&self, other: ErrorRef<T>) -> ErrorRef<T>;

    /// Returns a memoized handle; evaluating it twice computes once.
    fn cache(&self) -> ErrorRef<T>;

    /// Runs the stage's error-transform plugin over every error record.
    fn error_transform(&self, fx: FunctionContext<T>) -> Result<TaggedRef<T>>;

    /// Backend downcast hook.
    fn as_any(&self) -> &dyn Any;
}

/// Collection of alerts routed to alert publishers.
pub trait AlertCollection<T>: Send + Sync {
    /// Concatenates this collection with `other` (same backend).
    fn union(&self, other: AlertRef<T>) -> AlertRef<T>;

    /// Returns a memoized handle; evaluating it twice computes once.
    fn cache(&self) -> AlertRef<T>;

    /// Materializes the alerts and hands them to the stage's publisher
    /// plugin. The one eager operation outside the sink phase.
    fn publish_alerts(&self, fx: FunctionContext<T>) -> Result<()>;

    /// Backend downcast hook.
    fn as_any(&self) -> &dyn Any;
}

/// Keyed `(key, record)` pairs produced by `add_join_key`.
pub trait KeyedCollection<T>: Send + Sync {
    /// Maps each record into a join row via `seed`.
    fn map_values(&self, seed: JoinSeedFn<T>) -> JoinedRef<T>;

    /// Backend downcast hook.
    fn as_any(&self) -> &dyn Any;
}

/// Keyed join rows accumulated across already-joined inputs.
pub trait JoinedCollection<T>: Send + Sync {
    /// Inner-joins with `right` on the key.
    fn join(&self, right: KeyedRef<T>, partitions: Option<usize>) -> MatchedRef<T>;

    /// Left-outer-joins with `right` on the key.
    fn left_outer_join(&self, right: KeyedRef<T>, partitions: Option<usize>) -> MatchedRef<T>;

    /// Full-outer-joins with `right` on the key.
    fn full_outer_join(&self, right: KeyedRef<T>, partitions: Option<usize>) -> MatchedRef<T>;

    /// Backend downcast hook.
    fn as_any(&self) -> &dyn Any;
}

/// Result of one keyed join step; `map_values` flattens it back into rows.
pub trait MatchedCollection<T>: Send + Sync {
    /// Flattens each match into an accumulated join row.
    fn map_values(&self, flatten: JoinFlattenFn<T>) -> JoinedRef<T>;

    /// Backend downcast hook.
    fn as_any(&self) -> &dyn Any;
}
