//! Backend-specific entry points beyond the collection contracts.

use weir_common::Result;

use crate::collection::{JoinedRef, KeyedRef, RecordRef, TaggedRef};
use crate::plugin::FunctionContext;

/// The three operations a compute backend must provide in addition to the
/// collection methods: creating source collections, keying join inputs, and
/// merging joined rows through the joiner plugin.
///
/// Collection handles produced here must be safe to read concurrently from
/// sink worker threads.
pub trait PipelineBackend<T>: Send + Sync {
    /// Lazily builds the tagged source collection for a source stage.
    fn get_source(&self, fx: FunctionContext<T>) -> Result<TaggedRef<T>>;

    /// Keys `input` by the joiner's join key for `input_stage`.
    fn add_join_key(
        &self,
        fx: FunctionContext<T>,
        input_stage: &str,
        input: RecordRef<T>,
    ) -> Result<KeyedRef<T>>;

    /// Merges accumulated join rows into output records via the joiner
    /// plugin's `merge`.
    fn merge_join_results(
        &self,
        fx: FunctionContext<T>,
        joined: JoinedRef<T>,
    ) -> Result<RecordRef<T>>;
}
