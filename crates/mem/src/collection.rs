//! Lazy, memoizing in-memory collections.
//!
//! A [`MemCollection`] is a thunk producing a `Vec` of elements. Operators
//! compose thunks; nothing evaluates until a sink task, an alert publisher,
//! or an explicit [`MemCollection::evaluate`] forces it. `cache` wraps the
//! thunk in a memo cell so shared downstream derivations evaluate the
//! upstream once.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use tracing::debug;
use weir_common::metrics::global_metrics;
use weir_common::stats::StageStatisticsCollector;
use weir_common::{Result, WeirError};
use weir_engine::collection::{
    AlertCollection, AlertPassFn, AlertRef, ErrorCollection, ErrorPassFn, ErrorRef, JoinFlattenFn,
    JoinSeedFn, JoinedCollection, JoinedRef, KeyedCollection, KeyedRef, MatchedCollection,
    MatchedRef, RecordCollection, RecordPassFn, RecordRef, TaggedCollection, TaggedRef,
};
use weir_engine::join::{JoinMatch, JoinRequest, JoinRow};
use weir_engine::plugin::{BatchCompute, FunctionContext, PluginInstance, SinkFunction, Windower};
use weir_engine::record::{Alert, Emitter, ErrorRecord, RecordInfo};
use weir_engine::sink::SinkTask;

use crate::backend::execute_join;
use crate::row::Row;

/// A lazily evaluated in-memory collection of `E`.
pub struct MemCollection<E> {
    inner: Arc<Inner<E>>,
}

struct Inner<E> {
    eval: Box<dyn Fn() -> Result<Vec<E>> + Send + Sync>,
    /// Present only for cached handles. Evaluation failures memoize as the
    /// error message and re-surface as backend errors.
    memo: Option<OnceLock<std::result::Result<Vec<E>, String>>>,
}

impl<E> Clone for MemCollection<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Clone + Send + Sync + 'static> MemCollection<E> {
    /// Creates an uncached collection from a thunk.
    pub fn from_thunk(eval: impl Fn() -> Result<Vec<E>> + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                eval: Box::new(eval),
                memo: None,
            }),
        }
    }

    /// Creates a collection over fixed values.
    pub fn from_values(values: Vec<E>) -> Self {
        Self::from_thunk(move || Ok(values.clone()))
    }

    /// Evaluates the collection. Uncached handles recompute on every call;
    /// cached handles compute once.
    pub fn evaluate(&self) -> Result<Vec<E>> {
        match &self.inner.memo {
            None => (self.inner.eval)(),
            Some(memo) => memo
                .get_or_init(|| (self.inner.eval)().map_err(|e| e.to_string()))
                .clone()
                .map_err(WeirError::Backend),
        }
    }

    /// Returns a memoized handle. Caching an already-cached handle returns
    /// the same handle, so double-caching is free.
    pub fn cached(&self) -> Self {
        if self.inner.memo.is_some() {
            return self.clone();
        }
        let source = self.clone();
        Self {
            inner: Arc::new(Inner {
                eval: Box::new(move || source.evaluate()),
                memo: Some(OnceLock::new()),
            }),
        }
    }
}

/// Recovers the in-memory implementation behind an engine handle.
fn expect_mem<E: Clone + Send + Sync + 'static>(any: &dyn Any) -> Result<MemCollection<E>> {
    any.downcast_ref::<MemCollection<E>>().cloned().ok_or_else(|| {
        WeirError::Backend(
            "collection handle was not produced by the in-memory backend".to_string(),
        )
    })
}

fn plugin_mismatch(stage: &str, expected: &str) -> WeirError {
    WeirError::PluginInstantiation {
        stage: stage.to_string(),
        reason: format!("expected a {expected} plugin"),
    }
}

/// Reports emitted-record counts to the stage collector.
fn report_emitted(collector: &Arc<dyn StageStatisticsCollector>, emitted: &[RecordInfo<Row>]) {
    let mut out = 0;
    let mut errors = 0;
    let mut alerts = 0;
    for info in emitted {
        match info {
            RecordInfo::Output(_) | RecordInfo::PortOutput { .. } => out += 1,
            RecordInfo::Error(_) => errors += 1,
            RecordInfo::Alert(_) => alerts += 1,
        }
    }
    collector.inc_records_out(out);
    collector.inc_errors(errors);
    collector.inc_alerts(alerts);
}

/// Groups records by plugin-supplied keys, preserving first-seen key order.
fn group_records(
    mut keys_of: impl FnMut(&Row) -> Result<Vec<Row>>,
    records: Vec<Row>,
) -> Result<Vec<(Row, Vec<Row>)>> {
    let mut order: Vec<Row> = Vec::new();
    let mut groups: HashMap<Row, Vec<Row>> = HashMap::new();
    for record in records {
        for key in keys_of(&record)? {
            if !groups.contains_key(&key) {
                order.push(key.clone());
            }
            groups.entry(key).or_default().push(record.clone());
        }
    }
    Ok(order
        .into_iter()
        .map(|key| {
            let group = groups.remove(&key).unwrap_or_default();
            (key, group)
        })
        .collect())
}

impl RecordCollection<Row> for MemCollection<Row> {
    fn union(&self, other: RecordRef<Row>) -> RecordRef<Row> {
        let left = self.clone();
        Arc::new(MemCollection::from_thunk(move || {
            let mut out = left.evaluate()?;
            out.extend(expect_mem::<Row>(other.as_any())?.evaluate()?);
            Ok(out)
        }))
    }

    fn cache(&self) -> RecordRef<Row> {
        Arc::new(self.cached())
    }

    fn transform(&self, fx: FunctionContext<Row>) -> Result<TaggedRef<Row>> {
        let input = self.clone();
        Ok(Arc::new(MemCollection::from_thunk(move || {
            let plugin = match fx.instantiate()? {
                PluginInstance::Transform(plugin) => plugin,
                _ => return Err(plugin_mismatch(fx.stage_name(), "transform")),
            };
            let records = input.evaluate()?;
            fx.collector().inc_records_in(records.len() as u64);
            let mut emitter = Emitter::new(fx.stage_name());
            for record in records {
                plugin.transform(record, &mut emitter)?;
            }
            let emitted = emitter.into_emitted();
            report_emitted(fx.collector(), &emitted);
            Ok(emitted)
        })))
    }

    fn multi_output_transform(&self, fx: FunctionContext<Row>) -> Result<TaggedRef<Row>> {
        let input = self.clone();
        Ok(Arc::new(MemCollection::from_thunk(move || {
            let plugin = match fx.instantiate()? {
                PluginInstance::Splitter(plugin) => plugin,
                _ => return Err(plugin_mismatch(fx.stage_name(), "splitter")),
            };
            let records = input.evaluate()?;
            fx.collector().inc_records_in(records.len() as u64);
            let mut emitter = Emitter::new(fx.stage_name());
            for record in records {
                plugin.transform(record, &mut emitter)?;
            }
            let emitted = emitter.into_emitted();
            report_emitted(fx.collector(), &emitted);
            Ok(emitted)
        })))
    }

    fn compute(
        &self,
        fx: FunctionContext<Row>,
        plugin: Arc<dyn BatchCompute<Row>>,
    ) -> Result<RecordRef<Row>> {
        let input = self.clone();
        Ok(Arc::new(MemCollection::from_thunk(move || {
            let records = input.evaluate()?;
            fx.collector().inc_records_in(records.len() as u64);
            let out = plugin.compute(records)?;
            fx.collector().inc_records_out(out.len() as u64);
            Ok(out)
        })))
    }

    fn window(
        &self,
        fx: FunctionContext<Row>,
        plugin: Arc<dyn Windower<Row>>,
    ) -> Result<RecordRef<Row>> {
        let input = self.clone();
        Ok(Arc::new(MemCollection::from_thunk(move || {
            let records = input.evaluate()?;
            fx.collector().inc_records_in(records.len() as u64);
            let mut out = Vec::new();
            for window in plugin.windows(&records)? {
                out.extend(window);
            }
            fx.collector().inc_records_out(out.len() as u64);
            Ok(out)
        })))
    }

    fn aggregate(
        &self,
        fx: FunctionContext<Row>,
        partitions: Option<usize>,
    ) -> Result<TaggedRef<Row>> {
        if let Some(partitions) = partitions {
            debug!(stage = %fx.stage_name(), partitions, "partition hint ignored in memory");
        }
        let input = self.clone();
        Ok(Arc::new(MemCollection::from_thunk(move || {
            let plugin = match fx.instantiate()? {
                PluginInstance::Aggregator(plugin) => plugin,
                _ => return Err(plugin_mismatch(fx.stage_name(), "aggregator")),
            };
            let records = input.evaluate()?;
            fx.collector().inc_records_in(records.len() as u64);
            let mut emitter = Emitter::new(fx.stage_name());
            for (key, group) in group_records(|r| plugin.group_keys(r), records)? {
                plugin.aggregate(&key, group, &mut emitter)?;
            }
            let emitted = emitter.into_emitted();
            report_emitted(fx.collector(), &emitted);
            Ok(emitted)
        })))
    }

    fn reduce_aggregate(
        &self,
        fx: FunctionContext<Row>,
        partitions: Option<usize>,
    ) -> Result<TaggedRef<Row>> {
        if let Some(partitions) = partitions {
            debug!(stage = %fx.stage_name(), partitions, "partition hint ignored in memory");
        }
        let input = self.clone();
        Ok(Arc::new(MemCollection::from_thunk(move || {
            let plugin = match fx.instantiate()? {
                PluginInstance::ReducibleAggregator(plugin) => plugin,
                _ => return Err(plugin_mismatch(fx.stage_name(), "reducible aggregator")),
            };
            let records = input.evaluate()?;
            fx.collector().inc_records_in(records.len() as u64);
            let mut emitter = Emitter::new(fx.stage_name());
            for (key, group) in group_records(|r| plugin.group_keys(r), records)? {
                let mut iter = group.into_iter();
                let Some(first) = iter.next() else { continue };
                let mut acc = plugin.initialize(first)?;
                for record in iter {
                    acc = plugin.merge(acc, record)?;
                }
                plugin.finalize(&key, acc, &mut emitter)?;
            }
            let emitted = emitter.into_emitted();
            report_emitted(fx.collector(), &emitted);
            Ok(emitted)
        })))
    }

    fn join(&self, request: JoinRequest<Row>) -> Result<RecordRef<Row>> {
        let left = self.clone();
        Ok(Arc::new(MemCollection::from_thunk(move || {
            let left_rows = left.evaluate()?;
            execute_join(&request, left_rows)
        })))
    }

    fn create_store_task(&self, fx: FunctionContext<Row>, sink: SinkFunction<Row>) -> SinkTask {
        let input = self.clone();
        let stage = fx.stage_name().to_string();
        SinkTask::new(stage.clone(), move || {
            let started = Instant::now();
            let result = (|| {
                let records = input.evaluate()?;
                fx.collector().inc_records_in(records.len() as u64);
                match &sink {
                    SinkFunction::Batch => match fx.instantiate()? {
                        PluginInstance::Sink(plugin) => plugin.write(records),
                        _ => Err(plugin_mismatch(fx.stage_name(), "sink")),
                    },
                    SinkFunction::Compute(plugin) => plugin.run(records),
                }
            })();
            let run_id = fx.run_info().run_id.to_string();
            let metrics = global_metrics();
            metrics.observe_sink_time(&run_id, &stage, started.elapsed().as_secs_f64());
            if result.is_err() {
                metrics.inc_sink_failure(&run_id, &stage);
            }
            result
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl TaggedCollection<Row> for MemCollection<RecordInfo<Row>> {
    fn cache(&self) -> TaggedRef<Row> {
        Arc::new(self.cached())
    }

    fn flat_map_records(&self, pass: RecordPassFn<Row>) -> RecordRef<Row> {
        let input = self.clone();
        Arc::new(MemCollection::from_thunk(move || {
            Ok(input.evaluate()?.iter().filter_map(|info| pass(info)).collect())
        }))
    }

    fn flat_map_errors(&self, pass: ErrorPassFn<Row>) -> ErrorRef<Row> {
        let input = self.clone();
        Arc::new(MemCollection::from_thunk(move || {
            Ok(input.evaluate()?.iter().filter_map(|info| pass(info)).collect())
        }))
    }

    fn flat_map_alerts(&self, pass: AlertPassFn<Row>) -> AlertRef<Row> {
        let input = self.clone();
        Arc::new(MemCollection::from_thunk(move || {
            Ok(input.evaluate()?.iter().filter_map(|info| pass(info)).collect())
        }))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl ErrorCollection<Row> for MemCollection<ErrorRecord<Row>> {
    fn union(&self, other: ErrorRef<Row>) -> ErrorRef<Row> {
        let left = self.clone();
        Arc::new(MemCollection::from_thunk(move || {
            let mut out = left.evaluate()?;
            out.extend(expect_mem::<ErrorRecord<Row>>(other.as_any())?.evaluate()?);
            Ok(out)
        }))
    }

    fn cache(&self) -> ErrorRef<Row> {
        Arc::new(self.cached())
    }

    fn error_transform(&self, fx: FunctionContext<Row>) -> Result<TaggedRef<Row>> {
        let input = self.clone();
        Ok(Arc::new(MemCollection::from_thunk(move || {
            let plugin = match fx.instantiate()? {
                PluginInstance::ErrorTransform(plugin) => plugin,
                _ => return Err(plugin_mismatch(fx.stage_name(), "error transform")),
            };
            let errors = input.evaluate()?;
            fx.collector().inc_records_in(errors.len() as u64);
            let mut emitter = Emitter::new(fx.stage_name());
            for error in errors {
                plugin.transform(error, &mut emitter)?;
            }
            let emitted = emitter.into_emitted();
            report_emitted(fx.collector(), &emitted);
            Ok(emitted)
        })))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl AlertCollection<Row> for MemCollection<Alert> {
    fn union(&self, other: AlertRef<Row>) -> AlertRef<Row> {
        let left = self.clone();
        Arc::new(MemCollection::from_thunk(move || {
            let mut out = left.evaluate()?;
            out.extend(expect_mem::<Alert>(other.as_any())?.evaluate()?);
            Ok(out)
        }))
    }

    fn cache(&self) -> AlertRef<Row> {
        Arc::new(self.cached())
    }

    fn publish_alerts(&self, fx: FunctionContext<Row>) -> Result<()> {
        let plugin = match fx.instantiate()? {
            PluginInstance::AlertPublisher(plugin) => plugin,
            _ => return Err(plugin_mismatch(fx.stage_name(), "alert publisher")),
        };
        let alerts = self.evaluate()?;
        fx.collector().inc_records_in(alerts.len() as u64);
        plugin.publish(alerts)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl KeyedCollection<Row> for MemCollection<(Row, Row)> {
    fn map_values(&self, seed: JoinSeedFn<Row>) -> JoinedRef<Row> {
        let input = self.clone();
        Arc::new(MemCollection::from_thunk(move || {
            Ok(input
                .evaluate()?
                .into_iter()
                .map(|(key, record)| (key, seed(record)))
                .collect())
        }))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Clone, Copy)]
enum JoinFlavor {
    Inner,
    LeftOuter,
    FullOuter,
}

impl JoinedCollection<Row> for MemCollection<(Row, JoinRow<Row>)> {
    fn join(&self, right: KeyedRef<Row>, partitions: Option<usize>) -> MatchedRef<Row> {
        keyed_join(self.clone(), right, partitions, JoinFlavor::Inner)
    }

    fn left_outer_join(&self, right: KeyedRef<Row>, partitions: Option<usize>) -> MatchedRef<Row> {
        keyed_join(self.clone(), right, partitions, JoinFlavor::LeftOuter)
    }

    fn full_outer_join(&self, right: KeyedRef<Row>, partitions: Option<usize>) -> MatchedRef<Row> {
        keyed_join(self.clone(), right, partitions, JoinFlavor::FullOuter)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// One keyed join step between accumulated rows and a keyed input.
fn keyed_join(
    left: MemCollection<(Row, JoinRow<Row>)>,
    right: KeyedRef<Row>,
    partitions: Option<usize>,
    flavor: JoinFlavor,
) -> MatchedRef<Row> {
    if let Some(partitions) = partitions {
        debug!(partitions, "partition hint ignored in memory");
    }
    Arc::new(MemCollection::from_thunk(move || {
        let left_rows = left.evaluate()?;
        let right_rows = expect_mem::<(Row, Row)>(right.as_any())?.evaluate()?;

        let mut by_key: HashMap<&Row, Vec<usize>> = HashMap::new();
        for (index, (key, _)) in right_rows.iter().enumerate() {
            by_key.entry(key).or_default().push(index);
        }

        let mut matched_right = vec![false; right_rows.len()];
        let mut out: Vec<(Row, JoinMatch<Row>)> = Vec::new();
        for (key, row) in &left_rows {
            match by_key.get(key) {
                Some(indexes) => {
                    for &index in indexes {
                        matched_right[index] = true;
                        out.push((
                            key.clone(),
                            JoinMatch {
                                row: Some(row.clone()),
                                right: Some(right_rows[index].1.clone()),
                            },
                        ));
                    }
                }
                None => {
                    if matches!(flavor, JoinFlavor::LeftOuter | JoinFlavor::FullOuter) {
                        out.push((
                            key.clone(),
                            JoinMatch {
                                row: Some(row.clone()),
                                right: None,
                            },
                        ));
                    }
                }
            }
        }
        if matches!(flavor, JoinFlavor::FullOuter) {
            for (index, (key, record)) in right_rows.iter().enumerate() {
                if !matched_right[index] {
                    out.push((
                        key.clone(),
                        JoinMatch {
                            row: None,
                            right: Some(record.clone()),
                        },
                    ));
                }
            }
        }
        Ok(out)
    }))
}

impl MatchedCollection<Row> for MemCollection<(Row, JoinMatch<Row>)> {
    fn map_values(&self, flatten: JoinFlattenFn<Row>) -> JoinedRef<Row> {
        let input = self.clone();
        Arc::new(MemCollection::from_thunk(move || {
            Ok(input
                .evaluate()?
                .into_iter()
                .map(|(key, matched)| (key, flatten(matched)))
                .collect())
        }))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(counter: &Arc<AtomicUsize>) -> MemCollection<Row> {
        let counter = Arc::clone(counter);
        MemCollection::from_thunk(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(vec![Row::new().with("a", Value::Int(1))])
        })
    }

    #[test]
    fn uncached_handles_recompute_per_evaluation() {
        let counter = Arc::new(AtomicUsize::new(0));
        let collection = counting(&counter);
        collection.evaluate().expect("evaluate");
        collection.evaluate().expect("evaluate");
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cached_handles_compute_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let cached = counting(&counter).cached();
        for _ in 0..3 {
            assert_eq!(cached.evaluate().expect("evaluate").len(), 1);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn caching_twice_is_caching_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let once = counting(&counter).cached();
        let twice = once.cached();
        once.evaluate().expect("evaluate");
        twice.evaluate().expect("evaluate");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cached_failures_surface_as_backend_errors() {
        let cached: MemCollection<Row> = MemCollection::from_thunk(|| {
            Err(WeirError::Backend("no such table".to_string()))
        })
        .cached();
        for _ in 0..2 {
            let err = cached.evaluate().expect_err("failure memoized");
            assert!(matches!(err, WeirError::Backend(_)));
        }
    }

    #[test]
    fn union_concatenates_in_operand_order() {
        let a = MemCollection::from_values(vec![Row::new().with("a", Value::Int(1))]);
        let b = MemCollection::from_values(vec![Row::new().with("a", Value::Int(2))]);
        let union = a.union(Arc::new(b));
        let rows = expect_mem::<Row>(union.as_any())
            .expect("mem handle")
            .evaluate()
            .expect("evaluate");
        assert_eq!(rows[0].get("a"), Some(&Value::Int(1)));
        assert_eq!(rows[1].get("a"), Some(&Value::Int(2)));
    }
}
