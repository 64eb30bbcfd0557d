//! Shared fixtures: a registry-backed plugin context and small test plugins.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use weir_common::config::ExecutionContext;
use weir_common::{Result, RunId, WeirError};
use weir_engine::join::{JoinConfig, JoinDefinition, JoinRow, JoinerRuntimeContext};
use weir_engine::plugin::{
    AlertPublisher, BatchAggregator, BatchCompute, BatchJoiner, BatchSink, BatchSource,
    ComputeSink, ErrorTransform, MacroEvaluator, PluginContext, PluginInstance,
    ReducibleAggregator, SplitterTransform, Transform, Windower,
};
use weir_engine::record::{Alert, Emitter, ErrorRecord};
use weir_engine::run_pipeline;
use weir_engine::AutoJoinerContext;
use weir_mem::{MemBackend, Row, Value};
use weir_plan::{PipelinePlan, PluginKind};

/// Plugin context backed by a fixed stage -> instance map.
pub struct TestPluginContext {
    plugins: BTreeMap<String, PluginInstance<Row>>,
}

impl TestPluginContext {
    pub fn new() -> Self {
        Self {
            plugins: BTreeMap::new(),
        }
    }

    pub fn register(mut self, stage: &str, instance: PluginInstance<Row>) -> Self {
        self.plugins.insert(stage.to_string(), instance);
        self
    }
}

impl PluginContext<Row> for TestPluginContext {
    fn new_plugin_instance(
        &self,
        stage: &str,
        _macros: &MacroEvaluator,
    ) -> Result<PluginInstance<Row>> {
        self.plugins
            .get(stage)
            .cloned()
            .ok_or_else(|| WeirError::PluginInstantiation {
                stage: stage.to_string(),
                reason: "no plugin registered".to_string(),
            })
    }
}

/// Runs a plan against the in-memory backend with the given runtime args.
pub fn run_with_args(
    plan: &PipelinePlan,
    plugins: TestPluginContext,
    args: &[(&str, &str)],
) -> Result<()> {
    let ctx = ExecutionContext::new(
        RunId(1),
        "default",
        1_700_000_000_000,
        args.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    );
    run_pipeline(
        plan,
        PluginKind::Source,
        &ctx,
        &MemBackend::new(),
        &BTreeMap::new(),
        Arc::new(plugins),
        &BTreeMap::new(),
    )
}

pub fn run(plan: &PipelinePlan, plugins: TestPluginContext) -> Result<()> {
    run_with_args(plan, plugins, &[])
}

pub fn connections(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(a, b)| (a.to_string(), b.to_string()))
        .collect()
}

pub fn int_row(pairs: &[(&str, i64)]) -> Row {
    let mut row = Row::new();
    for (name, value) in pairs {
        row.set(*name, Value::Int(*value));
    }
    row
}

/// Source emitting fixed rows, counting how often it is evaluated.
pub struct VecSource {
    rows: Vec<Row>,
    reads: Arc<AtomicUsize>,
}

impl VecSource {
    pub fn new(rows: Vec<Row>) -> (Arc<Self>, Arc<AtomicUsize>) {
        let reads = Arc::new(AtomicUsize::new(0));
        (
            Arc::new(Self {
                rows,
                reads: Arc::clone(&reads),
            }),
            reads,
        )
    }
}

impl BatchSource<Row> for VecSource {
    fn read(&self, emitter: &mut Emitter<Row>) -> Result<()> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        for row in &self.rows {
            emitter.emit(row.clone());
        }
        Ok(())
    }
}

/// Doubles an integer field.
pub struct DoubleTransform {
    pub field: String,
}

impl Transform<Row> for DoubleTransform {
    fn transform(&self, mut record: Row, emitter: &mut Emitter<Row>) -> Result<()> {
        let value = match record.get(&self.field) {
            Some(Value::Int(v)) => *v,
            other => {
                return Err(WeirError::Backend(format!(
                    "field '{}' is not an integer: {other:?}",
                    self.field
                )))
            }
        };
        record.set(self.field.as_str(), Value::Int(value * 2));
        emitter.emit(record);
        Ok(())
    }
}

/// Routes zero values to the error stream, everything else onward.
pub struct RejectZero {
    pub field: String,
}

impl Transform<Row> for RejectZero {
    fn transform(&self, record: Row, emitter: &mut Emitter<Row>) -> Result<()> {
        if record.get(&self.field) == Some(&Value::Int(0)) {
            emitter.emit_error(record, 1, "zero value rejected");
        } else {
            emitter.emit(record);
        }
        Ok(())
    }
}

/// Emits every record and raises an alert for values above the threshold.
pub struct AlertOnHigh {
    pub field: String,
    pub threshold: i64,
}

impl Transform<Row> for AlertOnHigh {
    fn transform(&self, record: Row, emitter: &mut Emitter<Row>) -> Result<()> {
        if let Some(Value::Int(v)) = record.get(&self.field) {
            if *v > self.threshold {
                emitter.emit_alert(BTreeMap::from([(
                    "value".to_string(),
                    v.to_string(),
                )]));
            }
        }
        emitter.emit(record);
        Ok(())
    }
}

/// Splits records by comparing an integer field against a threshold.
pub struct ThresholdSplitter {
    pub field: String,
    pub threshold: i64,
    pub high_port: String,
    pub low_port: String,
}

impl SplitterTransform<Row> for ThresholdSplitter {
    fn transform(&self, record: Row, emitter: &mut Emitter<Row>) -> Result<()> {
        match record.get(&self.field) {
            Some(Value::Int(v)) if *v >= self.threshold => {
                emitter.emit_port(self.high_port.as_str(), record);
            }
            Some(Value::Int(_)) => {
                emitter.emit_port(self.low_port.as_str(), record);
            }
            _ => emitter.emit_error(record, 2, "missing split field"),
        }
        Ok(())
    }
}

/// Turns error records back into rows carrying the failure message.
pub struct ErrorToRow;

impl ErrorTransform<Row> for ErrorToRow {
    fn transform(&self, error: ErrorRecord<Row>, emitter: &mut Emitter<Row>) -> Result<()> {
        let mut row = error.record;
        row.set("error_message", Value::Str(error.message));
        row.set("error_stage", Value::Str(error.stage));
        emitter.emit(row);
        Ok(())
    }
}

/// Sink collecting rows and appending its label to a shared execution log.
pub struct CollectSink {
    pub label: String,
    pub rows: Arc<Mutex<Vec<Row>>>,
    pub log: Arc<Mutex<Vec<String>>>,
}

impl CollectSink {
    pub fn new(label: &str) -> (Arc<Self>, Arc<Mutex<Vec<Row>>>) {
        let rows = Arc::new(Mutex::new(Vec::new()));
        (
            Arc::new(Self {
                label: label.to_string(),
                rows: Arc::clone(&rows),
                log: Arc::new(Mutex::new(Vec::new())),
            }),
            rows,
        )
    }

    pub fn with_log(label: &str, log: Arc<Mutex<Vec<String>>>) -> (Arc<Self>, Arc<Mutex<Vec<Row>>>) {
        let rows = Arc::new(Mutex::new(Vec::new()));
        (
            Arc::new(Self {
                label: label.to_string(),
                rows: Arc::clone(&rows),
                log,
            }),
            rows,
        )
    }
}

impl BatchSink<Row> for CollectSink {
    fn write(&self, records: Vec<Row>) -> Result<()> {
        self.log.lock().expect("log lock").push(self.label.clone());
        self.rows.lock().expect("rows lock").extend(records);
        Ok(())
    }
}

/// Sink failing every write.
pub struct FailingSink {
    pub message: String,
}

impl BatchSink<Row> for FailingSink {
    fn write(&self, _records: Vec<Row>) -> Result<()> {
        Err(WeirError::Backend(self.message.clone()))
    }
}

/// Whole-collection compute stamping a constant field on every row.
pub struct StampCompute {
    pub field: String,
    pub value: i64,
}

impl BatchCompute<Row> for StampCompute {
    fn compute(&self, records: Vec<Row>) -> Result<Vec<Row>> {
        Ok(records
            .into_iter()
            .map(|row| row.with(self.field.as_str(), Value::Int(self.value)))
            .collect())
    }
}

/// Compute sink collecting the full input.
pub struct CollectComputeSink {
    pub rows: Arc<Mutex<Vec<Row>>>,
}

impl CollectComputeSink {
    pub fn new() -> (Arc<Self>, Arc<Mutex<Vec<Row>>>) {
        let rows = Arc::new(Mutex::new(Vec::new()));
        (
            Arc::new(Self {
                rows: Arc::clone(&rows),
            }),
            rows,
        )
    }
}

impl ComputeSink<Row> for CollectComputeSink {
    fn run(&self, records: Vec<Row>) -> Result<()> {
        self.rows.lock().expect("rows lock").extend(records);
        Ok(())
    }
}

/// Counts records per integer key field.
pub struct CountAggregator {
    pub key_field: String,
}

impl BatchAggregator<Row> for CountAggregator {
    fn group_keys(&self, record: &Row) -> Result<Vec<Row>> {
        let key = record.get(&self.key_field).cloned().unwrap_or(Value::Null);
        Ok(vec![Row::new().with(self.key_field.as_str(), key)])
    }

    fn aggregate(&self, key: &Row, records: Vec<Row>, emitter: &mut Emitter<Row>) -> Result<()> {
        emitter.emit(
            key.clone()
                .with("count", Value::Int(records.len() as i64)),
        );
        Ok(())
    }
}

/// Sums an integer field per key via the reducible contract.
pub struct SumReducer {
    pub key_field: String,
    pub value_field: String,
}

impl ReducibleAggregator<Row> for SumReducer {
    fn group_keys(&self, record: &Row) -> Result<Vec<Row>> {
        let key = record.get(&self.key_field).cloned().unwrap_or(Value::Null);
        Ok(vec![Row::new().with(self.key_field.as_str(), key)])
    }

    fn initialize(&self, record: Row) -> Result<Row> {
        let value = int_field(&record, &self.value_field);
        Ok(Row::new().with("sum", Value::Int(value)))
    }

    fn merge(&self, accumulated: Row, record: Row) -> Result<Row> {
        let sum = int_field(&accumulated, "sum") + int_field(&record, &self.value_field);
        Ok(Row::new().with("sum", Value::Int(sum)))
    }

    fn finalize(&self, key: &Row, accumulated: Row, emitter: &mut Emitter<Row>) -> Result<()> {
        emitter.emit(
            key.clone()
                .with("sum", Value::Int(int_field(&accumulated, "sum"))),
        );
        Ok(())
    }
}

fn int_field(row: &Row, field: &str) -> i64 {
    match row.get(field) {
        Some(Value::Int(v)) => *v,
        _ => 0,
    }
}

/// Splits the input into fixed-size windows.
pub struct ChunkWindower {
    pub size: usize,
}

impl Windower<Row> for ChunkWindower {
    fn windows(&self, records: &[Row]) -> Result<Vec<Vec<Row>>> {
        Ok(records.chunks(self.size.max(1)).map(<[Row]>::to_vec).collect())
    }
}

/// Explicit joiner keying on one field and merging all sides' fields.
pub struct KeyJoiner {
    pub key_field: String,
    pub required: Vec<String>,
}

impl BatchJoiner<Row> for KeyJoiner {
    fn initialize(&self, _context: &JoinerRuntimeContext) -> Result<()> {
        Ok(())
    }

    fn join_config(&self) -> JoinConfig {
        JoinConfig {
            required_inputs: self.required.clone(),
        }
    }

    fn join_key(&self, _input_stage: &str, record: &Row) -> Result<Row> {
        let key = record.get(&self.key_field).cloned().unwrap_or(Value::Null);
        Ok(Row::new().with(self.key_field.as_str(), key))
    }

    fn merge(&self, _key: &Row, row: &JoinRow<Row>) -> Result<Vec<Row>> {
        let mut out = Row::new();
        for element in row {
            for (name, value) in element.record.fields() {
                out.set(name, value.clone());
            }
        }
        Ok(vec![out])
    }
}

/// Auto joiner returning a fixed definition.
pub struct DeclaredJoin {
    pub definition: JoinDefinition,
}

impl weir_engine::plugin::AutoJoiner for DeclaredJoin {
    fn define(&self, _context: &AutoJoinerContext) -> Result<JoinDefinition> {
        Ok(self.definition.clone())
    }
}

/// Alert publisher collecting everything it receives.
pub struct CollectAlerts {
    pub alerts: Arc<Mutex<Vec<Alert>>>,
}

impl CollectAlerts {
    pub fn new() -> (Arc<Self>, Arc<Mutex<Vec<Alert>>>) {
        let alerts = Arc::new(Mutex::new(Vec::new()));
        (
            Arc::new(Self {
                alerts: Arc::clone(&alerts),
            }),
            alerts,
        )
    }
}

impl AlertPublisher for CollectAlerts {
    fn publish(&self, alerts: Vec<Alert>) -> Result<()> {
        self.alerts.lock().expect("alerts lock").extend(alerts);
        Ok(())
    }
}
