//! In-memory pipeline backend: sources, join keying, and n-way joins.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use weir_common::{Result, WeirError};
use weir_engine::backend::PipelineBackend;
use weir_engine::collection::{JoinedRef, KeyedRef, RecordRef, TaggedRef};
use weir_engine::join::{JoinField, JoinRequest, JoinRow};
use weir_engine::plugin::{FunctionContext, PluginInstance};
use weir_engine::record::Emitter;

use crate::collection::MemCollection;
use crate::row::{Row, Value};

/// Backend executing pipelines entirely in process memory.
///
/// Broadcast flags on join sides are accepted and ignored: everything is
/// already local, so there is nothing to replicate.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemBackend;

impl MemBackend {
    /// Creates the backend.
    pub fn new() -> Self {
        Self
    }
}

fn expect_mem_records(input: &RecordRef<Row>) -> Result<MemCollection<Row>> {
    input
        .as_any()
        .downcast_ref::<MemCollection<Row>>()
        .cloned()
        .ok_or_else(|| {
            WeirError::Backend(
                "collection handle was not produced by the in-memory backend".to_string(),
            )
        })
}

impl PipelineBackend<Row> for MemBackend {
    fn get_source(&self, fx: FunctionContext<Row>) -> Result<TaggedRef<Row>> {
        Ok(Arc::new(MemCollection::from_thunk(move || {
            let plugin = match fx.instantiate()? {
                PluginInstance::Source(plugin) => plugin,
                _ => {
                    return Err(WeirError::PluginInstantiation {
                        stage: fx.stage_name().to_string(),
                        reason: "expected a source plugin".to_string(),
                    })
                }
            };
            let mut emitter = Emitter::new(fx.stage_name());
            plugin.read(&mut emitter)?;
            let emitted = emitter.into_emitted();
            fx.collector().inc_records_out(emitted.len() as u64);
            Ok(emitted)
        })))
    }

    fn add_join_key(
        &self,
        fx: FunctionContext<Row>,
        input_stage: &str,
        input: RecordRef<Row>,
    ) -> Result<KeyedRef<Row>> {
        let input = expect_mem_records(&input)?;
        let input_stage = input_stage.to_string();
        Ok(Arc::new(MemCollection::from_thunk(move || {
            let joiner = match fx.instantiate()? {
                PluginInstance::Joiner(joiner) => joiner,
                _ => {
                    return Err(WeirError::UnknownJoinerType {
                        stage: fx.stage_name().to_string(),
                    })
                }
            };
            let mut out = Vec::new();
            for record in input.evaluate()? {
                let key = joiner.join_key(&input_stage, &record)?;
                out.push((key, record));
            }
            Ok(out)
        })))
    }

    fn merge_join_results(
        &self,
        fx: FunctionContext<Row>,
        joined: JoinedRef<Row>,
    ) -> Result<RecordRef<Row>> {
        let joined = joined
            .as_any()
            .downcast_ref::<MemCollection<(Row, JoinRow<Row>)>>()
            .cloned()
            .ok_or_else(|| {
                WeirError::Backend(
                    "collection handle was not produced by the in-memory backend".to_string(),
                )
            })?;
        Ok(Arc::new(MemCollection::from_thunk(move || {
            let joiner = match fx.instantiate()? {
                PluginInstance::Joiner(joiner) => joiner,
                _ => {
                    return Err(WeirError::UnknownJoinerType {
                        stage: fx.stage_name().to_string(),
                    })
                }
            };
            let mut out = Vec::new();
            for (key, row) in joined.evaluate()? {
                out.extend(joiner.merge(&key, &row)?);
            }
            fx.collector().inc_records_out(out.len() as u64);
            Ok(out)
        })))
    }
}

/// One in-flight result row of an n-way join.
struct JoinedSides {
    /// Canonical key values; `None` marks a row that can never match
    /// (a null key under non-null-safe comparison).
    key: Option<Vec<Value>>,
    /// stage name -> matched record.
    sides: BTreeMap<String, Row>,
}

/// Executes a planned declarative join over materialized rows.
///
/// Sides join pairwise in request order. A side marked required drops
/// unmatched result rows; a non-required side null-extends them. Unmatched
/// rows of the side itself are kept while no required side has participated
/// yet (full-outer territory), matching the join semantics the planner
/// encoded in the request.
pub(crate) fn execute_join(request: &JoinRequest<Row>, left_rows: Vec<Row>) -> Result<Vec<Row>> {
    let null_safe = request.null_safe;
    let mut acc: Vec<JoinedSides> = left_rows
        .into_iter()
        .map(|row| JoinedSides {
            key: extract_key(&row, &request.left_keys, null_safe),
            sides: BTreeMap::from([(request.left_stage.clone(), row)]),
        })
        .collect();
    let mut acc_required = request.left_required;

    for side in &request.right {
        let rows = side
            .collection
            .as_any()
            .downcast_ref::<MemCollection<Row>>()
            .cloned()
            .ok_or_else(|| {
                WeirError::Backend(
                    "collection handle was not produced by the in-memory backend".to_string(),
                )
            })?
            .evaluate()?;
        let keyed: Vec<(Option<Vec<Value>>, Row)> = rows
            .into_iter()
            .map(|row| (extract_key(&row, &side.keys, null_safe), row))
            .collect();

        let mut by_key: HashMap<&[Value], Vec<usize>> = HashMap::new();
        for (index, (key, _)) in keyed.iter().enumerate() {
            if let Some(key) = key {
                by_key.entry(key.as_slice()).or_default().push(index);
            }
        }

        let mut matched_right = vec![false; keyed.len()];
        let mut next: Vec<JoinedSides> = Vec::new();
        for entry in acc {
            let matches: &[usize] = entry
                .key
                .as_ref()
                .and_then(|key| by_key.get(key.as_slice()))
                .map_or(&[], Vec::as_slice);
            if matches.is_empty() {
                if !side.required {
                    next.push(entry);
                }
                continue;
            }
            for &index in matches {
                matched_right[index] = true;
                let mut sides = entry.sides.clone();
                sides.insert(side.stage.clone(), keyed[index].1.clone());
                next.push(JoinedSides {
                    key: entry.key.clone(),
                    sides,
                });
            }
        }

        if !acc_required {
            for (index, (key, row)) in keyed.iter().enumerate() {
                if !matched_right[index] {
                    next.push(JoinedSides {
                        key: key.clone(),
                        sides: BTreeMap::from([(side.stage.clone(), row.clone())]),
                    });
                }
            }
        }

        acc_required = acc_required || side.required;
        acc = next;
    }

    Ok(acc
        .into_iter()
        .map(|entry| project(&entry.sides, &request.selected_fields))
        .collect())
}

/// Extracts key values; `None` marks an unmatchable null key.
fn extract_key(row: &Row, fields: &[String], null_safe: bool) -> Option<Vec<Value>> {
    let mut key = Vec::with_capacity(fields.len());
    for field in fields {
        let value = row.get(field).cloned().unwrap_or(Value::Null);
        if matches!(value, Value::Null) && !null_safe {
            return None;
        }
        key.push(value);
    }
    Some(key)
}

/// Builds the output record from the matched sides.
fn project(sides: &BTreeMap<String, Row>, selected: &[JoinField]) -> Row {
    let mut row = Row::new();
    if selected.is_empty() {
        for side in sides.values() {
            for (name, value) in side.fields() {
                row.set(name, value.clone());
            }
        }
        return row;
    }
    for field in selected {
        let value = sides
            .get(&field.stage)
            .and_then(|side| side.get(&field.field))
            .cloned()
            .unwrap_or(Value::Null);
        row.set(field.alias.as_deref().unwrap_or(&field.field), value);
    }
    row
}
