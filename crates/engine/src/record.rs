//! Tagged records emitted by pipeline stages.
//!
//! A stage emits a single heterogeneous stream of [`RecordInfo`] elements;
//! the emit router later splits that stream into normal/port/error/alert
//! sub-collections. Record payloads are opaque to the engine.

use std::collections::BTreeMap;

/// A record that failed processing, with the failure context attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord<T> {
    /// The record as it entered the failing stage.
    pub record: T,
    /// Human-readable failure description.
    pub message: String,
    /// Plugin-defined failure code.
    pub code: i32,
    /// Stage that emitted the error.
    pub stage: String,
}

/// An operational alert emitted by a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    /// Stage that emitted the alert.
    pub stage: String,
    /// Alert payload.
    pub payload: BTreeMap<String, String>,
}

/// Tag carried by every element a stage emits. Exactly one tag per record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordInfo<T> {
    /// Normal output record.
    Output(T),
    /// Record leaving through a named splitter port.
    PortOutput {
        /// Destination port name.
        port: String,
        /// The routed record.
        record: T,
    },
    /// Failed record with context.
    Error(ErrorRecord<T>),
    /// Operational alert.
    Alert(Alert),
}

/// Collects tagged records during a single plugin invocation.
#[derive(Debug)]
pub struct Emitter<T> {
    stage: String,
    emitted: Vec<RecordInfo<T>>,
}

impl<T> Emitter<T> {
    /// Creates an emitter attributing errors and alerts to `stage`.
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            emitted: Vec::new(),
        }
    }

    /// Emits a normal output record.
    pub fn emit(&mut self, record: T) {
        self.emitted.push(RecordInfo::Output(record));
    }

    /// Emits a record to the named splitter port.
    pub fn emit_port(&mut self, port: impl Into<String>, record: T) {
        self.emitted.push(RecordInfo::PortOutput {
            port: port.into(),
            record,
        });
    }

    /// Emits a failed record.
    pub fn emit_error(&mut self, record: T, code: i32, message: impl Into<String>) {
        self.emitted.push(RecordInfo::Error(ErrorRecord {
            record,
            message: message.into(),
            code,
            stage: self.stage.clone(),
        }));
    }

    /// Emits an operational alert.
    pub fn emit_alert(&mut self, payload: BTreeMap<String, String>) {
        self.emitted.push(RecordInfo::Alert(Alert {
            stage: self.stage.clone(),
            payload,
        }));
    }

    /// Consumes the emitter, returning everything emitted in order.
    pub fn into_emitted(self) -> Vec<RecordInfo<T>> {
        self.emitted
    }
}
