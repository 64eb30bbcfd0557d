//! Per-stage emitted-records store.

use std::collections::BTreeMap;

use crate::collection::{AlertRef, ErrorRef, RecordRef};

/// Everything one stage emitted, split by kind.
///
/// Built exactly once per stage and never mutated. For a non-splitter stage
/// `output_ports` is empty; for a splitter `output` is absent and every
/// declared port has an entry. `errors`/`alerts` are populated only when a
/// downstream stage consumes them.
pub struct EmittedRecords<T> {
    output: Option<RecordRef<T>>,
    output_ports: BTreeMap<String, RecordRef<T>>,
    errors: Option<ErrorRef<T>>,
    alerts: Option<AlertRef<T>>,
}

impl<T> EmittedRecords<T> {
    /// Starts building a stage's emitted records.
    pub fn builder() -> EmittedRecordsBuilder<T> {
        EmittedRecordsBuilder {
            output: None,
            output_ports: BTreeMap::new(),
            errors: None,
            alerts: None,
        }
    }

    /// Records for a stage that emits nothing (sinks, alert publishers).
    pub fn empty() -> Self {
        Self::builder().build()
    }

    /// The normal output collection, if populated.
    pub fn output(&self) -> Option<&RecordRef<T>> {
        self.output.as_ref()
    }

    /// The collection leaving through `port`, if declared.
    pub fn port(&self, port: &str) -> Option<&RecordRef<T>> {
        self.output_ports.get(port)
    }

    /// All per-port collections in port-name order.
    pub fn output_ports(&self) -> &BTreeMap<String, RecordRef<T>> {
        &self.output_ports
    }

    /// The error collection, if populated.
    pub fn errors(&self) -> Option<&ErrorRef<T>> {
        self.errors.as_ref()
    }

    /// The alert collection, if populated.
    pub fn alerts(&self) -> Option<&AlertRef<T>> {
        self.alerts.as_ref()
    }
}

/// Builder for [`EmittedRecords`].
pub struct EmittedRecordsBuilder<T> {
    output: Option<RecordRef<T>>,
    output_ports: BTreeMap<String, RecordRef<T>>,
    errors: Option<ErrorRef<T>>,
    alerts: Option<AlertRef<T>>,
}

impl<T> EmittedRecordsBuilder<T> {
    /// Sets the normal output collection.
    pub fn set_output(mut self, records: RecordRef<T>) -> Self {
        self.output = Some(records);
        self
    }

    /// Adds one port's collection.
    pub fn add_port(mut self, port: impl Into<String>, records: RecordRef<T>) -> Self {
        self.output_ports.insert(port.into(), records);
        self
    }

    /// Sets the error collection.
    pub fn set_errors(mut self, errors: ErrorRef<T>) -> Self {
        self.errors = Some(errors);
        self
    }

    /// Sets the alert collection.
    pub fn set_alerts(mut self, alerts: AlertRef<T>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    /// Freezes the emitted records.
    pub fn build(self) -> EmittedRecords<T> {
        EmittedRecords {
            output: self.output,
            output_ports: self.output_ports,
            errors: self.errors,
            alerts: self.alerts,
        }
    }
}

/// Stage-name -> emitted-records map owned by the driver for one run.
///
/// Entries are single-assignment: registering a stage twice is a bug in the
/// driver, not a data error, and panics.
pub struct RecordsRegistry<T> {
    entries: BTreeMap<String, EmittedRecords<T>>,
}

impl<T> RecordsRegistry<T> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Registers a stage's emitted records.
    ///
    /// # Panics
    ///
    /// Panics if `stage` was already registered.
    pub fn insert(&mut self, stage: &str, records: EmittedRecords<T>) {
        let previous = self.entries.insert(stage.to_string(), records);
        assert!(
            previous.is_none(),
            "emitted records for stage '{stage}' registered twice"
        );
    }

    /// Looks up a stage's emitted records.
    pub fn get(&self, stage: &str) -> Option<&EmittedRecords<T>> {
        self.entries.get(stage)
    }
}

impl<T> Default for RecordsRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "registered twice")]
    fn registry_rejects_double_registration() {
        let mut registry: RecordsRegistry<i64> = RecordsRegistry::new();
        registry.insert("parse", EmittedRecords::empty());
        registry.insert("parse", EmittedRecords::empty());
    }

    #[test]
    fn empty_records_have_no_streams() {
        let records: EmittedRecords<i64> = EmittedRecords::empty();
        assert!(records.output().is_none());
        assert!(records.output_ports().is_empty());
        assert!(records.errors().is_none());
        assert!(records.alerts().is_none());
    }
}
