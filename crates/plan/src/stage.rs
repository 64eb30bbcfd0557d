use std::collections::BTreeMap;
use std::fmt;

use arrow_schema::Schema;
use serde::{Deserialize, Serialize};

/// Closed set of plugin kinds the stage dispatcher understands.
///
/// The dispatcher matches exhaustively on this enum; a plan carrying a kind
/// outside this set cannot be represented, so there is no runtime
/// "unsupported plugin" path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PluginKind {
    /// Reads records from external storage; has no pipeline inputs.
    Source,
    /// Writes its input collection to external storage.
    Sink,
    /// Record-at-a-time transform emitting normal output, errors, and alerts.
    Transform,
    /// Transform routing each record to one of several named output ports.
    Splitter,
    /// Consumes the error records of its upstream stages.
    ErrorTransform,
    /// Whole-collection transform driven by a materialized plugin instance.
    Compute,
    /// Whole-collection sink driven by a materialized plugin instance.
    ComputeSink,
    /// Group-and-aggregate over the input collection.
    Aggregator,
    /// Aggregator with an associative partial-reduce form.
    ReducibleAggregator,
    /// Multi-input join stage (explicit or declarative).
    Joiner,
    /// Assigns records to windows.
    Windower,
    /// Publishes the alerts of its upstream stages.
    AlertPublisher,
    /// Phase-boundary stage; acts as a source or sink of its phase.
    Connector,
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PluginKind::Source => "source",
            PluginKind::Sink => "sink",
            PluginKind::Transform => "transform",
            PluginKind::Splitter => "splitter",
            PluginKind::ErrorTransform => "error-transform",
            PluginKind::Compute => "compute",
            PluginKind::ComputeSink => "compute-sink",
            PluginKind::Aggregator => "aggregator",
            PluginKind::ReducibleAggregator => "reducible-aggregator",
            PluginKind::Joiner => "joiner",
            PluginKind::Windower => "windower",
            PluginKind::AlertPublisher => "alert-publisher",
            PluginKind::Connector => "connector",
        };
        f.write_str(name)
    }
}

/// Named output channel of a splitter stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    /// Port name; each downstream stage subscribes to exactly one.
    pub name: String,
}

impl Port {
    /// Creates a port with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Frozen per-stage contract from the compiled plan.
///
/// Schemas are carried for plugin consumption only; the engine never
/// interprets them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSpec {
    /// Unique stage name within the plan.
    pub name: String,
    /// Plugin kind tag driving dispatch.
    pub plugin_kind: PluginKind,
    /// Configured plugin name, resolved by the plugin context.
    pub plugin_name: String,
    /// Schema of records arriving from each input stage.
    #[serde(default)]
    pub input_schemas: BTreeMap<String, Schema>,
    /// Schema of normal output records; absent for sinks and publishers.
    #[serde(default)]
    pub output_schema: Option<Schema>,
    /// Output-stage-name -> port mapping; non-empty only for splitters.
    #[serde(default)]
    pub output_ports: BTreeMap<String, Port>,
}

impl StageSpec {
    /// Creates a spec with no schemas or ports attached.
    pub fn new(
        name: impl Into<String>,
        plugin_kind: PluginKind,
        plugin_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            plugin_kind,
            plugin_name: plugin_name.into(),
            input_schemas: BTreeMap::new(),
            output_schema: None,
            output_ports: BTreeMap::new(),
        }
    }

    /// Attaches the normal output schema.
    pub fn with_output_schema(mut self, schema: Schema) -> Self {
        self.output_schema = Some(schema);
        self
    }

    /// Attaches the schema of records arriving from `input_stage`.
    pub fn with_input_schema(mut self, input_stage: impl Into<String>, schema: Schema) -> Self {
        self.input_schemas.insert(input_stage.into(), schema);
        self
    }

    /// Declares that records for `output_stage` leave through `port`.
    pub fn with_port(mut self, output_stage: impl Into<String>, port: impl Into<String>) -> Self {
        self.output_ports
            .insert(output_stage.into(), Port::new(port));
        self
    }

    /// Returns the port name feeding `output_stage`, if one is declared.
    pub fn port_for(&self, output_stage: &str) -> Option<&str> {
        self.output_ports
            .get(output_stage)
            .map(|p| p.name.as_str())
    }
}
