#![deny(missing_docs)]

//! Shared configuration, error types, IDs, and observability primitives for weir crates.
//!
//! Architecture role:
//! - defines runtime-argument and per-run context types passed across layers
//! - provides common [`WeirError`] / [`Result`] contracts
//! - hosts the metrics registry and the per-stage statistics contract
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`metrics`]
//! - [`stats`]

/// Runtime arguments and per-run execution context.
pub mod config;
/// Shared error taxonomy.
pub mod error;
/// Strongly-typed identifier wrappers.
pub mod ids;
/// Metrics registry and Prometheus rendering helpers.
pub mod metrics;
/// Per-stage statistics collection contract.
pub mod stats;

pub use config::{ExecutionContext, RuntimeArguments};
pub use error::{Result, WeirError};
pub use ids::RunId;
pub use metrics::MetricsRegistry;
pub use stats::{
    MetricsStageStatisticsCollector, NoopStageStatisticsCollector, StageStatisticsCollector,
};
