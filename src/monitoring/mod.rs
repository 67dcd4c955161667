//! Execution Monitoring Module
//!
//! Real-time tracking of active executions, threshold alerts and
//! per-workflow performance baselines.
//!
//! # Components
//!
//! - [`ExecutionMonitor`]: active execution registry and threshold checks
//! - [`Alert`]: immutable alert records with severities and filters
//! - [`ResourceSampler`]: CPU and memory of the engine process, split per execution

pub mod alert;
pub mod monitor;
pub mod resource;

pub use alert::{Alert, AlertFilter, AlertSummary, AlertType, Severity};
pub use monitor::{
    ActiveExecution, ExecutionMeta, ExecutionMonitor, ExecutionOutcome, ExecutionUpdate, MonitorConfig,
    MonitorStats, PerformanceBaseline,
};
pub use resource::{ResourceSample, ResourceSampler, UsageShare};
