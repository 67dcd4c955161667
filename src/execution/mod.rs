//! Workflow Execution Module
//!
//! Provides the execution engine and the per-run state it drives:
//! admission queue, scheduling, cancellation and results.
//!
//! # Architecture
//!
//! - [`engine`]: The façade orchestrating every component per execution
//! - [`queue`]: Priority admission queue with retry bookkeeping
//! - [`scheduler`]: Dependency-checked plans and cancellation tokens
//! - [`context`]: Per-run mutable state and the final result
//! - [`options`]: Per-request execution options
//! - [`timeline`]: Step start/finish events of one run

pub mod context;
pub mod engine;
pub mod options;
pub mod queue;
pub mod scheduler;
pub mod timeline;

pub use context::{ExecutionContext, ExecutionResult, ExecutionStatus, LogEntry, LogLevel, StepRecord};
pub use engine::{
    EngineMetrics, ExecutionHandle, ExecutionStatusReport, HealthReason, HealthReport, HealthStatus,
    SequentialExecutionEngine,
};
pub use options::{ExecutionOptions, ExecutionStrategy};
pub use queue::{ExecutionQueue, ExecutionRequest, Priority, QueueConfig};
pub use scheduler::{ExecutionScheduler, ScheduledExecution};
pub use timeline::{EventType, ExecutionTimeline, StepSpan};
