//! Engine Error Types
//!
//! A single error enum covers every failure the engine can surface to a
//! caller, from admission (queue, resources) through step execution.
//! Cache misses are not errors; [`crate::cache::ExecutionCache::lookup`]
//! returns `None` instead.

use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised by the execution engine and its components.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The admission queue is at capacity.
    #[error("execution queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// The request can never be satisfied by the configured ceilings.
    #[error("resources unavailable for '{execution_id}': {reason}")]
    ResourceUnavailable { execution_id: String, reason: String },

    /// No allocation became possible before the wait timed out.
    #[error("allocation for '{execution_id}' timed out after {waited:?}")]
    AllocationTimeout {
        execution_id: String,
        waited: Duration,
    },

    /// Step dependencies form a cycle.
    #[error("dependency cycle detected between steps: {}", steps.join(", "))]
    DependencyCycle { steps: Vec<String> },

    /// A step was ordered (or about to start) before one of its dependencies.
    #[error("step '{step}' cannot run before its dependency '{dependency}'")]
    DependencyViolation { step: String, dependency: String },

    /// A step reported failure, panicked or timed out.
    #[error("step '{step}' failed: {message}")]
    StepExecutionFailure { step: String, message: String },

    /// An optimization stage failed; the engine falls back to the last good step list.
    #[error("optimization stage '{stage}' failed: {message}")]
    OptimizationFailure { stage: String, message: String },

    /// The execution exceeded its overall deadline.
    #[error("execution '{execution_id}' exceeded its timeout of {timeout:?}")]
    ExecutionTimeout {
        execution_id: String,
        timeout: Duration,
    },

    /// The execution was cancelled before completion.
    #[error("execution '{execution_id}' was cancelled")]
    Cancelled { execution_id: String },

    /// The task running the execution ended without producing a result.
    #[error("execution '{execution_id}' was aborted before it reported a result")]
    Aborted { execution_id: String },

    /// Invalid engine configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Invalid workflow definition.
    #[error("invalid workflow: {0}")]
    Workflow(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Returns true for failures that may succeed when the request is retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StepExecutionFailure { .. }
                | Self::ExecutionTimeout { .. }
                | Self::AllocationTimeout { .. }
        )
    }

    /// Short machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::QueueFull { .. } => "queue_full",
            Self::ResourceUnavailable { .. } => "resource_unavailable",
            Self::AllocationTimeout { .. } => "allocation_timeout",
            Self::DependencyCycle { .. } => "dependency_cycle",
            Self::DependencyViolation { .. } => "dependency_violation",
            Self::StepExecutionFailure { .. } => "step_execution_failure",
            Self::OptimizationFailure { .. } => "optimization_failure",
            Self::ExecutionTimeout { .. } => "execution_timeout",
            Self::Cancelled { .. } => "cancelled",
            Self::Aborted { .. } => "aborted",
            Self::Config(_) => "config",
            Self::Workflow(_) => "workflow",
            Self::Io(_) => "io",
            Self::Yaml(_) => "yaml",
            Self::Json(_) => "json",
        }
    }
}
