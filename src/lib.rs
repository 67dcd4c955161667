//! FlowRunner - Workflow Execution Engine
//!
//! Runs workflows of dependent steps with admission control, result
//! caching, duration and resource prediction, step-list optimization and
//! live monitoring. Every execution goes through one façade,
//! [`SequentialExecutionEngine`], which owns all the components.
//!
//! # Architecture
//!
//! - [`workflow`]: Steps, workflows, the executor contract and YAML loading
//! - [`execution`]: The engine, admission queue, scheduler and per-run context
//! - [`resources`]: Shared memory/CPU/slot budget and allocation strategies
//! - [`cache`]: Fingerprinted result cache with TTLs
//! - [`predictor`]: Heuristic duration and resource predictions
//! - [`optimizer`]: Step-list rewrites (dedup, reorder, tuning, grouping)
//! - [`monitoring`]: Threshold alerts, baselines and process sampling
//!
//! # Example
//!
//! ```rust,no_run
//! use flowrunner::{EngineConfig, ExecutionContext, ExecutionOptions, SequentialExecutionEngine};
//! use flowrunner::load_workflow;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load a workflow from YAML
//!     let workflow = load_workflow("pipeline.yaml")?;
//!
//!     // Create the engine
//!     let engine = SequentialExecutionEngine::new(EngineConfig::default())?;
//!
//!     // Execute the workflow
//!     let ctx = ExecutionContext::new().with_value("channel", "stable");
//!     let result = engine.execute(workflow, ctx, ExecutionOptions::default()).await;
//!     println!("{} in {} ms", result.status, result.duration_ms);
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod optimizer;
pub mod predictor;
pub mod resources;
pub mod workflow;

// Re-export commonly used types
pub use config::{load_config, EngineConfig};
pub use error::{EngineError, Result};
pub use execution::{
    ExecutionContext, ExecutionOptions, ExecutionResult, ExecutionStatus, ExecutionStrategy, Priority,
    SequentialExecutionEngine,
};
pub use resources::AllocationStrategy;
pub use workflow::model::{Step, Workflow};
pub use workflow::parser::load_workflow;
pub use workflow::{StepExecutor, StepResult};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "FlowRunner";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "FlowRunner");
    }

    #[test]
    fn test_module_exports_step() {
        let step = Step::from_fn("test", |_| StepResult::success()).depends_on("setup");
        assert_eq!(step.name(), "test");
        assert!(step.dependencies().contains("setup"));
    }

    #[test]
    fn test_module_exports_workflow() {
        let workflow = Workflow::new("empty", "1.0");
        assert!(workflow.is_empty());
        assert_eq!(workflow.id(), "empty@1.0");
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }
}
