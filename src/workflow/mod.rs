//! Workflow Definition Module
//!
//! Provides data structures and utilities for defining, loading and
//! validating workflows.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (Step, StepMetadata, Workflow)
//! - [`step`]: Executor contract and the step runner
//! - [`parser`]: YAML loading of shell-command workflows
//! - [`validator`]: Dependency graph checks and topological ordering

pub mod model;
pub mod parser;
pub mod step;
pub mod validator;

pub use model::{Condition, ResourceRequirements, Step, StepMetadata, StepType, SyntheticKind, Workflow};
pub use parser::{load_workflow, parse_workflow};
pub use step::{execute_step, run_step, skip_reason, CommandExecutor, FnExecutor, StepExecutor, StepResult};
