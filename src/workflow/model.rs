//! Workflow Data Model
//!
//! Core data structures representing workflow steps and their relationships.
//!
//! Steps and workflows are immutable values. Every builder method returns a
//! new value; the optimizer derives new workflows instead of mutating the one
//! that was submitted, so the original stays usable as a cache identity.
//!
//! # Example
//!
//! ```
//! use flowrunner::workflow::{Step, StepResult, StepType, Workflow};
//!
//! let workflow = Workflow::new("build", "1.0")
//!     .with_step(Step::from_fn("checkout", |_ctx| StepResult::success()).with_type(StepType::Setup))
//!     .with_step(
//!         Step::from_fn("compile", |_ctx| StepResult::success())
//!             .depends_on("checkout")
//!             .with_resources(256, 1.0),
//!     );
//!
//! assert_eq!(workflow.len(), 2);
//! assert_eq!(workflow.id(), "build@1.0");
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::step::{FnExecutor, StepExecutor, StepResult};
use crate::execution::context::ExecutionContext;

/// Broad category of a step, used for ordering and resource estimates.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Setup,
    Validation,
    Analysis,
    #[default]
    Processing,
    Testing,
    Deployment,
    Cleanup,
}

impl StepType {
    /// Tie-break rank used when reordering independent steps.
    pub fn priority(&self) -> u8 {
        match self {
            Self::Setup => 0,
            Self::Validation => 1,
            Self::Analysis => 2,
            Self::Processing => 3,
            Self::Testing => 4,
            Self::Deployment => 5,
            Self::Cleanup => 6,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::Validation => "validation",
            Self::Analysis => "analysis",
            Self::Processing => "processing",
            Self::Testing => "testing",
            Self::Deployment => "deployment",
            Self::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared resource needs of a step. Zero means "not specified".
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct ResourceRequirements {
    /// Memory in megabytes
    #[serde(default)]
    pub memory_mb: u64,
    /// CPU cores (fractional)
    #[serde(default)]
    pub cpu: f64,
}

impl ResourceRequirements {
    pub fn new(memory_mb: u64, cpu: f64) -> Self {
        Self { memory_mb, cpu }
    }

    pub fn is_specified(&self) -> bool {
        self.memory_mb > 0 || self.cpu > 0.0
    }
}

/// A predicate over the execution context deciding whether a step runs.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    /// The key is present in the context
    Exists { key: String },
    /// The key is present and equal to `value`
    Equals { key: String, value: Value },
    /// The key is absent or not equal to `value`
    NotEquals { key: String, value: Value },
    /// The key holds a truthy value (not null, false, 0 or empty)
    Truthy { key: String },
}

impl Condition {
    pub fn evaluate(&self, ctx: &ExecutionContext) -> bool {
        match self {
            Self::Exists { key } => ctx.contains(key),
            Self::Equals { key, value } => ctx.get(key) == Some(value),
            Self::NotEquals { key, value } => ctx.get(key) != Some(value),
            Self::Truthy { key } => ctx.get(key).map(is_truthy).unwrap_or(false),
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Marks a step produced by the optimizer rather than by the workflow author.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SyntheticKind {
    /// Members run sequentially and stop at the first failure
    Combined,
    /// Members run concurrently; the group fails if any member fails
    Parallel,
}

/// Descriptive metadata of a step.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StepMetadata {
    /// Step name, unique within a workflow
    pub name: String,

    #[serde(default, rename = "type")]
    pub step_type: StepType,

    /// Names of steps that must complete successfully first
    #[serde(default, alias = "depends_on", deserialize_with = "single_or_set")]
    pub dependencies: BTreeSet<String>,

    #[serde(default)]
    pub resources: ResourceRequirements,

    #[serde(default = "default_true")]
    pub cacheable: bool,

    #[serde(default)]
    pub parallelizable: bool,

    #[serde(default)]
    pub combinable: bool,

    /// Steps with side effects are never grouped for concurrent execution
    #[serde(default)]
    pub side_effects: bool,

    #[serde(default)]
    pub priority: i32,

    #[serde(default)]
    pub disabled: bool,

    /// All conditions must hold for the step to run
    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,

    /// External resources this step modifies (files, tables, services)
    #[serde(default)]
    pub modifies: BTreeSet<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    #[serde(default)]
    pub retries: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthetic: Option<SyntheticKind>,

    /// Member step names of a synthetic step
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// Deserializes either a single string or an array of strings into a set.
fn single_or_set<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(BTreeSet::new()),
        Value::String(s) if s.trim().is_empty() => Ok(BTreeSet::new()),
        Value::String(s) => Ok(BTreeSet::from([s.trim().to_string()])),
        Value::Array(arr) => arr
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s.trim().to_string()),
                _ => Err(de::Error::custom("Expected string in array")),
            })
            .collect(),
        _ => Err(de::Error::custom("Expected string or array of strings")),
    }
}

impl StepMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into().trim().to_string(),
            step_type: StepType::default(),
            dependencies: BTreeSet::new(),
            resources: ResourceRequirements::default(),
            cacheable: true,
            parallelizable: false,
            combinable: false,
            side_effects: false,
            priority: 0,
            disabled: false,
            conditions: Vec::new(),
            parameters: BTreeMap::new(),
            modifies: BTreeSet::new(),
            timeout_ms: None,
            retries: 0,
            estimated_duration_ms: None,
            synthetic: None,
            members: Vec::new(),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn is_synthetic(&self) -> bool {
        self.synthetic.is_some()
    }

    /// True when every declared condition holds in the context.
    pub fn conditions_hold(&self, ctx: &ExecutionContext) -> bool {
        self.conditions.iter().all(|c| c.evaluate(ctx))
    }
}

/// A unit of work: metadata plus the executor that performs it.
///
/// Cloning a step is cheap; metadata and executor are shared.
#[derive(Clone)]
pub struct Step {
    metadata: Arc<StepMetadata>,
    executor: Arc<dyn StepExecutor>,
}

impl Step {
    /// Creates a step with default metadata.
    pub fn new(name: impl Into<String>, executor: impl StepExecutor + 'static) -> Self {
        Self {
            metadata: Arc::new(StepMetadata::new(name)),
            executor: Arc::new(executor),
        }
    }

    /// Creates a step from a synchronous closure.
    pub fn from_fn<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut ExecutionContext) -> StepResult + Send + Sync + 'static,
    {
        Self::new(name, FnExecutor::new(f))
    }

    /// Creates a step from existing metadata and a shared executor.
    pub fn from_parts(metadata: StepMetadata, executor: Arc<dyn StepExecutor>) -> Self {
        Self {
            metadata: Arc::new(metadata),
            executor,
        }
    }

    pub fn metadata(&self) -> &StepMetadata {
        &self.metadata
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn step_type(&self) -> StepType {
        self.metadata.step_type
    }

    pub fn dependencies(&self) -> &BTreeSet<String> {
        &self.metadata.dependencies
    }

    pub fn executor(&self) -> &Arc<dyn StepExecutor> {
        &self.executor
    }

    /// Returns a new step whose metadata has been transformed by `f`.
    ///
    /// The receiver is left untouched.
    pub fn with_metadata(&self, f: impl FnOnce(&mut StepMetadata)) -> Step {
        let mut metadata = (*self.metadata).clone();
        f(&mut metadata);
        Step {
            metadata: Arc::new(metadata),
            executor: Arc::clone(&self.executor),
        }
    }

    fn update(mut self, f: impl FnOnce(&mut StepMetadata)) -> Self {
        f(Arc::make_mut(&mut self.metadata));
        self
    }

    pub fn with_type(self, step_type: StepType) -> Self {
        self.update(|m| m.step_type = step_type)
    }

    /// Adds a dependency on another step.
    pub fn depends_on(self, step: impl Into<String>) -> Self {
        let step = step.into();
        self.update(|m| {
            m.dependencies.insert(step);
        })
    }

    pub fn with_resources(self, memory_mb: u64, cpu: f64) -> Self {
        self.update(|m| m.resources = ResourceRequirements::new(memory_mb, cpu))
    }

    pub fn parallelizable(self, value: bool) -> Self {
        self.update(|m| m.parallelizable = value)
    }

    pub fn combinable(self, value: bool) -> Self {
        self.update(|m| m.combinable = value)
    }

    pub fn cacheable(self, value: bool) -> Self {
        self.update(|m| m.cacheable = value)
    }

    pub fn with_side_effects(self, value: bool) -> Self {
        self.update(|m| m.side_effects = value)
    }

    pub fn with_priority(self, priority: i32) -> Self {
        self.update(|m| m.priority = priority)
    }

    pub fn disabled(self, value: bool) -> Self {
        self.update(|m| m.disabled = value)
    }

    /// Adds a condition that must hold for the step to run.
    pub fn when(self, condition: Condition) -> Self {
        self.update(|m| m.conditions.push(condition))
    }

    pub fn with_parameter(self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        let value = value.into();
        self.update(|m| {
            m.parameters.insert(key, value);
        })
    }

    /// Declares an external resource this step modifies.
    pub fn modifies(self, resource: impl Into<String>) -> Self {
        let resource = resource.into();
        self.update(|m| {
            m.modifies.insert(resource);
        })
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        let ms = timeout.as_millis() as u64;
        self.update(|m| m.timeout_ms = Some(ms))
    }

    pub fn with_retries(self, retries: u32) -> Self {
        self.update(|m| m.retries = retries)
    }

    pub fn with_estimated_duration(self, duration: Duration) -> Self {
        let ms = duration.as_millis() as u64;
        self.update(|m| m.estimated_duration_ms = Some(ms))
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// An ordered sequence of steps submitted as one unit of work.
#[derive(Clone, Debug)]
pub struct Workflow {
    name: String,
    version: String,
    steps: Vec<Step>,
    declared_step_count: usize,
}

impl Workflow {
    /// Creates a new empty workflow.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            steps: Vec::new(),
            declared_step_count: 0,
        }
    }

    /// Creates a workflow from a list of steps.
    pub fn from_steps(name: impl Into<String>, version: impl Into<String>, steps: Vec<Step>) -> Self {
        let declared_step_count = steps.len();
        Self {
            name: name.into(),
            version: version.into(),
            steps,
            declared_step_count,
        }
    }

    /// Returns a new workflow with `step` appended.
    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self.declared_step_count = self.steps.len();
        self
    }

    /// Derives a workflow with the same identity but a different step list.
    ///
    /// The declared step count of the original is kept.
    pub fn with_steps(&self, steps: Vec<Step>) -> Workflow {
        Workflow {
            name: self.name.clone(),
            version: self.version.clone(),
            steps,
            declared_step_count: self.declared_step_count,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Stable identity used for caching and prediction history.
    pub fn id(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn declared_step_count(&self) -> usize {
        self.declared_step_count
    }

    /// Gets a step by name.
    pub fn get_step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name() == name)
    }

    pub fn step_names(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.name().to_string()).collect()
    }

    /// Returns steps with no dependencies (entry points).
    pub fn root_steps(&self) -> Vec<&Step> {
        self.steps.iter().filter(|s| s.dependencies().is_empty()).collect()
    }

    /// Returns the number of steps in the workflow.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the workflow has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop(name: &str) -> Step {
        Step::from_fn(name, |_| StepResult::success())
    }

    #[test]
    fn test_step_creation() {
        let step = noop(" build ")
            .with_type(StepType::Analysis)
            .with_resources(128, 0.5)
            .depends_on("setup")
            .with_retries(2);

        assert_eq!(step.name(), "build");
        assert_eq!(step.step_type(), StepType::Analysis);
        assert_eq!(step.metadata().resources.memory_mb, 128);
        assert!(step.dependencies().contains("setup"));
        assert_eq!(step.metadata().retries, 2);
        assert!(step.metadata().cacheable);
    }

    #[test]
    fn test_builders_never_mutate_original() {
        let original = noop("a");
        let derived = original.with_metadata(|m| m.parallelizable = true);

        assert!(!original.metadata().parallelizable);
        assert!(derived.metadata().parallelizable);

        let shared = original.clone();
        let changed = shared.with_type(StepType::Cleanup);
        assert_eq!(original.step_type(), StepType::Processing);
        assert_eq!(changed.step_type(), StepType::Cleanup);
    }

    #[test]
    fn test_step_type_priority_order() {
        let ordered = [
            StepType::Setup,
            StepType::Validation,
            StepType::Analysis,
            StepType::Processing,
            StepType::Testing,
            StepType::Deployment,
            StepType::Cleanup,
        ];
        for pair in ordered.windows(2) {
            assert!(pair[0].priority() < pair[1].priority());
        }
    }

    #[test]
    fn test_condition_evaluation() {
        let mut ctx = ExecutionContext::new();
        ctx.set("env", "prod");
        ctx.set("enabled", true);
        ctx.set("count", 0);

        assert!(Condition::Exists { key: "env".into() }.evaluate(&ctx));
        assert!(!Condition::Exists { key: "missing".into() }.evaluate(&ctx));
        assert!(Condition::Equals { key: "env".into(), value: json!("prod") }.evaluate(&ctx));
        assert!(Condition::NotEquals { key: "env".into(), value: json!("dev") }.evaluate(&ctx));
        assert!(Condition::Truthy { key: "enabled".into() }.evaluate(&ctx));
        assert!(!Condition::Truthy { key: "count".into() }.evaluate(&ctx));
        assert!(!Condition::Truthy { key: "missing".into() }.evaluate(&ctx));
    }

    #[test]
    fn test_workflow_with_steps_keeps_identity() {
        let workflow = Workflow::new("deploy", "2")
            .with_step(noop("a"))
            .with_step(noop("b"))
            .with_step(noop("c"));

        let derived = workflow.with_steps(vec![noop("ab")]);
        assert_eq!(derived.id(), workflow.id());
        assert_eq!(derived.len(), 1);
        assert_eq!(derived.declared_step_count(), 3);
        assert_eq!(workflow.len(), 3);
    }

    #[test]
    fn test_workflow_lookup_and_roots() {
        let workflow = Workflow::new("w", "1")
            .with_step(noop("root"))
            .with_step(noop("leaf").depends_on("root"));

        assert!(workflow.get_step("leaf").is_some());
        assert!(workflow.get_step("nope").is_none());
        assert_eq!(workflow.root_steps().len(), 1);
        assert_eq!(workflow.step_names(), vec!["root", "leaf"]);
    }

    #[test]
    fn test_metadata_deserialize_defaults() {
        let yaml = "name: lint\ntype: validation\n";
        let meta: StepMetadata = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(meta.step_type, StepType::Validation);
        assert!(meta.cacheable);
        assert!(meta.dependencies.is_empty());
        assert!(!meta.is_synthetic());
    }

    #[test]
    fn test_dependencies_accept_single_string() {
        let meta: StepMetadata = serde_yaml::from_str("name: b\ndepends_on: a\n").unwrap();
        assert!(meta.dependencies.contains("a"));

        let meta: StepMetadata =
            serde_yaml::from_str("name: c\ndependencies: [a, b]\n").unwrap();
        assert_eq!(meta.dependencies.len(), 2);
    }

    #[test]
    fn test_workflow_is_empty() {
        let workflow = Workflow::new("empty", "0");
        assert!(workflow.is_empty());
        assert_eq!(workflow.len(), 0);
    }
}
