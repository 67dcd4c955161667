//! Workflow Optimization
//!
//! Rewrites a workflow's step list before it runs. Passes run in a fixed
//! order and each one is kept only if the step list's metrics prove it
//! helped:
//!
//! 1. Remove redundant steps (exact duplicates, unmet conditions)
//! 2. Reorder by dependencies with a step-type tie-break
//! 3. Parameter tuning from context flags (`fast_mode`, `production_mode`)
//! 4. Combine similar combinable steps into sequential groups
//! 5. Group independent parallelizable steps
//!
//! A failing or panicking pass is skipped and the last good list is used.
//! A dependency cycle is the one failure that is reported to the caller.
//!
//! [`ExecutionOptimizer`] adds per-workflow learning on top: passes that
//! keep appearing in runs that fail or overrun their prediction are
//! switched off for that workflow.

pub mod analysis;
pub mod composite;
pub mod passes;

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::execution::context::ExecutionContext;
use crate::workflow::{Step, Workflow};

pub use analysis::{analyze, WorkflowMetrics};

/// A run "met" its prediction when it finished within this factor of it.
const PREDICTION_TOLERANCE: f64 = 1.25;

/// An optimization pass.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationKind {
    RemoveRedundant,
    Reorder,
    ParameterTuning,
    Combine,
    Parallelize,
}

impl OptimizationKind {
    /// Every pass, in the order they run.
    pub const ALL: [OptimizationKind; 5] = [
        OptimizationKind::RemoveRedundant,
        OptimizationKind::Reorder,
        OptimizationKind::ParameterTuning,
        OptimizationKind::Combine,
        OptimizationKind::Parallelize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RemoveRedundant => "remove_redundant",
            Self::Reorder => "reorder",
            Self::ParameterTuning => "parameter_tuning",
            Self::Combine => "combine",
            Self::Parallelize => "parallelize",
        }
    }

    /// How sure we are the pass preserves behaviour.
    fn confidence(&self) -> f64 {
        match self {
            Self::RemoveRedundant => 0.95,
            Self::Reorder => 0.99,
            Self::ParameterTuning => 0.9,
            Self::Combine => 0.85,
            Self::Parallelize => 0.8,
        }
    }

    fn risk(&self) -> &'static str {
        match self {
            Self::RemoveRedundant => "steps dropped for unmet conditions will not run if the context changes during execution",
            Self::Reorder => "steps run in a different order than declared",
            Self::ParameterTuning => "tuned timeouts or retries change failure behaviour",
            Self::Combine => "combined steps are scheduled as one unit",
            Self::Parallelize => "parallel steps run against a snapshot of the context and cannot see each other's writes",
        }
    }

    fn apply(&self, steps: &[Step], ctx: &ExecutionContext, config: &OptimizerConfig) -> Result<Vec<Step>> {
        match self {
            Self::RemoveRedundant => passes::remove_redundant(steps, ctx, config),
            Self::Reorder => passes::reorder(steps, ctx, config),
            Self::ParameterTuning => passes::parameter_tuning(steps, ctx, config),
            Self::Combine => passes::combine(steps, ctx, config),
            Self::Parallelize => passes::parallelize(steps, ctx, config),
        }
    }
}

impl fmt::Display for OptimizationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optimizer configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct OptimizerConfig {
    pub enabled: bool,
    /// Passes to run; they always run in [`OptimizationKind::ALL`] order
    pub passes: Vec<OptimizationKind>,
    /// Minimum similarity between members of a combined step
    pub similarity_threshold: f64,
    pub max_combined_steps: usize,
    pub max_parallel_steps: usize,
    /// Timeout multiplier applied in fast mode
    pub fast_mode_timeout_factor: f64,
    /// Retry floor applied in production mode
    pub production_min_retries: u32,
    /// Scheduling cost added per step when estimating duration
    pub step_overhead_ms: u64,
    /// Estimated duration of a step that declares none
    pub default_step_duration_ms: u64,
    /// Observations before a pass can be disabled for a workflow
    pub min_observations: u32,
    /// Effectiveness ratio below which a pass is disabled
    pub min_effectiveness: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            passes: OptimizationKind::ALL.to_vec(),
            similarity_threshold: 0.8,
            max_combined_steps: 3,
            max_parallel_steps: 3,
            fast_mode_timeout_factor: 0.5,
            production_min_retries: 2,
            step_overhead_ms: 50,
            default_step_duration_ms: 1000,
            min_observations: 5,
            min_effectiveness: 0.5,
        }
    }
}

/// What an optimization run produced.
#[derive(Clone)]
pub struct OptimizationOutcome {
    pub steps: Vec<Step>,
    pub applied: Vec<OptimizationKind>,
    pub estimated_savings_ms: u64,
    /// Product of the applied passes' confidence, 1.0 when nothing applied
    pub confidence: f64,
    pub risks: Vec<String>,
    pub before: WorkflowMetrics,
    pub after: WorkflowMetrics,
}

impl OptimizationOutcome {
    fn unchanged(steps: &[Step], metrics: WorkflowMetrics) -> Self {
        Self {
            steps: steps.to_vec(),
            applied: Vec::new(),
            estimated_savings_ms: 0,
            confidence: 1.0,
            risks: Vec::new(),
            before: metrics,
            after: metrics,
        }
    }

    /// Names of the applied passes.
    pub fn applied_names(&self) -> Vec<String> {
        self.applied.iter().map(|k| k.as_str().to_string()).collect()
    }
}

impl fmt::Debug for OptimizationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.steps.iter().map(|s| s.name()).collect();
        f.debug_struct("OptimizationOutcome")
            .field("steps", &names)
            .field("applied", &self.applied)
            .field("estimated_savings_ms", &self.estimated_savings_ms)
            .field("confidence", &self.confidence)
            .field("before", &self.before)
            .field("after", &self.after)
            .finish()
    }
}

fn same_steps(a: &[Step], b: &[Step]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.metadata() == y.metadata())
}

fn panic_text(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Stateless pass pipeline.
#[derive(Debug, Clone, Default)]
pub struct WorkflowOptimizer {
    config: OptimizerConfig,
}

impl WorkflowOptimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Runs every configured pass.
    pub fn optimize(&self, steps: &[Step], ctx: &ExecutionContext) -> Result<OptimizationOutcome> {
        self.optimize_with(steps, ctx, &self.config.passes)
    }

    /// Runs the configured passes that are also in `enabled`.
    pub fn optimize_with(
        &self,
        steps: &[Step],
        ctx: &ExecutionContext,
        enabled: &[OptimizationKind],
    ) -> Result<OptimizationOutcome> {
        let before = analyze(steps, &self.config);
        let mut outcome = OptimizationOutcome::unchanged(steps, before);
        if !self.config.enabled {
            return Ok(outcome);
        }

        for kind in OptimizationKind::ALL {
            if !enabled.contains(&kind) || !self.config.passes.contains(&kind) {
                continue;
            }

            let attempt = panic::catch_unwind(AssertUnwindSafe(|| {
                kind.apply(&outcome.steps, ctx, &self.config)
            }));
            let candidate = match attempt {
                Ok(Ok(candidate)) => candidate,
                Ok(Err(err @ EngineError::DependencyCycle { .. })) => {
                    warn!("Optimization stage '{}' found a dependency cycle: {}", kind, err);
                    return Err(err);
                }
                Ok(Err(err)) => {
                    let failure = EngineError::OptimizationFailure {
                        stage: kind.to_string(),
                        message: err.to_string(),
                    };
                    warn!("{} - skipping", failure);
                    continue;
                }
                Err(payload) => {
                    let failure = EngineError::OptimizationFailure {
                        stage: kind.to_string(),
                        message: format!("panicked: {}", panic_text(payload.as_ref())),
                    };
                    warn!("{} - skipping", failure);
                    continue;
                }
            };

            if same_steps(&candidate, &outcome.steps) {
                debug!("Optimization '{}' changed nothing", kind);
                continue;
            }

            let metrics = analyze(&candidate, &self.config);
            let keep = metrics.no_worse_than(&outcome.after)
                && (metrics.improves_on(&outcome.after) || kind == OptimizationKind::ParameterTuning);
            if !keep {
                debug!(
                    "Discarding optimization '{}': {:?} is not better than {:?}",
                    kind, metrics, outcome.after
                );
                continue;
            }

            debug!("Applied optimization '{}'", kind);
            outcome.steps = candidate;
            outcome.after = metrics;
            outcome.applied.push(kind);
            outcome.confidence *= kind.confidence();
            outcome.risks.push(kind.risk().to_string());
        }

        outcome.estimated_savings_ms = before
            .estimated_duration_ms
            .saturating_sub(outcome.after.estimated_duration_ms);
        Ok(outcome)
    }
}

/// Effectiveness record of one pass on one workflow.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct PassRecord {
    pub observations: u32,
    /// Runs that succeeded and met their predicted duration
    pub effective: u32,
}

impl PassRecord {
    pub fn effectiveness(&self) -> f64 {
        if self.observations == 0 {
            1.0
        } else {
            self.effective as f64 / self.observations as f64
        }
    }
}

/// A learning entry as reported by [`ExecutionOptimizer::stats`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PassStats {
    pub workflow: String,
    pub kind: OptimizationKind,
    pub observations: u32,
    pub effectiveness: f64,
    pub disabled: bool,
}

/// True when a run finished within tolerance of its predicted duration.
pub fn met_prediction(actual_ms: u64, predicted_ms: u64) -> bool {
    actual_ms as f64 <= predicted_ms as f64 * PREDICTION_TOLERANCE
}

/// [`WorkflowOptimizer`] plus per-workflow pass learning.
pub struct ExecutionOptimizer {
    optimizer: WorkflowOptimizer,
    records: Mutex<HashMap<(String, OptimizationKind), PassRecord>>,
}

impl ExecutionOptimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self {
            optimizer: WorkflowOptimizer::new(config),
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &OptimizerConfig {
        self.optimizer.config()
    }

    fn is_disabled(&self, record: &PassRecord) -> bool {
        let config = self.optimizer.config();
        record.observations >= config.min_observations
            && record.effectiveness() < config.min_effectiveness
    }

    /// Passes still enabled for a workflow.
    pub fn enabled_passes(&self, workflow_id: &str) -> Vec<OptimizationKind> {
        let records = self.records.lock();
        OptimizationKind::ALL
            .into_iter()
            .filter(|kind| {
                records
                    .get(&(workflow_id.to_string(), *kind))
                    .map(|r| !self.is_disabled(r))
                    .unwrap_or(true)
            })
            .collect()
    }

    /// Optimizes a workflow, returning a new workflow value and the outcome.
    ///
    /// The input workflow is not modified and keeps its identity.
    pub fn optimize(&self, workflow: &Workflow, ctx: &ExecutionContext) -> Result<(Workflow, OptimizationOutcome)> {
        self.optimize_within(workflow, ctx, usize::MAX)
    }

    /// Like [`ExecutionOptimizer::optimize`], with parallel groups capped at
    /// `parallel_limit` members. A limit below 2 disables grouping.
    pub fn optimize_within(
        &self,
        workflow: &Workflow,
        ctx: &ExecutionContext,
        parallel_limit: usize,
    ) -> Result<(Workflow, OptimizationOutcome)> {
        let mut enabled = self.enabled_passes(&workflow.id());
        let config = self.optimizer.config();
        let outcome = if parallel_limit < config.max_parallel_steps {
            if parallel_limit < 2 {
                enabled.retain(|k| *k != OptimizationKind::Parallelize);
            }
            let bounded = WorkflowOptimizer::new(OptimizerConfig {
                max_parallel_steps: parallel_limit.max(2),
                ..config.clone()
            });
            bounded.optimize_with(workflow.steps(), ctx, &enabled)?
        } else {
            self.optimizer.optimize_with(workflow.steps(), ctx, &enabled)?
        };

        if outcome.applied.is_empty() {
            return Ok((workflow.clone(), outcome));
        }

        info!(
            "Optimized '{}': {} -> {} steps, applied [{}], ~{}ms saved",
            workflow.id(),
            outcome.before.step_count,
            outcome.after.step_count,
            outcome.applied_names().join(", "),
            outcome.estimated_savings_ms
        );
        Ok((workflow.with_steps(outcome.steps.clone()), outcome))
    }

    /// Records how a run that used `applied` went.
    pub fn learn(&self, workflow_id: &str, applied: &[OptimizationKind], success: bool, met_prediction: bool) {
        let mut records = self.records.lock();
        for kind in applied {
            let record = records.entry((workflow_id.to_string(), *kind)).or_default();
            let was_disabled = self.is_disabled(record);
            record.observations += 1;
            if success && met_prediction {
                record.effective += 1;
            }
            if !was_disabled && self.is_disabled(record) {
                info!(
                    "Disabling optimization '{}' for '{}' (effectiveness {:.2})",
                    kind,
                    workflow_id,
                    record.effectiveness()
                );
            }
        }
    }

    /// Learning records, sorted by workflow then pass.
    pub fn stats(&self) -> Vec<PassStats> {
        let records = self.records.lock();
        let mut stats: Vec<PassStats> = records
            .iter()
            .map(|((workflow, kind), record)| PassStats {
                workflow: workflow.clone(),
                kind: *kind,
                observations: record.observations,
                effectiveness: record.effectiveness(),
                disabled: self.is_disabled(record),
            })
            .collect();
        stats.sort_by(|a, b| a.workflow.cmp(&b.workflow).then(a.kind.cmp(&b.kind)));
        stats
    }
}
