//! Execution Prediction
//!
//! Estimates how long a workflow run will take and what resources it needs,
//! from samples of earlier runs of the same workflow.
//!
//! Only samples whose context signature is similar enough to the current
//! one are considered. With fewer than `min_data_points` of them the
//! prediction is always the default heuristic (`step_count × per-step cost`).
//! Otherwise the model with the best tracked accuracy for the workflow is
//! used, the weighted average when nothing has been tracked yet.

pub mod models;

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use log::{debug, info};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::execution::context::{ExecutionContext, ExecutionResult};
use crate::workflow::{StepType, Workflow};

pub use models::{PredictionModel, ScoredSample};

/// Hex characters kept from a context digest.
const SIGNATURE_LEN: usize = 16;

/// Sample count at which sample-based confidence is maxed out.
const CONFIDENCE_SAMPLE_SCALE: f64 = 20.0;

/// Weight of the sample count in the confidence score.
const CONFIDENCE_SAMPLE_WEIGHT: f64 = 0.3;

const MEMORY_MARGIN: f64 = 1.2;
const CPU_MARGIN: f64 = 1.1;
const TIMEOUT_MARGIN: f64 = 1.5;

const BASE_STEP_MEMORY_MB: f64 = 64.0;
const BASE_STEP_CPU: f64 = 0.25;
const BASE_STEP_TIMEOUT_MS: f64 = 30_000.0;

/// Per step type resource multipliers.
#[derive(Debug, Clone, Copy)]
struct StepProfile {
    memory: f64,
    cpu: f64,
    timeout: f64,
}

static STEP_PROFILES: Lazy<HashMap<StepType, StepProfile>> = Lazy::new(|| {
    let profile = |memory, cpu, timeout| StepProfile { memory, cpu, timeout };
    HashMap::from([
        (StepType::Setup, profile(0.5, 0.5, 0.5)),
        (StepType::Validation, profile(0.5, 0.5, 0.5)),
        (StepType::Analysis, profile(1.5, 1.0, 1.5)),
        (StepType::Processing, profile(2.0, 1.5, 2.0)),
        (StepType::Testing, profile(1.0, 1.0, 1.5)),
        (StepType::Deployment, profile(1.0, 0.5, 2.0)),
        (StepType::Cleanup, profile(0.5, 0.25, 0.5)),
    ])
});

/// Predictor configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct PredictorConfig {
    /// Similar samples required before a model-based estimate is used
    pub min_data_points: usize,
    /// Per-step cost of the default heuristic
    pub per_step_cost_ms: u64,
    /// Samples retained per workflow
    pub max_history_per_workflow: usize,
    /// Minimum context similarity for a sample to count
    pub similarity_threshold: f64,
    /// Window over which sample weight decays to its floor
    pub recency_window_hours: f64,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            min_data_points: 5,
            per_step_cost_ms: 1000,
            max_history_per_workflow: 100,
            similarity_threshold: 0.5,
            recency_window_hours: 24.0,
        }
    }
}

/// One completed run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PredictionSample {
    pub workflow_id: String,
    pub context_signature: String,
    pub step_count: usize,
    pub duration_ms: u64,
    pub success: bool,
    pub model: PredictionModel,
    /// Accuracy of the prediction made for this run, if there was one
    pub accuracy: Option<f64>,
    pub predicted_ms: Option<u64>,
    pub recorded_at: DateTime<Utc>,
}

/// Estimated duration of a run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DurationPrediction {
    pub duration_ms: u64,
    pub confidence: f64,
    pub model: PredictionModel,
    /// Similar samples the estimate is based on
    pub sample_count: usize,
}

/// Estimated resource needs of a run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ResourcePrediction {
    pub memory_mb: u64,
    pub cpu: f64,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct AccuracyTracker {
    total: f64,
    count: u64,
}

impl AccuracyTracker {
    fn record(&mut self, accuracy: f64) {
        self.total += accuracy;
        self.count += 1;
    }

    fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.total / self.count as f64)
    }
}

#[derive(Default)]
struct PredictorState {
    history: HashMap<String, VecDeque<PredictionSample>>,
    accuracy: HashMap<String, HashMap<PredictionModel, AccuracyTracker>>,
}

/// Counters exposed through engine metrics.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct PredictorStats {
    pub workflows: usize,
    pub samples: usize,
    pub learned: u64,
    /// Mean accuracy of predictions checked by `learn`
    pub mean_accuracy: Option<f64>,
}

/// Duration and resource estimator.
pub struct ExecutionPredictor {
    config: PredictorConfig,
    state: Mutex<PredictorState>,
    learned: Mutex<AccuracyTracker>,
}

impl ExecutionPredictor {
    pub fn new(config: PredictorConfig) -> Self {
        Self {
            config,
            state: Mutex::new(PredictorState::default()),
            learned: Mutex::new(AccuracyTracker::default()),
        }
    }

    /// Short digest of the context's non-sensitive data.
    pub fn context_signature(ctx: &ExecutionContext) -> String {
        let canonical = serde_json::to_vec(&ctx.public_data()).unwrap_or_default();
        let mut digest = hex::encode(Sha256::digest(&canonical));
        digest.truncate(SIGNATURE_LEN);
        digest
    }

    fn confidence(model: PredictionModel, sample_count: usize) -> f64 {
        let sample_factor = (sample_count as f64 / CONFIDENCE_SAMPLE_SCALE).min(1.0);
        (model.base_confidence() + sample_factor * CONFIDENCE_SAMPLE_WEIGHT).min(1.0)
    }

    fn scored_samples(&self, state: &PredictorState, workflow_id: &str, signature: &str) -> Vec<ScoredSample> {
        let now = Utc::now();
        state
            .history
            .get(workflow_id)
            .map(|history| {
                history
                    .iter()
                    .filter_map(|sample| {
                        let similarity = models::context_similarity(signature, &sample.context_signature);
                        (similarity >= self.config.similarity_threshold).then(|| ScoredSample {
                            step_count: sample.step_count,
                            duration_ms: sample.duration_ms as f64,
                            similarity,
                            age_hours: (now - sample.recorded_at).num_milliseconds().max(0) as f64
                                / 3_600_000.0,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn select_model(state: &PredictorState, workflow_id: &str) -> PredictionModel {
        let Some(tracked) = state.accuracy.get(workflow_id) else {
            return PredictionModel::WeightedAverage;
        };

        let mut best = PredictionModel::WeightedAverage;
        let mut best_accuracy = tracked.get(&best).and_then(|t| t.mean()).unwrap_or(f64::MIN);
        for model in PredictionModel::CANDIDATES {
            if let Some(accuracy) = tracked.get(&model).and_then(|t| t.mean()) {
                if accuracy > best_accuracy {
                    best = model;
                    best_accuracy = accuracy;
                }
            }
        }
        best
    }

    fn default_prediction(&self, workflow: &Workflow, sample_count: usize) -> DurationPrediction {
        let model = PredictionModel::Default;
        DurationPrediction {
            duration_ms: workflow.declared_step_count() as u64 * self.config.per_step_cost_ms,
            confidence: Self::confidence(model, sample_count),
            model,
            sample_count,
        }
    }

    /// Predicts the duration of running `workflow` against `ctx`.
    pub fn predict_duration(&self, workflow: &Workflow, ctx: &ExecutionContext) -> DurationPrediction {
        let workflow_id = workflow.id();
        let signature = Self::context_signature(ctx);
        let state = self.state.lock();

        let samples = self.scored_samples(&state, &workflow_id, &signature);
        if samples.len() < self.config.min_data_points {
            debug!(
                "Only {} similar sample(s) for '{}'; using default heuristic",
                samples.len(),
                workflow_id
            );
            return self.default_prediction(workflow, samples.len());
        }

        let selected = Self::select_model(&state, &workflow_id);
        let chosen = [selected, PredictionModel::Average].into_iter().find_map(|model| {
            models::estimate(
                model,
                &samples,
                workflow.declared_step_count(),
                self.config.per_step_cost_ms,
                self.config.recency_window_hours,
            )
            .map(|estimate| (model, estimate))
        });

        match chosen {
            Some((model, estimate)) => {
                debug!(
                    "Predicted {:.0} ms for '{}' using {} ({} samples)",
                    estimate,
                    workflow_id,
                    model,
                    samples.len()
                );
                DurationPrediction {
                    duration_ms: estimate.round() as u64,
                    confidence: Self::confidence(model, samples.len()),
                    model,
                    sample_count: samples.len(),
                }
            }
            None => self.default_prediction(workflow, samples.len()),
        }
    }

    /// Predicts resource needs from step declarations or per-type profiles,
    /// plus safety margins.
    pub fn predict_resources(&self, workflow: &Workflow, _ctx: &ExecutionContext) -> ResourcePrediction {
        let (mut memory, mut cpu, mut timeout) = (0.0, 0.0, 0.0);

        for step in workflow.steps() {
            let meta = step.metadata();
            let profile = STEP_PROFILES
                .get(&meta.step_type)
                .copied()
                .unwrap_or(StepProfile { memory: 1.0, cpu: 1.0, timeout: 1.0 });

            memory += if meta.resources.memory_mb > 0 {
                meta.resources.memory_mb as f64
            } else {
                BASE_STEP_MEMORY_MB * profile.memory
            };
            cpu += if meta.resources.cpu > 0.0 {
                meta.resources.cpu
            } else {
                BASE_STEP_CPU * profile.cpu
            };
            timeout += meta
                .timeout_ms
                .or(meta.estimated_duration_ms)
                .map(|ms| ms as f64)
                .unwrap_or(BASE_STEP_TIMEOUT_MS * profile.timeout);
        }

        ResourcePrediction {
            memory_mb: (memory * MEMORY_MARGIN).round() as u64,
            cpu: cpu * CPU_MARGIN,
            timeout_ms: (timeout * TIMEOUT_MARGIN).round() as u64,
        }
    }

    /// Records the outcome of a run and scores the models against it.
    ///
    /// The prediction made before the run, if any, is scored against the
    /// actual duration. Every candidate model is also back-tested on the
    /// history that existed before this run, so model selection improves
    /// even for models that were not used.
    pub fn learn(
        &self,
        execution_id: &str,
        workflow: &Workflow,
        ctx: &ExecutionContext,
        result: &ExecutionResult,
        prior: Option<&DurationPrediction>,
    ) {
        let workflow_id = workflow.id();
        let signature = Self::context_signature(ctx);
        let actual = result.duration_ms.max(1) as f64;
        let step_count = workflow.declared_step_count();

        let mut state = self.state.lock();
        let samples = self.scored_samples(&state, &workflow_id, &signature);

        if samples.len() >= self.config.min_data_points {
            let tracked = state.accuracy.entry(workflow_id.clone()).or_default();
            for model in PredictionModel::CANDIDATES {
                if let Some(estimate) = models::estimate(
                    model,
                    &samples,
                    step_count,
                    self.config.per_step_cost_ms,
                    self.config.recency_window_hours,
                ) {
                    tracked
                        .entry(model)
                        .or_default()
                        .record(models::accuracy(estimate, actual));
                }
            }
        }

        let prior_accuracy = prior.map(|p| models::accuracy(p.duration_ms as f64, actual));
        if let Some(accuracy) = prior_accuracy {
            self.learned.lock().record(accuracy);
        }

        let sample = PredictionSample {
            workflow_id: workflow_id.clone(),
            context_signature: signature,
            step_count,
            duration_ms: result.duration_ms,
            success: result.success,
            model: prior.map(|p| p.model).unwrap_or(PredictionModel::Default),
            accuracy: prior_accuracy,
            predicted_ms: prior.map(|p| p.duration_ms),
            recorded_at: Utc::now(),
        };

        let history = state.history.entry(workflow_id.clone()).or_default();
        history.push_back(sample);
        while history.len() > self.config.max_history_per_workflow.max(1) {
            history.pop_front();
        }

        info!(
            "Learned from execution '{}' of '{}': {} ms{}",
            execution_id,
            workflow_id,
            result.duration_ms,
            prior_accuracy
                .map(|a| format!(" (prediction accuracy {:.0}%)", a * 100.0))
                .unwrap_or_default()
        );
    }

    /// Mean tracked accuracy per model for a workflow.
    pub fn model_accuracy(&self, workflow_id: &str) -> BTreeMap<PredictionModel, f64> {
        self.state
            .lock()
            .accuracy
            .get(workflow_id)
            .map(|tracked| {
                tracked
                    .iter()
                    .filter_map(|(model, t)| t.mean().map(|m| (*model, m)))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn history_len(&self, workflow_id: &str) -> usize {
        self.state
            .lock()
            .history
            .get(workflow_id)
            .map(|h| h.len())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> PredictorStats {
        let state = self.state.lock();
        let learned = self.learned.lock();
        PredictorStats {
            workflows: state.history.len(),
            samples: state.history.values().map(|h| h.len()).sum(),
            learned: learned.count,
            mean_accuracy: learned.mean(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::context::ExecutionStatus;
    use crate::workflow::{Step, StepResult};

    fn workflow(steps: usize) -> Workflow {
        let steps = (0..steps)
            .map(|i| Step::from_fn(format!("s{}", i), |_| StepResult::success()))
            .collect();
        Workflow::from_steps("wf", "1", steps)
    }

    fn result(duration_ms: u64) -> ExecutionResult {
        ExecutionResult {
            execution_id: "e".to_string(),
            workflow: "wf".to_string(),
            version: "1".to_string(),
            success: true,
            status: ExecutionStatus::Completed,
            error: None,
            error_kind: None,
            step_results: Vec::new(),
            timings: Vec::new(),
            data: BTreeMap::new(),
            duration_ms,
            from_cache: false,
            applied_optimizations: Vec::new(),
            predicted_duration_ms: None,
            attempts: 1,
        }
    }

    #[test]
    fn test_default_heuristic_without_history() {
        let predictor = ExecutionPredictor::new(PredictorConfig::default());
        let prediction = predictor.predict_duration(&workflow(3), &ExecutionContext::new());

        assert_eq!(prediction.model, PredictionModel::Default);
        assert_eq!(prediction.duration_ms, 3000);
        assert_eq!(prediction.sample_count, 0);
        assert!((prediction.confidence - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_default_until_min_data_points() {
        let predictor = ExecutionPredictor::new(PredictorConfig::default());
        let wf = workflow(2);
        let ctx = ExecutionContext::new().with_value("env", "ci");

        for i in 0..4 {
            predictor.learn("e", &wf, &ctx, &result(100 + i), None);
            let prediction = predictor.predict_duration(&wf, &ctx);
            assert_eq!(prediction.model, PredictionModel::Default);
            assert_eq!(prediction.duration_ms, 2000);
        }

        predictor.learn("e", &wf, &ctx, &result(104), None);
        let prediction = predictor.predict_duration(&wf, &ctx);
        assert_ne!(prediction.model, PredictionModel::Default);
        assert_eq!(prediction.sample_count, 5);
        assert!((prediction.duration_ms as i64 - 102).abs() <= 1);
    }

    #[test]
    fn test_dissimilar_contexts_are_ignored() {
        let predictor = ExecutionPredictor::new(PredictorConfig {
            similarity_threshold: 1.0,
            ..PredictorConfig::default()
        });
        let wf = workflow(2);
        let ctx_a = ExecutionContext::new().with_value("env", "a");
        let ctx_b = ExecutionContext::new().with_value("env", "b");

        for _ in 0..6 {
            predictor.learn("e", &wf, &ctx_a, &result(500), None);
        }
        assert_ne!(predictor.predict_duration(&wf, &ctx_a).model, PredictionModel::Default);
        assert_eq!(predictor.predict_duration(&wf, &ctx_b).model, PredictionModel::Default);
    }

    #[test]
    fn test_learn_tracks_accuracy() {
        let predictor = ExecutionPredictor::new(PredictorConfig {
            min_data_points: 2,
            ..PredictorConfig::default()
        });
        let wf = workflow(2);
        let ctx = ExecutionContext::new();

        for _ in 0..3 {
            let prediction = predictor.predict_duration(&wf, &ctx);
            predictor.learn("e", &wf, &ctx, &result(1000), Some(&prediction));
        }

        let accuracy = predictor.model_accuracy(&wf.id());
        assert_eq!(accuracy.get(&PredictionModel::Average), Some(&1.0));
        let stats = predictor.stats();
        assert_eq!(stats.learned, 3);
        assert_eq!(stats.samples, 3);
        // first prediction was the 2000 ms default against 1000 ms actual
        assert!(stats.mean_accuracy.unwrap() < 1.0);
    }

    #[test]
    fn test_history_is_bounded() {
        let predictor = ExecutionPredictor::new(PredictorConfig {
            max_history_per_workflow: 3,
            ..PredictorConfig::default()
        });
        let wf = workflow(1);
        let ctx = ExecutionContext::new();
        for i in 0..10 {
            predictor.learn("e", &wf, &ctx, &result(i * 10 + 1), None);
        }
        assert_eq!(predictor.history_len(&wf.id()), 3);
    }

    #[test]
    fn test_resource_prediction_margins() {
        let predictor = ExecutionPredictor::new(PredictorConfig::default());
        let wf = Workflow::new("wf", "1")
            .with_step(
                Step::from_fn("declared", |_| StepResult::success())
                    .with_resources(100, 1.0)
                    .with_timeout(std::time::Duration::from_millis(1000)),
            )
            .with_step(Step::from_fn("setup", |_| StepResult::success()).with_type(StepType::Setup));

        let prediction = predictor.predict_resources(&wf, &ExecutionContext::new());
        // (100 + 64 * 0.5) * 1.2
        assert_eq!(prediction.memory_mb, 158);
        // (1.0 + 0.25 * 0.5) * 1.1
        assert!((prediction.cpu - 1.2375).abs() < 1e-9);
        // (1000 + 30000 * 0.5) * 1.5
        assert_eq!(prediction.timeout_ms, 24_000);
    }

    #[test]
    fn test_context_signature_ignores_sensitive_values() {
        let a = ExecutionContext::new().with_value("env", "ci").with_sensitive("token", "1");
        let b = ExecutionContext::new().with_value("env", "ci").with_sensitive("token", "2");
        let sig = ExecutionPredictor::context_signature(&a);
        assert_eq!(sig.len(), 16);
        assert_eq!(sig, ExecutionPredictor::context_signature(&b));
    }
}
