//! Duration Models
//!
//! Deterministic heuristics estimating a run's duration from past samples.
//! None of them learns weights; the predictor picks among them by how
//! accurate each has been for a workflow.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Width of a step-count bucket for the pattern model.
const PATTERN_BUCKET_WIDTH: usize = 5;

/// Smallest recency weight a sample can have.
const RECENCY_FLOOR: f64 = 0.1;

/// An estimation heuristic.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum PredictionModel {
    /// `step_count × per-step cost`, used without enough history
    Default,
    Average,
    LinearRegression,
    PatternBased,
    WeightedAverage,
}

impl PredictionModel {
    /// Models eligible once enough history exists.
    pub const CANDIDATES: [PredictionModel; 4] = [
        PredictionModel::WeightedAverage,
        PredictionModel::Average,
        PredictionModel::LinearRegression,
        PredictionModel::PatternBased,
    ];

    /// Confidence the model starts from before sample count is considered.
    pub fn base_confidence(&self) -> f64 {
        match self {
            Self::Default => 0.3,
            Self::Average => 0.6,
            Self::LinearRegression => 0.7,
            Self::PatternBased => 0.65,
            Self::WeightedAverage => 0.75,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Average => "average",
            Self::LinearRegression => "linear_regression",
            Self::PatternBased => "pattern_based",
            Self::WeightedAverage => "weighted_average",
        }
    }
}

impl fmt::Display for PredictionModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A historical sample as seen from the run being predicted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredSample {
    pub step_count: usize,
    pub duration_ms: f64,
    /// Context similarity to the run being predicted, 0..=1
    pub similarity: f64,
    /// Hours since the sample was recorded
    pub age_hours: f64,
}

/// Fraction of matching leading characters of two context signatures.
///
/// Signatures are hex digests, so this is a cheap deterministic proxy for
/// "ran against a similar context", not a semantic measure.
pub fn context_similarity(a: &str, b: &str) -> f64 {
    let len = a.len().max(b.len());
    if len == 0 {
        return 1.0;
    }
    let shared = a
        .chars()
        .zip(b.chars())
        .take_while(|(x, y)| x == y)
        .count();
    shared as f64 / len as f64
}

/// Estimates a duration in milliseconds, or `None` if the model has
/// nothing to go on.
pub fn estimate(
    model: PredictionModel,
    samples: &[ScoredSample],
    step_count: usize,
    default_per_step_ms: u64,
    recency_window_hours: f64,
) -> Option<f64> {
    match model {
        PredictionModel::Default => Some(step_count as f64 * default_per_step_ms as f64),
        PredictionModel::Average => average(samples),
        PredictionModel::LinearRegression => linear_regression(samples, step_count),
        PredictionModel::PatternBased => pattern_based(samples),
        PredictionModel::WeightedAverage => weighted_average(samples, recency_window_hours),
    }
}

/// Mean duration.
pub fn average(samples: &[ScoredSample]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    Some(samples.iter().map(|s| s.duration_ms).sum::<f64>() / samples.len() as f64)
}

/// Least squares fit of duration over step count, evaluated at `step_count`.
///
/// Falls back to the mean when every sample has the same step count.
pub fn linear_regression(samples: &[ScoredSample], step_count: usize) -> Option<f64> {
    let mean_y = average(samples)?;
    let n = samples.len() as f64;
    let mean_x = samples.iter().map(|s| s.step_count as f64).sum::<f64>() / n;

    let (mut sxy, mut sxx) = (0.0, 0.0);
    for s in samples {
        let dx = s.step_count as f64 - mean_x;
        sxy += dx * (s.duration_ms - mean_y);
        sxx += dx * dx;
    }

    if sxx.abs() < f64::EPSILON {
        return Some(mean_y);
    }

    let slope = sxy / sxx;
    let intercept = mean_y - slope * mean_x;
    Some((intercept + slope * step_count as f64).max(0.0))
}

/// Mean of the most populated step-count bucket.
///
/// Ties go to the bucket with the smaller step counts.
pub fn pattern_based(samples: &[ScoredSample]) -> Option<f64> {
    let mut buckets: HashMap<usize, Vec<f64>> = HashMap::new();
    for s in samples {
        buckets
            .entry(s.step_count / PATTERN_BUCKET_WIDTH)
            .or_default()
            .push(s.duration_ms);
    }

    let (_, durations) = buckets
        .into_iter()
        .max_by(|(ka, a), (kb, b)| a.len().cmp(&b.len()).then(kb.cmp(ka)))?;
    Some(durations.iter().sum::<f64>() / durations.len() as f64)
}

/// Average weighted by similarity and a linear recency decay.
pub fn weighted_average(samples: &[ScoredSample], recency_window_hours: f64) -> Option<f64> {
    let window = recency_window_hours.max(f64::EPSILON);
    let (mut weighted, mut total) = (0.0, 0.0);
    for s in samples {
        let recency = (1.0 - s.age_hours / window).max(RECENCY_FLOOR);
        let weight = s.similarity * recency;
        weighted += s.duration_ms * weight;
        total += weight;
    }

    if total <= 0.0 {
        return average(samples);
    }
    Some(weighted / total)
}

/// `max(0, 1 - |predicted - actual| / actual)`.
pub fn accuracy(predicted_ms: f64, actual_ms: f64) -> f64 {
    let actual = actual_ms.max(1.0);
    (1.0 - (predicted_ms - actual).abs() / actual).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(step_count: usize, duration_ms: f64) -> ScoredSample {
        ScoredSample {
            step_count,
            duration_ms,
            similarity: 1.0,
            age_hours: 0.0,
        }
    }

    #[test]
    fn test_similarity_is_prefix_based() {
        assert_eq!(context_similarity("abcdefgh", "abcdefgh"), 1.0);
        assert_eq!(context_similarity("abcd0000", "abcd1111"), 0.5);
        assert_eq!(context_similarity("0bcdefgh", "abcdefgh"), 0.0);
        assert_eq!(context_similarity("", ""), 1.0);
    }

    #[test]
    fn test_average() {
        let samples = [sample(3, 100.0), sample(3, 200.0), sample(3, 300.0)];
        assert_eq!(average(&samples), Some(200.0));
        assert_eq!(average(&[]), None);
    }

    #[test]
    fn test_linear_regression() {
        let samples = [sample(1, 100.0), sample(2, 200.0), sample(3, 300.0)];
        let estimate = linear_regression(&samples, 5).unwrap();
        assert!((estimate - 500.0).abs() < 1e-6);
    }

    #[test]
    fn test_linear_regression_constant_x_uses_mean() {
        let samples = [sample(4, 100.0), sample(4, 300.0)];
        assert_eq!(linear_regression(&samples, 10), Some(200.0));
    }

    #[test]
    fn test_pattern_based_uses_largest_bucket() {
        let samples = [
            sample(2, 100.0),
            sample(3, 300.0),
            sample(4, 200.0),
            sample(12, 5000.0),
        ];
        assert_eq!(pattern_based(&samples), Some(200.0));
    }

    #[test]
    fn test_weighted_average_prefers_recent_similar() {
        let samples = [
            ScoredSample { step_count: 3, duration_ms: 100.0, similarity: 1.0, age_hours: 0.0 },
            ScoredSample { step_count: 3, duration_ms: 1000.0, similarity: 0.5, age_hours: 48.0 },
        ];
        // weights 1.0 and 0.5 * 0.1
        let expected = (100.0 + 1000.0 * 0.05) / 1.05;
        let estimate = weighted_average(&samples, 24.0).unwrap();
        assert!((estimate - expected).abs() < 1e-9);
    }

    #[test]
    fn test_accuracy() {
        assert_eq!(accuracy(100.0, 100.0), 1.0);
        assert!((accuracy(150.0, 100.0) - 0.5).abs() < 1e-9);
        assert_eq!(accuracy(500.0, 100.0), 0.0);
    }

    #[test]
    fn test_default_model_estimate() {
        assert_eq!(estimate(PredictionModel::Default, &[], 4, 1000, 24.0), Some(4000.0));
        assert_eq!(estimate(PredictionModel::Average, &[], 4, 1000, 24.0), None);
    }
}
