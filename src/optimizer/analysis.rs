//! Step Analysis
//!
//! Metrics the optimizer compares before and after every pass, and the
//! pairwise step relations the passes are built on.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::OptimizerConfig;
use crate::workflow::validator::count_order_violations;
use crate::workflow::{ResourceRequirements, Step};

/// Cost figures of a step list.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkflowMetrics {
    pub step_count: usize,
    /// Sum of step durations plus the per-step scheduling overhead
    pub estimated_duration_ms: u64,
    /// Steps + dependency edges + twice the number of order violations
    pub complexity: usize,
}

impl WorkflowMetrics {
    /// True when no figure got worse.
    pub fn no_worse_than(&self, before: &WorkflowMetrics) -> bool {
        self.step_count <= before.step_count
            && self.estimated_duration_ms <= before.estimated_duration_ms
            && self.complexity <= before.complexity
    }

    /// True when at least one figure got better.
    pub fn improves_on(&self, before: &WorkflowMetrics) -> bool {
        self.step_count < before.step_count
            || self.estimated_duration_ms < before.estimated_duration_ms
            || self.complexity < before.complexity
    }
}

/// Estimated run time of a single step, without overhead.
pub fn step_duration_ms(step: &Step, config: &OptimizerConfig) -> u64 {
    step.metadata()
        .estimated_duration_ms
        .unwrap_or(config.default_step_duration_ms)
}

/// Computes [`WorkflowMetrics`] for a step list.
pub fn analyze(steps: &[Step], config: &OptimizerConfig) -> WorkflowMetrics {
    let names: HashSet<&str> = steps.iter().map(|s| s.name()).collect();
    let edges: usize = steps
        .iter()
        .map(|s| {
            s.dependencies()
                .iter()
                .filter(|d| names.contains(d.as_str()))
                .count()
        })
        .sum();

    let estimated_duration_ms = steps
        .iter()
        .map(|s| step_duration_ms(s, config) + config.step_overhead_ms)
        .sum();

    WorkflowMetrics {
        step_count: steps.len(),
        estimated_duration_ms,
        complexity: steps.len() + edges + 2 * count_order_violations(steps),
    }
}

fn ratio(a: f64, b: f64) -> f64 {
    let max = a.max(b);
    if max <= 0.0 {
        1.0
    } else {
        a.min(b) / max
    }
}

/// Similarity of two resource profiles, 0..=1.
pub fn resource_similarity(a: &ResourceRequirements, b: &ResourceRequirements) -> f64 {
    (ratio(a.memory_mb as f64, b.memory_mb as f64) + ratio(a.cpu, b.cpu)) / 2.0
}

/// Similarity of two steps by type and resource profile, 0..=1.
///
/// Steps of different types never reach more than 0.5.
pub fn step_similarity(a: &Step, b: &Step) -> f64 {
    let type_score = if a.step_type() == b.step_type() { 1.0 } else { 0.0 };
    let resource_score = resource_similarity(&a.metadata().resources, &b.metadata().resources);
    0.5 * type_score + 0.5 * resource_score
}

/// Identity used to detect duplicate steps: type, name and parameters.
pub fn duplicate_key(step: &Step) -> String {
    let meta = step.metadata();
    format!(
        "{}|{}|{}",
        meta.step_type,
        meta.name,
        serde_json::to_string(&meta.parameters).unwrap_or_default()
    )
}

/// True when both steps declare a common modified resource.
pub fn modifies_overlap(a: &Step, b: &Step) -> bool {
    !a.metadata().modifies.is_disjoint(&b.metadata().modifies)
}

/// Whether a step may join a combined group.
pub fn can_combine(step: &Step) -> bool {
    let meta = step.metadata();
    meta.combinable && !meta.is_synthetic() && !meta.disabled
}

/// Whether a step may join a parallel group.
pub fn can_parallelize(step: &Step) -> bool {
    let meta = step.metadata();
    meta.parallelizable && !meta.side_effects && !meta.is_synthetic() && !meta.disabled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{StepResult, StepType};
    use std::time::Duration;

    fn step(name: &str) -> Step {
        Step::from_fn(name, |_| StepResult::success())
    }

    #[test]
    fn test_analyze_counts_overhead_and_edges() {
        let config = OptimizerConfig::default();
        let steps = vec![
            step("a").with_estimated_duration(Duration::from_millis(200)),
            step("b").depends_on("a"),
        ];

        let metrics = analyze(&steps, &config);
        assert_eq!(metrics.step_count, 2);
        assert_eq!(
            metrics.estimated_duration_ms,
            200 + config.default_step_duration_ms + 2 * config.step_overhead_ms
        );
        assert_eq!(metrics.complexity, 3);
    }

    #[test]
    fn test_order_violations_raise_complexity() {
        let config = OptimizerConfig::default();
        let ordered = vec![step("a"), step("b").depends_on("a")];
        let reversed = vec![step("b").depends_on("a"), step("a")];

        let good = analyze(&ordered, &config);
        let bad = analyze(&reversed, &config);
        assert_eq!(bad.complexity, good.complexity + 2);
        assert!(good.improves_on(&bad));
        assert!(good.no_worse_than(&bad));
        assert!(!bad.no_worse_than(&good));
    }

    #[test]
    fn test_step_similarity() {
        let a = step("a").with_type(StepType::Analysis).with_resources(100, 1.0);
        let b = step("b").with_type(StepType::Analysis).with_resources(90, 1.0);
        let c = step("c").with_type(StepType::Testing).with_resources(100, 1.0);

        assert!((step_similarity(&a, &b) - 0.975).abs() < 1e-9);
        assert!((step_similarity(&a, &c) - 0.5).abs() < 1e-9);
        assert_eq!(step_similarity(&step("x"), &step("y")), 1.0);
    }

    #[test]
    fn test_duplicate_key_includes_parameters() {
        let a = step("fmt").with_parameter("check", true);
        let b = step("fmt").with_parameter("check", true);
        let c = step("fmt").with_parameter("check", false);
        assert_eq!(duplicate_key(&a), duplicate_key(&b));
        assert_ne!(duplicate_key(&a), duplicate_key(&c));
    }

    #[test]
    fn test_group_eligibility() {
        assert!(can_parallelize(&step("p").parallelizable(true)));
        assert!(!can_parallelize(&step("p").parallelizable(true).with_side_effects(true)));
        assert!(!can_parallelize(&step("p")));
        assert!(can_combine(&step("c").combinable(true)));
        assert!(!can_combine(&step("c")));

        let a = step("a").modifies("db");
        let b = step("b").modifies("db");
        let c = step("c").modifies("cache");
        assert!(modifies_overlap(&a, &b));
        assert!(!modifies_overlap(&a, &c));
    }
}
