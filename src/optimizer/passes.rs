//! Optimization Passes
//!
//! Each pass takes the current step list and returns a new one; the input
//! is never modified. Whether a pass result is kept is decided by the
//! optimizer, not here.

use std::collections::{BTreeSet, HashMap, HashSet};

use log::debug;

use super::analysis::{can_combine, can_parallelize, duplicate_key, modifies_overlap, step_similarity};
use super::composite;
use super::OptimizerConfig;
use crate::error::Result;
use crate::execution::context::ExecutionContext;
use crate::workflow::validator::sort_steps;
use crate::workflow::{skip_reason, Step};

/// Context flag that shortens step timeouts.
pub const FAST_MODE_FLAG: &str = "fast_mode";

/// Context flag that raises step retry counts.
pub const PRODUCTION_MODE_FLAG: &str = "production_mode";

/// Resolves a dependency through removed steps, transitively.
fn resolve_dependency(
    dep: &str,
    removed: &HashMap<String, BTreeSet<String>>,
    visited: &mut HashSet<String>,
    out: &mut BTreeSet<String>,
) {
    match removed.get(dep) {
        Some(inherited) => {
            if !visited.insert(dep.to_string()) {
                return;
            }
            for d in inherited {
                resolve_dependency(d, removed, visited, out);
            }
        }
        None => {
            out.insert(dep.to_string());
        }
    }
}

/// Drops exact duplicates and steps that would be skipped at run time.
///
/// Dependents of a dropped step inherit its dependencies so ordering
/// constraints survive the removal.
pub fn remove_redundant(
    steps: &[Step],
    ctx: &ExecutionContext,
    _config: &OptimizerConfig,
) -> Result<Vec<Step>> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut removed: HashMap<String, BTreeSet<String>> = HashMap::new();
    let mut kept: Vec<Step> = Vec::with_capacity(steps.len());

    for step in steps {
        if !seen.insert(duplicate_key(step)) {
            debug!("Dropping duplicate step '{}'", step.name());
            continue;
        }
        if let Some(reason) = skip_reason(step, ctx) {
            debug!("Dropping step '{}': {}", step.name(), reason);
            removed.insert(step.name().to_string(), step.dependencies().clone());
            continue;
        }
        kept.push(step.clone());
    }

    if removed.is_empty() {
        return Ok(kept);
    }

    Ok(kept
        .into_iter()
        .map(|step| {
            if step.dependencies().iter().all(|d| !removed.contains_key(d)) {
                return step;
            }
            let mut deps = BTreeSet::new();
            for dep in step.dependencies() {
                resolve_dependency(dep, &removed, &mut HashSet::new(), &mut deps);
            }
            deps.remove(step.name());
            step.with_metadata(|m| m.dependencies = deps)
        })
        .collect())
}

/// Topological sort with the step-type tie-break. A cycle is an error.
pub fn reorder(steps: &[Step], _ctx: &ExecutionContext, _config: &OptimizerConfig) -> Result<Vec<Step>> {
    sort_steps(steps)
}

/// Merges runs of similar combinable steps into combined steps.
pub fn combine(steps: &[Step], _ctx: &ExecutionContext, config: &OptimizerConfig) -> Result<Vec<Step>> {
    let max = config.max_combined_steps.max(2);
    let fits = |group: &[Step], candidate: &Step| {
        can_combine(candidate)
            && group.len() < max
            && group
                .iter()
                .all(|member| step_similarity(member, candidate) >= config.similarity_threshold)
    };

    Ok(group_runs(steps, fits, |run| composite::combine(run, config)))
}

/// Groups runs of independent parallelizable steps into parallel steps.
pub fn parallelize(steps: &[Step], _ctx: &ExecutionContext, config: &OptimizerConfig) -> Result<Vec<Step>> {
    let max = config.max_parallel_steps.max(2);
    let fits = |group: &[Step], candidate: &Step| {
        can_parallelize(candidate)
            && group.len() < max
            && group.iter().all(|member| {
                !candidate.dependencies().contains(member.name()) && !modifies_overlap(member, candidate)
            })
    };

    Ok(group_runs(steps, fits, |run| composite::parallel(run, config)))
}

/// Scans the list for consecutive runs accepted by `fits` and replaces each
/// run of two or more with `build(run)`. Dependencies on grouped members
/// are redirected to the group.
fn group_runs<F, B>(steps: &[Step], fits: F, build: B) -> Vec<Step>
where
    F: Fn(&[Step], &Step) -> bool,
    B: Fn(Vec<Step>) -> Step,
{
    let mut out: Vec<Step> = Vec::with_capacity(steps.len());
    let mut run: Vec<Step> = Vec::new();
    let mut redirect: HashMap<String, String> = HashMap::new();

    let flush = |run: &mut Vec<Step>, out: &mut Vec<Step>, redirect: &mut HashMap<String, String>| {
        match run.len() {
            0 => {}
            1 => out.extend(run.drain(..)),
            _ => {
                let group = build(std::mem::take(run));
                debug!("Built synthetic step '{}'", group.name());
                for member in &group.metadata().members {
                    redirect.insert(member.clone(), group.name().to_string());
                }
                out.push(group);
            }
        }
    };

    for step in steps {
        let starts_run = run.is_empty() && fits(&[], step);
        if starts_run || (!run.is_empty() && fits(&run, step)) {
            run.push(step.clone());
            continue;
        }
        flush(&mut run, &mut out, &mut redirect);
        if fits(&[], step) {
            run.push(step.clone());
        } else {
            out.push(step.clone());
        }
    }
    flush(&mut run, &mut out, &mut redirect);

    if redirect.is_empty() {
        return out;
    }

    out.into_iter()
        .map(|step| {
            if step.dependencies().iter().all(|d| !redirect.contains_key(d)) {
                return step;
            }
            let own = step.name().to_string();
            let deps: BTreeSet<String> = step
                .dependencies()
                .iter()
                .map(|d| redirect.get(d).cloned().unwrap_or_else(|| d.clone()))
                .filter(|d| *d != own)
                .collect();
            step.with_metadata(|m| m.dependencies = deps)
        })
        .collect()
}

/// Adjusts timeouts and retries from context flags.
///
/// `fast_mode` scales every declared timeout by the configured factor;
/// `production_mode` raises retries to the configured minimum.
pub fn parameter_tuning(
    steps: &[Step],
    ctx: &ExecutionContext,
    config: &OptimizerConfig,
) -> Result<Vec<Step>> {
    let fast = ctx.get_bool(FAST_MODE_FLAG).unwrap_or(false);
    let production = ctx.get_bool(PRODUCTION_MODE_FLAG).unwrap_or(false);
    if !fast && !production {
        return Ok(steps.to_vec());
    }

    let factor = config.fast_mode_timeout_factor;
    Ok(steps
        .iter()
        .map(|step| {
            let meta = step.metadata();
            if meta.is_synthetic() {
                return step.clone();
            }
            let tune_timeout = fast && meta.timeout_ms.is_some();
            let tune_retries = production && meta.retries < config.production_min_retries;
            if !tune_timeout && !tune_retries {
                return step.clone();
            }
            step.with_metadata(|m| {
                if tune_timeout {
                    m.timeout_ms = m
                        .timeout_ms
                        .map(|t| ((t as f64 * factor).round() as u64).max(1));
                }
                if tune_retries {
                    m.retries = config.production_min_retries;
                }
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::workflow::validator::first_order_violation;
    use crate::workflow::{Condition, StepResult, StepType, SyntheticKind};
    use std::time::Duration;

    fn step(name: &str) -> Step {
        Step::from_fn(name, |_| StepResult::success())
    }

    fn names(steps: &[Step]) -> Vec<&str> {
        steps.iter().map(|s| s.name()).collect()
    }

    #[test]
    fn test_remove_redundant_rewrites_dependents() {
        let ctx = ExecutionContext::new();
        let config = OptimizerConfig::default();
        let steps = vec![
            step("fetch"),
            step("fetch"),
            step("notify").depends_on("fetch").when(Condition::Exists { key: "webhook".into() }),
            step("archive").depends_on("notify"),
        ];

        let out = remove_redundant(&steps, &ctx, &config).unwrap();
        assert_eq!(names(&out), vec!["fetch", "archive"]);
        assert_eq!(out[1].dependencies(), &BTreeSet::from(["fetch".to_string()]));
        // input untouched
        assert!(steps[3].dependencies().contains("notify"));
    }

    #[test]
    fn test_reorder_reports_cycle() {
        let ctx = ExecutionContext::new();
        let steps = vec![step("a").depends_on("b"), step("b").depends_on("a")];
        let err = reorder(&steps, &ctx, &OptimizerConfig::default()).unwrap_err();
        assert!(matches!(err, EngineError::DependencyCycle { .. }));
    }

    #[test]
    fn test_reorder_uses_type_priority() {
        let ctx = ExecutionContext::new();
        let steps = vec![
            step("deploy").with_type(StepType::Deployment),
            step("setup").with_type(StepType::Setup),
            step("test").with_type(StepType::Testing).depends_on("setup"),
        ];
        let out = reorder(&steps, &ctx, &OptimizerConfig::default()).unwrap();
        assert_eq!(names(&out), vec!["setup", "test", "deploy"]);
    }

    #[test]
    fn test_parallelize_groups_independent_steps() {
        let ctx = ExecutionContext::new();
        let config = OptimizerConfig::default();
        let steps = vec![
            step("a").parallelizable(true),
            step("b").parallelizable(true),
            step("c").parallelizable(true),
            step("d").depends_on("b"),
        ];

        let out = parallelize(&steps, &ctx, &config).unwrap();
        assert_eq!(names(&out), vec!["parallel[a,b,c]", "d"]);
        assert_eq!(out[0].metadata().synthetic, Some(SyntheticKind::Parallel));
        assert_eq!(
            out[1].dependencies(),
            &BTreeSet::from(["parallel[a,b,c]".to_string()])
        );
        assert!(first_order_violation(&out).is_none());
    }

    #[test]
    fn test_parallelize_respects_bounds_and_conflicts() {
        let ctx = ExecutionContext::new();
        let config = OptimizerConfig {
            max_parallel_steps: 2,
            ..OptimizerConfig::default()
        };
        let steps = vec![
            step("a").parallelizable(true).modifies("db"),
            step("b").parallelizable(true).modifies("db"),
            step("c").parallelizable(true),
            step("d").parallelizable(true).depends_on("c"),
            step("e").parallelizable(true).with_side_effects(true),
        ];

        let out = parallelize(&steps, &ctx, &config).unwrap();
        assert_eq!(names(&out), vec!["a", "parallel[b,c]", "d", "e"]);
    }

    #[test]
    fn test_combine_similar_steps() {
        let ctx = ExecutionContext::new();
        let config = OptimizerConfig::default();
        let steps = vec![
            step("lint").combinable(true).with_type(StepType::Validation),
            step("fmt").combinable(true).with_type(StepType::Validation),
            step("build").combinable(true).with_type(StepType::Processing),
        ];

        let out = combine(&steps, &ctx, &config).unwrap();
        assert_eq!(names(&out), vec!["combined[lint,fmt]", "build"]);
    }

    #[test]
    fn test_parameter_tuning_flags() {
        let config = OptimizerConfig::default();
        let steps = vec![step("slow").with_timeout(Duration::from_secs(10)), step("plain")];

        let unchanged = parameter_tuning(&steps, &ExecutionContext::new(), &config).unwrap();
        assert_eq!(unchanged[0].metadata().timeout_ms, Some(10_000));

        let ctx = ExecutionContext::new()
            .with_value(FAST_MODE_FLAG, true)
            .with_value(PRODUCTION_MODE_FLAG, true);
        let tuned = parameter_tuning(&steps, &ctx, &config).unwrap();
        assert_eq!(tuned[0].metadata().timeout_ms, Some(5_000));
        assert_eq!(tuned[1].metadata().timeout_ms, None);
        assert_eq!(tuned[0].metadata().retries, config.production_min_retries);
        assert_eq!(tuned[1].metadata().retries, config.production_min_retries);
    }
}
