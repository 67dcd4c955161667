//! Synthetic Steps
//!
//! Steps the optimizer builds out of several workflow steps. Each member
//! still runs through [`execute_step`], so its outcome lands in the step
//! records under its own name and dependents keep working.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use log::debug;
use serde_json::{Map, Value};

use super::analysis::step_duration_ms;
use super::OptimizerConfig;
use crate::execution::context::ExecutionContext;
use crate::workflow::{execute_step, Step, StepExecutor, StepMetadata, StepResult, SyntheticKind};

fn group_name(prefix: &str, members: &[Step]) -> String {
    let names: Vec<&str> = members.iter().map(|s| s.name()).collect();
    format!("{}[{}]", prefix, names.join(","))
}

/// Metadata shared by both group kinds.
///
/// Dependencies are the union of the members' dependencies, minus the
/// members themselves.
fn group_metadata(name: String, kind: SyntheticKind, members: &[Step]) -> StepMetadata {
    let member_names: BTreeSet<String> = members.iter().map(|s| s.name().to_string()).collect();
    let mut meta = StepMetadata::new(name);

    if let Some(first) = members.first() {
        meta.step_type = first.step_type();
    }
    meta.dependencies = members
        .iter()
        .flat_map(|s| s.dependencies().iter())
        .filter(|d| !member_names.contains(*d))
        .cloned()
        .collect();
    meta.modifies = members
        .iter()
        .flat_map(|s| s.metadata().modifies.iter().cloned())
        .collect();
    meta.side_effects = members.iter().any(|s| s.metadata().side_effects);
    meta.cacheable = members.iter().all(|s| s.metadata().cacheable);
    meta.priority = members.iter().map(|s| s.metadata().priority).max().unwrap_or(0);
    meta.synthetic = Some(kind);
    meta.members = members.iter().map(|s| s.name().to_string()).collect();
    meta
}

/// Merges members into one step that runs them back to back.
///
/// The estimate is the sum of the member estimates; members without one
/// count as the default step duration.
pub fn combine(members: Vec<Step>, config: &OptimizerConfig) -> Step {
    let mut meta = group_metadata(group_name("combined", &members), SyntheticKind::Combined, &members);

    for step in &members {
        let r = &step.metadata().resources;
        meta.resources.memory_mb = meta.resources.memory_mb.max(r.memory_mb);
        meta.resources.cpu = meta.resources.cpu.max(r.cpu);
    }
    meta.estimated_duration_ms = Some(members.iter().map(|s| step_duration_ms(s, config)).sum());

    Step::from_parts(meta, Arc::new(CombinedExecutor { members }))
}

/// Groups members into one step that runs them concurrently. The estimate
/// is the longest member estimate.
pub fn parallel(members: Vec<Step>, config: &OptimizerConfig) -> Step {
    let mut meta = group_metadata(group_name("parallel", &members), SyntheticKind::Parallel, &members);

    for step in &members {
        let r = &step.metadata().resources;
        meta.resources.memory_mb += r.memory_mb;
        meta.resources.cpu += r.cpu;
    }
    meta.estimated_duration_ms = members.iter().map(|s| step_duration_ms(s, config)).max();

    Step::from_parts(meta, Arc::new(ParallelExecutor { members }))
}

/// Runs members in order and stops at the first failure.
struct CombinedExecutor {
    members: Vec<Step>,
}

#[async_trait]
impl StepExecutor for CombinedExecutor {
    async fn run(&self, ctx: &mut ExecutionContext) -> StepResult {
        let mut outputs = Map::new();
        for step in &self.members {
            let result = execute_step(step, ctx).await;
            if !result.success {
                let message = result.error.unwrap_or_else(|| "unknown error".to_string());
                return StepResult::failed(format!("{}: {}", step.name(), message));
            }
            outputs.insert(step.name().to_string(), result.data);
        }
        StepResult::ok(Value::Object(outputs))
    }
}

/// Runs every member on a forked context.
///
/// The first failure drops the members still running. Forks that did
/// finish are merged back in member order, so the outcome is deterministic
/// regardless of completion order.
struct ParallelExecutor {
    members: Vec<Step>,
}

#[async_trait]
impl StepExecutor for ParallelExecutor {
    async fn run(&self, ctx: &mut ExecutionContext) -> StepResult {
        let mut running: FuturesUnordered<_> = self
            .members
            .iter()
            .enumerate()
            .map(|(index, step)| {
                let mut fork = ctx.fork();
                async move {
                    let result = execute_step(step, &mut fork).await;
                    (index, fork, result)
                }
            })
            .collect();

        let mut finished: Vec<Option<(ExecutionContext, StepResult)>> =
            (0..self.members.len()).map(|_| None).collect();
        let mut failure: Option<String> = None;

        while let Some((index, fork, result)) = running.next().await {
            let failed = !result.success;
            if failed {
                let message = result.error.clone().unwrap_or_else(|| "unknown error".to_string());
                failure = Some(format!("{}: {}", self.members[index].name(), message));
            }
            finished[index] = Some((fork, result));
            if failed {
                break;
            }
        }
        let abandoned = running.len();
        drop(running);
        if abandoned > 0 {
            debug!("Abandoned {} parallel member(s) after a failure", abandoned);
        }

        let mut outputs = Map::new();
        for (step, slot) in self.members.iter().zip(finished) {
            if let Some((fork, result)) = slot {
                ctx.merge(fork);
                outputs.insert(step.name().to_string(), result.data);
            }
        }

        match failure {
            Some(message) => StepResult::failed(message),
            None => StepResult::ok(Value::Object(outputs)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn ok_step(name: &str) -> Step {
        let key = name.to_string();
        Step::from_fn(name, move |ctx| {
            ctx.set(&key, true);
            StepResult::ok(key.clone())
        })
    }

    #[test]
    fn test_combine_metadata() {
        let group = combine(vec![
            ok_step("a").with_resources(100, 1.0).with_estimated_duration(Duration::from_millis(100)),
            ok_step("b")
                .depends_on("a")
                .depends_on("root")
                .with_resources(300, 0.5)
                .with_estimated_duration(Duration::from_millis(50)),
        ], &OptimizerConfig::default());

        let meta = group.metadata();
        assert_eq!(meta.name, "combined[a,b]");
        assert_eq!(meta.synthetic, Some(SyntheticKind::Combined));
        assert_eq!(meta.members, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(meta.dependencies, BTreeSet::from(["root".to_string()]));
        assert_eq!(meta.resources.memory_mb, 300);
        assert_eq!(meta.resources.cpu, 1.0);
        assert_eq!(meta.estimated_duration_ms, Some(150));
    }

    #[test]
    fn test_parallel_metadata() {
        let group = parallel(vec![
            ok_step("x").with_resources(100, 1.0).with_estimated_duration(Duration::from_millis(100)),
            ok_step("y").with_resources(200, 0.5).with_estimated_duration(Duration::from_millis(300)),
        ], &OptimizerConfig::default());

        let meta = group.metadata();
        assert_eq!(meta.name, "parallel[x,y]");
        assert_eq!(meta.resources.memory_mb, 300);
        assert_eq!(meta.resources.cpu, 1.5);
        assert_eq!(meta.estimated_duration_ms, Some(300));
    }

    #[test]
    fn test_group_estimates_without_member_estimates() {
        let config = OptimizerConfig::default();
        let combined = combine(vec![ok_step("a"), ok_step("b"), ok_step("c")], &config);
        assert_eq!(
            combined.metadata().estimated_duration_ms,
            Some(3 * config.default_step_duration_ms)
        );

        let grouped = parallel(
            vec![
                ok_step("x"),
                ok_step("y").with_estimated_duration(Duration::from_millis(2500)),
            ],
            &config,
        );
        assert_eq!(grouped.metadata().estimated_duration_ms, Some(2500));
    }

    #[tokio::test]
    async fn test_combined_stops_at_first_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let group = combine(vec![
            ok_step("a"),
            Step::from_fn("b", |_| StepResult::failed("boom")),
            Step::from_fn("c", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                StepResult::success()
            }),
        ], &OptimizerConfig::default());
        let mut ctx = ExecutionContext::new();

        let result = execute_step(&group, &mut ctx).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("b: boom"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(ctx.has_completed("a"));
        assert!(!ctx.has_completed("b"));
        assert!(ctx.step_record("combined[a,b,c]").is_none());
    }

    #[tokio::test]
    async fn test_parallel_merges_members() {
        let group = parallel(vec![ok_step("x"), ok_step("y"), ok_step("z")], &OptimizerConfig::default());
        let mut ctx = ExecutionContext::new();

        let result = execute_step(&group, &mut ctx).await;
        assert!(result.success);
        assert_eq!(result.data["y"], "y");
        for name in ["x", "y", "z"] {
            assert!(ctx.has_completed(name));
            assert_eq!(ctx.get_bool(name), Some(true));
        }
        let recorded: Vec<&str> = ctx.step_records().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(recorded, vec!["x", "y", "z"]);
    }

    #[tokio::test]
    async fn test_parallel_failure_fails_group() {
        let group = parallel(vec![
            ok_step("x"),
            Step::from_fn("y", |_| StepResult::failed("bad input")),
        ], &OptimizerConfig::default());
        let mut ctx = ExecutionContext::new();

        let result = execute_step(&group, &mut ctx).await;
        assert!(!result.success);
        assert!(result.error.unwrap_or_default().contains("bad input"));
        assert_eq!(ctx.counter("steps_failed"), 1);
    }
}
