//! Workflow Validation
//!
//! Dependency graph checks shared by the optimizer and the scheduler:
//! - Step name uniqueness
//! - Reference integrity (every dependency names a known step)
//! - Topological sorting with a step-type tie-break (also detects cycles)
//! - Order consistency (no step listed before one of its dependencies)

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use log::{debug, info};

use super::model::Step;
use crate::error::{EngineError, Result};

/// Fails if two steps share a name.
pub fn check_unique_names(steps: &[Step]) -> Result<()> {
    let mut seen: HashSet<&str> = HashSet::new();
    for step in steps {
        if step.name().is_empty() {
            return Err(EngineError::Workflow("step has an empty name".to_string()));
        }
        if !seen.insert(step.name()) {
            return Err(EngineError::Workflow(format!(
                "duplicate step name: '{}'",
                step.name()
            )));
        }
    }
    Ok(())
}

/// Fails if a step depends on a step that is not part of the list.
pub fn check_references(steps: &[Step]) -> Result<()> {
    let names: HashSet<&str> = steps.iter().map(|s| s.name()).collect();
    for step in steps {
        for dep in step.dependencies() {
            if !names.contains(dep.as_str()) {
                return Err(EngineError::DependencyViolation {
                    step: step.name().to_string(),
                    dependency: dep.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Computes a dependency-respecting order using Kahn's algorithm.
///
/// Among steps that are ready at the same time, the lower step-type
/// priority goes first, then the original position. Dependencies on
/// names outside the list are ignored. Returns indices into `steps`.
pub fn topological_order(steps: &[Step]) -> Result<Vec<usize>> {
    check_unique_names(steps)?;

    let index_of: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.name(), i))
        .collect();

    let mut in_degree: Vec<usize> = vec![0; steps.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    for (i, step) in steps.iter().enumerate() {
        for dep in step.dependencies() {
            if let Some(&d) = index_of.get(dep.as_str()) {
                in_degree[i] += 1;
                dependents[d].push(i);
            }
        }
    }

    let mut ready: BinaryHeap<Reverse<(u8, usize)>> = steps
        .iter()
        .enumerate()
        .filter(|(i, _)| in_degree[*i] == 0)
        .map(|(i, s)| Reverse((s.step_type().priority(), i)))
        .collect();

    let mut order = Vec::with_capacity(steps.len());
    while let Some(Reverse((_, current))) = ready.pop() {
        order.push(current);
        for &next in &dependents[current] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push(Reverse((steps[next].step_type().priority(), next)));
            }
        }
    }

    if order.len() != steps.len() {
        let mut cyclic: Vec<String> = steps
            .iter()
            .enumerate()
            .filter(|(i, _)| in_degree[*i] > 0)
            .map(|(_, s)| s.name().to_string())
            .collect();
        cyclic.sort();
        return Err(EngineError::DependencyCycle { steps: cyclic });
    }

    debug!("Topological order computed for {} steps", order.len());
    Ok(order)
}

/// Returns the steps rearranged into [`topological_order`].
pub fn sort_steps(steps: &[Step]) -> Result<Vec<Step>> {
    let order = topological_order(steps)?;
    Ok(order.into_iter().map(|i| steps[i].clone()).collect())
}

/// Finds the first step listed before one of its (known) dependencies.
pub fn first_order_violation(steps: &[Step]) -> Option<(String, String)> {
    let names: HashSet<&str> = steps.iter().map(|s| s.name()).collect();
    let mut seen: HashSet<&str> = HashSet::new();
    for step in steps {
        for dep in step.dependencies() {
            if names.contains(dep.as_str()) && !seen.contains(dep.as_str()) {
                return Some((step.name().to_string(), dep.clone()));
            }
        }
        seen.insert(step.name());
    }
    None
}

/// Counts dependency edges that point forward in the list.
pub fn count_order_violations(steps: &[Step]) -> usize {
    let names: HashSet<&str> = steps.iter().map(|s| s.name()).collect();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut violations = 0;
    for step in steps {
        violations += step
            .dependencies()
            .iter()
            .filter(|dep| names.contains(dep.as_str()) && !seen.contains(dep.as_str()))
            .count();
        seen.insert(step.name());
    }
    violations
}

/// Full validation of an (already ordered) step list.
///
/// Performs the following checks:
/// 1. No duplicate step names
/// 2. All dependencies reference known steps
/// 3. No cyclic dependencies
/// 4. The list order respects every dependency
pub fn validate_steps(steps: &[Step]) -> Result<()> {
    info!("Validating {} steps", steps.len());

    check_unique_names(steps)?;
    check_references(steps)?;
    topological_order(steps)?;

    if let Some((step, dependency)) = first_order_violation(steps) {
        return Err(EngineError::DependencyViolation { step, dependency });
    }

    Ok(())
}
