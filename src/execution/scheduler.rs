//! Execution Scheduler
//!
//! Turns an optimized step list into a [`ScheduledExecution`]:
//! - Validates the dependency graph and that the list order respects it
//! - Picks a concurrency level bounded by the execution's allocated slots
//! - Hands out the cancellation token checked at every step boundary
//!
//! Cancellation is cooperative. [`ExecutionScheduler::cancel`] only flips
//! the token; the engine stops before starting the next step.

use std::collections::HashMap;

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::options::ExecutionStrategy;
use crate::error::Result;
use crate::resources::Allocation;
use crate::workflow::validator::validate_steps;
use crate::workflow::{Step, SyntheticKind};

/// A validated plan for one execution.
#[derive(Debug, Clone)]
pub struct ScheduledExecution {
    pub execution_id: String,
    pub steps: Vec<Step>,
    /// Steps that may run at the same time
    pub concurrency: usize,
    pub strategy: ExecutionStrategy,
    pub token: CancellationToken,
}

impl ScheduledExecution {
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }
}

/// Scheduler counters.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct SchedulerStats {
    pub registered: usize,
    pub capacity: usize,
    pub scheduled_total: u64,
    pub rejected_total: u64,
    pub cancelled_total: u64,
}

#[derive(Default)]
struct SchedulerState {
    tokens: HashMap<String, CancellationToken>,
    scheduled_total: u64,
    rejected_total: u64,
    cancelled_total: u64,
}

/// Dependency-checked planning plus the cancellation registry.
pub struct ExecutionScheduler {
    capacity: usize,
    state: Mutex<SchedulerState>,
}

impl ExecutionScheduler {
    /// `capacity` bounds the number of registered executions considered healthy.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(SchedulerState::default()),
        }
    }

    /// Registers an execution and returns its cancellation token.
    ///
    /// Registering an id twice returns the existing token.
    pub fn register(&self, execution_id: &str) -> CancellationToken {
        self.state
            .lock()
            .tokens
            .entry(execution_id.to_string())
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    /// Builds the plan for an execution.
    ///
    /// Fails with `DependencyCycle` or `DependencyViolation` if the steps
    /// cannot run in the given order.
    pub fn schedule(
        &self,
        execution_id: &str,
        steps: Vec<Step>,
        allocation: &Allocation,
        strategy: ExecutionStrategy,
    ) -> Result<ScheduledExecution> {
        if let Err(e) = validate_steps(&steps) {
            self.state.lock().rejected_total += 1;
            warn!("Cannot schedule execution '{}': {}", execution_id, e);
            return Err(e);
        }

        let widest = steps
            .iter()
            .filter(|s| s.metadata().synthetic == Some(SyntheticKind::Parallel))
            .map(|s| s.metadata().members.len())
            .max()
            .unwrap_or(1);
        let slots = allocation.slots.max(1);
        let concurrency = match strategy {
            ExecutionStrategy::Simple => 1,
            ExecutionStrategy::Basic => widest.min(slots).max(1),
        };
        if widest > slots {
            warn!(
                "Execution '{}' has a parallel group of {} but only {} slot(s)",
                execution_id, widest, slots
            );
        }

        let token = self.register(execution_id);
        self.state.lock().scheduled_total += 1;

        info!(
            "Scheduled execution '{}': {} steps, concurrency {}, strategy {}",
            execution_id,
            steps.len(),
            concurrency,
            strategy
        );

        Ok(ScheduledExecution {
            execution_id: execution_id.to_string(),
            steps,
            concurrency,
            strategy,
            token,
        })
    }

    /// Requests cooperative cancellation.
    ///
    /// Returns false for unknown executions and ones already cancelled.
    pub fn cancel(&self, execution_id: &str) -> bool {
        let mut state = self.state.lock();
        let Some(token) = state.tokens.get(execution_id) else {
            return false;
        };
        if token.is_cancelled() {
            return false;
        }
        token.cancel();
        state.cancelled_total += 1;
        info!("Cancellation requested for execution '{}'", execution_id);
        true
    }

    pub fn is_cancelled(&self, execution_id: &str) -> bool {
        self.state
            .lock()
            .tokens
            .get(execution_id)
            .map(|t| t.is_cancelled())
            .unwrap_or(false)
    }

    /// Forgets a finished execution.
    pub fn release(&self, execution_id: &str) {
        if self.state.lock().tokens.remove(execution_id).is_some() {
            debug!("Released scheduler entry for '{}'", execution_id);
        }
    }

    pub fn registered(&self) -> usize {
        self.state.lock().tokens.len()
    }

    /// Healthy while registrations stay below capacity.
    pub fn is_healthy(&self) -> bool {
        self.registered() < self.capacity
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.state.lock();
        SchedulerStats {
            registered: state.tokens.len(),
            capacity: self.capacity,
            scheduled_total: state.scheduled_total,
            rejected_total: state.rejected_total,
            cancelled_total: state.cancelled_total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::optimizer::{composite, OptimizerConfig};
    use crate::resources::AllocationStrategy;
    use crate::workflow::StepResult;
    use chrono::Utc;

    fn step(name: &str) -> Step {
        Step::from_fn(name, |_| StepResult::success())
    }

    fn allocation(slots: usize) -> Allocation {
        Allocation {
            execution_id: "exec-1".to_string(),
            memory_mb: 256,
            cpu: 1.0,
            slots,
            strategy: AllocationStrategy::Fifo,
            granted_at: Utc::now(),
        }
    }

    #[test]
    fn test_schedule_sequential() {
        let scheduler = ExecutionScheduler::new(8);
        let steps = vec![step("a"), step("b").depends_on("a")];

        let plan = scheduler
            .schedule("exec-1", steps, &allocation(4), ExecutionStrategy::Basic)
            .unwrap();
        assert_eq!(plan.step_names(), vec!["a", "b"]);
        assert_eq!(plan.concurrency, 1);
        assert!(!plan.is_cancelled());
    }

    #[test]
    fn test_concurrency_bounded_by_slots() {
        let scheduler = ExecutionScheduler::new(8);
        let group = composite::parallel(vec![step("x"), step("y"), step("z")], &OptimizerConfig::default());

        let plan = scheduler
            .schedule("exec-1", vec![group.clone()], &allocation(2), ExecutionStrategy::Basic)
            .unwrap();
        assert_eq!(plan.concurrency, 2);

        let plan = scheduler
            .schedule("exec-2", vec![group.clone()], &allocation(8), ExecutionStrategy::Basic)
            .unwrap();
        assert_eq!(plan.concurrency, 3);

        let plan = scheduler
            .schedule("exec-3", vec![group], &allocation(8), ExecutionStrategy::Simple)
            .unwrap();
        assert_eq!(plan.concurrency, 1);
    }

    #[test]
    fn test_schedule_rejects_bad_order() {
        let scheduler = ExecutionScheduler::new(8);
        let steps = vec![step("b").depends_on("a"), step("a")];
        let err = scheduler
            .schedule("exec-1", steps, &allocation(1), ExecutionStrategy::Basic)
            .unwrap_err();
        assert!(matches!(err, EngineError::DependencyViolation { .. }));

        let cyclic = vec![step("a").depends_on("b"), step("b").depends_on("a")];
        let err = scheduler
            .schedule("exec-2", cyclic, &allocation(1), ExecutionStrategy::Basic)
            .unwrap_err();
        assert!(matches!(err, EngineError::DependencyCycle { .. }));
        assert_eq!(scheduler.stats().rejected_total, 2);
    }

    #[test]
    fn test_cancel() {
        let scheduler = ExecutionScheduler::new(8);
        assert!(!scheduler.cancel("unknown"));

        let token = scheduler.register("exec-1");
        assert!(scheduler.cancel("exec-1"));
        assert!(token.is_cancelled());
        assert!(scheduler.is_cancelled("exec-1"));
        assert!(!scheduler.cancel("exec-1"));

        let plan = scheduler
            .schedule("exec-1", vec![step("a")], &allocation(1), ExecutionStrategy::Basic)
            .unwrap();
        assert!(plan.is_cancelled());

        scheduler.release("exec-1");
        assert_eq!(scheduler.registered(), 0);
        assert!(!scheduler.is_cancelled("exec-1"));
    }

    #[test]
    fn test_health_tracks_capacity() {
        let scheduler = ExecutionScheduler::new(2);
        scheduler.register("a");
        assert!(scheduler.is_healthy());
        scheduler.register("b");
        assert!(!scheduler.is_healthy());
        scheduler.release("a");
        assert!(scheduler.is_healthy());
    }
}
