//! Allocation Strategies
//!
//! Decides how much of the remaining capacity an execution receives.
//! The allocator never touches the ledger; [`super::ResourceManager`] hands
//! it a snapshot of what is available and commits whatever it proposes.

use std::collections::{HashMap, VecDeque};

use log::debug;

use super::{AllocationStrategy, Capacity, ResourceLimits, ResourceRequest};
use crate::error::{EngineError, Result};
use crate::execution::queue::Priority;

/// Memory bucket width for grouping similar requirements.
const MEMORY_BUCKET_MB: u64 = 128;

/// Headroom added on top of observed usage by the predictive strategy.
const PREDICTIVE_MARGIN: f64 = 1.1;

#[derive(Debug, Clone, Copy)]
struct UsageSample {
    memory_mb: u64,
    cpu: f64,
}

/// Sizes allocation grants according to an [`AllocationStrategy`].
#[derive(Debug)]
pub struct ResourceAllocator {
    limits: ResourceLimits,
    history: HashMap<(u64, u64), VecDeque<UsageSample>>,
}

impl ResourceAllocator {
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            limits,
            history: HashMap::new(),
        }
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub(crate) fn ceiling(&self) -> Capacity {
        Capacity {
            memory_mb: self.limits.max_memory_mb,
            cpu: self.limits.max_cpu,
            slots: self.limits.max_slots,
        }
    }

    fn floor(&self) -> Capacity {
        Capacity {
            memory_mb: self.limits.min_memory_mb,
            cpu: self.limits.min_cpu,
            slots: 1,
        }
    }

    /// Multiplier applied to a requirement by the priority strategy.
    pub fn priority_multiplier(priority: Priority) -> f64 {
        match priority {
            Priority::High => 1.5,
            Priority::Normal => 1.0,
            Priority::Low => 0.75,
        }
    }

    /// Raises a request to the configured floors and rejects it when it
    /// exceeds a ceiling, since such a request could never be granted.
    pub(crate) fn normalize(&self, execution_id: &str, request: &ResourceRequest) -> Result<Capacity> {
        let wanted = request.capacity().max(&self.floor());
        let ceiling = self.ceiling();

        if !ceiling.fits(&wanted) {
            return Err(EngineError::ResourceUnavailable {
                execution_id: execution_id.to_string(),
                reason: format!(
                    "requested {} MB / {:.2} cpu / {} slot(s) exceeds the ceiling of {} MB / {:.2} cpu / {} slot(s)",
                    wanted.memory_mb,
                    wanted.cpu,
                    wanted.slots,
                    ceiling.memory_mb,
                    ceiling.cpu,
                    ceiling.slots
                ),
            });
        }
        Ok(wanted)
    }

    /// Proposes a grant for a normalized requirement, or `None` when nothing
    /// suitable fits into `available` right now.
    pub(crate) fn propose(
        &self,
        wanted: &Capacity,
        priority: Priority,
        strategy: AllocationStrategy,
        available: &Capacity,
        active_allocations: usize,
    ) -> Option<Capacity> {
        let proposal = match strategy {
            AllocationStrategy::Fifo => *wanted,
            AllocationStrategy::Priority => self.scaled(wanted, Self::priority_multiplier(priority)),
            AllocationStrategy::FairShare => {
                if !available.fits(wanted) {
                    return None;
                }
                let divisor = (active_allocations + 1) as f64;
                let share = Capacity {
                    memory_mb: (available.memory_mb as f64 / divisor).floor() as u64,
                    cpu: available.cpu / divisor,
                    slots: wanted.slots,
                };
                share.max(wanted)
            }
            AllocationStrategy::Predictive => match self.predicted(wanted) {
                Some(predicted) if available.fits(&predicted) => predicted,
                _ => *wanted,
            },
        };

        if available.fits(&proposal) {
            debug!(
                "Proposed {} MB / {:.2} cpu / {} slot(s) using {} strategy",
                proposal.memory_mb, proposal.cpu, proposal.slots, strategy
            );
            Some(proposal)
        } else {
            None
        }
    }

    /// Scales memory and cpu, keeping the result between floors and ceilings.
    fn scaled(&self, wanted: &Capacity, factor: f64) -> Capacity {
        let scaled = Capacity {
            memory_mb: (wanted.memory_mb as f64 * factor).round() as u64,
            cpu: wanted.cpu * factor,
            slots: wanted.slots,
        };
        scaled.max(&self.floor()).min(&self.ceiling())
    }

    fn bucket(wanted: &Capacity) -> (u64, u64) {
        (
            wanted.memory_mb / MEMORY_BUCKET_MB,
            (wanted.cpu * 2.0).round() as u64,
        )
    }

    /// Grant suggested by usage observed for similar requirements.
    pub(crate) fn predicted(&self, wanted: &Capacity) -> Option<Capacity> {
        let samples = self.history.get(&Self::bucket(wanted))?;
        if samples.is_empty() {
            return None;
        }

        let n = samples.len() as f64;
        let memory = samples.iter().map(|s| s.memory_mb as f64).sum::<f64>() / n;
        let cpu = samples.iter().map(|s| s.cpu).sum::<f64>() / n;

        let predicted = Capacity {
            memory_mb: (memory * PREDICTIVE_MARGIN).round() as u64,
            cpu: cpu * PREDICTIVE_MARGIN,
            slots: wanted.slots,
        };
        Some(predicted.max(&self.floor()).min(&self.ceiling()))
    }

    /// Records what an execution actually used against what it asked for.
    pub(crate) fn record_usage(&mut self, wanted: &Capacity, memory_mb: u64, cpu: f64) {
        let samples = self.history.entry(Self::bucket(wanted)).or_default();
        samples.push_back(UsageSample { memory_mb, cpu });
        while samples.len() > self.limits.history_size.max(1) {
            samples.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> ResourceLimits {
        ResourceLimits {
            max_memory_mb: 1024,
            max_cpu: 4.0,
            max_slots: 4,
            min_memory_mb: 32,
            min_cpu: 0.1,
            max_memory_per_execution_mb: 1024,
            poll_interval_ms: 10,
            history_size: 3,
        }
    }

    fn cap(memory_mb: u64, cpu: f64, slots: usize) -> Capacity {
        Capacity { memory_mb, cpu, slots }
    }

    #[test]
    fn test_normalize_clamps_floors() {
        let allocator = ResourceAllocator::new(limits());
        let wanted = allocator
            .normalize("e", &ResourceRequest::new(1, 0.0, 0))
            .unwrap();
        assert_eq!(wanted, cap(32, 0.1, 1));
    }

    #[test]
    fn test_normalize_rejects_above_ceiling() {
        let allocator = ResourceAllocator::new(limits());
        let err = allocator
            .normalize("e", &ResourceRequest::new(2000, 1.0, 1))
            .unwrap_err();
        assert!(matches!(err, EngineError::ResourceUnavailable { .. }));
    }

    #[test]
    fn test_fifo() {
        let allocator = ResourceAllocator::new(limits());
        let wanted = cap(256, 1.0, 1);

        let grant = allocator.propose(&wanted, Priority::Normal, AllocationStrategy::Fifo, &cap(512, 2.0, 2), 0);
        assert_eq!(grant, Some(wanted));

        let none = allocator.propose(&wanted, Priority::Normal, AllocationStrategy::Fifo, &cap(128, 2.0, 2), 0);
        assert!(none.is_none());
    }

    #[test]
    fn test_priority_scaling() {
        let allocator = ResourceAllocator::new(limits());
        let wanted = cap(200, 1.0, 1);
        let available = cap(1024, 4.0, 4);

        let high = allocator
            .propose(&wanted, Priority::High, AllocationStrategy::Priority, &available, 0)
            .unwrap();
        assert_eq!(high.memory_mb, 300);
        assert!((high.cpu - 1.5).abs() < 1e-9);

        let low = allocator
            .propose(&wanted, Priority::Low, AllocationStrategy::Priority, &available, 0)
            .unwrap();
        assert_eq!(low.memory_mb, 150);

        // scaled request no longer fits
        let tight = cap(250, 4.0, 4);
        assert!(allocator
            .propose(&wanted, Priority::High, AllocationStrategy::Priority, &tight, 0)
            .is_none());
    }

    #[test]
    fn test_fair_share() {
        let allocator = ResourceAllocator::new(limits());
        let available = cap(900, 3.0, 3);

        // share of 900 / 3 = 300 beats the 100 MB requirement
        let grant = allocator
            .propose(&cap(100, 0.5, 1), Priority::Normal, AllocationStrategy::FairShare, &available, 2)
            .unwrap();
        assert_eq!(grant.memory_mb, 300);
        assert!((grant.cpu - 1.0).abs() < 1e-9);

        // the requirement wins when it exceeds the share
        let grant = allocator
            .propose(&cap(500, 0.5, 1), Priority::Normal, AllocationStrategy::FairShare, &available, 2)
            .unwrap();
        assert_eq!(grant.memory_mb, 500);

        assert!(allocator
            .propose(&cap(950, 0.5, 1), Priority::Normal, AllocationStrategy::FairShare, &available, 2)
            .is_none());
    }

    #[test]
    fn test_predictive_uses_history() {
        let mut allocator = ResourceAllocator::new(limits());
        let wanted = cap(512, 1.0, 1);
        let available = cap(1024, 4.0, 4);

        let cold = allocator
            .propose(&wanted, Priority::Normal, AllocationStrategy::Predictive, &available, 0)
            .unwrap();
        assert_eq!(cold, wanted);

        allocator.record_usage(&wanted, 100, 0.5);
        allocator.record_usage(&wanted, 300, 0.5);

        let warm = allocator
            .propose(&wanted, Priority::Normal, AllocationStrategy::Predictive, &available, 0)
            .unwrap();
        assert_eq!(warm.memory_mb, 220);
        assert!((warm.cpu - 0.55).abs() < 1e-9);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut allocator = ResourceAllocator::new(limits());
        let wanted = cap(64, 0.5, 1);
        for i in 0..10 {
            allocator.record_usage(&wanted, 40 + i, 0.2);
        }
        let samples = allocator.history.get(&ResourceAllocator::bucket(&wanted)).unwrap();
        assert_eq!(samples.len(), 3);
    }
}
