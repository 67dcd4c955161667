//! Resource Management Module
//!
//! Tracks a finite budget of memory, CPU and concurrency slots shared by all
//! in-flight executions.
//!
//! # Components
//!
//! - [`ResourceManager`]: the allocation ledger, waiting list and release path
//! - [`ResourceAllocator`]: strategy logic deciding how much to grant
//! - [`AllocationGuard`]: scoped allocation released on drop

pub mod allocator;
pub mod manager;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::execution::queue::Priority;

pub use allocator::ResourceAllocator;
pub use manager::{AllocationGuard, ResourceManager, ResourceUtilization};

/// Ceilings and floors of the shared resource budget.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ResourceLimits {
    /// Total memory shared by all executions
    pub max_memory_mb: u64,
    /// Total CPU cores shared by all executions
    pub max_cpu: f64,
    /// Total concurrency slots
    pub max_slots: usize,
    /// Smallest memory grant
    pub min_memory_mb: u64,
    /// Smallest CPU grant
    pub min_cpu: f64,
    /// Upper bound applied to predicted memory needs before requesting
    pub max_memory_per_execution_mb: u64,
    /// How often a parked request re-checks availability
    pub poll_interval_ms: u64,
    /// Usage samples kept per requirement bucket for predictive allocation
    pub history_size: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        let cores = num_cpus::get().max(1);
        Self {
            max_memory_mb: 4096,
            max_cpu: cores as f64,
            max_slots: cores * 2,
            min_memory_mb: 32,
            min_cpu: 0.1,
            max_memory_per_execution_mb: 1024,
            poll_interval_ms: 50,
            history_size: 50,
        }
    }
}

/// How an allocation request is sized against current availability.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStrategy {
    /// Grant exactly the requirement if it fits
    #[default]
    Fifo,
    /// Scale the requirement by the request priority first
    Priority,
    /// Grant the larger of an equal share of what is left and the requirement
    FairShare,
    /// Size the grant from usage observed for similar past requirements
    Predictive,
}

impl AllocationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fifo => "fifo",
            Self::Priority => "priority",
            Self::FairShare => "fair_share",
            Self::Predictive => "predictive",
        }
    }
}

impl fmt::Display for AllocationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AllocationStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "fifo" => Ok(Self::Fifo),
            "priority" => Ok(Self::Priority),
            "fair_share" | "fairshare" => Ok(Self::FairShare),
            "predictive" => Ok(Self::Predictive),
            other => Err(format!("unknown resource strategy: '{}'", other)),
        }
    }
}

/// What an execution asks for.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct ResourceRequest {
    pub memory_mb: u64,
    pub cpu: f64,
    pub slots: usize,
    #[serde(default)]
    pub priority: Priority,
}

impl ResourceRequest {
    pub fn new(memory_mb: u64, cpu: f64, slots: usize) -> Self {
        Self {
            memory_mb,
            cpu,
            slots,
            priority: Priority::Normal,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub(crate) fn capacity(&self) -> Capacity {
        Capacity {
            memory_mb: self.memory_mb,
            cpu: self.cpu,
            slots: self.slots,
        }
    }
}

/// Resources granted to one execution. Released exactly once.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Allocation {
    pub execution_id: String,
    pub memory_mb: u64,
    pub cpu: f64,
    pub slots: usize,
    pub strategy: AllocationStrategy,
    pub granted_at: DateTime<Utc>,
}

impl Allocation {
    pub(crate) fn capacity(&self) -> Capacity {
        Capacity {
            memory_mb: self.memory_mb,
            cpu: self.cpu,
            slots: self.slots,
        }
    }
}

/// A point in the three resource dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub(crate) struct Capacity {
    pub memory_mb: u64,
    pub cpu: f64,
    pub slots: usize,
}

/// Tolerance for floating point CPU sums.
const CPU_EPSILON: f64 = 1e-9;

impl Capacity {
    /// True when `other` fits within `self` in every dimension.
    pub fn fits(&self, other: &Capacity) -> bool {
        other.memory_mb <= self.memory_mb
            && other.cpu <= self.cpu + CPU_EPSILON
            && other.slots <= self.slots
    }

    pub fn saturating_sub(&self, other: &Capacity) -> Capacity {
        Capacity {
            memory_mb: self.memory_mb.saturating_sub(other.memory_mb),
            cpu: (self.cpu - other.cpu).max(0.0),
            slots: self.slots.saturating_sub(other.slots),
        }
    }

    pub fn add(&self, other: &Capacity) -> Capacity {
        Capacity {
            memory_mb: self.memory_mb + other.memory_mb,
            cpu: self.cpu + other.cpu,
            slots: self.slots + other.slots,
        }
    }

    /// Per-dimension minimum.
    pub fn min(&self, other: &Capacity) -> Capacity {
        Capacity {
            memory_mb: self.memory_mb.min(other.memory_mb),
            cpu: self.cpu.min(other.cpu),
            slots: self.slots.min(other.slots),
        }
    }

    /// Per-dimension maximum.
    pub fn max(&self, other: &Capacity) -> Capacity {
        Capacity {
            memory_mb: self.memory_mb.max(other.memory_mb),
            cpu: self.cpu.max(other.cpu),
            slots: self.slots.max(other.slots),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = ResourceLimits::default();
        assert_eq!(limits.max_memory_mb, 4096);
        assert_eq!(limits.min_memory_mb, 32);
        assert!(limits.max_cpu >= 1.0);
        assert_eq!(limits.max_slots, num_cpus::get().max(1) * 2);
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!("fifo".parse::<AllocationStrategy>().unwrap(), AllocationStrategy::Fifo);
        assert_eq!(
            "fair-share".parse::<AllocationStrategy>().unwrap(),
            AllocationStrategy::FairShare
        );
        assert_eq!(
            "Predictive".parse::<AllocationStrategy>().unwrap(),
            AllocationStrategy::Predictive
        );
        assert!("random".parse::<AllocationStrategy>().is_err());
    }

    #[test]
    fn test_capacity_arithmetic() {
        let total = Capacity { memory_mb: 1024, cpu: 2.0, slots: 4 };
        let used = Capacity { memory_mb: 1000, cpu: 0.5, slots: 1 };

        let left = total.saturating_sub(&used);
        assert_eq!(left.memory_mb, 24);
        assert!(left.fits(&Capacity { memory_mb: 24, cpu: 1.5, slots: 3 }));
        assert!(!left.fits(&Capacity { memory_mb: 25, cpu: 0.1, slots: 1 }));

        let over = used.saturating_sub(&total);
        assert_eq!(over, Capacity { memory_mb: 0, cpu: 0.0, slots: 0 });
    }
}
