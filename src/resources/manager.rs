//! Resource Ledger
//!
//! [`ResourceManager`] owns the set of active allocations. Available capacity
//! is always derived as `ceiling - sum(active)` under the ledger lock, so an
//! allocation can never push a dimension below zero and a forgotten update
//! cannot make the numbers drift.
//!
//! Requests that cannot be served immediately are parked in a waiting list
//! ordered by priority, then arrival. Only the head of the list may take
//! capacity; it re-checks whenever an allocation is released and at a fixed
//! poll interval until its timeout elapses.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;

use super::allocator::ResourceAllocator;
use super::{Allocation, AllocationStrategy, Capacity, ResourceLimits, ResourceRequest};
use crate::error::{EngineError, Result};
use crate::execution::queue::Priority;

type WaitKey = (Reverse<Priority>, u64);

struct ActiveAllocation {
    allocation: Allocation,
    wanted: Capacity,
    peak_memory_mb: Option<u64>,
    peak_cpu: Option<f64>,
}

struct Ledger {
    allocator: ResourceAllocator,
    active: HashMap<String, ActiveAllocation>,
    waiting: BTreeMap<WaitKey, String>,
    next_seq: u64,
    granted_total: u64,
    released_total: u64,
    timeouts: u64,
    rejected: u64,
}

impl Ledger {
    fn allocated(&self) -> Capacity {
        self.active
            .values()
            .fold(Capacity::default(), |acc, a| acc.add(&a.allocation.capacity()))
    }

    fn available(&self) -> Capacity {
        self.allocator.ceiling().saturating_sub(&self.allocated())
    }

    fn try_grant(
        &mut self,
        execution_id: &str,
        wanted: &Capacity,
        priority: Priority,
        strategy: AllocationStrategy,
    ) -> Option<Allocation> {
        let available = self.available();
        let grant = self
            .allocator
            .propose(wanted, priority, strategy, &available, self.active.len())?;

        let allocation = Allocation {
            execution_id: execution_id.to_string(),
            memory_mb: grant.memory_mb,
            cpu: grant.cpu,
            slots: grant.slots,
            strategy,
            granted_at: Utc::now(),
        };
        self.active.insert(
            execution_id.to_string(),
            ActiveAllocation {
                allocation: allocation.clone(),
                wanted: *wanted,
                peak_memory_mb: None,
                peak_cpu: None,
            },
        );
        self.granted_total += 1;
        debug_assert!(self.allocator.ceiling().fits(&self.allocated()));
        Some(allocation)
    }
}

/// Snapshot of the shared resource budget.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct ResourceUtilization {
    pub memory_allocated_mb: u64,
    pub memory_total_mb: u64,
    pub cpu_allocated: f64,
    pub cpu_total: f64,
    pub slots_allocated: usize,
    pub slots_total: usize,
    pub active_allocations: usize,
    pub waiting_requests: usize,
    pub granted_total: u64,
    pub released_total: u64,
    pub timeouts: u64,
    pub rejected: u64,
}

impl ResourceUtilization {
    pub fn memory_percent(&self) -> f64 {
        percent(self.memory_allocated_mb as f64, self.memory_total_mb as f64)
    }

    pub fn cpu_percent(&self) -> f64 {
        percent(self.cpu_allocated, self.cpu_total)
    }

    pub fn slots_percent(&self) -> f64 {
        percent(self.slots_allocated as f64, self.slots_total as f64)
    }
}

fn percent(used: f64, total: f64) -> f64 {
    if total <= 0.0 {
        0.0
    } else {
        used / total * 100.0
    }
}

/// Grants and revokes per-execution resource allocations.
pub struct ResourceManager {
    ledger: Mutex<Ledger>,
    released: Notify,
    poll_interval: Duration,
}

/// Removes a parked request from the waiting list however the wait ends.
struct WaitTicket<'a> {
    manager: &'a ResourceManager,
    key: WaitKey,
}

impl Drop for WaitTicket<'_> {
    fn drop(&mut self) {
        let removed = self.manager.ledger.lock().waiting.remove(&self.key).is_some();
        if removed {
            // let the next waiter become head
            self.manager.released.notify_waiters();
        }
    }
}

impl ResourceManager {
    pub fn new(limits: ResourceLimits) -> Self {
        let poll_interval = Duration::from_millis(limits.poll_interval_ms.max(1));
        Self {
            ledger: Mutex::new(Ledger {
                allocator: ResourceAllocator::new(limits),
                active: HashMap::new(),
                waiting: BTreeMap::new(),
                next_seq: 0,
                granted_total: 0,
                released_total: 0,
                timeouts: 0,
                rejected: 0,
            }),
            released: Notify::new(),
            poll_interval,
        }
    }

    pub fn limits(&self) -> ResourceLimits {
        self.ledger.lock().allocator.limits().clone()
    }

    /// Requests an allocation for `execution_id`.
    ///
    /// Requirements below the floors are raised to them; requirements above
    /// a ceiling fail immediately with [`EngineError::ResourceUnavailable`].
    /// Otherwise the request waits up to `timeout` and then fails with
    /// [`EngineError::AllocationTimeout`]. Nothing is granted partially.
    pub async fn request_allocation(
        &self,
        execution_id: &str,
        request: ResourceRequest,
        strategy: AllocationStrategy,
        timeout: Duration,
    ) -> Result<Allocation> {
        let started = Instant::now();

        let (key, wanted) = {
            let mut ledger = self.ledger.lock();
            if ledger.active.contains_key(execution_id) {
                ledger.rejected += 1;
                return Err(EngineError::ResourceUnavailable {
                    execution_id: execution_id.to_string(),
                    reason: "execution already holds an allocation".to_string(),
                });
            }

            let wanted = match ledger.allocator.normalize(execution_id, &request) {
                Ok(wanted) => wanted,
                Err(e) => {
                    ledger.rejected += 1;
                    warn!("{}", e);
                    return Err(e);
                }
            };

            if ledger.waiting.is_empty() {
                if let Some(allocation) =
                    ledger.try_grant(execution_id, &wanted, request.priority, strategy)
                {
                    info!(
                        "Allocated {} MB / {:.2} cpu / {} slot(s) to '{}'",
                        allocation.memory_mb, allocation.cpu, allocation.slots, execution_id
                    );
                    return Ok(allocation);
                }
            }

            let key = (Reverse(request.priority), ledger.next_seq);
            ledger.next_seq += 1;
            ledger.waiting.insert(key, execution_id.to_string());
            debug!(
                "Parked allocation request for '{}' ({} waiting)",
                execution_id,
                ledger.waiting.len()
            );
            (key, wanted)
        };
        let _ticket = WaitTicket { manager: self, key };

        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut ledger = self.ledger.lock();
                let is_head = ledger.waiting.keys().next() == Some(&key);
                if is_head {
                    if let Some(allocation) =
                        ledger.try_grant(execution_id, &wanted, request.priority, strategy)
                    {
                        ledger.waiting.remove(&key);
                        drop(ledger);
                        self.released.notify_waiters();
                        info!(
                            "Allocated {} MB / {:.2} cpu / {} slot(s) to '{}' after {:?}",
                            allocation.memory_mb,
                            allocation.cpu,
                            allocation.slots,
                            execution_id,
                            started.elapsed()
                        );
                        return Ok(allocation);
                    }
                }
            }

            let waited = started.elapsed();
            if waited >= timeout {
                self.ledger.lock().timeouts += 1;
                warn!(
                    "Allocation for '{}' timed out after {:?}",
                    execution_id, waited
                );
                return Err(EngineError::AllocationTimeout {
                    execution_id: execution_id.to_string(),
                    waited,
                });
            }

            let wait = self.poll_interval.min(timeout - waited);
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    /// Like [`ResourceManager::request_allocation`], but returns a guard
    /// that releases the allocation when dropped.
    pub async fn acquire(
        self: &Arc<Self>,
        execution_id: &str,
        request: ResourceRequest,
        strategy: AllocationStrategy,
        timeout: Duration,
    ) -> Result<AllocationGuard> {
        let allocation = self
            .request_allocation(execution_id, request, strategy, timeout)
            .await?;
        Ok(AllocationGuard {
            manager: Arc::clone(self),
            allocation,
        })
    }

    /// Releases the allocation held by `execution_id`.
    ///
    /// Returns false when there is nothing to release, which makes a second
    /// call for the same id a no-op.
    pub fn release(&self, execution_id: &str) -> bool {
        let released = {
            let mut ledger = self.ledger.lock();
            match ledger.active.remove(execution_id) {
                Some(active) => {
                    let memory = active.peak_memory_mb.unwrap_or(active.allocation.memory_mb);
                    let cpu = active.peak_cpu.unwrap_or(active.allocation.cpu);
                    ledger.allocator.record_usage(&active.wanted, memory, cpu);
                    ledger.released_total += 1;
                    true
                }
                None => false,
            }
        };

        if released {
            debug!("Released allocation of '{}'", execution_id);
            self.released.notify_waiters();
        } else {
            debug!("No allocation to release for '{}'", execution_id);
        }
        released
    }

    /// Records observed usage of an active allocation; peaks are kept.
    pub fn record_usage(&self, execution_id: &str, memory_mb: u64, cpu: f64) -> bool {
        let mut ledger = self.ledger.lock();
        match ledger.active.get_mut(execution_id) {
            Some(active) => {
                active.peak_memory_mb = Some(active.peak_memory_mb.unwrap_or(0).max(memory_mb));
                active.peak_cpu = Some(active.peak_cpu.unwrap_or(0.0).max(cpu));
                true
            }
            None => false,
        }
    }

    pub fn allocation(&self, execution_id: &str) -> Option<Allocation> {
        self.ledger
            .lock()
            .active
            .get(execution_id)
            .map(|a| a.allocation.clone())
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.ledger.lock().active.keys().cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        self.ledger.lock().active.len()
    }

    pub fn waiting_count(&self) -> usize {
        self.ledger.lock().waiting.len()
    }

    pub fn utilization(&self) -> ResourceUtilization {
        let ledger = self.ledger.lock();
        let allocated = ledger.allocated();
        let ceiling = ledger.allocator.ceiling();
        ResourceUtilization {
            memory_allocated_mb: allocated.memory_mb,
            memory_total_mb: ceiling.memory_mb,
            cpu_allocated: allocated.cpu,
            cpu_total: ceiling.cpu,
            slots_allocated: allocated.slots,
            slots_total: ceiling.slots,
            active_allocations: ledger.active.len(),
            waiting_requests: ledger.waiting.len(),
            granted_total: ledger.granted_total,
            released_total: ledger.released_total,
            timeouts: ledger.timeouts,
            rejected: ledger.rejected,
        }
    }
}

/// An allocation that is released when the guard goes out of scope.
pub struct AllocationGuard {
    manager: Arc<ResourceManager>,
    allocation: Allocation,
}

impl AllocationGuard {
    pub fn allocation(&self) -> &Allocation {
        &self.allocation
    }

    pub fn execution_id(&self) -> &str {
        &self.allocation.execution_id
    }
}

impl Drop for AllocationGuard {
    fn drop(&mut self) {
        self.manager.release(&self.allocation.execution_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;

    fn limits(max_memory_mb: u64) -> ResourceLimits {
        ResourceLimits {
            max_memory_mb,
            max_cpu: 4.0,
            max_slots: 8,
            min_memory_mb: 32,
            min_cpu: 0.1,
            max_memory_per_execution_mb: max_memory_mb,
            poll_interval_ms: 5,
            history_size: 10,
        }
    }

    const SHORT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_allocate_and_release() {
        let manager = ResourceManager::new(limits(1024));
        let allocation = manager
            .request_allocation("e1", ResourceRequest::new(256, 1.0, 1), AllocationStrategy::Fifo, SHORT)
            .await
            .unwrap();
        assert_eq!(allocation.memory_mb, 256);

        let util = manager.utilization();
        assert_eq!(util.memory_allocated_mb, 256);
        assert_eq!(util.active_allocations, 1);

        assert!(manager.release("e1"));
        assert!(!manager.release("e1"));
        let util = manager.utilization();
        assert_eq!(util.memory_allocated_mb, 0);
        assert_eq!(util.released_total, 1);
    }

    #[tokio::test]
    async fn test_request_above_ceiling_is_rejected() {
        let manager = ResourceManager::new(limits(1024));
        let err = manager
            .request_allocation("big", ResourceRequest::new(2000, 1.0, 1), AllocationStrategy::Fifo, SHORT)
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::ResourceUnavailable { .. }));
        assert_eq!(manager.utilization().memory_allocated_mb, 0);
        assert!(manager.allocation("big").is_none());
    }

    #[tokio::test]
    async fn test_waiting_request_times_out() {
        let manager = ResourceManager::new(limits(1024));
        manager
            .request_allocation("hog", ResourceRequest::new(1000, 1.0, 1), AllocationStrategy::Fifo, SHORT)
            .await
            .unwrap();

        let err = manager
            .request_allocation("late", ResourceRequest::new(100, 1.0, 1), AllocationStrategy::Fifo, SHORT)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AllocationTimeout { .. }));
        assert_eq!(manager.waiting_count(), 0);
        assert_eq!(manager.utilization().timeouts, 1);
    }

    #[tokio::test]
    async fn test_waiting_request_granted_after_release() {
        let manager = Arc::new(ResourceManager::new(limits(1024)));
        manager
            .request_allocation("first", ResourceRequest::new(800, 1.0, 1), AllocationStrategy::Fifo, SHORT)
            .await
            .unwrap();

        let waiter = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .request_allocation(
                        "second",
                        ResourceRequest::new(800, 1.0, 1),
                        AllocationStrategy::Fifo,
                        Duration::from_secs(2),
                    )
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.waiting_count(), 1);
        manager.release("first");

        let allocation = waiter.await.unwrap().unwrap();
        assert_eq!(allocation.execution_id, "second");
        assert_eq!(manager.waiting_count(), 0);
    }

    #[tokio::test]
    async fn test_high_priority_waiter_served_first() {
        let manager = Arc::new(ResourceManager::new(limits(1024)));
        manager
            .request_allocation("hog", ResourceRequest::new(1024, 1.0, 1), AllocationStrategy::Fifo, SHORT)
            .await
            .unwrap();

        let spawn_waiter = |id: &'static str, priority: Priority| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .request_allocation(
                        id,
                        ResourceRequest::new(1024, 1.0, 1).with_priority(priority),
                        AllocationStrategy::Fifo,
                        Duration::from_millis(300),
                    )
                    .await
            })
        };

        let low = spawn_waiter("low", Priority::Low);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let high = spawn_waiter("high", Priority::High);
        tokio::time::sleep(Duration::from_millis(10)).await;

        manager.release("hog");
        assert!(high.await.unwrap().is_ok());
        assert!(matches!(
            low.await.unwrap(),
            Err(EngineError::AllocationTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_guard_releases_on_drop() {
        let manager = Arc::new(ResourceManager::new(limits(1024)));
        {
            let guard = manager
                .acquire("scoped", ResourceRequest::new(128, 0.5, 1), AllocationStrategy::Fifo, SHORT)
                .await
                .unwrap();
            assert_eq!(guard.execution_id(), "scoped");
            assert_eq!(manager.active_count(), 1);
        }
        assert_eq!(manager.active_count(), 0);
        // explicit release after the guard is a no-op
        assert!(!manager.release("scoped"));
    }

    #[tokio::test]
    async fn test_duplicate_allocation_rejected() {
        let manager = ResourceManager::new(limits(1024));
        let request = ResourceRequest::new(64, 0.5, 1);
        manager
            .request_allocation("dup", request, AllocationStrategy::Fifo, SHORT)
            .await
            .unwrap();
        assert!(manager
            .request_allocation("dup", request, AllocationStrategy::Fifo, SHORT)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_conservation_under_concurrency() {
        let manager = Arc::new(ResourceManager::new(limits(1024)));
        let ceiling = manager.limits();

        let tasks = (0..20).map(|i| {
            let manager = Arc::clone(&manager);
            let ceiling = ceiling.clone();
            async move {
                let id = format!("exec-{}", i);
                let strategy = match i % 4 {
                    0 => AllocationStrategy::Fifo,
                    1 => AllocationStrategy::Priority,
                    2 => AllocationStrategy::FairShare,
                    _ => AllocationStrategy::Predictive,
                };
                let request = ResourceRequest::new(100 + (i as u64 * 37) % 300, 0.5, 1);
                if manager
                    .request_allocation(&id, request, strategy, Duration::from_secs(2))
                    .await
                    .is_ok()
                {
                    let util = manager.utilization();
                    assert!(util.memory_allocated_mb <= ceiling.max_memory_mb);
                    assert!(util.cpu_allocated <= ceiling.max_cpu + 1e-9);
                    assert!(util.slots_allocated <= ceiling.max_slots);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    assert!(manager.release(&id));
                }
            }
        });
        join_all(tasks).await;

        let util = manager.utilization();
        assert_eq!(util.memory_allocated_mb, 0);
        assert_eq!(util.slots_allocated, 0);
        assert_eq!(util.active_allocations, 0);
        assert_eq!(util.waiting_requests, 0);
    }

    #[tokio::test]
    async fn test_record_usage_feeds_predictive_history() {
        let manager = ResourceManager::new(limits(1024));
        let request = ResourceRequest::new(512, 1.0, 1);

        manager
            .request_allocation("a", request, AllocationStrategy::Fifo, SHORT)
            .await
            .unwrap();
        assert!(manager.record_usage("a", 90, 0.2));
        assert!(manager.record_usage("a", 110, 0.3));
        manager.release("a");

        let allocation = manager
            .request_allocation("b", request, AllocationStrategy::Predictive, SHORT)
            .await
            .unwrap();
        assert_eq!(allocation.memory_mb, 121);
        assert!(!manager.record_usage("missing", 1, 0.1));
    }
}
