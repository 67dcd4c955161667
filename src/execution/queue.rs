//! Execution Queue
//!
//! Ordered admission buffer for execution requests. Requests are served by
//! priority (high before normal before low) and FIFO within a priority tier.
//! Requests handed out by [`ExecutionQueue::dequeue_next`] stay in flight
//! until they are marked completed or failed; failed requests are re-queued
//! until their retry budget is spent, then moved to a terminal failed bucket.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::context::ExecutionContext;
use super::options::ExecutionOptions;
use crate::error::{EngineError, Result};
use crate::workflow::Workflow;

/// Maximum number of terminally failed request ids kept for inspection.
const FAILED_BUCKET_LIMIT: usize = 1000;

/// Queue configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct QueueConfig {
    /// Waiting requests beyond this count are rejected
    pub max_size: usize,
    /// Upper bound on re-queues per request
    pub max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            max_retries: 3,
        }
    }
}

/// Request priority tier.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            other => Err(format!("unknown priority: '{}'", other)),
        }
    }
}

/// The unit placed into the queue.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub id: String,
    pub workflow: Workflow,
    pub context: ExecutionContext,
    pub options: ExecutionOptions,
    pub priority: Priority,
    pub submitted_at: Instant,
    /// Times this request has been dequeued
    pub attempts: u32,
}

impl ExecutionRequest {
    /// Creates a request keyed by the context's execution id.
    pub fn new(workflow: Workflow, context: ExecutionContext, options: ExecutionOptions) -> Self {
        Self {
            id: context.execution_id().to_string(),
            priority: options.priority,
            workflow,
            context,
            options,
            submitted_at: Instant::now(),
            attempts: 0,
        }
    }
}

/// Heap entry: highest priority first, then lowest sequence number.
struct QueuedRequest {
    seq: u64,
    request: ExecutionRequest,
}

impl PartialEq for QueuedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedRequest {}

impl PartialOrd for QueuedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedRequest {
    fn cmp(&self, other: &Self) -> Ordering {
        self.request
            .priority
            .cmp(&other.request.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Outcome of [`ExecutionQueue::mark_failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// The request went back into the queue
    Requeued,
    /// The retry budget is spent; the request moved to the failed bucket
    Exhausted,
    /// The id was not in flight
    Unknown,
}

/// Snapshot of queue counters.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct QueueStatistics {
    pub queued: usize,
    pub in_flight: usize,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub rejected: u64,
    pub capacity: usize,
    pub by_priority: HashMap<String, usize>,
    /// Mean wait between submission and first dequeue
    pub average_wait_ms: f64,
}

/// Priority queue of pending execution requests.
pub struct ExecutionQueue {
    config: QueueConfig,
    heap: BinaryHeap<QueuedRequest>,
    in_flight: HashMap<String, ExecutionRequest>,
    failed_bucket: VecDeque<String>,
    next_seq: u64,
    completed: u64,
    failed: u64,
    retried: u64,
    rejected: u64,
    total_wait_ms: u128,
    dequeued: u64,
}

impl ExecutionQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            heap: BinaryHeap::new(),
            in_flight: HashMap::new(),
            failed_bucket: VecDeque::new(),
            next_seq: 0,
            completed: 0,
            failed: 0,
            retried: 0,
            rejected: 0,
            total_wait_ms: 0,
            dequeued: 0,
        }
    }

    /// Adds a request, failing with [`EngineError::QueueFull`] at capacity.
    pub fn enqueue(&mut self, request: ExecutionRequest) -> Result<()> {
        if self.heap.len() >= self.config.max_size {
            self.rejected += 1;
            warn!(
                "Rejecting execution '{}': queue is full ({})",
                request.id, self.config.max_size
            );
            return Err(EngineError::QueueFull {
                capacity: self.config.max_size,
            });
        }

        debug!(
            "Queued execution '{}' for workflow '{}' ({} priority)",
            request.id,
            request.workflow.id(),
            request.priority
        );
        self.push(request);
        Ok(())
    }

    fn push(&mut self, request: ExecutionRequest) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueuedRequest { seq, request });
    }

    /// Takes the next request and tracks it as in flight.
    pub fn dequeue_next(&mut self) -> Option<ExecutionRequest> {
        let QueuedRequest { mut request, .. } = self.heap.pop()?;
        request.attempts += 1;
        if request.attempts == 1 {
            self.total_wait_ms += request.submitted_at.elapsed().as_millis();
            self.dequeued += 1;
        }
        self.in_flight.insert(request.id.clone(), request.clone());
        Some(request)
    }

    /// Marks an in-flight request as finished. Returns false for unknown ids.
    pub fn mark_completed(&mut self, id: &str) -> bool {
        if self.in_flight.remove(id).is_some() {
            self.completed += 1;
            true
        } else {
            false
        }
    }

    /// Marks an in-flight request as failed and re-queues it while its retry
    /// budget lasts.
    ///
    /// The budget is the smaller of the request's own `retries` option and
    /// the queue-wide `max_retries`.
    pub fn mark_failed(&mut self, id: &str) -> FailureDisposition {
        let Some(request) = self.in_flight.remove(id) else {
            return FailureDisposition::Unknown;
        };

        let budget = request.options.retries.min(self.config.max_retries);
        if request.attempts <= budget && self.heap.len() < self.config.max_size {
            info!(
                "Re-queuing execution '{}' (attempt {}/{})",
                id,
                request.attempts + 1,
                budget + 1
            );
            self.retried += 1;
            self.push(request);
            FailureDisposition::Requeued
        } else {
            self.bury(request);
            FailureDisposition::Exhausted
        }
    }

    /// Moves an in-flight request straight to the failed bucket, regardless
    /// of its retry budget. Used for failures a retry cannot fix.
    pub fn mark_failed_permanently(&mut self, id: &str) -> bool {
        match self.in_flight.remove(id) {
            Some(request) => {
                self.bury(request);
                true
            }
            None => false,
        }
    }

    fn bury(&mut self, request: ExecutionRequest) {
        warn!(
            "Execution '{}' failed after {} attempt(s); moving to failed bucket",
            request.id, request.attempts
        );
        self.failed += 1;
        self.failed_bucket.push_back(request.id);
        if self.failed_bucket.len() > FAILED_BUCKET_LIMIT {
            self.failed_bucket.pop_front();
        }
    }

    /// Removes a waiting (not in-flight) request. Returns it if found.
    pub fn remove(&mut self, id: &str) -> Option<ExecutionRequest> {
        let mut removed = None;
        let remaining: Vec<QueuedRequest> = std::mem::take(&mut self.heap)
            .into_vec()
            .into_iter()
            .filter_map(|entry| {
                if removed.is_none() && entry.request.id == id {
                    removed = Some(entry.request);
                    None
                } else {
                    Some(entry)
                }
            })
            .collect();
        self.heap = BinaryHeap::from(remaining);
        removed
    }

    pub fn contains(&self, id: &str) -> bool {
        self.in_flight.contains_key(id) || self.heap.iter().any(|e| e.request.id == id)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Ids of requests whose retry budget ran out, oldest first.
    pub fn failed_requests(&self) -> Vec<String> {
        self.failed_bucket.iter().cloned().collect()
    }

    pub fn get_statistics(&self) -> QueueStatistics {
        let mut by_priority = HashMap::new();
        for entry in self.heap.iter() {
            *by_priority
                .entry(entry.request.priority.as_str().to_string())
                .or_insert(0) += 1;
        }

        let average_wait_ms = if self.dequeued == 0 {
            0.0
        } else {
            self.total_wait_ms as f64 / self.dequeued as f64
        };

        QueueStatistics {
            queued: self.heap.len(),
            in_flight: self.in_flight.len(),
            completed: self.completed,
            failed: self.failed,
            retried: self.retried,
            rejected: self.rejected,
            capacity: self.config.max_size,
            by_priority,
            average_wait_ms,
        }
    }

    /// Healthy while the queue is below 90% of its capacity.
    pub fn is_healthy(&self) -> bool {
        (self.heap.len() as f64) < self.config.max_size as f64 * 0.9
    }
}
