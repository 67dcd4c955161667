//! Sequential Execution Engine
//!
//! The façade that drives every execution through its lifecycle:
//!
//! ```text
//! submitted -> queued -> cache_checked -> predicted -> resource_allocated
//!           -> optimized -> scheduled -> running -> completed | failed | cancelled
//! ```
//!
//! - Requests are admitted from the [`ExecutionQueue`] at most
//!   `max_concurrent_executions` at a time, by priority then FIFO
//! - Failed attempts with retries left go back into the queue
//! - A background maintenance task ticks the monitor, samples process
//!   resources and expires cache entries
//!
//! However an attempt ends, its allocation is released and the monitor and
//! counters are finalized before the caller sees the result.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::context::{ExecutionContext, ExecutionResult, ExecutionStatus, LogLevel};
use super::options::{ExecutionOptions, ExecutionStrategy};
use super::queue::{ExecutionQueue, ExecutionRequest, FailureDisposition, QueueStatistics};
use super::scheduler::{ExecutionScheduler, ScheduledExecution, SchedulerStats};
use crate::cache::{CacheStats, ExecutionCache};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::monitoring::{
    ActiveExecution, Alert, AlertFilter, AlertSummary, ExecutionMeta, ExecutionMonitor, ExecutionOutcome,
    ExecutionUpdate, MonitorStats, ResourceSample, ResourceSampler,
};
use crate::optimizer::{met_prediction, ExecutionOptimizer, OptimizationKind, PassStats};
use crate::predictor::{DurationPrediction, ExecutionPredictor, PredictorStats, ResourcePrediction};
use crate::resources::{AllocationGuard, ResourceManager, ResourceRequest, ResourceUtilization};
use crate::workflow::{execute_step, Step, Workflow};

/// Utilization above this percentage puts the engine into warning state.
const UTILIZATION_WARNING_PERCENT: f64 = 90.0;

/// Error rate above this fraction puts the engine into warning state.
const ERROR_RATE_WARNING: f64 = 0.1;

/// Where a request stands, as reported by [`SequentialExecutionEngine::status`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExecutionStatusReport {
    pub execution_id: String,
    pub workflow: String,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    /// Time since submission, frozen once the execution finishes
    pub duration_ms: u64,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// System-wide counters and component statistics.
#[derive(Serialize, Debug, Clone)]
pub struct EngineMetrics {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub cache_hits: u64,
    pub retries: u64,
    pub rejected: u64,
    /// Executions submitted but not finished
    pub active: usize,
    /// Failed over completed plus failed; cancellations are not errors
    pub error_rate: f64,
    pub average_duration_ms: f64,
    pub cache_hit_rate: f64,
    pub queue: QueueStatistics,
    pub cache: CacheStats,
    pub resources: ResourceUtilization,
    pub predictor: PredictorStats,
    pub scheduler: SchedulerStats,
    pub monitor: MonitorStats,
    pub optimizations: Vec<PassStats>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
}

/// Why the engine is not healthy.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HealthReason {
    QueueUnhealthy,
    SchedulerUnhealthy,
    HighMemory,
    HighCpu,
    HighErrorRate,
}

impl HealthReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QueueUnhealthy => "queue unhealthy",
            Self::SchedulerUnhealthy => "scheduler unhealthy",
            Self::HighMemory => "memory > 90%",
            Self::HighCpu => "cpu > 90%",
            Self::HighErrorRate => "error rate > 10%",
        }
    }
}

impl fmt::Display for HealthReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub reasons: Vec<HealthReason>,
    pub error_rate: f64,
    pub utilization: ResourceUtilization,
    pub alerts: AlertSummary,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// A submitted execution. Await [`ExecutionHandle::wait`] for its result.
pub struct ExecutionHandle {
    execution_id: String,
    workflow: String,
    version: String,
    receiver: oneshot::Receiver<ExecutionResult>,
}

impl ExecutionHandle {
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Waits for the final result.
    ///
    /// If the engine goes away before the execution finishes, the result
    /// reports it as cancelled.
    pub async fn wait(self) -> ExecutionResult {
        match self.receiver.await {
            Ok(result) => result,
            Err(_) => {
                let error = EngineError::Cancelled {
                    execution_id: self.execution_id.clone(),
                };
                ExecutionResult::failure(
                    &ExecutionContext::with_id(self.execution_id),
                    &self.workflow,
                    &self.version,
                    ExecutionStatus::Cancelled,
                    &error,
                )
            }
        }
    }
}

#[derive(Default)]
struct Counters {
    submitted: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,
    cache_hits: u64,
    retries: u64,
    rejected: u64,
    finished: u64,
    total_duration_ms: u64,
}

impl Counters {
    fn error_rate(&self) -> f64 {
        let judged = self.completed + self.failed;
        if judged == 0 {
            0.0
        } else {
            self.failed as f64 / judged as f64
        }
    }

    fn average_duration_ms(&self) -> f64 {
        if self.finished == 0 {
            0.0
        } else {
            self.total_duration_ms as f64 / self.finished as f64
        }
    }
}

struct StatusEntry {
    workflow: String,
    status: ExecutionStatus,
    submitted: Instant,
    duration_ms: Option<u64>,
    attempts: u32,
    error: Option<String>,
}

/// Live statuses plus a bounded history of finished ones.
struct StatusBook {
    entries: HashMap<String, StatusEntry>,
    finished: VecDeque<String>,
    limit: usize,
}

impl StatusBook {
    fn new(limit: usize) -> Self {
        Self {
            entries: HashMap::new(),
            finished: VecDeque::new(),
            limit: limit.max(1),
        }
    }

    fn insert(&mut self, execution_id: &str, workflow: String) {
        self.finished.retain(|id| id != execution_id);
        self.entries.insert(
            execution_id.to_string(),
            StatusEntry {
                workflow,
                status: ExecutionStatus::Submitted,
                submitted: Instant::now(),
                duration_ms: None,
                attempts: 0,
                error: None,
            },
        );
    }

    fn set(&mut self, execution_id: &str, status: ExecutionStatus) {
        if let Some(entry) = self.entries.get_mut(execution_id) {
            entry.status = status;
        }
    }

    fn finish(&mut self, result: &ExecutionResult) {
        let Some(entry) = self.entries.get_mut(&result.execution_id) else {
            return;
        };
        entry.status = result.status;
        entry.duration_ms = Some(entry.submitted.elapsed().as_millis() as u64);
        entry.attempts = result.attempts;
        entry.error = result.error.clone();

        self.finished.push_back(result.execution_id.clone());
        while self.finished.len() > self.limit {
            if let Some(oldest) = self.finished.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }
}

/// Mutable state of one attempt.
struct Attempt {
    ctx: ExecutionContext,
    started: Instant,
    prediction: Option<DurationPrediction>,
    applied: Vec<OptimizationKind>,
    allocation: Option<AllocationGuard>,
    monitored: bool,
    steps_completed: u32,
    steps_failed: u32,
}

impl Attempt {
    fn new(request: &ExecutionRequest) -> Self {
        Self {
            ctx: request.context.clone(),
            started: Instant::now(),
            prediction: None,
            applied: Vec::new(),
            allocation: None,
            monitored: false,
            steps_completed: 0,
            steps_failed: 0,
        }
    }

    fn applied_names(&self) -> Vec<String> {
        self.applied.iter().map(|k| k.as_str().to_string()).collect()
    }
}

/// Releases whatever an attempt still holds if it ends without concluding.
struct CleanupGuard<'a> {
    engine: &'a EngineInner,
    execution_id: &'a str,
    started: Instant,
}

impl Drop for CleanupGuard<'_> {
    fn drop(&mut self) {
        let outcome = ExecutionOutcome {
            status: ExecutionStatus::Failed,
            duration: self.started.elapsed(),
            steps_completed: 0,
            steps_failed: 0,
            errors: 1,
        };
        self.engine.monitor.complete(self.execution_id, outcome);
        if self.engine.resources.release(self.execution_id) {
            warn!(
                "Execution '{}' ended abnormally; its allocation was reclaimed",
                self.execution_id
            );
        }
    }
}

/// Owned by the task running one admitted request.
///
/// If the task ends without settling (it panicked or was aborted), the
/// waiter still gets a failed result. Either way the admission permit is
/// returned and the next queued request is admitted.
struct RunGuard {
    engine: Arc<EngineInner>,
    execution_id: String,
    workflow: String,
    version: String,
    attempts: u32,
    started: Instant,
    permit: Option<OwnedSemaphorePermit>,
    settled: bool,
}

impl RunGuard {
    fn new(engine: Arc<EngineInner>, request: &ExecutionRequest, permit: OwnedSemaphorePermit) -> Self {
        Self {
            engine,
            execution_id: request.id.clone(),
            workflow: request.workflow.name().to_string(),
            version: request.workflow.version().to_string(),
            attempts: request.attempts,
            started: Instant::now(),
            permit: Some(permit),
            settled: false,
        }
    }

    fn abandon(&self) {
        let pending = self.engine.waiters.lock().contains_key(&self.execution_id);
        if !pending {
            return;
        }

        error!("Execution '{}' ended without reporting a result", self.execution_id);
        self.engine.queue.lock().mark_failed_permanently(&self.execution_id);
        let error = EngineError::Aborted {
            execution_id: self.execution_id.clone(),
        };
        let mut result = ExecutionResult::failure(
            &ExecutionContext::with_id(self.execution_id.as_str()),
            &self.workflow,
            &self.version,
            ExecutionStatus::Failed,
            &error,
        );
        result.duration_ms = self.started.elapsed().as_millis() as u64;
        result.attempts = self.attempts;
        self.engine.finalize(result);
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if !self.settled {
            self.abandon();
        }
        drop(self.permit.take());
        // No runtime left to spawn on while it shuts down.
        if tokio::runtime::Handle::try_current().is_ok() {
            self.engine.pump();
        }
    }
}

struct Maintenance {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct EngineInner {
    config: EngineConfig,
    queue: Mutex<ExecutionQueue>,
    resources: Arc<ResourceManager>,
    cache: ExecutionCache,
    predictor: ExecutionPredictor,
    optimizer: ExecutionOptimizer,
    scheduler: ExecutionScheduler,
    monitor: ExecutionMonitor,
    admission: Arc<Semaphore>,
    waiters: Mutex<HashMap<String, oneshot::Sender<ExecutionResult>>>,
    statuses: Mutex<StatusBook>,
    counters: Mutex<Counters>,
}

/// Workflow execution engine.
///
/// Owns one instance of every component; nothing is shared between engines.
///
/// # Example
///
/// ```rust,no_run
/// use flowrunner::{EngineConfig, ExecutionContext, ExecutionOptions, SequentialExecutionEngine};
/// use flowrunner::load_workflow;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let workflow = load_workflow("pipeline.yaml")?;
///     let engine = SequentialExecutionEngine::new(EngineConfig::default())?;
///     engine.start().await?;
///
///     let result = engine
///         .execute(workflow, ExecutionContext::new(), ExecutionOptions::default())
///         .await;
///     println!("success: {}", result.success);
///
///     engine.shutdown().await;
///     Ok(())
/// }
/// ```
pub struct SequentialExecutionEngine {
    inner: Arc<EngineInner>,
    maintenance: Mutex<Option<Maintenance>>,
}

impl SequentialExecutionEngine {
    /// Creates an engine after validating its configuration.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let scheduler_capacity = config.queue.max_size + config.max_concurrent_executions;
        let inner = EngineInner {
            queue: Mutex::new(ExecutionQueue::new(config.queue.clone())),
            resources: Arc::new(ResourceManager::new(config.resources.clone())),
            cache: ExecutionCache::new(config.cache.clone()),
            predictor: ExecutionPredictor::new(config.predictor.clone()),
            optimizer: ExecutionOptimizer::new(config.optimizer.clone()),
            scheduler: ExecutionScheduler::new(scheduler_capacity),
            monitor: ExecutionMonitor::new(config.monitor.clone()),
            admission: Arc::new(Semaphore::new(config.max_concurrent_executions)),
            waiters: Mutex::new(HashMap::new()),
            statuses: Mutex::new(StatusBook::new(config.status_history)),
            counters: Mutex::new(Counters::default()),
            config,
        };

        info!(
            "Execution engine ready ({} concurrent executions, queue of {})",
            inner.config.max_concurrent_executions, inner.config.queue.max_size
        );

        Ok(Self {
            inner: Arc::new(inner),
            maintenance: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Submits a workflow run and returns a handle to its result.
    ///
    /// The context's execution id is used unless another unfinished
    /// execution already holds it, in which case a fresh id is assigned.
    pub async fn submit(
        &self,
        workflow: Workflow,
        context: ExecutionContext,
        options: ExecutionOptions,
    ) -> ExecutionHandle {
        self.inner.submit(workflow, context, options)
    }

    /// Runs a workflow and waits for its result.
    ///
    /// Never fails: every error becomes an unsuccessful [`ExecutionResult`].
    pub async fn execute(
        &self,
        workflow: Workflow,
        context: ExecutionContext,
        options: ExecutionOptions,
    ) -> ExecutionResult {
        self.submit(workflow, context, options).await.wait().await
    }

    /// Current status of an execution, live or recently finished.
    pub fn status(&self, execution_id: &str) -> Option<ExecutionStatusReport> {
        let report = {
            let statuses = self.inner.statuses.lock();
            let entry = statuses.entries.get(execution_id)?;
            ExecutionStatusReport {
                execution_id: execution_id.to_string(),
                workflow: entry.workflow.clone(),
                status: entry.status,
                current_step: None,
                duration_ms: entry
                    .duration_ms
                    .unwrap_or_else(|| entry.submitted.elapsed().as_millis() as u64),
                attempts: entry.attempts,
                error: entry.error.clone(),
            }
        };

        let current_step = self
            .inner
            .monitor
            .active(execution_id)
            .and_then(|active| active.current_step);
        Some(ExecutionStatusReport {
            current_step,
            ..report
        })
    }

    /// Requests cancellation of an unfinished execution.
    ///
    /// A queued request is withdrawn at once; a running one stops before its
    /// next step. Returns false for unknown, finished or already cancelled ids.
    pub fn cancel(&self, execution_id: &str) -> bool {
        self.inner.cancel(execution_id)
    }

    pub fn metrics(&self) -> EngineMetrics {
        let inner = &self.inner;
        let cache = inner.cache.stats();
        let queue = inner.queue.lock().get_statistics();
        let active = inner.waiters.lock().len();
        let counters = inner.counters.lock();
        EngineMetrics {
            submitted: counters.submitted,
            completed: counters.completed,
            failed: counters.failed,
            cancelled: counters.cancelled,
            cache_hits: counters.cache_hits,
            retries: counters.retries,
            rejected: counters.rejected,
            active,
            error_rate: counters.error_rate(),
            average_duration_ms: counters.average_duration_ms(),
            cache_hit_rate: cache.hit_rate(),
            queue,
            cache,
            resources: inner.resources.utilization(),
            predictor: inner.predictor.stats(),
            scheduler: inner.scheduler.stats(),
            monitor: inner.monitor.stats(),
            optimizations: inner.optimizer.stats(),
        }
    }

    pub fn health(&self) -> HealthReport {
        let inner = &self.inner;
        let mut reasons = Vec::new();

        if !inner.queue.lock().is_healthy() {
            reasons.push(HealthReason::QueueUnhealthy);
        }
        if !inner.scheduler.is_healthy() {
            reasons.push(HealthReason::SchedulerUnhealthy);
        }

        let utilization = inner.resources.utilization();
        if utilization.memory_percent() > UTILIZATION_WARNING_PERCENT {
            reasons.push(HealthReason::HighMemory);
        }
        if utilization.cpu_percent() > UTILIZATION_WARNING_PERCENT {
            reasons.push(HealthReason::HighCpu);
        }

        let error_rate = inner.counters.lock().error_rate();
        if error_rate > ERROR_RATE_WARNING {
            reasons.push(HealthReason::HighErrorRate);
        }

        let status = if reasons.is_empty() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Warning
        };

        HealthReport {
            status,
            reasons,
            error_rate,
            utilization,
            alerts: inner.monitor.alert_summary(),
        }
    }

    pub fn alerts(&self, filter: &AlertFilter) -> Vec<Alert> {
        self.inner.monitor.alerts(filter)
    }

    pub fn active_executions(&self) -> Vec<ActiveExecution> {
        self.inner.monitor.active_executions()
    }

    /// Drops cached results of a workflow, optionally one version only.
    pub fn invalidate_cache(&self, workflow: &str, version: Option<&str>) -> usize {
        self.inner.cache.invalidate(workflow, version)
    }

    /// Starts the background maintenance task. Calling it twice is a no-op.
    pub async fn start(&self) -> Result<()> {
        let mut slot = self.maintenance.lock();
        if slot.is_some() {
            return Ok(());
        }

        let interval = self.inner.config.monitor.tick_interval();
        let mut sampler = ResourceSampler::new()?.with_min_interval(interval / 2);
        let engine = Arc::downgrade(&self.inner);
        let token = CancellationToken::new();
        let stop = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(engine) = engine.upgrade() else { break };
                        engine.maintain(&mut sampler);
                    }
                }
            }
            debug!("Maintenance task stopped");
        });

        info!("Started maintenance task (every {:?})", interval);
        *slot = Some(Maintenance { token, handle });
        Ok(())
    }

    /// Stops the maintenance task and waits for it to exit.
    pub async fn shutdown(&self) {
        let maintenance = self.maintenance.lock().take();
        if let Some(maintenance) = maintenance {
            maintenance.token.cancel();
            if let Err(e) = maintenance.handle.await {
                warn!("Maintenance task ended abnormally: {}", e);
            }
            info!("Execution engine shut down");
        }
    }
}

impl Drop for SequentialExecutionEngine {
    fn drop(&mut self) {
        if let Some(maintenance) = self.maintenance.lock().take() {
            maintenance.token.cancel();
        }
    }
}

impl EngineInner {
    fn submit(
        self: &Arc<Self>,
        workflow: Workflow,
        mut context: ExecutionContext,
        options: ExecutionOptions,
    ) -> ExecutionHandle {
        let (sender, receiver) = oneshot::channel();
        let execution_id = {
            let mut waiters = self.waiters.lock();
            let requested = context.execution_id().to_string();
            let execution_id = if waiters.contains_key(&requested) {
                let fresh = Uuid::new_v4().to_string();
                warn!(
                    "Execution id '{}' is already in use; running as '{}'",
                    requested, fresh
                );
                fresh
            } else {
                requested
            };
            waiters.insert(execution_id.clone(), sender);
            execution_id
        };
        if context.execution_id() != execution_id {
            context = context.with_execution_id(execution_id.clone());
        }

        self.counters.lock().submitted += 1;
        self.statuses.lock().insert(&execution_id, workflow.id());
        self.scheduler.register(&execution_id);

        let handle = ExecutionHandle {
            execution_id: execution_id.clone(),
            workflow: workflow.name().to_string(),
            version: workflow.version().to_string(),
            receiver,
        };

        info!(
            "Submitted execution '{}' of '{}' ({} strategy, {} priority)",
            execution_id,
            workflow.id(),
            options.strategy,
            options.priority
        );

        let request = ExecutionRequest::new(workflow, context.clone(), options);
        let enqueued = self.queue.lock().enqueue(request);
        match enqueued {
            Ok(()) => {
                self.set_status(&execution_id, ExecutionStatus::Queued);
                self.pump();
            }
            Err(e) => {
                self.counters.lock().rejected += 1;
                let result = ExecutionResult::failure(
                    &context,
                    &handle.workflow,
                    &handle.version,
                    ExecutionStatus::Failed,
                    &e,
                );
                self.finalize(result);
            }
        }
        handle
    }

    /// Admits queued requests while admission permits are free.
    fn pump(self: &Arc<Self>) {
        loop {
            let Ok(permit) = Arc::clone(&self.admission).try_acquire_owned() else {
                return;
            };
            let Some(request) = self.queue.lock().dequeue_next() else {
                return;
            };

            debug!(
                "Admitted execution '{}' (attempt {})",
                request.id, request.attempts
            );
            let engine = Arc::clone(self);
            let guard = RunGuard::new(Arc::clone(self), &request, permit);
            tokio::spawn(async move {
                let mut guard = guard;
                engine.run_request(request).await;
                guard.settled = true;
            });
        }
    }

    async fn run_request(&self, request: ExecutionRequest) {
        let execution_id = request.id.clone();
        let token = self.scheduler.register(&execution_id);

        let (mut result, retryable) = self.attempt(&request, &token).await;
        result.attempts = request.attempts;

        match result.status {
            ExecutionStatus::Failed if retryable && !token.is_cancelled() => {
                let disposition = self.queue.lock().mark_failed(&execution_id);
                if disposition == FailureDisposition::Requeued {
                    self.counters.lock().retries += 1;
                    self.set_status(&execution_id, ExecutionStatus::Queued);
                    info!(
                        "Execution '{}' failed on attempt {} and will be retried: {}",
                        execution_id,
                        request.attempts,
                        result.error.as_deref().unwrap_or("unknown error")
                    );
                    return;
                }
            }
            ExecutionStatus::Failed => {
                self.queue.lock().mark_failed_permanently(&execution_id);
            }
            _ => {
                self.queue.lock().mark_completed(&execution_id);
            }
        }

        self.finalize(result);
    }

    /// Runs one attempt and concludes it. The flag tells whether the
    /// failure, if any, is worth retrying.
    async fn attempt(&self, request: &ExecutionRequest, token: &CancellationToken) -> (ExecutionResult, bool) {
        let mut attempt = Attempt::new(request);
        let _cleanup = CleanupGuard {
            engine: self,
            execution_id: &request.id,
            started: attempt.started,
        };

        let outcome = self.drive(request, token, &mut attempt).await;
        self.conclude(request, attempt, outcome)
    }

    /// Walks the lifecycle up to the end of the last step.
    ///
    /// Returns the cached result on a cache hit.
    async fn drive(
        &self,
        request: &ExecutionRequest,
        token: &CancellationToken,
        attempt: &mut Attempt,
    ) -> Result<Option<ExecutionResult>> {
        let execution_id = request.id.as_str();
        let workflow = &request.workflow;
        let options = &request.options;
        let cancelled = || EngineError::Cancelled {
            execution_id: execution_id.to_string(),
        };

        if token.is_cancelled() {
            return Err(cancelled());
        }

        let hit = if options.bypass_cache {
            None
        } else {
            self.cache
                .lookup(workflow, &request.context, options.exclude_sensitive_from_cache)
        };
        self.set_status(execution_id, ExecutionStatus::CacheChecked);
        if let Some(mut hit) = hit {
            info!("Execution '{}' served from cache", execution_id);
            hit.execution_id = execution_id.to_string();
            return Ok(Some(hit));
        }

        let prediction = self.predictor.predict_duration(workflow, &request.context);
        let needs = self.predictor.predict_resources(workflow, &request.context);
        debug!(
            "Predicted {} ms for '{}' ({:?} model, confidence {:.2})",
            prediction.duration_ms, execution_id, prediction.model, prediction.confidence
        );
        attempt.prediction = Some(prediction);
        self.set_status(execution_id, ExecutionStatus::Predicted);

        let wanted = self.resource_request(request, &needs);
        let guard = tokio::select! {
            guard = self.resources.acquire(
                execution_id,
                wanted,
                options.resource_strategy,
                self.config.allocation_timeout(),
            ) => guard?,
            _ = token.cancelled() => return Err(cancelled()),
        };
        let allocation = guard.allocation().clone();
        attempt.allocation = Some(guard);
        attempt.ctx.log(
            LogLevel::Info,
            format!(
                "allocated {} MB / {:.2} cpu / {} slot(s)",
                allocation.memory_mb, allocation.cpu, allocation.slots
            ),
        );
        self.set_status(execution_id, ExecutionStatus::ResourceAllocated);

        let steps = match options.strategy {
            ExecutionStrategy::Simple => workflow.steps().to_vec(),
            ExecutionStrategy::Basic => {
                match self
                    .optimizer
                    .optimize_within(workflow, &attempt.ctx, allocation.slots)
                {
                    Ok((optimized, outcome)) => {
                        attempt.applied = outcome.applied;
                        optimized.steps().to_vec()
                    }
                    Err(e @ EngineError::DependencyCycle { .. }) => return Err(e),
                    Err(e) => {
                        warn!(
                            "Optimization of '{}' failed, running it unoptimized: {}",
                            execution_id, e
                        );
                        workflow.steps().to_vec()
                    }
                }
            }
        };
        if !attempt.applied.is_empty() {
            attempt.ctx.log(
                LogLevel::Info,
                format!("applied optimizations: {}", attempt.applied_names().join(", ")),
            );
        }
        self.set_status(execution_id, ExecutionStatus::Optimized);

        let plan = self
            .scheduler
            .schedule(execution_id, steps, &allocation, options.strategy)?;
        self.set_status(execution_id, ExecutionStatus::Scheduled);

        let timeout = options.timeout.unwrap_or_else(|| self.config.default_timeout());
        self.monitor.register(
            execution_id,
            ExecutionMeta {
                workflow: workflow.name().to_string(),
                step_count: plan.steps.iter().map(unit_count).sum(),
                timeout: Some(timeout),
            },
        );
        attempt.monitored = true;

        self.set_status(execution_id, ExecutionStatus::Running);
        self.run_steps(&plan, attempt, timeout).await?;
        Ok(None)
    }

    /// Runs the planned steps in order until one fails, the deadline passes
    /// or cancellation is observed at a step boundary.
    async fn run_steps(&self, plan: &ScheduledExecution, attempt: &mut Attempt, timeout: Duration) -> Result<()> {
        let execution_id = plan.execution_id.as_str();
        let deadline = tokio::time::Instant::now() + timeout;
        // group names never appear in step records
        let mut finished: HashSet<String> = HashSet::new();

        for step in &plan.steps {
            if plan.is_cancelled() {
                info!(
                    "Execution '{}' cancelled before step '{}'",
                    execution_id,
                    step.name()
                );
                return Err(EngineError::Cancelled {
                    execution_id: execution_id.to_string(),
                });
            }

            let missing = step
                .dependencies()
                .iter()
                .find(|dep| !finished.contains(*dep) && !attempt.ctx.has_completed(dep));
            if let Some(dependency) = missing {
                return Err(EngineError::DependencyViolation {
                    step: step.name().to_string(),
                    dependency: dependency.clone(),
                });
            }

            self.monitor
                .update(execution_id, ExecutionUpdate::step_started(step.name()));
            let recorded = attempt.ctx.step_records().len();

            let outcome = tokio::time::timeout_at(deadline, execute_step(step, &mut attempt.ctx)).await;
            self.track_records(execution_id, attempt, recorded);

            let result = match outcome {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        "Execution '{}' hit its {:?} deadline during step '{}'",
                        execution_id,
                        timeout,
                        step.name()
                    );
                    return Err(EngineError::ExecutionTimeout {
                        execution_id: execution_id.to_string(),
                        timeout,
                    });
                }
            };

            if !result.success {
                return Err(EngineError::StepExecutionFailure {
                    step: step.name().to_string(),
                    message: result.error.unwrap_or_else(|| "unknown error".to_string()),
                });
            }

            finished.insert(step.name().to_string());
            finished.extend(step.metadata().members.iter().cloned());
        }
        Ok(())
    }

    /// Reports step records added since `from` to the monitor.
    fn track_records(&self, execution_id: &str, attempt: &mut Attempt, from: usize) {
        let (mut completed, mut failed) = (0, 0);
        for record in attempt.ctx.step_records().iter().skip(from) {
            if record.success {
                completed += 1;
            } else {
                failed += 1;
            }
        }
        if completed + failed == 0 {
            return;
        }

        attempt.steps_completed += completed;
        attempt.steps_failed += failed;
        self.monitor.update(
            execution_id,
            ExecutionUpdate {
                steps_completed: completed,
                steps_failed: failed,
                errors: failed,
                ..ExecutionUpdate::default()
            },
        );
    }

    /// Builds the result, feeds the cache and the learners, and releases
    /// what the attempt holds.
    fn conclude(
        &self,
        request: &ExecutionRequest,
        mut attempt: Attempt,
        outcome: Result<Option<ExecutionResult>>,
    ) -> (ExecutionResult, bool) {
        let execution_id = request.id.as_str();
        let workflow = &request.workflow;
        let options = &request.options;
        let duration = attempt.started.elapsed();
        let duration_ms = duration.as_millis() as u64;
        let predicted_duration_ms = attempt.prediction.as_ref().map(|p| p.duration_ms);

        let (result, retryable) = match outcome {
            Ok(Some(mut hit)) => {
                self.counters.lock().cache_hits += 1;
                hit.duration_ms = duration_ms;
                (hit, false)
            }
            Ok(None) => {
                let result = ExecutionResult {
                    execution_id: execution_id.to_string(),
                    workflow: workflow.name().to_string(),
                    version: workflow.version().to_string(),
                    success: true,
                    status: ExecutionStatus::Completed,
                    error: None,
                    error_kind: None,
                    step_results: attempt.ctx.step_records().to_vec(),
                    timings: attempt.ctx.timeline().spans(),
                    data: attempt.ctx.public_data(),
                    duration_ms,
                    from_cache: false,
                    applied_optimizations: attempt.applied_names(),
                    predicted_duration_ms,
                    attempts: 1,
                };
                (result, false)
            }
            Err(e) => {
                let status = if matches!(e, EngineError::Cancelled { .. }) {
                    ExecutionStatus::Cancelled
                } else {
                    ExecutionStatus::Failed
                };
                let mut result =
                    ExecutionResult::failure(&attempt.ctx, workflow.name(), workflow.version(), status, &e);
                result.duration_ms = duration_ms;
                result.applied_optimizations = attempt.applied_names();
                result.predicted_duration_ms = predicted_duration_ms;
                (result, e.is_retryable())
            }
        };

        if !result.from_cache {
            if result.success && !options.bypass_cache && workflow.steps().iter().all(|s| s.metadata().cacheable) {
                self.cache.store(
                    workflow,
                    &request.context,
                    &result,
                    options.cache_ttl,
                    options.exclude_sensitive_from_cache,
                );
            }

            if attempt.monitored && result.status != ExecutionStatus::Cancelled {
                self.predictor.learn(
                    execution_id,
                    workflow,
                    &request.context,
                    &result,
                    attempt.prediction.as_ref(),
                );
                if !attempt.applied.is_empty() {
                    let met = predicted_duration_ms
                        .map(|predicted| met_prediction(result.duration_ms, predicted))
                        .unwrap_or(true);
                    self.optimizer
                        .learn(&workflow.id(), &attempt.applied, result.success, met);
                }
            }
        }

        if attempt.monitored {
            self.monitor.complete(
                execution_id,
                ExecutionOutcome {
                    status: result.status,
                    duration,
                    steps_completed: attempt.steps_completed,
                    steps_failed: attempt.steps_failed,
                    errors: attempt.steps_failed,
                },
            );
        }
        drop(attempt.allocation.take());

        (result, retryable)
    }

    /// Resolves a finished execution.
    fn finalize(&self, result: ExecutionResult) {
        let execution_id = result.execution_id.clone();
        self.scheduler.release(&execution_id);

        {
            let mut counters = self.counters.lock();
            match result.status {
                ExecutionStatus::Completed => counters.completed += 1,
                ExecutionStatus::Cancelled => counters.cancelled += 1,
                _ => counters.failed += 1,
            }
            counters.finished += 1;
            counters.total_duration_ms += result.duration_ms;
        }
        self.statuses.lock().finish(&result);

        match result.status {
            ExecutionStatus::Completed => info!(
                "Execution '{}' completed in {} ms{}",
                execution_id,
                result.duration_ms,
                if result.from_cache { " (cached)" } else { "" }
            ),
            ExecutionStatus::Cancelled => info!("Execution '{}' cancelled", execution_id),
            _ => error!(
                "Execution '{}' failed: {}",
                execution_id,
                result.error.as_deref().unwrap_or("unknown error")
            ),
        }

        let sender = self.waiters.lock().remove(&execution_id);
        if let Some(sender) = sender {
            if sender.send(result).is_err() {
                debug!("Nobody is waiting for execution '{}'", execution_id);
            }
        }
    }

    fn cancel(&self, execution_id: &str) -> bool {
        if !self.waiters.lock().contains_key(execution_id) {
            return false;
        }
        if !self.scheduler.cancel(execution_id) {
            return false;
        }

        let withdrawn = self.queue.lock().remove(execution_id);
        if let Some(request) = withdrawn {
            let error = EngineError::Cancelled {
                execution_id: execution_id.to_string(),
            };
            let mut result = ExecutionResult::failure(
                &request.context,
                request.workflow.name(),
                request.workflow.version(),
                ExecutionStatus::Cancelled,
                &error,
            );
            result.attempts = request.attempts;
            self.finalize(result);
        }
        true
    }

    fn set_status(&self, execution_id: &str, status: ExecutionStatus) {
        debug!("Execution '{}' is {}", execution_id, status);
        self.statuses.lock().set(execution_id, status);
    }

    /// Sizes the allocation request of an execution.
    ///
    /// Explicit requirements are passed through as given; predictions are
    /// capped by the per-execution limits first.
    fn resource_request(&self, request: &ExecutionRequest, needs: &ResourcePrediction) -> ResourceRequest {
        let limits = self.resources.limits();
        let (memory_mb, cpu) = match request.options.resources {
            Some(explicit) if explicit.is_specified() => (explicit.memory_mb, explicit.cpu),
            _ => (
                needs.memory_mb.min(limits.max_memory_per_execution_mb),
                needs.cpu.min(limits.max_cpu),
            ),
        };

        let slots = match request.options.strategy {
            ExecutionStrategy::Simple => 1,
            ExecutionStrategy::Basic => {
                let parallelizable = request
                    .workflow
                    .steps()
                    .iter()
                    .filter(|s| s.metadata().parallelizable)
                    .count();
                let ceiling = self
                    .optimizer
                    .config()
                    .max_parallel_steps
                    .min(limits.max_slots)
                    .max(1);
                parallelizable.clamp(1, ceiling)
            }
        };

        ResourceRequest::new(memory_mb, cpu, slots).with_priority(request.priority)
    }

    /// One maintenance round: threshold checks, usage sampling and expiry.
    fn maintain(&self, sampler: &mut ResourceSampler) {
        let raised = self.monitor.tick();
        if let Some(sample) = sampler.sample() {
            self.attribute_usage(&sample);
        }
        let pruned = self.monitor.prune_alerts();
        let expired = self.cache.purge_expired();

        if !raised.is_empty() || pruned > 0 || expired > 0 {
            debug!(
                "Maintenance: {} alert(s) raised, {} pruned, {} cache entries expired",
                raised.len(),
                pruned,
                expired
            );
        }
    }

    /// Charges a process-wide sample to the active executions.
    fn attribute_usage(&self, sample: &ResourceSample) {
        let granted: Vec<(String, u64)> = self
            .resources
            .active_ids()
            .iter()
            .filter_map(|id| self.resources.allocation(id))
            .map(|allocation| (allocation.execution_id, allocation.memory_mb))
            .collect();

        for share in sample.split(&granted) {
            self.resources
                .record_usage(&share.execution_id, share.memory_mb, share.cpu_cores());
            self.monitor.update(
                &share.execution_id,
                ExecutionUpdate::usage(share.memory_mb, share.cpu_percent),
            );
        }
    }
}

/// Underlying steps a planned step stands for.
fn unit_count(step: &Step) -> usize {
    step.metadata().members.len().max(1)
}
