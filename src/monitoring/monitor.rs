//! Execution Monitor
//!
//! Tracks every active execution and raises alerts when one crosses a
//! threshold. Checks run on [`ExecutionMonitor::update`], on every periodic
//! [`ExecutionMonitor::tick`] and once more on completion; each alert type
//! is raised at most once per execution.
//!
//! Completed runs feed a rolling duration baseline per workflow name. A run
//! is compared against the baseline of earlier runs before it is added.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::alert::{Alert, AlertFilter, AlertSummary, AlertType, Severity};
use crate::execution::context::ExecutionStatus;

/// Monitor configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct MonitorConfig {
    /// Interval of the background tick
    pub tick_interval_ms: u64,
    /// Age after which an active execution raises a timeout alert
    pub execution_timeout_ms: u64,
    pub memory_threshold_mb: u64,
    pub cpu_threshold_percent: f64,
    /// Recorded errors that raise an error-threshold alert
    pub error_threshold: u32,
    /// Failed / total step ratio that raises a step-failure alert
    pub step_failure_ratio: f64,
    /// Fraction above baseline that counts as degraded
    pub degradation_threshold: f64,
    /// Completions needed before a baseline is trusted
    pub min_baseline_samples: usize,
    /// Durations kept per baseline
    pub baseline_window: usize,
    pub alert_retention_secs: u64,
    pub max_alerts: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            execution_timeout_ms: 300_000,
            memory_threshold_mb: 1024,
            cpu_threshold_percent: 90.0,
            error_threshold: 5,
            step_failure_ratio: 0.5,
            degradation_threshold: 0.5,
            min_baseline_samples: 3,
            baseline_window: 20,
            alert_retention_secs: 86_400,
            max_alerts: 10_000,
        }
    }
}

impl MonitorConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

/// What the monitor is told when an execution starts.
#[derive(Debug, Clone)]
pub struct ExecutionMeta {
    pub workflow: String,
    /// Steps the execution will run
    pub step_count: usize,
    /// Overrides the configured execution timeout
    pub timeout: Option<Duration>,
}

/// An incremental change to an active execution.
#[derive(Debug, Clone, Default)]
pub struct ExecutionUpdate {
    pub current_step: Option<String>,
    pub steps_completed: u32,
    pub steps_failed: u32,
    pub errors: u32,
    pub memory_mb: Option<u64>,
    pub cpu_percent: Option<f64>,
}

impl ExecutionUpdate {
    pub fn step_started(name: impl Into<String>) -> Self {
        Self {
            current_step: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn step_completed() -> Self {
        Self {
            steps_completed: 1,
            ..Self::default()
        }
    }

    pub fn step_failed() -> Self {
        Self {
            steps_failed: 1,
            errors: 1,
            ..Self::default()
        }
    }

    pub fn usage(memory_mb: u64, cpu_percent: f64) -> Self {
        Self {
            memory_mb: Some(memory_mb),
            cpu_percent: Some(cpu_percent),
            ..Self::default()
        }
    }
}

/// Final figures reported on completion.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub duration: Duration,
    pub steps_completed: u32,
    pub steps_failed: u32,
    pub errors: u32,
}

/// Point-in-time view of an active execution.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ActiveExecution {
    pub execution_id: String,
    pub workflow: String,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub current_step: Option<String>,
    pub step_count: usize,
    pub steps_completed: u32,
    pub steps_failed: u32,
    pub errors: u32,
    pub memory_mb: Option<u64>,
    pub cpu_percent: Option<f64>,
}

/// Rolling duration average of one workflow.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PerformanceBaseline {
    pub workflow: String,
    pub average_ms: f64,
    pub samples: usize,
}

/// Counters reported by [`ExecutionMonitor::stats`].
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct MonitorStats {
    pub active: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub alerts: AlertSummary,
}

struct Tracked {
    workflow: String,
    started_at: DateTime<Utc>,
    started: Instant,
    timeout: Duration,
    step_count: usize,
    current_step: Option<String>,
    steps_completed: u32,
    steps_failed: u32,
    errors: u32,
    memory_mb: Option<u64>,
    cpu_percent: Option<f64>,
    raised: HashSet<AlertType>,
}

impl Tracked {
    fn snapshot(&self, execution_id: &str) -> ActiveExecution {
        ActiveExecution {
            execution_id: execution_id.to_string(),
            workflow: self.workflow.clone(),
            started_at: self.started_at,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            current_step: self.current_step.clone(),
            step_count: self.step_count,
            steps_completed: self.steps_completed,
            steps_failed: self.steps_failed,
            errors: self.errors,
            memory_mb: self.memory_mb,
            cpu_percent: self.cpu_percent,
        }
    }
}

#[derive(Default)]
struct Baseline {
    durations: VecDeque<f64>,
}

impl Baseline {
    fn average(&self) -> f64 {
        if self.durations.is_empty() {
            0.0
        } else {
            self.durations.iter().sum::<f64>() / self.durations.len() as f64
        }
    }
}

#[derive(Default)]
struct MonitorState {
    active: HashMap<String, Tracked>,
    alerts: VecDeque<Alert>,
    baselines: HashMap<String, Baseline>,
    completed: u64,
    failed: u64,
    cancelled: u64,
}

/// Real-time tracker of active executions.
pub struct ExecutionMonitor {
    config: MonitorConfig,
    state: Mutex<MonitorState>,
}

impl ExecutionMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            state: Mutex::new(MonitorState::default()),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Starts tracking an execution. Re-registering an id resets it.
    pub fn register(&self, execution_id: &str, meta: ExecutionMeta) {
        let timeout = meta
            .timeout
            .unwrap_or_else(|| Duration::from_millis(self.config.execution_timeout_ms));
        debug!(
            "Monitoring execution '{}' of '{}' ({} steps)",
            execution_id, meta.workflow, meta.step_count
        );
        self.state.lock().active.insert(
            execution_id.to_string(),
            Tracked {
                workflow: meta.workflow,
                started_at: Utc::now(),
                started: Instant::now(),
                timeout,
                step_count: meta.step_count,
                current_step: None,
                steps_completed: 0,
                steps_failed: 0,
                errors: 0,
                memory_mb: None,
                cpu_percent: None,
                raised: HashSet::new(),
            },
        );
    }

    /// Applies a delta to an active execution and checks its thresholds.
    ///
    /// Returns the alerts raised by this update; unknown ids are ignored.
    pub fn update(&self, execution_id: &str, update: ExecutionUpdate) -> Vec<Alert> {
        let mut state = self.state.lock();
        let Some(tracked) = state.active.get_mut(execution_id) else {
            return Vec::new();
        };

        if update.current_step.is_some() {
            tracked.current_step = update.current_step;
        }
        tracked.steps_completed += update.steps_completed;
        tracked.steps_failed += update.steps_failed;
        tracked.errors += update.errors;
        if update.memory_mb.is_some() {
            tracked.memory_mb = update.memory_mb;
        }
        if update.cpu_percent.is_some() {
            tracked.cpu_percent = update.cpu_percent;
        }

        let raised = check(&self.config, execution_id, tracked);
        self.store(&mut state, raised)
    }

    /// Checks every active execution.
    pub fn tick(&self) -> Vec<Alert> {
        let mut state = self.state.lock();
        let mut raised = Vec::new();
        for (id, tracked) in state.active.iter_mut() {
            raised.extend(check(&self.config, id, tracked));
        }
        self.store(&mut state, raised)
    }

    /// Stops tracking an execution, updates its workflow baseline and
    /// returns the alerts raised by the final check.
    pub fn complete(&self, execution_id: &str, outcome: ExecutionOutcome) -> Vec<Alert> {
        let mut state = self.state.lock();
        let Some(mut tracked) = state.active.remove(execution_id) else {
            return Vec::new();
        };

        tracked.steps_completed = tracked.steps_completed.max(outcome.steps_completed);
        tracked.steps_failed = tracked.steps_failed.max(outcome.steps_failed);
        tracked.errors = tracked.errors.max(outcome.errors);
        let mut raised = check(&self.config, execution_id, &mut tracked);

        match outcome.status {
            ExecutionStatus::Completed => state.completed += 1,
            ExecutionStatus::Cancelled => state.cancelled += 1,
            _ => state.failed += 1,
        }

        let duration_ms = outcome.duration.as_millis() as f64;
        let baseline = state.baselines.entry(tracked.workflow.clone()).or_default();
        if outcome.status == ExecutionStatus::Completed {
            if baseline.durations.len() >= self.config.min_baseline_samples {
                let average = baseline.average();
                let limit = average * (1.0 + self.config.degradation_threshold);
                if duration_ms > limit && !tracked.raised.contains(&AlertType::PerformanceDegradation) {
                    raised.push(Alert::new(
                        AlertType::PerformanceDegradation,
                        execution_id,
                        tracked.workflow.clone(),
                        format!(
                            "run took {:.0}ms against a baseline of {:.0}ms",
                            duration_ms, average
                        ),
                        json!({ "duration_ms": duration_ms, "baseline_ms": average }),
                    ));
                }
            }

            baseline.durations.push_back(duration_ms);
            while baseline.durations.len() > self.config.baseline_window.max(1) {
                baseline.durations.pop_front();
            }
        }

        debug!(
            "Execution '{}' left monitoring as {}",
            execution_id,
            outcome.status.as_str()
        );
        self.store(&mut state, raised)
    }

    fn store(&self, state: &mut MonitorState, raised: Vec<Alert>) -> Vec<Alert> {
        for alert in &raised {
            match alert.severity {
                Severity::Critical | Severity::Error => {
                    error!("[{}] {}: {}", alert.alert_type, alert.execution_id, alert.message)
                }
                Severity::Warning => {
                    warn!("[{}] {}: {}", alert.alert_type, alert.execution_id, alert.message)
                }
                Severity::Info => {
                    info!("[{}] {}: {}", alert.alert_type, alert.execution_id, alert.message)
                }
            }
            state.alerts.push_back(alert.clone());
        }
        while state.alerts.len() > self.config.max_alerts.max(1) {
            state.alerts.pop_front();
        }
        raised
    }

    /// Drops alerts older than the retention window. Returns how many went.
    pub fn prune_alerts(&self) -> usize {
        let retention = chrono::Duration::seconds(self.config.alert_retention_secs as i64);
        let cutoff = Utc::now() - retention;
        let mut state = self.state.lock();
        let before = state.alerts.len();
        state.alerts.retain(|a| a.timestamp >= cutoff);
        before - state.alerts.len()
    }

    /// Alerts matching `filter`, oldest first.
    pub fn alerts(&self, filter: &AlertFilter) -> Vec<Alert> {
        self.state
            .lock()
            .alerts
            .iter()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect()
    }

    pub fn alert_summary(&self) -> AlertSummary {
        AlertSummary::from_alerts(self.state.lock().alerts.iter())
    }

    pub fn active(&self, execution_id: &str) -> Option<ActiveExecution> {
        self.state
            .lock()
            .active
            .get(execution_id)
            .map(|t| t.snapshot(execution_id))
    }

    pub fn active_executions(&self) -> Vec<ActiveExecution> {
        let state = self.state.lock();
        let mut all: Vec<ActiveExecution> = state
            .active
            .iter()
            .map(|(id, t)| t.snapshot(id))
            .collect();
        all.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        all
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    /// Baseline of a workflow, once it is trusted.
    pub fn baseline(&self, workflow: &str) -> Option<PerformanceBaseline> {
        let state = self.state.lock();
        let baseline = state.baselines.get(workflow)?;
        if baseline.durations.len() < self.config.min_baseline_samples {
            return None;
        }
        Some(PerformanceBaseline {
            workflow: workflow.to_string(),
            average_ms: baseline.average(),
            samples: baseline.durations.len(),
        })
    }

    pub fn stats(&self) -> MonitorStats {
        let state = self.state.lock();
        MonitorStats {
            active: state.active.len(),
            completed: state.completed,
            failed: state.failed,
            cancelled: state.cancelled,
            alerts: AlertSummary::from_alerts(state.alerts.iter()),
        }
    }
}

/// Evaluates every threshold for one execution, skipping alert types it
/// has already raised.
fn check(config: &MonitorConfig, execution_id: &str, tracked: &mut Tracked) -> Vec<Alert> {
    let mut candidates = Vec::new();

    let elapsed = tracked.started.elapsed();
    if elapsed > tracked.timeout {
        candidates.push((
            AlertType::ExecutionTimeout,
            format!("running for {:?}, limit {:?}", elapsed, tracked.timeout),
            json!({ "elapsed_ms": elapsed.as_millis() as u64, "timeout_ms": tracked.timeout.as_millis() as u64 }),
        ));
    }

    if let Some(memory) = tracked.memory_mb {
        if memory > config.memory_threshold_mb {
            candidates.push((
                AlertType::MemoryExceeded,
                format!("using {}MB, threshold {}MB", memory, config.memory_threshold_mb),
                json!({ "memory_mb": memory, "threshold_mb": config.memory_threshold_mb }),
            ));
        }
    }

    if let Some(cpu) = tracked.cpu_percent {
        if cpu > config.cpu_threshold_percent {
            candidates.push((
                AlertType::CpuExceeded,
                format!("using {:.1}% cpu, threshold {:.1}%", cpu, config.cpu_threshold_percent),
                json!({ "cpu_percent": cpu, "threshold_percent": config.cpu_threshold_percent }),
            ));
        }
    }

    if config.error_threshold > 0 && tracked.errors >= config.error_threshold {
        candidates.push((
            AlertType::ErrorThreshold,
            format!("{} errors recorded, threshold {}", tracked.errors, config.error_threshold),
            json!({ "errors": tracked.errors, "threshold": config.error_threshold }),
        ));
    }

    let total = tracked
        .step_count
        .max((tracked.steps_completed + tracked.steps_failed) as usize);
    if tracked.steps_failed > 0 && total > 0 {
        let ratio = tracked.steps_failed as f64 / total as f64;
        if ratio >= config.step_failure_ratio {
            candidates.push((
                AlertType::StepFailure,
                format!("{}/{} steps failed", tracked.steps_failed, total),
                json!({ "failed": tracked.steps_failed, "total": total, "ratio": ratio }),
            ));
        }
    }

    candidates
        .into_iter()
        .filter(|(alert_type, _, _)| tracked.raised.insert(*alert_type))
        .map(|(alert_type, message, data)| {
            Alert::new(alert_type, execution_id, tracked.workflow.clone(), message, data)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(workflow: &str, step_count: usize) -> ExecutionMeta {
        ExecutionMeta {
            workflow: workflow.to_string(),
            step_count,
            timeout: None,
        }
    }

    fn outcome(status: ExecutionStatus, millis: u64) -> ExecutionOutcome {
        ExecutionOutcome {
            status,
            duration: Duration::from_millis(millis),
            steps_completed: 0,
            steps_failed: 0,
            errors: 0,
        }
    }

    #[test]
    fn test_step_failure_alert_raised_once() {
        let monitor = ExecutionMonitor::new(MonitorConfig::default());
        monitor.register("exec-1", meta("build", 2));

        let alerts = monitor.update("exec-1", ExecutionUpdate::step_failed());
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::StepFailure);

        assert!(monitor.update("exec-1", ExecutionUpdate::step_failed()).is_empty());
        assert!(monitor.tick().is_empty());
        assert_eq!(monitor.alerts(&AlertFilter::of_type(AlertType::StepFailure)).len(), 1);
    }

    #[test]
    fn test_step_failure_below_ratio() {
        let monitor = ExecutionMonitor::new(MonitorConfig::default());
        monitor.register("exec-1", meta("build", 4));
        assert!(monitor.update("exec-1", ExecutionUpdate::step_failed()).is_empty());
    }

    #[test]
    fn test_resource_thresholds() {
        let monitor = ExecutionMonitor::new(MonitorConfig::default());
        monitor.register("exec-1", meta("build", 1));

        assert!(monitor.update("exec-1", ExecutionUpdate::usage(512, 50.0)).is_empty());
        let alerts = monitor.update("exec-1", ExecutionUpdate::usage(2048, 95.0));
        let types: Vec<AlertType> = alerts.iter().map(|a| a.alert_type).collect();
        assert_eq!(types, vec![AlertType::MemoryExceeded, AlertType::CpuExceeded]);
        assert_eq!(monitor.alert_summary().critical(), 1);
    }

    #[test]
    fn test_timeout_on_tick() {
        let monitor = ExecutionMonitor::new(MonitorConfig::default());
        monitor.register(
            "exec-1",
            ExecutionMeta {
                timeout: Some(Duration::from_millis(10)),
                ..meta("build", 1)
            },
        );
        std::thread::sleep(Duration::from_millis(30));

        let alerts = monitor.tick();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::ExecutionTimeout);
        assert!(monitor.tick().is_empty());
    }

    #[test]
    fn test_error_threshold() {
        let config = MonitorConfig {
            error_threshold: 2,
            step_failure_ratio: 1.0,
            ..MonitorConfig::default()
        };
        let monitor = ExecutionMonitor::new(config);
        monitor.register("exec-1", meta("build", 10));

        let update = ExecutionUpdate {
            errors: 2,
            ..ExecutionUpdate::default()
        };
        let alerts = monitor.update("exec-1", update);
        assert_eq!(alerts[0].alert_type, AlertType::ErrorThreshold);
    }

    #[test]
    fn test_baseline_needs_prior_samples() {
        let monitor = ExecutionMonitor::new(MonitorConfig::default());

        for i in 0..3 {
            let id = format!("exec-{}", i);
            monitor.register(&id, meta("report", 1));
            assert!(monitor.complete(&id, outcome(ExecutionStatus::Completed, 100)).is_empty());
        }
        let baseline = monitor.baseline("report").unwrap();
        assert_eq!(baseline.samples, 3);
        assert_eq!(baseline.average_ms, 100.0);

        monitor.register("slow", meta("report", 1));
        let alerts = monitor.complete("slow", outcome(ExecutionStatus::Completed, 400));
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::PerformanceDegradation);
        assert_eq!(alerts[0].severity, Severity::Warning);
    }

    #[test]
    fn test_baseline_untrusted_below_minimum() {
        let monitor = ExecutionMonitor::new(MonitorConfig::default());
        monitor.register("a", meta("report", 1));
        monitor.complete("a", outcome(ExecutionStatus::Completed, 100));
        monitor.register("b", meta("report", 1));
        assert!(monitor.complete("b", outcome(ExecutionStatus::Completed, 10_000)).is_empty());
        assert!(monitor.baseline("report").is_none());
    }

    #[test]
    fn test_complete_counts_and_untracks() {
        let monitor = ExecutionMonitor::new(MonitorConfig::default());
        monitor.register("a", meta("wf", 1));
        monitor.register("b", meta("wf", 1));
        monitor.update("a", ExecutionUpdate::step_started("compile"));
        assert_eq!(monitor.active("a").unwrap().current_step.as_deref(), Some("compile"));

        monitor.complete("a", outcome(ExecutionStatus::Failed, 5));
        monitor.complete("b", outcome(ExecutionStatus::Cancelled, 5));
        assert!(monitor.complete("b", outcome(ExecutionStatus::Completed, 5)).is_empty());

        let stats = monitor.stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.completed, 0);
    }

    #[test]
    fn test_alert_cap() {
        let config = MonitorConfig {
            max_alerts: 2,
            ..MonitorConfig::default()
        };
        let monitor = ExecutionMonitor::new(config);
        for i in 0..3 {
            let id = format!("exec-{}", i);
            monitor.register(&id, meta("wf", 1));
            monitor.update(&id, ExecutionUpdate::step_failed());
        }
        assert_eq!(monitor.alerts(&AlertFilter::default()).len(), 2);
        assert_eq!(monitor.prune_alerts(), 0);
    }
}
