//! Execution Context and Result
//!
//! [`ExecutionContext`] is the mutable per-run state: a key/value store plus
//! identity, log entries, metrics, step records and errors. It is owned by
//! exactly one in-flight execution. Concurrent members of a parallel group
//! work on [`ExecutionContext::fork`]s that are merged back afterwards.
//!
//! [`ExecutionResult`] is the well-formed outcome every caller receives.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::timeline::{ExecutionTimeline, StepSpan};

/// Severity of a context log entry.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for log::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Info => log::Level::Info,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Error => log::Level::Error,
        }
    }
}

/// A structured log entry recorded during an execution.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, Value>,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of one (non-synthetic) step inside an execution.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StepRecord {
    pub name: String,
    pub success: bool,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub attempts: u32,
}

/// Per-run mutable state.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    execution_id: String,
    data: BTreeMap<String, Value>,
    sensitive_keys: BTreeSet<String>,
    logs: Vec<LogEntry>,
    metrics: BTreeMap<String, f64>,
    counters: BTreeMap<String, u64>,
    step_records: Vec<StepRecord>,
    errors: Vec<String>,
    started_at: DateTime<Utc>,
    timeline: ExecutionTimeline,
}

impl ExecutionContext {
    /// Creates an empty context with a fresh execution id.
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4().to_string())
    }

    /// Creates an empty context with the given execution id.
    pub fn with_id(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            data: BTreeMap::new(),
            sensitive_keys: BTreeSet::new(),
            logs: Vec::new(),
            metrics: BTreeMap::new(),
            counters: BTreeMap::new(),
            step_records: Vec::new(),
            errors: Vec::new(),
            started_at: Utc::now(),
            timeline: ExecutionTimeline::new(),
        }
    }

    /// Builder form of [`ExecutionContext::set`].
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    /// Builder form of [`ExecutionContext::set_sensitive`].
    pub fn with_sensitive(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_sensitive(key, value);
        self
    }

    /// Same context under another execution id.
    pub fn with_execution_id(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = execution_id.into();
        self
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.timeline.elapsed()
    }

    // --- key/value store ---

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.data.insert(key.into(), value.into());
    }

    /// Stores a value and flags the key as sensitive.
    ///
    /// Sensitive keys never take part in cache fingerprints.
    pub fn set_sensitive(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        self.sensitive_keys.insert(key.clone());
        self.data.insert(key, value.into());
    }

    pub fn mark_sensitive(&mut self, key: impl Into<String>) {
        self.sensitive_keys.insert(key.into());
    }

    pub fn is_sensitive(&self, key: &str) -> bool {
        self.sensitive_keys.contains(key)
    }

    pub fn has_sensitive_data(&self) -> bool {
        !self.sensitive_keys.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.data.get(key).and_then(Value::as_bool)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.data.remove(key)
    }

    pub fn data(&self) -> &BTreeMap<String, Value> {
        &self.data
    }

    /// Data with sensitive keys left out.
    pub fn public_data(&self) -> BTreeMap<String, Value> {
        self.data
            .iter()
            .filter(|(k, _)| !self.sensitive_keys.contains(*k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    // --- logging ---

    /// Appends a log entry and forwards it to the `log` facade.
    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        self.log_with(level, message, BTreeMap::new());
    }

    pub fn log_with(
        &mut self,
        level: LogLevel,
        message: impl Into<String>,
        fields: BTreeMap<String, Value>,
    ) {
        let message = message.into();
        let facade_level: log::Level = level.into();
        log::log!(
            target: "flowrunner::context",
            facade_level,
            "[{}] {}",
            self.execution_id,
            message
        );
        self.logs.push(LogEntry {
            level,
            message,
            fields,
            timestamp: Utc::now(),
        });
    }

    pub fn logs(&self) -> &[LogEntry] {
        &self.logs
    }

    // --- metrics ---

    pub fn record_metric(&mut self, name: impl Into<String>, value: f64) {
        self.metrics.insert(name.into(), value);
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }

    pub fn metrics(&self) -> &BTreeMap<String, f64> {
        &self.metrics
    }

    pub fn increment(&mut self, name: &str) {
        self.add_to_counter(name, 1);
    }

    pub fn add_to_counter(&mut self, name: &str, amount: u64) {
        *self.counters.entry(name.to_string()).or_insert(0) += amount;
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    pub fn counters(&self) -> &BTreeMap<String, u64> {
        &self.counters
    }

    // --- results ---

    pub fn record_step(&mut self, record: StepRecord) {
        self.step_records.push(record);
    }

    pub fn step_records(&self) -> &[StepRecord] {
        &self.step_records
    }

    /// Latest record for a step name.
    pub fn step_record(&self, name: &str) -> Option<&StepRecord> {
        self.step_records.iter().rev().find(|r| r.name == name)
    }

    /// True when the named step has a successful record.
    pub fn has_completed(&self, name: &str) -> bool {
        self.step_record(name).map(|r| r.success).unwrap_or(false)
    }

    pub fn record_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn timeline(&self) -> &ExecutionTimeline {
        &self.timeline
    }

    pub fn timeline_mut(&mut self) -> &mut ExecutionTimeline {
        &mut self.timeline
    }

    // --- forking ---

    /// Creates a child context for a concurrently running group member.
    ///
    /// The child sees the parent's data but starts with empty logs,
    /// records, metrics and errors.
    pub fn fork(&self) -> ExecutionContext {
        ExecutionContext {
            execution_id: self.execution_id.clone(),
            data: self.data.clone(),
            sensitive_keys: self.sensitive_keys.clone(),
            logs: Vec::new(),
            metrics: BTreeMap::new(),
            counters: BTreeMap::new(),
            step_records: Vec::new(),
            errors: Vec::new(),
            started_at: self.started_at,
            timeline: ExecutionTimeline::new(),
        }
    }

    /// Folds a forked child back into this context.
    ///
    /// Values the child changed overwrite the parent's, everything else is appended.
    pub fn merge(&mut self, child: ExecutionContext) {
        for (key, value) in child.data {
            if self.data.get(&key) != Some(&value) {
                self.data.insert(key, value);
            }
        }
        self.sensitive_keys.extend(child.sensitive_keys);
        self.logs.extend(child.logs);
        self.metrics.extend(child.metrics);
        for (name, count) in child.counters {
            *self.counters.entry(name).or_insert(0) += count;
        }
        self.step_records.extend(child.step_records);
        self.errors.extend(child.errors);
        self.timeline.absorb(child.timeline);
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle state of an execution.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Submitted,
    Queued,
    CacheChecked,
    Predicted,
    ResourceAllocated,
    Optimized,
    Scheduled,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Queued => "queued",
            Self::CacheChecked => "cache_checked",
            Self::Predicted => "predicted",
            Self::ResourceAllocated => "resource_allocated",
            Self::Optimized => "optimized",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outcome handed back to callers of `execute`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ExecutionResult {
    pub execution_id: String,
    pub workflow: String,
    pub version: String,
    pub success: bool,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Machine-readable kind of `error`, see [`crate::EngineError::kind`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    pub step_results: Vec<StepRecord>,
    /// When each executed step ran, relative to the start of the execution
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub timings: Vec<StepSpan>,
    /// Final context data, sensitive keys excluded
    #[serde(default)]
    pub data: BTreeMap<String, Value>,
    pub duration_ms: u64,
    #[serde(default)]
    pub from_cache: bool,
    #[serde(default)]
    pub applied_optimizations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicted_duration_ms: Option<u64>,
    pub attempts: u32,
}

impl ExecutionResult {
    /// A failed result carrying whatever partial step output exists.
    pub fn failure(
        ctx: &ExecutionContext,
        workflow: &str,
        version: &str,
        status: ExecutionStatus,
        error: &crate::EngineError,
    ) -> Self {
        Self {
            execution_id: ctx.execution_id().to_string(),
            workflow: workflow.to_string(),
            version: version.to_string(),
            success: false,
            status,
            error: Some(error.to_string()),
            error_kind: Some(error.kind().to_string()),
            step_results: ctx.step_records().to_vec(),
            timings: ctx.timeline().spans(),
            data: ctx.public_data(),
            duration_ms: ctx.elapsed().as_millis() as u64,
            from_cache: false,
            applied_optimizations: Vec::new(),
            predicted_duration_ms: None,
            attempts: 1,
        }
    }

    /// Number of failed step records.
    pub fn failed_steps(&self) -> usize {
        self.step_results.iter().filter(|r| !r.success).count()
    }
}
