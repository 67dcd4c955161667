//! Alerts
//!
//! Immutable records raised when a monitored threshold is crossed. Once
//! stored an alert is never modified; it only ages out of the retention
//! window.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Alert severity, ordered from least to most severe.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of threshold that was crossed.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    ExecutionTimeout,
    MemoryExceeded,
    CpuExceeded,
    ErrorThreshold,
    StepFailure,
    PerformanceDegradation,
}

impl AlertType {
    pub fn severity(&self) -> Severity {
        match self {
            Self::ExecutionTimeout => Severity::Error,
            Self::MemoryExceeded => Severity::Critical,
            Self::CpuExceeded => Severity::Warning,
            Self::ErrorThreshold => Severity::Error,
            Self::StepFailure => Severity::Error,
            Self::PerformanceDegradation => Severity::Warning,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExecutionTimeout => "execution_timeout",
            Self::MemoryExceeded => "memory_exceeded",
            Self::CpuExceeded => "cpu_exceeded",
            Self::ErrorThreshold => "error_threshold",
            Self::StepFailure => "step_failure",
            Self::PerformanceDegradation => "performance_degradation",
        }
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raised alert.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Alert {
    pub id: String,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub execution_id: String,
    pub workflow: String,
    pub message: String,
    #[serde(default)]
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(
        alert_type: AlertType,
        execution_id: impl Into<String>,
        workflow: impl Into<String>,
        message: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            alert_type,
            severity: alert_type.severity(),
            execution_id: execution_id.into(),
            workflow: workflow.into(),
            message: message.into(),
            data,
            timestamp: Utc::now(),
        }
    }
}

/// Selects alerts; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub alert_type: Option<AlertType>,
    /// Alerts at least this severe
    pub min_severity: Option<Severity>,
    /// Alerts raised at or after this instant
    pub since: Option<DateTime<Utc>>,
    pub execution_id: Option<String>,
}

impl AlertFilter {
    pub fn of_type(alert_type: AlertType) -> Self {
        Self {
            alert_type: Some(alert_type),
            ..Self::default()
        }
    }

    pub fn min_severity(mut self, severity: Severity) -> Self {
        self.min_severity = Some(severity);
        self
    }

    pub fn since(mut self, instant: DateTime<Utc>) -> Self {
        self.since = Some(instant);
        self
    }

    pub fn for_execution(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }

    pub fn matches(&self, alert: &Alert) -> bool {
        self.alert_type.map_or(true, |t| alert.alert_type == t)
            && self.min_severity.map_or(true, |s| alert.severity >= s)
            && self.since.map_or(true, |t| alert.timestamp >= t)
            && self
                .execution_id
                .as_deref()
                .map_or(true, |id| alert.execution_id == id)
    }
}

/// Alert counts by severity and type.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct AlertSummary {
    pub total: usize,
    pub by_severity: BTreeMap<String, usize>,
    pub by_type: BTreeMap<String, usize>,
}

impl AlertSummary {
    pub fn from_alerts<'a>(alerts: impl IntoIterator<Item = &'a Alert>) -> Self {
        let mut summary = Self::default();
        for alert in alerts {
            summary.total += 1;
            *summary
                .by_severity
                .entry(alert.severity.as_str().to_string())
                .or_insert(0) += 1;
            *summary
                .by_type
                .entry(alert.alert_type.as_str().to_string())
                .or_insert(0) += 1;
        }
        summary
    }

    /// Number of critical alerts.
    pub fn critical(&self) -> usize {
        self.by_severity.get("critical").copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    #[test]
    fn test_alert_severity_follows_type() {
        let alert = Alert::new(AlertType::MemoryExceeded, "exec-1", "build", "too much", json!({}));
        assert_eq!(alert.severity, Severity::Critical);
        assert_eq!(AlertType::CpuExceeded.severity(), Severity::Warning);
        assert!(Severity::Critical > Severity::Error);
    }

    #[test]
    fn test_filter() {
        let timeout = Alert::new(AlertType::ExecutionTimeout, "exec-1", "build", "slow", Value::Null);
        let cpu = Alert::new(AlertType::CpuExceeded, "exec-2", "build", "busy", Value::Null);

        let filter = AlertFilter::default().min_severity(Severity::Error);
        assert!(filter.matches(&timeout));
        assert!(!filter.matches(&cpu));

        assert!(AlertFilter::of_type(AlertType::CpuExceeded).matches(&cpu));
        assert!(!AlertFilter::default().for_execution("exec-1").matches(&cpu));

        let later = Utc::now() + ChronoDuration::seconds(60);
        assert!(!AlertFilter::default().since(later).matches(&timeout));
    }

    #[test]
    fn test_summary() {
        let alerts = vec![
            Alert::new(AlertType::StepFailure, "a", "wf", "x", Value::Null),
            Alert::new(AlertType::StepFailure, "b", "wf", "x", Value::Null),
            Alert::new(AlertType::MemoryExceeded, "c", "wf", "x", Value::Null),
        ];
        let summary = AlertSummary::from_alerts(&alerts);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.by_type["step_failure"], 2);
        assert_eq!(summary.by_severity["error"], 2);
        assert_eq!(summary.critical(), 1);
    }
}
