//! Engine Configuration
//!
//! Every component owns its own configuration section; [`EngineConfig`]
//! aggregates them and can be loaded from YAML.
//!
//! # Example YAML Format
//!
//! ```yaml
//! max_concurrent_executions: 4
//! default_timeout_ms: 60000
//! queue:
//!   max_size: 100
//!   max_retries: 2
//! resources:
//!   max_memory_mb: 2048
//!   max_cpu: 4.0
//! cache:
//!   default_ttl_secs: 600
//! monitor:
//!   error_threshold: 3
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::error::{EngineError, Result};
use crate::execution::queue::QueueConfig;
use crate::monitoring::MonitorConfig;
use crate::optimizer::OptimizerConfig;
use crate::predictor::PredictorConfig;
use crate::resources::ResourceLimits;

/// Top-level configuration for a [`crate::SequentialExecutionEngine`].
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct EngineConfig {
    /// Executions admitted from the queue at the same time
    pub max_concurrent_executions: usize,

    /// Overall deadline applied when options don't specify one
    pub default_timeout_ms: u64,

    /// How long a request may wait for a resource allocation
    pub allocation_timeout_ms: u64,

    /// Number of finished execution statuses kept for `status()` queries
    pub status_history: usize,

    pub queue: QueueConfig,
    pub resources: ResourceLimits,
    pub cache: CacheConfig,
    pub predictor: PredictorConfig,
    pub optimizer: OptimizerConfig,
    pub monitor: MonitorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_executions: num_cpus::get().max(1),
            default_timeout_ms: 300_000,
            allocation_timeout_ms: 30_000,
            status_history: 1000,
            queue: QueueConfig::default(),
            resources: ResourceLimits::default(),
            cache: CacheConfig::default(),
            predictor: PredictorConfig::default(),
            optimizer: OptimizerConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parses a configuration from a YAML string and validates it.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Default execution deadline.
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Default allocation wait.
    pub fn allocation_timeout(&self) -> Duration {
        Duration::from_millis(self.allocation_timeout_ms)
    }

    /// Checks that sizes are non-zero and thresholds are within range.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_executions == 0 {
            return Err(EngineError::Config(
                "max_concurrent_executions must be at least 1".to_string(),
            ));
        }
        if self.queue.max_size == 0 {
            return Err(EngineError::Config("queue.max_size must be at least 1".to_string()));
        }
        if self.cache.max_size == 0 {
            return Err(EngineError::Config("cache.max_size must be at least 1".to_string()));
        }

        let limits = &self.resources;
        if limits.max_memory_mb < limits.min_memory_mb {
            return Err(EngineError::Config(format!(
                "resources.max_memory_mb ({}) is below the floor ({})",
                limits.max_memory_mb, limits.min_memory_mb
            )));
        }
        if limits.max_cpu < limits.min_cpu || limits.max_cpu <= 0.0 {
            return Err(EngineError::Config(format!(
                "resources.max_cpu ({}) must be positive and above the floor ({})",
                limits.max_cpu, limits.min_cpu
            )));
        }
        if limits.max_slots == 0 {
            return Err(EngineError::Config("resources.max_slots must be at least 1".to_string()));
        }

        if !(0.0..=1.0).contains(&self.optimizer.similarity_threshold) {
            return Err(EngineError::Config(
                "optimizer.similarity_threshold must be within [0, 1]".to_string(),
            ));
        }
        if self.optimizer.max_parallel_steps < 2 || self.optimizer.max_combined_steps < 2 {
            return Err(EngineError::Config(
                "optimizer group sizes must be at least 2".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.monitor.step_failure_ratio) {
            return Err(EngineError::Config(
                "monitor.step_failure_ratio must be within [0, 1]".to_string(),
            ));
        }
        if self.predictor.min_data_points == 0 {
            return Err(EngineError::Config(
                "predictor.min_data_points must be at least 1".to_string(),
            ));
        }

        debug!("Engine configuration validated");
        Ok(())
    }
}

/// Loads an engine configuration from a YAML file.
///
/// # Example
///
/// ```rust,no_run
/// use flowrunner::config::load_config;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = load_config("engine.yaml")?;
///     println!("Queue capacity: {}", config.queue.max_size);
///     Ok(())
/// }
/// ```
pub fn load_config(path: impl AsRef<Path>) -> Result<EngineConfig> {
    let path = path.as_ref();
    info!("Loading engine configuration from: {}", path.display());

    let content = fs::read_to_string(path).map_err(|e| {
        EngineError::Config(format!(
            "failed to read configuration file '{}': {}",
            path.display(),
            e
        ))
    })?;

    EngineConfig::from_yaml_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.max_concurrent_executions >= 1);
        assert_eq!(config.queue.max_size, 1000);
        assert_eq!(config.predictor.min_data_points, 5);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
max_concurrent_executions: 2
queue:
  max_size: 10
resources:
  max_memory_mb: 1024
"#;
        let config = EngineConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.max_concurrent_executions, 2);
        assert_eq!(config.queue.max_size, 10);
        assert_eq!(config.queue.max_retries, 3);
        assert_eq!(config.resources.max_memory_mb, 1024);
        assert_eq!(config.resources.min_memory_mb, 32);
        assert_eq!(config.optimizer.max_parallel_steps, 3);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let yaml = "max_concurrent_executions: 0\n";
        let err = EngineConfig::from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));

        let yaml = "optimizer:\n  similarity_threshold: 1.5\n";
        assert!(EngineConfig::from_yaml_str(yaml).is_err());

        let yaml = "resources:\n  max_memory_mb: 16\n";
        assert!(EngineConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_malformed_yaml() {
        let err = EngineConfig::from_yaml_str("queue: [not, a, map]").unwrap_err();
        assert!(matches!(err, EngineError::Yaml(_)));
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("engine.yaml");
        fs::write(&path, "default_timeout_ms: 1500\ncache:\n  max_size: 5\n").unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.default_timeout(), Duration::from_millis(1500));
        assert_eq!(config.cache.max_size, 5);
    }

    #[test]
    fn test_load_config_missing_file() {
        let result = load_config("/nonexistent/engine.yaml");
        assert!(matches!(result, Err(EngineError::Config(_))));
    }
}
