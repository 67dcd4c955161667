//! Execution Options
//!
//! Per-request settings passed to [`crate::SequentialExecutionEngine::execute`].

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::queue::Priority;
use crate::resources::AllocationStrategy;
use crate::workflow::ResourceRequirements;

/// How the engine runs a workflow.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// Full pipeline: prediction, optimization and grouped execution
    #[default]
    Basic,
    /// Steps run one after another exactly as declared, without optimization
    Simple,
}

impl ExecutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Simple => "simple",
        }
    }
}

impl fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "basic" => Ok(Self::Basic),
            "simple" => Ok(Self::Simple),
            other => Err(format!("unknown execution strategy: '{}'", other)),
        }
    }
}

/// Options controlling a single execution request.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ExecutionOptions {
    pub strategy: ExecutionStrategy,
    pub priority: Priority,

    /// TTL of the cached result; falls back to the cache default
    #[serde(with = "optional_millis")]
    pub cache_ttl: Option<Duration>,

    /// Leave context keys that look sensitive out of the cache fingerprint
    pub exclude_sensitive_from_cache: bool,

    /// Skip the cache lookup and store for this request
    pub bypass_cache: bool,

    pub resource_strategy: AllocationStrategy,

    /// Overall deadline; falls back to the engine default
    #[serde(with = "optional_millis")]
    pub timeout: Option<Duration>,

    /// Times a failed execution is re-queued
    pub retries: u32,

    /// Explicit resource request overriding the prediction
    pub resources: Option<ResourceRequirements>,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            strategy: ExecutionStrategy::Basic,
            priority: Priority::Normal,
            cache_ttl: None,
            exclude_sensitive_from_cache: true,
            bypass_cache: false,
            resource_strategy: AllocationStrategy::Fifo,
            timeout: None,
            retries: 0,
            resources: None,
        }
    }
}

impl ExecutionOptions {
    pub fn with_strategy(mut self, strategy: ExecutionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.bypass_cache = true;
        self
    }

    pub fn with_resource_strategy(mut self, strategy: AllocationStrategy) -> Self {
        self.resource_strategy = strategy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_resources(mut self, memory_mb: u64, cpu: f64) -> Self {
        self.resources = Some(ResourceRequirements::new(memory_mb, cpu));
        self
    }
}

/// Serializes `Option<Duration>` as optional milliseconds.
mod optional_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
