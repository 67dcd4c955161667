//! Execution Cache
//!
//! Memoizes successful [`ExecutionResult`]s keyed by a fingerprint of the
//! workflow identity and a whitelisted subset of the context.
//!
//! The fingerprint is the SHA-256 of a canonical JSON document holding the
//! workflow name, version, step names and the context fields that take part.
//! Keys flagged sensitive on the context never take part; keys whose name
//! matches a sensitive pattern are left out as well when requested.
//!
//! Expired entries are invisible to lookups and removed lazily. When the
//! table is full the single oldest entry is evicted before an insert.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use log::{debug, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::execution::context::{ExecutionContext, ExecutionResult};
use crate::workflow::Workflow;

/// Cache configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Maximum number of entries
    pub max_size: usize,
    /// TTL used when a request doesn't specify one
    pub default_ttl_secs: u64,
    /// When set, only these context keys take part in fingerprints
    pub key_fields: Option<Vec<String>>,
    /// Case-insensitive substrings marking a context key as sensitive
    pub sensitive_patterns: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 1000,
            default_ttl_secs: 3600,
            key_fields: None,
            sensitive_patterns: ["password", "secret", "token", "api_key", "credential"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    result: ExecutionResult,
    workflow: String,
    version: String,
    inserted_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.inserted_at.elapsed() >= self.ttl
    }
}

#[derive(Serialize)]
struct FingerprintInput<'a> {
    workflow: &'a str,
    version: &'a str,
    steps: Vec<&'a str>,
    context: BTreeMap<&'a str, &'a Value>,
}

/// Cache counters.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub entries: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl CacheStats {
    /// Fraction of lookups that were hits.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct CacheTable {
    entries: HashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
    stores: u64,
    evictions: u64,
    expirations: u64,
}

/// Fingerprint-keyed store of successful execution results.
pub struct ExecutionCache {
    config: CacheConfig,
    table: Mutex<CacheTable>,
}

impl ExecutionCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            table: Mutex::new(CacheTable::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.config.default_ttl_secs)
    }

    fn matches_sensitive_pattern(&self, key: &str) -> bool {
        let key = key.to_ascii_lowercase();
        self.config
            .sensitive_patterns
            .iter()
            .any(|p| key.contains(&p.to_ascii_lowercase()))
    }

    /// Computes the cache key for a workflow run against a context.
    pub fn fingerprint(
        &self,
        workflow: &Workflow,
        ctx: &ExecutionContext,
        exclude_sensitive: bool,
    ) -> String {
        let context = ctx
            .data()
            .iter()
            .filter(|(key, _)| !ctx.is_sensitive(key))
            .filter(|(key, _)| !(exclude_sensitive && self.matches_sensitive_pattern(key)))
            .filter(|(key, _)| match &self.config.key_fields {
                Some(fields) => fields.iter().any(|f| f == *key),
                None => true,
            })
            .map(|(key, value)| (key.as_str(), value))
            .collect();

        let input = FingerprintInput {
            workflow: workflow.name(),
            version: workflow.version(),
            steps: workflow.steps().iter().map(|s| s.name()).collect(),
            context,
        };

        // serializing borrowed strings and JSON values cannot fail
        let canonical = serde_json::to_vec(&input).unwrap_or_default();
        hex::encode(Sha256::digest(&canonical))
    }

    /// Returns the cached result, or `None` on a miss.
    ///
    /// A hit is marked with `from_cache = true`.
    pub fn lookup(
        &self,
        workflow: &Workflow,
        ctx: &ExecutionContext,
        exclude_sensitive: bool,
    ) -> Option<ExecutionResult> {
        if !self.config.enabled {
            return None;
        }

        let key = self.fingerprint(workflow, ctx, exclude_sensitive);
        let mut table = self.table.lock();

        let expired = match table.entries.get(&key) {
            None => {
                table.misses += 1;
                return None;
            }
            Some(entry) => entry.is_expired(),
        };

        if expired {
            table.entries.remove(&key);
            table.expirations += 1;
            table.misses += 1;
            debug!("Cache entry for '{}' expired", workflow.id());
            return None;
        }

        table.hits += 1;
        let mut result = table.entries.get(&key)?.result.clone();
        result.from_cache = true;
        debug!("Cache hit for '{}' ({})", workflow.id(), &key[..12]);
        Some(result)
    }

    /// Stores a successful result. Failed results are ignored.
    ///
    /// Returns true when the result was stored.
    pub fn store(
        &self,
        workflow: &Workflow,
        ctx: &ExecutionContext,
        result: &ExecutionResult,
        ttl: Option<Duration>,
        exclude_sensitive: bool,
    ) -> bool {
        if !self.config.enabled || !result.success {
            return false;
        }

        let key = self.fingerprint(workflow, ctx, exclude_sensitive);
        let ttl = ttl.unwrap_or_else(|| self.default_ttl());
        let mut table = self.table.lock();

        if !table.entries.contains_key(&key) && table.entries.len() >= self.config.max_size {
            let oldest = table
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.inserted_at)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                table.entries.remove(&oldest);
                table.evictions += 1;
                debug!("Evicted oldest cache entry to make room");
            }
        }

        let mut stored = result.clone();
        stored.from_cache = false;
        table.entries.insert(
            key,
            CacheEntry {
                result: stored,
                workflow: workflow.name().to_string(),
                version: workflow.version().to_string(),
                inserted_at: Instant::now(),
                ttl,
            },
        );
        table.stores += 1;
        true
    }

    /// Drops all entries of a workflow, optionally only one version.
    ///
    /// Returns the number of entries removed.
    pub fn invalidate(&self, workflow_name: &str, version: Option<&str>) -> usize {
        let mut table = self.table.lock();
        let before = table.entries.len();
        table.entries.retain(|_, entry| {
            !(entry.workflow == workflow_name && version.map_or(true, |v| entry.version == v))
        });
        let removed = before - table.entries.len();
        if removed > 0 {
            info!(
                "Invalidated {} cache entries for '{}'{}",
                removed,
                workflow_name,
                version.map(|v| format!(" v{}", v)).unwrap_or_default()
            );
        }
        removed
    }

    pub fn clear(&self) {
        self.table.lock().entries.clear();
    }

    /// Removes every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut table = self.table.lock();
        let before = table.entries.len();
        table.entries.retain(|_, entry| !entry.is_expired());
        let removed = before - table.entries.len();
        table.expirations += removed as u64;
        removed
    }

    pub fn len(&self) -> usize {
        self.table.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let table = self.table.lock();
        CacheStats {
            entries: table.entries.len(),
            max_size: self.config.max_size,
            hits: table.hits,
            misses: table.misses,
            stores: table.stores,
            evictions: table.evictions,
            expirations: table.expirations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::context::ExecutionStatus;
    use crate::workflow::{Step, StepResult};
    use std::thread;

    fn workflow(name: &str, version: &str) -> Workflow {
        Workflow::new(name, version)
            .with_step(Step::from_fn("a", |_| StepResult::success()))
            .with_step(Step::from_fn("b", |_| StepResult::success()))
    }

    fn result(id: &str, success: bool) -> ExecutionResult {
        ExecutionResult {
            execution_id: id.to_string(),
            workflow: "wf".to_string(),
            version: "1".to_string(),
            success,
            status: if success {
                ExecutionStatus::Completed
            } else {
                ExecutionStatus::Failed
            },
            error: None,
            error_kind: None,
            step_results: Vec::new(),
            timings: Vec::new(),
            data: BTreeMap::new(),
            duration_ms: 10,
            from_cache: false,
            applied_optimizations: Vec::new(),
            predicted_duration_ms: None,
            attempts: 1,
        }
    }

    fn cache(max_size: usize) -> ExecutionCache {
        ExecutionCache::new(CacheConfig {
            max_size,
            ..CacheConfig::default()
        })
    }

    #[test]
    fn test_store_then_lookup() {
        let cache = cache(10);
        let wf = workflow("wf", "1");
        let ctx = ExecutionContext::new().with_value("branch", "main");

        assert!(cache.lookup(&wf, &ctx, true).is_none());
        assert!(cache.store(&wf, &ctx, &result("e1", true), Some(Duration::from_secs(60)), true));

        let hit = cache.lookup(&wf, &ctx, true).unwrap();
        assert_eq!(hit.execution_id, "e1");
        assert!(hit.from_cache);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_entry_expires_after_ttl() {
        let cache = cache(10);
        let wf = workflow("wf", "1");
        let ctx = ExecutionContext::new();

        cache.store(&wf, &ctx, &result("e1", true), Some(Duration::from_millis(30)), true);
        assert!(cache.lookup(&wf, &ctx, true).is_some());

        thread::sleep(Duration::from_millis(60));
        assert!(cache.lookup(&wf, &ctx, true).is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn test_evicts_single_oldest_entry() {
        let cache = cache(2);
        let wf = workflow("wf", "1");
        let contexts: Vec<ExecutionContext> = (0..3)
            .map(|i| ExecutionContext::new().with_value("n", i))
            .collect();

        for (i, ctx) in contexts.iter().enumerate() {
            cache.store(&wf, ctx, &result(&format!("e{}", i), true), None, true);
            thread::sleep(Duration::from_millis(2));
        }

        assert_eq!(cache.len(), 2);
        assert!(cache.lookup(&wf, &contexts[0], true).is_none());
        assert!(cache.lookup(&wf, &contexts[1], true).is_some());
        assert!(cache.lookup(&wf, &contexts[2], true).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_failed_results_not_cached() {
        let cache = cache(10);
        let wf = workflow("wf", "1");
        let ctx = ExecutionContext::new();

        assert!(!cache.store(&wf, &ctx, &result("e1", false), None, true));
        assert!(cache.lookup(&wf, &ctx, true).is_none());
    }

    #[test]
    fn test_sensitive_fields_excluded_from_fingerprint() {
        let cache = cache(10);
        let wf = workflow("wf", "1");

        let a = ExecutionContext::new().with_value("user", "ada").with_value("db_password", "one");
        let b = ExecutionContext::new().with_value("user", "ada").with_value("db_password", "two");
        assert_eq!(cache.fingerprint(&wf, &a, true), cache.fingerprint(&wf, &b, true));
        assert_ne!(cache.fingerprint(&wf, &a, false), cache.fingerprint(&wf, &b, false));

        // explicitly flagged keys never take part
        let c = ExecutionContext::new().with_value("user", "ada").with_sensitive("session", "x");
        let d = ExecutionContext::new().with_value("user", "ada").with_sensitive("session", "y");
        assert_eq!(cache.fingerprint(&wf, &c, false), cache.fingerprint(&wf, &d, false));
    }

    #[test]
    fn test_key_fields_whitelist() {
        let cache = ExecutionCache::new(CacheConfig {
            key_fields: Some(vec!["branch".to_string()]),
            ..CacheConfig::default()
        });
        let wf = workflow("wf", "1");

        let a = ExecutionContext::new().with_value("branch", "main").with_value("run", 1);
        let b = ExecutionContext::new().with_value("branch", "main").with_value("run", 2);
        let c = ExecutionContext::new().with_value("branch", "dev");
        assert_eq!(cache.fingerprint(&wf, &a, true), cache.fingerprint(&wf, &b, true));
        assert_ne!(cache.fingerprint(&wf, &a, true), cache.fingerprint(&wf, &c, true));
    }

    #[test]
    fn test_fingerprint_depends_on_identity() {
        let cache = cache(10);
        let ctx = ExecutionContext::new();
        let v1 = cache.fingerprint(&workflow("wf", "1"), &ctx, true);
        let v2 = cache.fingerprint(&workflow("wf", "2"), &ctx, true);
        assert_ne!(v1, v2);
        assert_eq!(v1.len(), 64);
    }

    #[test]
    fn test_invalidate() {
        let cache = cache(10);
        let ctx = ExecutionContext::new();
        cache.store(&workflow("wf", "1"), &ctx, &result("a", true), None, true);
        cache.store(&workflow("wf", "2"), &ctx, &result("b", true), None, true);
        cache.store(&workflow("other", "1"), &ctx, &result("c", true), None, true);

        assert_eq!(cache.invalidate("wf", Some("1")), 1);
        assert_eq!(cache.invalidate("wf", None), 1);
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_purge_expired() {
        let cache = cache(10);
        let ctx = ExecutionContext::new();
        cache.store(&workflow("a", "1"), &ctx, &result("a", true), Some(Duration::from_millis(10)), true);
        cache.store(&workflow("b", "1"), &ctx, &result("b", true), Some(Duration::from_secs(60)), true);

        thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_disabled_cache() {
        let cache = ExecutionCache::new(CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        });
        let wf = workflow("wf", "1");
        let ctx = ExecutionContext::new();
        assert!(!cache.store(&wf, &ctx, &result("e", true), None, true));
        assert!(cache.lookup(&wf, &ctx, true).is_none());
    }
}
