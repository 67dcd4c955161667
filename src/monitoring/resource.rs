//! Process Resource Sampling
//!
//! Reads the engine process's CPU and memory through `sysinfo` and splits
//! each reading across the running executions, weighted by the memory they
//! were granted. The monitor's memory and CPU thresholds work off these
//! attributed figures.

use std::time::{Duration, Instant};

use sysinfo::{get_current_pid, Pid, ProcessRefreshKind, System};

use crate::error::{EngineError, Result};

/// One reading of the whole engine process.
#[derive(Debug, Clone, Copy)]
pub struct ResourceSample {
    pub taken_at: Instant,
    /// Percent of one core; above 100 when several cores are busy
    pub cpu_percent: f32,
    pub memory_mb: u64,
}

/// Part of a sample charged to one execution.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageShare {
    pub execution_id: String,
    pub memory_mb: u64,
    pub cpu_percent: f64,
}

impl UsageShare {
    /// CPU in cores, the unit resource allocations use.
    pub fn cpu_cores(&self) -> f64 {
        self.cpu_percent / 100.0
    }
}

impl ResourceSample {
    /// Splits this sample by each execution's granted memory.
    ///
    /// Executions granted nothing are charged nothing; if no execution holds
    /// memory the result is empty.
    pub fn split(&self, granted: &[(String, u64)]) -> Vec<UsageShare> {
        let total: u64 = granted.iter().map(|(_, mb)| mb).sum();
        if total == 0 {
            return Vec::new();
        }

        granted
            .iter()
            .map(|(id, mb)| {
                let share = *mb as f64 / total as f64;
                UsageShare {
                    execution_id: id.clone(),
                    memory_mb: (self.memory_mb as f64 * share).round() as u64,
                    cpu_percent: self.cpu_percent as f64 * share,
                }
            })
            .collect()
    }
}

/// Rate-limited reader for the current process.
///
/// `sysinfo` derives CPU usage from the time between two refreshes, so the
/// first [`ResourceSampler::sample`] call only primes it and returns `None`.
pub struct ResourceSampler {
    system: System,
    pid: Pid,
    primed: bool,
    last: Option<Instant>,
    min_interval: Duration,
    taken: u64,
}

impl ResourceSampler {
    pub fn new() -> Result<Self> {
        let pid = get_current_pid().map_err(|e| {
            EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("cannot determine process id: {}", e),
            ))
        })?;

        Ok(Self {
            system: System::new(),
            pid,
            primed: false,
            last: None,
            min_interval: Duration::from_millis(250),
            taken: 0,
        })
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Reads the process, or returns `None` while priming, when called
    /// again within the minimum interval, or when the process is unreadable.
    pub fn sample(&mut self) -> Option<ResourceSample> {
        let now = Instant::now();
        let refresh = ProcessRefreshKind::new().with_cpu().with_memory();

        if !self.primed {
            self.system.refresh_processes_specifics(refresh);
            self.primed = true;
            self.last = Some(now);
            return None;
        }
        if self.last.is_some_and(|last| now.duration_since(last) < self.min_interval) {
            return None;
        }

        self.system.refresh_processes_specifics(refresh);
        self.last = Some(now);

        let process = self.system.process(self.pid)?;
        self.taken += 1;
        Some(ResourceSample {
            taken_at: now,
            cpu_percent: process.cpu_usage(),
            memory_mb: process.memory() / (1024 * 1024),
        })
    }

    /// Samples returned so far, priming excluded.
    pub fn taken(&self) -> u64 {
        self.taken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn sample(cpu_percent: f32, memory_mb: u64) -> ResourceSample {
        ResourceSample {
            taken_at: Instant::now(),
            cpu_percent,
            memory_mb,
        }
    }

    #[test]
    fn test_first_sample_primes() {
        let mut sampler = ResourceSampler::new().unwrap();
        assert!(sampler.sample().is_none());
        assert_eq!(sampler.taken(), 0);

        thread::sleep(Duration::from_millis(300));
        let reading = sampler.sample().expect("second call reads the process");
        assert!(reading.memory_mb > 0);
        assert_eq!(sampler.taken(), 1);
    }

    #[test]
    fn test_min_interval_rate_limits() {
        let mut sampler = ResourceSampler::new()
            .unwrap()
            .with_min_interval(Duration::from_millis(200));
        sampler.sample();
        assert!(sampler.sample().is_none());

        thread::sleep(Duration::from_millis(250));
        assert!(sampler.sample().is_some());
    }

    #[test]
    fn test_split_by_granted_memory() {
        let granted = vec![("a".to_string(), 300), ("b".to_string(), 100)];
        let shares = sample(80.0, 200).split(&granted);

        assert_eq!(shares.len(), 2);
        assert_eq!(shares[0].execution_id, "a");
        assert_eq!(shares[0].memory_mb, 150);
        assert!((shares[0].cpu_percent - 60.0).abs() < 1e-9);
        assert!((shares[1].cpu_cores() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_split_without_grants() {
        assert!(sample(50.0, 100).split(&[]).is_empty());
        assert!(sample(50.0, 100).split(&[("idle".to_string(), 0)]).is_empty());
    }
}
