//! Resource ceilings for sandboxes and the CPU budget allocators.

use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::container::ResourceLimits;

/// Sandbox resource policy, loaded from the `[sandbox]` config section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcePolicy {
    /// Wall-clock limit enforced inside the sandbox, in minutes.
    pub timeout_minutes: u32,
    /// Maximum concurrent processes/threads.
    pub max_processes: u32,
    /// Memory ceiling in bytes.
    pub memory_bytes: u64,
    /// Writable layer ceiling in bytes.
    pub disk_bytes: u64,
    /// Pass the disk ceiling to the runtime. Needs a storage driver with quota support.
    pub enforce_disk_quota: bool,
    /// Signal sent on teardown.
    pub stop_signal: String,
    /// Fixed CPU budget. When unset the budget is derived from host load.
    pub cpus: Option<f64>,
    /// Lower bound of the host-derived CPU budget.
    pub min_cpus: f64,
    /// Upper bound of the host-derived CPU budget.
    pub max_cpus: f64,
    /// Working directory inside the sandbox; the project workspace is mounted here.
    pub workdir: String,
}

impl Default for ResourcePolicy {
    fn default() -> Self {
        Self {
            timeout_minutes: 15,
            max_processes: 25,
            memory_bytes: 100 * 1024 * 1024,
            disk_bytes: 50 * 1024 * 1024,
            enforce_disk_quota: true,
            stop_signal: "SIGKILL".to_string(),
            cpus: None,
            min_cpus: 0.1,
            max_cpus: 1.0,
            workdir: "/code".to_string(),
        }
    }
}

impl ResourcePolicy {
    /// Ceilings for one sandbox given the allocated CPU budget.
    pub fn limits(&self, cpus: f64) -> ResourceLimits {
        ResourceLimits {
            memory_bytes: Some(self.memory_bytes),
            pids_limit: Some(self.max_processes),
            cpus: Some(cpus),
            disk_bytes: self.enforce_disk_quota.then_some(self.disk_bytes),
        }
    }

    /// Timeout argument for the `timeout` entrypoint, in seconds.
    pub fn timeout_arg(&self) -> String {
        (u64::from(self.timeout_minutes) * 60).to_string()
    }

    /// The allocator matching this policy.
    pub fn cpu_allocator(&self) -> Arc<dyn CpuAllocator> {
        match self.cpus {
            Some(cpus) => Arc::new(FixedCpuAllocator::new(cpus)),
            None => Arc::new(HostCpuAllocator::new(self.min_cpus, self.max_cpus)),
        }
    }
}

/// Source of the per-sandbox CPU budget, as a fraction of cores.
#[async_trait]
pub trait CpuAllocator: Send + Sync {
    async fn allocate(&self) -> f64;
}

/// Always hands out the same budget.
#[derive(Debug, Clone, Copy)]
pub struct FixedCpuAllocator {
    cpus: f64,
}

impl FixedCpuAllocator {
    pub fn new(cpus: f64) -> Self {
        Self { cpus }
    }
}

#[async_trait]
impl CpuAllocator for FixedCpuAllocator {
    async fn allocate(&self) -> f64 {
        self.cpus
    }
}

/// Derives the budget from idle host capacity: `cores - loadavg(1m)`,
/// clamped to `[min_cpus, max_cpus]`.
#[derive(Debug, Clone, Copy)]
pub struct HostCpuAllocator {
    min_cpus: f64,
    max_cpus: f64,
}

impl HostCpuAllocator {
    pub fn new(min_cpus: f64, max_cpus: f64) -> Self {
        Self {
            min_cpus: min_cpus.min(max_cpus),
            max_cpus,
        }
    }
}

#[async_trait]
impl CpuAllocator for HostCpuAllocator {
    async fn allocate(&self) -> f64 {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1) as f64;

        let load = match tokio::fs::read_to_string("/proc/loadavg").await {
            Ok(contents) => parse_loadavg(&contents).unwrap_or(0.0),
            Err(e) => {
                debug!("reading /proc/loadavg failed, assuming idle host: {}", e);
                0.0
            }
        };

        compute_budget(cores, load, self.min_cpus, self.max_cpus)
    }
}

fn parse_loadavg(contents: &str) -> Option<f64> {
    contents.split_whitespace().next()?.parse::<f64>().ok()
}

fn compute_budget(cores: f64, load: f64, min_cpus: f64, max_cpus: f64) -> f64 {
    (cores - load).max(min_cpus).min(max_cpus)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_values() {
        let policy = ResourcePolicy::default();
        assert_eq!(policy.timeout_minutes, 15);
        assert_eq!(policy.max_processes, 25);
        assert_eq!(policy.memory_bytes, 104_857_600);
        assert_eq!(policy.disk_bytes, 52_428_800);
        assert_eq!(policy.stop_signal, "SIGKILL");
        assert_eq!(policy.timeout_arg(), "900");
    }

    #[test]
    fn test_limits_follow_policy() {
        let policy = ResourcePolicy::default();
        let limits = policy.limits(0.75);
        assert_eq!(limits.memory_bytes, Some(104_857_600));
        assert_eq!(limits.pids_limit, Some(25));
        assert_eq!(limits.disk_bytes, Some(52_428_800));
        assert_eq!(limits.cpus, Some(0.75));

        let no_quota = ResourcePolicy {
            enforce_disk_quota: false,
            ..ResourcePolicy::default()
        };
        assert_eq!(no_quota.limits(0.5).disk_bytes, None);
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let policy: ResourcePolicy = toml::from_str("timeout_minutes = 5\ncpus = 0.5").unwrap();
        assert_eq!(policy.timeout_minutes, 5);
        assert_eq!(policy.cpus, Some(0.5));
        assert_eq!(policy.max_processes, 25);
    }

    #[test]
    fn test_parse_loadavg() {
        assert_eq!(parse_loadavg("0.52 0.58 0.59 1/467 12345\n"), Some(0.52));
        assert_eq!(parse_loadavg(""), None);
        assert_eq!(parse_loadavg("garbage"), None);
    }

    #[test]
    fn test_compute_budget_clamps() {
        assert_eq!(compute_budget(8.0, 2.0, 0.1, 1.0), 1.0);
        assert_eq!(compute_budget(4.0, 3.5, 0.1, 1.0), 0.5);
        assert_eq!(compute_budget(2.0, 6.0, 0.1, 1.0), 0.1);
    }

    #[tokio::test]
    async fn test_fixed_allocator() {
        let policy = ResourcePolicy {
            cpus: Some(0.25),
            ..ResourcePolicy::default()
        };
        assert_eq!(policy.cpu_allocator().allocate().await, 0.25);
    }

    #[tokio::test]
    async fn test_host_allocator_stays_in_bounds() {
        let budget = HostCpuAllocator::new(0.1, 1.0).allocate().await;
        assert!((0.1..=1.0).contains(&budget));
    }
}
