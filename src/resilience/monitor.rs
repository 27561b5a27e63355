//! Resource monitoring
//!
//! Samples memory, disk and CPU utilization so degradation can start before
//! a dependency hard-fails. A failed sample is logged and skipped, never
//! retried.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::{data_dir, ResourceConfig};
use crate::error::{HypnosError, Result};
use crate::resilience::degradation::Dependency;

/// Utilization band, mirroring the thresholds used for alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourcePressure {
    Normal,   // < 60% of critical
    Moderate, // 60-80% of critical
    High,     // 80-100% of critical
    Critical, // >= critical
}

impl ResourcePressure {
    fn classify(pct: f64, critical_pct: f64) -> Self {
        if critical_pct <= 0.0 || pct >= critical_pct {
            ResourcePressure::Critical
        } else if pct >= critical_pct * 0.8 {
            ResourcePressure::High
        } else if pct >= critical_pct * 0.6 {
            ResourcePressure::Moderate
        } else {
            ResourcePressure::Normal
        }
    }
}

/// Raw utilization percentages; `None` where the platform gives no figure
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub memory_pct: Option<f64>,
    pub disk_pct: Option<f64>,
    pub cpu_pct: Option<f64>,
}

/// Classified sample
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub sampled_at: DateTime<Utc>,
    pub usage: ResourceUsage,
    pub memory: ResourcePressure,
    pub disk: ResourcePressure,
    pub cpu: ResourcePressure,
}

impl ResourceSnapshot {
    pub fn worst(&self) -> ResourcePressure {
        self.memory.max(self.disk).max(self.cpu)
    }

    /// Dependencies to treat as failed given current pressure.
    ///
    /// A full disk stops the storage engine from writing; exhausted memory
    /// rules out loading models for the LLM service.
    pub fn pressured_dependencies(&self) -> Vec<Dependency> {
        let mut deps = Vec::new();
        if self.disk == ResourcePressure::Critical {
            deps.push(Dependency::StorageEngine);
        }
        if self.memory == ResourcePressure::Critical {
            deps.push(Dependency::LlmService);
        }
        deps
    }
}

/// Source of raw utilization figures
pub trait ResourceSampler: Send + Sync {
    fn sample(&self) -> Result<ResourceUsage>;
}

/// Reads `/proc` for memory and load, `statvfs` for disk
#[derive(Debug, Clone)]
pub struct SystemSampler {
    disk_path: PathBuf,
}

impl SystemSampler {
    pub fn new(disk_path: impl Into<PathBuf>) -> Self {
        Self {
            disk_path: disk_path.into(),
        }
    }

    fn memory_pct() -> Option<f64> {
        let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
        let field = |name: &str| -> Option<f64> {
            meminfo
                .lines()
                .find(|l| l.starts_with(name))
                .and_then(|l| l.split_whitespace().nth(1))
                .and_then(|v| v.parse::<f64>().ok())
        };
        let total = field("MemTotal:")?;
        let available = field("MemAvailable:")?;
        if total <= 0.0 {
            return None;
        }
        Some(((total - available) / total * 100.0).clamp(0.0, 100.0))
    }

    fn cpu_pct() -> Option<f64> {
        let loadavg = std::fs::read_to_string("/proc/loadavg").ok()?;
        let one_minute: f64 = loadavg.split_whitespace().next()?.parse().ok()?;
        let cpus = std::thread::available_parallelism().ok()?.get() as f64;
        Some((one_minute / cpus * 100.0).clamp(0.0, 100.0))
    }

    fn disk_pct(path: &Path) -> Result<f64> {
        let stat = nix::sys::statvfs::statvfs(path)
            .map_err(|e| HypnosError::ResourceExhausted(format!("statvfs failed: {}", e)))?;
        let total = stat.blocks() as f64;
        let available = stat.blocks_available() as f64;
        if total <= 0.0 {
            return Err(HypnosError::ResourceExhausted(
                "filesystem reports zero blocks".to_string(),
            ));
        }
        Ok(((total - available) / total * 100.0).clamp(0.0, 100.0))
    }
}

impl ResourceSampler for SystemSampler {
    fn sample(&self) -> Result<ResourceUsage> {
        // The data directory may not exist yet on first start
        let mut path = self.disk_path.as_path();
        while !path.exists() {
            match path.parent() {
                Some(parent) => path = parent,
                None => break,
            }
        }

        Ok(ResourceUsage {
            memory_pct: Self::memory_pct(),
            disk_pct: Some(Self::disk_pct(path)?),
            cpu_pct: Self::cpu_pct(),
        })
    }
}

/// Turns raw samples into pressure bands
pub struct ResourceMonitor {
    sampler: Box<dyn ResourceSampler>,
    config: ResourceConfig,
}

impl ResourceMonitor {
    pub fn new(config: ResourceConfig) -> Self {
        let disk_path = config.disk_path.clone().unwrap_or_else(data_dir);
        Self::with_sampler(config, Box::new(SystemSampler::new(disk_path)))
    }

    pub fn with_sampler(config: ResourceConfig, sampler: Box<dyn ResourceSampler>) -> Self {
        Self { sampler, config }
    }

    /// Take a sample, or `None` when monitoring is off or the sample failed
    pub fn snapshot(&self) -> Option<ResourceSnapshot> {
        if !self.config.enabled {
            return None;
        }

        match self.sampler.sample() {
            Ok(usage) => {
                let snapshot = self.classify(usage);
                if snapshot.worst() == ResourcePressure::Critical {
                    warn!(
                        memory_pct = ?usage.memory_pct,
                        disk_pct = ?usage.disk_pct,
                        cpu_pct = ?usage.cpu_pct,
                        "Resource usage critical"
                    );
                } else {
                    debug!(
                        memory_pct = ?usage.memory_pct,
                        disk_pct = ?usage.disk_pct,
                        cpu_pct = ?usage.cpu_pct,
                        "Resource sample"
                    );
                }
                Some(snapshot)
            }
            Err(e) => {
                warn!(error = %e, "Resource sampling failed, skipping");
                None
            }
        }
    }

    fn classify(&self, usage: ResourceUsage) -> ResourceSnapshot {
        let band = |pct: Option<f64>, critical: f64| {
            pct.map_or(ResourcePressure::Normal, |p| {
                ResourcePressure::classify(p, critical)
            })
        };

        ResourceSnapshot {
            sampled_at: Utc::now(),
            usage,
            memory: band(usage.memory_pct, self.config.memory_critical_pct),
            disk: band(usage.disk_pct, self.config.disk_critical_pct),
            cpu: band(usage.cpu_pct, self.config.cpu_critical_pct),
        }
    }
}
