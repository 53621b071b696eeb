//! Resource admission guards
//!
//! Self-modification work is heavy (worktree copies, subprocesses, extra
//! generations), so admission is refused when the host is already under
//! pressure.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub cpu_percent: f64,
    pub used_memory_mb: u64,
    pub total_memory_mb: u64,
    pub available_memory_mb: u64,
    pub memory_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceViolation {
    pub resource: String,
    pub threshold: f64,
    pub current: f64,
    pub reason: String,
}

pub struct ResourceMonitor {
    system: Mutex<System>,
    cpu_threshold: f64,
    memory_threshold_mb: u64,
    enabled: bool,
}

impl ResourceMonitor {
    pub fn new(cpu_threshold: f64, memory_threshold_mb: u64, enabled: bool) -> Self {
        let mut system = System::new_all();
        system.refresh_all();
        Self {
            system: Mutex::new(system),
            cpu_threshold,
            memory_threshold_mb,
            enabled,
        }
    }

    pub fn status(&self) -> ResourceStatus {
        let mut system = match self.system.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        system.refresh_memory();
        system.refresh_cpu_usage();

        let total = system.total_memory();
        let used = system.used_memory();
        let available = system.available_memory();
        ResourceStatus {
            cpu_percent: system.global_cpu_usage() as f64,
            used_memory_mb: used / 1024 / 1024,
            total_memory_mb: total / 1024 / 1024,
            available_memory_mb: available / 1024 / 1024,
            memory_percent: if total > 0 {
                used as f64 / total as f64 * 100.0
            } else {
                0.0
            },
        }
    }

    /// Can a self-modification job start right now?
    pub fn check(&self) -> (bool, Vec<ResourceViolation>, ResourceStatus) {
        let status = self.status();
        if !self.enabled {
            return (true, Vec::new(), status);
        }

        let mut violations = Vec::new();
        if status.cpu_percent > self.cpu_threshold {
            violations.push(ResourceViolation {
                resource: "cpu".to_string(),
                threshold: self.cpu_threshold,
                current: status.cpu_percent,
                reason: format!(
                    "cpu {:.1}% above threshold {:.1}%",
                    status.cpu_percent, self.cpu_threshold
                ),
            });
        }
        if status.available_memory_mb < self.memory_threshold_mb {
            violations.push(ResourceViolation {
                resource: "memory".to_string(),
                threshold: self.memory_threshold_mb as f64,
                current: status.available_memory_mb as f64,
                reason: format!(
                    "available memory {}MB below threshold {}MB",
                    status.available_memory_mb, self.memory_threshold_mb
                ),
            });
        }

        if !violations.is_empty() {
            warn!(violations = violations.len(), "resource guards refused admission");
        }
        (violations.is_empty(), violations, status)
    }
}
