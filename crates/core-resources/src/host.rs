//! Host snapshot attached to usage reports
//!
//! Informational only. Limit decisions use allocation accounting, which stays
//! deterministic regardless of what else runs on the machine.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use sysinfo::System;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostSnapshot {
    pub logical_cores: usize,
    pub total_memory_mb: u64,
    pub used_memory_mb: u64,
    pub memory_utilization: f64,
    /// One-minute load average; zero on platforms without one
    pub load_average: f64,
}

pub struct HostSampler {
    system: Mutex<System>,
}

impl std::fmt::Debug for HostSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostSampler").finish_non_exhaustive()
    }
}

impl HostSampler {
    pub fn new() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();
        Self {
            system: Mutex::new(sys),
        }
    }

    pub fn sample(&self) -> HostSnapshot {
        let mut sys = self.system.lock().unwrap_or_else(|e| e.into_inner());
        sys.refresh_memory();

        let total_memory_mb = sys.total_memory() / 1024 / 1024;
        let used_memory_mb = sys.used_memory() / 1024 / 1024;
        let memory_utilization = if total_memory_mb > 0 {
            used_memory_mb as f64 / total_memory_mb as f64 * 100.0
        } else {
            0.0
        };

        HostSnapshot {
            logical_cores: sys.cpus().len().max(1),
            total_memory_mb,
            used_memory_mb,
            memory_utilization,
            load_average: System::load_average().one,
        }
    }
}

impl Default for HostSampler {
    fn default() -> Self {
        Self::new()
    }
}
