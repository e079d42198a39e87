pub mod config;
pub mod connection;
pub mod correlator;
pub mod error;
pub mod history;
pub mod protocol;
pub mod registry;
pub mod repository;
pub mod store;
pub mod transport;
pub mod util;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One complete measurement pushed by a host agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    /// Unix timestamp in seconds
    pub timestamp: i64,
    pub cpu: CpuMetrics,
    pub memory: MemoryMetrics,
    pub disk: DiskMetrics,
    pub processes: ProcessMetrics,
    pub system: SystemInformation,
    pub network: NetworkMetrics,
}

impl SystemMetrics {
    /// Used memory as a percentage of total memory (0 when total is unknown)
    pub fn memory_percent(&self) -> f64 {
        if self.memory.total == 0 {
            return 0.0;
        }
        self.memory.used as f64 / self.memory.total as f64 * 100.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuMetrics {
    pub usage_percent: f64,
    pub load_avg_1m: f64,
    pub load_avg_5m: f64,
    pub load_avg_15m: f64,
    pub cores: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryMetrics {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub available: u64,
    pub buffers: u64,
    pub cached: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskMetrics {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub percent: f64,
    /// Usage per mount point, keyed by mount path
    #[serde(default)]
    pub mountpoint: HashMap<String, MountMetrics>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountMetrics {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessMetrics {
    pub total: u32,
    pub running: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemInformation {
    /// Uptime in seconds
    pub uptime: u64,
    pub hostname: String,
    pub kernel: String,
    pub architecture: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkMetrics {
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Snapshot with fixed values apart from timestamp and CPU usage
#[cfg(test)]
pub(crate) fn sample_metrics(timestamp: i64, cpu_usage: f64) -> SystemMetrics {
    SystemMetrics {
        timestamp,
        cpu: CpuMetrics {
            usage_percent: cpu_usage,
            load_avg_1m: 0.5,
            load_avg_5m: 0.4,
            load_avg_15m: 0.3,
            cores: 4,
        },
        memory: MemoryMetrics {
            total: 1000,
            used: 250,
            free: 750,
            available: 700,
            buffers: 10,
            cached: 20,
        },
        disk: DiskMetrics {
            total: 500,
            used: 100,
            free: 400,
            percent: 20.0,
            mountpoint: HashMap::new(),
        },
        processes: ProcessMetrics {
            total: 120,
            running: 2,
        },
        system: SystemInformation {
            uptime: 3600,
            hostname: "test-host".to_string(),
            kernel: "6.1.0".to_string(),
            architecture: "amd64".to_string(),
        },
        network: NetworkMetrics {
            bytes_sent: 0,
            bytes_received: 0,
        },
    }
}
