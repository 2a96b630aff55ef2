//! Response shapes of the container runtime API, reduced to the fields the exporter reads.
//!
//! Optional or `null` fields decode to their defaults. cgroup v2 hosts, for example, report
//! no `cache` entry in the memory stats, and containers with `--network none` have no
//! `networks` object at all.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Deserializer};

use crate::container::ContainerID;

const NANOS_PER_SECOND: f64 = 1e9;

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// A running container as returned by the container list endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerSummary {
    pub id: ContainerID,
    #[serde(default, deserialize_with = "null_as_default")]
    pub names: Vec<String>,
    #[serde(default)]
    pub image: String,
    #[serde(rename = "ImageID", default)]
    pub image_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub state: String,
}

/// Point-in-time resource usage of a single container.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct UsageSnapshot {
    #[serde(default, deserialize_with = "null_as_default")]
    pub pids_stats: PidsStats,
    #[serde(default, deserialize_with = "null_as_default")]
    pub cpu_stats: CpuStats,
    #[serde(default, deserialize_with = "null_as_default")]
    pub memory_stats: MemoryStats,
    #[serde(default, deserialize_with = "null_as_default")]
    pub networks: BTreeMap<String, NetworkUsage>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PidsStats {
    #[serde(default)]
    pub current: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CpuStats {
    #[serde(default, deserialize_with = "null_as_default")]
    pub cpu_usage: CpuUsage,
}

/// CPU time counters in nanoseconds.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CpuUsage {
    #[serde(default)]
    pub total_usage: u64,
    #[serde(default)]
    pub usage_in_usermode: u64,
    #[serde(default)]
    pub usage_in_kernelmode: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MemoryStats {
    #[serde(default)]
    pub usage: u64,
    #[serde(default)]
    pub limit: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub stats: HashMap<String, u64>,
}

/// Per-interface network counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct NetworkUsage {
    #[serde(default)]
    pub rx_bytes: u64,
    #[serde(default)]
    pub rx_packets: u64,
    #[serde(default)]
    pub rx_errors: u64,
    #[serde(default)]
    pub rx_dropped: u64,
    #[serde(default)]
    pub tx_bytes: u64,
    #[serde(default)]
    pub tx_packets: u64,
    #[serde(default)]
    pub tx_errors: u64,
    #[serde(default)]
    pub tx_dropped: u64,
}

impl UsageSnapshot {
    pub fn pids(&self) -> f64 {
        self.pids_stats.current as f64
    }

    pub fn cpu_user_seconds(&self) -> f64 {
        self.cpu_stats.cpu_usage.usage_in_usermode as f64 / NANOS_PER_SECOND
    }

    pub fn cpu_kernel_seconds(&self) -> f64 {
        self.cpu_stats.cpu_usage.usage_in_kernelmode as f64 / NANOS_PER_SECOND
    }

    pub fn cpu_total_seconds(&self) -> f64 {
        self.cpu_stats.cpu_usage.total_usage as f64 / NANOS_PER_SECOND
    }

    /// Memory usage without the page cache, i.e. the working set.
    pub fn memory_working_set_bytes(&self) -> f64 {
        let cache = self.memory_stats.stats.get("cache").copied().unwrap_or(0);
        self.memory_stats.usage.saturating_sub(cache) as f64
    }

    pub fn memory_limit_bytes(&self) -> f64 {
        self.memory_stats.limit as f64
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(super) struct ContainerInspect {
    #[serde(default, deserialize_with = "null_as_default")]
    pub state: ContainerState,
}

/// State flags reported by the inspect endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerState {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub restarting: bool,
    #[serde(rename = "OOMKilled", default)]
    pub oom_killed: bool,
    #[serde(default)]
    pub dead: bool,
}
