//! OS metrics through `sysinfo`

use super::{
    CpuMetrics, DiskMetrics, InterfaceMetrics, MemoryMetrics, NetworkMetrics, OsMetrics,
    OsSampler, ProcessInfo, ProcessMetrics,
};
use crate::error::Result;
use std::collections::HashMap;
use std::path::Path;
use std::time::Instant;
use sysinfo::{Disks, Networks, System};

const TOP_PROCESSES: usize = 5;

/// Samples the running host. Keeps its `System` between calls so CPU usage
/// is measured over the sampling interval.
pub struct SysinfoSampler {
    system: System,
    last_counters: HashMap<String, (u64, u64)>,
    last_at: Option<Instant>,
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl SysinfoSampler {
    pub fn new() -> Self {
        Self {
            system: System::new_all(),
            last_counters: HashMap::new(),
            last_at: None,
        }
    }

    fn cpu(&self) -> CpuMetrics {
        let cpus = self.system.cpus();
        let per_core: Vec<f64> = cpus.iter().map(|c| c.cpu_usage() as f64).collect();
        let usage = if per_core.is_empty() {
            0.0
        } else {
            per_core.iter().sum::<f64>() / per_core.len() as f64
        };
        let load = System::load_average();
        CpuMetrics {
            usage_percent: usage,
            per_core_percent: per_core,
            frequency_mhz: cpus.first().map(|c| c.frequency()).unwrap_or(0),
            load_average: [load.one, load.five, load.fifteen],
            brand: cpus.first().map(|c| c.brand().trim().to_string()).unwrap_or_default(),
        }
    }

    fn memory(&self) -> MemoryMetrics {
        MemoryMetrics {
            total: self.system.total_memory(),
            used: self.system.used_memory(),
            available: self.system.available_memory(),
            swap_total: self.system.total_swap(),
            swap_used: self.system.used_swap(),
        }
    }

    fn network(&mut self, now: Instant) -> NetworkMetrics {
        let networks = Networks::new_with_refreshed_list();
        let elapsed = self
            .last_at
            .map(|t| now.duration_since(t).as_secs_f64())
            .filter(|s| *s > 0.0);

        let mut counters = HashMap::new();
        let mut interfaces: Vec<InterfaceMetrics> = networks
            .iter()
            .map(|(name, data)| {
                let rx = data.total_received();
                let tx = data.total_transmitted();
                let rate = |now: u64, before: u64| -> f64 {
                    elapsed.map_or(0.0, |secs| now.saturating_sub(before) as f64 / secs)
                };
                let (rx_rate, tx_rate) = self
                    .last_counters
                    .get(name)
                    .map(|&(prx, ptx)| (rate(rx, prx), rate(tx, ptx)))
                    .unwrap_or((0.0, 0.0));
                counters.insert(name.clone(), (rx, tx));
                InterfaceMetrics {
                    name: name.clone(),
                    rx_bytes: rx,
                    tx_bytes: tx,
                    rx_bytes_per_sec: rx_rate,
                    tx_bytes_per_sec: tx_rate,
                }
            })
            .collect();
        interfaces.sort_by(|a, b| a.name.cmp(&b.name));
        self.last_counters = counters;
        self.last_at = Some(now);
        NetworkMetrics::from_interfaces(interfaces)
    }

    fn processes(&self) -> ProcessMetrics {
        let all: Vec<ProcessInfo> = self
            .system
            .processes()
            .iter()
            .map(|(pid, p)| ProcessInfo {
                pid: pid.as_u32(),
                name: Path::new(p.name()).to_string_lossy().into_owned(),
                cpu_percent: p.cpu_usage() as f64,
                memory_bytes: p.memory(),
            })
            .collect();
        ProcessMetrics::rank(all, TOP_PROCESSES)
    }
}

impl OsSampler for SysinfoSampler {
    fn sample(&mut self) -> Result<OsMetrics> {
        self.system.refresh_all();
        let now = Instant::now();

        let disks = Disks::new_with_refreshed_list()
            .iter()
            .map(|d| DiskMetrics {
                name: d.name().to_string_lossy().into_owned(),
                mount_point: d.mount_point().to_string_lossy().into_owned(),
                total: d.total_space(),
                available: d.available_space(),
            })
            .collect();

        Ok(OsMetrics {
            cpu: self.cpu(),
            memory: self.memory(),
            disks,
            network: self.network(now),
            processes: self.processes(),
        })
    }
}
