//! Hardware inventory collection
//!
//! Best-effort, read-only probing of CPU, memory, storage and GPUs from
//! procfs, sysfs and SMBIOS. Every field is optional: a probe that fails
//! leaves its field unset and records a warning. Only a machine with no
//! identifiable CPU at all is an error.

mod parse;

pub use parse::{
    cpu_generation, gpu_generation, intel_is_discrete, nominal_ram_gb, parse_cpuinfo,
    parse_link_speed_gen, parse_meminfo_kb, smbios_memory_speed, CpuFacts,
};

use crate::error::{Result, TunerError};
use crate::gpu::{GpuDevice, GpuVendor};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// CPU vendor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CpuVendor {
    Intel,
    Amd,
    Arm,
    Other,
}

impl fmt::Display for CpuVendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CpuVendor::Intel => write!(f, "Intel"),
            CpuVendor::Amd => write!(f, "AMD"),
            CpuVendor::Arm => write!(f, "ARM"),
            CpuVendor::Other => write!(f, "Other"),
        }
    }
}

/// Storage technology of the fastest block device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    Nvme,
    Ssd,
    Hdd,
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageType::Nvme => write!(f, "NVMe"),
            StorageType::Ssd => write!(f, "SSD"),
            StorageType::Hdd => write!(f, "HDD"),
        }
    }
}

/// One accelerator as seen by the inventory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub vendor: GpuVendor,
    pub name: Option<String>,
    pub vram_gb: Option<f64>,
    /// Integrated graphics share system memory and never count as accelerators
    pub discrete: bool,
    /// Vendor product series (NVIDIA 40 for RTX 40xx, AMD 7 for RX 7xxx)
    pub generation: Option<u32>,
}

impl GpuInfo {
    pub fn new(vendor: GpuVendor, name: Option<String>, vram_gb: Option<f64>) -> Self {
        let generation = name.as_deref().and_then(|n| gpu_generation(vendor, n));
        let discrete = vendor != GpuVendor::Intel
            || vram_gb.is_some()
            || intel_is_discrete(None, name.as_deref());
        Self {
            vendor,
            name,
            vram_gb,
            discrete,
            generation,
        }
    }
}

/// Raw hardware facts. `None` means the probe could not determine the value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareInventory {
    pub cpu_vendor: Option<CpuVendor>,
    pub cpu_model: Option<String>,
    pub cpu_generation: Option<u32>,
    pub cpu_cores: Option<u32>,
    pub gpu_list: Vec<GpuInfo>,
    pub ram_gb: Option<u32>,
    /// MT/s
    pub ram_speed: Option<u32>,
    pub storage_type: Option<StorageType>,
    pub storage_gen: Option<u32>,
}

impl HardwareInventory {
    /// Discrete accelerators only
    pub fn accelerators(&self) -> impl Iterator<Item = &GpuInfo> {
        self.gpu_list.iter().filter(|g| g.discrete)
    }

    /// Combined VRAM of discrete accelerators, unknown sizes counted as zero
    pub fn total_vram_gb(&self) -> f64 {
        self.accelerators().filter_map(|g| g.vram_gb).sum()
    }

    /// NVMe generation, zero for anything that is not NVMe or unknown
    pub fn nvme_gen(&self) -> u32 {
        match self.storage_type {
            Some(StorageType::Nvme) => self.storage_gen.unwrap_or(0),
            _ => 0,
        }
    }
}

/// Collected inventory plus the non-fatal probe failures met on the way
#[derive(Debug)]
pub struct InventoryReport {
    pub inventory: HardwareInventory,
    pub warnings: Vec<TunerError>,
}

/// Probes hardware below a filesystem root
#[derive(Debug, Clone)]
pub struct InventoryCollector {
    root: PathBuf,
    sysinfo_fallback: bool,
    gpu_hints: Option<Vec<GpuInfo>>,
}

impl InventoryCollector {
    /// Probe the running system, falling back to `sysinfo` where procfs is missing
    pub fn system() -> Self {
        Self {
            root: PathBuf::from("/"),
            sysinfo_fallback: true,
            gpu_hints: None,
        }
    }

    /// Probe a mirrored procfs/sysfs tree (no fallback)
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sysinfo_fallback: false,
            gpu_hints: None,
        }
    }

    /// Use devices already enumerated by the accelerator manager instead of
    /// the DRM scan, which cannot see VRAM on every driver
    pub fn with_gpu_hints(mut self, devices: &[GpuDevice]) -> Self {
        if !devices.is_empty() {
            self.gpu_hints = Some(
                devices
                    .iter()
                    .map(|d| {
                        let vram = (d.vram_total > 0).then(|| bytes_to_gb(d.vram_total));
                        GpuInfo::new(d.vendor, Some(d.name.clone()), vram)
                    })
                    .collect(),
            );
        }
        self
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    /// Collect the inventory
    pub fn collect(&self) -> Result<InventoryReport> {
        let mut inv = HardwareInventory::default();
        let mut warnings = Vec::new();

        self.probe_cpu(&mut inv, &mut warnings);
        if inv.cpu_vendor.is_none() && inv.cpu_model.is_none() && inv.cpu_cores.is_none() {
            return Err(TunerError::EnumerationFailed(
                "no CPU could be identified".into(),
            ));
        }

        self.probe_memory(&mut inv, &mut warnings);
        self.probe_storage(&mut inv, &mut warnings);
        self.probe_gpus(&mut inv, &mut warnings);

        for w in &warnings {
            log::warn!("{}", w);
        }
        log::info!(
            "inventory: {} cores, {:?} GB RAM, {} GPU(s), storage {:?} gen {:?}",
            inv.cpu_cores.unwrap_or(0),
            inv.ram_gb,
            inv.gpu_list.len(),
            inv.storage_type,
            inv.storage_gen
        );

        Ok(InventoryReport {
            inventory: inv,
            warnings,
        })
    }

    fn probe_cpu(&self, inv: &mut HardwareInventory, warnings: &mut Vec<TunerError>) {
        match fs::read_to_string(self.path("proc/cpuinfo")) {
            Ok(content) => {
                let facts = parse_cpuinfo(&content);
                inv.cpu_vendor = facts.vendor;
                inv.cpu_model = facts.model;
                inv.cpu_cores = (facts.logical_cores > 0).then_some(facts.logical_cores);
            }
            Err(e) if self.sysinfo_fallback => {
                log::debug!("/proc/cpuinfo unreadable ({}), using sysinfo", e);
                let sys = sysinfo::System::new_all();
                let cpus = sys.cpus();
                if let Some(first) = cpus.first() {
                    inv.cpu_vendor = Some(parse::vendor_from_id(first.vendor_id()));
                    let brand = first.brand().trim();
                    inv.cpu_model = (!brand.is_empty()).then(|| brand.to_string());
                    inv.cpu_cores = Some(cpus.len() as u32);
                }
            }
            Err(e) => warnings.push(TunerError::probe("cpu", e)),
        }

        if let (Some(vendor), Some(model)) = (inv.cpu_vendor, inv.cpu_model.as_deref()) {
            inv.cpu_generation = cpu_generation(vendor, model);
        }
        if inv.cpu_generation.is_none() {
            warnings.push(TunerError::probe("cpu_generation", "model name not recognized"));
        }
    }

    fn probe_memory(&self, inv: &mut HardwareInventory, warnings: &mut Vec<TunerError>) {
        let total_kb = match fs::read_to_string(self.path("proc/meminfo")) {
            Ok(content) => parse_meminfo_kb(&content, "MemTotal"),
            Err(_) if self.sysinfo_fallback => {
                let sys = sysinfo::System::new_all();
                Some(sys.total_memory() / 1024)
            }
            Err(e) => {
                warnings.push(TunerError::probe("ram_gb", e));
                None
            }
        };
        inv.ram_gb = total_kb.map(nominal_ram_gb);

        inv.ram_speed = self.probe_ram_speed();
        if inv.ram_speed.is_none() {
            warnings.push(TunerError::probe("ram_speed", "no SMBIOS memory device entries"));
        }
    }

    fn probe_ram_speed(&self) -> Option<u32> {
        let entries = fs::read_dir(self.path("sys/firmware/dmi/entries")).ok()?;
        entries
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with("17-"))
            .filter_map(|e| fs::read(e.path().join("raw")).ok())
            .filter_map(|raw| smbios_memory_speed(&raw))
            .max()
    }

    fn probe_storage(&self, inv: &mut HardwareInventory, warnings: &mut Vec<TunerError>) {
        let entries = match fs::read_dir(self.path("sys/block")) {
            Ok(entries) => entries,
            Err(e) => {
                warnings.push(TunerError::probe("storage_type", e));
                return;
            }
        };

        let mut best: Option<(StorageType, Option<u32>)> = None;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_virtual_block_device(&name) {
                continue;
            }
            let dev = entry.path();
            let candidate = if name.starts_with("nvme") {
                let speed = fs::read_to_string(dev.join("device/device/current_link_speed")).ok();
                (StorageType::Nvme, speed.as_deref().and_then(parse_link_speed_gen))
            } else {
                match read_trimmed(&dev.join("queue/rotational")).as_deref() {
                    Some("0") => (StorageType::Ssd, None),
                    Some("1") => (StorageType::Hdd, None),
                    _ => continue,
                }
            };
            if best.map_or(true, |b| storage_rank(candidate) > storage_rank(b)) {
                best = Some(candidate);
            }
        }

        match best {
            Some((kind, gen)) => {
                inv.storage_type = Some(kind);
                inv.storage_gen = gen;
                if kind == StorageType::Nvme && gen.is_none() {
                    warnings.push(TunerError::probe("storage_gen", "PCIe link speed unreadable"));
                }
            }
            None => warnings.push(TunerError::probe("storage_type", "no physical block devices")),
        }
    }

    fn probe_gpus(&self, inv: &mut HardwareInventory, warnings: &mut Vec<TunerError>) {
        if let Some(hints) = &self.gpu_hints {
            inv.gpu_list = hints.clone();
            return;
        }

        let drm = self.path("sys/class/drm");
        let entries = match fs::read_dir(&drm) {
            Ok(entries) => entries,
            Err(e) => {
                warnings.push(TunerError::probe("gpu_list", e));
                return;
            }
        };

        let mut cards: Vec<(String, PathBuf)> = entries
            .flatten()
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                is_card_node(&name).then(|| (name, e.path().join("device")))
            })
            .collect();
        cards.sort();

        for (card, device) in cards {
            let vendor = match read_trimmed(&device.join("vendor")) {
                Some(id) => GpuVendor::from_pci_id(&id),
                None => {
                    warnings.push(TunerError::probe("gpu_list", format!("{}: no PCI vendor", card)));
                    continue;
                }
            };
            let name = read_trimmed(&device.join("product_name"))
                .or_else(|| self.nvidia_model_name(&device));
            let vram = read_trimmed(&device.join("mem_info_vram_total"))
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|&b| b > 0)
                .map(bytes_to_gb);
            if vram.is_none() && vendor != GpuVendor::Intel {
                warnings.push(TunerError::probe("vram_gb", format!("{}: VRAM size not exposed", card)));
            }
            let mut gpu = GpuInfo::new(vendor, name, vram);
            if vendor == GpuVendor::Intel && !gpu.discrete {
                let pci_device = read_trimmed(&device.join("device"));
                gpu.discrete = intel_is_discrete(pci_device.as_deref(), None);
            }
            inv.gpu_list.push(gpu);
        }
    }

    /// The proprietary NVIDIA driver publishes the model under procfs keyed by PCI slot
    fn nvidia_model_name(&self, device: &Path) -> Option<String> {
        let uevent = fs::read_to_string(device.join("uevent")).ok()?;
        let slot = uevent
            .lines()
            .find_map(|l| l.strip_prefix("PCI_SLOT_NAME="))?
            .trim()
            .to_string();
        let info = fs::read_to_string(
            self.path("proc/driver/nvidia/gpus")
                .join(slot)
                .join("information"),
        )
        .ok()?;
        info.lines()
            .find_map(|l| l.strip_prefix("Model:"))
            .map(|m| m.trim().to_string())
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

fn bytes_to_gb(bytes: u64) -> f64 {
    (bytes as f64 / (1024.0 * 1024.0 * 1024.0) * 10.0).round() / 10.0
}

fn is_card_node(name: &str) -> bool {
    name.strip_prefix("card")
        .map(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false)
}

/// Block devices that never carry a workload's data
pub(crate) fn is_virtual_block_device(name: &str) -> bool {
    ["loop", "ram", "zram", "dm-", "sr", "md", "fd", "nbd"]
        .iter()
        .any(|p| name.starts_with(p))
}

fn storage_rank((kind, gen): (StorageType, Option<u32>)) -> u32 {
    match kind {
        StorageType::Nvme => 10 + gen.unwrap_or(0),
        StorageType::Ssd => 2,
        StorageType::Hdd => 1,
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::fs;
    use std::path::Path;

    pub fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    /// A 24-core desktop with an RTX 4090 and a Gen4 NVMe drive
    pub fn workstation(root: &Path) {
        let mut cpuinfo = String::new();
        for i in 0..24 {
            cpuinfo.push_str(&format!(
                "processor\t: {}\nvendor_id\t: GenuineIntel\nmodel name\t: 13th Gen Intel(R) Core(TM) i9-13900K\n\n",
                i
            ));
        }
        write(root, "proc/cpuinfo", &cpuinfo);
        write(
            root,
            "proc/meminfo",
            "MemTotal:       131811256 kB\nMemFree:        100000000 kB\n",
        );

        let mut raw = vec![0u8; 0x28];
        raw[0] = 17;
        raw[1] = 0x28;
        raw[0x15..0x17].copy_from_slice(&5600u16.to_le_bytes());
        let path = root.join("sys/firmware/dmi/entries/17-0/raw");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, raw).unwrap();

        write(root, "sys/block/nvme0n1/device/device/current_link_speed", "16.0 GT/s PCIe\n");
        write(root, "sys/block/nvme0n1/queue/rotational", "0\n");
        write(root, "sys/block/sda/queue/rotational", "1\n");
        write(root, "sys/block/loop0/queue/rotational", "0\n");

        write(root, "sys/class/drm/card0/device/vendor", "0x10de\n");
        write(
            root,
            "sys/class/drm/card0/device/uevent",
            "DRIVER=nvidia\nPCI_SLOT_NAME=0000:01:00.0\n",
        );
        write(
            root,
            "proc/driver/nvidia/gpus/0000:01:00.0/information",
            "Model: \t\t NVIDIA GeForce RTX 4090\nIRQ:   \t\t 180\n",
        );
        write(root, "sys/class/drm/card0-DP-1/status", "connected\n");
    }
}
