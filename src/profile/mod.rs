//! System profile classification
//!
//! A pure, deterministic mapping from [`HardwareInventory`] to a
//! [`SystemProfile`]. The cutoffs live in a versioned [`ClassifierTable`];
//! rules are evaluated in table order and the first match wins, so the order
//! is the tie-break policy. Unknown numeric fields count as zero and unknown
//! storage as not-NVMe, which always leans toward the more conservative
//! profile.

use crate::error::TunerError;
use crate::inventory::{GpuInfo, HardwareInventory};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Coarse workload class of a machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemProfile {
    AiFlagship,
    ProWorkstation,
    GamingEnthusiast,
    ContentCreator,
    Developer,
    Standard,
}

impl SystemProfile {
    pub const ALL: [SystemProfile; 6] = [
        SystemProfile::AiFlagship,
        SystemProfile::ProWorkstation,
        SystemProfile::GamingEnthusiast,
        SystemProfile::ContentCreator,
        SystemProfile::Developer,
        SystemProfile::Standard,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SystemProfile::AiFlagship => "ai_flagship",
            SystemProfile::ProWorkstation => "pro_workstation",
            SystemProfile::GamingEnthusiast => "gaming_enthusiast",
            SystemProfile::ContentCreator => "content_creator",
            SystemProfile::Developer => "developer",
            SystemProfile::Standard => "standard",
        }
    }
}

impl fmt::Display for SystemProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SystemProfile {
    type Err = TunerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_ascii_lowercase().replace('-', "_");
        SystemProfile::ALL
            .into_iter()
            .find(|p| p.as_str() == key)
            .ok_or_else(|| TunerError::NotFound(format!("profile '{}'", s)))
    }
}

/// Versioned classification cutoffs
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierTable {
    pub version: &'static str,
    /// Evaluation order; `Standard` must come last
    pub order: &'static [SystemProfile],
    pub flagship_min_accelerators: usize,
    pub flagship_min_vram_gb: f64,
    pub high_tier_min_vram_gb: f64,
    /// Case-insensitive name fragments that mark a high-tier part
    pub high_tier_names: &'static [&'static str],
    pub workstation_min_ram_gb: u32,
    pub consumer_min_vram_gb: f64,
    /// Half-open `[low, high)`
    pub gaming_ram_gb: (u32, u32),
    pub creator_min_vram_gb: f64,
    pub creator_min_nvme_gen: u32,
    pub developer_min_cores: u32,
    pub developer_min_ram_gb: u32,
}

pub const CLASSIFIER_V1: ClassifierTable = ClassifierTable {
    version: "classifier-v1",
    order: &SystemProfile::ALL,
    flagship_min_accelerators: 2,
    flagship_min_vram_gb: 40.0,
    high_tier_min_vram_gb: 16.0,
    high_tier_names: &["4090", "5090", "a6000", "a100", "h100", "l40", "7900 xtx", "w7900", "mi"],
    workstation_min_ram_gb: 64,
    consumer_min_vram_gb: 6.0,
    gaming_ram_gb: (16, 64),
    creator_min_vram_gb: 12.0,
    creator_min_nvme_gen: 4,
    developer_min_cores: 8,
    developer_min_ram_gb: 16,
};

impl ClassifierTable {
    fn is_high_tier(&self, gpu: &GpuInfo) -> bool {
        if gpu.vram_gb.unwrap_or(0.0) >= self.high_tier_min_vram_gb {
            return true;
        }
        let Some(name) = gpu.name.as_deref() else {
            return false;
        };
        let name = name.to_ascii_lowercase();
        self.high_tier_names.iter().any(|fragment| {
            if *fragment == "mi" {
                // AMD Instinct: "MI210", "MI300X"
                name.split_whitespace().any(|w| {
                    w.strip_prefix("mi")
                        .map_or(false, |rest| rest.chars().next().map_or(false, |c| c.is_ascii_digit()))
                })
            } else {
                name.contains(fragment)
            }
        })
    }

    fn is_consumer_tier(&self, gpu: &GpuInfo) -> bool {
        gpu.discrete
            && !self.is_high_tier(gpu)
            && gpu.vram_gb.unwrap_or(0.0) >= self.consumer_min_vram_gb
    }

    /// Whether `profile`'s rule matches, with a short explanation
    pub fn rule_matches(&self, profile: SystemProfile, inv: &HardwareInventory) -> Option<String> {
        let ram = inv.ram_gb.unwrap_or(0);
        match profile {
            SystemProfile::AiFlagship => {
                let count = inv.accelerators().count();
                let vram = inv.total_vram_gb();
                (count >= self.flagship_min_accelerators && vram >= self.flagship_min_vram_gb).then(|| {
                    format!("{} accelerators with {:.0} GB combined VRAM", count, vram)
                })
            }
            SystemProfile::ProWorkstation => {
                let gpu = inv.accelerators().find(|g| self.is_high_tier(g))?;
                (ram >= self.workstation_min_ram_gb).then(|| {
                    format!(
                        "high-tier accelerator {} with {} GB RAM",
                        gpu.name.as_deref().unwrap_or("(unnamed)"),
                        ram
                    )
                })
            }
            SystemProfile::GamingEnthusiast => {
                let (low, high) = self.gaming_ram_gb;
                let gpu = inv.accelerators().find(|g| self.is_consumer_tier(g))?;
                (ram >= low && ram < high).then(|| {
                    format!(
                        "consumer accelerator {} with {} GB RAM",
                        gpu.name.as_deref().unwrap_or("(unnamed)"),
                        ram
                    )
                })
            }
            SystemProfile::ContentCreator => {
                let vram = inv
                    .accelerators()
                    .filter_map(|g| g.vram_gb)
                    .fold(0.0_f64, f64::max);
                let nvme = inv.nvme_gen();
                (vram >= self.creator_min_vram_gb && nvme >= self.creator_min_nvme_gen).then(|| {
                    format!("{:.0} GB accelerator on NVMe gen {}", vram, nvme)
                })
            }
            SystemProfile::Developer => {
                let cores = inv.cpu_cores.unwrap_or(0);
                (cores >= self.developer_min_cores && ram >= self.developer_min_ram_gb)
                    .then(|| format!("{} cores with {} GB RAM", cores, ram))
            }
            SystemProfile::Standard => Some("no specialised rule matched".to_string()),
        }
    }

    pub fn classify_explained(&self, inv: &HardwareInventory) -> Classification {
        for &profile in self.order {
            if let Some(reason) = self.rule_matches(profile, inv) {
                return Classification {
                    profile,
                    reason,
                    table_version: self.version.to_string(),
                };
            }
        }
        Classification {
            profile: SystemProfile::Standard,
            reason: "no specialised rule matched".to_string(),
            table_version: self.version.to_string(),
        }
    }
}

/// Result of classification together with the rule that decided it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub profile: SystemProfile,
    pub reason: String,
    pub table_version: String,
}

/// Classify with the current table
pub fn classify(inv: &HardwareInventory) -> SystemProfile {
    CLASSIFIER_V1.classify_explained(inv).profile
}

pub fn classify_explained(inv: &HardwareInventory) -> Classification {
    CLASSIFIER_V1.classify_explained(inv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::GpuVendor;
    use crate::inventory::{CpuVendor, StorageType};
    use proptest::prelude::*;

    fn gpu(name: &str, vram: Option<f64>) -> GpuInfo {
        GpuInfo::new(GpuVendor::Nvidia, Some(name.to_string()), vram)
    }

    fn machine(cores: u32, ram: u32, gpus: Vec<GpuInfo>, nvme_gen: Option<u32>) -> HardwareInventory {
        HardwareInventory {
            cpu_vendor: Some(CpuVendor::Intel),
            cpu_model: Some("Test CPU".into()),
            cpu_generation: Some(13),
            cpu_cores: Some(cores),
            gpu_list: gpus,
            ram_gb: Some(ram),
            ram_speed: None,
            storage_type: nvme_gen.map(|_| StorageType::Nvme),
            storage_gen: nvme_gen,
        }
    }

    #[test]
    fn test_workstation_scenario() {
        let inv = machine(24, 128, vec![gpu("NVIDIA GeForce RTX 4090", Some(24.0))], Some(4));
        let c = classify_explained(&inv);
        assert_eq!(c.profile, SystemProfile::ProWorkstation);
        assert!(c.reason.contains("4090"));
        assert_eq!(c.table_version, "classifier-v1");
    }

    #[test]
    fn test_rule_order_breaks_ties() {
        // matches flagship, workstation, creator and developer
        let inv = machine(
            32,
            256,
            vec![gpu("NVIDIA A100", Some(40.0)), gpu("NVIDIA A100", Some(40.0))],
            Some(5),
        );
        assert_eq!(classify(&inv), SystemProfile::AiFlagship);
    }

    #[test]
    fn test_each_profile() {
        let gaming = machine(8, 32, vec![gpu("NVIDIA GeForce RTX 4070", Some(12.0))], Some(3));
        assert_eq!(classify(&gaming), SystemProfile::GamingEnthusiast);

        let creator = machine(8, 64, vec![gpu("NVIDIA GeForce RTX 4070", Some(12.0))], Some(4));
        assert_eq!(classify(&creator), SystemProfile::ContentCreator);

        let dev = machine(16, 32, vec![], Some(4));
        assert_eq!(classify(&dev), SystemProfile::Developer);

        let small = machine(4, 8, vec![], None);
        assert_eq!(classify(&small), SystemProfile::Standard);
    }

    #[test]
    fn test_high_tier_by_name_without_vram() {
        // NVIDIA VRAM is often unreadable from sysfs
        let inv = machine(24, 126, vec![gpu("NVIDIA GeForce RTX 4090", None)], Some(4));
        assert_eq!(classify(&inv), SystemProfile::ProWorkstation);

        let instinct = GpuInfo::new(GpuVendor::Amd, Some("AMD Instinct MI210".into()), None);
        assert!(CLASSIFIER_V1.is_high_tier(&instinct));
        let radeon = GpuInfo::new(GpuVendor::Amd, Some("Radeon RX 6600 Mini".into()), Some(8.0));
        assert!(!CLASSIFIER_V1.is_high_tier(&radeon));
    }

    #[test]
    fn test_integrated_graphics_do_not_count() {
        let igpu = GpuInfo::new(GpuVendor::Intel, Some("Intel UHD 770".into()), None);
        let inv = machine(4, 16, vec![igpu], None);
        assert_eq!(classify(&inv), SystemProfile::Standard);
    }

    #[test]
    fn test_empty_inventory_is_standard() {
        assert_eq!(classify(&HardwareInventory::default()), SystemProfile::Standard);
    }

    #[test]
    fn test_profile_from_str() {
        assert_eq!("pro-workstation".parse::<SystemProfile>().unwrap(), SystemProfile::ProWorkstation);
        assert_eq!("AI_FLAGSHIP".parse::<SystemProfile>().unwrap(), SystemProfile::AiFlagship);
        assert!(matches!("turbo".parse::<SystemProfile>(), Err(TunerError::NotFound(_))));
    }

    fn arb_gpu() -> impl Strategy<Value = GpuInfo> {
        (
            prop_oneof![Just(GpuVendor::Nvidia), Just(GpuVendor::Amd), Just(GpuVendor::Intel)],
            prop::option::of("[A-Za-z0-9 ]{0,24}"),
            prop::option::of(0.0f64..96.0),
        )
            .prop_map(|(vendor, name, vram)| GpuInfo::new(vendor, name, vram))
    }

    fn arb_inventory() -> impl Strategy<Value = HardwareInventory> {
        (
            prop::option::of(1u32..256),
            prop::option::of(1u32..1024),
            prop::collection::vec(arb_gpu(), 0..=4),
            prop::option::of(prop_oneof![
                Just(StorageType::Nvme),
                Just(StorageType::Ssd),
                Just(StorageType::Hdd)
            ]),
            prop::option::of(1u32..=6),
        )
            .prop_map(|(cores, ram, gpus, storage, gen)| HardwareInventory {
                cpu_vendor: Some(CpuVendor::Amd),
                cpu_model: None,
                cpu_generation: None,
                cpu_cores: cores,
                gpu_list: gpus,
                ram_gb: ram,
                ram_speed: None,
                storage_type: storage,
                storage_gen: gen,
            })
    }

    proptest! {
        #[test]
        fn test_classify_is_deterministic(inv in arb_inventory()) {
            let first = classify_explained(&inv);
            let second = classify_explained(&inv.clone());
            prop_assert_eq!(first, second);
        }

        #[test]
        fn test_classify_picks_first_matching_rule(inv in arb_inventory()) {
            let profile = classify(&inv);
            let first_match = CLASSIFIER_V1
                .order
                .iter()
                .copied()
                .find(|p| CLASSIFIER_V1.rule_matches(*p, &inv).is_some());
            prop_assert_eq!(Some(profile), first_match);
        }
    }
}
