//! Tuning plan resolution
//!
//! [`resolve`] turns a profile and inventory into a complete [`TuningPlan`]
//! using the data in [`tables`]. Every plan carries all [`REQUIRED_KEYS`];
//! unknown inventory fields fall back to the table's conservative values.

pub mod tables;

pub use tables::{interpolate, LatencySensitivity, TuningTable, TUNING_TABLE_V1};

use crate::config::TuningConfig;
use crate::error::{Result, TunerError};
use crate::gpu::GpuVendor;
use crate::inventory::{HardwareInventory, StorageType};
use crate::profile::SystemProfile;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Values the kernel accepts for `mitigations=`
pub const MITIGATION_FLAGS: [&str; 3] = ["auto", "auto,nosmt", "off"];

/// Mechanism group a tunable is applied through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    KernelParams,
    Sysctl,
    Governor,
    IoScheduler,
    GpuPowerMode,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::KernelParams,
        Category::Sysctl,
        Category::Governor,
        Category::IoScheduler,
        Category::GpuPowerMode,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::KernelParams => "kernel_params",
            Category::Sysctl => "sysctl",
            Category::Governor => "governor",
            Category::IoScheduler => "io_scheduler",
            Category::GpuPowerMode => "gpu_power_mode",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TuningValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl fmt::Display for TuningValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TuningValue::Bool(b) => write!(f, "{}", b),
            TuningValue::Int(i) => write!(f, "{}", i),
            TuningValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<bool> for TuningValue {
    fn from(v: bool) -> Self {
        TuningValue::Bool(v)
    }
}

impl From<i64> for TuningValue {
    fn from(v: i64) -> Self {
        TuningValue::Int(v)
    }
}

impl From<&str> for TuningValue {
    fn from(v: &str) -> Self {
        TuningValue::Text(v.to_string())
    }
}

impl From<String> for TuningValue {
    fn from(v: String) -> Self {
        TuningValue::Text(v)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TuningEntry {
    pub category: Category,
    pub value: TuningValue,
}

pub const REQUIRED_KEYS: [&str; 13] = [
    "kernel.mitigations",
    "kernel.transparent_hugepage",
    "vm.swappiness",
    "vm.dirty_ratio",
    "vm.dirty_background_ratio",
    "zram.size_mb",
    "cpu.governor",
    "cpu.max_cstate",
    "gpu.driver_tier",
    "gpu.persistence_mode",
    "gpu.power_mode",
    "storage.io_scheduler",
    "storage.read_ahead_kb",
];

/// Concrete settings for one machine. Keys are unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TuningPlan {
    pub version: String,
    pub profile: SystemProfile,
    entries: BTreeMap<String, TuningEntry>,
}

impl TuningPlan {
    pub fn new(version: impl Into<String>, profile: SystemProfile) -> Self {
        Self {
            version: version.into(),
            profile,
            entries: BTreeMap::new(),
        }
    }

    /// Add a tunable; a key may appear only once
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        category: Category,
        value: impl Into<TuningValue>,
    ) -> Result<()> {
        let key = key.into();
        if self.entries.contains_key(&key) {
            return Err(TunerError::DuplicateKey(key));
        }
        self.entries.insert(
            key,
            TuningEntry {
                category,
                value: value.into(),
            },
        );
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&TuningValue> {
        self.entries.get(key).map(|e| &e.value)
    }

    pub fn entries(&self) -> &BTreeMap<String, TuningEntry> {
        &self.entries
    }

    /// Entries of one category in key order
    pub fn category(&self, category: Category) -> impl Iterator<Item = (&str, &TuningValue)> {
        self.entries
            .iter()
            .filter(move |(_, e)| e.category == category)
            .map(|(k, e)| (k.as_str(), &e.value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn missing_keys(&self) -> Vec<&'static str> {
        REQUIRED_KEYS
            .into_iter()
            .filter(|k| !self.entries.contains_key(*k))
            .collect()
    }

    /// SHA-256 over the sorted entries, hex encoded
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        for (key, entry) in &self.entries {
            hasher.update(key.as_bytes());
            hasher.update(b"\0");
            hasher.update(entry.category.as_str().as_bytes());
            hasher.update(b"\0");
            hasher.update(entry.value.to_string().as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }
}

impl fmt::Display for TuningPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "# {} ({})", self.profile, self.version)?;
        for (key, entry) in &self.entries {
            writeln!(f, "{:<28} {:<15} {}", key, entry.category, entry.value)?;
        }
        Ok(())
    }
}

/// Vendor and generation of the accelerator that picks the driver
fn primary_gpu(inv: &HardwareInventory) -> Option<(GpuVendor, Option<u32>)> {
    inv.accelerators()
        .next()
        .or_else(|| inv.gpu_list.first())
        .map(|g| (g.vendor, g.generation))
}

fn read_ahead_kb(table: &TuningTable, inv: &HardwareInventory) -> i64 {
    match inv.storage_type {
        Some(StorageType::Nvme) if inv.nvme_gen() >= table.fast_nvme_gen => table.read_ahead_fast_nvme_kb,
        Some(StorageType::Nvme) | Some(StorageType::Ssd) => table.read_ahead_ssd_kb,
        Some(StorageType::Hdd) => table.read_ahead_hdd_kb,
        None => table.read_ahead_unknown_kb,
    }
}

impl TuningTable {
    pub fn resolve(
        &self,
        profile: SystemProfile,
        inv: &HardwareInventory,
        config: &TuningConfig,
    ) -> Result<TuningPlan> {
        use Category::*;

        let mut plan = TuningPlan::new(self.version, profile);

        let mitigations = config
            .mitigations
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(self.mitigations_default);
        // the value lands in a shell-sourced bootloader drop-in
        if !MITIGATION_FLAGS.contains(&mitigations) {
            return Err(TunerError::Configuration(format!(
                "mitigations: {:?} is not one of {}",
                mitigations,
                MITIGATION_FLAGS.join(", ")
            )));
        }
        plan.insert("kernel.mitigations", KernelParams, mitigations)?;
        plan.insert(
            "kernel.transparent_hugepage",
            KernelParams,
            self.transparent_hugepage(profile),
        )?;
        plan.insert("cpu.max_cstate", KernelParams, self.max_cstate(profile))?;

        let (dirty, background) = self.dirty_ratios(inv.ram_gb);
        plan.insert("vm.swappiness", Sysctl, self.swappiness(inv.ram_gb))?;
        plan.insert("vm.dirty_ratio", Sysctl, dirty)?;
        plan.insert("vm.dirty_background_ratio", Sysctl, background)?;
        plan.insert("zram.size_mb", Sysctl, self.zram_size_mb(inv.ram_gb))?;

        plan.insert("cpu.governor", Governor, self.governor(profile))?;

        let scheduler = if inv.nvme_gen() >= self.fast_nvme_gen {
            "none"
        } else {
            "mq-deadline"
        };
        plan.insert("storage.io_scheduler", IoScheduler, scheduler)?;
        plan.insert("storage.read_ahead_kb", IoScheduler, read_ahead_kb(self, inv))?;

        plan.insert("gpu.driver_tier", GpuPowerMode, self.driver_tier(primary_gpu(inv)))?;
        plan.insert("gpu.persistence_mode", GpuPowerMode, self.persistence_mode(profile))?;
        plan.insert("gpu.power_mode", GpuPowerMode, self.power_mode(profile))?;

        Ok(plan)
    }
}

/// Resolve with the current table
pub fn resolve(
    profile: SystemProfile,
    inv: &HardwareInventory,
    config: &TuningConfig,
) -> Result<TuningPlan> {
    TUNING_TABLE_V1.resolve(profile, inv, config)
}
