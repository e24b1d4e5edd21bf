//! Versioned tuning data
//!
//! Curves are `(ram_gb, value)` points, interpolated linearly and held flat
//! past either end.

use crate::gpu::GpuVendor;
use crate::profile::SystemProfile;

/// How much a profile cares about wake-up latency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencySensitivity {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TuningTable {
    pub version: &'static str,
    pub swappiness: &'static [(f64, f64)],
    pub swappiness_bounds: (i64, i64),
    pub swappiness_unknown: i64,
    pub zram_fraction: &'static [(f64, f64)],
    pub zram_unknown_mb: i64,
    pub dirty_ratio: &'static [(f64, f64)],
    pub dirty_ratio_unknown: i64,
    pub dirty_background_min: i64,
    pub performance_governor: &'static [SystemProfile],
    pub default_governor: &'static str,
    pub high_latency: &'static [SystemProfile],
    pub medium_latency: &'static [SystemProfile],
    /// Minimum generation -> package, highest first
    pub nvidia_drivers: &'static [(u32, &'static str)],
    pub nvidia_fallback: &'static str,
    pub amd_drivers: &'static [(u32, &'static str)],
    pub amd_fallback: &'static str,
    pub intel_driver: &'static str,
    pub persistence: &'static [SystemProfile],
    pub max_power: &'static [SystemProfile],
    pub balanced_power: &'static [SystemProfile],
    pub thp_always: &'static [SystemProfile],
    pub mitigations_default: &'static str,
    pub fast_nvme_gen: u32,
    pub read_ahead_fast_nvme_kb: i64,
    pub read_ahead_ssd_kb: i64,
    pub read_ahead_hdd_kb: i64,
    pub read_ahead_unknown_kb: i64,
}

use SystemProfile::*;

pub const TUNING_TABLE_V1: TuningTable = TuningTable {
    version: "tuning-v1",
    swappiness: &[(4.0, 60.0), (8.0, 50.0), (16.0, 30.0), (32.0, 20.0), (64.0, 10.0)],
    swappiness_bounds: (10, 60),
    swappiness_unknown: 60,
    zram_fraction: &[(4.0, 1.0), (8.0, 0.5), (16.0, 0.25), (32.0, 0.125), (64.0, 0.0625)],
    zram_unknown_mb: 2048,
    dirty_ratio: &[(4.0, 20.0), (16.0, 15.0), (64.0, 10.0), (128.0, 5.0)],
    dirty_ratio_unknown: 20,
    dirty_background_min: 3,
    performance_governor: &[AiFlagship, ProWorkstation, GamingEnthusiast],
    default_governor: "schedutil",
    high_latency: &[AiFlagship, GamingEnthusiast],
    medium_latency: &[ProWorkstation, ContentCreator],
    nvidia_drivers: &[(50, "nvidia-570"), (40, "nvidia-550"), (20, "nvidia-535")],
    nvidia_fallback: "nvidia-470",
    amd_drivers: &[(7, "mesa-24")],
    amd_fallback: "mesa-23",
    intel_driver: "mesa-24",
    persistence: &[AiFlagship, ProWorkstation, ContentCreator],
    max_power: &[AiFlagship, ProWorkstation],
    balanced_power: &[GamingEnthusiast, ContentCreator],
    thp_always: &[AiFlagship, ProWorkstation],
    mitigations_default: "auto",
    fast_nvme_gen: 4,
    read_ahead_fast_nvme_kb: 1024,
    read_ahead_ssd_kb: 512,
    read_ahead_hdd_kb: 256,
    read_ahead_unknown_kb: 128,
};

/// Piecewise-linear interpolation, flat outside the first and last point
pub fn interpolate(points: &[(f64, f64)], x: f64) -> f64 {
    let (Some(first), Some(last)) = (points.first(), points.last()) else {
        return 0.0;
    };
    if x <= first.0 {
        return first.1;
    }
    if x >= last.0 {
        return last.1;
    }
    points
        .windows(2)
        .find(|w| x >= w[0].0 && x <= w[1].0)
        .map(|w| {
            let (x0, y0) = w[0];
            let (x1, y1) = w[1];
            y0 + (y1 - y0) * (x - x0) / (x1 - x0)
        })
        .unwrap_or(last.1)
}

impl TuningTable {
    pub fn swappiness(&self, ram_gb: Option<u32>) -> i64 {
        let Some(ram) = ram_gb else {
            return self.swappiness_unknown;
        };
        let (low, high) = self.swappiness_bounds;
        (interpolate(self.swappiness, ram as f64).round() as i64).clamp(low, high)
    }

    pub fn zram_size_mb(&self, ram_gb: Option<u32>) -> i64 {
        match ram_gb {
            Some(ram) => {
                let fraction = interpolate(self.zram_fraction, ram as f64);
                (ram as f64 * 1024.0 * fraction).round() as i64
            }
            None => self.zram_unknown_mb,
        }
    }

    /// `(dirty_ratio, dirty_background_ratio)`
    pub fn dirty_ratios(&self, ram_gb: Option<u32>) -> (i64, i64) {
        let ratio = ram_gb
            .map(|ram| interpolate(self.dirty_ratio, ram as f64).round() as i64)
            .unwrap_or(self.dirty_ratio_unknown);
        (ratio, (ratio / 2).max(self.dirty_background_min))
    }

    pub fn governor(&self, profile: SystemProfile) -> &'static str {
        if self.performance_governor.contains(&profile) {
            "performance"
        } else {
            self.default_governor
        }
    }

    pub fn latency(&self, profile: SystemProfile) -> LatencySensitivity {
        if self.high_latency.contains(&profile) {
            LatencySensitivity::High
        } else if self.medium_latency.contains(&profile) {
            LatencySensitivity::Medium
        } else {
            LatencySensitivity::Low
        }
    }

    pub fn max_cstate(&self, profile: SystemProfile) -> i64 {
        match self.latency(profile) {
            LatencySensitivity::High => 1,
            LatencySensitivity::Medium => 3,
            LatencySensitivity::Low => 8,
        }
    }

    /// Driver package for the primary accelerator, `"none"` without one
    pub fn driver_tier(&self, gpu: Option<(GpuVendor, Option<u32>)>) -> &'static str {
        let pick = |matrix: &[(u32, &'static str)], gen: Option<u32>, fallback: &'static str| {
            gen.and_then(|g| matrix.iter().find(|(min, _)| g >= *min).map(|(_, pkg)| *pkg))
                .unwrap_or(fallback)
        };
        match gpu {
            Some((GpuVendor::Nvidia, gen)) => pick(self.nvidia_drivers, gen, self.nvidia_fallback),
            Some((GpuVendor::Amd, gen)) => pick(self.amd_drivers, gen, self.amd_fallback),
            Some((GpuVendor::Intel, _)) => self.intel_driver,
            Some((GpuVendor::Other, _)) | None => "none",
        }
    }

    pub fn persistence_mode(&self, profile: SystemProfile) -> bool {
        self.persistence.contains(&profile)
    }

    pub fn power_mode(&self, profile: SystemProfile) -> &'static str {
        if self.max_power.contains(&profile) {
            "max_performance"
        } else if self.balanced_power.contains(&profile) {
            "balanced"
        } else {
            "power_saver"
        }
    }

    pub fn transparent_hugepage(&self, profile: SystemProfile) -> &'static str {
        if self.thp_always.contains(&profile) {
            "always"
        } else {
            "madvise"
        }
    }
}
