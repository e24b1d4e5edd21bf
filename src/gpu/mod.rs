//! Accelerator data model and vendor backend interface
//!
//! The manager only talks to [`GpuBackend`]. Three implementations exist:
//! [`nvidia::NvidiaBackend`] (driver CLI), [`amd::AmdBackend`] (amdgpu sysfs)
//! and [`unknown::UnknownBackend`] (read-only DRM fallback).

pub mod alerts;
pub mod amd;
pub mod anomaly;
pub mod balancer;
pub mod manager;
pub mod nvidia;
pub mod prediction;
pub mod unknown;

mod sysfs;

pub use manager::{AcceleratorManager, DeviceState, ManagerEvent};

use crate::error::{Result, TunerError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// GPU vendor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Other,
}

impl GpuVendor {
    /// Map a PCI vendor id (`0x10de`) to a vendor
    pub fn from_pci_id(id: &str) -> Self {
        let hex = id.trim().trim_start_matches("0x").trim_start_matches("0X");
        match u16::from_str_radix(hex, 16) {
            Ok(0x10de) => GpuVendor::Nvidia,
            Ok(0x1002) => GpuVendor::Amd,
            Ok(0x8086) => GpuVendor::Intel,
            _ => GpuVendor::Other,
        }
    }
}

impl fmt::Display for GpuVendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuVendor::Nvidia => write!(f, "NVIDIA"),
            GpuVendor::Amd => write!(f, "AMD"),
            GpuVendor::Intel => write!(f, "Intel"),
            GpuVendor::Other => write!(f, "Unknown"),
        }
    }
}

/// Inclusive numeric range reported by a device
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// What a device allows to be configured. `None` means not controllable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityBounds {
    pub power_limit_w: Option<ValueRange>,
    pub temp_target_c: Option<ValueRange>,
    pub core_clock_offset_mhz: Option<ValueRange>,
    pub memory_clock_offset_mhz: Option<ValueRange>,
    pub fan_control: bool,
}

/// A managed accelerator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuDevice {
    /// Stable for the lifetime of the manager
    pub index: u32,
    pub vendor: GpuVendor,
    pub name: String,
    pub bus_id: String,
    /// Bytes
    pub vram_total: u64,
    pub capabilities: CapabilityBounds,
}

/// Device as reported by a backend, before the manager assigns an index
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredGpu {
    pub vendor: GpuVendor,
    pub name: String,
    pub bus_id: String,
    pub vram_total: u64,
    pub capabilities: CapabilityBounds,
}

impl DiscoveredGpu {
    pub(crate) fn into_device(self, index: u32) -> GpuDevice {
        GpuDevice {
            index,
            vendor: self.vendor,
            name: self.name,
            bus_id: self.bus_id,
            vram_total: self.vram_total,
            capabilities: self.capabilities,
        }
    }
}

/// Current clocks in MHz
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuClocks {
    pub graphics_mhz: Option<u32>,
    pub memory_mhz: Option<u32>,
}

/// One monitoring sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuStatus {
    pub index: u32,
    pub temperature_c: Option<f64>,
    pub power_draw_w: Option<f64>,
    pub power_limit_w: Option<f64>,
    /// Percent
    pub utilization: Option<f64>,
    /// Bytes
    pub memory_used: u64,
    pub memory_total: u64,
    pub clocks: GpuClocks,
    /// Percent
    pub fan_speed: Option<f64>,
    pub sample_timestamp: DateTime<Utc>,
    /// Set when the latest poll missed its deadline; values are from the
    /// previous good sample
    #[serde(default)]
    pub stale: bool,
}

impl GpuStatus {
    /// An empty sample for a device that has not been polled yet
    pub fn empty(index: u32) -> Self {
        Self {
            index,
            temperature_c: None,
            power_draw_w: None,
            power_limit_w: None,
            utilization: None,
            memory_used: 0,
            memory_total: 0,
            clocks: GpuClocks::default(),
            fan_speed: None,
            sample_timestamp: Utc::now(),
            stale: false,
        }
    }

    pub fn vram_percent(&self) -> Option<f64> {
        (self.memory_total > 0).then(|| self.memory_used as f64 / self.memory_total as f64 * 100.0)
    }

    /// Draw as a share of the enforced limit
    pub fn power_percent(&self) -> Option<f64> {
        match (self.power_draw_w, self.power_limit_w) {
            (Some(draw), Some(limit)) if limit > 0.0 => Some(draw / limit * 100.0),
            _ => None,
        }
    }
}

/// Power management policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerMode {
    PowerSaver,
    #[default]
    Balanced,
    MaxPerformance,
}

impl fmt::Display for PowerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerMode::PowerSaver => write!(f, "power_saver"),
            PowerMode::Balanced => write!(f, "balanced"),
            PowerMode::MaxPerformance => write!(f, "max_performance"),
        }
    }
}

/// Point on a fan curve
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FanPoint {
    pub temp_c: f64,
    /// Percent
    pub speed: f64,
}

/// Temperature to fan speed mapping, linearly interpolated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanCurve {
    pub points: Vec<FanPoint>,
}

impl FanCurve {
    fn from_pairs(pairs: &[(f64, f64)]) -> Self {
        Self {
            points: pairs
                .iter()
                .map(|&(temp_c, speed)| FanPoint { temp_c, speed })
                .collect(),
        }
    }

    pub fn standard() -> Self {
        Self::from_pairs(&[(30.0, 30.0), (60.0, 50.0), (75.0, 70.0), (85.0, 100.0)])
    }

    pub fn aggressive() -> Self {
        Self::from_pairs(&[(30.0, 40.0), (50.0, 60.0), (70.0, 85.0), (80.0, 100.0)])
    }

    pub fn quiet() -> Self {
        Self::from_pairs(&[(40.0, 20.0), (65.0, 40.0), (80.0, 70.0), (90.0, 100.0)])
    }

    /// Fan speed for a temperature. Flat beyond the first and last points.
    pub fn speed_at(&self, temp_c: f64) -> f64 {
        let (first, last) = match (self.points.first(), self.points.last()) {
            (Some(f), Some(l)) => (f, l),
            _ => return 100.0,
        };
        if temp_c <= first.temp_c {
            return first.speed;
        }
        if temp_c >= last.temp_c {
            return last.speed;
        }
        for pair in self.points.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            if temp_c <= b.temp_c {
                let span = b.temp_c - a.temp_c;
                if span <= 0.0 {
                    return b.speed;
                }
                return a.speed + (temp_c - a.temp_c) / span * (b.speed - a.speed);
            }
        }
        last.speed
    }

    /// Speeds clamped to 0..=100 and points ordered by temperature
    pub fn normalized(&self) -> Self {
        let mut points: Vec<FanPoint> = self
            .points
            .iter()
            .filter(|p| p.temp_c.is_finite() && p.speed.is_finite())
            .map(|p| FanPoint {
                temp_c: p.temp_c,
                speed: p.speed.clamp(0.0, 100.0),
            })
            .collect();
        points.sort_by(|a, b| a.temp_c.total_cmp(&b.temp_c));
        Self { points }
    }
}

/// Clock offsets in MHz
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ClockOffsets {
    pub core_mhz: i32,
    pub memory_mhz: i32,
}

/// Requested device configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuConfig {
    pub power_mode: PowerMode,
    pub power_limit_w: Option<f64>,
    pub temp_target_c: Option<f64>,
    pub fan_curve: Option<FanCurve>,
    pub clock_offsets: ClockOffsets,
    pub auto_load_balance: bool,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self::balanced()
    }
}

impl GpuConfig {
    pub fn balanced() -> Self {
        Self {
            power_mode: PowerMode::Balanced,
            power_limit_w: None,
            temp_target_c: Some(83.0),
            fan_curve: None,
            clock_offsets: ClockOffsets::default(),
            auto_load_balance: true,
        }
    }

    pub fn max_performance() -> Self {
        Self {
            power_mode: PowerMode::MaxPerformance,
            temp_target_c: Some(90.0),
            fan_curve: Some(FanCurve::aggressive()),
            ..Self::balanced()
        }
    }

    pub fn power_saver() -> Self {
        Self {
            power_mode: PowerMode::PowerSaver,
            temp_target_c: Some(70.0),
            fan_curve: Some(FanCurve::quiet()),
            ..Self::balanced()
        }
    }

    pub fn for_mode(mode: PowerMode) -> Self {
        match mode {
            PowerMode::PowerSaver => Self::power_saver(),
            PowerMode::Balanced => Self::balanced(),
            PowerMode::MaxPerformance => Self::max_performance(),
        }
    }

    /// Check against device bounds and produce the configuration that will
    /// actually be applied. Out-of-range values are rejected; the fan curve
    /// is normalized, or dropped when the device has no fan control.
    pub fn effective_for(&self, bounds: &CapabilityBounds) -> Result<GpuConfig> {
        check_range("power_limit_w", self.power_limit_w, bounds.power_limit_w)?;
        // Temperature targets are advisory on devices without the knob
        if bounds.temp_target_c.is_some() {
            check_range("temp_target_c", self.temp_target_c, bounds.temp_target_c)?;
        }
        check_range(
            "core_clock_offset_mhz",
            (self.clock_offsets.core_mhz != 0).then_some(self.clock_offsets.core_mhz as f64),
            bounds.core_clock_offset_mhz,
        )?;
        check_range(
            "memory_clock_offset_mhz",
            (self.clock_offsets.memory_mhz != 0).then_some(self.clock_offsets.memory_mhz as f64),
            bounds.memory_clock_offset_mhz,
        )?;

        let mut effective = self.clone();
        if bounds.temp_target_c.is_none() {
            effective.temp_target_c = None;
        }
        effective.fan_curve = match &self.fan_curve {
            Some(curve) if bounds.fan_control => Some(curve.normalized()),
            _ => None,
        };
        Ok(effective)
    }
}

fn check_range(field: &str, requested: Option<f64>, range: Option<ValueRange>) -> Result<()> {
    let Some(value) = requested else {
        return Ok(());
    };
    match range {
        Some(r) if r.contains(value) => Ok(()),
        Some(r) => Err(TunerError::OutOfRange {
            field: field.into(),
            requested: value,
            min: r.min,
            max: r.max,
        }),
        None => Err(TunerError::OutOfRange {
            field: field.into(),
            requested: value,
            min: 0.0,
            max: 0.0,
        }),
    }
}

/// Power limit implied by a configuration, if any
pub(crate) fn target_power_limit(
    config: &GpuConfig,
    bounds: &CapabilityBounds,
    default_limit: Option<f64>,
) -> Option<f64> {
    if let Some(explicit) = config.power_limit_w {
        return Some(explicit);
    }
    let range = bounds.power_limit_w?;
    match config.power_mode {
        PowerMode::MaxPerformance => Some(range.max),
        PowerMode::PowerSaver => Some(range.min + (range.max - range.min) * 0.25),
        PowerMode::Balanced => default_limit,
    }
}

/// Vendor-specific device access
#[async_trait]
pub trait GpuBackend: Send + Sync {
    /// Short backend identifier used in logs and device keys
    fn name(&self) -> &'static str;

    /// List devices. `BackendUnavailable` when the driver interface is absent.
    async fn enumerate(&self) -> Result<Vec<DiscoveredGpu>>;

    /// Read one status sample
    async fn sample(&self, device: &GpuDevice) -> Result<GpuStatus>;

    /// Apply an already validated configuration as one atomic unit
    async fn apply(&self, device: &GpuDevice, config: &GpuConfig) -> Result<()>;
}

/// Backends for the running system, in discovery order
pub fn system_backends() -> Vec<Arc<dyn GpuBackend>> {
    vec![
        Arc::new(nvidia::NvidiaBackend::new()),
        Arc::new(amd::AmdBackend::system()),
        Arc::new(unknown::UnknownBackend::system()),
    ]
}

/// Human-readable byte count
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds() -> CapabilityBounds {
        CapabilityBounds {
            power_limit_w: Some(ValueRange::new(100.0, 450.0)),
            temp_target_c: Some(ValueRange::new(65.0, 90.0)),
            core_clock_offset_mhz: Some(ValueRange::new(-200.0, 200.0)),
            memory_clock_offset_mhz: None,
            fan_control: true,
        }
    }

    #[test]
    fn test_vendor_from_pci_id() {
        assert_eq!(GpuVendor::from_pci_id("0x10de\n"), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_pci_id("0x1002"), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_pci_id("8086"), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_pci_id("0x1a03"), GpuVendor::Other);
        assert_eq!(GpuVendor::from_pci_id("garbage"), GpuVendor::Other);
    }

    #[test]
    fn test_fan_curve_interpolation() {
        let curve = FanCurve::standard();
        assert_eq!(curve.speed_at(20.0), 30.0);
        assert_eq!(curve.speed_at(45.0), 40.0);
        assert_eq!(curve.speed_at(85.0), 100.0);
        assert_eq!(curve.speed_at(99.0), 100.0);
        assert_eq!(FanCurve { points: vec![] }.speed_at(50.0), 100.0);
    }

    #[test]
    fn test_fan_curve_normalized() {
        let curve = FanCurve::from_pairs(&[(80.0, 140.0), (40.0, -5.0)]).normalized();
        assert_eq!(curve.points[0], FanPoint { temp_c: 40.0, speed: 0.0 });
        assert_eq!(curve.points[1], FanPoint { temp_c: 80.0, speed: 100.0 });
    }

    #[test]
    fn test_presets() {
        assert_eq!(GpuConfig::balanced().temp_target_c, Some(83.0));
        assert_eq!(GpuConfig::max_performance().temp_target_c, Some(90.0));
        assert_eq!(GpuConfig::power_saver().temp_target_c, Some(70.0));
        assert_eq!(GpuConfig::for_mode(PowerMode::PowerSaver), GpuConfig::power_saver());
    }

    #[test]
    fn test_effective_config_in_range() {
        let cfg = GpuConfig {
            power_limit_w: Some(300.0),
            clock_offsets: ClockOffsets { core_mhz: 150, memory_mhz: 0 },
            ..GpuConfig::max_performance()
        };
        let effective = cfg.effective_for(&bounds()).unwrap();
        assert_eq!(effective.power_limit_w, Some(300.0));
        assert!(effective.fan_curve.is_some());
    }

    #[test]
    fn test_effective_config_rejects_out_of_range() {
        let cfg = GpuConfig {
            power_limit_w: Some(600.0),
            ..GpuConfig::balanced()
        };
        match cfg.effective_for(&bounds()) {
            Err(TunerError::OutOfRange { field, max, .. }) => {
                assert_eq!(field, "power_limit_w");
                assert_eq!(max, 450.0);
            }
            other => panic!("unexpected {:?}", other),
        }

        let cfg = GpuConfig {
            clock_offsets: ClockOffsets { core_mhz: 0, memory_mhz: 500 },
            ..GpuConfig::balanced()
        };
        assert!(matches!(
            cfg.effective_for(&bounds()),
            Err(TunerError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_effective_config_drops_unsupported_fan_curve() {
        let bounds = CapabilityBounds::default();
        let effective = GpuConfig::power_saver().effective_for(&bounds).unwrap();
        assert_eq!(effective.fan_curve, None);
        assert_eq!(effective.temp_target_c, None);
        assert_eq!(effective.power_mode, PowerMode::PowerSaver);
    }

    #[test]
    fn test_status_ratios() {
        let mut status = GpuStatus::empty(0);
        assert_eq!(status.vram_percent(), None);
        status.memory_total = 1000;
        status.memory_used = 500;
        status.power_draw_w = Some(225.0);
        status.power_limit_w = Some(450.0);
        assert_eq!(status.vram_percent(), Some(50.0));
        assert_eq!(status.power_percent(), Some(50.0));
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(24 * 1024 * 1024 * 1024), "24.0 GB");
    }
}
