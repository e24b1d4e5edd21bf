// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! AMD GPU backend over the amdgpu sysfs interface
//!
//! Monitoring reads the DRM device directory and its hwmon node:
//! - `gpu_busy_percent`, `mem_info_vram_{used,total}`
//! - `pp_dpm_sclk` / `pp_dpm_mclk` for current clocks
//! - hwmon `temp1_input`, `power1_average`, `power1_cap`, `pwm1`
//!
//! Configuration writes `power_dpm_force_performance_level`, `power1_cap`
//! and, with a fan curve, `pwm1_enable`/`pwm1`. The whole set is written as
//! one unit; if any write fails the earlier ones are restored.

use super::sysfs::{
    current_dpm_mhz, drm_cards, find_hwmon, hwmon_temperature, hwmon_watts, read_trimmed,
    read_u64, write_attr,
};
use super::{
    target_power_limit, CapabilityBounds, DiscoveredGpu, GpuBackend, GpuClocks, GpuConfig,
    GpuDevice, GpuStatus, GpuVendor, PowerMode, ValueRange,
};
use crate::error::{Result, TunerError};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// AMD GPUs driven by amdgpu
#[derive(Debug)]
pub struct AmdBackend {
    root: PathBuf,
    devices: Mutex<HashMap<String, PathBuf>>,
}

impl AmdBackend {
    pub fn system() -> Self {
        Self::with_root("/")
    }

    /// Backend over a mirrored sysfs tree
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            devices: Mutex::new(HashMap::new()),
        }
    }

    fn device_path(&self, device: &GpuDevice) -> Result<PathBuf> {
        self.devices
            .lock()
            .ok()
            .and_then(|m| m.get(&device.bus_id).cloned())
            .ok_or_else(|| TunerError::NotFound(format!("amdgpu device {}", device.bus_id)))
    }
}

fn read_name(device: &Path) -> String {
    read_trimmed(&device.join("product_name"))
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| {
            let id = read_trimmed(&device.join("device")).unwrap_or_default();
            format!("AMD Radeon [{}]", id)
        })
}

fn read_capabilities(device: &Path) -> CapabilityBounds {
    let hwmon = find_hwmon(device);
    let power_limit_w = hwmon.as_deref().and_then(|h| {
        match (hwmon_watts(h, "power1_cap_min"), hwmon_watts(h, "power1_cap_max")) {
            (Some(min), Some(max)) if max > min => Some(ValueRange::new(min, max)),
            _ => None,
        }
    });
    let fan_control = hwmon
        .as_deref()
        .map(|h| h.join("pwm1").exists() && h.join("pwm1_enable").exists())
        .unwrap_or(false);
    CapabilityBounds {
        power_limit_w,
        temp_target_c: None,
        core_clock_offset_mhz: None,
        memory_clock_offset_mhz: None,
        fan_control,
    }
}

pub(crate) fn read_status(device: &Path, index: u32) -> GpuStatus {
    let hwmon = find_hwmon(device);
    let h = hwmon.as_deref();
    GpuStatus {
        index,
        temperature_c: h.and_then(hwmon_temperature),
        power_draw_w: h.and_then(|h| {
            hwmon_watts(h, "power1_average").or_else(|| hwmon_watts(h, "power1_input"))
        }),
        power_limit_w: h.and_then(|h| hwmon_watts(h, "power1_cap")),
        utilization: read_u64(&device.join("gpu_busy_percent")).map(|v| v as f64),
        memory_used: read_u64(&device.join("mem_info_vram_used")).unwrap_or(0),
        memory_total: read_u64(&device.join("mem_info_vram_total")).unwrap_or(0),
        clocks: GpuClocks {
            graphics_mhz: read_trimmed(&device.join("pp_dpm_sclk"))
                .as_deref()
                .and_then(current_dpm_mhz),
            memory_mhz: read_trimmed(&device.join("pp_dpm_mclk"))
                .as_deref()
                .and_then(current_dpm_mhz),
        },
        fan_speed: h
            .and_then(|h| read_u64(&h.join("pwm1")))
            .map(|pwm| (pwm as f64 / 255.0 * 100.0).round()),
        sample_timestamp: Utc::now(),
        stale: false,
    }
}

fn performance_level(mode: PowerMode) -> &'static str {
    match mode {
        PowerMode::PowerSaver => "low",
        PowerMode::Balanced => "auto",
        PowerMode::MaxPerformance => "high",
    }
}

/// Attribute writes a configuration needs, in order
pub(crate) fn planned_writes(
    device: &Path,
    bounds: &CapabilityBounds,
    config: &GpuConfig,
) -> Vec<(PathBuf, String)> {
    let mut writes = vec![(
        device.join("power_dpm_force_performance_level"),
        performance_level(config.power_mode).to_string(),
    )];
    let Some(hwmon) = find_hwmon(device) else {
        return writes;
    };

    let default_cap = hwmon_watts(&hwmon, "power1_cap_default");
    if let Some(watts) = target_power_limit(config, bounds, default_cap) {
        writes.push((
            hwmon.join("power1_cap"),
            format!("{}", (watts * 1_000_000.0).round() as u64),
        ));
    }
    if let Some(curve) = config.fan_curve.as_ref().filter(|_| bounds.fan_control) {
        let temp = hwmon_temperature(&hwmon).unwrap_or(100.0);
        let pwm = (curve.speed_at(temp) / 100.0 * 255.0).round() as u64;
        writes.push((hwmon.join("pwm1_enable"), "1".to_string()));
        writes.push((hwmon.join("pwm1"), pwm.min(255).to_string()));
    } else if bounds.fan_control {
        // hand fan control back to the firmware
        writes.push((hwmon.join("pwm1_enable"), "2".to_string()));
    }
    writes
}

/// Write all attributes or none of them
pub(crate) fn write_atomically(writes: &[(PathBuf, String)]) -> Result<()> {
    let mut done: Vec<(&Path, Option<String>)> = Vec::with_capacity(writes.len());
    for (path, value) in writes {
        let previous = read_trimmed(path);
        if let Err(e) = write_attr(path, value) {
            for (written, prior) in done.iter().rev() {
                if let Some(prior) = prior {
                    if let Err(restore) = write_attr(written, prior) {
                        log::warn!("amdgpu: failed to restore {}: {}", written.display(), restore);
                    }
                }
            }
            return Err(TunerError::apply(
                "gpu_config",
                format!("{}: {}", path.display(), e),
            ));
        }
        done.push((path.as_path(), previous));
    }
    Ok(())
}

#[async_trait]
impl GpuBackend for AmdBackend {
    fn name(&self) -> &'static str {
        "amdgpu"
    }

    async fn enumerate(&self) -> Result<Vec<DiscoveredGpu>> {
        let root = self.root.clone();
        let cards = tokio::task::spawn_blocking(move || drm_cards(&root))
            .await
            .map_err(|e| TunerError::BackendUnavailable(format!("amdgpu scan: {}", e)))?
            .map_err(|e| TunerError::BackendUnavailable(format!("no DRM class: {}", e)))?;

        let mut found = Vec::new();
        let mut paths = HashMap::new();
        for card in cards.into_iter().filter(|c| c.vendor == GpuVendor::Amd) {
            found.push(DiscoveredGpu {
                vendor: GpuVendor::Amd,
                name: read_name(&card.device),
                bus_id: card.bus_id.clone(),
                vram_total: read_u64(&card.device.join("mem_info_vram_total")).unwrap_or(0),
                capabilities: read_capabilities(&card.device),
            });
            paths.insert(card.bus_id, card.device);
        }
        if found.is_empty() {
            return Err(TunerError::BackendUnavailable("no amdgpu devices".into()));
        }
        if let Ok(mut map) = self.devices.lock() {
            *map = paths;
        }
        Ok(found)
    }

    async fn sample(&self, device: &GpuDevice) -> Result<GpuStatus> {
        let path = self.device_path(device)?;
        let index = device.index;
        tokio::task::spawn_blocking(move || read_status(&path, index))
            .await
            .map_err(|e| TunerError::CommandFailed(format!("amdgpu sample: {}", e)))
    }

    async fn apply(&self, device: &GpuDevice, config: &GpuConfig) -> Result<()> {
        let path = self.device_path(device)?;
        let bounds = device.capabilities.clone();
        let config = config.clone();
        log::info!(
            "amdgpu: GPU {} -> {} (power limit {:?})",
            device.index,
            config.power_mode,
            config.power_limit_w
        );
        tokio::task::spawn_blocking(move || {
            let writes = planned_writes(&path, &bounds, &config);
            write_atomically(&writes)
        })
        .await
        .map_err(|e| TunerError::apply("gpu_config", e))?
    }
}
