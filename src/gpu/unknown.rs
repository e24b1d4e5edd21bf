//! Read-only fallback for DRM devices no vendor backend claims
//!
//! Intel and other display adapters are listed so the device set is complete,
//! but expose no control knobs: their capability bounds are empty, so the
//! manager rejects any power, clock or fan request before it reaches here.

use super::sysfs::{drm_cards, find_hwmon, hwmon_temperature, hwmon_watts, read_trimmed, read_u64};
use super::{CapabilityBounds, DiscoveredGpu, GpuBackend, GpuConfig, GpuDevice, GpuStatus, GpuVendor};
use crate::error::{Result, TunerError};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Debug)]
pub struct UnknownBackend {
    root: PathBuf,
    devices: Mutex<HashMap<String, PathBuf>>,
}

impl UnknownBackend {
    pub fn system() -> Self {
        Self::with_root("/")
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            devices: Mutex::new(HashMap::new()),
        }
    }
}

fn claimed_elsewhere(vendor: GpuVendor) -> bool {
    matches!(vendor, GpuVendor::Nvidia | GpuVendor::Amd)
}

#[async_trait]
impl GpuBackend for UnknownBackend {
    fn name(&self) -> &'static str {
        "drm"
    }

    async fn enumerate(&self) -> Result<Vec<DiscoveredGpu>> {
        let cards = drm_cards(&self.root)
            .map_err(|e| TunerError::BackendUnavailable(format!("no DRM class: {}", e)))?;

        let mut found = Vec::new();
        let mut paths = HashMap::new();
        for card in cards.into_iter().filter(|c| !claimed_elsewhere(c.vendor)) {
            let device_id = read_trimmed(&card.device.join("device")).unwrap_or_default();
            found.push(DiscoveredGpu {
                vendor: card.vendor,
                name: format!("{} display adapter [{}]", card.vendor, device_id),
                bus_id: card.bus_id.clone(),
                vram_total: read_u64(&card.device.join("mem_info_vram_total")).unwrap_or(0),
                capabilities: CapabilityBounds::default(),
            });
            paths.insert(card.bus_id, card.device);
        }
        if let Ok(mut map) = self.devices.lock() {
            *map = paths;
        }
        Ok(found)
    }

    async fn sample(&self, device: &GpuDevice) -> Result<GpuStatus> {
        let path = self
            .devices
            .lock()
            .ok()
            .and_then(|m| m.get(&device.bus_id).cloned())
            .ok_or_else(|| TunerError::NotFound(format!("DRM device {}", device.bus_id)))?;
        let hwmon = find_hwmon(&path);
        let mut status = GpuStatus::empty(device.index);
        status.temperature_c = hwmon.as_deref().and_then(hwmon_temperature);
        status.power_draw_w = hwmon.as_deref().and_then(|h| hwmon_watts(h, "power1_input"));
        status.memory_total = device.vram_total;
        status.sample_timestamp = Utc::now();
        Ok(status)
    }

    async fn apply(&self, device: &GpuDevice, config: &GpuConfig) -> Result<()> {
        log::info!(
            "drm: GPU {} has no control interface; {} recorded only",
            device.index,
            config.power_mode
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[tokio::test]
    async fn test_lists_only_unclaimed_vendors() {
        let dir = tempfile::tempdir().unwrap();
        for (card, vendor) in [("card0", "0x8086"), ("card1", "0x10de"), ("card2", "0x1002")] {
            let device = dir.path().join("sys/class/drm").join(card).join("device");
            fs::create_dir_all(&device).unwrap();
            fs::write(device.join("vendor"), vendor).unwrap();
            fs::write(device.join("device"), "0xa780").unwrap();
        }
        let hwmon = dir.path().join("sys/class/drm/card0/device/hwmon/hwmon0");
        fs::create_dir_all(&hwmon).unwrap();
        fs::write(hwmon.join("temp1_input"), "48000").unwrap();

        let backend = UnknownBackend::with_root(dir.path());
        let found = backend.enumerate().await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].vendor, GpuVendor::Intel);
        assert_eq!(found[0].bus_id, "card0");
        assert_eq!(found[0].capabilities, CapabilityBounds::default());

        let device = found[0].clone().into_device(4);
        let status = backend.sample(&device).await.unwrap();
        assert_eq!(status.index, 4);
        assert_eq!(status.temperature_c, Some(48.0));
        assert_eq!(status.utilization, None);
    }
}
