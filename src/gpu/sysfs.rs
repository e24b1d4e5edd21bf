//! DRM and hwmon sysfs helpers shared by the sysfs-based backends

use super::GpuVendor;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// A `/sys/class/drm/cardN` node
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DrmCard {
    pub card: String,
    /// `cardN/device`
    pub device: PathBuf,
    pub vendor: GpuVendor,
    pub bus_id: String,
}

pub(crate) fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

pub(crate) fn read_u64(path: &Path) -> Option<u64> {
    read_trimmed(path)?.parse().ok()
}

pub(crate) fn write_attr(path: &Path, value: &str) -> io::Result<()> {
    fs::write(path, value)
}

/// Every DRM card under `root`, sorted by card name
pub(crate) fn drm_cards(root: &Path) -> io::Result<Vec<DrmCard>> {
    let mut cards = Vec::new();
    for entry in fs::read_dir(root.join("sys/class/drm"))?.flatten() {
        let card = entry.file_name().to_string_lossy().into_owned();
        let is_card = card
            .strip_prefix("card")
            .map(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
            .unwrap_or(false);
        if !is_card {
            continue;
        }
        let device = entry.path().join("device");
        let Some(vendor) = read_trimmed(&device.join("vendor")) else {
            continue;
        };
        let bus_id = fs::read_to_string(device.join("uevent"))
            .ok()
            .and_then(|u| {
                u.lines()
                    .find_map(|l| l.strip_prefix("PCI_SLOT_NAME="))
                    .map(|s| s.trim().to_string())
            })
            .unwrap_or_else(|| card.clone());
        cards.push(DrmCard {
            card,
            device,
            vendor: GpuVendor::from_pci_id(&vendor),
            bus_id,
        });
    }
    cards.sort_by(|a, b| a.card.cmp(&b.card));
    Ok(cards)
}

/// First hwmon directory of a device
pub(crate) fn find_hwmon(device: &Path) -> Option<PathBuf> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(device.join("hwmon"))
        .ok()?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    dirs.into_iter().next()
}

/// Temperature in °C from `temp1_input` (millidegrees)
pub(crate) fn hwmon_temperature(hwmon: &Path) -> Option<f64> {
    read_u64(&hwmon.join("temp1_input")).map(|m| m as f64 / 1000.0)
}

/// Watts from a microwatt attribute
pub(crate) fn hwmon_watts(hwmon: &Path, attr: &str) -> Option<f64> {
    read_u64(&hwmon.join(attr)).map(|uw| uw as f64 / 1_000_000.0)
}

/// Active level of a `pp_dpm_*` table (`1: 2500Mhz *`)
pub(crate) fn current_dpm_mhz(content: &str) -> Option<u32> {
    content
        .lines()
        .find(|l| l.trim_end().ends_with('*'))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|freq| {
            freq.trim_end_matches(|c: char| c.is_ascii_alphabetic())
                .parse()
                .ok()
        })
}
