//! Parsers for procfs, sysfs and SMBIOS text and binary formats

use super::CpuVendor;
use crate::gpu::GpuVendor;

/// Facts extracted from `/proc/cpuinfo`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CpuFacts {
    pub vendor: Option<CpuVendor>,
    pub model: Option<String>,
    pub logical_cores: u32,
}

pub(crate) fn vendor_from_id(id: &str) -> CpuVendor {
    match id.trim() {
        "GenuineIntel" => CpuVendor::Intel,
        "AuthenticAMD" | "HygonGenuine" => CpuVendor::Amd,
        other if other.starts_with("ARM") || other.starts_with("0x41") => CpuVendor::Arm,
        _ => CpuVendor::Other,
    }
}

/// Parse `/proc/cpuinfo`
pub fn parse_cpuinfo(content: &str) -> CpuFacts {
    let mut facts = CpuFacts::default();
    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "processor" => facts.logical_cores += 1,
            "vendor_id" if facts.vendor.is_none() => facts.vendor = Some(vendor_from_id(value)),
            "CPU implementer" if facts.vendor.is_none() => facts.vendor = Some(CpuVendor::Arm),
            "model name" if facts.model.is_none() && !value.is_empty() => {
                facts.model = Some(value.to_string())
            }
            _ => {}
        }
    }
    facts
}

/// Intel discrete PCI device ids: DG1, Alchemist and Flex, Battlemage
const INTEL_DISCRETE_IDS: [(u16, u16); 3] = [(0x4905, 0x4908), (0x5690, 0x56c1), (0xe202, 0xe212)];

/// Whether an Intel GPU is a discrete card, from its sysfs PCI device id or
/// its marketing name. Integrated parts also say "Arc" but carry no model
/// number after it.
pub fn intel_is_discrete(pci_device: Option<&str>, name: Option<&str>) -> bool {
    let by_id = pci_device
        .and_then(|id| u16::from_str_radix(id.trim().trim_start_matches("0x"), 16).ok())
        .map_or(false, |id| {
            INTEL_DISCRETE_IDS
                .iter()
                .any(|&(lo, hi)| (lo..=hi).contains(&id))
        });
    by_id || name.map_or(false, |n| {
        n.split_whitespace()
            .skip_while(|w| !w.starts_with("Arc"))
            .nth(1)
            .map_or(false, |model| {
                let mut chars = model.chars();
                matches!(chars.next(), Some('A' | 'B'))
                    && chars.take(3).filter(char::is_ascii_digit).count() == 3
            })
    })
}

/// Read one `kB` field from `/proc/meminfo`
pub fn parse_meminfo_kb(content: &str, field: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let (key, rest) = line.split_once(':')?;
        if key.trim() != field {
            return None;
        }
        rest.split_whitespace().next()?.parse().ok()
    })
}

/// Installed RAM as marketed. The kernel reserves a few percent, so
/// `MemTotal` is rounded up to the next even number of GiB.
pub fn nominal_ram_gb(mem_total_kb: u64) -> u32 {
    let gib = mem_total_kb as f64 / (1024.0 * 1024.0);
    ((gib / 2.0).ceil() * 2.0) as u32
}

/// CPU product generation from the marketing name
///
/// Intel: `i9-13900K` → 13, `i7-8700` → 8, `Core Ultra 7 155H` → 1 (series).
/// AMD: `Ryzen 9 7950X` → 7, `Threadripper 3970X` → 3, `EPYC 9654` → 9.
pub fn cpu_generation(vendor: CpuVendor, model: &str) -> Option<u32> {
    match vendor {
        CpuVendor::Intel => intel_generation(model),
        CpuVendor::Amd => amd_generation(model),
        _ => None,
    }
}

fn intel_generation(model: &str) -> Option<u32> {
    if let Some(pos) = model.find("Ultra") {
        let rest = &model[pos + "Ultra".len()..];
        let number = rest.split_whitespace().nth(1)?;
        return number.chars().next()?.to_digit(10);
    }
    // i3/i5/i7/i9-NNNNN
    let pos = ["i3-", "i5-", "i7-", "i9-"]
        .iter()
        .filter_map(|p| model.find(p).map(|i| i + p.len()))
        .next()?;
    let digits: String = model[pos..].chars().take_while(|c| c.is_ascii_digit()).collect();
    match digits.len() {
        5 => digits[..2].parse().ok(),
        4 => digits[..1].parse().ok(),
        _ => None,
    }
}

fn amd_generation(model: &str) -> Option<u32> {
    let mut words = model.split_whitespace();
    while let Some(word) = words.next() {
        if matches!(word, "Ryzen" | "Threadripper" | "EPYC") {
            // "Ryzen 9 7950X" has a tier digit before the model number
            return words
                .find(|w| w.len() >= 4 && w.chars().take(4).all(|c| c.is_ascii_digit()))
                .and_then(|w| w.chars().next())
                .and_then(|c| c.to_digit(10));
        }
    }
    None
}

/// GPU product series from the marketing name
///
/// NVIDIA: `RTX 4090` → 40, `GTX 1080 Ti` → 10, `RTX A6000` → none.
/// AMD: `RX 7900 XTX` → 7, `RX 9070` → 9.
pub fn gpu_generation(vendor: GpuVendor, name: &str) -> Option<u32> {
    let model_number = |prefixes: &[&str]| -> Option<u32> {
        let mut words = name.split_whitespace().peekable();
        while let Some(word) = words.next() {
            if prefixes.contains(&word) {
                let next = words.peek()?;
                let digits: String = next.chars().take_while(|c| c.is_ascii_digit()).collect();
                if digits.len() >= 3 {
                    return digits.parse().ok();
                }
            }
        }
        None
    };
    match vendor {
        GpuVendor::Nvidia => model_number(&["RTX", "GTX"]).map(|n| n / 100),
        GpuVendor::Amd => model_number(&["RX"]).map(|n| n / 1000),
        _ => None,
    }
}

/// PCIe generation from a sysfs `current_link_speed` value
pub fn parse_link_speed_gen(value: &str) -> Option<u32> {
    let gts: f64 = value.split_whitespace().next()?.parse().ok()?;
    let table = [(2.5, 1), (5.0, 2), (8.0, 3), (16.0, 4), (32.0, 5), (64.0, 6)];
    table
        .iter()
        .find(|(speed, _)| (gts - speed).abs() < 0.1)
        .map(|&(_, gen)| gen)
}

/// Speed in MT/s from a raw SMBIOS type 17 (memory device) structure
pub fn smbios_memory_speed(raw: &[u8]) -> Option<u32> {
    const SPEED: usize = 0x15;
    const EXTENDED_SPEED: usize = 0x54;

    if raw.len() < SPEED + 2 || raw[0] != 17 || (raw[1] as usize) < SPEED + 2 {
        return None;
    }
    let word = u16::from_le_bytes([raw[SPEED], raw[SPEED + 1]]);
    match word {
        0 => None,
        0xFFFF => {
            let end = EXTENDED_SPEED + 4;
            if raw.len() < end || (raw[1] as usize) < end {
                return None;
            }
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&raw[EXTENDED_SPEED..end]);
            Some(u32::from_le_bytes(buf)).filter(|&s| s > 0)
        }
        speed => Some(speed as u32),
    }
}
