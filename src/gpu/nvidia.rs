//! NVIDIA backend driven by `nvidia-smi`
//!
//! Devices are addressed by PCI bus id so indices assigned by the driver can
//! change across reboots without confusing the manager. All queries use
//! `--format=csv,noheader,nounits`; fields the driver cannot report come back
//! as `[N/A]` or `[Not Supported]` and map to `None`.

use super::{
    target_power_limit, CapabilityBounds, DiscoveredGpu, GpuBackend, GpuClocks, GpuConfig,
    GpuDevice, GpuStatus, GpuVendor, ValueRange,
};
use crate::error::{Result, TunerError};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::process::Command;

const MIB: u64 = 1024 * 1024;

const INVENTORY_FIELDS: &str =
    "pci.bus_id,name,memory.total,power.min_limit,power.max_limit,power.default_limit";

const STATUS_FIELDS: &str = "temperature.gpu,power.draw,power.limit,utilization.gpu,\
memory.used,memory.total,clocks.gr,clocks.mem,fan.speed";

/// NVIDIA GPUs through the driver's management CLI
#[derive(Debug)]
pub struct NvidiaBackend {
    binary: String,
    default_limits: Mutex<HashMap<String, f64>>,
}

impl Default for NvidiaBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl NvidiaBackend {
    pub fn new() -> Self {
        Self::with_binary("nvidia-smi")
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            default_limits: Mutex::new(HashMap::new()),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    TunerError::BackendUnavailable(format!("{} not installed", self.binary))
                }
                _ => TunerError::CommandFailed(format!("{}: {}", self.binary, e)),
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let message = if stderr.trim().is_empty() { stdout } else { stderr };
            return Err(TunerError::CommandFailed(format!(
                "{} {}: {}",
                self.binary,
                args.join(" "),
                message.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn default_limit(&self, bus_id: &str) -> Option<f64> {
        self.default_limits
            .lock()
            .ok()
            .and_then(|m| m.get(bus_id).copied())
    }

    async fn set_power_limit(&self, device: &GpuDevice, watts: f64) -> Result<()> {
        let value = format!("{:.0}", watts);
        self.run(&["-i", &device.bus_id, "-pl", &value])
            .await
            .map(|_| ())
            .map_err(|e| TunerError::apply("gpu_power_limit", e))
    }
}

fn parse_field(raw: &str) -> Option<f64> {
    let value = raw.trim();
    if value.is_empty() || value.starts_with('[') || value.eq_ignore_ascii_case("n/a") {
        return None;
    }
    value.parse().ok()
}

fn split_csv(line: &str) -> Vec<&str> {
    line.split(',').map(str::trim).collect()
}

/// Parse one line of the inventory query. Returns the device and its
/// default power limit.
pub(crate) fn parse_inventory_line(line: &str) -> Option<(DiscoveredGpu, Option<f64>)> {
    let fields = split_csv(line);
    if fields.len() < 6 || fields[0].is_empty() {
        return None;
    }
    let power_limit = match (parse_field(fields[3]), parse_field(fields[4])) {
        (Some(min), Some(max)) if max >= min => Some(ValueRange::new(min, max)),
        _ => None,
    };
    let gpu = DiscoveredGpu {
        vendor: GpuVendor::Nvidia,
        name: fields[1].to_string(),
        bus_id: fields[0].to_string(),
        vram_total: parse_field(fields[2]).map(|m| m as u64 * MIB).unwrap_or(0),
        capabilities: CapabilityBounds {
            power_limit_w: power_limit,
            temp_target_c: None,
            core_clock_offset_mhz: None,
            memory_clock_offset_mhz: None,
            fan_control: false,
        },
    };
    Some((gpu, parse_field(fields[5])))
}

/// Parse one line of the status query
pub(crate) fn parse_status_line(index: u32, line: &str) -> Result<GpuStatus> {
    let fields = split_csv(line);
    if fields.len() < 9 {
        return Err(TunerError::Parse(format!(
            "expected 9 status fields, got {}: '{}'",
            fields.len(),
            line
        )));
    }
    let mib = |i: usize| parse_field(fields[i]).map(|v| v as u64 * MIB).unwrap_or(0);
    Ok(GpuStatus {
        index,
        temperature_c: parse_field(fields[0]),
        power_draw_w: parse_field(fields[1]),
        power_limit_w: parse_field(fields[2]),
        utilization: parse_field(fields[3]),
        memory_used: mib(4),
        memory_total: mib(5),
        clocks: GpuClocks {
            graphics_mhz: parse_field(fields[6]).map(|v| v as u32),
            memory_mhz: parse_field(fields[7]).map(|v| v as u32),
        },
        fan_speed: parse_field(fields[8]),
        sample_timestamp: Utc::now(),
        stale: false,
    })
}

#[async_trait]
impl GpuBackend for NvidiaBackend {
    fn name(&self) -> &'static str {
        "nvidia"
    }

    async fn enumerate(&self) -> Result<Vec<DiscoveredGpu>> {
        let query = format!("--query-gpu={}", INVENTORY_FIELDS);
        let output = self
            .run(&[&query, "--format=csv,noheader,nounits"])
            .await
            .map_err(|e| match e {
                TunerError::CommandFailed(msg) => TunerError::BackendUnavailable(msg),
                other => other,
            })?;

        let mut devices = Vec::new();
        let mut defaults = HashMap::new();
        for line in output.lines().filter(|l| !l.trim().is_empty()) {
            match parse_inventory_line(line) {
                Some((gpu, default_limit)) => {
                    if let Some(limit) = default_limit {
                        defaults.insert(gpu.bus_id.clone(), limit);
                    }
                    devices.push(gpu);
                }
                None => log::warn!("nvidia: unparseable inventory line '{}'", line),
            }
        }
        if let Ok(mut map) = self.default_limits.lock() {
            *map = defaults;
        }
        Ok(devices)
    }

    async fn sample(&self, device: &GpuDevice) -> Result<GpuStatus> {
        let query = format!("--query-gpu={}", STATUS_FIELDS);
        let output = self
            .run(&["-i", &device.bus_id, &query, "--format=csv,noheader,nounits"])
            .await?;
        let line = output
            .lines()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| TunerError::Parse("empty nvidia-smi output".into()))?;
        parse_status_line(device.index, line)
    }

    async fn apply(&self, device: &GpuDevice, config: &GpuConfig) -> Result<()> {
        let Some(target) = target_power_limit(
            config,
            &device.capabilities,
            self.default_limit(&device.bus_id),
        ) else {
            log::debug!("nvidia: nothing to change on GPU {}", device.index);
            return Ok(());
        };
        log::info!(
            "nvidia: GPU {} power limit -> {:.0} W ({})",
            device.index,
            target,
            config.power_mode
        );
        self.set_power_limit(device, target).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_inventory_line() {
        let (gpu, default) = parse_inventory_line(
            "00000000:01:00.0, NVIDIA GeForce RTX 4090, 24564, 150.00, 600.00, 450.00",
        )
        .unwrap();
        assert_eq!(gpu.bus_id, "00000000:01:00.0");
        assert_eq!(gpu.name, "NVIDIA GeForce RTX 4090");
        assert_eq!(gpu.vram_total, 24564 * MIB);
        assert_eq!(gpu.capabilities.power_limit_w, Some(ValueRange::new(150.0, 600.0)));
        assert_eq!(default, Some(450.0));
        assert!(!gpu.capabilities.fan_control);
    }

    #[test]
    fn test_parse_inventory_without_power_control() {
        let (gpu, default) = parse_inventory_line(
            "00000000:02:00.0, Tesla T4, 15360, [N/A], [N/A], [Not Supported]",
        )
        .unwrap();
        assert_eq!(gpu.capabilities.power_limit_w, None);
        assert_eq!(default, None);
        assert!(parse_inventory_line("garbage").is_none());
    }

    #[test]
    fn test_parse_status_line() {
        let status =
            parse_status_line(1, "45, 35.20, 450.00, 3, 1024, 24564, 210, 405, 30").unwrap();
        assert_eq!(status.index, 1);
        assert_eq!(status.temperature_c, Some(45.0));
        assert_eq!(status.power_draw_w, Some(35.2));
        assert_eq!(status.utilization, Some(3.0));
        assert_eq!(status.memory_used, 1024 * MIB);
        assert_eq!(status.clocks.graphics_mhz, Some(210));
        assert_eq!(status.fan_speed, Some(30.0));
        assert!(!status.stale);

        let passive = parse_status_line(0, "60, [N/A], [N/A], 0, 0, 15360, 300, 5000, [N/A]").unwrap();
        assert_eq!(passive.power_draw_w, None);
        assert_eq!(passive.fan_speed, None);
        assert!(parse_status_line(0, "1, 2, 3").is_err());
    }

    #[test]
    fn test_target_power_limit() {
        let bounds = CapabilityBounds {
            power_limit_w: Some(ValueRange::new(100.0, 500.0)),
            ..Default::default()
        };
        let mut cfg = GpuConfig::max_performance();
        assert_eq!(target_power_limit(&cfg, &bounds, Some(450.0)), Some(500.0));
        cfg.power_limit_w = Some(320.0);
        assert_eq!(target_power_limit(&cfg, &bounds, Some(450.0)), Some(320.0));
        assert_eq!(target_power_limit(&GpuConfig::power_saver(), &bounds, None), Some(200.0));
        assert_eq!(target_power_limit(&GpuConfig::balanced(), &bounds, Some(450.0)), Some(450.0));
        assert_eq!(
            target_power_limit(&GpuConfig::balanced(), &CapabilityBounds::default(), None),
            None
        );
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let backend = NvidiaBackend::with_binary("/nonexistent/nvidia-smi-for-tests");
        let err = backend.enumerate().await.unwrap_err();
        assert!(matches!(err, TunerError::BackendUnavailable(_)));
    }
}
