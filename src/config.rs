// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! Tuner configuration
//!
//! Every section carries `#[serde(default)]`: missing keys fall back to the
//! documented defaults and unrecognized keys are ignored.

use crate::error::{Result, TunerError};
use crate::gpu::alerts::AlertRule;
use crate::gpu::balancer::{Strategy, StrategyWeights};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default telemetry stream port
pub const DEFAULT_TELEMETRY_PORT: u16 = 9313;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TunerConfig {
    pub tuning: TuningConfig,
    pub monitoring: MonitoringConfig,
    pub alerts: AlertConfig,
    pub load_balancing: LoadBalancingConfig,
    pub telemetry: TelemetryConfig,
    pub store: StoreConfig,
}

/// Tuning resolver and applier settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningConfig {
    /// Explicit `mitigations=` kernel flag; `None` keeps the policy default
    pub mitigations: Option<String>,
    /// Filesystem root the applier writes under
    pub target_root: PathBuf,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            mitigations: None,
            target_root: PathBuf::from("/"),
        }
    }
}

/// Accelerator polling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub interval_ms: u64,
    pub backend_timeout_ms: u64,
    /// Samples retained per device
    pub history_capacity: usize,
    pub anomaly_window: usize,
    pub anomaly_min_samples: usize,
    pub anomaly_z_threshold: f64,
    /// Per-subscriber event buffer
    pub event_buffer: usize,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            backend_timeout_ms: 2000,
            history_capacity: 120,
            anomaly_window: 60,
            anomaly_min_samples: 10,
            anomaly_z_threshold: 3.0,
            event_buffer: 1000,
        }
    }
}

impl MonitoringConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms.max(1))
    }
}

/// Alert rules evaluated on every sample
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub rules: Vec<AlertRule>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            rules: AlertRule::defaults(),
        }
    }
}

/// Load balancer settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancingConfig {
    pub enabled: bool,
    pub strategy: Strategy,
    /// Only consulted by the custom strategy
    pub weights: StrategyWeights,
}

/// Telemetry stream settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub bind_address: String,
    pub port: u16,
    pub history_capacity: usize,
    pub subscriber_buffer: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".into(),
            port: DEFAULT_TELEMETRY_PORT,
            history_capacity: 60,
            subscriber_buffer: 64,
        }
    }
}

impl TelemetryConfig {
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// Persistence store location
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/lib/situne"),
        }
    }
}

impl TunerConfig {
    /// Load from TOML file
    pub fn from_toml_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            TunerError::Configuration(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// Parse from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| TunerError::Configuration(format!("TOML parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that parse but cannot be honored
    pub fn validate(&self) -> Result<()> {
        let mut kinds = Vec::with_capacity(self.alerts.rules.len());
        for rule in &self.alerts.rules {
            if kinds.contains(&rule.kind) {
                return Err(TunerError::Configuration(format!(
                    "alerts: more than one rule for {:?}",
                    rule.kind
                )));
            }
            kinds.push(rule.kind);
        }
        Ok(())
    }

    /// Apply `SITUNE_*` environment overrides
    pub fn with_env_overrides(mut self) -> Result<Self> {
        self.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(self)
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(port) = lookup("SITUNE_TELEMETRY_PORT") {
            self.telemetry.port = port.parse().map_err(|_| {
                TunerError::Configuration(format!("SITUNE_TELEMETRY_PORT: invalid port {}", port))
            })?;
        }
        if let Some(dir) = lookup("SITUNE_STATE_DIR") {
            self.store.dir = PathBuf::from(dir);
        }
        if let Some(flag) = lookup("SITUNE_MITIGATIONS") {
            self.tuning.mitigations = Some(flag);
        }
        Ok(())
    }

    /// Generate sample config
    pub fn sample_toml() -> String {
        r#"# Silicon Tuner configuration

[tuning]
# mitigations = "off"        # overrides the policy default ("auto")
target_root = "/"

[monitoring]
interval_ms = 1000
backend_timeout_ms = 2000
history_capacity = 120
anomaly_window = 60
anomaly_min_samples = 10
anomaly_z_threshold = 3.0
event_buffer = 1000

[[alerts.rules]]
kind = "thermal_warning"
threshold = 85.0
margin = 5.0

[[alerts.rules]]
kind = "thermal_critical"
threshold = 95.0
margin = 5.0

[[alerts.rules]]
kind = "vram_pressure"
threshold = 90.0
margin = 5.0

[[alerts.rules]]
kind = "power_limit"
threshold = 95.0
margin = 5.0

[[alerts.rules]]
kind = "memory_pressure"      # system RAM, evaluated by the telemetry aggregator
threshold = 90.0
margin = 5.0

[load_balancing]
enabled = false
strategy = "least_utilized"   # thermal_optimized, power_efficient, memory_optimized, performance_optimized, custom
# [load_balancing.weights]
# utilization = 0.5
# thermal = 0.3
# power = 0.2

[telemetry]
bind_address = "127.0.0.1"
port = 9313
history_capacity = 60
subscriber_buffer = 64

[store]
dir = "/var/lib/situne"
"#
        .into()
    }
}
