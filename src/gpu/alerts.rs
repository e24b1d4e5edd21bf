//! Threshold alerts with hysteresis
//!
//! An alert is keyed by (kind, scope, metric). It fires when the metric
//! reaches the rule threshold and stays active until the metric falls to
//! `threshold - margin` or below. While active it never re-fires.

use super::GpuStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Monitored quantity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    TemperatureC,
    VramPercent,
    PowerPercent,
    MemoryPercent,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::TemperatureC => "temperature_c",
            Metric::VramPercent => "vram_percent",
            Metric::PowerPercent => "power_percent",
            Metric::MemoryPercent => "memory_percent",
        }
    }
}

/// Alert type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    ThermalWarning,
    ThermalCritical,
    VramPressure,
    PowerLimit,
    MemoryPressure,
}

impl AlertKind {
    pub fn metric(&self) -> Metric {
        match self {
            AlertKind::ThermalWarning | AlertKind::ThermalCritical => Metric::TemperatureC,
            AlertKind::VramPressure => Metric::VramPercent,
            AlertKind::PowerLimit => Metric::PowerPercent,
            AlertKind::MemoryPressure => Metric::MemoryPercent,
        }
    }

    pub fn default_severity(&self) -> Severity {
        match self {
            AlertKind::ThermalCritical => Severity::Critical,
            _ => Severity::Warning,
        }
    }
}

/// Where an alert applies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertScope {
    Device(u32),
    System,
}

impl fmt::Display for AlertScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertScope::Device(i) => write!(f, "gpu{}", i),
            AlertScope::System => write!(f, "system"),
        }
    }
}

/// Threshold rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub kind: AlertKind,
    pub threshold: f64,
    /// Dead band below the threshold that must be crossed to clear
    pub margin: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
}

impl AlertRule {
    pub fn new(kind: AlertKind, threshold: f64, margin: f64) -> Self {
        Self {
            kind,
            threshold,
            margin,
            severity: None,
        }
    }

    pub fn severity(&self) -> Severity {
        self.severity.unwrap_or_else(|| self.kind.default_severity())
    }

    pub fn clear_level(&self) -> f64 {
        self.threshold - self.margin.max(0.0)
    }

    pub fn defaults() -> Vec<AlertRule> {
        vec![
            AlertRule::new(AlertKind::ThermalWarning, 85.0, 5.0),
            AlertRule::new(AlertKind::ThermalCritical, 95.0, 5.0),
            AlertRule::new(AlertKind::VramPressure, 90.0, 5.0),
            AlertRule::new(AlertKind::PowerLimit, 95.0, 5.0),
            AlertRule::new(AlertKind::MemoryPressure, 90.0, 5.0),
        ]
    }
}

/// A raised (and possibly cleared) alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub scope: AlertScope,
    pub metric: String,
    pub threshold: f64,
    pub observed_value: f64,
    pub severity: Severity,
    pub raised_at: DateTime<Utc>,
    pub cleared_at: Option<DateTime<Utc>>,
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {:?}: {} = {:.1} (threshold {:.1})",
            self.severity, self.scope, self.kind, self.metric, self.observed_value, self.threshold
        )
    }
}

/// State change produced by one evaluation
#[derive(Debug, Clone, PartialEq)]
pub enum AlertTransition {
    Raised(Alert),
    Cleared(Alert),
}

/// Metric values carried by a GPU sample
pub fn device_readings(status: &GpuStatus) -> Vec<(Metric, f64)> {
    let mut readings = Vec::with_capacity(3);
    if let Some(t) = status.temperature_c {
        readings.push((Metric::TemperatureC, t));
    }
    if let Some(v) = status.vram_percent() {
        readings.push((Metric::VramPercent, v));
    }
    if let Some(p) = status.power_percent() {
        readings.push((Metric::PowerPercent, p));
    }
    readings
}

/// Evaluates rules and tracks active alerts
#[derive(Debug, Clone)]
pub struct AlertEngine {
    rules: Vec<AlertRule>,
    active: BTreeMap<(AlertKind, AlertScope, Metric), Alert>,
}

impl AlertEngine {
    /// Only the first rule of each kind is kept so hysteresis state has a
    /// single owner.
    pub fn new(rules: Vec<AlertRule>) -> Self {
        let mut kept: Vec<AlertRule> = Vec::with_capacity(rules.len());
        for rule in rules {
            if kept.iter().any(|r| r.kind == rule.kind) {
                log::warn!("ignoring duplicate alert rule for {:?}", rule.kind);
                continue;
            }
            kept.push(rule);
        }
        Self {
            rules: kept,
            active: BTreeMap::new(),
        }
    }

    pub fn rules(&self) -> &[AlertRule] {
        &self.rules
    }

    /// Feed one set of readings for a scope. Transitions come back in rule order.
    pub fn evaluate(
        &mut self,
        scope: AlertScope,
        readings: &[(Metric, f64)],
        now: DateTime<Utc>,
    ) -> Vec<AlertTransition> {
        let mut transitions = Vec::new();
        for rule in &self.rules {
            let metric = rule.kind.metric();
            let Some(value) = readings
                .iter()
                .find(|(m, _)| *m == metric)
                .map(|&(_, v)| v)
            else {
                continue;
            };
            let key = (rule.kind, scope, metric);

            let is_active = match self.active.get_mut(&key) {
                Some(alert) => {
                    alert.observed_value = value;
                    true
                }
                None => false,
            };

            match is_active {
                true if value <= rule.clear_level() => {
                    if let Some(mut alert) = self.active.remove(&key) {
                        alert.cleared_at = Some(now);
                        transitions.push(AlertTransition::Cleared(alert));
                    }
                }
                true => {}
                false if value >= rule.threshold => {
                    let alert = Alert {
                        kind: rule.kind,
                        scope,
                        metric: metric.as_str().to_string(),
                        threshold: rule.threshold,
                        observed_value: value,
                        severity: rule.severity(),
                        raised_at: now,
                        cleared_at: None,
                    };
                    self.active.insert(key, alert.clone());
                    transitions.push(AlertTransition::Raised(alert));
                }
                false => {}
            }
        }
        transitions
    }

    pub fn active(&self) -> Vec<Alert> {
        self.active.values().cloned().collect()
    }

    /// Whether a critical alert is active for the scope
    pub fn has_critical(&self, scope: AlertScope) -> bool {
        self.active
            .values()
            .any(|a| a.scope == scope && a.severity == Severity::Critical)
    }

    /// Drop all alerts of a scope (device removed), returning them cleared
    pub fn forget(&mut self, scope: AlertScope, now: DateTime<Utc>) -> Vec<Alert> {
        let keys: Vec<_> = self
            .active
            .keys()
            .filter(|(_, s, _)| *s == scope)
            .copied()
            .collect();
        keys.into_iter()
            .filter_map(|k| self.active.remove(&k))
            .map(|mut a| {
                a.cleared_at = Some(now);
                a
            })
            .collect()
    }
}
