//! Workload placement across accelerators
//!
//! Every strategy maps a device to a score in `[0, 1]`, higher is better.
//! The best healthy device wins; equal scores go to the lowest index.
//! Confidence is the margin between the winner and the runner-up.

use super::{GpuDevice, GpuStatus};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Score used when a device does not report the metric a strategy needs
const UNKNOWN_SCORE: f64 = 0.5;

/// Load balancing strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    LeastUtilized,
    ThermalOptimized,
    PowerEfficient,
    MemoryOptimized,
    PerformanceOptimized,
    /// Weighted combination of the other strategies
    Custom,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::LeastUtilized => "least_utilized",
            Strategy::ThermalOptimized => "thermal_optimized",
            Strategy::PowerEfficient => "power_efficient",
            Strategy::MemoryOptimized => "memory_optimized",
            Strategy::PerformanceOptimized => "performance_optimized",
            Strategy::Custom => "custom",
        };
        write!(f, "{}", name)
    }
}

/// Weights for [`Strategy::Custom`]; normalized before use
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyWeights {
    pub utilization: f64,
    pub thermal: f64,
    pub power: f64,
    pub memory: f64,
    pub performance: f64,
}

impl Default for StrategyWeights {
    fn default() -> Self {
        Self {
            utilization: 0.5,
            thermal: 0.3,
            power: 0.2,
            memory: 0.0,
            performance: 0.0,
        }
    }
}

/// Kind of work being placed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadType {
    Training,
    Inference,
    Rendering,
    Gaming,
    Compute,
    #[default]
    General,
}

impl fmt::Display for WorkloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkloadType::Training => "training",
            WorkloadType::Inference => "inference",
            WorkloadType::Rendering => "rendering",
            WorkloadType::Gaming => "gaming",
            WorkloadType::Compute => "compute",
            WorkloadType::General => "general",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for WorkloadType {
    type Err = crate::error::TunerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "training" => Ok(WorkloadType::Training),
            "inference" => Ok(WorkloadType::Inference),
            "rendering" => Ok(WorkloadType::Rendering),
            "gaming" => Ok(WorkloadType::Gaming),
            "compute" => Ok(WorkloadType::Compute),
            "general" => Ok(WorkloadType::General),
            other => Err(crate::error::TunerError::NotFound(format!(
                "workload type '{}'",
                other
            ))),
        }
    }
}

/// Scoring inputs for one device
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub index: u32,
    pub utilization: Option<f64>,
    pub temperature_c: Option<f64>,
    pub power_draw_w: Option<f64>,
    pub power_limit_w: Option<f64>,
    pub memory_used: u64,
    pub memory_total: u64,
    pub vram_total: u64,
    /// No active critical alert
    pub healthy: bool,
}

impl Candidate {
    pub fn new(device: &GpuDevice, status: &GpuStatus, healthy: bool) -> Self {
        Self {
            index: device.index,
            utilization: status.utilization,
            temperature_c: status.temperature_c,
            power_draw_w: status.power_draw_w,
            power_limit_w: status.power_limit_w,
            memory_used: status.memory_used,
            memory_total: if status.memory_total > 0 {
                status.memory_total
            } else {
                device.vram_total
            },
            vram_total: device.vram_total,
            healthy,
        }
    }

    fn utilization_score(&self) -> f64 {
        self.utilization
            .map(|u| 1.0 - u / 100.0)
            .unwrap_or(UNKNOWN_SCORE)
    }

    fn thermal_score(&self) -> f64 {
        self.temperature_c
            .map(|t| 1.0 - t / 100.0)
            .unwrap_or(UNKNOWN_SCORE)
    }

    fn power_score(&self) -> f64 {
        match (self.power_draw_w, self.power_limit_w) {
            (Some(draw), Some(limit)) if limit > 0.0 => 1.0 - draw / limit,
            _ => UNKNOWN_SCORE,
        }
    }

    fn memory_score(&self) -> f64 {
        if self.memory_total == 0 {
            return UNKNOWN_SCORE;
        }
        1.0 - self.memory_used as f64 / self.memory_total as f64
    }

    fn performance_score(&self, max_vram: u64) -> f64 {
        let capacity = if max_vram > 0 {
            self.vram_total as f64 / max_vram as f64
        } else {
            UNKNOWN_SCORE
        };
        0.6 * self.utilization_score() + 0.4 * capacity
    }
}

/// Placement decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadBalanceAssignment {
    pub gpu_index: u32,
    /// Margin between the chosen device and the runner-up, in `[0, 1]`
    pub confidence: f64,
    pub reason: String,
    pub workload_type: WorkloadType,
    pub strategy: Strategy,
    pub score: f64,
}

/// Score one candidate. Always in `[0, 1]`.
pub fn score(strategy: Strategy, weights: &StrategyWeights, c: &Candidate, max_vram: u64) -> f64 {
    let raw = match strategy {
        Strategy::LeastUtilized => c.utilization_score(),
        Strategy::ThermalOptimized => c.thermal_score(),
        Strategy::PowerEfficient => c.power_score(),
        Strategy::MemoryOptimized => c.memory_score(),
        Strategy::PerformanceOptimized => c.performance_score(max_vram),
        Strategy::Custom => {
            let parts = [
                (weights.utilization, c.utilization_score()),
                (weights.thermal, c.thermal_score()),
                (weights.power, c.power_score()),
                (weights.memory, c.memory_score()),
                (weights.performance, c.performance_score(max_vram)),
            ];
            let total: f64 = parts.iter().map(|(w, _)| w.max(0.0)).sum();
            if total <= 0.0 {
                c.utilization_score()
            } else {
                parts
                    .iter()
                    .map(|(w, s)| w.max(0.0) / total * s.clamp(0.0, 1.0))
                    .sum()
            }
        }
    };
    if raw.is_finite() {
        raw.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Pick a device for a workload among the healthy candidates
pub fn assign(
    strategy: Strategy,
    weights: &StrategyWeights,
    candidates: &[Candidate],
    workload_type: WorkloadType,
) -> Option<LoadBalanceAssignment> {
    let max_vram = candidates.iter().map(|c| c.vram_total).max().unwrap_or(0);
    let mut scored: Vec<(u32, f64)> = candidates
        .iter()
        .filter(|c| c.healthy)
        .map(|c| (c.index, score(strategy, weights, c, max_vram)))
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

    let &(gpu_index, top) = scored.first()?;
    let confidence = match scored.get(1) {
        Some(&(_, runner_up)) => (top - runner_up).clamp(0.0, 1.0),
        None => 1.0,
    };
    let reason = match scored.get(1) {
        Some(&(other, runner_up)) => format!(
            "GPU {} scored {:.2} under {} (runner-up GPU {} at {:.2})",
            gpu_index, top, strategy, other, runner_up
        ),
        None => format!("GPU {} is the only healthy device", gpu_index),
    };

    Some(LoadBalanceAssignment {
        gpu_index,
        confidence,
        reason,
        workload_type,
        strategy,
        score: top,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(index: u32, util: f64) -> Candidate {
        Candidate {
            index,
            utilization: Some(util),
            temperature_c: Some(60.0),
            power_draw_w: Some(200.0),
            power_limit_w: Some(400.0),
            memory_used: 4 << 30,
            memory_total: 24 << 30,
            vram_total: 24 << 30,
            healthy: true,
        }
    }

    #[test]
    fn test_least_utilized_margin() {
        let candidates = vec![candidate(0, 30.0), candidate(1, 72.0)];
        let a = assign(
            Strategy::LeastUtilized,
            &StrategyWeights::default(),
            &candidates,
            WorkloadType::Inference,
        )
        .unwrap();
        assert_eq!(a.gpu_index, 0);
        assert!((a.score - 0.70).abs() < 1e-9);
        assert!((a.confidence - 0.42).abs() < 1e-9);
        assert_eq!(a.workload_type, WorkloadType::Inference);
    }

    #[test]
    fn test_ties_go_to_lowest_index() {
        let candidates = vec![candidate(3, 40.0), candidate(1, 40.0), candidate(2, 40.0)];
        let a = assign(Strategy::LeastUtilized, &StrategyWeights::default(), &candidates, WorkloadType::General).unwrap();
        assert_eq!(a.gpu_index, 1);
        assert_eq!(a.confidence, 0.0);
    }

    #[test]
    fn test_unhealthy_devices_skipped() {
        let mut busy_but_hot = candidate(0, 5.0);
        busy_but_hot.healthy = false;
        let candidates = vec![busy_but_hot, candidate(1, 90.0)];
        let a = assign(Strategy::LeastUtilized, &StrategyWeights::default(), &candidates, WorkloadType::Training).unwrap();
        assert_eq!(a.gpu_index, 1);
        assert_eq!(a.confidence, 1.0);

        let none: Vec<Candidate> = candidates.into_iter().filter(|c| !c.healthy).collect();
        assert!(assign(Strategy::LeastUtilized, &StrategyWeights::default(), &none, WorkloadType::Training).is_none());
    }

    #[test]
    fn test_strategy_scores() {
        let w = StrategyWeights::default();
        let mut c = candidate(0, 50.0);
        c.temperature_c = Some(75.0);
        let max = 48 << 30;
        assert_eq!(score(Strategy::ThermalOptimized, &w, &c, max), 0.25);
        assert_eq!(score(Strategy::PowerEfficient, &w, &c, max), 0.5);
        assert!((score(Strategy::MemoryOptimized, &w, &c, max) - (1.0 - 4.0 / 24.0)).abs() < 1e-9);
        assert!((score(Strategy::PerformanceOptimized, &w, &c, max) - (0.3 + 0.2)).abs() < 1e-9);

        c.temperature_c = Some(120.0);
        assert_eq!(score(Strategy::ThermalOptimized, &w, &c, max), 0.0);
        c.power_draw_w = None;
        assert_eq!(score(Strategy::PowerEfficient, &w, &c, max), UNKNOWN_SCORE);
    }

    #[test]
    fn test_custom_weights_normalized() {
        let c = candidate(0, 20.0);
        let weights = StrategyWeights {
            utilization: 2.0,
            thermal: 2.0,
            power: 0.0,
            memory: 0.0,
            performance: 0.0,
        };
        // (0.8 + 0.4) / 2
        assert!((score(Strategy::Custom, &weights, &c, 0) - 0.6).abs() < 1e-9);

        let zero = StrategyWeights {
            utilization: 0.0,
            thermal: 0.0,
            power: 0.0,
            memory: 0.0,
            performance: 0.0,
        };
        assert!((score(Strategy::Custom, &zero, &c, 0) - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_workload_parse() {
        assert_eq!("Training".parse::<WorkloadType>().unwrap(), WorkloadType::Training);
        assert!("mining".parse::<WorkloadType>().is_err());
    }
}
