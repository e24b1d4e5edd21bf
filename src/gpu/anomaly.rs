//! Baseline-deviation detection over per-device rolling windows
//!
//! Each new sample is scored against the window of samples that came before
//! it, then pushed. A sample whose z-score exceeds the threshold is reported
//! as a spike (above baseline) or a drop (below).

use super::GpuStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// Rolling window with running sums
#[derive(Debug, Clone)]
pub(crate) struct MetricWindow {
    values: VecDeque<f64>,
    max_size: usize,
    sum: f64,
    sum_sq: f64,
}

impl MetricWindow {
    pub(crate) fn new(max_size: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(max_size),
            max_size: max_size.max(2),
            sum: 0.0,
            sum_sq: 0.0,
        }
    }

    pub(crate) fn push(&mut self, value: f64) {
        if self.values.len() >= self.max_size {
            if let Some(old) = self.values.pop_front() {
                self.sum -= old;
                self.sum_sq -= old * old;
            }
        }
        self.sum += value;
        self.sum_sq += value * value;
        self.values.push_back(value);
    }

    pub(crate) fn len(&self) -> usize {
        self.values.len()
    }

    pub(crate) fn mean(&self) -> f64 {
        if self.values.is_empty() {
            0.0
        } else {
            self.sum / self.values.len() as f64
        }
    }

    pub(crate) fn std_dev(&self) -> f64 {
        let n = self.values.len() as f64;
        if n < 2.0 {
            return 0.0;
        }
        let variance = (self.sum_sq - (self.sum * self.sum) / n) / (n - 1.0);
        variance.max(0.0).sqrt()
    }

    pub(crate) fn z_score(&self, value: f64) -> f64 {
        let sd = self.std_dev();
        let diff = value - self.mean();
        if sd < 1e-10 {
            // flat baseline: any movement is maximally unusual
            if diff.abs() < 1e-10 {
                0.0
            } else {
                diff.signum() * 100.0
            }
        } else {
            diff / sd
        }
    }
}

/// Metric tracked for anomalies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyMetric {
    Temperature,
    PowerDraw,
    Utilization,
}

/// Direction of the deviation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    Spike,
    Drop,
}

/// A sample that deviates from its device's recent baseline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuAnomaly {
    pub index: u32,
    pub metric: AnomalyMetric,
    pub kind: AnomalyKind,
    pub value: f64,
    pub baseline_mean: f64,
    pub z_score: f64,
    pub detected_at: DateTime<Utc>,
}

/// Anomaly detector settings
#[derive(Debug, Clone, Copy)]
pub struct AnomalyConfig {
    pub window_size: usize,
    pub min_samples: usize,
    pub z_score_threshold: f64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            window_size: 60,
            min_samples: 10,
            z_score_threshold: 3.0,
        }
    }
}

/// Per-device, per-metric anomaly detection
#[derive(Debug)]
pub struct AnomalyDetector {
    config: AnomalyConfig,
    windows: HashMap<(u32, AnomalyMetric), MetricWindow>,
}

impl AnomalyDetector {
    pub fn new(config: AnomalyConfig) -> Self {
        Self {
            config,
            windows: HashMap::new(),
        }
    }

    /// Score a fresh sample and add it to the baseline
    pub fn observe(&mut self, status: &GpuStatus) -> Vec<GpuAnomaly> {
        let readings = [
            (AnomalyMetric::Temperature, status.temperature_c),
            (AnomalyMetric::PowerDraw, status.power_draw_w),
            (AnomalyMetric::Utilization, status.utilization),
        ];

        let mut found = Vec::new();
        for (metric, value) in readings {
            let Some(value) = value else { continue };
            let window = self
                .windows
                .entry((status.index, metric))
                .or_insert_with(|| MetricWindow::new(self.config.window_size));

            if window.len() >= self.config.min_samples {
                let z = window.z_score(value);
                if z.abs() > self.config.z_score_threshold {
                    found.push(GpuAnomaly {
                        index: status.index,
                        metric,
                        kind: if z > 0.0 { AnomalyKind::Spike } else { AnomalyKind::Drop },
                        value,
                        baseline_mean: window.mean(),
                        z_score: z,
                        detected_at: status.sample_timestamp,
                    });
                }
            }
            window.push(value);
        }
        found
    }

    /// Discard a removed device's baselines
    pub fn forget(&mut self, index: u32) {
        self.windows.retain(|(i, _), _| *i != index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(index: u32, temp: f64, util: f64) -> GpuStatus {
        let mut s = GpuStatus::empty(index);
        s.temperature_c = Some(temp);
        s.utilization = Some(util);
        s
    }

    #[test]
    fn test_window_statistics() {
        let mut w = MetricWindow::new(4);
        for v in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            w.push(v);
        }
        assert_eq!(w.len(), 4);
        assert_eq!(w.mean(), 6.5);
        assert!((w.std_dev() - 1.914854).abs() < 1e-5);
    }

    #[test]
    fn test_flat_baseline_z_score_has_sign() {
        let mut w = MetricWindow::new(8);
        for _ in 0..5 {
            w.push(50.0);
        }
        assert_eq!(w.z_score(50.0), 0.0);
        assert!(w.z_score(40.0) < 0.0);
        assert!(w.z_score(60.0) > 0.0);
    }

    #[test]
    fn test_temperature_spike_detected() {
        let mut detector = AnomalyDetector::new(AnomalyConfig::default());
        for i in 0..20 {
            let temp = 60.0 + (i % 3) as f64;
            assert!(detector.observe(&sample(0, temp, 50.0)).is_empty());
        }
        let anomalies = detector.observe(&sample(0, 85.0, 50.0));
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].metric, AnomalyMetric::Temperature);
        assert_eq!(anomalies[0].kind, AnomalyKind::Spike);
        assert!(anomalies[0].baseline_mean < 62.0);
    }

    #[test]
    fn test_utilization_drop_detected() {
        let mut detector = AnomalyDetector::new(AnomalyConfig::default());
        for i in 0..15 {
            detector.observe(&sample(2, 70.0, 95.0 + (i % 2) as f64));
        }
        let anomalies = detector.observe(&sample(2, 70.0, 5.0));
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].kind, AnomalyKind::Drop);
        assert_eq!(anomalies[0].index, 2);
    }

    #[test]
    fn test_needs_min_samples() {
        let mut detector = AnomalyDetector::new(AnomalyConfig::default());
        for _ in 0..5 {
            detector.observe(&sample(0, 60.0, 10.0));
        }
        assert!(detector.observe(&sample(0, 99.0, 10.0)).is_empty());

        detector.forget(0);
        assert!(detector.windows.is_empty());
    }
}
