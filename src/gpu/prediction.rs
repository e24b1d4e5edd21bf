//! Performance prediction from recorded workload results
//!
//! Scores are normalized to `[0, 1]`. A prediction is the mean of the
//! recorded scores for a (device, workload) pair; its confidence grows with
//! the sample count and shrinks with their variance.
//!
//! History outlives the process, so devices are keyed by backend and bus id
//! rather than by their per-process index.

use super::balancer::WorkloadType;
use super::GpuDevice;
use crate::error::{Result, TunerError};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Samples kept per (device, workload) pair
pub const MAX_SAMPLES: usize = 100;

/// Confidence of a prediction made without any history
pub const HEURISTIC_CONFIDENCE: f64 = 0.1;

/// Store key for persisted history
pub const STORE_KEY: &str = "performance_history";

/// Expected score with its confidence
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub score: f64,
    pub confidence: f64,
    pub samples: usize,
}

/// Stable identity of a device across restarts
pub fn device_key(backend: &str, bus_id: &str) -> String {
    format!("{}/{}", backend, bus_id)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PairHistory {
    device: String,
    workload: WorkloadType,
    scores: VecDeque<f64>,
}

/// Recorded results for every (device, workload) pair
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceHistory {
    pairs: Vec<PairHistory>,
}

impl PerformanceHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one observed result
    pub fn record(&mut self, device: &str, workload: WorkloadType, score: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&score) {
            return Err(TunerError::OutOfRange {
                field: "score".into(),
                requested: score,
                min: 0.0,
                max: 1.0,
            });
        }
        let pos = match self
            .pairs
            .iter()
            .position(|p| p.device == device && p.workload == workload)
        {
            Some(pos) => pos,
            None => {
                self.pairs.push(PairHistory {
                    device: device.to_string(),
                    workload,
                    scores: VecDeque::new(),
                });
                self.pairs.len() - 1
            }
        };
        let scores = &mut self.pairs[pos].scores;
        if scores.len() >= MAX_SAMPLES {
            scores.pop_front();
        }
        scores.push_back(score);
        Ok(())
    }

    pub fn sample_count(&self, device: &str, workload: WorkloadType) -> usize {
        self.scores(device, workload).map_or(0, |s| s.len())
    }

    fn scores(&self, device: &str, workload: WorkloadType) -> Option<&VecDeque<f64>> {
        self.pairs
            .iter()
            .find(|p| p.device == device && p.workload == workload)
            .map(|p| &p.scores)
    }

    /// Predict a device's score for a workload. Never fails: without history
    /// a low-confidence heuristic is returned. `key` is the device's
    /// [`device_key`].
    pub fn predict(&self, key: &str, device: &GpuDevice, workload: WorkloadType) -> Prediction {
        let scores = match self.scores(key, workload) {
            Some(s) if !s.is_empty() => s,
            _ => {
                return Prediction {
                    score: heuristic_score(device, workload),
                    confidence: HEURISTIC_CONFIDENCE,
                    samples: 0,
                }
            }
        };

        let n = scores.len() as f64;
        let mean = scores.iter().sum::<f64>() / n;
        let variance = scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
        let confidence = (n / (n + 4.0)) * (1.0 / (1.0 + 20.0 * variance));

        Prediction {
            score: mean,
            confidence: confidence.clamp(0.0, 1.0),
            samples: scores.len(),
        }
    }
}

/// Prior from device memory: memory-bound workloads benefit most from VRAM
pub fn heuristic_score(device: &GpuDevice, workload: WorkloadType) -> f64 {
    let vram_gb = device.vram_total as f64 / (1024.0 * 1024.0 * 1024.0);
    let capacity = (vram_gb / 24.0).min(1.0);
    let weight = match workload {
        WorkloadType::Training => 1.0,
        WorkloadType::Compute => 0.8,
        WorkloadType::Inference => 0.7,
        WorkloadType::Rendering => 0.6,
        WorkloadType::Gaming => 0.4,
        WorkloadType::General => 0.3,
    };
    (0.3 + 0.6 * capacity * weight).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{CapabilityBounds, GpuVendor};

    const KEY: &str = "fake/0000:00:00.0";

    fn device(index: u32, vram_gb: u64) -> GpuDevice {
        GpuDevice {
            index,
            vendor: GpuVendor::Nvidia,
            name: "test".into(),
            bus_id: format!("0000:0{}:00.0", index),
            vram_total: vram_gb << 30,
            capabilities: CapabilityBounds::default(),
        }
    }

    #[test]
    fn test_no_history_is_low_confidence_heuristic() {
        let history = PerformanceHistory::new();
        let p = history.predict(KEY, &device(0, 24), WorkloadType::Training);
        assert_eq!(p.confidence, HEURISTIC_CONFIDENCE);
        assert_eq!(p.samples, 0);
        assert!((p.score - 0.9).abs() < 1e-9);

        let small = history.predict("fake/0000:01:00.0", &device(1, 8), WorkloadType::Training);
        assert!(small.score < p.score);
    }

    #[test]
    fn test_confidence_grows_with_samples() {
        let mut history = PerformanceHistory::new();
        let dev = device(0, 24);
        history.record(KEY, WorkloadType::Inference, 0.8).unwrap();
        let one = history.predict(KEY, &dev, WorkloadType::Inference);
        for _ in 0..15 {
            history.record(KEY, WorkloadType::Inference, 0.8).unwrap();
        }
        let many = history.predict(KEY, &dev, WorkloadType::Inference);
        assert!((many.score - 0.8).abs() < 1e-9);
        assert!(many.confidence > one.confidence);
        assert!((many.confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_confidence_shrinks_with_variance() {
        let dev = device(0, 24);
        let mut steady = PerformanceHistory::new();
        let mut noisy = PerformanceHistory::new();
        for i in 0..10 {
            steady.record(KEY, WorkloadType::Rendering, 0.5).unwrap();
            noisy
                .record(KEY, WorkloadType::Rendering, if i % 2 == 0 { 0.1 } else { 0.9 })
                .unwrap();
        }
        let s = steady.predict(KEY, &dev, WorkloadType::Rendering);
        let n = noisy.predict(KEY, &dev, WorkloadType::Rendering);
        assert!((s.score - n.score).abs() < 1e-9);
        assert!(n.confidence < s.confidence);
    }

    #[test]
    fn test_record_bounds_and_capacity() {
        let mut history = PerformanceHistory::new();
        assert!(history.record(KEY, WorkloadType::Compute, 1.5).is_err());
        for _ in 0..(MAX_SAMPLES + 10) {
            history.record(KEY, WorkloadType::Compute, 0.5).unwrap();
        }
        assert_eq!(history.sample_count(KEY, WorkloadType::Compute), MAX_SAMPLES);
        assert_eq!(history.sample_count(KEY, WorkloadType::Gaming), 0);
    }

    #[test]
    fn test_history_is_per_device_identity() {
        let mut history = PerformanceHistory::new();
        let first = device_key("nvidia", "0000:01:00.0");
        let second = device_key("nvidia", "0000:02:00.0");
        history.record(&first, WorkloadType::Training, 0.95).unwrap();
        assert_eq!(history.sample_count(&first, WorkloadType::Training), 1);
        assert_eq!(history.sample_count(&second, WorkloadType::Training), 0);
        // same bus id behind a different backend is a different device
        assert_eq!(
            history.sample_count(&device_key("amd", "0000:01:00.0"), WorkloadType::Training),
            0
        );
    }

    #[test]
    fn test_history_serde() {
        let mut history = PerformanceHistory::new();
        history.record(KEY, WorkloadType::Gaming, 0.4).unwrap();
        let json = serde_json::to_string(&history).unwrap();
        let back: PerformanceHistory = serde_json::from_str(&json).unwrap();
        assert_eq!(back, history);
    }
}
