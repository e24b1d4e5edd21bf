// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! Telemetry aggregation
//!
//! The aggregator samples OS metrics on the monitoring cadence, merges them
//! with the accelerator manager's latest GPU statuses into a
//! [`MetricsSnapshot`], appends the snapshot to a bounded [`History`] and
//! publishes it. Subscribers only see snapshots produced after they
//! subscribed.
//!
//! System-scope alerts (RAM pressure) are evaluated here because the manager
//! only sees accelerators. They share the alert rule set and hysteresis of
//! the manager's engine and are forwarded in the same envelope as manager
//! events.

pub mod sampler;
pub mod server;

pub use sampler::SysinfoSampler;
pub use server::TelemetryServer;

use crate::config::TunerConfig;
use crate::error::{Result, TunerError};
use crate::events::{EventBus, Subscription};
use crate::gpu::alerts::{AlertEngine, AlertScope, AlertTransition, Metric};
use crate::gpu::manager::{AcceleratorManager, ManagerEvent};
use crate::gpu::GpuStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuMetrics {
    pub usage_percent: f64,
    pub per_core_percent: Vec<f64>,
    pub frequency_mhz: u64,
    /// 1, 5 and 15 minute load
    pub load_average: [f64; 3],
    pub brand: String,
}

/// Memory in bytes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryMetrics {
    pub total: u64,
    pub used: u64,
    pub available: u64,
    pub swap_total: u64,
    pub swap_used: u64,
}

impl MemoryMetrics {
    pub fn used_percent(&self) -> Option<f64> {
        (self.total > 0).then(|| self.used as f64 / self.total as f64 * 100.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskMetrics {
    pub name: String,
    pub mount_point: String,
    pub total: u64,
    pub available: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterfaceMetrics {
    pub name: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_bytes_per_sec: f64,
    pub tx_bytes_per_sec: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkMetrics {
    pub interfaces: Vec<InterfaceMetrics>,
    pub rx_bytes_total: u64,
    pub tx_bytes_total: u64,
}

impl NetworkMetrics {
    pub fn from_interfaces(interfaces: Vec<InterfaceMetrics>) -> Self {
        let rx_bytes_total = interfaces.iter().map(|i| i.rx_bytes).sum();
        let tx_bytes_total = interfaces.iter().map(|i| i.tx_bytes).sum();
        Self {
            interfaces,
            rx_bytes_total,
            tx_bytes_total,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessMetrics {
    pub total: usize,
    pub top_cpu: Vec<ProcessInfo>,
    pub top_memory: Vec<ProcessInfo>,
}

impl ProcessMetrics {
    /// Keep the `top` heaviest processes by CPU and by memory. Ties break on
    /// pid so the ranking is stable between samples.
    pub fn rank(all: Vec<ProcessInfo>, top: usize) -> Self {
        let total = all.len();

        let mut by_cpu = all.clone();
        by_cpu.sort_by(|a, b| {
            b.cpu_percent
                .total_cmp(&a.cpu_percent)
                .then(a.pid.cmp(&b.pid))
        });
        by_cpu.truncate(top);

        let mut by_mem = all;
        by_mem.sort_by(|a, b| b.memory_bytes.cmp(&a.memory_bytes).then(a.pid.cmp(&b.pid)));
        by_mem.truncate(top);

        Self {
            total,
            top_cpu: by_cpu,
            top_memory: by_mem,
        }
    }
}

/// What an [`OsSampler`] returns for one tick
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OsMetrics {
    pub cpu: CpuMetrics,
    pub memory: MemoryMetrics,
    pub disks: Vec<DiskMetrics>,
    pub network: NetworkMetrics,
    pub processes: ProcessMetrics,
}

/// One timestamped bundle of system and accelerator metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub hostname: String,
    pub cpu: CpuMetrics,
    pub memory: MemoryMetrics,
    pub gpu: Vec<GpuStatus>,
    pub disks: Vec<DiskMetrics>,
    pub network: NetworkMetrics,
    pub processes: ProcessMetrics,
}

impl MetricsSnapshot {
    pub fn new(hostname: String, os: OsMetrics, gpu: Vec<GpuStatus>) -> Self {
        Self {
            timestamp: Utc::now(),
            hostname,
            cpu: os.cpu,
            memory: os.memory,
            gpu,
            disks: os.disks,
            network: os.network,
            processes: os.processes,
        }
    }
}

/// Fixed-capacity ring; pushing onto a full ring evicts the oldest entry
#[derive(Debug, Clone)]
pub struct History<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T: Clone> History<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn latest(&self) -> Option<&T> {
        self.items.back()
    }

    /// Oldest first
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

/// Source of OS metrics. Called from a blocking thread.
pub trait OsSampler: Send + 'static {
    fn sample(&mut self) -> Result<OsMetrics>;
}

/// Stream envelope, one per line on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TelemetryMessage {
    Snapshot(MetricsSnapshot),
    Event(ManagerEvent),
}

struct Inner {
    sampler: Arc<Mutex<Box<dyn OsSampler>>>,
    manager: Option<Arc<AcceleratorManager>>,
    history: RwLock<History<MetricsSnapshot>>,
    bus: EventBus<TelemetryMessage>,
    alerts: Mutex<AlertEngine>,
    hostname: String,
    interval: Duration,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct AggregatorTask {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

pub struct TelemetryAggregator {
    inner: Arc<Inner>,
    task: tokio::sync::Mutex<Option<AggregatorTask>>,
}

impl TelemetryAggregator {
    pub fn new(
        config: &TunerConfig,
        sampler: Box<dyn OsSampler>,
        manager: Option<Arc<AcceleratorManager>>,
    ) -> Self {
        let system_rules = config
            .alerts
            .rules
            .iter()
            .filter(|r| r.kind.metric() == Metric::MemoryPercent)
            .cloned()
            .collect();
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());

        Self {
            inner: Arc::new(Inner {
                sampler: Arc::new(Mutex::new(sampler)),
                manager,
                history: RwLock::new(History::new(config.telemetry.history_capacity)),
                bus: EventBus::new(config.telemetry.subscriber_buffer),
                alerts: Mutex::new(AlertEngine::new(system_rules)),
                hostname,
                interval: config.monitoring.interval(),
            }),
            task: tokio::sync::Mutex::new(None),
        }
    }

    /// Receive every message published from now on
    pub fn subscribe(&self) -> Subscription<TelemetryMessage> {
        self.inner.bus.subscribe()
    }

    /// Retained snapshots, oldest first
    pub fn history(&self) -> Vec<MetricsSnapshot> {
        self.inner
            .history
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .to_vec()
    }

    pub fn latest(&self) -> Option<MetricsSnapshot> {
        self.inner
            .history
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .latest()
            .cloned()
    }

    /// Take one snapshot now
    pub async fn sample_once(&self) -> Result<MetricsSnapshot> {
        sample(&self.inner).await
    }

    /// Start sampling on the monitoring interval and forwarding manager
    /// events. Calling it while already running does nothing.
    pub async fn start(&self) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }
        let (shutdown, stop_rx) = watch::channel(false);
        let mut handles = Vec::with_capacity(2);

        let inner = Arc::clone(&self.inner);
        let mut rx = stop_rx.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = sample(&inner).await {
                            log::warn!("telemetry sample failed: {}", e);
                        }
                    }
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                }
            }
            log::debug!("telemetry sampling task exited");
        }));

        if let Some(manager) = &self.inner.manager {
            let mut events = manager.subscribe_events();
            let inner = Arc::clone(&self.inner);
            let mut rx = stop_rx;
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        event = events.recv() => match event {
                            Some(event) => {
                                inner.bus.publish(TelemetryMessage::Event(event));
                            }
                            None => break,
                        },
                        changed = rx.changed() => {
                            if changed.is_err() || *rx.borrow() {
                                break;
                            }
                        }
                    }
                }
            }));
        }

        log::info!("telemetry started (every {:?})", self.inner.interval);
        *task = Some(AggregatorTask { shutdown, handles });
    }

    pub async fn stop(&self) {
        let Some(task) = self.task.lock().await.take() else {
            return;
        };
        let _ = task.shutdown.send(true);
        for handle in task.handles {
            if let Err(e) = handle.await {
                log::warn!("telemetry task ended abnormally: {}", e);
            }
        }
        log::info!("telemetry stopped");
    }
}

async fn sample(inner: &Arc<Inner>) -> Result<MetricsSnapshot> {
    let sampler = Arc::clone(&inner.sampler);
    let os = tokio::task::spawn_blocking(move || lock(&sampler).sample())
        .await
        .map_err(|e| TunerError::CommandFailed(format!("OS sampler: {}", e)))??;

    let gpu = inner
        .manager
        .as_ref()
        .map(|m| m.statuses())
        .unwrap_or_default();
    let snapshot = MetricsSnapshot::new(inner.hostname.clone(), os, gpu);

    inner
        .history
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .push(snapshot.clone());
    inner.bus.publish(TelemetryMessage::Snapshot(snapshot.clone()));

    if let Some(percent) = snapshot.memory.used_percent() {
        let transitions = lock(&inner.alerts).evaluate(
            AlertScope::System,
            &[(Metric::MemoryPercent, percent)],
            snapshot.timestamp,
        );
        for transition in transitions {
            let event = match transition {
                AlertTransition::Raised(alert) => {
                    log::warn!("alert raised: {}", alert);
                    ManagerEvent::AlertRaised { alert }
                }
                AlertTransition::Cleared(alert) => {
                    log::info!("alert cleared: {}", alert);
                    ManagerEvent::AlertCleared { alert }
                }
            };
            inner.bus.publish(TelemetryMessage::Event(event));
        }
    }
    Ok(snapshot)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Sampler that reports a fixed memory load and counts its calls
    pub struct FakeSampler {
        pub used_percent: Arc<Mutex<f64>>,
        pub calls: Arc<Mutex<u32>>,
    }

    impl FakeSampler {
        pub fn new() -> Self {
            Self {
                used_percent: Arc::new(Mutex::new(40.0)),
                calls: Arc::new(Mutex::new(0)),
            }
        }
    }

    impl OsSampler for FakeSampler {
        fn sample(&mut self) -> Result<OsMetrics> {
            *lock(&self.calls) += 1;
            let total = 64u64 << 30;
            let used = (total as f64 * *lock(&self.used_percent) / 100.0) as u64;
            Ok(OsMetrics {
                cpu: CpuMetrics {
                    usage_percent: 12.5,
                    per_core_percent: vec![10.0, 15.0],
                    frequency_mhz: 3600,
                    load_average: [0.5, 0.4, 0.3],
                    brand: "Test CPU".into(),
                },
                memory: MemoryMetrics {
                    total,
                    used,
                    available: total - used,
                    swap_total: 0,
                    swap_used: 0,
                },
                ..Default::default()
            })
        }
    }
}
