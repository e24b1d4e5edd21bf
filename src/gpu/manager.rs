// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! Accelerator manager
//!
//! Discovers devices through the vendor backends, keeps a per-device state
//! machine, polls status on a fixed cadence, evaluates alerts and anomalies,
//! and answers status, configuration and placement requests.
//!
//! Locking:
//! - the status cache is written only by the polling pass and read by
//!   queries; the registry is written only by discovery and state changes
//! - neither is ever held across an await point
//! - events go through a separate [`EventBus`], so a stalled subscriber
//!   cannot hold up polling
//! - configuration of one device is serialized with a per-device async
//!   mutex taken with `try_lock`; a second concurrent request gets `Conflict`

use super::alerts::{device_readings, Alert, AlertEngine, AlertScope, AlertTransition};
use super::anomaly::{AnomalyConfig, AnomalyDetector, GpuAnomaly};
use super::balancer::{self, Candidate, LoadBalanceAssignment, Strategy, StrategyWeights, WorkloadType};
use super::prediction::{device_key, PerformanceHistory, Prediction, STORE_KEY};
use super::{GpuBackend, GpuConfig, GpuDevice, GpuStatus};
use crate::config::{LoadBalancingConfig, MonitoringConfig, TunerConfig};
use crate::error::{Result, TunerError};
use crate::events::{EventBus, Subscription};
use crate::store::{StateStore, StateStoreExt};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

/// Per-device lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Discovered,
    Monitoring,
    Configuring,
    Removed,
}

impl DeviceState {
    /// Legal edges of the lifecycle
    pub fn can_transition(self, to: DeviceState) -> bool {
        use DeviceState::*;
        matches!(
            (self, to),
            (Discovered, Monitoring)
                | (Monitoring, Discovered)
                | (Discovered, Configuring)
                | (Monitoring, Configuring)
                | (Configuring, Monitoring)
                | (Configuring, Discovered)
                | (Discovered, Removed)
                | (Monitoring, Removed)
                | (Configuring, Removed)
                | (Removed, Discovered)
        )
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceState::Discovered => write!(f, "discovered"),
            DeviceState::Monitoring => write!(f, "monitoring"),
            DeviceState::Configuring => write!(f, "configuring"),
            DeviceState::Removed => write!(f, "removed"),
        }
    }
}

/// Alert and lifecycle events published to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ManagerEvent {
    DeviceDiscovered { device: GpuDevice },
    DeviceRemoved { index: u32 },
    StateChanged { index: u32, from: DeviceState, to: DeviceState },
    AlertRaised { alert: Alert },
    AlertCleared { alert: Alert },
    Anomaly { anomaly: GpuAnomaly },
    SampleStale { index: u32, reason: String },
    ConfigApplied { index: u32, config: GpuConfig },
}

#[derive(Debug, Clone)]
struct DeviceEntry {
    device: GpuDevice,
    backend: usize,
    state: DeviceState,
    config: GpuConfig,
}

#[derive(Debug, Default)]
struct Registry {
    entries: BTreeMap<u32, DeviceEntry>,
    keys: HashMap<(String, String), u32>,
    next_index: u32,
}

impl Registry {
    fn transition(&mut self, index: u32, to: DeviceState) -> Result<ManagerEvent> {
        let entry = self
            .entries
            .get_mut(&index)
            .ok_or_else(|| TunerError::NotFound(format!("GPU {}", index)))?;
        let from = entry.state;
        if !from.can_transition(to) {
            return Err(TunerError::InvalidState(format!(
                "GPU {}: {} -> {}",
                index, from, to
            )));
        }
        entry.state = to;
        Ok(ManagerEvent::StateChanged { index, from, to })
    }

    fn live(&self, index: u32) -> Result<&DeviceEntry> {
        self.entries
            .get(&index)
            .filter(|e| e.state != DeviceState::Removed)
            .ok_or_else(|| TunerError::NotFound(format!("GPU {}", index)))
    }
}

impl Shared {
    /// Live device and its persistent history key
    fn keyed_device(&self, index: u32) -> Result<(String, GpuDevice)> {
        let reg = read(&self.registry);
        let entry = reg.live(index)?;
        let backend = self.backends[entry.backend].name();
        Ok((device_key(backend, &entry.device.bus_id), entry.device.clone()))
    }
}

#[derive(Debug, Default)]
struct StatusCache {
    latest: BTreeMap<u32, GpuStatus>,
    history: BTreeMap<u32, VecDeque<GpuStatus>>,
}

#[derive(Debug, Clone)]
struct BalancingState {
    enabled: bool,
    strategy: Strategy,
    weights: StrategyWeights,
}

impl From<&LoadBalancingConfig> for BalancingState {
    fn from(cfg: &LoadBalancingConfig) -> Self {
        Self {
            enabled: cfg.enabled,
            strategy: cfg.strategy,
            weights: cfg.weights,
        }
    }
}

struct Shared {
    backends: Vec<Arc<dyn GpuBackend>>,
    config: MonitoringConfig,
    registry: RwLock<Registry>,
    status: RwLock<StatusCache>,
    events: EventBus<ManagerEvent>,
    alerts: Mutex<AlertEngine>,
    anomalies: Mutex<AnomalyDetector>,
    balancing: RwLock<BalancingState>,
    performance: RwLock<PerformanceHistory>,
    store: Option<Arc<dyn StateStore>>,
    config_locks: Mutex<HashMap<u32, Arc<tokio::sync::Mutex<()>>>>,
    monitoring: AtomicBool,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct MonitorTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Multi-GPU manager
pub struct AcceleratorManager {
    shared: Arc<Shared>,
    monitor: tokio::sync::Mutex<Option<MonitorTask>>,
}

impl AcceleratorManager {
    pub fn new(backends: Vec<Arc<dyn GpuBackend>>, config: &TunerConfig) -> Self {
        let m = &config.monitoring;
        let anomaly = AnomalyConfig {
            window_size: m.anomaly_window,
            min_samples: m.anomaly_min_samples,
            z_score_threshold: m.anomaly_z_threshold,
        };
        Self {
            shared: Arc::new(Shared {
                backends,
                config: m.clone(),
                registry: RwLock::new(Registry::default()),
                status: RwLock::new(StatusCache::default()),
                events: EventBus::new(m.event_buffer),
                alerts: Mutex::new(AlertEngine::new(config.alerts.rules.clone())),
                anomalies: Mutex::new(AnomalyDetector::new(anomaly)),
                balancing: RwLock::new(BalancingState::from(&config.load_balancing)),
                performance: RwLock::new(PerformanceHistory::new()),
                store: None,
                config_locks: Mutex::new(HashMap::new()),
                monitoring: AtomicBool::new(false),
            }),
            monitor: tokio::sync::Mutex::new(None),
        }
    }

    /// Persist performance history through `store`, loading what it holds
    pub fn with_store(self, store: Arc<dyn StateStore>) -> Result<Self> {
        let history: PerformanceHistory = store.get(STORE_KEY)?.unwrap_or_default();
        // nothing else holds the Arc before the manager is returned
        let mut shared = Arc::try_unwrap(self.shared).map_err(|_| {
            TunerError::InvalidState("store must be attached before the manager is shared".into())
        })?;
        shared.store = Some(store);
        shared.performance = RwLock::new(history);
        Ok(Self {
            shared: Arc::new(shared),
            monitor: self.monitor,
        })
    }

    /// Enumerate devices through every backend and refresh the registry.
    ///
    /// Indices are assigned once per (backend, bus id) and never reused.
    /// Devices that a successfully enumerating backend no longer reports move
    /// to `Removed`. Unreachable backends are logged and skipped.
    pub async fn detect_gpus(&self) -> Vec<GpuDevice> {
        let shared = &self.shared;
        let timeout = shared.config.backend_timeout();
        let mut reports = Vec::new();
        for (slot, backend) in shared.backends.iter().enumerate() {
            match tokio::time::timeout(timeout, backend.enumerate()).await {
                Ok(Ok(found)) => {
                    log::info!("{}: {} device(s)", backend.name(), found.len());
                    reports.push((slot, found));
                }
                Ok(Err(e)) => log::warn!("{}: {}", backend.name(), e),
                Err(_) => log::warn!(
                    "{}: {}",
                    backend.name(),
                    TunerError::BackendUnavailable(format!("enumeration timed out after {:?}", timeout))
                ),
            }
        }
        if reports.is_empty() {
            log::warn!("no GPU backend reachable; continuing without accelerators");
        }

        let monitoring = shared.monitoring.load(Ordering::SeqCst);
        let mut events = Vec::new();
        let mut removed = Vec::new();
        {
            let mut reg = write(&shared.registry);
            for (slot, found) in reports {
                let backend_name = shared.backends[slot].name().to_string();
                let mut seen = Vec::with_capacity(found.len());
                for gpu in found {
                    let key = (backend_name.clone(), gpu.bus_id.clone());
                    let known = reg.keys.get(&key).copied();
                    let index = match known {
                        Some(index) => index,
                        None => {
                            let index = reg.next_index;
                            reg.next_index += 1;
                            reg.keys.insert(key, index);
                            index
                        }
                    };
                    seen.push(index);
                    let device = gpu.into_device(index);
                    let revived = match reg.entries.get_mut(&index) {
                        Some(entry) => {
                            entry.device = device.clone();
                            entry.state == DeviceState::Removed
                        }
                        None => {
                            reg.entries.insert(
                                index,
                                DeviceEntry {
                                    device: device.clone(),
                                    backend: slot,
                                    state: DeviceState::Discovered,
                                    config: GpuConfig::default(),
                                },
                            );
                            events.push(ManagerEvent::DeviceDiscovered { device });
                            false
                        }
                    };
                    if revived {
                        if let Ok(ev) = reg.transition(index, DeviceState::Discovered) {
                            events.push(ev);
                        }
                    }
                    let is_discovered = reg
                        .entries
                        .get(&index)
                        .map_or(false, |e| e.state == DeviceState::Discovered);
                    if monitoring && is_discovered {
                        if let Ok(ev) = reg.transition(index, DeviceState::Monitoring) {
                            events.push(ev);
                        }
                    }
                }

                let vanished: Vec<u32> = reg
                    .entries
                    .iter()
                    .filter(|(i, e)| {
                        e.backend == slot && e.state != DeviceState::Removed && !seen.contains(i)
                    })
                    .map(|(&i, _)| i)
                    .collect();
                for index in vanished {
                    if let Ok(ev) = reg.transition(index, DeviceState::Removed) {
                        events.push(ev);
                        events.push(ManagerEvent::DeviceRemoved { index });
                        removed.push(index);
                    }
                }
            }
        }

        for &index in &removed {
            log::warn!("GPU {} removed", index);
            let now = Utc::now();
            for alert in lock(&shared.alerts).forget(AlertScope::Device(index), now) {
                events.push(ManagerEvent::AlertCleared { alert });
            }
            lock(&shared.anomalies).forget(index);
            let mut cache = write(&shared.status);
            cache.latest.remove(&index);
            cache.history.remove(&index);
        }
        for event in events {
            shared.events.publish(event);
        }
        self.devices()
    }

    /// Alias for [`detect_gpus`](Self::detect_gpus) on an already running manager
    pub async fn rescan(&self) -> Vec<GpuDevice> {
        self.detect_gpus().await
    }

    /// Live devices ordered by index
    pub fn devices(&self) -> Vec<GpuDevice> {
        read(&self.shared.registry)
            .entries
            .values()
            .filter(|e| e.state != DeviceState::Removed)
            .map(|e| e.device.clone())
            .collect()
    }

    pub fn device_state(&self, index: u32) -> Result<DeviceState> {
        read(&self.shared.registry)
            .entries
            .get(&index)
            .map(|e| e.state)
            .ok_or_else(|| TunerError::NotFound(format!("GPU {}", index)))
    }

    /// Last applied configuration of a device
    pub fn device_config(&self, index: u32) -> Result<GpuConfig> {
        read(&self.shared.registry)
            .live(index)
            .map(|e| e.config.clone())
    }

    /// Latest cached status. `Stale` if the device has never been sampled.
    pub fn get_status(&self, index: u32) -> Result<GpuStatus> {
        read(&self.shared.registry).live(index)?;
        read(&self.shared.status)
            .latest
            .get(&index)
            .cloned()
            .ok_or(TunerError::Stale { index })
    }

    /// Latest status of every sampled live device
    pub fn statuses(&self) -> Vec<GpuStatus> {
        read(&self.shared.status).latest.values().cloned().collect()
    }

    /// Retained samples of a device, oldest first
    pub fn history(&self, index: u32) -> Result<Vec<GpuStatus>> {
        read(&self.shared.registry).live(index)?;
        Ok(read(&self.shared.status)
            .history
            .get(&index)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default())
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        lock(&self.shared.alerts).active()
    }

    /// Register a subscriber for alert and lifecycle events
    pub fn subscribe_events(&self) -> Subscription<ManagerEvent> {
        self.shared.events.subscribe()
    }

    /// Validate and apply a configuration. Returns the effective configuration.
    ///
    /// The backend write runs to completion even if the caller stops waiting.
    pub async fn apply_config(&self, index: u32, requested: GpuConfig) -> Result<GpuConfig> {
        let shared = Arc::clone(&self.shared);
        let (device, backend) = {
            let reg = read(&shared.registry);
            let entry = reg.live(index)?;
            (entry.device.clone(), Arc::clone(&shared.backends[entry.backend]))
        };
        let effective = requested.effective_for(&device.capabilities)?;

        let device_lock = {
            let mut locks = lock(&shared.config_locks);
            Arc::clone(
                locks
                    .entry(index)
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        let guard = device_lock
            .try_lock_owned()
            .map_err(|_| TunerError::Conflict { index })?;

        let event = write(&shared.registry).transition(index, DeviceState::Configuring)?;
        shared.events.publish(event);

        let task = tokio::spawn(async move {
            let _guard = guard;
            let outcome = backend.apply(&device, &effective).await;
            let mut events = Vec::new();
            {
                let mut reg = write(&shared.registry);
                if outcome.is_ok() {
                    if let Some(entry) = reg.entries.get_mut(&index) {
                        entry.config = effective.clone();
                    }
                }
                // monitoring may have started or stopped during the write
                let return_to = if shared.monitoring.load(Ordering::SeqCst) {
                    DeviceState::Monitoring
                } else {
                    DeviceState::Discovered
                };
                if let Ok(ev) = reg.transition(index, return_to) {
                    events.push(ev);
                }
            }
            match &outcome {
                Ok(()) => {
                    log::info!("GPU {}: configuration applied", index);
                    events.push(ManagerEvent::ConfigApplied {
                        index,
                        config: effective.clone(),
                    });
                }
                Err(e) => log::warn!("GPU {}: configuration failed: {}", index, e),
            }
            for event in events {
                shared.events.publish(event);
            }
            outcome.map(|()| effective)
        });
        task.await
            .map_err(|e| TunerError::apply("gpu_config", e))?
    }

    /// Turn on workload placement, optionally switching strategy
    pub fn enable_load_balancing(&self, strategy: Option<Strategy>) {
        let mut state = write(&self.shared.balancing);
        state.enabled = true;
        if let Some(strategy) = strategy {
            state.strategy = strategy;
        }
        log::info!("load balancing enabled ({})", state.strategy);
    }

    pub fn disable_load_balancing(&self) {
        write(&self.shared.balancing).enabled = false;
    }

    pub fn set_custom_weights(&self, weights: StrategyWeights) {
        write(&self.shared.balancing).weights = weights;
    }

    /// Choose the device for a new workload
    pub fn assign_workload(&self, workload: WorkloadType) -> Result<LoadBalanceAssignment> {
        let state = read(&self.shared.balancing).clone();
        if !state.enabled {
            return Err(TunerError::Disabled("load balancing".into()));
        }

        let candidates: Vec<Candidate> = {
            let reg = read(&self.shared.registry);
            let cache = read(&self.shared.status);
            let alerts = lock(&self.shared.alerts);
            reg.entries
                .values()
                .filter(|e| e.state != DeviceState::Removed && e.config.auto_load_balance)
                .map(|e| {
                    let index = e.device.index;
                    let status = cache
                        .latest
                        .get(&index)
                        .cloned()
                        .unwrap_or_else(|| GpuStatus::empty(index));
                    let healthy = !alerts.has_critical(AlertScope::Device(index));
                    Candidate::new(&e.device, &status, healthy)
                })
                .collect()
        };

        balancer::assign(state.strategy, &state.weights, &candidates, workload)
            .ok_or_else(|| TunerError::NotFound("no healthy GPU available".into()))
    }

    /// Record an observed workload result in `[0, 1]`
    pub fn record_performance(&self, index: u32, workload: WorkloadType, score: f64) -> Result<()> {
        let (key, _) = self.shared.keyed_device(index)?;
        let snapshot = {
            let mut history = write(&self.shared.performance);
            history.record(&key, workload, score)?;
            history.clone()
        };
        if let Some(store) = &self.shared.store {
            store.put(STORE_KEY, &snapshot)?;
        }
        Ok(())
    }

    /// Expected score and confidence for a device and workload
    pub fn predict_performance(&self, index: u32, workload: WorkloadType) -> Result<Prediction> {
        let (key, device) = self.shared.keyed_device(index)?;
        Ok(read(&self.shared.performance).predict(&key, &device, workload))
    }

    /// Run one polling pass over every live device
    pub async fn poll_once(&self) {
        poll(&self.shared).await;
    }

    /// Start the background polling task. Discovers devices first if none
    /// are known. Calling it while already running does nothing.
    pub async fn start_monitoring(&self) -> Result<()> {
        let mut monitor = self.monitor.lock().await;
        if monitor.is_some() {
            return Ok(());
        }
        if read(&self.shared.registry).entries.is_empty() {
            self.detect_gpus().await;
        }

        self.shared.monitoring.store(true, Ordering::SeqCst);
        let events: Vec<ManagerEvent> = {
            let mut reg = write(&self.shared.registry);
            let ready: Vec<u32> = reg
                .entries
                .iter()
                .filter(|(_, e)| e.state == DeviceState::Discovered)
                .map(|(&i, _)| i)
                .collect();
            ready
                .into_iter()
                .filter_map(|i| reg.transition(i, DeviceState::Monitoring).ok())
                .collect()
        };
        for event in events {
            self.shared.events.publish(event);
        }

        let (shutdown, mut stop_rx) = watch::channel(false);
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(shared.config.interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => poll(&shared).await,
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            log::debug!("GPU polling task exited");
        });
        log::info!(
            "GPU monitoring started ({} device(s), every {:?})",
            self.devices().len(),
            self.shared.config.interval()
        );
        *monitor = Some(MonitorTask { shutdown, handle });
        Ok(())
    }

    /// Stop polling and wait for the task to finish its current pass
    pub async fn stop(&self) {
        let Some(task) = self.monitor.lock().await.take() else {
            return;
        };
        let _ = task.shutdown.send(true);
        if let Err(e) = task.handle.await {
            log::warn!("GPU polling task ended abnormally: {}", e);
        }
        self.shared.monitoring.store(false, Ordering::SeqCst);

        let events: Vec<ManagerEvent> = {
            let mut reg = write(&self.shared.registry);
            let active: Vec<u32> = reg
                .entries
                .iter()
                .filter(|(_, e)| e.state == DeviceState::Monitoring)
                .map(|(&i, _)| i)
                .collect();
            active
                .into_iter()
                .filter_map(|i| reg.transition(i, DeviceState::Discovered).ok())
                .collect()
        };
        for event in events {
            self.shared.events.publish(event);
        }
        log::info!("GPU monitoring stopped");
    }

    pub fn is_monitoring(&self) -> bool {
        self.shared.monitoring.load(Ordering::SeqCst)
    }
}

/// One pass: sample every live device concurrently, each bounded by the
/// backend timeout, then fold results in index order.
async fn poll(shared: &Arc<Shared>) {
    let targets: Vec<(GpuDevice, Arc<dyn GpuBackend>)> = {
        let reg = read(&shared.registry);
        reg.entries
            .values()
            .filter(|e| e.state != DeviceState::Removed)
            .map(|e| (e.device.clone(), Arc::clone(&shared.backends[e.backend])))
            .collect()
    };
    if targets.is_empty() {
        return;
    }

    let timeout = shared.config.backend_timeout();
    let mut set = JoinSet::new();
    for (device, backend) in targets {
        set.spawn(async move {
            let result = match tokio::time::timeout(timeout, backend.sample(&device)).await {
                Ok(result) => result,
                Err(_) => Err(TunerError::Timeout(timeout)),
            };
            (device.index, result)
        });
    }
    let mut results = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => log::warn!("GPU sample task failed: {}", e),
        }
    }
    results.sort_by_key(|(index, _)| *index);

    for (index, result) in results {
        let still_live = read(&shared.registry).live(index).is_ok();
        if !still_live {
            continue;
        }
        match result {
            Ok(status) => record_sample(shared, status),
            Err(e) => {
                log::warn!("GPU {}: sample missed: {}", index, e);
                mark_stale(shared, index);
                shared.events.publish(ManagerEvent::SampleStale {
                    index,
                    reason: e.to_string(),
                });
            }
        }
    }
}

fn record_sample(shared: &Shared, mut status: GpuStatus) {
    status.stale = false;
    let index = status.index;
    {
        let mut cache = write(&shared.status);
        let history = cache.history.entry(index).or_default();
        if history.len() >= shared.config.history_capacity.max(1) {
            history.pop_front();
        }
        history.push_back(status.clone());
        cache.latest.insert(index, status.clone());
    }

    let transitions = lock(&shared.alerts).evaluate(
        AlertScope::Device(index),
        &device_readings(&status),
        status.sample_timestamp,
    );
    for t in transitions {
        let event = match t {
            AlertTransition::Raised(alert) => {
                log::warn!("alert raised: {}", alert);
                ManagerEvent::AlertRaised { alert }
            }
            AlertTransition::Cleared(alert) => {
                log::info!("alert cleared: {}", alert);
                ManagerEvent::AlertCleared { alert }
            }
        };
        shared.events.publish(event);
    }

    let anomalies = lock(&shared.anomalies).observe(&status);
    for anomaly in anomalies {
        log::warn!(
            "GPU {}: {:?} {:?} (value {:.1}, baseline {:.1}, z {:.1})",
            anomaly.index,
            anomaly.metric,
            anomaly.kind,
            anomaly.value,
            anomaly.baseline_mean,
            anomaly.z_score
        );
        shared.events.publish(ManagerEvent::Anomaly { anomaly });
    }
}

/// Keep the previous values but flag them as stale
fn mark_stale(shared: &Shared, index: u32) {
    let mut cache = write(&shared.status);
    cache
        .latest
        .entry(index)
        .or_insert_with(|| GpuStatus::empty(index))
        .stale = true;
}
