//! End-to-end scenarios against scratch `/proc` and `/sys` trees

use async_trait::async_trait;
use situne::applier::{ApplyStatus, FsTarget, RECORD_KEY};
use situne::config::TunerConfig;
use situne::engine::OptimizationContext;
use situne::gpu::balancer::WorkloadType;
use situne::gpu::{
    AcceleratorManager, CapabilityBounds, DiscoveredGpu, GpuBackend, GpuConfig, GpuDevice,
    GpuStatus, GpuVendor, ValueRange,
};
use situne::inventory::InventoryCollector;
use situne::profile::SystemProfile;
use situne::store::{JsonFileStore, StateStore};
use situne::telemetry::{OsMetrics, OsSampler, TelemetryAggregator, TelemetryMessage};
use situne::TunerError;
use std::fs;
use std::path::Path;
use std::sync::Arc;

fn put(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn cpus(root: &Path, count: u32, model: &str) {
    let mut cpuinfo = String::new();
    for i in 0..count {
        cpuinfo.push_str(&format!(
            "processor\t: {}\nvendor_id\t: GenuineIntel\nmodel name\t: {}\n\n",
            i, model
        ));
    }
    put(root, "proc/cpuinfo", &cpuinfo);
}

fn ram(root: &Path, kb: u64) {
    put(root, "proc/meminfo", &format!("MemTotal:       {} kB\n", kb));
}

fn tunables(root: &Path) {
    put(root, "proc/sys/vm/swappiness", "60\n");
    put(root, "proc/sys/vm/dirty_ratio", "20\n");
    put(root, "proc/sys/vm/dirty_background_ratio", "10\n");
    for cpu in ["cpu0", "cpu1"] {
        let dir = format!("sys/devices/system/cpu/{}/cpufreq", cpu);
        put(root, &format!("{}/scaling_governor", dir), "powersave\n");
        put(
            root,
            &format!("{}/scaling_available_governors", dir),
            "performance powersave schedutil\n",
        );
    }
    put(root, "sys/block/nvme0n1/queue/rotational", "0\n");
    put(root, "sys/block/nvme0n1/queue/scheduler", "[mq-deadline] none kyber\n");
    put(root, "sys/block/nvme0n1/queue/read_ahead_kb", "128\n");
    put(root, "sys/block/nvme0n1/device/device/current_link_speed", "16.0 GT/s PCIe\n");
}

fn rtx_4090(root: &Path) {
    put(root, "sys/class/drm/card0/device/vendor", "0x10de\n");
    put(
        root,
        "sys/class/drm/card0/device/uevent",
        "DRIVER=nvidia\nPCI_SLOT_NAME=0000:01:00.0\n",
    );
    put(
        root,
        "proc/driver/nvidia/gpus/0000:01:00.0/information",
        "Model: \t\t NVIDIA GeForce RTX 4090\n",
    );
}

fn context(root: &Path, state: &Path) -> OptimizationContext {
    OptimizationContext::new(
        TunerConfig::default(),
        Arc::new(JsonFileStore::new(state)),
        Arc::new(FsTarget::new(root)),
        InventoryCollector::with_root(root),
    )
}

fn read(root: &Path, rel: &str) -> String {
    fs::read_to_string(root.join(rel)).unwrap()
}

#[test]
fn test_workstation_apply_is_idempotent_across_runs() {
    let root = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    cpus(root.path(), 24, "13th Gen Intel(R) Core(TM) i9-13900K");
    ram(root.path(), 131_811_256);
    tunables(root.path());
    rtx_4090(root.path());

    let report = context(root.path(), state.path()).optimize(false).unwrap();
    assert_eq!(report.classification.profile, SystemProfile::ProWorkstation);
    assert_eq!(report.result.status(), ApplyStatus::Applied);
    assert_eq!(read(root.path(), "proc/sys/vm/swappiness").trim(), "10");
    assert_eq!(read(root.path(), "sys/block/nvme0n1/queue/scheduler").trim(), "none");
    assert!(root.path().join("etc/situne/gpu.conf").exists());

    // a second process sees the persisted record and changes nothing
    let again = context(root.path(), state.path()).optimize(false).unwrap();
    assert_eq!(again.result.status(), ApplyStatus::NoOp);
    assert_eq!(again.plan.hash(), report.plan.hash());
}

#[test]
fn test_rollback_restores_previous_values() {
    let root = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    cpus(root.path(), 24, "13th Gen Intel(R) Core(TM) i9-13900K");
    ram(root.path(), 131_811_256);
    tunables(root.path());
    rtx_4090(root.path());

    let ctx = context(root.path(), state.path());
    ctx.optimize(false).unwrap();
    let rollback = ctx.rollback().unwrap();
    assert!(rollback.restored > 0);

    assert_eq!(read(root.path(), "proc/sys/vm/swappiness").trim(), "60");
    assert_eq!(
        read(root.path(), "sys/devices/system/cpu/cpu0/cpufreq/scaling_governor").trim(),
        "powersave"
    );
    assert!(!root.path().join("etc/situne/gpu.conf").exists());
    assert!(JsonFileStore::new(state.path()).get_raw(RECORD_KEY).unwrap().is_none());
}

#[test]
fn test_dry_run_writes_nothing() {
    let root = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    cpus(root.path(), 16, "Intel(R) Core(TM) i7-12700");
    ram(root.path(), 32 * 1024 * 1024);
    tunables(root.path());

    let report = context(root.path(), state.path()).optimize(true).unwrap();
    assert_eq!(report.classification.profile, SystemProfile::Developer);
    assert!(report.result.dry_run);
    assert_eq!(read(root.path(), "proc/sys/vm/swappiness"), "60\n");
    assert!(JsonFileStore::new(state.path()).get_raw(RECORD_KEY).unwrap().is_none());
}

#[test]
fn test_sparse_machine_still_gets_complete_plan() {
    let root = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    cpus(root.path(), 2, "Some CPU");

    let ctx = context(root.path(), state.path());
    let detected = ctx.detect().unwrap();
    assert!(!detected.warnings.is_empty());

    let classification = ctx.classify(&detected.inventory);
    assert_eq!(classification.profile, SystemProfile::Standard);
    let plan = ctx.plan(classification.profile, &detected.inventory).unwrap();
    assert!(plan.missing_keys().is_empty());
}

#[test]
fn test_no_cpu_is_fatal() {
    let root = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    let err = context(root.path(), state.path()).optimize(false).unwrap_err();
    assert!(matches!(err, TunerError::EnumerationFailed(_)));
}

/// Two scripted GPUs: a busy one and an idle one
struct ScriptedBackend;

#[async_trait]
impl GpuBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn enumerate(&self) -> situne::Result<Vec<DiscoveredGpu>> {
        Ok(["0000:01:00.0", "0000:02:00.0"]
            .iter()
            .map(|bus| DiscoveredGpu {
                vendor: GpuVendor::Nvidia,
                name: format!("GPU {}", bus),
                bus_id: bus.to_string(),
                vram_total: 24 << 30,
                capabilities: CapabilityBounds {
                    power_limit_w: Some(ValueRange::new(100.0, 450.0)),
                    temp_target_c: Some(ValueRange::new(60.0, 90.0)),
                    ..Default::default()
                },
            })
            .collect())
    }

    async fn sample(&self, device: &GpuDevice) -> situne::Result<GpuStatus> {
        let mut status = GpuStatus::empty(device.index);
        let busy = device.bus_id.starts_with("0000:01");
        status.utilization = Some(if busy { 95.0 } else { 5.0 });
        status.temperature_c = Some(if busy { 80.0 } else { 40.0 });
        status.memory_total = device.vram_total;
        Ok(status)
    }

    async fn apply(&self, _device: &GpuDevice, _config: &GpuConfig) -> situne::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_manager_places_work_on_idle_gpu() {
    let manager = AcceleratorManager::new(
        vec![Arc::new(ScriptedBackend) as Arc<dyn GpuBackend>],
        &TunerConfig::default(),
    );
    let devices = manager.detect_gpus().await;
    assert_eq!(devices.iter().map(|d| d.index).collect::<Vec<_>>(), vec![0, 1]);

    manager.poll_once().await;
    manager.enable_load_balancing(None);
    let assignment = manager.assign_workload(WorkloadType::Inference).unwrap();
    assert_eq!(assignment.gpu_index, 1);
    assert!((0.0..=1.0).contains(&assignment.confidence));

    let before = manager.device_config(0).unwrap();
    let mut too_hot = GpuConfig::balanced();
    too_hot.power_limit_w = Some(1000.0);
    assert!(matches!(
        manager.apply_config(0, too_hot).await,
        Err(TunerError::OutOfRange { .. })
    ));
    assert_eq!(manager.device_config(0).unwrap(), before);
    assert!(matches!(manager.get_status(7), Err(TunerError::NotFound(_))));
}

struct QuietHost;

impl OsSampler for QuietHost {
    fn sample(&mut self) -> situne::Result<OsMetrics> {
        Ok(OsMetrics::default())
    }
}

#[tokio::test]
async fn test_telemetry_snapshot_carries_gpu_statuses() {
    let manager = Arc::new(AcceleratorManager::new(
        vec![Arc::new(ScriptedBackend) as Arc<dyn GpuBackend>],
        &TunerConfig::default(),
    ));
    manager.detect_gpus().await;
    manager.poll_once().await;

    let aggregator =
        TelemetryAggregator::new(&TunerConfig::default(), Box::new(QuietHost), Some(manager));
    let mut sub = aggregator.subscribe();
    let snapshot = aggregator.sample_once().await.unwrap();
    assert_eq!(snapshot.gpu.len(), 2);

    match sub.recv().await {
        Some(TelemetryMessage::Snapshot(s)) => assert_eq!(s.gpu, snapshot.gpu),
        other => panic!("expected a snapshot, got {:?}", other),
    }
}
