// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! Optimization applier
//!
//! Applies a [`TuningPlan`] category by category against a [`SystemTarget`].
//! Each category is one atomic unit. Its writes are computed up front and
//! compared with the current values. If a write fails, the writes already
//! made for that category are undone before the failure is recorded. Other
//! categories still run.
//!
//! The prior value of every touched path is snapshotted into an
//! [`AppliedRecord`] kept in the [`StateStore`] under [`RECORD_KEY`].
//! [`rollback`](OptimizationApplier::rollback) restores it exactly. Applying
//! a plan whose hash matches a complete record is a no-op.

pub mod target;

pub use target::{FsTarget, SystemTarget};

use crate::error::{Result, TunerError};
use crate::inventory::is_virtual_block_device;
use crate::profile::SystemProfile;
use crate::store::{StateStore, StateStoreExt};
use crate::tuning::{Category, TuningPlan, TuningValue};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

pub const RECORD_KEY: &str = "applied_plan";

pub const SYSCTL_DROPIN: &str = "etc/sysctl.d/90-situne.conf";
pub const ZRAM_CONFIG: &str = "etc/systemd/zram-generator.conf";
pub const GRUB_DROPIN: &str = "etc/default/grub.d/90-situne.cfg";
pub const GPU_CONFIG: &str = "etc/situne/gpu.conf";

/// How a path is written and how its current value is read back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteKind {
    /// Kernel attribute holding a single value
    Live,
    /// Block queue scheduler; the active choice is the bracketed one
    Scheduler,
    /// Configuration file owned by this tool
    Persistent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedWrite {
    pub path: String,
    pub value: String,
    pub kind: WriteKind,
}

impl PlannedWrite {
    fn live(path: impl Into<String>, value: impl ToString) -> Self {
        Self { path: path.into(), value: value.to_string(), kind: WriteKind::Live }
    }

    fn scheduler(path: impl Into<String>, value: impl ToString) -> Self {
        Self { path: path.into(), value: value.to_string(), kind: WriteKind::Scheduler }
    }

    fn persistent(path: impl Into<String>, value: impl Into<String>) -> Self {
        Self { path: path.into(), value: value.into(), kind: WriteKind::Persistent }
    }
}

/// Value of a path before the first apply; `None` means it did not exist
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathSnapshot {
    pub path: String,
    pub kind: WriteKind,
    pub previous: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CategoryOutcome {
    Applied,
    Unchanged,
    Failed { reason: String },
}

impl fmt::Display for CategoryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CategoryOutcome::Applied => write!(f, "applied"),
            CategoryOutcome::Unchanged => write!(f, "unchanged"),
            CategoryOutcome::Failed { reason } => write!(f, "failed: {}", reason),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyStatus {
    /// Every category applied or already matched
    Applied,
    /// Some categories failed, others went through
    Partial,
    /// Every category failed
    Rejected,
    /// Nothing needed changing
    NoOp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyResult {
    pub plan_hash: String,
    pub dry_run: bool,
    pub outcomes: BTreeMap<Category, CategoryOutcome>,
    pub reboot_required: bool,
}

impl ApplyResult {
    pub fn status(&self) -> ApplyStatus {
        let failed = self
            .outcomes
            .values()
            .filter(|o| matches!(o, CategoryOutcome::Failed { .. }))
            .count();
        let applied = self
            .outcomes
            .values()
            .filter(|o| **o == CategoryOutcome::Applied)
            .count();
        if failed > 0 && failed == self.outcomes.len() {
            ApplyStatus::Rejected
        } else if failed > 0 {
            ApplyStatus::Partial
        } else if applied == 0 {
            ApplyStatus::NoOp
        } else {
            ApplyStatus::Applied
        }
    }
}

/// What was applied and what the touched paths held before
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedRecord {
    pub plan_hash: String,
    pub version: String,
    pub profile: SystemProfile,
    /// Every category succeeded; only a complete record short-circuits re-apply
    pub complete: bool,
    pub applied_at: DateTime<Utc>,
    pub reboot_required: bool,
    pub snapshot: Vec<PathSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackResult {
    pub plan_hash: String,
    pub restored: usize,
    pub reboot_required: bool,
}

pub struct OptimizationApplier {
    target: Arc<dyn SystemTarget>,
    store: Arc<dyn StateStore>,
}

fn text(plan: &TuningPlan, key: &str) -> Result<String> {
    plan.get(key)
        .map(TuningValue::to_string)
        .ok_or_else(|| TunerError::NotFound(format!("plan key '{}'", key)))
}

/// Active scheduler of a `queue/scheduler` attribute (`mq-deadline [none]`)
fn selected_scheduler(raw: &str) -> String {
    raw.split_whitespace()
        .find_map(|t| t.strip_prefix('[').and_then(|t| t.strip_suffix(']')))
        .unwrap_or_else(|| raw.trim())
        .to_string()
}

fn available_schedulers(raw: &str) -> Vec<String> {
    raw.split_whitespace()
        .map(|t| t.trim_matches(|c| c == '[' || c == ']').to_string())
        .collect()
}

impl OptimizationApplier {
    pub fn new(target: Arc<dyn SystemTarget>, store: Arc<dyn StateStore>) -> Self {
        Self { target, store }
    }

    pub fn record(&self) -> Result<Option<AppliedRecord>> {
        self.store.get(RECORD_KEY)
    }

    /// Writes needed to realize one category of `plan`
    pub fn planned_writes(&self, category: Category, plan: &TuningPlan) -> Result<Vec<PlannedWrite>> {
        match category {
            Category::Sysctl => self.sysctl_writes(plan),
            Category::Governor => self.governor_writes(plan),
            Category::IoScheduler => self.io_writes(plan),
            Category::KernelParams => Ok(vec![PlannedWrite::persistent(GRUB_DROPIN, grub_dropin(plan)?)]),
            Category::GpuPowerMode => Ok(vec![PlannedWrite::persistent(GPU_CONFIG, gpu_config(plan)?)]),
        }
    }

    fn sysctl_writes(&self, plan: &TuningPlan) -> Result<Vec<PlannedWrite>> {
        let mut writes = Vec::new();
        let mut dropin = format!("# Managed by situne ({}, {})\n", plan.version, plan.profile);
        for (key, value) in plan.category(Category::Sysctl) {
            if let Some(name) = key.strip_prefix("vm.") {
                writes.push(PlannedWrite::live(format!("proc/sys/vm/{}", name), value));
                dropin.push_str(&format!("{} = {}\n", key, value));
            }
        }
        writes.push(PlannedWrite::persistent(SYSCTL_DROPIN, dropin));
        let zram = text(plan, "zram.size_mb")?;
        writes.push(PlannedWrite::persistent(
            ZRAM_CONFIG,
            format!(
                "# Managed by situne\n[zram0]\nzram-size = {}\ncompression-algorithm = zstd\n",
                zram
            ),
        ));
        Ok(writes)
    }

    fn governor_writes(&self, plan: &TuningPlan) -> Result<Vec<PlannedWrite>> {
        let governor = text(plan, "cpu.governor")?;
        let base = "sys/devices/system/cpu";
        let mut writes = Vec::new();
        for cpu in self.target.list(base)? {
            let is_cpu = cpu
                .strip_prefix("cpu")
                .map_or(false, |n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()));
            if !is_cpu {
                continue;
            }
            let dir = format!("{}/{}/cpufreq", base, cpu);
            if let Some(available) = self.target.read(&format!("{}/scaling_available_governors", dir))? {
                if !available.split_whitespace().any(|g| g == governor) {
                    return Err(TunerError::apply(
                        Category::Governor,
                        format!("{}: governor '{}' not offered ({})", cpu, governor, available.trim()),
                    ));
                }
            }
            let path = format!("{}/scaling_governor", dir);
            if self.target.read(&path)?.is_some() {
                writes.push(PlannedWrite::live(path, &governor));
            }
        }
        if writes.is_empty() {
            return Err(TunerError::apply(Category::Governor, "no cpufreq interface"));
        }
        Ok(writes)
    }

    fn io_writes(&self, plan: &TuningPlan) -> Result<Vec<PlannedWrite>> {
        let scheduler = text(plan, "storage.io_scheduler")?;
        let read_ahead = text(plan, "storage.read_ahead_kb")?;
        let mut writes = Vec::new();
        for dev in self.target.list("sys/block")? {
            if is_virtual_block_device(&dev) {
                continue;
            }
            let queue = format!("sys/block/{}/queue", dev);
            let sched_path = format!("{}/scheduler", queue);
            if let Some(raw) = self.target.read(&sched_path)? {
                if !available_schedulers(&raw).contains(&scheduler) {
                    return Err(TunerError::apply(
                        Category::IoScheduler,
                        format!("{}: scheduler '{}' not offered ({})", dev, scheduler, raw.trim()),
                    ));
                }
                writes.push(PlannedWrite::scheduler(sched_path, &scheduler));
            }
            let ra_path = format!("{}/read_ahead_kb", queue);
            if self.target.read(&ra_path)?.is_some() {
                writes.push(PlannedWrite::live(ra_path, &read_ahead));
            }
        }
        if writes.is_empty() {
            return Err(TunerError::apply(Category::IoScheduler, "no physical block devices"));
        }
        Ok(writes)
    }

    /// Value the target currently holds, normalised like the planned value
    fn current(&self, w: &PlannedWrite) -> Result<Option<String>> {
        let raw = self.target.read(&w.path)?;
        Ok(match w.kind {
            WriteKind::Persistent => raw,
            WriteKind::Live => raw.map(|s| s.trim().to_string()),
            WriteKind::Scheduler => raw.map(|s| selected_scheduler(&s)),
        })
    }

    fn put(&self, path: &str, kind: WriteKind, value: &str) -> Result<()> {
        match kind {
            WriteKind::Persistent => self.target.write_persistent(path, value),
            WriteKind::Live | WriteKind::Scheduler => self.target.write(path, value),
        }
    }

    fn restore(&self, snap: &PathSnapshot) -> Result<()> {
        match &snap.previous {
            Some(value) => self.put(&snap.path, snap.kind, value),
            None => self.target.remove(&snap.path),
        }
    }

    /// One category as an atomic unit
    fn apply_category(
        &self,
        category: Category,
        plan: &TuningPlan,
        dry_run: bool,
    ) -> (CategoryOutcome, Vec<PathSnapshot>) {
        let failed = |e: TunerError| {
            log::warn!("{}: {}", category, e);
            (CategoryOutcome::Failed { reason: e.to_string() }, Vec::new())
        };

        let writes = match self.planned_writes(category, plan) {
            Ok(writes) => writes,
            Err(e) => return failed(e),
        };
        let mut pending = Vec::new();
        for w in writes {
            let previous = match self.current(&w) {
                Ok(previous) => previous,
                Err(e) => return failed(e),
            };
            if w.kind != WriteKind::Persistent && previous.is_none() {
                return failed(TunerError::apply(category, format!("{} not present", w.path)));
            }
            if previous.as_deref() != Some(w.value.as_str()) {
                pending.push((w, previous));
            }
        }
        if pending.is_empty() {
            log::debug!("{}: already in place", category);
            return (CategoryOutcome::Unchanged, Vec::new());
        }
        if dry_run {
            for (w, previous) in &pending {
                log::info!(
                    "{} (dry run): {} {:?} -> {:?}",
                    category,
                    w.path,
                    previous.as_deref().unwrap_or("<absent>"),
                    w.value
                );
            }
            return (CategoryOutcome::Applied, Vec::new());
        }

        let mut done: Vec<PathSnapshot> = Vec::with_capacity(pending.len());
        for (w, previous) in pending {
            if let Err(e) = self.put(&w.path, w.kind, &w.value) {
                for snap in done.iter().rev() {
                    if let Err(undo) = self.restore(snap) {
                        log::warn!("{}: could not restore {}: {}", category, snap.path, undo);
                    }
                }
                return failed(TunerError::apply(category, format!("{}: {}", w.path, e)));
            }
            log::debug!("{}: wrote {}", category, w.path);
            done.push(PathSnapshot {
                path: w.path,
                kind: w.kind,
                previous,
            });
        }
        log::info!("{}: applied ({} path(s))", category, done.len());
        (CategoryOutcome::Applied, done)
    }

    /// Apply every category of `plan`. With `dry_run` nothing is written and
    /// no record is stored; outcomes say what would change.
    pub fn apply(&self, plan: &TuningPlan, dry_run: bool) -> Result<ApplyResult> {
        let plan_hash = plan.hash();
        let existing = self.record()?;

        if let Some(record) = existing.as_ref().filter(|r| r.complete && r.plan_hash == plan_hash) {
            log::info!("plan {} already applied at {}", &plan_hash[..12], record.applied_at);
            return Ok(ApplyResult {
                plan_hash,
                dry_run,
                outcomes: Category::ALL
                    .into_iter()
                    .map(|c| (c, CategoryOutcome::Unchanged))
                    .collect(),
                reboot_required: false,
            });
        }

        let mut outcomes = BTreeMap::new();
        let mut fresh = Vec::new();
        for category in Category::ALL {
            let (outcome, snapshots) = self.apply_category(category, plan, dry_run);
            outcomes.insert(category, outcome);
            fresh.extend(snapshots);
        }
        let reboot_required = outcomes.get(&Category::KernelParams) == Some(&CategoryOutcome::Applied);
        let result = ApplyResult {
            plan_hash: plan_hash.clone(),
            dry_run,
            outcomes,
            reboot_required,
        };
        if dry_run {
            return Ok(result);
        }

        // the oldest snapshot of a path is the state to return to
        let mut snapshot = existing.as_ref().map(|r| r.snapshot.clone()).unwrap_or_default();
        let known: HashSet<String> = snapshot.iter().map(|s| s.path.clone()).collect();
        snapshot.extend(fresh.into_iter().filter(|s| !known.contains(&s.path)));

        let record = AppliedRecord {
            plan_hash,
            version: plan.version.clone(),
            profile: plan.profile,
            complete: !matches!(result.status(), ApplyStatus::Partial | ApplyStatus::Rejected),
            applied_at: Utc::now(),
            reboot_required: reboot_required || existing.map_or(false, |r| r.reboot_required),
            snapshot,
        };
        self.store.put(RECORD_KEY, &record)?;
        log::info!("apply finished: {:?}", result.status());
        Ok(result)
    }

    /// Restore every snapshotted path and forget the record
    pub fn rollback(&self) -> Result<RollbackResult> {
        let record = self
            .record()?
            .ok_or_else(|| TunerError::NotFound("no applied plan to roll back".into()))?;

        let mut errors = Vec::new();
        for snap in record.snapshot.iter().rev() {
            if let Err(e) = self.restore(snap) {
                log::warn!("rollback: {}: {}", snap.path, e);
                errors.push(format!("{}: {}", snap.path, e));
            }
        }
        if !errors.is_empty() {
            return Err(TunerError::apply("rollback", errors.join("; ")));
        }
        self.store.delete(RECORD_KEY)?;

        let reboot_required = record.snapshot.iter().any(|s| s.path == GRUB_DROPIN);
        log::info!("rolled back {} path(s)", record.snapshot.len());
        Ok(RollbackResult {
            plan_hash: record.plan_hash,
            restored: record.snapshot.len(),
            reboot_required,
        })
    }
}

fn grub_dropin(plan: &TuningPlan) -> Result<String> {
    let cstate = text(plan, "cpu.max_cstate")?;
    let params = [
        format!("mitigations={}", text(plan, "kernel.mitigations")?),
        format!("transparent_hugepage={}", text(plan, "kernel.transparent_hugepage")?),
        format!("intel_idle.max_cstate={}", cstate),
        format!("processor.max_cstate={}", cstate),
    ];
    Ok(format!(
        "# Managed by situne ({}, {})\nGRUB_CMDLINE_LINUX_DEFAULT=\"$GRUB_CMDLINE_LINUX_DEFAULT {}\"\n",
        plan.version,
        plan.profile,
        params.join(" ")
    ))
}

fn gpu_config(plan: &TuningPlan) -> Result<String> {
    Ok(format!(
        "# Managed by situne ({}, {})\ndriver_tier = \"{}\"\npersistence_mode = {}\npower_mode = \"{}\"\n",
        plan.version,
        plan.profile,
        text(plan, "gpu.driver_tier")?,
        text(plan, "gpu.persistence_mode")?,
        text(plan, "gpu.power_mode")?,
    ))
}


#[cfg(test)]
mod tests {
    use super::fixtures::live_system;
    use super::*;
    use crate::config::TuningConfig;
    use crate::inventory::{CpuVendor, GpuInfo, HardwareInventory, StorageType};
    use crate::gpu::GpuVendor;
    use crate::store::MemoryStore;
    use crate::tuning::resolve;
    use std::collections::BTreeMap;
    use std::fs;
    use std::path::Path;
    use std::sync::Mutex;

    fn plan() -> TuningPlan {
        let inv = HardwareInventory {
            cpu_vendor: Some(CpuVendor::Intel),
            cpu_model: Some("i9-13900K".into()),
            cpu_generation: Some(13),
            cpu_cores: Some(24),
            gpu_list: vec![GpuInfo::new(GpuVendor::Nvidia, Some("RTX 4090".into()), Some(24.0))],
            ram_gb: Some(128),
            ram_speed: None,
            storage_type: Some(StorageType::Nvme),
            storage_gen: Some(4),
        };
        resolve(SystemProfile::ProWorkstation, &inv, &TuningConfig::default()).unwrap()
    }

    fn tree(root: &Path) -> BTreeMap<String, String> {
        fn walk(base: &Path, dir: &Path, out: &mut BTreeMap<String, String>) {
            for entry in fs::read_dir(dir).unwrap().flatten() {
                let path = entry.path();
                if path.is_dir() {
                    walk(base, &path, out);
                } else {
                    let rel = path.strip_prefix(base).unwrap().to_string_lossy().into_owned();
                    out.insert(rel, fs::read_to_string(&path).unwrap());
                }
            }
        }
        let mut out = BTreeMap::new();
        walk(root, root, &mut out);
        out
    }

    fn applier(root: &Path) -> (OptimizationApplier, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let applier = OptimizationApplier::new(Arc::new(FsTarget::new(root)), store.clone());
        (applier, store)
    }

    #[test]
    fn test_apply_writes_every_category() {
        let dir = tempfile::tempdir().unwrap();
        live_system(dir.path());
        let (applier, _) = applier(dir.path());

        let result = applier.apply(&plan(), false).unwrap();
        assert_eq!(result.status(), ApplyStatus::Applied);
        assert!(result.reboot_required);
        for category in Category::ALL {
            assert_eq!(result.outcomes[&category], CategoryOutcome::Applied, "{}", category);
        }

        let read = |rel: &str| fs::read_to_string(dir.path().join(rel)).unwrap();
        assert_eq!(read("proc/sys/vm/swappiness"), "10");
        assert_eq!(read("sys/devices/system/cpu/cpu1/cpufreq/scaling_governor"), "performance");
        assert_eq!(read("sys/block/sda/queue/scheduler"), "none");
        assert_eq!(read("sys/block/nvme0n1/queue/read_ahead_kb"), "1024");
        assert_eq!(read("sys/block/loop0/queue/scheduler"), "[none]\n");
        assert!(read(SYSCTL_DROPIN).contains("vm.swappiness = 10\n"));
        assert!(read(ZRAM_CONFIG).contains("zram-size = 8192"));
        assert!(read(GRUB_DROPIN).contains(
            "GRUB_CMDLINE_LINUX_DEFAULT=\"$GRUB_CMDLINE_LINUX_DEFAULT mitigations=auto \
             transparent_hugepage=always intel_idle.max_cstate=3 processor.max_cstate=3\""
        ));
        assert!(read(GPU_CONFIG).contains("driver_tier = \"nvidia-550\""));
    }

    #[test]
    fn test_second_apply_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        live_system(dir.path());
        let (applier, store) = applier(dir.path());
        let plan = plan();

        applier.apply(&plan, false).unwrap();
        let record_before = store.get_raw(RECORD_KEY).unwrap();
        let files_before = tree(dir.path());

        let again = applier.apply(&plan, false).unwrap();
        assert_eq!(again.status(), ApplyStatus::NoOp);
        assert!(!again.reboot_required);
        assert_eq!(store.get_raw(RECORD_KEY).unwrap(), record_before);
        assert_eq!(tree(dir.path()), files_before);
    }

    #[test]
    fn test_rollback_restores_exactly() {
        let dir = tempfile::tempdir().unwrap();
        live_system(dir.path());
        let before = tree(dir.path());
        let (applier, store) = applier(dir.path());

        applier.apply(&plan(), false).unwrap();
        assert_ne!(tree(dir.path()), before);

        let rolled = applier.rollback().unwrap();
        assert!(rolled.reboot_required);
        assert!(rolled.restored > 0);
        let after = tree(dir.path());
        // attributes are restored as the value the kernel reports
        let normalise = |m: &BTreeMap<String, String>| -> BTreeMap<String, String> {
            m.iter()
                .map(|(k, v)| {
                    let v = if k.ends_with("/scheduler") {
                        selected_scheduler(v)
                    } else {
                        v.trim().to_string()
                    };
                    (k.clone(), v)
                })
                .collect()
        };
        assert_eq!(normalise(&after), normalise(&before));
        assert_eq!(after.get(ZRAM_CONFIG), before.get(ZRAM_CONFIG));
        assert!(!dir.path().join(GRUB_DROPIN).exists());
        assert_eq!(store.get_raw(RECORD_KEY).unwrap(), None);

        assert!(matches!(applier.rollback(), Err(TunerError::NotFound(_))));
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        live_system(dir.path());
        let before = tree(dir.path());
        let (applier, store) = applier(dir.path());

        let result = applier.apply(&plan(), true).unwrap();
        assert!(result.dry_run);
        assert_eq!(result.status(), ApplyStatus::Applied);
        assert_eq!(tree(dir.path()), before);
        assert_eq!(store.get_raw(RECORD_KEY).unwrap(), None);
    }

    #[test]
    fn test_failure_is_isolated_per_category() {
        let dir = tempfile::tempdir().unwrap();
        live_system(dir.path());
        fs::write(dir.path().join("sys/block/sda/queue/scheduler"), "[mq-deadline] bfq\n").unwrap();
        let (applier, store) = applier(dir.path());

        let result = applier.apply(&plan(), false).unwrap();
        assert_eq!(result.status(), ApplyStatus::Partial);
        match &result.outcomes[&Category::IoScheduler] {
            CategoryOutcome::Failed { reason } => assert!(reason.contains("sda")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(result.outcomes[&Category::Sysctl], CategoryOutcome::Applied);
        // nothing in the failed category was touched
        assert_eq!(
            fs::read_to_string(dir.path().join("sys/block/nvme0n1/queue/read_ahead_kb")).unwrap(),
            "128\n"
        );

        let record: AppliedRecord = store.get(RECORD_KEY).unwrap().unwrap();
        assert!(!record.complete);
        // an incomplete record does not short-circuit the next apply
        let retry = applier.apply(&plan(), false).unwrap();
        assert_eq!(retry.status(), ApplyStatus::Partial);
        assert_eq!(retry.outcomes[&Category::Sysctl], CategoryOutcome::Unchanged);
    }

    /// Fails writes to one path, otherwise delegates
    struct FailingTarget {
        inner: FsTarget,
        fail_on: String,
        writes: Mutex<Vec<String>>,
    }

    impl SystemTarget for FailingTarget {
        fn read(&self, path: &str) -> Result<Option<String>> {
            self.inner.read(path)
        }
        fn write(&self, path: &str, content: &str) -> Result<()> {
            if path == self.fail_on {
                return Err(TunerError::Io(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "read-only attribute",
                )));
            }
            self.writes.lock().unwrap().push(path.to_string());
            self.inner.write(path, content)
        }
        fn write_persistent(&self, path: &str, content: &str) -> Result<()> {
            self.inner.write_persistent(path, content)
        }
        fn remove(&self, path: &str) -> Result<()> {
            self.inner.remove(path)
        }
        fn list(&self, dir: &str) -> Result<Vec<String>> {
            self.inner.list(dir)
        }
    }

    #[test]
    fn test_mid_category_failure_rolls_category_back() {
        let dir = tempfile::tempdir().unwrap();
        live_system(dir.path());
        let target = Arc::new(FailingTarget {
            inner: FsTarget::new(dir.path()),
            fail_on: "sys/block/sda/queue/read_ahead_kb".into(),
            writes: Mutex::new(Vec::new()),
        });
        let applier = OptimizationApplier::new(target.clone(), Arc::new(MemoryStore::new()));

        let result = applier.apply(&plan(), false).unwrap();
        assert!(matches!(
            result.outcomes[&Category::IoScheduler],
            CategoryOutcome::Failed { .. }
        ));
        assert!(target
            .writes
            .lock()
            .unwrap()
            .contains(&"sys/block/nvme0n1/queue/read_ahead_kb".to_string()));
        let read = |rel: &str| fs::read_to_string(dir.path().join(rel)).unwrap();
        assert_eq!(read("sys/block/nvme0n1/queue/read_ahead_kb").trim(), "128");
        assert_eq!(read("sys/block/sda/queue/scheduler").trim(), "mq-deadline");
    }

    #[test]
    fn test_missing_cpufreq_fails_governor_only() {
        let dir = tempfile::tempdir().unwrap();
        live_system(dir.path());
        fs::remove_dir_all(dir.path().join("sys/devices/system/cpu/cpu0")).unwrap();
        fs::remove_dir_all(dir.path().join("sys/devices/system/cpu/cpu1")).unwrap();
        let (applier, _) = applier(dir.path());

        let result = applier.apply(&plan(), false).unwrap();
        assert_eq!(
            result.outcomes[&Category::Governor],
            CategoryOutcome::Failed {
                reason: "Apply failed for governor: no cpufreq interface".into()
            }
        );
    }

    #[test]
    fn test_scheduler_parsing() {
        assert_eq!(selected_scheduler("mq-deadline kyber [none]\n"), "none");
        assert_eq!(selected_scheduler("none"), "none");
        assert_eq!(available_schedulers("[mq-deadline] bfq"), vec!["mq-deadline", "bfq"]);
    }

    #[test]
    fn test_status_classification() {
        let mut outcomes = BTreeMap::new();
        outcomes.insert(Category::Sysctl, CategoryOutcome::Unchanged);
        let mut result = ApplyResult {
            plan_hash: String::new(),
            dry_run: false,
            outcomes,
            reboot_required: false,
        };
        assert_eq!(result.status(), ApplyStatus::NoOp);
        result.outcomes.insert(Category::Governor, CategoryOutcome::Applied);
        assert_eq!(result.status(), ApplyStatus::Applied);
        result
            .outcomes
            .insert(Category::IoScheduler, CategoryOutcome::Failed { reason: "x".into() });
        assert_eq!(result.status(), ApplyStatus::Partial);
        result.outcomes.retain(|_, o| matches!(o, CategoryOutcome::Failed { .. }));
        assert_eq!(result.status(), ApplyStatus::Rejected);
    }
}
