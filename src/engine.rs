//! Optimization pipeline
//!
//! [`OptimizationContext`] carries the configuration, state store and target
//! explicitly through detect, classify, plan and apply. Nothing here is
//! global, so several contexts (a live system and an image root) can coexist.

use crate::applier::{ApplyResult, FsTarget, OptimizationApplier, RollbackResult, SystemTarget};
use crate::config::TunerConfig;
use crate::error::Result;
use crate::gpu::GpuDevice;
use crate::inventory::{HardwareInventory, InventoryCollector, InventoryReport};
use crate::profile::{self, Classification, SystemProfile};
use crate::store::{JsonFileStore, StateStore};
use crate::tuning::{self, TuningPlan};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

/// Everything one optimize run produced
#[derive(Debug, Clone, Serialize)]
pub struct OptimizationReport {
    pub inventory: HardwareInventory,
    pub warnings: Vec<String>,
    pub classification: Classification,
    pub plan: TuningPlan,
    pub result: ApplyResult,
}

pub struct OptimizationContext {
    config: TunerConfig,
    store: Arc<dyn StateStore>,
    target: Arc<dyn SystemTarget>,
    collector: InventoryCollector,
}

impl OptimizationContext {
    pub fn new(
        config: TunerConfig,
        store: Arc<dyn StateStore>,
        target: Arc<dyn SystemTarget>,
        collector: InventoryCollector,
    ) -> Self {
        Self {
            config,
            store,
            target,
            collector,
        }
    }

    /// Context for the configured target root and state directory
    pub fn from_config(config: TunerConfig) -> Self {
        let root = config.tuning.target_root.clone();
        let collector = if root == Path::new("/") {
            InventoryCollector::system()
        } else {
            InventoryCollector::with_root(&root)
        };
        let store = Arc::new(JsonFileStore::new(&config.store.dir));
        Self::new(config, store, Arc::new(FsTarget::new(root)), collector)
    }

    /// Enrich GPU facts from devices an accelerator backend already found
    pub fn with_gpu_hints(mut self, devices: &[GpuDevice]) -> Self {
        self.collector = self.collector.with_gpu_hints(devices);
        self
    }

    pub fn config(&self) -> &TunerConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn StateStore> {
        Arc::clone(&self.store)
    }

    pub fn detect(&self) -> Result<InventoryReport> {
        let report = self.collector.collect()?;
        for warning in &report.warnings {
            log::warn!("inventory: {}", warning);
        }
        Ok(report)
    }

    pub fn classify(&self, inventory: &HardwareInventory) -> Classification {
        let c = profile::classify_explained(inventory);
        log::info!("profile {} ({})", c.profile, c.reason);
        c
    }

    pub fn plan(&self, profile: SystemProfile, inventory: &HardwareInventory) -> Result<TuningPlan> {
        tuning::resolve(profile, inventory, &self.config.tuning)
    }

    pub fn applier(&self) -> OptimizationApplier {
        OptimizationApplier::new(Arc::clone(&self.target), Arc::clone(&self.store))
    }

    /// Detect, classify, plan and apply in one go
    pub fn optimize(&self, dry_run: bool) -> Result<OptimizationReport> {
        let InventoryReport { inventory, warnings } = self.detect()?;
        let classification = self.classify(&inventory);
        let plan = self.plan(classification.profile, &inventory)?;
        let result = self.applier().apply(&plan, dry_run)?;
        Ok(OptimizationReport {
            inventory,
            warnings: warnings.iter().map(ToString::to_string).collect(),
            classification,
            plan,
            result,
        })
    }

    pub fn rollback(&self) -> Result<RollbackResult> {
        self.applier().rollback()
    }
}
