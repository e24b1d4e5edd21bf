//! Silicon Tuner
//!
//! Hardware-adaptive OS tuning plus multi-GPU management and live telemetry.
//!
//! The optimization pipeline runs once per invocation:
//!
//! 1. [`inventory`] reads CPU, GPU, RAM and storage facts from `/proc` and `/sys`
//! 2. [`profile`] maps the inventory to a [`profile::SystemProfile`]
//! 3. [`tuning`] resolves the profile into a complete [`tuning::TuningPlan`]
//! 4. [`applier`] writes the plan idempotently and can roll it back
//!
//! [`engine::OptimizationContext`] wires the four together. Alongside it,
//! [`gpu::AcceleratorManager`] discovers and polls accelerators, raises
//! alerts and places workloads, and [`telemetry`] merges OS and GPU metrics
//! into snapshots streamed to subscribers.
//!
//! # Example
//!
//! ```no_run
//! use situne::config::TunerConfig;
//! use situne::engine::OptimizationContext;
//!
//! let ctx = OptimizationContext::from_config(TunerConfig::default());
//! let report = ctx.optimize(true)?;
//! println!("{} -> {}", report.classification.profile, report.plan.hash());
//! # Ok::<(), situne::TunerError>(())
//! ```

pub mod applier;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod gpu;
pub mod inventory;
pub mod profile;
pub mod store;
pub mod telemetry;
pub mod tuning;

pub use error::{Result, TunerError};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
