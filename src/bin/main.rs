//! CLI tool for Silicon Tuner (situne)

#[cfg(feature = "cli")]
use clap::{Parser, Subcommand};
#[cfg(feature = "cli")]
use colored::Colorize;
#[cfg(feature = "cli")]
use situne::{
    applier::{ApplyResult, ApplyStatus, CategoryOutcome},
    config::TunerConfig,
    engine::OptimizationContext,
    gpu::{self, balancer::WorkloadType, AcceleratorManager, GpuStatus},
    inventory::HardwareInventory,
    telemetry::{SysinfoSampler, TelemetryAggregator, TelemetryServer},
};
#[cfg(feature = "cli")]
use std::path::{Path, PathBuf};
#[cfg(feature = "cli")]
use std::sync::Arc;

#[cfg(feature = "cli")]
#[derive(Parser)]
#[command(name = "situne")]
#[command(about = "Silicon Tuner: hardware-adaptive OS tuning, multi-GPU management and live telemetry", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Filesystem root to inspect and tune (a mounted image or chroot)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Machine-readable JSON output
    #[arg(long, global = true)]
    json: bool,
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
enum Commands {
    /// Show the detected hardware inventory
    Detect,
    /// Show the performance profile for this machine
    Classify,
    /// Show the tuning plan for this machine
    Plan,
    /// Apply the tuning plan
    Apply {
        /// Report what would change without writing anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Restore the state recorded before the last apply
    Rollback,
    /// List accelerators
    Gpus,
    /// Sample one accelerator
    Status {
        /// Device index as listed by `gpus`
        index: u32,
    },
    /// Pick the best accelerator for a workload
    Assign {
        /// training, inference, rendering, gaming, compute or general
        workload: WorkloadType,
    },
    /// Monitor accelerators and stream telemetry until Ctrl-C
    Serve,
    /// Print a sample configuration file
    Config,
}

#[cfg(feature = "cli")]
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    env_logger::init();

    let mut config = match &cli.config {
        Some(path) => TunerConfig::from_toml_file(path)?,
        None => TunerConfig::default(),
    }
    .with_env_overrides()?;
    if let Some(root) = &cli.root {
        config.tuning.target_root = root.clone();
    }
    let live = config.tuning.target_root == Path::new("/");

    let runtime = tokio::runtime::Runtime::new()?;

    match &cli.command {
        Commands::Detect => {
            let ctx = context(&runtime, config, live);
            let report = ctx.detect()?;
            if cli.json {
                print_json(&report.inventory)?;
            } else {
                print_inventory(&report.inventory);
                for warning in &report.warnings {
                    println!("  {} {}", "warning:".yellow(), warning);
                }
            }
        }

        Commands::Classify => {
            let ctx = context(&runtime, config, live);
            let inventory = ctx.detect()?.inventory;
            let classification = ctx.classify(&inventory);
            if cli.json {
                print_json(&classification)?;
            } else {
                println!("{}", "═══ Profile ═══".cyan().bold());
                println!(
                    "  {} {}",
                    "Profile:".white().bold(),
                    classification.profile.to_string().green().bold()
                );
                println!("  {} {}", "Reason:".white().bold(), classification.reason);
                println!(
                    "  {} {}",
                    "Table:".white().bold(),
                    classification.table_version
                );
            }
        }

        Commands::Plan => {
            let ctx = context(&runtime, config, live);
            let inventory = ctx.detect()?.inventory;
            let classification = ctx.classify(&inventory);
            let plan = ctx.plan(classification.profile, &inventory)?;
            if cli.json {
                print_json(&plan)?;
            } else {
                println!("{}", "═══ Tuning Plan ═══".cyan().bold());
                print!("{}", plan);
                println!("  {} {}", "Hash:".white().bold(), plan.hash().dimmed());
            }
        }

        Commands::Apply { dry_run } => {
            if !dry_run && live {
                require_root("apply")?;
            }
            let ctx = context(&runtime, config, live);
            let report = ctx.optimize(*dry_run)?;
            if cli.json {
                print_json(&report)?;
            } else {
                println!(
                    "{} {}",
                    "Profile:".white().bold(),
                    report.classification.profile.to_string().green().bold()
                );
                print_apply(&report.result);
            }
            if report.result.status() == ApplyStatus::Rejected {
                std::process::exit(2);
            }
        }

        Commands::Rollback => {
            if live {
                require_root("rollback")?;
            }
            let ctx = OptimizationContext::from_config(config);
            let result = ctx.rollback()?;
            if cli.json {
                print_json(&result)?;
            } else {
                println!(
                    "{} restored {} path(s) from plan {}",
                    "✓".green(),
                    result.restored,
                    short_hash(&result.plan_hash)
                );
                if result.reboot_required {
                    println!("  {}", "Reboot required for kernel parameters".yellow());
                }
            }
        }

        Commands::Gpus => {
            let manager = AcceleratorManager::new(gpu::system_backends(), &config);
            let devices = runtime.block_on(manager.detect_gpus());
            if cli.json {
                print_json(&devices)?;
            } else {
                println!("{}", "═══ Accelerators ═══".cyan().bold());
                if devices.is_empty() {
                    println!("  {}", "No accelerators found".yellow());
                }
                for d in &devices {
                    println!(
                        "  {} [{}] {} {} ({}, {})",
                        "▶".green(),
                        d.index,
                        d.vendor,
                        d.name.white().bold(),
                        gpu::format_bytes(d.vram_total),
                        d.bus_id.dimmed()
                    );
                }
            }
        }

        Commands::Status { index } => {
            let manager = AcceleratorManager::new(gpu::system_backends(), &config);
            let status = runtime.block_on(async {
                manager.detect_gpus().await;
                manager.poll_once().await;
                manager.get_status(*index)
            })?;
            if cli.json {
                print_json(&status)?;
            } else {
                print_status(&status);
            }
        }

        Commands::Assign { workload } => {
            let manager = AcceleratorManager::new(gpu::system_backends(), &config);
            let assignment = runtime.block_on(async {
                manager.detect_gpus().await;
                manager.poll_once().await;
                manager.enable_load_balancing(None);
                manager.assign_workload(*workload)
            })?;
            if cli.json {
                print_json(&assignment)?;
            } else {
                println!(
                    "{} {} -> GPU {} (confidence {:.2}, {})",
                    "▶".green(),
                    assignment.workload_type,
                    assignment.gpu_index.to_string().white().bold(),
                    assignment.confidence,
                    assignment.strategy
                );
                println!("  {}", assignment.reason.dimmed());
            }
        }

        Commands::Serve => {
            runtime.block_on(serve(config))?;
        }

        Commands::Config => {
            print!("{}", TunerConfig::sample_toml());
        }
    }

    Ok(())
}

/// Optimization context; on a live system the accelerator backends refine
/// the GPU facts the collector reads from sysfs.
#[cfg(feature = "cli")]
fn context(runtime: &tokio::runtime::Runtime, config: TunerConfig, live: bool) -> OptimizationContext {
    if !live {
        return OptimizationContext::from_config(config);
    }
    let manager = AcceleratorManager::new(gpu::system_backends(), &config);
    let devices = runtime.block_on(manager.detect_gpus());
    OptimizationContext::from_config(config).with_gpu_hints(&devices)
}

#[cfg(feature = "cli")]
async fn serve(config: TunerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = OptimizationContext::from_config(config.clone()).store();
    let manager =
        Arc::new(AcceleratorManager::new(gpu::system_backends(), &config).with_store(store)?);
    manager.start_monitoring().await?;

    let aggregator = Arc::new(TelemetryAggregator::new(
        &config,
        Box::new(SysinfoSampler::new()),
        Some(Arc::clone(&manager)),
    ));
    aggregator.start().await;

    let addr = config.telemetry.listen_address();
    let server = TelemetryServer::bind(&addr, Arc::clone(&aggregator)).await?;
    println!(
        "{} telemetry on {} ({} accelerator(s))",
        "▶".green(),
        server.local_addr()?.to_string().white().bold(),
        manager.devices().len()
    );

    let (shutdown, stop_rx) = tokio::sync::watch::channel(false);
    let server_task = tokio::spawn(server.run(stop_rx));

    tokio::signal::ctrl_c().await?;
    println!("\n{}", "Shutting down...".yellow());
    let _ = shutdown.send(true);
    aggregator.stop().await;
    manager.stop().await;
    server_task.await??;
    Ok(())
}

#[cfg(all(feature = "cli", unix))]
fn require_root(action: &str) -> Result<(), Box<dyn std::error::Error>> {
    if nix::unistd::Uid::effective().is_root() {
        return Ok(());
    }
    Err(format!(
        "{} writes kernel settings and needs root (or use --root <dir> / --dry-run)",
        action
    )
    .into())
}

#[cfg(all(feature = "cli", not(unix)))]
fn require_root(_action: &str) -> Result<(), Box<dyn std::error::Error>> {
    Ok(())
}

#[cfg(feature = "cli")]
fn print_json<T: serde::Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(feature = "cli")]
fn or_unknown<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(|| "unknown".to_string(), |v| v.to_string())
}

#[cfg(feature = "cli")]
fn short_hash(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}

#[cfg(feature = "cli")]
fn print_inventory(inv: &HardwareInventory) {
    println!("{}", "═══ Hardware Inventory ═══".cyan().bold());
    println!(
        "  {} {} {} (gen {}, {} cores)",
        "CPU:".white().bold(),
        or_unknown(inv.cpu_vendor).green(),
        or_unknown(inv.cpu_model.as_deref()),
        or_unknown(inv.cpu_generation),
        or_unknown(inv.cpu_cores)
    );
    println!(
        "  {} {} GB @ {} MT/s",
        "RAM:".white().bold(),
        or_unknown(inv.ram_gb).green(),
        or_unknown(inv.ram_speed)
    );
    println!(
        "  {} {} (gen {})",
        "Storage:".white().bold(),
        or_unknown(inv.storage_type).green(),
        or_unknown(inv.storage_gen)
    );
    if inv.gpu_list.is_empty() {
        println!("  {} {}", "GPU:".white().bold(), "none".dimmed());
    }
    for g in &inv.gpu_list {
        println!(
            "  {} {} {} ({} GB VRAM, {})",
            "GPU:".white().bold(),
            g.vendor,
            or_unknown(g.name.as_deref()).green(),
            g.vram_gb.map_or_else(|| "?".to_string(), |v| format!("{:.0}", v)),
            if g.discrete { "discrete" } else { "integrated" }
        );
    }
}

#[cfg(feature = "cli")]
fn print_apply(result: &ApplyResult) {
    let title = if result.dry_run {
        "═══ Apply (dry run) ═══"
    } else {
        "═══ Apply ═══"
    };
    println!("{}", title.cyan().bold());
    for (category, outcome) in &result.outcomes {
        let mark = match outcome {
            CategoryOutcome::Applied => "✓".green(),
            CategoryOutcome::Unchanged => "=".dimmed(),
            CategoryOutcome::Failed { .. } => "✗".red().bold(),
        };
        println!("  {} {:<16} {}", mark, category.to_string(), outcome);
    }
    let status = format!("{:?}", result.status());
    let status = match result.status() {
        ApplyStatus::Applied | ApplyStatus::NoOp => status.green().bold(),
        ApplyStatus::Partial => status.yellow().bold(),
        ApplyStatus::Rejected => status.red().bold(),
    };
    println!(
        "  {} {} (plan {})",
        "Status:".white().bold(),
        status,
        short_hash(&result.plan_hash)
    );
    if result.reboot_required {
        println!("  {}", "Reboot required for kernel parameters".yellow());
    }
}

#[cfg(feature = "cli")]
fn print_status(s: &GpuStatus) {
    println!("{}", format!("═══ GPU {} ═══", s.index).cyan().bold());
    let temp = s.temperature_c.map(|t| format!("{:.0}°C", t));
    let temp = match s.temperature_c {
        Some(t) if t >= 85.0 => or_unknown(temp).red().bold(),
        _ => or_unknown(temp).green(),
    };
    println!("  {} {}", "Temperature:".white().bold(), temp);
    println!(
        "  {} {}",
        "Utilization:".white().bold(),
        or_unknown(s.utilization.map(|u| format!("{:.0}%", u)))
    );
    println!(
        "  {} {} / {}",
        "Memory:".white().bold(),
        gpu::format_bytes(s.memory_used),
        gpu::format_bytes(s.memory_total)
    );
    println!(
        "  {} {} (limit {})",
        "Power:".white().bold(),
        or_unknown(s.power_draw_w.map(|p| format!("{:.0} W", p))),
        or_unknown(s.power_limit_w.map(|p| format!("{:.0} W", p)))
    );
    println!(
        "  {} {}",
        "Fan:".white().bold(),
        or_unknown(s.fan_speed.map(|f| format!("{:.0}%", f)))
    );
    if s.stale {
        println!("  {}", "Sample is stale".yellow());
    }
}

#[cfg(not(feature = "cli"))]
fn main() {
    eprintln!("CLI features not enabled. Please compile with --features cli");
    std::process::exit(1);
}
