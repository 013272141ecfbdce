// Multi-process harness - spawns ze_worker processes and aggregates their exit status
// Each worker owns its driver state; nothing is shared but the device

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{error, info};

use ze_conform::harness::{collect, spawn_workers, HarnessSummary, ModePolicy};
use ze_conform::DriverArgs;

#[derive(Parser, Debug, Serialize)]
#[command(
    author,
    version,
    about = "Runs the add kernel in several independent processes"
)]
struct Args {
    /// Number of worker processes
    #[arg(long, default_value = "4")]
    workers: u32,

    /// Execution mode per worker
    #[arg(long, value_enum, default_value_t = ModePolicy::Alternate)]
    mode: ModePolicy,

    /// Seconds each worker may run before it is killed
    #[arg(long, default_value = "60")]
    timeout_secs: u64,

    /// Results directory
    #[arg(long, default_value = "results/multi_process")]
    out_dir: String,

    /// Worker binary (defaults to ze_worker next to this executable)
    #[arg(long)]
    worker_exe: Option<PathBuf>,

    #[command(flatten)]
    driver: DriverArgs,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("[HARNESS:INIT] Starting {} workers", args.workers);
    info!(
        "[HARNESS:INIT] Driver: {}, Mode: {:?}",
        args.driver.driver.as_str(),
        args.mode
    );

    fs::create_dir_all(&args.out_dir).context("Failed to create results directory")?;
    let config_path = Path::new(&args.out_dir).join("config.json");
    let config_json = serde_json::to_string_pretty(&args).context("Failed to serialize config")?;
    fs::write(&config_path, config_json)
        .with_context(|| format!("Failed to write config to {:?}", config_path))?;

    let worker_exe = match &args.worker_exe {
        Some(path) => path.clone(),
        None => default_worker_exe()?,
    };

    let mut extra_args = args.driver.to_args();
    if args.verbose {
        extra_args.push("--verbose".to_string());
    }

    let start_time = Instant::now();
    let workers = spawn_workers(&worker_exe, args.workers, args.mode, &extra_args)
        .with_context(|| format!("Failed to start worker {:?}", worker_exe))?;
    let summary = collect(workers, Duration::from_secs(args.timeout_secs));

    let elapsed = start_time.elapsed();
    info!(
        "[HARNESS:DONE] {} passed, {} failed, {} timed out in {:.2} ms",
        summary.passed(),
        summary.failed(),
        summary.timed_out(),
        elapsed.as_secs_f64() * 1000.0
    );

    write_results(&args.out_dir, &summary)?;

    if !summary.all_passed() {
        error!("[HARNESS:ERROR] Not every worker passed");
        anyhow::bail!(
            "{} of {} workers did not pass",
            summary.results.len() - summary.passed(),
            summary.results.len()
        );
    }
    Ok(())
}

fn default_worker_exe() -> Result<PathBuf> {
    let current = std::env::current_exe().context("Failed to locate current executable")?;
    let name = format!("ze_worker{}", std::env::consts::EXE_SUFFIX);
    Ok(current.with_file_name(name))
}

fn write_results(out_dir: &str, summary: &HarnessSummary) -> Result<()> {
    let results_path = Path::new(out_dir).join("results.json");
    let json = serde_json::to_string_pretty(summary).context("Failed to serialize results")?;
    fs::write(&results_path, json)
        .with_context(|| format!("Failed to write results to {:?}", results_path))?;
    info!("[HARNESS:RESULTS] Results written to: {}", results_path.display());
    Ok(())
}
