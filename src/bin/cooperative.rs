//! # Cooperative Kernel Check
//!
//! Runs the cooperative kernel over the row-count grid in both execution
//! modes and prints one line per case. Devices without a cooperative queue
//! group report every case as skipped.

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use std::fs;
use tracing::{error, info, warn};

use ze_conform::cooperative::{cases, run_case, CooperativeCase, ROW_COUNTS};
use ze_conform::{CooperativePlan, DriverArgs, ExecutionMode, Runtime, Verdict};

#[derive(Parser, Debug)]
#[command(author, version, about = "Cooperative kernel conformance check")]
struct Args {
    /// Row counts to run, comma separated
    #[arg(long, value_delimiter = ',', default_values_t = ROW_COUNTS)]
    rows: Vec<u32>,

    /// Restrict to one execution mode
    #[arg(long, value_enum)]
    mode: Option<ExecutionMode>,

    /// Write per-case results as JSON
    #[arg(long)]
    out: Option<String>,

    #[command(flatten)]
    driver: DriverArgs,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum CaseOutcome {
    Passed { ordinal: u32, plan: CooperativePlan },
    Skipped { reason: String },
    Failed { error: String },
}

#[derive(Debug, Serialize)]
struct CaseResult {
    case: CooperativeCase,
    #[serde(flatten)]
    outcome: CaseOutcome,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let opened = args.driver.open()?;
    let runtime = Runtime::init(opened.driver.clone()).context("Driver init failed")?;
    let locator = args.driver.locator();
    let timeout = args.driver.timeout();

    let grid: Vec<CooperativeCase> = cases(&args.rows)
        .into_iter()
        .filter(|c| args.mode.map_or(true, |m| c.mode == m))
        .collect();
    info!(
        "[COOP:INIT] Running {} cases, modules from {}",
        grid.len(),
        locator
            .kernel_dir()
            .map_or_else(|| "builtin".to_string(), |dir| dir.display().to_string())
    );

    let mut results = Vec::with_capacity(grid.len());
    for case in grid {
        let outcome = match run_case(&runtime, &locator, case, timeout) {
            Ok(Verdict::Passed(report)) => CaseOutcome::Passed {
                ordinal: report.ordinal,
                plan: report.plan,
            },
            Ok(Verdict::Skipped(reason)) => CaseOutcome::Skipped { reason },
            Err(e) if e.is_skip() => {
                warn!("[COOP:SKIP] {}: {}", case, e);
                CaseOutcome::Skipped {
                    reason: e.to_string(),
                }
            }
            Err(e) => {
                error!("[COOP:FAIL] {}: {}", case, e);
                CaseOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };
        results.push(CaseResult { case, outcome });
    }

    let failed = results
        .iter()
        .filter(|r| matches!(r.outcome, CaseOutcome::Failed { .. }))
        .count();
    let skipped = results
        .iter()
        .filter(|r| matches!(r.outcome, CaseOutcome::Skipped { .. }))
        .count();
    info!(
        "[COOP:DONE] {} passed, {} skipped, {} failed",
        results.len() - failed - skipped,
        skipped,
        failed
    );
    opened.log_calls("COOP");

    if let Some(out) = &args.out {
        let json = serde_json::to_string_pretty(&results).context("Failed to serialize results")?;
        fs::write(out, json).with_context(|| format!("Failed to write results to {}", out))?;
    }

    if failed > 0 {
        anyhow::bail!("{} cooperative cases failed", failed);
    }
    Ok(())
}
