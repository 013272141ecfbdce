//! # Worker Process
//!
//! One participant of the multi-process check. Takes the worker ordinal and
//! an immediate-mode flag as positional arguments, initialises the driver in
//! its own address space, runs `add_two_arrays` on device
//! `ordinal % device_count` and reports through its exit status alone:
//! 0 when every output byte is 2, 1 otherwise.

use clap::error::ErrorKind;
use clap::Parser;
use std::process::ExitCode;
use tracing::{error, info};

use ze_conform::error::ConformanceError;
use ze_conform::harness::{exit_status, run_worker, WorkerArgs};
use ze_conform::{DriverArgs, ExecutionMode, Runtime};

#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-process conformance worker")]
struct Args {
    /// Worker ordinal; selects device ordinal % device_count
    ordinal: u32,

    /// Submission mode: 0 deferred, anything else immediate
    #[arg(allow_negative_numbers = true)]
    immediate: i64,

    #[command(flatten)]
    driver: DriverArgs,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    // Malformed arguments are a failed worker, not clap's usage exit code.
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(1),
            };
        }
    };

    let filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let worker = WorkerArgs {
        ordinal: args.ordinal,
        mode: ExecutionMode::from_flag(args.immediate),
    };

    let opened = match args.driver.open() {
        Ok(opened) => opened,
        Err(e) => {
            error!("[WORKER:ERROR] Worker {}: {:#}", worker.ordinal, e);
            return ExitCode::from(1);
        }
    };

    let result = Runtime::init(opened.driver.clone())
        .map_err(ConformanceError::from)
        .and_then(|runtime| {
            run_worker(
                &runtime,
                &args.driver.locator(),
                worker,
                args.driver.timeout(),
            )
        });

    match &result {
        Ok(report) => info!(
            "[WORKER:PASS] Worker {} on device {}/{}: group size {}, {} groups",
            worker.ordinal,
            report.device_index,
            report.device_count,
            report.group_size.x,
            report.group_count.x
        ),
        Err(e) if e.is_skip() => error!("[WORKER:FAIL] Worker {} unsupported: {}", worker.ordinal, e),
        Err(e) => error!("[WORKER:FAIL] Worker {}: {}", worker.ordinal, e),
    }
    opened.log_calls("WORKER");

    ExitCode::from(exit_status(&result))
}
