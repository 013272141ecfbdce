//! # Multi-Process Harness
//!
//! Validates that independent OS processes can each open their own context on
//! the same device without interfering. Every worker process initialises the
//! driver itself, picks device `ordinal % device_count`, runs `add_two_arrays`
//! over its own 8 KiB shared buffers and reports only through its exit status.
//!
//! ```text
//!      Parent                       Worker k (own process)
//! +---------------+  spawn(k, m)  +---------------------------------+
//! | spawn_workers | ------------> | init -> device[k % n] -> bundle |
//! |               |               | launch -> wait -> verify        |
//! |    collect    | <-- status -- | exit 0 (pass) / 1 (fail)        |
//! +---------------+               +---------------------------------+
//! ```
//!
//! Handles never cross the process boundary; a failing worker cannot affect
//! its siblings.

use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::bundle::{BundleDesc, CommandBundle, ExecutionMode};
use crate::driver::{GroupCount, GroupSize, QueueGroupFlags, Timeout};
use crate::error::ConformanceError;
use crate::kernel::{Module, ModuleLocator};
use crate::memory::SharedBuffer;
use crate::negotiate::{find_ordinal, fit_group_size};
use crate::runtime::Runtime;

pub const ADD_MODULE: &str = "multi_process_add.spv";
pub const ADD_KERNEL: &str = "add_two_arrays";

/// Size of each operand buffer in bytes.
pub const BUFFER_BYTES: usize = 8192;
/// Initial value of every operand byte.
pub const INPUT_BYTE: u8 = 0x01;
/// Every output byte after the kernel ran.
pub const EXPECTED_BYTE: u8 = 2;

/// The two positional worker arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerArgs {
    pub ordinal: u32,
    pub mode: ExecutionMode,
}

/// Picks the device for worker `ordinal`, round-robin over `devices`.
pub fn select_device<T: Copy>(devices: &[T], ordinal: u32) -> Option<(usize, T)> {
    if devices.is_empty() {
        return None;
    }
    let index = ordinal as usize % devices.len();
    Some((index, devices[index]))
}

/// What a passing worker did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerReport {
    pub args: WorkerArgs,
    pub device_index: usize,
    pub device_count: usize,
    pub group_size: GroupSize,
    pub group_count: GroupCount,
}

/// Body of a worker process.
pub fn run_worker(
    runtime: &Runtime,
    locator: &ModuleLocator,
    args: WorkerArgs,
    timeout: Timeout,
) -> Result<WorkerReport, ConformanceError> {
    let devices = runtime.devices()?;
    let (device_index, device) = select_device(&devices, args.ordinal)
        .ok_or_else(|| ConformanceError::Unsupported("driver reports no devices".into()))?;
    info!(
        "[WORKER:INIT] Worker {} using device {}/{} ({} mode)",
        args.ordinal,
        device_index,
        devices.len(),
        args.mode
    );

    let props = runtime.queue_group_properties(device)?;
    let ordinal = find_ordinal(&props, QueueGroupFlags::COMPUTE).ok_or_else(|| {
        ConformanceError::Unsupported("no compute queue group on selected device".into())
    })?;

    let context = runtime.create_context()?;
    let report = {
        let mut bundle =
            CommandBundle::create(&context, device, &BundleDesc::new(ordinal, args.mode))?;

        let source = locator.source(ADD_MODULE)?;
        let module = Module::create(&context, device, &source)?;
        let mut kernel = module.kernel(ADD_KERNEL)?;

        let input_a = SharedBuffer::allocate(&context, device, BUFFER_BYTES, 1)?;
        let input_b = SharedBuffer::allocate(&context, device, BUFFER_BYTES, 1)?;
        input_a.fill(INPUT_BYTE)?;
        input_b.fill(INPUT_BYTE)?;

        let (group_size, group_count) = fit_group_size(&mut kernel, [BUFFER_BYTES as u32, 1, 1])?;
        kernel.set_buffer_arg(0, &input_a)?;
        kernel.set_buffer_arg(1, &input_b)?;

        bundle.launch(&kernel, group_count)?;
        bundle.submit_and_wait(timeout)?;
        bundle.destroy()?;

        let output = input_a.read::<u8>(BUFFER_BYTES)?;
        verify_sum(&output)?;

        input_b.free()?;
        input_a.free()?;

        WorkerReport {
            args,
            device_index,
            device_count: devices.len(),
            group_size,
            group_count,
        }
    };
    context.destroy()?;

    debug!("[WORKER:DONE] {:?}", report);
    Ok(report)
}

/// Checks every byte equals [`EXPECTED_BYTE`].
pub fn verify_sum(output: &[u8]) -> Result<(), ConformanceError> {
    match output.iter().position(|&b| b != EXPECTED_BYTE) {
        Some(index) => Err(ConformanceError::Mismatch {
            index,
            expected: EXPECTED_BYTE as u64,
            actual: output[index] as u64,
        }),
        None => Ok(()),
    }
}

/// Process exit status for a worker result: 0 pass, 1 any failure.
pub fn exit_status<T>(result: &Result<T, ConformanceError>) -> u8 {
    match result {
        Ok(_) => 0,
        Err(_) => 1,
    }
}

/// Which execution mode each worker uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ModePolicy {
    Immediate,
    Deferred,
    /// Even ordinals deferred, odd ordinals immediate.
    Alternate,
}

impl ModePolicy {
    pub fn mode_for(self, ordinal: u32) -> ExecutionMode {
        match self {
            ModePolicy::Immediate => ExecutionMode::Immediate,
            ModePolicy::Deferred => ExecutionMode::Deferred,
            ModePolicy::Alternate => {
                if ordinal % 2 == 0 {
                    ExecutionMode::Deferred
                } else {
                    ExecutionMode::Immediate
                }
            }
        }
    }
}

/// A running worker process.
pub struct SpawnedWorker {
    pub args: WorkerArgs,
    child: Child,
}

impl SpawnedWorker {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }
}

/// Spawns `count` workers of `exe`, passing `extra_args` after the two
/// positional arguments.
pub fn spawn_workers(
    exe: &Path,
    count: u32,
    policy: ModePolicy,
    extra_args: &[String],
) -> std::io::Result<Vec<SpawnedWorker>> {
    let mut workers = Vec::with_capacity(count as usize);
    for ordinal in 0..count {
        let args = WorkerArgs {
            ordinal,
            mode: policy.mode_for(ordinal),
        };
        let child = Command::new(exe)
            .arg(ordinal.to_string())
            .arg(args.mode.flag().to_string())
            .args(extra_args)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn();

        match child {
            Ok(child) => {
                info!(
                    "[HARNESS:START] Started worker {} (PID: {}, {} mode)",
                    ordinal,
                    child.id(),
                    args.mode
                );
                workers.push(SpawnedWorker { args, child });
            }
            Err(e) => {
                // Don't leave already-started siblings running.
                for mut worker in workers {
                    let _ = worker.child.kill();
                    let _ = worker.child.wait();
                }
                return Err(e);
            }
        }
    }
    Ok(workers)
}

/// Final state of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerOutcome {
    Passed,
    Failed { code: Option<i32> },
    /// Still running at the deadline; the parent killed it.
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerResult {
    pub args: WorkerArgs,
    pub outcome: WorkerOutcome,
}

/// Aggregated pass/fail over all workers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HarnessSummary {
    pub results: Vec<WorkerResult>,
}

impl HarnessSummary {
    pub fn passed(&self) -> usize {
        self.count(|o| matches!(o, WorkerOutcome::Passed))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, WorkerOutcome::Failed { .. }))
    }

    pub fn timed_out(&self) -> usize {
        self.count(|o| matches!(o, WorkerOutcome::TimedOut))
    }

    pub fn all_passed(&self) -> bool {
        !self.results.is_empty() && self.passed() == self.results.len()
    }

    fn count(&self, pred: impl Fn(&WorkerOutcome) -> bool) -> usize {
        self.results.iter().filter(|r| pred(&r.outcome)).count()
    }
}

fn outcome_of(status: ExitStatus) -> WorkerOutcome {
    if status.success() {
        WorkerOutcome::Passed
    } else {
        WorkerOutcome::Failed {
            code: status.code(),
        }
    }
}

/// Waits for every worker, killing those still running after `deadline`.
pub fn collect(workers: Vec<SpawnedWorker>, deadline: Duration) -> HarnessSummary {
    let start = Instant::now();
    let mut summary = HarnessSummary::default();

    for mut worker in workers {
        let outcome = loop {
            match worker.child.try_wait() {
                Ok(Some(status)) => break outcome_of(status),
                Ok(None) if start.elapsed() > deadline => {
                    error!(
                        "[HARNESS:TIMEOUT] Worker {} (PID: {}) exceeded {:?}, killing",
                        worker.args.ordinal,
                        worker.pid(),
                        deadline
                    );
                    let _ = worker.child.kill();
                    let _ = worker.child.wait();
                    break WorkerOutcome::TimedOut;
                }
                Ok(None) => thread::sleep(Duration::from_millis(10)),
                Err(e) => {
                    error!(
                        "[HARNESS:ERROR] Failed waiting for worker {}: {}",
                        worker.args.ordinal, e
                    );
                    break WorkerOutcome::Failed { code: None };
                }
            }
        };

        match outcome {
            WorkerOutcome::Passed => {
                info!("[HARNESS:SYNC] Worker {} passed", worker.args.ordinal)
            }
            WorkerOutcome::Failed { code } => error!(
                "[HARNESS:ERROR] Worker {} failed with status: {:?}",
                worker.args.ordinal, code
            ),
            WorkerOutcome::TimedOut => {}
        }

        summary.results.push(WorkerResult {
            args: worker.args,
            outcome,
        });
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::{DeviceModel, ReferenceDriver};
    use std::sync::Arc;

    fn runtime(devices: usize, model: DeviceModel) -> Runtime {
        Runtime::init(Arc::new(ReferenceDriver::new(vec![model; devices]))).unwrap()
    }

    #[test]
    fn test_select_device_round_robin() {
        let devices = ['a', 'b', 'c'];
        assert_eq!(select_device(&devices, 0), Some((0, 'a')));
        assert_eq!(select_device(&devices, 4), Some((1, 'b')));
        assert_eq!(select_device(&devices, 5), Some((2, 'c')));
        assert_eq!(select_device::<char>(&[], 1), None);
    }

    #[test]
    fn test_mode_policy() {
        assert_eq!(ModePolicy::Alternate.mode_for(0), ExecutionMode::Deferred);
        assert_eq!(ModePolicy::Alternate.mode_for(3), ExecutionMode::Immediate);
        assert_eq!(ModePolicy::Immediate.mode_for(2), ExecutionMode::Immediate);
    }

    #[test]
    fn test_worker_passes_in_both_modes() {
        let runtime = runtime(3, DeviceModel::default());
        for ordinal in 0..4 {
            for mode in [ExecutionMode::Immediate, ExecutionMode::Deferred] {
                let args = WorkerArgs { ordinal, mode };
                let report =
                    run_worker(&runtime, &ModuleLocator::builtin(), args, Timeout::Infinite)
                        .unwrap();
                assert_eq!(report.device_index, ordinal as usize % 3);
                assert_eq!(report.device_count, 3);
                assert_eq!(
                    report.group_count.x as usize * report.group_size.x as usize,
                    BUFFER_BYTES
                );
            }
        }
    }

    #[test]
    fn test_worker_detects_mismatch() {
        let model = DeviceModel {
            skip_kernel_bodies: true,
            ..DeviceModel::default()
        };
        let runtime = runtime(1, model);
        let args = WorkerArgs {
            ordinal: 0,
            mode: ExecutionMode::Deferred,
        };
        let result = run_worker(&runtime, &ModuleLocator::builtin(), args, Timeout::Infinite);
        assert!(matches!(
            result,
            Err(ConformanceError::Mismatch {
                index: 0,
                expected: 2,
                actual: 1
            })
        ));
        assert_eq!(exit_status(&result), 1);
    }

    #[test]
    fn test_verify_sum() {
        let mut out = vec![EXPECTED_BYTE; 16];
        assert!(verify_sum(&out).is_ok());
        out[9] = 3;
        assert!(matches!(
            verify_sum(&out),
            Err(ConformanceError::Mismatch { index: 9, .. })
        ));
    }

    #[test]
    fn test_summary_counts() {
        let args = WorkerArgs {
            ordinal: 0,
            mode: ExecutionMode::Immediate,
        };
        let summary = HarnessSummary {
            results: vec![
                WorkerResult {
                    args,
                    outcome: WorkerOutcome::Passed,
                },
                WorkerResult {
                    args,
                    outcome: WorkerOutcome::Failed { code: Some(1) },
                },
                WorkerResult {
                    args,
                    outcome: WorkerOutcome::TimedOut,
                },
            ],
        };
        assert_eq!(summary.passed(), 1);
        assert_eq!(summary.failed(), 1);
        assert_eq!(summary.timed_out(), 1);
        assert!(!summary.all_passed());
        assert!(!HarnessSummary::default().all_passed());
    }
}
