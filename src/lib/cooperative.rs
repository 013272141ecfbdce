//! # Cooperative Kernel Scenario
//!
//! Launches `cooperative_kernel` with grid-wide synchronization and checks
//! `output[i] == i + rows` for every `i` in `[0, rows]`, where `rows` is the
//! requested row count clamped to the device's resident-group maximum.
//! Devices without a cooperative-capable queue group skip the scenario.

use serde::Serialize;
use tracing::{info, warn};

use crate::bundle::{BundleDesc, CommandBundle, ExecutionMode};
use crate::driver::{GroupSize, QueueGroupFlags, Timeout};
use crate::error::{ConformanceError, Verdict};
use crate::kernel::{Module, ModuleLocator};
use crate::memory::SharedBuffer;
use crate::negotiate::{find_ordinal, plan_cooperative_launch, CooperativePlan};
use crate::runtime::Runtime;

pub const COOPERATIVE_MODULE: &str = "cooperative_kernel.spv";
pub const COOPERATIVE_KERNEL: &str = "cooperative_kernel";

/// Number of `u64` slots in the kernel's data buffer.
pub const DATA_LEN: usize = 4096;

/// Row counts exercised by default. 62 is the largest for which the kernel's
/// arithmetic cannot overflow a `u64`.
pub const ROW_COUNTS: [u32; 6] = [0, 1, 5, 10, 50, 62];

/// One point of the parameter grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CooperativeCase {
    pub rows: u32,
    pub mode: ExecutionMode,
}

impl std::fmt::Display for CooperativeCase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rows={}/{}", self.rows, self.mode)
    }
}

/// The full grid: every row count in both execution modes.
pub fn cases(rows: &[u32]) -> Vec<CooperativeCase> {
    rows.iter()
        .flat_map(|&rows| {
            [ExecutionMode::Deferred, ExecutionMode::Immediate]
                .into_iter()
                .map(move |mode| CooperativeCase { rows, mode })
        })
        .collect()
}

/// Result of a passing case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CooperativeReport {
    pub case: CooperativeCase,
    pub ordinal: u32,
    pub plan: CooperativePlan,
}

/// Expected buffer contents for `rows`.
pub fn expected_values(rows: u32) -> impl Iterator<Item = u64> {
    (0..=rows as u64).map(move |i| i + rows as u64)
}

/// Checks `output` against [`expected_values`], reporting the first mismatch.
pub fn verify(output: &[u64], rows: u32) -> Result<(), ConformanceError> {
    for (index, expected) in expected_values(rows).enumerate() {
        let actual = output.get(index).copied().ok_or(ConformanceError::Mismatch {
            index,
            expected,
            actual: 0,
        })?;
        if actual != expected {
            return Err(ConformanceError::Mismatch {
                index,
                expected,
                actual,
            });
        }
    }
    Ok(())
}

/// Runs one case against the default device.
pub fn run_case(
    runtime: &Runtime,
    locator: &ModuleLocator,
    case: CooperativeCase,
    timeout: Timeout,
) -> Result<Verdict<CooperativeReport>, ConformanceError> {
    let device = runtime.default_device()?;
    let props = runtime.queue_group_properties(device)?;

    let Some(ordinal) = find_ordinal(&props, QueueGroupFlags::COOPERATIVE_KERNELS) else {
        warn!("[COOP:SKIP] No command queues that support cooperative kernels");
        return Ok(Verdict::Skipped(
            "no command queue group supports cooperative kernels".into(),
        ));
    };

    let context = runtime.create_context()?;
    let report = {
        let mut bundle =
            CommandBundle::create(&context, device, &BundleDesc::new(ordinal, case.mode))?;

        let data = SharedBuffer::allocate(&context, device, DATA_LEN * 8, 8)?;
        data.write(&vec![0u64; DATA_LEN])?;

        let source = locator.source(COOPERATIVE_MODULE)?;
        let module = Module::create(&context, device, &source)?;
        let mut kernel = module.kernel(COOPERATIVE_KERNEL)?;

        // A small group size means more groups, which stresses cooperation.
        kernel.set_group_size(GroupSize::new(1, 1, 1))?;
        let plan = plan_cooperative_launch(&kernel, case.rows)?;

        kernel.set_buffer_arg(0, &data)?;
        kernel.set_arg(1, &plan.rows)?;
        bundle.launch_cooperative(&kernel, plan.group_count)?;
        bundle.submit_and_wait(timeout)?;

        let output = data.read::<u64>(plan.rows as usize + 1)?;
        verify(&output, plan.rows)?;

        bundle.destroy()?;
        data.free()?;

        CooperativeReport {
            case,
            ordinal,
            plan,
        }
    };
    context.destroy()?;

    info!(
        "[COOP:PASS] {} (ordinal {}, {} groups, max {})",
        case, report.ordinal, report.plan.group_count.x, report.plan.max_groups
    );
    Ok(Verdict::Passed(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::{DeviceModel, QueueGroupModel, ReferenceDriver};
    use std::sync::Arc;

    fn runtime(model: DeviceModel) -> Runtime {
        Runtime::init(Arc::new(ReferenceDriver::new(vec![model]))).unwrap()
    }

    #[test]
    fn test_case_grid() {
        let grid = cases(&ROW_COUNTS);
        assert_eq!(grid.len(), 12);
        assert!(grid.contains(&CooperativeCase {
            rows: 62,
            mode: ExecutionMode::Immediate
        }));
    }

    #[test]
    fn test_verify_reports_first_mismatch() {
        assert!(verify(&[3, 4, 5, 6], 3).is_ok());
        let err = verify(&[3, 4, 9, 7], 3).unwrap_err();
        assert!(matches!(
            err,
            ConformanceError::Mismatch {
                index: 2,
                expected: 5,
                actual: 9
            }
        ));
    }

    #[test]
    fn test_all_cases_pass_on_reference_device() {
        let runtime = runtime(DeviceModel::default());
        for case in cases(&ROW_COUNTS) {
            let verdict =
                run_case(&runtime, &ModuleLocator::builtin(), case, Timeout::Infinite).unwrap();
            assert!(verdict.is_passed(), "{}", case);
            match verdict {
                Verdict::Passed(report) => {
                    assert_eq!(report.plan.rows, case.rows);
                    assert!(!report.plan.was_clamped());
                }
                Verdict::Skipped(reason) => panic!("unexpected skip: {}", reason),
            }
        }
    }

    #[test]
    fn test_small_device_clamps_rows() {
        let model = DeviceModel {
            compute_units: 1,
            threads_per_unit: 4,
            ..DeviceModel::default()
        };
        let runtime = runtime(model);
        let case = CooperativeCase {
            rows: 10,
            mode: ExecutionMode::Deferred,
        };
        let verdict =
            run_case(&runtime, &ModuleLocator::builtin(), case, Timeout::Infinite).unwrap();
        let Verdict::Passed(report) = verdict else {
            panic!("expected pass");
        };
        assert_eq!(report.plan.max_groups, 4);
        assert_eq!(report.plan.rows, 4);
    }

    #[test]
    fn test_skip_without_cooperative_queue_group() {
        let model = DeviceModel {
            queue_groups: vec![QueueGroupModel {
                compute: true,
                copy: true,
                cooperative_kernels: false,
                num_queues: 1,
            }],
            ..DeviceModel::default()
        };
        let runtime = runtime(model);
        let case = CooperativeCase {
            rows: 5,
            mode: ExecutionMode::Immediate,
        };
        let verdict =
            run_case(&runtime, &ModuleLocator::builtin(), case, Timeout::Infinite).unwrap();
        assert!(!verdict.is_passed());
        assert!(matches!(verdict, Verdict::Skipped(_)));
    }

    #[test]
    fn test_cooperative_ordinal_need_not_be_zero() {
        let model = DeviceModel {
            queue_groups: vec![
                QueueGroupModel {
                    compute: true,
                    copy: false,
                    cooperative_kernels: false,
                    num_queues: 1,
                },
                QueueGroupModel {
                    compute: true,
                    copy: false,
                    cooperative_kernels: true,
                    num_queues: 1,
                },
            ],
            ..DeviceModel::default()
        };
        let runtime = runtime(model);
        let case = CooperativeCase {
            rows: 5,
            mode: ExecutionMode::Deferred,
        };
        let Verdict::Passed(report) =
            run_case(&runtime, &ModuleLocator::builtin(), case, Timeout::Infinite).unwrap()
        else {
            panic!("expected pass");
        };
        assert_eq!(report.ordinal, 1);
    }

    #[test]
    fn test_broken_device_is_caught() {
        let model = DeviceModel {
            skip_kernel_bodies: true,
            ..DeviceModel::default()
        };
        let runtime = runtime(model);
        let case = CooperativeCase {
            rows: 5,
            mode: ExecutionMode::Immediate,
        };
        let err = run_case(&runtime, &ModuleLocator::builtin(), case, Timeout::Infinite)
            .unwrap_err();
        assert!(matches!(err, ConformanceError::Mismatch { index: 0, .. }));
    }
}
