//! # Group-Size Negotiation
//!
//! Picks legal work-group decompositions from hardware limits.
//!
//! Ordinary launches ask the driver for a group size that divides the global
//! extents and derive the group count from it. Cooperative launches also need
//! the number of groups the device can keep resident at once for the kernel's
//! bound group size: every group of a cooperative launch must be resident so
//! grid-wide barriers can complete, so launching more than that maximum is a
//! correctness violation. The requested logical work is clamped to the
//! maximum; a maximum of zero is a hard failure.

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::driver::{DriverError, GroupCount, GroupSize, QueueGroupFlags, QueueGroupProperties};
use crate::kernel::Kernel;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("kernel '{0}' has no group size bound; set it before querying cooperative limits")]
    GroupSizeUnset(String),
    #[error("no cooperative launch is possible with group size {0:?}")]
    NoResidentGroups(GroupSize),
    #[error("suggested group size {size:?} does not divide global extents {global:?}")]
    Indivisible { size: GroupSize, global: [u32; 3] },
    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Index of the first queue group whose flags contain `required`.
pub fn find_ordinal(props: &[QueueGroupProperties], required: QueueGroupFlags) -> Option<u32> {
    props
        .iter()
        .position(|p| p.flags.contains(required))
        .map(|i| i as u32)
}

/// Asks the driver for a group size covering `global`, binds it to `kernel`
/// and returns it with the resulting group count.
pub fn fit_group_size(
    kernel: &mut Kernel<'_>,
    global: [u32; 3],
) -> Result<(GroupSize, GroupCount), NegotiationError> {
    let size = kernel.suggest_group_size(global)?;
    let count = group_count_for(global, size)?;
    kernel.set_group_size(size)?;

    debug!(
        "Kernel {}: global {:?} -> group size {:?}, count {:?}",
        kernel.name(),
        global,
        size,
        count
    );
    Ok((size, count))
}

/// Group count covering `global` with groups of `size`; every dimension
/// must divide evenly.
pub fn group_count_for(global: [u32; 3], size: GroupSize) -> Result<GroupCount, NegotiationError> {
    let dims = [size.x, size.y, size.z];
    if dims.iter().zip(global.iter()).any(|(&s, &g)| s == 0 || g % s != 0) {
        return Err(NegotiationError::Indivisible { size, global });
    }
    Ok(GroupCount::new(
        global[0] / size.x,
        global[1] / size.y,
        global[2] / size.z,
    ))
}

/// Clamps requested logical rows to the resident-group maximum.
pub fn clamp_rows(requested: u32, max_groups: u32, size: GroupSize) -> Result<u32, NegotiationError> {
    if max_groups == 0 {
        return Err(NegotiationError::NoResidentGroups(size));
    }
    Ok(requested.min(max_groups))
}

/// The negotiated shape of a cooperative launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CooperativePlan {
    pub group_size: GroupSize,
    /// Driver-reported maximum of simultaneously resident groups.
    pub max_groups: u32,
    pub requested_rows: u32,
    /// `min(requested_rows, max_groups)`.
    pub rows: u32,
    pub group_count: GroupCount,
}

impl CooperativePlan {
    pub fn was_clamped(&self) -> bool {
        self.rows < self.requested_rows
    }
}

/// Negotiates a cooperative launch for `requested_rows` of logical work.
///
/// The kernel's group size must already be bound. The logical work covers the
/// inclusive index range `[0, rows]`; the group count is `rows + 1` capped at
/// the resident maximum, and kernels stride over any remainder.
pub fn plan_cooperative_launch(
    kernel: &Kernel<'_>,
    requested_rows: u32,
) -> Result<CooperativePlan, NegotiationError> {
    let group_size = kernel
        .group_size()
        .ok_or_else(|| NegotiationError::GroupSizeUnset(kernel.name().to_string()))?;

    let max_groups = kernel.suggest_max_cooperative_group_count()?;
    let rows = clamp_rows(requested_rows, max_groups, group_size)?;
    let groups_x = rows.saturating_add(1).min(max_groups);

    let plan = CooperativePlan {
        group_size,
        max_groups,
        requested_rows,
        rows,
        group_count: GroupCount::new(groups_x, 1, 1),
    };

    if plan.was_clamped() {
        info!(
            "Kernel {}: clamped rows {} -> {} (max resident groups {})",
            kernel.name(),
            requested_rows,
            rows,
            max_groups
        );
    }
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cooperative::{COOPERATIVE_KERNEL, COOPERATIVE_MODULE};
    use crate::harness::{ADD_KERNEL, ADD_MODULE};
    use crate::kernel::{Module, ModuleLocator};
    use crate::reference::{DeviceModel, ReferenceDriver};
    use crate::runtime::Runtime;
    use std::sync::Arc;

    fn props(flags: &[QueueGroupFlags]) -> Vec<QueueGroupProperties> {
        flags
            .iter()
            .map(|&flags| QueueGroupProperties {
                flags,
                max_memory_fill_pattern_size: 8,
                num_queues: 1,
            })
            .collect()
    }

    #[test]
    fn test_find_ordinal() {
        let groups = props(&[
            QueueGroupFlags::COPY,
            QueueGroupFlags::COMPUTE,
            QueueGroupFlags::COMPUTE | QueueGroupFlags::COOPERATIVE_KERNELS,
        ]);
        assert_eq!(find_ordinal(&groups, QueueGroupFlags::COMPUTE), Some(1));
        assert_eq!(
            find_ordinal(&groups, QueueGroupFlags::COOPERATIVE_KERNELS),
            Some(2)
        );
        assert_eq!(find_ordinal(&groups, QueueGroupFlags::METRICS), None);
    }

    #[test]
    fn test_clamp_rows() {
        let size = GroupSize::new(1, 1, 1);
        assert_eq!(clamp_rows(62, 64, size), Ok(62));
        assert_eq!(clamp_rows(62, 16, size), Ok(16));
        assert_eq!(clamp_rows(0, 16, size), Ok(0));
        assert_eq!(
            clamp_rows(10, 0, size),
            Err(NegotiationError::NoResidentGroups(size))
        );
    }

    #[test]
    fn test_group_count_for() {
        let count = group_count_for([8192, 1, 1], GroupSize::new(256, 1, 1)).unwrap();
        assert_eq!(count, GroupCount::new(32, 1, 1));
        assert!(group_count_for([100, 1, 1], GroupSize::new(64, 1, 1)).is_err());
    }

    fn with_kernel<F>(model: DeviceModel, module: &str, name: &str, f: F)
    where
        F: FnOnce(&mut Kernel<'_>),
    {
        let runtime = Runtime::init(Arc::new(ReferenceDriver::new(vec![model]))).unwrap();
        let device = runtime.default_device().unwrap();
        let context = runtime.create_context().unwrap();
        let source = ModuleLocator::builtin().source(module).unwrap();
        let module = Module::create(&context, device, &source).unwrap();
        let mut kernel = module.kernel(name).unwrap();
        f(&mut kernel);
    }

    #[test]
    fn test_fit_group_size_divides_global() {
        with_kernel(DeviceModel::default(), ADD_MODULE, ADD_KERNEL, |kernel| {
            let (size, count) = fit_group_size(kernel, [8192, 1, 1]).unwrap();
            assert_eq!(8192 % size.x, 0);
            assert_eq!(count.x * size.x, 8192);
            assert_eq!(kernel.group_size(), Some(size));
        });
    }

    #[test]
    fn test_cooperative_query_requires_group_size() {
        with_kernel(
            DeviceModel::default(),
            COOPERATIVE_MODULE,
            COOPERATIVE_KERNEL,
            |kernel| {
                assert!(matches!(
                    plan_cooperative_launch(kernel, 5),
                    Err(NegotiationError::GroupSizeUnset(_))
                ));
                // The driver refuses the raw query as well.
                assert_eq!(
                    kernel.suggest_max_cooperative_group_count(),
                    Err(DriverError::InvalidGroupSizeDimension)
                );
            },
        );
    }

    #[test]
    fn test_cooperative_plan_clamps_to_resident_maximum() {
        let model = DeviceModel {
            compute_units: 2,
            threads_per_unit: 4,
            ..DeviceModel::default()
        };
        with_kernel(model, COOPERATIVE_MODULE, COOPERATIVE_KERNEL, |kernel| {
            kernel.set_group_size(GroupSize::new(1, 1, 1)).unwrap();
            let plan = plan_cooperative_launch(kernel, 50).unwrap();
            assert_eq!(plan.max_groups, 8);
            assert_eq!(plan.rows, 8);
            assert!(plan.was_clamped());
            assert_eq!(plan.group_count, GroupCount::new(8, 1, 1));

            let small = plan_cooperative_launch(kernel, 3).unwrap();
            assert_eq!(small.rows, 3);
            assert_eq!(small.group_count, GroupCount::new(4, 1, 1));
        });
    }

    #[test]
    fn test_zero_resident_groups_is_hard_failure() {
        let model = DeviceModel {
            threads_per_unit: 4,
            max_group_size: 64,
            ..DeviceModel::default()
        };
        with_kernel(model, COOPERATIVE_MODULE, COOPERATIVE_KERNEL, |kernel| {
            // Larger than a compute unit can hold, so nothing can be resident.
            kernel.set_group_size(GroupSize::new(8, 1, 1)).unwrap();
            assert!(matches!(
                plan_cooperative_launch(kernel, 5),
                Err(NegotiationError::NoResidentGroups(_))
            ));
        });
    }
}
