//! Built-in kernels of the reference device.
//!
//! Module images are not compiled; a module is recognised by its file name
//! and resolves to a fixed table of host-side kernel bodies. A body runs
//! once per work group. Cooperative launches run every group on its own
//! thread so grid-wide barriers behave as on hardware with all groups
//! resident.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;

use super::engine::{lock, Allocation, Memory};
use crate::cooperative::{COOPERATIVE_KERNEL, COOPERATIVE_MODULE};
use crate::driver::{DriverError, GroupCount, GroupSize};
use crate::harness::{ADD_KERNEL, ADD_MODULE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Param {
    /// A device address, passed as 8 bytes.
    Pointer,
    Scalar(usize),
}

impl Param {
    pub fn size(self) -> usize {
        match self {
            Param::Pointer => 8,
            Param::Scalar(size) => size,
        }
    }
}

type KernelBody = fn(&Group<'_>) -> Result<(), DriverError>;

pub(crate) struct KernelDef {
    pub name: &'static str,
    pub params: &'static [Param],
    body: KernelBody,
}

impl std::fmt::Debug for KernelDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelDef")
            .field("name", &self.name)
            .field("params", &self.params)
            .finish()
    }
}

#[derive(Debug)]
pub(crate) struct ModuleDef {
    pub file: &'static str,
    pub kernels: &'static [KernelDef],
}

impl ModuleDef {
    pub fn kernel(&self, name: &str) -> Option<&'static KernelDef> {
        // Module tables are 'static, so their kernels are too.
        let kernels: &'static [KernelDef] = self.kernels;
        kernels.iter().find(|k| k.name == name)
    }
}

static MODULES: &[ModuleDef] = &[
    ModuleDef {
        file: ADD_MODULE,
        kernels: &[KernelDef {
            name: ADD_KERNEL,
            params: &[Param::Pointer, Param::Pointer],
            body: add_two_arrays,
        }],
    },
    ModuleDef {
        file: COOPERATIVE_MODULE,
        kernels: &[KernelDef {
            name: COOPERATIVE_KERNEL,
            params: &[Param::Pointer, Param::Scalar(4)],
            body: cooperative_kernel,
        }],
    },
];

/// Looks up a module by the file name of `name`.
pub(crate) fn find_module(name: &str) -> Option<&'static ModuleDef> {
    let file = std::path::Path::new(name)
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or(name);
    MODULES.iter().find(|m| m.file == file)
}

enum BoundArg {
    Buffer(Arc<Allocation>, usize),
    Scalar(Vec<u8>),
}

/// Execution context of one work group.
pub(crate) struct Group<'a> {
    id: [u32; 3],
    size: GroupSize,
    count: GroupCount,
    args: &'a [BoundArg],
    grid: Option<&'a GridBarrier>,
}

impl Group<'_> {
    fn buffer(&self, index: usize) -> Result<(&Allocation, usize), DriverError> {
        match self.args.get(index) {
            Some(BoundArg::Buffer(alloc, offset)) => Ok((alloc.as_ref(), *offset)),
            _ => Err(DriverError::InvalidKernelArgumentIndex(index as u32)),
        }
    }

    fn scalar_u32(&self, index: usize) -> Result<u32, DriverError> {
        match self.args.get(index) {
            Some(BoundArg::Scalar(bytes)) if bytes.len() == 4 => {
                Ok(bytemuck::pod_read_unaligned::<u32>(bytes))
            }
            _ => Err(DriverError::InvalidKernelArgumentIndex(index as u32)),
        }
    }

    fn linear_id(&self) -> u64 {
        let [x, y, z] = self.id.map(u64::from);
        x + self.count.x as u64 * (y + self.count.y as u64 * z)
    }

    /// Global indices `[0, n)` owned by this group's work items, grid-strided.
    fn owned_indices(&self, n: u64) -> Vec<u64> {
        let threads = self.size.threads();
        let stride = self.count.total() * threads;
        let first = self.linear_id() * threads;
        (first..first + threads)
            .flat_map(|start| (start..n).step_by(stride as usize))
            .collect()
    }

    fn grid_sync(&self) -> Result<(), DriverError> {
        match self.grid {
            Some(barrier) => barrier.wait(),
            None if self.count.total() == 1 => Ok(()),
            None => Err(DriverError::InvalidArgument(
                "grid synchronization requires a cooperative launch".into(),
            )),
        }
    }
}

#[derive(Default)]
struct GridState {
    arrived: usize,
    generation: u64,
    aborted: bool,
}

/// A reusable barrier across all groups of a cooperative launch. Aborting it
/// releases every waiter with an error so one failing group cannot hang the
/// rest.
struct GridBarrier {
    parties: usize,
    state: Mutex<GridState>,
    cv: Condvar,
}

impl GridBarrier {
    fn new(parties: usize) -> Self {
        Self {
            parties,
            state: Mutex::new(GridState::default()),
            cv: Condvar::new(),
        }
    }

    fn wait(&self) -> Result<(), DriverError> {
        let mut state = lock(&self.state);
        if state.aborted {
            return Err(aborted());
        }
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.parties {
            state.arrived = 0;
            state.generation += 1;
            self.cv.notify_all();
            return Ok(());
        }
        while state.generation == generation && !state.aborted {
            state = self.cv.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        if state.generation == generation {
            Err(aborted())
        } else {
            Ok(())
        }
    }

    fn abort(&self) {
        lock(&self.state).aborted = true;
        self.cv.notify_all();
    }
}

fn aborted() -> DriverError {
    DriverError::DeviceLost("cooperative launch aborted".into())
}

fn bind(
    params: &[Param],
    args: &[Vec<u8>],
    memory: &Memory,
) -> Result<Vec<BoundArg>, DriverError> {
    params
        .iter()
        .zip(args)
        .map(|(param, bytes)| match param {
            Param::Pointer => {
                let addr = bytemuck::pod_read_unaligned::<u64>(bytes);
                let (alloc, offset) = memory.resolve(addr)?;
                Ok(BoundArg::Buffer(alloc, offset))
            }
            Param::Scalar(_) => Ok(BoundArg::Scalar(bytes.clone())),
        })
        .collect()
}

fn group_ids(count: GroupCount) -> impl Iterator<Item = [u32; 3]> {
    (0..count.z).flat_map(move |z| (0..count.y).flat_map(move |y| (0..count.x).map(move |x| [x, y, z])))
}

pub(crate) fn launch(
    kernel: &KernelDef,
    size: GroupSize,
    count: GroupCount,
    args: &[Vec<u8>],
    cooperative: bool,
    memory: &Memory,
) -> Result<(), DriverError> {
    let args = bind(kernel.params, args, memory)?;

    if !cooperative {
        for id in group_ids(count) {
            (kernel.body)(&Group {
                id,
                size,
                count,
                args: &args,
                grid: None,
            })?;
        }
        return Ok(());
    }

    let barrier = GridBarrier::new(count.total() as usize);
    let (args, barrier) = (&args, &barrier);
    thread::scope(|scope| {
        let mut handles = Vec::new();
        for id in group_ids(count) {
            let spawned = thread::Builder::new().spawn_scoped(scope, move || {
                let result = (kernel.body)(&Group {
                    id,
                    size,
                    count,
                    args,
                    grid: Some(barrier),
                });
                if result.is_err() {
                    barrier.abort();
                }
                result
            });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(_) => {
                    barrier.abort();
                    return Err(DriverError::OutOfHostMemory);
                }
            }
        }

        let mut first_error = None;
        for handle in handles {
            let result = handle
                .join()
                .unwrap_or_else(|_| Err(DriverError::DeviceLost("work group panicked".into())));
            if let Err(e) = result {
                // Abort errors are fallout; keep the root cause.
                if first_error.is_none() || first_error == Some(aborted()) {
                    first_error = Some(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    })
}

/// `a[i] += b[i]` over bytes, one-dimensional.
fn add_two_arrays(group: &Group<'_>) -> Result<(), DriverError> {
    let (a, a_offset) = group.buffer(0)?;
    let (b, b_offset) = group.buffer(1)?;

    let width = group.size.threads() as usize;
    let start = group.linear_id() as usize * width;
    let mut lhs = vec![0u8; width];
    let mut rhs = vec![0u8; width];
    a.read(a_offset + start, &mut lhs)?;
    b.read(b_offset + start, &mut rhs)?;

    for (l, r) in lhs.iter_mut().zip(&rhs) {
        *l = l.wrapping_add(*r);
    }
    a.write(a_offset + start, &lhs)
}

/// Leaves `data[i] == i + rows` for every `i` in `[0, rows]`.
///
/// Each of the `rows` steps reads a neighbour's value from the previous step,
/// so the result is only correct if every step is separated by a grid-wide
/// barrier. The buffer holds two generations of `rows + 1` slots each.
fn cooperative_kernel(group: &Group<'_>) -> Result<(), DriverError> {
    let (data, base) = group.buffer(0)?;
    let rows = group.scalar_u32(1)? as u64;
    let n = rows + 1;

    let required = (2 * n * 8) as usize;
    if data.len() < base + required {
        return Err(DriverError::InvalidArgument(format!(
            "cooperative_kernel needs {} bytes, buffer has {}",
            required,
            data.len() - base
        )));
    }
    let slot = |i: u64| base + (i * 8) as usize;
    let mine = group.owned_indices(n);

    for &i in &mine {
        data.write_u64(slot(i), i)?;
    }
    group.grid_sync()?;

    for step in 1..=rows {
        let current = ((step - 1) % 2) * n;
        let next = (step % 2) * n;
        for &i in &mine {
            let neighbour = (i + 1) % n;
            let value = data.read_u64(slot(current + neighbour))?;
            data.write_u64(
                slot(next + i),
                value.wrapping_sub(neighbour).wrapping_add(i + 1),
            )?;
        }
        group.grid_sync()?;
    }

    if rows % 2 == 1 {
        for &i in &mine {
            let value = data.read_u64(slot(n + i))?;
            data.write_u64(slot(i), value)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_with(len: usize) -> (Memory, u64) {
        let memory = Memory::default();
        let base = memory.allocate(1, len, 8).unwrap();
        (memory, base)
    }

    fn read_u64s(memory: &Memory, base: u64, count: usize) -> Vec<u64> {
        let (alloc, offset) = memory.resolve(base).unwrap();
        (0..count)
            .map(|i| alloc.read_u64(offset + i * 8).unwrap())
            .collect()
    }

    fn coop_args(base: u64, rows: u32) -> Vec<Vec<u8>> {
        vec![base.to_ne_bytes().to_vec(), rows.to_ne_bytes().to_vec()]
    }

    #[test]
    fn test_find_module_by_file_name() {
        assert!(find_module("kernels/multi_process_add.spv").is_some());
        assert!(find_module(COOPERATIVE_MODULE).is_some());
        assert!(find_module("missing.spv").is_none());
    }

    #[test]
    fn test_group_ids_cover_grid() {
        let ids: Vec<_> = group_ids(GroupCount::new(2, 2, 1)).collect();
        assert_eq!(ids, vec![[0, 0, 0], [1, 0, 0], [0, 1, 0], [1, 1, 0]]);
    }

    #[test]
    fn test_cooperative_kernel_with_strided_groups() {
        let (memory, base) = memory_with(4096);
        let kernel = find_module(COOPERATIVE_MODULE)
            .and_then(|m| m.kernel(COOPERATIVE_KERNEL))
            .unwrap();
        // Fewer groups than indices, so groups stride.
        launch(
            kernel,
            GroupSize::new(1, 1, 1),
            GroupCount::new(3, 1, 1),
            &coop_args(base, 7),
            true,
            &memory,
        )
        .unwrap();
        let expected: Vec<u64> = (0..8).map(|i| i + 7).collect();
        assert_eq!(read_u64s(&memory, base, 8), expected);
    }

    #[test]
    fn test_grid_sync_needs_cooperative_launch() {
        let (memory, base) = memory_with(4096);
        let kernel = find_module(COOPERATIVE_MODULE)
            .and_then(|m| m.kernel(COOPERATIVE_KERNEL))
            .unwrap();
        let err = launch(
            kernel,
            GroupSize::new(1, 1, 1),
            GroupCount::new(4, 1, 1),
            &coop_args(base, 3),
            false,
            &memory,
        )
        .unwrap_err();
        assert!(matches!(err, DriverError::InvalidArgument(_)));
    }

    #[test]
    fn test_failing_group_releases_the_others() {
        // Too small for 2 * (rows + 1) slots.
        let (memory, base) = memory_with(64);
        let kernel = find_module(COOPERATIVE_MODULE)
            .and_then(|m| m.kernel(COOPERATIVE_KERNEL))
            .unwrap();
        let err = launch(
            kernel,
            GroupSize::new(1, 1, 1),
            GroupCount::new(4, 1, 1),
            &coop_args(base, 10),
            true,
            &memory,
        )
        .unwrap_err();
        assert!(matches!(err, DriverError::InvalidArgument(_)));
    }

    #[test]
    fn test_add_two_arrays() {
        let memory = Memory::default();
        let a = memory.allocate(1, 32, 0).unwrap();
        let b = memory.allocate(1, 32, 0).unwrap();
        for (addr, byte) in [(a, 3u8), (b, 4u8)] {
            let (alloc, _) = memory.resolve(addr).unwrap();
            alloc.write(0, &[byte; 32]).unwrap();
        }
        let kernel = find_module(ADD_MODULE).and_then(|m| m.kernel(ADD_KERNEL)).unwrap();
        launch(
            kernel,
            GroupSize::new(8, 1, 1),
            GroupCount::new(4, 1, 1),
            &[a.to_ne_bytes().to_vec(), b.to_ne_bytes().to_vec()],
            false,
            &memory,
        )
        .unwrap();
        let (alloc, _) = memory.resolve(a).unwrap();
        let mut out = [0u8; 32];
        alloc.read(0, &mut out).unwrap();
        assert_eq!(out, [7u8; 32]);
    }
}
