//! Execution engines and device memory of the reference device.
//!
//! Each command queue and each immediate command list owns an [`Engine`]: a
//! worker thread fed batches over a channel, much like a GPU consumer draining
//! a submission ring. Completion is tracked with a counter pair behind a
//! mutex and condvar so host synchronization can honour timeouts.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::kernels::{self, KernelDef};
use crate::driver::{DriverError, GroupCount, GroupSize, Timeout};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Spacing between allocation base addresses; also the maximum allocation size.
const REGION_SPAN: u64 = 1 << 32;
const HEAP_BASE: u64 = 0xff00_0000_0000_0000;

/// A shared allocation.
pub(crate) struct Allocation {
    pub context: u64,
    pub base: u64,
    len: usize,
    bytes: Mutex<Vec<u8>>,
}

impl Allocation {
    pub fn len(&self) -> usize {
        self.len
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), DriverError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(DriverError::InvalidArgument(format!(
                "access {}+{} outside allocation {:#x} of {} bytes",
                offset, len, self.base, self.len
            ))),
        }
    }

    pub fn read(&self, offset: usize, out: &mut [u8]) -> Result<(), DriverError> {
        self.check(offset, out.len())?;
        out.copy_from_slice(&lock(&self.bytes)[offset..offset + out.len()]);
        Ok(())
    }

    pub fn write(&self, offset: usize, data: &[u8]) -> Result<(), DriverError> {
        self.check(offset, data.len())?;
        lock(&self.bytes)[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn read_u64(&self, offset: usize) -> Result<u64, DriverError> {
        let mut raw = [0u8; 8];
        self.read(offset, &mut raw)?;
        Ok(u64::from_ne_bytes(raw))
    }

    pub fn write_u64(&self, offset: usize, value: u64) -> Result<(), DriverError> {
        self.write(offset, &value.to_ne_bytes())
    }
}

/// All shared allocations of one driver instance, keyed by base address.
#[derive(Default)]
pub(crate) struct Memory {
    next_region: AtomicU64,
    allocations: Mutex<BTreeMap<u64, Arc<Allocation>>>,
}

impl Memory {
    pub fn allocate(&self, context: u64, size: usize, alignment: usize) -> Result<u64, DriverError> {
        if size == 0 {
            return Err(DriverError::UnsupportedSize("zero-byte allocation".into()));
        }
        if size as u64 > REGION_SPAN {
            return Err(DriverError::OutOfDeviceMemory);
        }
        if alignment != 0 && (!alignment.is_power_of_two() || alignment as u64 > REGION_SPAN) {
            return Err(DriverError::InvalidArgument(format!(
                "unsupported alignment {}",
                alignment
            )));
        }

        let region = self.next_region.fetch_add(1, Ordering::Relaxed);
        let base = HEAP_BASE + region * REGION_SPAN;
        let allocation = Allocation {
            context,
            base,
            len: size,
            bytes: Mutex::new(vec![0u8; size]),
        };
        lock(&self.allocations).insert(base, Arc::new(allocation));
        Ok(base)
    }

    pub fn free(&self, context: u64, base: u64) -> Result<(), DriverError> {
        let mut allocations = lock(&self.allocations);
        match allocations.get(&base) {
            Some(a) if a.context == context => {
                allocations.remove(&base);
                Ok(())
            }
            _ => Err(DriverError::InvalidArgument(format!(
                "{:#x} is not an allocation of this context",
                base
            ))),
        }
    }

    /// Finds the allocation containing `addr` and the offset into it.
    pub fn resolve(&self, addr: u64) -> Result<(Arc<Allocation>, usize), DriverError> {
        let allocations = lock(&self.allocations);
        allocations
            .range(..=addr)
            .next_back()
            .filter(|(base, a)| addr - **base < a.len as u64)
            .map(|(base, a)| (a.clone(), (addr - base) as usize))
            .ok_or_else(|| {
                DriverError::InvalidArgument(format!("{:#x} is not a device address", addr))
            })
    }

    /// Drops every allocation of `context`, returning how many were left.
    pub fn release_context(&self, context: u64) -> usize {
        let mut allocations = lock(&self.allocations);
        let before = allocations.len();
        allocations.retain(|_, a| a.context != context);
        before - allocations.len()
    }
}

/// A validated device command with kernel state captured at append time.
#[derive(Clone)]
pub(crate) enum Recorded {
    Launch {
        kernel: &'static KernelDef,
        group_size: GroupSize,
        groups: GroupCount,
        args: Vec<Vec<u8>>,
        cooperative: bool,
    },
    Barrier,
    Copy {
        dst: u64,
        src: u64,
        size: usize,
    },
    Fill {
        dst: u64,
        pattern: Vec<u8>,
        size: usize,
    },
}

pub(crate) type Batch = Arc<Vec<Recorded>>;

/// Execution behaviour taken from the device model.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ExecModel {
    pub latency: Duration,
    pub skip_kernel_bodies: bool,
}

#[derive(Default)]
struct ProgressState {
    submitted: u64,
    completed: u64,
    fault: Option<DriverError>,
}

#[derive(Default)]
struct Progress {
    state: Mutex<ProgressState>,
    done: Condvar,
}

/// An in-order execution channel backed by one worker thread.
pub(crate) struct Engine {
    sender: Mutex<Option<Sender<Batch>>>,
    progress: Arc<Progress>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub fn spawn(label: String, memory: Arc<Memory>, exec: ExecModel) -> Result<Self, DriverError> {
        let (sender, receiver) = mpsc::channel();
        let progress = Arc::new(Progress::default());
        let worker_progress = progress.clone();

        let worker = thread::Builder::new()
            .name(label)
            .spawn(move || run(receiver, worker_progress, memory, exec))
            .map_err(|_| DriverError::OutOfHostMemory)?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            progress,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn submit(&self, batch: Batch) -> Result<(), DriverError> {
        let sender = lock(&self.sender);
        let sender = sender
            .as_ref()
            .ok_or_else(|| DriverError::DeviceLost("engine stopped".into()))?;

        lock(&self.progress.state).submitted += 1;
        sender.send(batch).map_err(|_| {
            let mut state = lock(&self.progress.state);
            state.submitted -= 1;
            DriverError::DeviceLost("engine worker exited".into())
        })
    }

    /// Blocks until all submitted batches completed, or `timeout` elapsed.
    /// Reports the first fault raised since the last successful wait.
    pub fn wait(&self, timeout: Timeout) -> Result<(), DriverError> {
        let deadline = match timeout {
            Timeout::Infinite => None,
            Timeout::After(d) => Instant::now().checked_add(d),
        };

        let mut state = lock(&self.progress.state);
        while state.completed < state.submitted {
            state = match deadline {
                None => self
                    .progress
                    .done
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(DriverError::NotReady);
                    }
                    self.progress
                        .done
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }

        match state.fault.take() {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain and exit.
        lock(&self.sender).take();
        if let Some(worker) = lock(&self.worker).take() {
            if worker.join().is_err() {
                warn!("Reference engine worker panicked");
            }
        }
    }
}

fn run(receiver: Receiver<Batch>, progress: Arc<Progress>, memory: Arc<Memory>, exec: ExecModel) {
    for batch in receiver {
        if !exec.latency.is_zero() {
            thread::sleep(exec.latency);
        }
        let result = execute(&batch, &memory, &exec);

        let mut state = lock(&progress.state);
        state.completed += 1;
        if let Err(e) = result {
            warn!("Reference device fault: {}", e);
            state.fault.get_or_insert(e);
        }
        progress.done.notify_all();
    }
    debug!("Reference engine worker exiting");
}

fn execute(batch: &[Recorded], memory: &Memory, exec: &ExecModel) -> Result<(), DriverError> {
    for command in batch {
        match command {
            Recorded::Launch {
                kernel,
                group_size,
                groups,
                args,
                cooperative,
            } => {
                if exec.skip_kernel_bodies {
                    continue;
                }
                kernels::launch(kernel, *group_size, *groups, args, *cooperative, memory)?;
            }
            // The engine is in-order, so a barrier has nothing left to wait for.
            Recorded::Barrier => {}
            Recorded::Copy { dst, src, size } => {
                let mut staging = vec![0u8; *size];
                let (src, src_off) = memory.resolve(*src)?;
                src.read(src_off, &mut staging)?;
                let (dst, dst_off) = memory.resolve(*dst)?;
                dst.write(dst_off, &staging)?;
            }
            Recorded::Fill { dst, pattern, size } => {
                let data: Vec<u8> = pattern.iter().copied().cycle().take(*size).collect();
                let (dst, dst_off) = memory.resolve(*dst)?;
                dst.write(dst_off, &data)?;
            }
        }
    }
    Ok(())
}
