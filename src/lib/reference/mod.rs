//! # Reference Device
//!
//! An in-process implementation of [`Driver`] with real concurrency: queues
//! and immediate lists execute on worker threads, host synchronization
//! honours timeouts, and cooperative launches run every work group on its
//! own thread behind a grid-wide barrier. It validates its inputs the way a
//! conformant driver must, so the scenarios can be exercised (and broken on
//! purpose) without hardware.
//!
//! Devices are described by [`DeviceModel`]s, loadable from JSON through
//! [`ReferenceConfig`].

mod engine;
mod kernels;

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use self::engine::{lock, Engine, ExecModel, Memory, Recorded};
use self::kernels::{KernelDef, ModuleDef};
use crate::driver::{
    Command, ContextHandle, DeviceHandle, DevicePtr, Driver, DriverError, DriverHandle,
    GroupCount, GroupSize, InitFlags, KernelHandle, ListHandle, ModuleFormat, ModuleHandle,
    ModuleSource, QueueDesc, QueueFlags, QueueGroupFlags, QueueGroupProperties, QueueHandle,
    QueueMode, Timeout,
};

const DRIVER_HANDLE: u64 = 0x1000;
const DEVICE_BASE: u64 = 0x2000;
const OBJECT_BASE: u64 = 0x10_0000;
/// Init flag bits the driver understands (GPU only, VPU only).
const KNOWN_INIT_FLAGS: u32 = 0b11;

/// One command queue group of a modelled device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueGroupModel {
    pub compute: bool,
    pub copy: bool,
    pub cooperative_kernels: bool,
    pub num_queues: u32,
}

impl QueueGroupModel {
    pub fn properties(&self) -> QueueGroupProperties {
        let mut flags = QueueGroupFlags::empty();
        flags.set(QueueGroupFlags::COMPUTE, self.compute);
        flags.set(QueueGroupFlags::COPY, self.copy);
        flags.set(QueueGroupFlags::COOPERATIVE_KERNELS, self.cooperative_kernels);
        QueueGroupProperties {
            flags,
            max_memory_fill_pattern_size: if self.compute { 128 } else { 16 },
            num_queues: self.num_queues,
        }
    }
}

/// Hardware limits and behaviour of one reference device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceModel {
    pub name: String,
    pub compute_units: u32,
    /// Work items one compute unit keeps resident.
    pub threads_per_unit: u32,
    pub max_group_size: u32,
    pub queue_groups: Vec<QueueGroupModel>,
    /// Delay before each submitted batch starts executing.
    pub dispatch_latency_us: u64,
    /// Acknowledge launches without running them. Models a broken driver.
    pub skip_kernel_bodies: bool,
}

impl Default for DeviceModel {
    fn default() -> Self {
        Self {
            name: "reference-gpu".to_string(),
            compute_units: 8,
            threads_per_unit: 8,
            max_group_size: 256,
            queue_groups: vec![
                QueueGroupModel {
                    compute: true,
                    copy: true,
                    cooperative_kernels: true,
                    num_queues: 4,
                },
                QueueGroupModel {
                    compute: false,
                    copy: true,
                    cooperative_kernels: false,
                    num_queues: 2,
                },
            ],
            dispatch_latency_us: 0,
            skip_kernel_bodies: false,
        }
    }
}

impl DeviceModel {
    /// Groups of `size` that can be resident at once; zero if one group
    /// exceeds a compute unit.
    pub fn max_resident_groups(&self, size: GroupSize) -> u32 {
        let threads = size.threads().max(1);
        let per_unit = self.threads_per_unit as u64 / threads;
        u32::try_from(self.compute_units as u64 * per_unit).unwrap_or(u32::MAX)
    }

    fn exec_model(&self) -> ExecModel {
        ExecModel {
            latency: Duration::from_micros(self.dispatch_latency_us),
            skip_kernel_bodies: self.skip_kernel_bodies,
        }
    }
}

/// The device list of a reference driver, as stored in a JSON file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceConfig {
    pub devices: Vec<DeviceModel>,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            devices: vec![DeviceModel::default()],
        }
    }
}

impl ReferenceConfig {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json).context("Invalid reference device config")
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_json(&json)
    }
}

struct QueueObject {
    context: u64,
    device: usize,
    ordinal: u32,
    synchronous: bool,
    engine: Arc<Engine>,
}

enum ListKind {
    Regular {
        commands: Vec<Recorded>,
        closed: bool,
    },
    Immediate {
        engine: Arc<Engine>,
        synchronous: bool,
    },
}

struct ListObject {
    context: u64,
    device: usize,
    ordinal: u32,
    kind: ListKind,
}

struct ModuleObject {
    context: u64,
    device: usize,
    def: &'static ModuleDef,
}

struct KernelObject {
    context: u64,
    module: u64,
    device: usize,
    def: &'static KernelDef,
    group_size: Option<GroupSize>,
    args: Vec<Option<Vec<u8>>>,
}

#[derive(Default)]
struct Objects {
    contexts: HashSet<u64>,
    queues: HashMap<u64, QueueObject>,
    lists: HashMap<u64, ListObject>,
    modules: HashMap<u64, ModuleObject>,
    kernels: HashMap<u64, KernelObject>,
}

fn remove_where<V>(map: &mut HashMap<u64, V>, pred: impl Fn(&V) -> bool) -> Vec<V> {
    let keys: Vec<u64> = map.iter().filter(|(_, v)| pred(v)).map(|(k, _)| *k).collect();
    keys.into_iter().filter_map(|k| map.remove(&k)).collect()
}

/// Largest power of two not above `limit` that divides `n`.
fn pow2_divisor(n: u32, limit: u32) -> u32 {
    let mut g = 1u32;
    while g <= limit / 2 && n % (g * 2) == 0 {
        g *= 2;
    }
    g
}

/// An in-process compute driver over modelled devices.
pub struct ReferenceDriver {
    devices: Vec<DeviceModel>,
    initialized: AtomicBool,
    next_handle: AtomicU64,
    objects: Mutex<Objects>,
    memory: Arc<Memory>,
}

impl Default for ReferenceDriver {
    fn default() -> Self {
        Self::new(vec![DeviceModel::default()])
    }
}

impl ReferenceDriver {
    pub fn new(devices: Vec<DeviceModel>) -> Self {
        Self {
            devices,
            initialized: AtomicBool::new(false),
            next_handle: AtomicU64::new(OBJECT_BASE),
            objects: Mutex::new(Objects::default()),
            memory: Arc::new(Memory::default()),
        }
    }

    pub fn from_config(config: ReferenceConfig) -> Self {
        Self::new(config.devices)
    }

    pub fn models(&self) -> &[DeviceModel] {
        &self.devices
    }

    fn ensure_init(&self) -> Result<(), DriverError> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(DriverError::Uninitialized)
        }
    }

    fn next_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn device(&self, device: DeviceHandle) -> Result<(usize, &DeviceModel), DriverError> {
        device
            .0
            .checked_sub(DEVICE_BASE)
            .and_then(|i| usize::try_from(i).ok())
            .and_then(|i| self.devices.get(i).map(|m| (i, m)))
            .ok_or(DriverError::InvalidNullHandle)
    }

    fn queue_group(&self, device: usize, ordinal: u32) -> Result<&QueueGroupModel, DriverError> {
        let model = &self.devices[device];
        model.queue_groups.get(ordinal as usize).ok_or_else(|| {
            DriverError::InvalidArgument(format!(
                "ordinal {} out of range ({} queue groups on {})",
                ordinal,
                model.queue_groups.len(),
                model.name
            ))
        })
    }

    fn check_queue_desc(&self, device: usize, desc: &QueueDesc) -> Result<(), DriverError> {
        let unknown = desc.flags.bits() & !QueueFlags::all().bits();
        if unknown != 0 {
            return Err(DriverError::InvalidEnumeration(format!(
                "queue flags {:#x}",
                unknown
            )));
        }
        let group = self.queue_group(device, desc.ordinal)?;
        if desc.index >= group.num_queues {
            return Err(DriverError::InvalidArgument(format!(
                "queue index {} out of range ({} queues in group {})",
                desc.index, group.num_queues, desc.ordinal
            )));
        }
        Ok(())
    }

    fn check_context(objects: &Objects, context: ContextHandle) -> Result<(), DriverError> {
        if objects.contexts.contains(&context.0) {
            Ok(())
        } else {
            Err(DriverError::InvalidNullHandle)
        }
    }

    fn spawn_engine(&self, kind: &str, handle: u64, device: usize) -> Result<Arc<Engine>, DriverError> {
        let engine = Engine::spawn(
            format!("ref-{}-{:x}", kind, handle),
            self.memory.clone(),
            self.devices[device].exec_model(),
        )?;
        Ok(Arc::new(engine))
    }

    fn check_range(&self, addr: u64, size: usize) -> Result<(), DriverError> {
        let (alloc, offset) = self.memory.resolve(addr)?;
        if alloc.len() - offset < size {
            return Err(DriverError::InvalidArgument(format!(
                "{} bytes at {:#x} overrun the allocation",
                size, addr
            )));
        }
        Ok(())
    }

    fn record(
        &self,
        objects: &Objects,
        device: usize,
        ordinal: u32,
        command: &Command,
    ) -> Result<Recorded, DriverError> {
        match command {
            Command::LaunchKernel { kernel, groups } => {
                self.record_launch(objects, device, ordinal, *kernel, *groups, false)
            }
            Command::LaunchCooperativeKernel { kernel, groups } => {
                self.record_launch(objects, device, ordinal, *kernel, *groups, true)
            }
            Command::Barrier => Ok(Recorded::Barrier),
            Command::MemoryCopy { dst, src, size } => {
                self.check_range(dst.0, *size)?;
                self.check_range(src.0, *size)?;
                Ok(Recorded::Copy {
                    dst: dst.0,
                    src: src.0,
                    size: *size,
                })
            }
            Command::MemoryFill { dst, pattern, size } => {
                let max = self.queue_group(device, ordinal)?.properties().max_memory_fill_pattern_size;
                if pattern.is_empty() || pattern.len() > max {
                    return Err(DriverError::UnsupportedSize(format!(
                        "fill pattern of {} bytes (max {})",
                        pattern.len(),
                        max
                    )));
                }
                if size % pattern.len() != 0 {
                    return Err(DriverError::InvalidArgument(format!(
                        "fill size {} is not a multiple of the pattern size {}",
                        size,
                        pattern.len()
                    )));
                }
                self.check_range(dst.0, *size)?;
                Ok(Recorded::Fill {
                    dst: dst.0,
                    pattern: pattern.clone(),
                    size: *size,
                })
            }
        }
    }

    fn record_launch(
        &self,
        objects: &Objects,
        device: usize,
        ordinal: u32,
        kernel: KernelHandle,
        groups: GroupCount,
        cooperative: bool,
    ) -> Result<Recorded, DriverError> {
        let k = objects
            .kernels
            .get(&kernel.0)
            .ok_or(DriverError::InvalidNullHandle)?;
        if k.device != device {
            return Err(DriverError::InvalidArgument(
                "kernel was created for another device".into(),
            ));
        }
        let group_size = k.group_size.ok_or(DriverError::InvalidGroupSizeDimension)?;
        if groups.total() == 0 {
            return Err(DriverError::InvalidArgument("empty group count".into()));
        }
        let args = k
            .args
            .iter()
            .enumerate()
            .map(|(i, arg)| {
                arg.clone().ok_or_else(|| {
                    DriverError::InvalidArgument(format!(
                        "argument {} of {} is not set",
                        i, k.def.name
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        if cooperative {
            if !self.queue_group(device, ordinal)?.cooperative_kernels {
                return Err(DriverError::UnsupportedFeature(format!(
                    "queue group {} does not support cooperative kernels",
                    ordinal
                )));
            }
            let max = self.devices[device].max_resident_groups(group_size);
            if groups.total() > max as u64 {
                return Err(DriverError::UnsupportedSize(format!(
                    "{} groups exceed the {} that can be resident",
                    groups.total(),
                    max
                )));
            }
        }

        Ok(Recorded::Launch {
            kernel: k.def,
            group_size,
            groups,
            args,
            cooperative,
        })
    }

    fn with_kernel<T>(
        &self,
        kernel: KernelHandle,
        f: impl FnOnce(&mut KernelObject, &DeviceModel) -> Result<T, DriverError>,
    ) -> Result<T, DriverError> {
        self.ensure_init()?;
        let mut objects = lock(&self.objects);
        let k = objects
            .kernels
            .get_mut(&kernel.0)
            .ok_or(DriverError::InvalidNullHandle)?;
        let model = &self.devices[k.device];
        f(k, model)
    }

    fn immediate_engine(&self, list: ListHandle) -> Result<Arc<Engine>, DriverError> {
        let objects = lock(&self.objects);
        match objects.lists.get(&list.0).map(|l| &l.kind) {
            Some(ListKind::Immediate { engine, .. }) => Ok(engine.clone()),
            Some(ListKind::Regular { .. }) => Err(DriverError::InvalidArgument(
                "host synchronize requires an immediate command list".into(),
            )),
            None => Err(DriverError::InvalidNullHandle),
        }
    }
}

impl Driver for ReferenceDriver {
    fn name(&self) -> &str {
        "reference"
    }

    fn init(&self, flags: InitFlags) -> Result<(), DriverError> {
        if flags.0 & !KNOWN_INIT_FLAGS != 0 {
            return Err(DriverError::InvalidEnumeration(format!(
                "init flags {:#x}",
                flags.0
            )));
        }
        if !self.initialized.swap(true, Ordering::AcqRel) {
            info!("Reference driver up with {} device(s)", self.devices.len());
        }
        Ok(())
    }

    fn driver_handles(&self) -> Result<Vec<DriverHandle>, DriverError> {
        self.ensure_init()?;
        Ok(vec![DriverHandle(DRIVER_HANDLE)])
    }

    fn devices(&self, driver: DriverHandle) -> Result<Vec<DeviceHandle>, DriverError> {
        self.ensure_init()?;
        if driver.0 != DRIVER_HANDLE {
            return Err(DriverError::InvalidNullHandle);
        }
        Ok((0..self.devices.len() as u64)
            .map(|i| DeviceHandle(DEVICE_BASE + i))
            .collect())
    }

    fn command_queue_group_properties(
        &self,
        device: DeviceHandle,
    ) -> Result<Vec<QueueGroupProperties>, DriverError> {
        self.ensure_init()?;
        let (_, model) = self.device(device)?;
        Ok(model.queue_groups.iter().map(QueueGroupModel::properties).collect())
    }

    fn create_context(&self, driver: DriverHandle) -> Result<ContextHandle, DriverError> {
        self.ensure_init()?;
        if driver.0 != DRIVER_HANDLE {
            return Err(DriverError::InvalidNullHandle);
        }
        let handle = self.next_handle();
        lock(&self.objects).contexts.insert(handle);
        Ok(ContextHandle(handle))
    }

    fn destroy_context(&self, context: ContextHandle) -> Result<(), DriverError> {
        self.ensure_init()?;
        let ctx = context.0;
        let mut objects = lock(&self.objects);
        if !objects.contexts.remove(&ctx) {
            return Err(DriverError::InvalidNullHandle);
        }

        let kernels = remove_where(&mut objects.kernels, |k| k.context == ctx).len();
        let modules = remove_where(&mut objects.modules, |m| m.context == ctx).len();
        let queues = remove_where(&mut objects.queues, |q| q.context == ctx);
        let lists = remove_where(&mut objects.lists, |l| l.context == ctx);
        drop(objects);

        let allocations = self.memory.release_context(ctx);
        let leaked = kernels + modules + queues.len() + lists.len();
        if leaked > 0 || allocations > 0 {
            warn!(
                "Context {:#x} destroyed with {} live objects and {} allocations",
                ctx, leaked, allocations
            );
        }
        // Dropping engines outside the lock joins their workers.
        drop(queues);
        drop(lists);
        Ok(())
    }

    fn create_command_queue(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        desc: &QueueDesc,
    ) -> Result<QueueHandle, DriverError> {
        self.ensure_init()?;
        let (device, _) = self.device(device)?;
        Self::check_context(&lock(&self.objects), context)?;
        self.check_queue_desc(device, desc)?;

        let handle = self.next_handle();
        let engine = self.spawn_engine("queue", handle, device)?;
        lock(&self.objects).queues.insert(
            handle,
            QueueObject {
                context: context.0,
                device,
                ordinal: desc.ordinal,
                synchronous: desc.mode == QueueMode::Synchronous,
                engine,
            },
        );
        debug!("Queue {:#x} on ordinal {} index {}", handle, desc.ordinal, desc.index);
        Ok(QueueHandle(handle))
    }

    fn destroy_command_queue(&self, queue: QueueHandle) -> Result<(), DriverError> {
        self.ensure_init()?;
        let removed = lock(&self.objects).queues.remove(&queue.0);
        removed.map(drop).ok_or(DriverError::InvalidNullHandle)
    }

    fn create_command_list(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        ordinal: u32,
    ) -> Result<ListHandle, DriverError> {
        self.ensure_init()?;
        let (device, _) = self.device(device)?;
        let mut objects = lock(&self.objects);
        Self::check_context(&objects, context)?;
        self.queue_group(device, ordinal)?;

        let handle = self.next_handle();
        objects.lists.insert(
            handle,
            ListObject {
                context: context.0,
                device,
                ordinal,
                kind: ListKind::Regular {
                    commands: Vec::new(),
                    closed: false,
                },
            },
        );
        Ok(ListHandle(handle))
    }

    fn create_immediate_command_list(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        desc: &QueueDesc,
    ) -> Result<ListHandle, DriverError> {
        self.ensure_init()?;
        let (device, _) = self.device(device)?;
        Self::check_context(&lock(&self.objects), context)?;
        self.check_queue_desc(device, desc)?;

        let handle = self.next_handle();
        let engine = self.spawn_engine("imm", handle, device)?;
        lock(&self.objects).lists.insert(
            handle,
            ListObject {
                context: context.0,
                device,
                ordinal: desc.ordinal,
                kind: ListKind::Immediate {
                    engine,
                    synchronous: desc.mode == QueueMode::Synchronous,
                },
            },
        );
        debug!("Immediate list {:#x} on ordinal {}", handle, desc.ordinal);
        Ok(ListHandle(handle))
    }

    fn destroy_command_list(&self, list: ListHandle) -> Result<(), DriverError> {
        self.ensure_init()?;
        let removed = lock(&self.objects).lists.remove(&list.0);
        removed.map(drop).ok_or(DriverError::InvalidNullHandle)
    }

    fn close_command_list(&self, list: ListHandle) -> Result<(), DriverError> {
        self.ensure_init()?;
        let mut objects = lock(&self.objects);
        let list = objects
            .lists
            .get_mut(&list.0)
            .ok_or(DriverError::InvalidNullHandle)?;
        match &mut list.kind {
            ListKind::Regular { closed: true, .. } => Err(DriverError::InvalidArgument(
                "command list is already closed".into(),
            )),
            ListKind::Regular { closed, .. } => {
                *closed = true;
                Ok(())
            }
            ListKind::Immediate { .. } => Err(DriverError::InvalidArgument(
                "immediate command lists cannot be closed".into(),
            )),
        }
    }

    fn reset_command_list(&self, list: ListHandle) -> Result<(), DriverError> {
        self.ensure_init()?;
        let mut objects = lock(&self.objects);
        let list = objects
            .lists
            .get_mut(&list.0)
            .ok_or(DriverError::InvalidNullHandle)?;
        if let ListKind::Regular { commands, closed } = &mut list.kind {
            commands.clear();
            *closed = false;
        }
        Ok(())
    }

    fn append(&self, list: ListHandle, command: &Command) -> Result<(), DriverError> {
        self.ensure_init()?;
        let mut objects = lock(&self.objects);
        let target = objects
            .lists
            .get(&list.0)
            .ok_or(DriverError::InvalidNullHandle)?;
        if matches!(target.kind, ListKind::Regular { closed: true, .. }) {
            return Err(DriverError::InvalidArgument(
                "cannot append to a closed command list".into(),
            ));
        }
        let (device, ordinal) = (target.device, target.ordinal);
        let recorded = self.record(&objects, device, ordinal, command)?;

        let target = objects
            .lists
            .get_mut(&list.0)
            .ok_or(DriverError::InvalidNullHandle)?;
        let (engine, synchronous) = match &mut target.kind {
            ListKind::Regular { commands, .. } => {
                commands.push(recorded);
                return Ok(());
            }
            ListKind::Immediate {
                engine,
                synchronous,
            } => (engine.clone(), *synchronous),
        };
        drop(objects);

        engine.submit(Arc::new(vec![recorded]))?;
        if synchronous {
            engine.wait(Timeout::Infinite)?;
        }
        Ok(())
    }

    fn execute_command_lists(
        &self,
        queue: QueueHandle,
        lists: &[ListHandle],
    ) -> Result<(), DriverError> {
        self.ensure_init()?;
        if lists.is_empty() {
            return Err(DriverError::InvalidArgument("no command lists to execute".into()));
        }
        let objects = lock(&self.objects);
        let q = objects
            .queues
            .get(&queue.0)
            .ok_or(DriverError::InvalidNullHandle)?;

        let mut batch = Vec::new();
        for handle in lists {
            let list = objects
                .lists
                .get(&handle.0)
                .ok_or(DriverError::InvalidNullHandle)?;
            match &list.kind {
                ListKind::Immediate { .. } => {
                    return Err(DriverError::InvalidArgument(
                        "immediate command lists are not executed on a queue".into(),
                    ))
                }
                ListKind::Regular { closed: false, .. } => {
                    return Err(DriverError::InvalidArgument(format!(
                        "command list {:#x} is not closed",
                        handle.0
                    )))
                }
                ListKind::Regular { .. } if list.device != q.device || list.ordinal != q.ordinal => {
                    return Err(DriverError::InvalidArgument(format!(
                        "command list ordinal {} does not match queue ordinal {}",
                        list.ordinal, q.ordinal
                    )))
                }
                ListKind::Regular { commands, .. } => batch.extend(commands.iter().cloned()),
            }
        }
        let (engine, synchronous) = (q.engine.clone(), q.synchronous);
        drop(objects);

        engine.submit(Arc::new(batch))?;
        if synchronous {
            engine.wait(Timeout::Infinite)?;
        }
        Ok(())
    }

    fn synchronize_queue(&self, queue: QueueHandle, timeout: Timeout) -> Result<(), DriverError> {
        self.ensure_init()?;
        let engine = lock(&self.objects)
            .queues
            .get(&queue.0)
            .map(|q| q.engine.clone())
            .ok_or(DriverError::InvalidNullHandle)?;
        engine.wait(timeout)
    }

    fn synchronize_list_host(&self, list: ListHandle, timeout: Timeout) -> Result<(), DriverError> {
        self.ensure_init()?;
        self.immediate_engine(list)?.wait(timeout)
    }

    fn create_module(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        source: &ModuleSource,
    ) -> Result<ModuleHandle, DriverError> {
        self.ensure_init()?;
        let (device, _) = self.device(device)?;
        let mut objects = lock(&self.objects);
        Self::check_context(&objects, context)?;

        if source.format == ModuleFormat::Native {
            return Err(DriverError::ModuleBuildFailure(format!(
                "{}: native binaries are not supported",
                source.name
            )));
        }
        let def = kernels::find_module(&source.name).ok_or_else(|| {
            DriverError::ModuleBuildFailure(format!("{}: unknown module", source.name))
        })?;

        let handle = self.next_handle();
        objects.modules.insert(
            handle,
            ModuleObject {
                context: context.0,
                device,
                def,
            },
        );
        Ok(ModuleHandle(handle))
    }

    fn destroy_module(&self, module: ModuleHandle) -> Result<(), DriverError> {
        self.ensure_init()?;
        let mut objects = lock(&self.objects);
        if objects.kernels.values().any(|k| k.module == module.0) {
            return Err(DriverError::HandleObjectInUse);
        }
        objects
            .modules
            .remove(&module.0)
            .map(drop)
            .ok_or(DriverError::InvalidNullHandle)
    }

    fn create_kernel(&self, module: ModuleHandle, name: &str) -> Result<KernelHandle, DriverError> {
        self.ensure_init()?;
        let mut objects = lock(&self.objects);
        let m = objects
            .modules
            .get(&module.0)
            .ok_or(DriverError::InvalidNullHandle)?;
        let def = m
            .def
            .kernel(name)
            .ok_or_else(|| DriverError::InvalidKernelName(name.to_string()))?;

        let handle = self.next_handle();
        let kernel = KernelObject {
            context: m.context,
            module: module.0,
            device: m.device,
            def,
            group_size: None,
            args: vec![None; def.params.len()],
        };
        objects.kernels.insert(handle, kernel);
        Ok(KernelHandle(handle))
    }

    fn destroy_kernel(&self, kernel: KernelHandle) -> Result<(), DriverError> {
        self.ensure_init()?;
        lock(&self.objects)
            .kernels
            .remove(&kernel.0)
            .map(drop)
            .ok_or(DriverError::InvalidNullHandle)
    }

    fn set_group_size(&self, kernel: KernelHandle, size: GroupSize) -> Result<(), DriverError> {
        self.with_kernel(kernel, |k, model| {
            if size.x == 0 || size.y == 0 || size.z == 0 || size.threads() > model.max_group_size as u64 {
                return Err(DriverError::InvalidGroupSizeDimension);
            }
            k.group_size = Some(size);
            Ok(())
        })
    }

    fn suggest_group_size(
        &self,
        kernel: KernelHandle,
        global: [u32; 3],
    ) -> Result<GroupSize, DriverError> {
        self.with_kernel(kernel, |_, model| {
            if global.contains(&0) {
                return Err(DriverError::InvalidArgument(format!(
                    "global size {:?} has a zero dimension",
                    global
                )));
            }
            let mut budget = model.max_group_size.max(1);
            let mut dims = [1u32; 3];
            for (dim, &extent) in dims.iter_mut().zip(global.iter()) {
                *dim = pow2_divisor(extent, budget);
                budget /= *dim;
            }
            Ok(GroupSize::new(dims[0], dims[1], dims[2]))
        })
    }

    fn suggest_max_cooperative_group_count(&self, kernel: KernelHandle) -> Result<u32, DriverError> {
        self.with_kernel(kernel, |k, model| {
            let size = k.group_size.ok_or(DriverError::InvalidGroupSizeDimension)?;
            Ok(model.max_resident_groups(size))
        })
    }

    fn set_argument_value(
        &self,
        kernel: KernelHandle,
        index: u32,
        value: &[u8],
    ) -> Result<(), DriverError> {
        self.with_kernel(kernel, |k, _| {
            let param = k
                .def
                .params
                .get(index as usize)
                .ok_or(DriverError::InvalidKernelArgumentIndex(index))?;
            if param.size() != value.len() {
                return Err(DriverError::InvalidKernelArgumentSize {
                    index,
                    expected: param.size(),
                    actual: value.len(),
                });
            }
            k.args[index as usize] = Some(value.to_vec());
            Ok(())
        })
    }

    fn allocate_shared(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        size: usize,
        alignment: usize,
    ) -> Result<DevicePtr, DriverError> {
        self.ensure_init()?;
        self.device(device)?;
        Self::check_context(&lock(&self.objects), context)?;
        self.memory.allocate(context.0, size, alignment).map(DevicePtr)
    }

    fn free(&self, context: ContextHandle, ptr: DevicePtr) -> Result<(), DriverError> {
        self.ensure_init()?;
        Self::check_context(&lock(&self.objects), context)?;
        self.memory.free(context.0, ptr.0)
    }

    fn read_shared(
        &self,
        context: ContextHandle,
        ptr: DevicePtr,
        offset: usize,
        out: &mut [u8],
    ) -> Result<(), DriverError> {
        self.ensure_init()?;
        let (alloc, base) = self.memory.resolve(ptr.0)?;
        if alloc.context != context.0 {
            return Err(DriverError::InvalidArgument(
                "allocation belongs to another context".into(),
            ));
        }
        alloc.read(base.saturating_add(offset), out)
    }

    fn write_shared(
        &self,
        context: ContextHandle,
        ptr: DevicePtr,
        offset: usize,
        data: &[u8],
    ) -> Result<(), DriverError> {
        self.ensure_init()?;
        let (alloc, base) = self.memory.resolve(ptr.0)?;
        if alloc.context != context.0 {
            return Err(DriverError::InvalidArgument(
                "allocation belongs to another context".into(),
            ));
        }
        alloc.write(base.saturating_add(offset), data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cooperative::{COOPERATIVE_KERNEL, COOPERATIVE_MODULE};

    fn driver() -> (ReferenceDriver, ContextHandle, DeviceHandle) {
        let driver = ReferenceDriver::default();
        driver.init(InitFlags::default()).unwrap();
        let root = driver.driver_handles().unwrap()[0];
        let device = driver.devices(root).unwrap()[0];
        let context = driver.create_context(root).unwrap();
        (driver, context, device)
    }

    fn source(name: &str) -> ModuleSource {
        ModuleSource {
            name: name.to_string(),
            format: ModuleFormat::IlSpirv,
            image: Vec::new(),
            build_flags: String::new(),
        }
    }

    fn coop_kernel(driver: &ReferenceDriver, context: ContextHandle, device: DeviceHandle) -> KernelHandle {
        let module = driver
            .create_module(context, device, &source(COOPERATIVE_MODULE))
            .unwrap();
        driver.create_kernel(module, COOPERATIVE_KERNEL).unwrap()
    }

    #[test]
    fn test_calls_before_init_fail() {
        let driver = ReferenceDriver::default();
        assert_eq!(driver.driver_handles(), Err(DriverError::Uninitialized));
        driver.init(InitFlags::default()).unwrap();
        driver.init(InitFlags::default()).unwrap();
        assert_eq!(driver.driver_handles().unwrap().len(), 1);
        assert!(matches!(
            driver.init(InitFlags(1 << 9)),
            Err(DriverError::InvalidEnumeration(_))
        ));
    }

    #[test]
    fn test_queue_group_properties() {
        let (driver, _, device) = driver();
        let props = driver.command_queue_group_properties(device).unwrap();
        assert_eq!(props.len(), 2);
        assert!(props[0].flags.contains(QueueGroupFlags::COOPERATIVE_KERNELS));
        assert_eq!(props[1].flags, QueueGroupFlags::COPY);
        assert_eq!(
            driver.command_queue_group_properties(DeviceHandle(0xdead)),
            Err(DriverError::InvalidNullHandle)
        );
    }

    #[test]
    fn test_queue_index_out_of_range() {
        let (driver, context, device) = driver();
        let desc = QueueDesc {
            index: 4,
            ..QueueDesc::default()
        };
        assert!(matches!(
            driver.create_command_queue(context, device, &desc),
            Err(DriverError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_suggest_group_size() {
        let (driver, context, device) = driver();
        let kernel = coop_kernel(&driver, context, device);
        assert_eq!(
            driver.suggest_group_size(kernel, [8192, 1, 1]).unwrap(),
            GroupSize::new(256, 1, 1)
        );
        assert_eq!(
            driver.suggest_group_size(kernel, [96, 4, 1]).unwrap(),
            GroupSize::new(32, 4, 1)
        );
        assert_eq!(
            driver.suggest_group_size(kernel, [7, 1, 1]).unwrap(),
            GroupSize::new(1, 1, 1)
        );
        assert!(driver.suggest_group_size(kernel, [0, 1, 1]).is_err());
    }

    #[test]
    fn test_group_size_limits() {
        let (driver, context, device) = driver();
        let kernel = coop_kernel(&driver, context, device);
        assert_eq!(
            driver.set_group_size(kernel, GroupSize::new(512, 1, 1)),
            Err(DriverError::InvalidGroupSizeDimension)
        );
        assert_eq!(
            driver.set_group_size(kernel, GroupSize::new(0, 1, 1)),
            Err(DriverError::InvalidGroupSizeDimension)
        );
        driver.set_group_size(kernel, GroupSize::new(2, 1, 1)).unwrap();
        assert_eq!(driver.suggest_max_cooperative_group_count(kernel), Ok(32));
    }

    #[test]
    fn test_module_errors() {
        let (driver, context, device) = driver();
        assert!(matches!(
            driver.create_module(context, device, &source("nope.spv")),
            Err(DriverError::ModuleBuildFailure(_))
        ));
        let native = ModuleSource {
            format: ModuleFormat::Native,
            ..source(COOPERATIVE_MODULE)
        };
        assert!(matches!(
            driver.create_module(context, device, &native),
            Err(DriverError::ModuleBuildFailure(_))
        ));
    }

    #[test]
    fn test_module_in_use() {
        let (driver, context, device) = driver();
        let module = driver
            .create_module(context, device, &source(COOPERATIVE_MODULE))
            .unwrap();
        let kernel = driver.create_kernel(module, COOPERATIVE_KERNEL).unwrap();
        assert_eq!(driver.destroy_module(module), Err(DriverError::HandleObjectInUse));
        driver.destroy_kernel(kernel).unwrap();
        driver.destroy_module(module).unwrap();
    }

    #[test]
    fn test_launch_requires_arguments() {
        let (driver, context, device) = driver();
        let kernel = coop_kernel(&driver, context, device);
        driver.set_group_size(kernel, GroupSize::new(1, 1, 1)).unwrap();
        let list = driver.create_command_list(context, device, 0).unwrap();
        let launch = Command::LaunchKernel {
            kernel,
            groups: GroupCount::new(1, 1, 1),
        };
        assert!(matches!(
            driver.append(list, &launch),
            Err(DriverError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_cooperative_launch_limits() {
        let (driver, context, device) = driver();
        let kernel = coop_kernel(&driver, context, device);
        driver.set_group_size(kernel, GroupSize::new(1, 1, 1)).unwrap();
        let ptr = driver.allocate_shared(context, device, 4096, 8).unwrap();
        driver
            .set_argument_value(kernel, 0, &ptr.addr().to_ne_bytes())
            .unwrap();
        driver.set_argument_value(kernel, 1, &3u32.to_ne_bytes()).unwrap();

        let too_many = Command::LaunchCooperativeKernel {
            kernel,
            groups: GroupCount::new(65, 1, 1),
        };
        let list = driver.create_command_list(context, device, 0).unwrap();
        assert!(matches!(
            driver.append(list, &too_many),
            Err(DriverError::UnsupportedSize(_))
        ));

        let on_copy_group = driver.create_command_list(context, device, 1).unwrap();
        let launch = Command::LaunchCooperativeKernel {
            kernel,
            groups: GroupCount::new(4, 1, 1),
        };
        assert!(matches!(
            driver.append(on_copy_group, &launch),
            Err(DriverError::UnsupportedFeature(_))
        ));
    }

    #[test]
    fn test_deferred_list_lifecycle() {
        let (driver, context, device) = driver();
        let src = driver.allocate_shared(context, device, 16, 8).unwrap();
        let dst = driver.allocate_shared(context, device, 16, 8).unwrap();
        driver.write_shared(context, src, 0, &[5u8; 16]).unwrap();

        let queue = driver
            .create_command_queue(context, device, &QueueDesc::default())
            .unwrap();
        let list = driver.create_command_list(context, device, 0).unwrap();
        driver
            .append(list, &Command::MemoryCopy { dst, src, size: 16 })
            .unwrap();

        assert!(driver.execute_command_lists(queue, &[list]).is_err());
        driver.close_command_list(list).unwrap();
        assert!(driver.append(list, &Command::Barrier).is_err());
        driver.execute_command_lists(queue, &[list]).unwrap();
        driver.synchronize_queue(queue, Timeout::Infinite).unwrap();

        let mut out = [0u8; 16];
        driver.read_shared(context, dst, 0, &mut out).unwrap();
        assert_eq!(out, [5u8; 16]);

        driver.reset_command_list(list).unwrap();
        driver.append(list, &Command::Barrier).unwrap();
        assert!(matches!(
            driver.synchronize_list_host(list, Timeout::Infinite),
            Err(DriverError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_memory_fill_pattern() {
        let (driver, context, device) = driver();
        let dst = driver.allocate_shared(context, device, 8, 8).unwrap();
        let list = driver
            .create_immediate_command_list(context, device, &QueueDesc::default())
            .unwrap();
        driver
            .append(
                list,
                &Command::MemoryFill {
                    dst,
                    pattern: vec![1, 2],
                    size: 8,
                },
            )
            .unwrap();
        driver.synchronize_list_host(list, Timeout::Infinite).unwrap();
        let mut out = [0u8; 8];
        driver.read_shared(context, dst, 0, &mut out).unwrap();
        assert_eq!(out, [1, 2, 1, 2, 1, 2, 1, 2]);

        let odd = Command::MemoryFill {
            dst,
            pattern: vec![1, 2, 3],
            size: 8,
        };
        assert!(matches!(
            driver.append(list, &odd),
            Err(DriverError::InvalidArgument(_))
        ));
        assert!(matches!(
            driver.close_command_list(list),
            Err(DriverError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_destroy_context_releases_children() {
        let (driver, context, device) = driver();
        let ptr = driver.allocate_shared(context, device, 64, 8).unwrap();
        let queue = driver
            .create_command_queue(context, device, &QueueDesc::default())
            .unwrap();
        driver.destroy_context(context).unwrap();

        assert_eq!(
            driver.synchronize_queue(queue, Timeout::Infinite),
            Err(DriverError::InvalidNullHandle)
        );
        assert!(driver.read_shared(context, ptr, 0, &mut [0u8; 4]).is_err());
        assert_eq!(driver.destroy_context(context), Err(DriverError::InvalidNullHandle));
    }

    #[test]
    fn test_config_from_json() {
        let config = ReferenceConfig::from_json(
            r#"{"devices": [{"name": "tiny", "compute_units": 1}, {}]}"#,
        )
        .unwrap();
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.devices[0].name, "tiny");
        assert_eq!(config.devices[0].compute_units, 1);
        assert_eq!(config.devices[0].threads_per_unit, 8);
        assert_eq!(config.devices[1], DeviceModel::default());
        assert!(ReferenceConfig::from_json("{").is_err());
    }
}
