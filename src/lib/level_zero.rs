//! # Level Zero Backend
//!
//! Binds [`Driver`] to the system's Level Zero loader (`libze_loader.so`),
//! resolved at runtime with `libloading` so the crate builds and its tests
//! run on machines without the driver installed.
//!
//! Handles returned by the loader are raw pointers; they are carried as
//! integers inside the crate's handle newtypes and converted back at the
//! call site.

use std::collections::HashMap;
use std::ffi::{c_char, c_void, CString};
use std::path::Path;
use std::ptr;
use std::sync::Mutex;

use libloading::{Library, Symbol};
use tracing::{debug, info};

use crate::driver::{
    Command, ContextHandle, DeviceHandle, DevicePtr, Driver, DriverError, DriverHandle,
    GroupSize, InitFlags, KernelHandle, ListHandle, ModuleFormat, ModuleHandle, ModuleSource,
    QueueDesc, QueueGroupFlags, QueueGroupProperties, QueueHandle, QueueMode, QueuePriority,
    Timeout,
};

type ZeResult = u32;
type ZeHandle = *mut c_void;

const ZE_RESULT_SUCCESS: ZeResult = 0;

const STYPE_COMMAND_QUEUE_GROUP_PROPERTIES: u32 = 0x6;
const STYPE_CONTEXT_DESC: u32 = 0xd;
const STYPE_COMMAND_QUEUE_DESC: u32 = 0xe;
const STYPE_COMMAND_LIST_DESC: u32 = 0xf;
const STYPE_DEVICE_MEM_ALLOC_DESC: u32 = 0x15;
const STYPE_HOST_MEM_ALLOC_DESC: u32 = 0x16;
const STYPE_MODULE_DESC: u32 = 0x1b;
const STYPE_KERNEL_DESC: u32 = 0x1d;

/// Library names tried by [`LevelZeroDriver::load`].
pub const LOADER_NAMES: &[&str] = &["libze_loader.so.1", "libze_loader.so"];

#[repr(C)]
struct ZeCommandQueueGroupProperties {
    stype: u32,
    p_next: *mut c_void,
    flags: u32,
    max_memory_fill_pattern_size: usize,
    num_queues: u32,
}

#[repr(C)]
struct ZeContextDesc {
    stype: u32,
    p_next: *const c_void,
    flags: u32,
}

#[repr(C)]
struct ZeCommandQueueDesc {
    stype: u32,
    p_next: *const c_void,
    ordinal: u32,
    index: u32,
    flags: u32,
    mode: u32,
    priority: u32,
}

#[repr(C)]
struct ZeCommandListDesc {
    stype: u32,
    p_next: *const c_void,
    command_queue_group_ordinal: u32,
    flags: u32,
}

#[repr(C)]
struct ZeGroupCount {
    x: u32,
    y: u32,
    z: u32,
}

#[repr(C)]
struct ZeModuleDesc {
    stype: u32,
    p_next: *const c_void,
    format: u32,
    input_size: usize,
    p_input_module: *const u8,
    p_build_flags: *const c_char,
    p_constants: *const c_void,
}

#[repr(C)]
struct ZeKernelDesc {
    stype: u32,
    p_next: *const c_void,
    flags: u32,
    p_kernel_name: *const c_char,
}

#[repr(C)]
struct ZeDeviceMemAllocDesc {
    stype: u32,
    p_next: *const c_void,
    flags: u32,
    ordinal: u32,
}

#[repr(C)]
struct ZeHostMemAllocDesc {
    stype: u32,
    p_next: *const c_void,
    flags: u32,
}

type FnZeInit = unsafe extern "C" fn(flags: u32) -> ZeResult;
type FnZeDriverGet = unsafe extern "C" fn(count: *mut u32, drivers: *mut ZeHandle) -> ZeResult;
type FnZeDeviceGet =
    unsafe extern "C" fn(driver: ZeHandle, count: *mut u32, devices: *mut ZeHandle) -> ZeResult;
type FnZeDeviceGetCommandQueueGroupProperties = unsafe extern "C" fn(
    device: ZeHandle,
    count: *mut u32,
    props: *mut ZeCommandQueueGroupProperties,
) -> ZeResult;
type FnZeContextCreate =
    unsafe extern "C" fn(driver: ZeHandle, desc: *const ZeContextDesc, out: *mut ZeHandle) -> ZeResult;
type FnZeDestroy = unsafe extern "C" fn(handle: ZeHandle) -> ZeResult;
type FnZeCommandQueueCreate = unsafe extern "C" fn(
    context: ZeHandle,
    device: ZeHandle,
    desc: *const ZeCommandQueueDesc,
    out: *mut ZeHandle,
) -> ZeResult;
type FnZeCommandQueueExecuteCommandLists = unsafe extern "C" fn(
    queue: ZeHandle,
    count: u32,
    lists: *mut ZeHandle,
    fence: ZeHandle,
) -> ZeResult;
type FnZeSynchronize = unsafe extern "C" fn(handle: ZeHandle, timeout: u64) -> ZeResult;
type FnZeCommandListCreate = unsafe extern "C" fn(
    context: ZeHandle,
    device: ZeHandle,
    desc: *const ZeCommandListDesc,
    out: *mut ZeHandle,
) -> ZeResult;
type FnZeCommandListAppendLaunchKernel = unsafe extern "C" fn(
    list: ZeHandle,
    kernel: ZeHandle,
    groups: *const ZeGroupCount,
    signal: ZeHandle,
    num_wait: u32,
    wait: *mut ZeHandle,
) -> ZeResult;
type FnZeCommandListAppendBarrier =
    unsafe extern "C" fn(list: ZeHandle, signal: ZeHandle, num_wait: u32, wait: *mut ZeHandle) -> ZeResult;
type FnZeCommandListAppendMemoryCopy = unsafe extern "C" fn(
    list: ZeHandle,
    dst: *mut c_void,
    src: *const c_void,
    size: usize,
    signal: ZeHandle,
    num_wait: u32,
    wait: *mut ZeHandle,
) -> ZeResult;
type FnZeCommandListAppendMemoryFill = unsafe extern "C" fn(
    list: ZeHandle,
    dst: *mut c_void,
    pattern: *const c_void,
    pattern_size: usize,
    size: usize,
    signal: ZeHandle,
    num_wait: u32,
    wait: *mut ZeHandle,
) -> ZeResult;
type FnZeModuleCreate = unsafe extern "C" fn(
    context: ZeHandle,
    device: ZeHandle,
    desc: *const ZeModuleDesc,
    out: *mut ZeHandle,
    build_log: *mut ZeHandle,
) -> ZeResult;
type FnZeKernelCreate =
    unsafe extern "C" fn(module: ZeHandle, desc: *const ZeKernelDesc, out: *mut ZeHandle) -> ZeResult;
type FnZeKernelSetGroupSize = unsafe extern "C" fn(kernel: ZeHandle, x: u32, y: u32, z: u32) -> ZeResult;
type FnZeKernelSuggestGroupSize = unsafe extern "C" fn(
    kernel: ZeHandle,
    global_x: u32,
    global_y: u32,
    global_z: u32,
    x: *mut u32,
    y: *mut u32,
    z: *mut u32,
) -> ZeResult;
type FnZeKernelSuggestMaxCooperativeGroupCount =
    unsafe extern "C" fn(kernel: ZeHandle, count: *mut u32) -> ZeResult;
type FnZeKernelSetArgumentValue =
    unsafe extern "C" fn(kernel: ZeHandle, index: u32, size: usize, value: *const c_void) -> ZeResult;
type FnZeMemAllocShared = unsafe extern "C" fn(
    context: ZeHandle,
    device_desc: *const ZeDeviceMemAllocDesc,
    host_desc: *const ZeHostMemAllocDesc,
    size: usize,
    alignment: usize,
    device: ZeHandle,
    out: *mut *mut c_void,
) -> ZeResult;
type FnZeMemFree = unsafe extern "C" fn(context: ZeHandle, ptr: *mut c_void) -> ZeResult;

/// Maps a non-success `ze_result_t` onto [`DriverError`].
pub fn map_result(code: u32) -> DriverError {
    match code {
        0x1 => DriverError::NotReady,
        0x7000_0001 => DriverError::DeviceLost("reported by driver".into()),
        0x7000_0002 => DriverError::OutOfHostMemory,
        0x7000_0003 => DriverError::OutOfDeviceMemory,
        0x7000_0004 => DriverError::ModuleBuildFailure("reported by driver".into()),
        0x7800_0001 => DriverError::Uninitialized,
        0x7800_0003 => DriverError::UnsupportedFeature("reported by driver".into()),
        0x7800_0004 => DriverError::InvalidArgument("reported by driver".into()),
        0x7800_0005 => DriverError::InvalidNullHandle,
        0x7800_0006 => DriverError::HandleObjectInUse,
        0x7800_0009 => DriverError::UnsupportedSize("reported by driver".into()),
        0x7800_000c => DriverError::InvalidEnumeration("reported by driver".into()),
        0x7800_0011 => DriverError::InvalidKernelName(String::new()),
        0x7800_0013 => DriverError::InvalidGroupSizeDimension,
        other => DriverError::Unknown(other),
    }
}

fn check(code: ZeResult) -> Result<(), DriverError> {
    if code == ZE_RESULT_SUCCESS {
        Ok(())
    } else {
        Err(map_result(code))
    }
}

fn raw(handle: u64) -> ZeHandle {
    handle as usize as ZeHandle
}

fn wrap(handle: ZeHandle) -> u64 {
    handle as usize as u64
}

fn mode_code(mode: QueueMode) -> u32 {
    match mode {
        QueueMode::Default => 0,
        QueueMode::Synchronous => 1,
        QueueMode::Asynchronous => 2,
    }
}

fn priority_code(priority: QueuePriority) -> u32 {
    match priority {
        QueuePriority::Normal => 0,
        QueuePriority::Low => 1,
        QueuePriority::High => 2,
    }
}

fn queue_desc(desc: &QueueDesc) -> ZeCommandQueueDesc {
    ZeCommandQueueDesc {
        stype: STYPE_COMMAND_QUEUE_DESC,
        p_next: ptr::null(),
        ordinal: desc.ordinal,
        index: desc.index,
        flags: desc.flags.bits(),
        mode: mode_code(desc.mode),
        priority: priority_code(desc.priority),
    }
}

/// Runs the two-call count/fill enumeration pattern.
fn enumerate<T>(
    mut fill: impl FnMut(*mut u32, *mut T) -> ZeResult,
    blank: impl Fn() -> T,
) -> Result<Vec<T>, DriverError> {
    let mut count = 0u32;
    check(fill(&mut count, ptr::null_mut()))?;
    let mut items: Vec<T> = (0..count).map(|_| blank()).collect();
    check(fill(&mut count, items.as_mut_ptr()))?;
    items.truncate(count as usize);
    Ok(items)
}

/// The Level Zero loader with every entry point the suite uses resolved.
pub struct LevelZeroDriver {
    _lib: Library,
    ze_init: FnZeInit,
    ze_driver_get: FnZeDriverGet,
    ze_device_get: FnZeDeviceGet,
    ze_device_get_command_queue_group_properties: FnZeDeviceGetCommandQueueGroupProperties,
    ze_context_create: FnZeContextCreate,
    ze_context_destroy: FnZeDestroy,
    ze_command_queue_create: FnZeCommandQueueCreate,
    ze_command_queue_destroy: FnZeDestroy,
    ze_command_queue_execute_command_lists: FnZeCommandQueueExecuteCommandLists,
    ze_command_queue_synchronize: FnZeSynchronize,
    ze_command_list_create: FnZeCommandListCreate,
    ze_command_list_create_immediate: FnZeCommandQueueCreate,
    ze_command_list_destroy: FnZeDestroy,
    ze_command_list_close: FnZeDestroy,
    ze_command_list_reset: FnZeDestroy,
    ze_command_list_host_synchronize: Option<FnZeSynchronize>,
    ze_command_list_append_launch_kernel: FnZeCommandListAppendLaunchKernel,
    ze_command_list_append_launch_cooperative_kernel: FnZeCommandListAppendLaunchKernel,
    ze_command_list_append_barrier: FnZeCommandListAppendBarrier,
    ze_command_list_append_memory_copy: FnZeCommandListAppendMemoryCopy,
    ze_command_list_append_memory_fill: FnZeCommandListAppendMemoryFill,
    ze_module_create: FnZeModuleCreate,
    ze_module_destroy: FnZeDestroy,
    ze_kernel_create: FnZeKernelCreate,
    ze_kernel_destroy: FnZeDestroy,
    ze_kernel_set_group_size: FnZeKernelSetGroupSize,
    ze_kernel_suggest_group_size: FnZeKernelSuggestGroupSize,
    ze_kernel_suggest_max_cooperative_group_count: FnZeKernelSuggestMaxCooperativeGroupCount,
    ze_kernel_set_argument_value: FnZeKernelSetArgumentValue,
    ze_mem_alloc_shared: FnZeMemAllocShared,
    ze_mem_free: FnZeMemFree,
    /// Sizes of live shared allocations, for bounds-checked host access.
    allocations: Mutex<HashMap<u64, usize>>,
}

impl LevelZeroDriver {
    /// Loads the system loader from the default library names.
    pub fn load() -> Result<Self, DriverError> {
        let mut last_error = String::from("no loader names tried");
        for name in LOADER_NAMES {
            match unsafe { Library::new(name) } {
                Ok(lib) => {
                    info!("Loaded Level Zero loader from {}", name);
                    return Self::from_library(lib);
                }
                Err(e) => {
                    debug!("Failed to load {}: {}", name, e);
                    last_error = format!("{}: {}", name, e);
                }
            }
        }
        Err(DriverError::LoaderUnavailable(last_error))
    }

    /// Loads a loader library from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self, DriverError> {
        let lib = unsafe { Library::new(path) }
            .map_err(|e| DriverError::LoaderUnavailable(format!("{}: {}", path.display(), e)))?;
        info!("Loaded Level Zero loader from {}", path.display());
        Self::from_library(lib)
    }

    fn from_library(lib: Library) -> Result<Self, DriverError> {
        // SAFETY: each symbol is cast to the signature declared by the
        // Level Zero headers, and `lib` is kept alive in the struct.
        unsafe {
            Ok(Self {
                ze_init: Self::load_fn(&lib, "zeInit")?,
                ze_driver_get: Self::load_fn(&lib, "zeDriverGet")?,
                ze_device_get: Self::load_fn(&lib, "zeDeviceGet")?,
                ze_device_get_command_queue_group_properties: Self::load_fn(
                    &lib,
                    "zeDeviceGetCommandQueueGroupProperties",
                )?,
                ze_context_create: Self::load_fn(&lib, "zeContextCreate")?,
                ze_context_destroy: Self::load_fn(&lib, "zeContextDestroy")?,
                ze_command_queue_create: Self::load_fn(&lib, "zeCommandQueueCreate")?,
                ze_command_queue_destroy: Self::load_fn(&lib, "zeCommandQueueDestroy")?,
                ze_command_queue_execute_command_lists: Self::load_fn(
                    &lib,
                    "zeCommandQueueExecuteCommandLists",
                )?,
                ze_command_queue_synchronize: Self::load_fn(&lib, "zeCommandQueueSynchronize")?,
                ze_command_list_create: Self::load_fn(&lib, "zeCommandListCreate")?,
                ze_command_list_create_immediate: Self::load_fn(
                    &lib,
                    "zeCommandListCreateImmediate",
                )?,
                ze_command_list_destroy: Self::load_fn(&lib, "zeCommandListDestroy")?,
                ze_command_list_close: Self::load_fn(&lib, "zeCommandListClose")?,
                ze_command_list_reset: Self::load_fn(&lib, "zeCommandListReset")?,
                ze_command_list_host_synchronize: Self::load_fn_opt(
                    &lib,
                    "zeCommandListHostSynchronize",
                ),
                ze_command_list_append_launch_kernel: Self::load_fn(
                    &lib,
                    "zeCommandListAppendLaunchKernel",
                )?,
                ze_command_list_append_launch_cooperative_kernel: Self::load_fn(
                    &lib,
                    "zeCommandListAppendLaunchCooperativeKernel",
                )?,
                ze_command_list_append_barrier: Self::load_fn(&lib, "zeCommandListAppendBarrier")?,
                ze_command_list_append_memory_copy: Self::load_fn(
                    &lib,
                    "zeCommandListAppendMemoryCopy",
                )?,
                ze_command_list_append_memory_fill: Self::load_fn(
                    &lib,
                    "zeCommandListAppendMemoryFill",
                )?,
                ze_module_create: Self::load_fn(&lib, "zeModuleCreate")?,
                ze_module_destroy: Self::load_fn(&lib, "zeModuleDestroy")?,
                ze_kernel_create: Self::load_fn(&lib, "zeKernelCreate")?,
                ze_kernel_destroy: Self::load_fn(&lib, "zeKernelDestroy")?,
                ze_kernel_set_group_size: Self::load_fn(&lib, "zeKernelSetGroupSize")?,
                ze_kernel_suggest_group_size: Self::load_fn(&lib, "zeKernelSuggestGroupSize")?,
                ze_kernel_suggest_max_cooperative_group_count: Self::load_fn(
                    &lib,
                    "zeKernelSuggestMaxCooperativeGroupCount",
                )?,
                ze_kernel_set_argument_value: Self::load_fn(&lib, "zeKernelSetArgumentValue")?,
                ze_mem_alloc_shared: Self::load_fn(&lib, "zeMemAllocShared")?,
                ze_mem_free: Self::load_fn(&lib, "zeMemFree")?,
                allocations: Mutex::new(HashMap::new()),
                _lib: lib,
            })
        }
    }

    unsafe fn load_fn<F: Copy>(lib: &Library, name: &str) -> Result<F, DriverError> {
        let sym: Symbol<F> = lib
            .get(name.as_bytes())
            .map_err(|e| DriverError::LoaderUnavailable(format!("missing {}: {}", name, e)))?;
        Ok(*sym)
    }

    unsafe fn load_fn_opt<F: Copy>(lib: &Library, name: &str) -> Option<F> {
        lib.get(name.as_bytes()).ok().map(|s: Symbol<F>| *s)
    }

    fn allocation_len(&self, ptr: DevicePtr) -> Result<usize, DriverError> {
        self.allocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&ptr.addr())
            .copied()
            .ok_or_else(|| {
                DriverError::InvalidArgument(format!("{:#x} is not a live allocation", ptr.addr()))
            })
    }

    fn host_range(&self, ptr: DevicePtr, offset: usize, len: usize) -> Result<*mut u8, DriverError> {
        let size = self.allocation_len(ptr)?;
        match offset.checked_add(len) {
            Some(end) if end <= size => Ok((ptr.addr() as usize + offset) as *mut u8),
            _ => Err(DriverError::InvalidArgument(format!(
                "range {}+{} outside allocation of {} bytes",
                offset, len, size
            ))),
        }
    }
}

impl Driver for LevelZeroDriver {
    fn name(&self) -> &str {
        "level-zero"
    }

    fn init(&self, flags: InitFlags) -> Result<(), DriverError> {
        check(unsafe { (self.ze_init)(flags.0) })
    }

    fn driver_handles(&self) -> Result<Vec<DriverHandle>, DriverError> {
        let handles = enumerate(
            |count, out| unsafe { (self.ze_driver_get)(count, out) },
            ptr::null_mut,
        )?;
        Ok(handles.into_iter().map(|h| DriverHandle(wrap(h))).collect())
    }

    fn devices(&self, driver: DriverHandle) -> Result<Vec<DeviceHandle>, DriverError> {
        let handles = enumerate(
            |count, out| unsafe { (self.ze_device_get)(raw(driver.0), count, out) },
            ptr::null_mut,
        )?;
        Ok(handles.into_iter().map(|h| DeviceHandle(wrap(h))).collect())
    }

    fn command_queue_group_properties(
        &self,
        device: DeviceHandle,
    ) -> Result<Vec<QueueGroupProperties>, DriverError> {
        let props = enumerate(
            |count, out| unsafe {
                (self.ze_device_get_command_queue_group_properties)(raw(device.0), count, out)
            },
            || ZeCommandQueueGroupProperties {
                stype: STYPE_COMMAND_QUEUE_GROUP_PROPERTIES,
                p_next: ptr::null_mut(),
                flags: 0,
                max_memory_fill_pattern_size: 0,
                num_queues: 0,
            },
        )?;
        Ok(props
            .iter()
            .map(|p| QueueGroupProperties {
                flags: QueueGroupFlags::from_bits_retain(p.flags),
                max_memory_fill_pattern_size: p.max_memory_fill_pattern_size,
                num_queues: p.num_queues,
            })
            .collect())
    }

    fn create_context(&self, driver: DriverHandle) -> Result<ContextHandle, DriverError> {
        let desc = ZeContextDesc {
            stype: STYPE_CONTEXT_DESC,
            p_next: ptr::null(),
            flags: 0,
        };
        let mut out = ptr::null_mut();
        check(unsafe { (self.ze_context_create)(raw(driver.0), &desc, &mut out) })?;
        Ok(ContextHandle(wrap(out)))
    }

    fn destroy_context(&self, context: ContextHandle) -> Result<(), DriverError> {
        check(unsafe { (self.ze_context_destroy)(raw(context.0)) })
    }

    fn create_command_queue(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        desc: &QueueDesc,
    ) -> Result<QueueHandle, DriverError> {
        let desc = queue_desc(desc);
        let mut out = ptr::null_mut();
        check(unsafe {
            (self.ze_command_queue_create)(raw(context.0), raw(device.0), &desc, &mut out)
        })?;
        Ok(QueueHandle(wrap(out)))
    }

    fn destroy_command_queue(&self, queue: QueueHandle) -> Result<(), DriverError> {
        check(unsafe { (self.ze_command_queue_destroy)(raw(queue.0)) })
    }

    fn create_command_list(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        ordinal: u32,
    ) -> Result<ListHandle, DriverError> {
        let desc = ZeCommandListDesc {
            stype: STYPE_COMMAND_LIST_DESC,
            p_next: ptr::null(),
            command_queue_group_ordinal: ordinal,
            flags: 0,
        };
        let mut out = ptr::null_mut();
        check(unsafe {
            (self.ze_command_list_create)(raw(context.0), raw(device.0), &desc, &mut out)
        })?;
        Ok(ListHandle(wrap(out)))
    }

    fn create_immediate_command_list(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        desc: &QueueDesc,
    ) -> Result<ListHandle, DriverError> {
        let desc = queue_desc(desc);
        let mut out = ptr::null_mut();
        check(unsafe {
            (self.ze_command_list_create_immediate)(raw(context.0), raw(device.0), &desc, &mut out)
        })?;
        Ok(ListHandle(wrap(out)))
    }

    fn destroy_command_list(&self, list: ListHandle) -> Result<(), DriverError> {
        check(unsafe { (self.ze_command_list_destroy)(raw(list.0)) })
    }

    fn close_command_list(&self, list: ListHandle) -> Result<(), DriverError> {
        check(unsafe { (self.ze_command_list_close)(raw(list.0)) })
    }

    fn reset_command_list(&self, list: ListHandle) -> Result<(), DriverError> {
        check(unsafe { (self.ze_command_list_reset)(raw(list.0)) })
    }

    fn append(&self, list: ListHandle, command: &Command) -> Result<(), DriverError> {
        let list = raw(list.0);
        let none = ptr::null_mut();
        let code = match command {
            Command::LaunchKernel { kernel, groups } => {
                let groups = ZeGroupCount {
                    x: groups.x,
                    y: groups.y,
                    z: groups.z,
                };
                unsafe {
                    (self.ze_command_list_append_launch_kernel)(
                        list,
                        raw(kernel.0),
                        &groups,
                        none,
                        0,
                        ptr::null_mut(),
                    )
                }
            }
            Command::LaunchCooperativeKernel { kernel, groups } => {
                let groups = ZeGroupCount {
                    x: groups.x,
                    y: groups.y,
                    z: groups.z,
                };
                unsafe {
                    (self.ze_command_list_append_launch_cooperative_kernel)(
                        list,
                        raw(kernel.0),
                        &groups,
                        none,
                        0,
                        ptr::null_mut(),
                    )
                }
            }
            Command::Barrier => unsafe {
                (self.ze_command_list_append_barrier)(list, none, 0, ptr::null_mut())
            },
            Command::MemoryCopy { dst, src, size } => unsafe {
                (self.ze_command_list_append_memory_copy)(
                    list,
                    raw(dst.addr()),
                    raw(src.addr()),
                    *size,
                    none,
                    0,
                    ptr::null_mut(),
                )
            },
            Command::MemoryFill { dst, pattern, size } => unsafe {
                (self.ze_command_list_append_memory_fill)(
                    list,
                    raw(dst.addr()),
                    pattern.as_ptr().cast(),
                    pattern.len(),
                    *size,
                    none,
                    0,
                    ptr::null_mut(),
                )
            },
        };
        check(code)
    }

    fn execute_command_lists(
        &self,
        queue: QueueHandle,
        lists: &[ListHandle],
    ) -> Result<(), DriverError> {
        let mut raw_lists: Vec<ZeHandle> = lists.iter().map(|l| raw(l.0)).collect();
        check(unsafe {
            (self.ze_command_queue_execute_command_lists)(
                raw(queue.0),
                raw_lists.len() as u32,
                raw_lists.as_mut_ptr(),
                ptr::null_mut(),
            )
        })
    }

    fn synchronize_queue(&self, queue: QueueHandle, timeout: Timeout) -> Result<(), DriverError> {
        check(unsafe { (self.ze_command_queue_synchronize)(raw(queue.0), timeout.as_nanos()) })
    }

    fn synchronize_list_host(&self, list: ListHandle, timeout: Timeout) -> Result<(), DriverError> {
        let sync = self.ze_command_list_host_synchronize.ok_or_else(|| {
            DriverError::UnsupportedFeature("zeCommandListHostSynchronize is not exported".into())
        })?;
        check(unsafe { sync(raw(list.0), timeout.as_nanos()) })
    }

    fn create_module(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        source: &ModuleSource,
    ) -> Result<ModuleHandle, DriverError> {
        let build_flags = CString::new(source.build_flags.as_str())
            .map_err(|_| DriverError::InvalidArgument("build flags contain NUL".into()))?;
        let desc = ZeModuleDesc {
            stype: STYPE_MODULE_DESC,
            p_next: ptr::null(),
            format: match source.format {
                ModuleFormat::IlSpirv => 0,
                ModuleFormat::Native => 1,
            },
            input_size: source.image.len(),
            p_input_module: source.image.as_ptr(),
            p_build_flags: build_flags.as_ptr(),
            p_constants: ptr::null(),
        };
        let mut out = ptr::null_mut();
        check(unsafe {
            (self.ze_module_create)(raw(context.0), raw(device.0), &desc, &mut out, ptr::null_mut())
        })
        .map_err(|e| match e {
            DriverError::ModuleBuildFailure(_) => DriverError::ModuleBuildFailure(source.name.clone()),
            other => other,
        })?;
        Ok(ModuleHandle(wrap(out)))
    }

    fn destroy_module(&self, module: ModuleHandle) -> Result<(), DriverError> {
        check(unsafe { (self.ze_module_destroy)(raw(module.0)) })
    }

    fn create_kernel(&self, module: ModuleHandle, name: &str) -> Result<KernelHandle, DriverError> {
        let c_name = CString::new(name)
            .map_err(|_| DriverError::InvalidKernelName(name.to_string()))?;
        let desc = ZeKernelDesc {
            stype: STYPE_KERNEL_DESC,
            p_next: ptr::null(),
            flags: 0,
            p_kernel_name: c_name.as_ptr(),
        };
        let mut out = ptr::null_mut();
        check(unsafe { (self.ze_kernel_create)(raw(module.0), &desc, &mut out) }).map_err(
            |e| match e {
                DriverError::InvalidKernelName(_) => DriverError::InvalidKernelName(name.to_string()),
                other => other,
            },
        )?;
        Ok(KernelHandle(wrap(out)))
    }

    fn destroy_kernel(&self, kernel: KernelHandle) -> Result<(), DriverError> {
        check(unsafe { (self.ze_kernel_destroy)(raw(kernel.0)) })
    }

    fn set_group_size(&self, kernel: KernelHandle, size: GroupSize) -> Result<(), DriverError> {
        check(unsafe { (self.ze_kernel_set_group_size)(raw(kernel.0), size.x, size.y, size.z) })
    }

    fn suggest_group_size(
        &self,
        kernel: KernelHandle,
        global: [u32; 3],
    ) -> Result<GroupSize, DriverError> {
        let (mut x, mut y, mut z) = (0u32, 0u32, 0u32);
        check(unsafe {
            (self.ze_kernel_suggest_group_size)(
                raw(kernel.0),
                global[0],
                global[1],
                global[2],
                &mut x,
                &mut y,
                &mut z,
            )
        })?;
        Ok(GroupSize::new(x, y, z))
    }

    fn suggest_max_cooperative_group_count(&self, kernel: KernelHandle) -> Result<u32, DriverError> {
        let mut count = 0u32;
        check(unsafe {
            (self.ze_kernel_suggest_max_cooperative_group_count)(raw(kernel.0), &mut count)
        })?;
        Ok(count)
    }

    fn set_argument_value(
        &self,
        kernel: KernelHandle,
        index: u32,
        value: &[u8],
    ) -> Result<(), DriverError> {
        let code = unsafe {
            (self.ze_kernel_set_argument_value)(
                raw(kernel.0),
                index,
                value.len(),
                value.as_ptr().cast(),
            )
        };
        match code {
            0x7800_0015 => Err(DriverError::InvalidKernelArgumentIndex(index)),
            0x7800_0016 => Err(DriverError::InvalidKernelArgumentSize {
                index,
                expected: 0,
                actual: value.len(),
            }),
            code => check(code),
        }
    }

    fn allocate_shared(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        size: usize,
        alignment: usize,
    ) -> Result<DevicePtr, DriverError> {
        let device_desc = ZeDeviceMemAllocDesc {
            stype: STYPE_DEVICE_MEM_ALLOC_DESC,
            p_next: ptr::null(),
            flags: 0,
            ordinal: 0,
        };
        let host_desc = ZeHostMemAllocDesc {
            stype: STYPE_HOST_MEM_ALLOC_DESC,
            p_next: ptr::null(),
            flags: 0,
        };
        let mut out = ptr::null_mut();
        check(unsafe {
            (self.ze_mem_alloc_shared)(
                raw(context.0),
                &device_desc,
                &host_desc,
                size,
                alignment,
                raw(device.0),
                &mut out,
            )
        })?;
        let ptr = DevicePtr(wrap(out));
        self.allocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(ptr.addr(), size);
        Ok(ptr)
    }

    fn free(&self, context: ContextHandle, ptr: DevicePtr) -> Result<(), DriverError> {
        check(unsafe { (self.ze_mem_free)(raw(context.0), raw(ptr.addr())) })?;
        self.allocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&ptr.addr());
        Ok(())
    }

    fn read_shared(
        &self,
        _context: ContextHandle,
        ptr: DevicePtr,
        offset: usize,
        out: &mut [u8],
    ) -> Result<(), DriverError> {
        let src = self.host_range(ptr, offset, out.len())?;
        // SAFETY: shared allocations are host-accessible and the range was
        // checked against the recorded allocation size.
        unsafe { ptr::copy_nonoverlapping(src, out.as_mut_ptr(), out.len()) };
        Ok(())
    }

    fn write_shared(
        &self,
        _context: ContextHandle,
        ptr: DevicePtr,
        offset: usize,
        data: &[u8],
    ) -> Result<(), DriverError> {
        let dst = self.host_range(ptr, offset, data.len())?;
        // SAFETY: as in `read_shared`.
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_loader() {
        let result = LevelZeroDriver::load_from(Path::new("/nonexistent/libze_loader.so"));
        assert!(matches!(result, Err(DriverError::LoaderUnavailable(_))));
    }

    #[test]
    fn test_result_mapping() {
        assert_eq!(map_result(0x1), DriverError::NotReady);
        assert_eq!(map_result(0x7800_0013), DriverError::InvalidGroupSizeDimension);
        assert_eq!(map_result(0x7800_0001), DriverError::Uninitialized);
        assert!(matches!(map_result(0x7800_000c), DriverError::InvalidEnumeration(_)));
        assert_eq!(map_result(0x7fff_fffe), DriverError::Unknown(0x7fff_fffe));
    }

    #[test]
    fn test_queue_desc_codes() {
        let desc = queue_desc(&QueueDesc {
            ordinal: 2,
            index: 1,
            mode: QueueMode::Synchronous,
            priority: QueuePriority::High,
            ..QueueDesc::default()
        });
        assert_eq!(desc.stype, STYPE_COMMAND_QUEUE_DESC);
        assert_eq!((desc.ordinal, desc.index, desc.mode, desc.priority), (2, 1, 1, 2));
    }
}
