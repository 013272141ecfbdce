//! # Driver API Surface
//!
//! The compute driver is an external collaborator. Everything the conformance
//! checks need from it is expressed by the object-safe [`Driver`] trait, so the
//! command bundle, negotiation and harness logic can run against the real
//! Level Zero loader or against the in-process reference device.
//!
//! Handles are opaque `Copy` newtypes. They carry no lifetime; ownership and
//! teardown ordering are enforced one level up by the RAII wrappers in
//! `runtime`, `kernel`, `memory` and `bundle`.

use std::time::Duration;

use bitflags::bitflags;
use thiserror::Error;

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) u64);

        impl $name {
            /// Raw handle value.
            pub fn raw(self) -> u64 {
                self.0
            }
        }
    };
}

handle!(
    /// A driver instance discovered by `zeDriverGet`.
    DriverHandle
);
handle!(
    /// A physical or virtual compute device.
    DeviceHandle
);
handle!(
    /// An allocation and execution scope.
    ContextHandle
);
handle!(
    /// A command list, regular or immediate.
    ListHandle
);
handle!(
    /// A command queue.
    QueueHandle
);
handle!(
    /// A loaded kernel module.
    ModuleHandle
);
handle!(
    /// A kernel entry point inside a module.
    KernelHandle
);

/// Device-visible address of a shared allocation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePtr(pub(crate) u64);

impl DevicePtr {
    /// Address as it must be bound into a pointer kernel argument.
    pub fn addr(self) -> u64 {
        self.0
    }
}

bitflags! {
    /// Capabilities advertised by one command queue group.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct QueueGroupFlags: u32 {
        const COMPUTE = 1 << 0;
        const COPY = 1 << 1;
        const COOPERATIVE_KERNELS = 1 << 2;
        const METRICS = 1 << 3;
    }
}

bitflags! {
    /// Creation flags for queues and immediate lists.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct QueueFlags: u32 {
        const EXPLICIT_ONLY = 1 << 0;
        const IN_ORDER = 1 << 1;
    }
}

/// One entry of a device's command queue group list. The entry's index is the
/// ordinal used when creating queues and lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueGroupProperties {
    pub flags: QueueGroupFlags,
    pub max_memory_fill_pattern_size: usize,
    pub num_queues: u32,
}

/// Queue submission mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueMode {
    #[default]
    Default,
    Synchronous,
    Asynchronous,
}

/// Queue scheduling priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueuePriority {
    #[default]
    Normal,
    Low,
    High,
}

/// Descriptor used for both `zeCommandQueueCreate` and
/// `zeCommandListCreateImmediate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueDesc {
    pub ordinal: u32,
    pub index: u32,
    pub flags: QueueFlags,
    pub mode: QueueMode,
    pub priority: QueuePriority,
}

/// How long a host synchronize may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    Infinite,
    After(Duration),
}

impl Timeout {
    /// Nanosecond form used by the driver ABI, `u64::MAX` meaning forever.
    pub fn as_nanos(self) -> u64 {
        match self {
            Timeout::Infinite => u64::MAX,
            Timeout::After(d) => u64::try_from(d.as_nanos()).unwrap_or(u64::MAX - 1),
        }
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Timeout::After(d)
    }
}

impl std::fmt::Display for Timeout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Timeout::Infinite => write!(f, "infinite"),
            Timeout::After(d) => write!(f, "{:?}", d),
        }
    }
}

/// Work-group dimensions bound to a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct GroupSize {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl GroupSize {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// Work items per group.
    pub fn threads(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }
}

/// Number of work-groups launched along each dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct GroupCount {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl GroupCount {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// Total number of groups in the launch.
    pub fn total(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }
}

/// Input format of a module image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModuleFormat {
    #[default]
    IlSpirv,
    Native,
}

/// A module image to hand to `zeModuleCreate`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSource {
    /// File name the image was resolved from, e.g. `cooperative_kernel.spv`.
    pub name: String,
    pub format: ModuleFormat,
    pub image: Vec<u8>,
    pub build_flags: String,
}

/// A device operation recorded into a command list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    LaunchKernel { kernel: KernelHandle, groups: GroupCount },
    LaunchCooperativeKernel { kernel: KernelHandle, groups: GroupCount },
    Barrier,
    MemoryCopy { dst: DevicePtr, src: DevicePtr, size: usize },
    MemoryFill { dst: DevicePtr, pattern: Vec<u8>, size: usize },
}

impl Command {
    /// Driver entry point that records this command.
    pub fn entry_point(&self) -> &'static str {
        match self {
            Command::LaunchKernel { .. } => "zeCommandListAppendLaunchKernel",
            Command::LaunchCooperativeKernel { .. } => "zeCommandListAppendLaunchCooperativeKernel",
            Command::Barrier => "zeCommandListAppendBarrier",
            Command::MemoryCopy { .. } => "zeCommandListAppendMemoryCopy",
            Command::MemoryFill { .. } => "zeCommandListAppendMemoryFill",
        }
    }
}

/// Non-success results a driver entry point can return.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("driver is not initialized")]
    Uninitialized,
    #[error("not ready: synchronize timed out")]
    NotReady,
    #[error("device lost: {0}")]
    DeviceLost(String),
    #[error("out of host memory")]
    OutOfHostMemory,
    #[error("out of device memory")]
    OutOfDeviceMemory,
    #[error("module build failure: {0}")]
    ModuleBuildFailure(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid null handle")]
    InvalidNullHandle,
    #[error("invalid enumeration: {0}")]
    InvalidEnumeration(String),
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),
    #[error("unsupported size: {0}")]
    UnsupportedSize(String),
    #[error("invalid group size dimension")]
    InvalidGroupSizeDimension,
    #[error("invalid kernel argument index {0}")]
    InvalidKernelArgumentIndex(u32),
    #[error("invalid kernel argument size for index {index}: expected {expected}, got {actual}")]
    InvalidKernelArgumentSize {
        index: u32,
        expected: usize,
        actual: usize,
    },
    #[error("invalid kernel name '{0}'")]
    InvalidKernelName(String),
    #[error("handle object in use")]
    HandleObjectInUse,
    #[error("driver library unavailable: {0}")]
    LoaderUnavailable(String),
    #[error("driver returned result code {0:#x}")]
    Unknown(u32),
}

/// Flags for the driver's global init.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InitFlags(pub u32);

/// The driver surface consumed by the conformance checks.
///
/// Implementations must be usable from several threads; a single process owns
/// all handles it creates and never shares them across processes.
pub trait Driver: Send + Sync {
    /// Human-readable backend name for logs.
    fn name(&self) -> &str;

    fn init(&self, flags: InitFlags) -> Result<(), DriverError>;
    fn driver_handles(&self) -> Result<Vec<DriverHandle>, DriverError>;
    fn devices(&self, driver: DriverHandle) -> Result<Vec<DeviceHandle>, DriverError>;
    fn command_queue_group_properties(
        &self,
        device: DeviceHandle,
    ) -> Result<Vec<QueueGroupProperties>, DriverError>;

    fn create_context(&self, driver: DriverHandle) -> Result<ContextHandle, DriverError>;
    fn destroy_context(&self, context: ContextHandle) -> Result<(), DriverError>;

    fn create_command_queue(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        desc: &QueueDesc,
    ) -> Result<QueueHandle, DriverError>;
    fn destroy_command_queue(&self, queue: QueueHandle) -> Result<(), DriverError>;
    fn create_command_list(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        ordinal: u32,
    ) -> Result<ListHandle, DriverError>;
    fn create_immediate_command_list(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        desc: &QueueDesc,
    ) -> Result<ListHandle, DriverError>;
    fn destroy_command_list(&self, list: ListHandle) -> Result<(), DriverError>;
    fn close_command_list(&self, list: ListHandle) -> Result<(), DriverError>;
    fn reset_command_list(&self, list: ListHandle) -> Result<(), DriverError>;
    fn append(&self, list: ListHandle, command: &Command) -> Result<(), DriverError>;
    fn execute_command_lists(
        &self,
        queue: QueueHandle,
        lists: &[ListHandle],
    ) -> Result<(), DriverError>;
    fn synchronize_queue(&self, queue: QueueHandle, timeout: Timeout) -> Result<(), DriverError>;
    fn synchronize_list_host(&self, list: ListHandle, timeout: Timeout)
        -> Result<(), DriverError>;

    fn create_module(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        source: &ModuleSource,
    ) -> Result<ModuleHandle, DriverError>;
    fn destroy_module(&self, module: ModuleHandle) -> Result<(), DriverError>;
    fn create_kernel(&self, module: ModuleHandle, name: &str) -> Result<KernelHandle, DriverError>;
    fn destroy_kernel(&self, kernel: KernelHandle) -> Result<(), DriverError>;
    fn set_group_size(&self, kernel: KernelHandle, size: GroupSize) -> Result<(), DriverError>;
    fn suggest_group_size(
        &self,
        kernel: KernelHandle,
        global: [u32; 3],
    ) -> Result<GroupSize, DriverError>;
    fn suggest_max_cooperative_group_count(&self, kernel: KernelHandle)
        -> Result<u32, DriverError>;
    fn set_argument_value(
        &self,
        kernel: KernelHandle,
        index: u32,
        value: &[u8],
    ) -> Result<(), DriverError>;

    fn allocate_shared(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        size: usize,
        alignment: usize,
    ) -> Result<DevicePtr, DriverError>;
    fn free(&self, context: ContextHandle, ptr: DevicePtr) -> Result<(), DriverError>;
    fn read_shared(
        &self,
        context: ContextHandle,
        ptr: DevicePtr,
        offset: usize,
        out: &mut [u8],
    ) -> Result<(), DriverError>;
    fn write_shared(
        &self,
        context: ContextHandle,
        ptr: DevicePtr,
        offset: usize,
        data: &[u8],
    ) -> Result<(), DriverError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_nanos() {
        assert_eq!(Timeout::Infinite.as_nanos(), u64::MAX);
        assert_eq!(Timeout::from(Duration::from_millis(2)).as_nanos(), 2_000_000);
    }

    #[test]
    fn test_group_totals() {
        assert_eq!(GroupSize::new(4, 2, 1).threads(), 8);
        assert_eq!(GroupCount::new(32, 1, 1).total(), 32);
    }

    #[test]
    fn test_cooperative_flag_is_distinct() {
        let compute = QueueGroupFlags::COMPUTE | QueueGroupFlags::COPY;
        assert!(!compute.contains(QueueGroupFlags::COOPERATIVE_KERNELS));
        assert!((compute | QueueGroupFlags::COOPERATIVE_KERNELS)
            .contains(QueueGroupFlags::COOPERATIVE_KERNELS));
    }
}
