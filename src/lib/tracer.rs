//! # API Tracing Layer
//!
//! [`TracingDriver`] wraps any [`Driver`] and reports every entry point to
//! registered tracers. A tracer carries optional prologue and epilogue
//! callbacks; closures capture whatever user data they need. Tracers start
//! disabled and can only be destroyed while disabled.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::trace;

use crate::driver::{
    Command, ContextHandle, DeviceHandle, DevicePtr, Driver, DriverError, DriverHandle,
    GroupSize, InitFlags, KernelHandle, ListHandle, ModuleHandle, ModuleSource, QueueDesc,
    QueueGroupProperties, QueueHandle, Timeout,
};

/// One intercepted driver call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiCall {
    /// Driver entry point, e.g. `zeCommandListAppendLaunchKernel`.
    pub name: &'static str,
    /// Per-driver call sequence number.
    pub seq: u64,
}

pub type Prologue = Arc<dyn Fn(&ApiCall) + Send + Sync>;
pub type Epilogue = Arc<dyn Fn(&ApiCall, Option<&DriverError>) + Send + Sync>;

/// Callbacks of a tracer.
#[derive(Default, Clone)]
pub struct TracerDesc {
    pub prologue: Option<Prologue>,
    pub epilogue: Option<Epilogue>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TracerHandle(u64);

struct Tracer {
    desc: TracerDesc,
    enabled: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A driver decorator that reports calls to enabled tracers.
pub struct TracingDriver<D: Driver + ?Sized> {
    inner: Arc<D>,
    tracers: Mutex<HashMap<u64, Tracer>>,
    next_tracer: AtomicU64,
    seq: AtomicU64,
}

impl<D: Driver + ?Sized> TracingDriver<D> {
    pub fn new(inner: Arc<D>) -> Self {
        Self {
            inner,
            tracers: Mutex::new(HashMap::new()),
            next_tracer: AtomicU64::new(1),
            seq: AtomicU64::new(0),
        }
    }

    pub fn inner(&self) -> &Arc<D> {
        &self.inner
    }

    pub fn create_tracer(&self, desc: TracerDesc) -> TracerHandle {
        let id = self.next_tracer.fetch_add(1, Ordering::Relaxed);
        lock(&self.tracers).insert(
            id,
            Tracer {
                desc,
                enabled: false,
            },
        );
        TracerHandle(id)
    }

    pub fn enable_tracer(&self, tracer: TracerHandle) -> Result<(), DriverError> {
        self.set_enabled(tracer, true)
    }

    pub fn disable_tracer(&self, tracer: TracerHandle) -> Result<(), DriverError> {
        self.set_enabled(tracer, false)
    }

    pub fn destroy_tracer(&self, tracer: TracerHandle) -> Result<(), DriverError> {
        let mut tracers = lock(&self.tracers);
        match tracers.get(&tracer.0) {
            None => Err(DriverError::InvalidNullHandle),
            Some(t) if t.enabled => Err(DriverError::HandleObjectInUse),
            Some(_) => {
                tracers.remove(&tracer.0);
                Ok(())
            }
        }
    }

    fn set_enabled(&self, tracer: TracerHandle, enabled: bool) -> Result<(), DriverError> {
        let mut tracers = lock(&self.tracers);
        let t = tracers
            .get_mut(&tracer.0)
            .ok_or(DriverError::InvalidNullHandle)?;
        t.enabled = enabled;
        Ok(())
    }

    fn call<T>(
        &self,
        name: &'static str,
        f: impl FnOnce(&D) -> Result<T, DriverError>,
    ) -> Result<T, DriverError> {
        let call = ApiCall {
            name,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        };
        // Callbacks run without the registry lock so they may call back in.
        let active: Vec<TracerDesc> = lock(&self.tracers)
            .values()
            .filter(|t| t.enabled)
            .map(|t| t.desc.clone())
            .collect();

        for desc in &active {
            if let Some(prologue) = &desc.prologue {
                prologue(&call);
            }
        }
        trace!("[API] #{} {}", call.seq, name);

        let result = f(self.inner.as_ref());

        if let Err(e) = &result {
            trace!("[API] #{} {} -> {}", call.seq, name, e);
        }
        for desc in &active {
            if let Some(epilogue) = &desc.epilogue {
                epilogue(&call, result.as_ref().err());
            }
        }
        result
    }
}

/// A tracer that counts calls per entry point, and the shared counts.
pub fn call_counter() -> (TracerDesc, Arc<Mutex<BTreeMap<&'static str, u64>>>) {
    let counts = Arc::new(Mutex::new(BTreeMap::new()));
    let sink = counts.clone();
    let desc = TracerDesc {
        prologue: Some(Arc::new(move |call: &ApiCall| {
            *lock(&sink).entry(call.name).or_insert(0) += 1;
        })),
        epilogue: None,
    };
    (desc, counts)
}

impl<D: Driver + ?Sized> Driver for TracingDriver<D> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn init(&self, flags: InitFlags) -> Result<(), DriverError> {
        self.call("zeInit", |d| d.init(flags))
    }

    fn driver_handles(&self) -> Result<Vec<DriverHandle>, DriverError> {
        self.call("zeDriverGet", |d| d.driver_handles())
    }

    fn devices(&self, driver: DriverHandle) -> Result<Vec<DeviceHandle>, DriverError> {
        self.call("zeDeviceGet", |d| d.devices(driver))
    }

    fn command_queue_group_properties(
        &self,
        device: DeviceHandle,
    ) -> Result<Vec<QueueGroupProperties>, DriverError> {
        self.call("zeDeviceGetCommandQueueGroupProperties", |d| {
            d.command_queue_group_properties(device)
        })
    }

    fn create_context(&self, driver: DriverHandle) -> Result<ContextHandle, DriverError> {
        self.call("zeContextCreate", |d| d.create_context(driver))
    }

    fn destroy_context(&self, context: ContextHandle) -> Result<(), DriverError> {
        self.call("zeContextDestroy", |d| d.destroy_context(context))
    }

    fn create_command_queue(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        desc: &QueueDesc,
    ) -> Result<QueueHandle, DriverError> {
        self.call("zeCommandQueueCreate", |d| {
            d.create_command_queue(context, device, desc)
        })
    }

    fn destroy_command_queue(&self, queue: QueueHandle) -> Result<(), DriverError> {
        self.call("zeCommandQueueDestroy", |d| d.destroy_command_queue(queue))
    }

    fn create_command_list(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        ordinal: u32,
    ) -> Result<ListHandle, DriverError> {
        self.call("zeCommandListCreate", |d| {
            d.create_command_list(context, device, ordinal)
        })
    }

    fn create_immediate_command_list(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        desc: &QueueDesc,
    ) -> Result<ListHandle, DriverError> {
        self.call("zeCommandListCreateImmediate", |d| {
            d.create_immediate_command_list(context, device, desc)
        })
    }

    fn destroy_command_list(&self, list: ListHandle) -> Result<(), DriverError> {
        self.call("zeCommandListDestroy", |d| d.destroy_command_list(list))
    }

    fn close_command_list(&self, list: ListHandle) -> Result<(), DriverError> {
        self.call("zeCommandListClose", |d| d.close_command_list(list))
    }

    fn reset_command_list(&self, list: ListHandle) -> Result<(), DriverError> {
        self.call("zeCommandListReset", |d| d.reset_command_list(list))
    }

    fn append(&self, list: ListHandle, command: &Command) -> Result<(), DriverError> {
        self.call(command.entry_point(), |d| d.append(list, command))
    }

    fn execute_command_lists(
        &self,
        queue: QueueHandle,
        lists: &[ListHandle],
    ) -> Result<(), DriverError> {
        self.call("zeCommandQueueExecuteCommandLists", |d| {
            d.execute_command_lists(queue, lists)
        })
    }

    fn synchronize_queue(&self, queue: QueueHandle, timeout: Timeout) -> Result<(), DriverError> {
        self.call("zeCommandQueueSynchronize", |d| {
            d.synchronize_queue(queue, timeout)
        })
    }

    fn synchronize_list_host(&self, list: ListHandle, timeout: Timeout) -> Result<(), DriverError> {
        self.call("zeCommandListHostSynchronize", |d| {
            d.synchronize_list_host(list, timeout)
        })
    }

    fn create_module(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        source: &ModuleSource,
    ) -> Result<ModuleHandle, DriverError> {
        self.call("zeModuleCreate", |d| d.create_module(context, device, source))
    }

    fn destroy_module(&self, module: ModuleHandle) -> Result<(), DriverError> {
        self.call("zeModuleDestroy", |d| d.destroy_module(module))
    }

    fn create_kernel(&self, module: ModuleHandle, name: &str) -> Result<KernelHandle, DriverError> {
        self.call("zeKernelCreate", |d| d.create_kernel(module, name))
    }

    fn destroy_kernel(&self, kernel: KernelHandle) -> Result<(), DriverError> {
        self.call("zeKernelDestroy", |d| d.destroy_kernel(kernel))
    }

    fn set_group_size(&self, kernel: KernelHandle, size: GroupSize) -> Result<(), DriverError> {
        self.call("zeKernelSetGroupSize", |d| d.set_group_size(kernel, size))
    }

    fn suggest_group_size(
        &self,
        kernel: KernelHandle,
        global: [u32; 3],
    ) -> Result<GroupSize, DriverError> {
        self.call("zeKernelSuggestGroupSize", |d| {
            d.suggest_group_size(kernel, global)
        })
    }

    fn suggest_max_cooperative_group_count(&self, kernel: KernelHandle) -> Result<u32, DriverError> {
        self.call("zeKernelSuggestMaxCooperativeGroupCount", |d| {
            d.suggest_max_cooperative_group_count(kernel)
        })
    }

    fn set_argument_value(
        &self,
        kernel: KernelHandle,
        index: u32,
        value: &[u8],
    ) -> Result<(), DriverError> {
        self.call("zeKernelSetArgumentValue", |d| {
            d.set_argument_value(kernel, index, value)
        })
    }

    fn allocate_shared(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        size: usize,
        alignment: usize,
    ) -> Result<DevicePtr, DriverError> {
        self.call("zeMemAllocShared", |d| {
            d.allocate_shared(context, device, size, alignment)
        })
    }

    fn free(&self, context: ContextHandle, ptr: DevicePtr) -> Result<(), DriverError> {
        self.call("zeMemFree", |d| d.free(context, ptr))
    }

    fn read_shared(
        &self,
        context: ContextHandle,
        ptr: DevicePtr,
        offset: usize,
        out: &mut [u8],
    ) -> Result<(), DriverError> {
        self.call("hostRead", |d| d.read_shared(context, ptr, offset, out))
    }

    fn write_shared(
        &self,
        context: ContextHandle,
        ptr: DevicePtr,
        offset: usize,
        data: &[u8],
    ) -> Result<(), DriverError> {
        self.call("hostWrite", |d| d.write_shared(context, ptr, offset, data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::ReferenceDriver;
    use crate::runtime::Runtime;

    fn traced() -> Arc<TracingDriver<ReferenceDriver>> {
        Arc::new(TracingDriver::new(Arc::new(ReferenceDriver::default())))
    }

    #[test]
    fn test_disabled_tracer_sees_nothing() {
        let driver = traced();
        let (desc, counts) = call_counter();
        driver.create_tracer(desc);
        Runtime::init(driver.clone()).unwrap();
        assert!(lock(&counts).is_empty());
    }

    #[test]
    fn test_enabled_tracer_counts_calls() {
        let driver = traced();
        let (desc, counts) = call_counter();
        let tracer = driver.create_tracer(desc);
        driver.enable_tracer(tracer).unwrap();

        let runtime = Runtime::init(driver.clone()).unwrap();
        runtime.create_context().unwrap().destroy().unwrap();

        let counts = lock(&counts);
        assert_eq!(counts.get("zeInit"), Some(&1));
        assert_eq!(counts.get("zeDriverGet"), Some(&1));
        assert_eq!(counts.get("zeContextCreate"), Some(&1));
        assert_eq!(counts.get("zeContextDestroy"), Some(&1));
    }

    #[test]
    fn test_epilogue_sees_errors() {
        let driver = traced();
        let failures = Arc::new(Mutex::new(Vec::new()));
        let sink = failures.clone();
        let tracer = driver.create_tracer(TracerDesc {
            prologue: None,
            epilogue: Some(Arc::new(move |call: &ApiCall, err: Option<&DriverError>| {
                if let Some(e) = err {
                    lock(&sink).push((call.name, e.clone()));
                }
            })),
        });
        driver.enable_tracer(tracer).unwrap();

        // Not initialised yet.
        assert_eq!(driver.driver_handles(), Err(DriverError::Uninitialized));
        assert_eq!(
            *lock(&failures),
            vec![("zeDriverGet", DriverError::Uninitialized)]
        );
    }

    #[test]
    fn test_destroy_requires_disable() {
        let driver = traced();
        let tracer = driver.create_tracer(TracerDesc::default());
        driver.enable_tracer(tracer).unwrap();
        assert_eq!(driver.destroy_tracer(tracer), Err(DriverError::HandleObjectInUse));
        driver.disable_tracer(tracer).unwrap();
        driver.destroy_tracer(tracer).unwrap();
        assert_eq!(driver.enable_tracer(tracer), Err(DriverError::InvalidNullHandle));
    }
}
