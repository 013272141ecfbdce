//! # Process-Scoped Driver Runtime
//!
//! A [`Runtime`] is the proof that the driver's global init ran in this
//! process. Scenarios take it by reference instead of relying on ambient
//! global state, which lets unit tests drive them with the reference device.
//!
//! [`Context`] owns a driver context. Every child object (bundles, modules,
//! kernels, shared buffers) borrows it, so the borrow checker guarantees the
//! children are released before the context is destroyed.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::driver::{
    ContextHandle, DeviceHandle, Driver, DriverError, DriverHandle, InitFlags,
    QueueGroupProperties,
};

/// Initialised driver state for one process.
pub struct Runtime {
    driver: Arc<dyn Driver>,
    default_driver: DriverHandle,
}

impl Runtime {
    /// Runs the driver's global init and picks the default driver instance.
    pub fn init(driver: Arc<dyn Driver>) -> Result<Self, DriverError> {
        driver.init(InitFlags::default())?;
        let default_driver = driver
            .driver_handles()?
            .into_iter()
            .next()
            .ok_or_else(|| DriverError::UnsupportedFeature("no compute driver present".into()))?;

        info!(
            "Initialized {} driver (handle {:#x})",
            driver.name(),
            default_driver.raw()
        );

        Ok(Self {
            driver,
            default_driver,
        })
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn default_driver(&self) -> DriverHandle {
        self.default_driver
    }

    /// All devices of the default driver, in enumeration order.
    pub fn devices(&self) -> Result<Vec<DeviceHandle>, DriverError> {
        self.driver.devices(self.default_driver)
    }

    pub fn default_device(&self) -> Result<DeviceHandle, DriverError> {
        self.devices()?
            .into_iter()
            .next()
            .ok_or_else(|| DriverError::UnsupportedFeature("driver reports no devices".into()))
    }

    pub fn queue_group_properties(
        &self,
        device: DeviceHandle,
    ) -> Result<Vec<QueueGroupProperties>, DriverError> {
        self.driver.command_queue_group_properties(device)
    }

    pub fn create_context(&self) -> Result<Context, DriverError> {
        let handle = self.driver.create_context(self.default_driver)?;
        debug!("Created context {:#x}", handle.raw());
        Ok(Context {
            driver: self.driver.clone(),
            handle,
            destroyed: false,
        })
    }
}

/// A driver context. Destroying it invalidates every child object, which is
/// why children hold a borrow of it.
pub struct Context {
    driver: Arc<dyn Driver>,
    handle: ContextHandle,
    destroyed: bool,
}

impl Context {
    pub fn handle(&self) -> ContextHandle {
        self.handle
    }

    pub fn driver(&self) -> &dyn Driver {
        self.driver.as_ref()
    }

    /// Destroys the context and reports the driver result.
    pub fn destroy(mut self) -> Result<(), DriverError> {
        self.destroyed = true;
        debug!("Destroying context {:#x}", self.handle.raw());
        self.driver.destroy_context(self.handle)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if !self.destroyed {
            if let Err(e) = self.driver.destroy_context(self.handle) {
                warn!("Failed to destroy context {:#x}: {}", self.handle.raw(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::{DeviceModel, ReferenceDriver};

    #[test]
    fn test_runtime_enumerates_devices() {
        let driver = ReferenceDriver::new(vec![DeviceModel::default(), DeviceModel::default()]);
        let runtime = Runtime::init(Arc::new(driver)).unwrap();
        assert_eq!(runtime.devices().unwrap().len(), 2);
        let device = runtime.default_device().unwrap();
        assert!(!runtime.queue_group_properties(device).unwrap().is_empty());
    }

    #[test]
    fn test_runtime_without_devices() {
        let runtime = Runtime::init(Arc::new(ReferenceDriver::new(Vec::new()))).unwrap();
        assert!(matches!(
            runtime.default_device(),
            Err(DriverError::UnsupportedFeature(_))
        ));
    }

    #[test]
    fn test_context_destroy() {
        let runtime = Runtime::init(Arc::new(ReferenceDriver::default())).unwrap();
        let context = runtime.create_context().unwrap();
        context.destroy().unwrap();
    }
}
