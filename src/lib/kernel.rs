//! # Modules and Kernels
//!
//! Thin RAII wrappers over module and kernel handles. A [`Kernel`] remembers
//! the group size bound to it, so negotiation can refuse to query cooperative
//! limits before a group size exists. Arguments are bound by ordinal as
//! fixed-size byte payloads; pointer arguments are the 8-byte device address.

use std::path::{Path, PathBuf};

use bytemuck::Pod;
use tracing::{debug, warn};

use crate::driver::{
    DeviceHandle, DriverError, GroupSize, KernelHandle, ModuleFormat, ModuleHandle, ModuleSource,
};
use crate::error::ConformanceError;
use crate::memory::SharedBuffer;
use crate::runtime::Context;

/// Resolves module file names to images.
#[derive(Debug, Clone, Default)]
pub struct ModuleLocator {
    kernel_dir: Option<PathBuf>,
}

impl ModuleLocator {
    /// Reads images from `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            kernel_dir: Some(dir.into()),
        }
    }

    /// Builds sources by name only, for backends with built-in modules.
    pub fn builtin() -> Self {
        Self { kernel_dir: None }
    }

    pub fn kernel_dir(&self) -> Option<&Path> {
        self.kernel_dir.as_deref()
    }

    pub fn source(&self, name: &str) -> Result<ModuleSource, ConformanceError> {
        let image = match &self.kernel_dir {
            Some(dir) => {
                let path = dir.join(name);
                std::fs::read(&path).map_err(|source| ConformanceError::Module { path, source })?
            }
            None => Vec::new(),
        };

        Ok(ModuleSource {
            name: name.to_string(),
            format: ModuleFormat::IlSpirv,
            image,
            build_flags: String::new(),
        })
    }
}

/// A loaded module.
pub struct Module<'c> {
    context: &'c Context,
    handle: ModuleHandle,
    name: String,
}

impl<'c> Module<'c> {
    pub fn create(
        context: &'c Context,
        device: DeviceHandle,
        source: &ModuleSource,
    ) -> Result<Self, DriverError> {
        let handle = context
            .driver()
            .create_module(context.handle(), device, source)?;
        debug!("Loaded module {} ({:#x})", source.name, handle.raw());
        Ok(Self {
            context,
            handle,
            name: source.name.clone(),
        })
    }

    pub fn handle(&self) -> ModuleHandle {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolves the entry point `name`.
    pub fn kernel(&self, name: &str) -> Result<Kernel<'_>, DriverError> {
        let handle = self.context.driver().create_kernel(self.handle, name)?;
        Ok(Kernel {
            module: self,
            handle,
            name: name.to_string(),
            group_size: None,
        })
    }
}

impl Drop for Module<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.context.driver().destroy_module(self.handle) {
            warn!("Failed to destroy module {}: {}", self.name, e);
        }
    }
}

/// A kernel entry point with its locally tracked launch state.
pub struct Kernel<'m> {
    module: &'m Module<'m>,
    handle: KernelHandle,
    name: String,
    group_size: Option<GroupSize>,
}

impl<'m> Kernel<'m> {
    pub fn handle(&self) -> KernelHandle {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Group size bound with [`Kernel::set_group_size`], if any.
    pub fn group_size(&self) -> Option<GroupSize> {
        self.group_size
    }

    pub fn set_group_size(&mut self, size: GroupSize) -> Result<(), DriverError> {
        self.module
            .context
            .driver()
            .set_group_size(self.handle, size)?;
        self.group_size = Some(size);
        Ok(())
    }

    /// Asks the driver for a group size that divides the global extents.
    pub fn suggest_group_size(&self, global: [u32; 3]) -> Result<GroupSize, DriverError> {
        self.module
            .context
            .driver()
            .suggest_group_size(self.handle, global)
    }

    /// Raw driver query; prefer `negotiate::plan_cooperative_launch`, which
    /// also enforces the group-size-first ordering.
    pub fn suggest_max_cooperative_group_count(&self) -> Result<u32, DriverError> {
        self.module
            .context
            .driver()
            .suggest_max_cooperative_group_count(self.handle)
    }

    /// Binds a plain value to argument `index`.
    pub fn set_arg<T: Pod>(&self, index: u32, value: &T) -> Result<(), DriverError> {
        self.module
            .context
            .driver()
            .set_argument_value(self.handle, index, bytemuck::bytes_of(value))
    }

    /// Binds the device address of `buffer` to argument `index`.
    pub fn set_buffer_arg(&self, index: u32, buffer: &SharedBuffer<'_>) -> Result<(), DriverError> {
        self.set_arg(index, &buffer.ptr().addr())
    }
}

impl Drop for Kernel<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.module.context.driver().destroy_kernel(self.handle) {
            warn!("Failed to destroy kernel {}: {}", self.name, e);
        }
    }
}
