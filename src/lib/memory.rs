//! Shared (host- and device-visible) memory allocations.

use bytemuck::Pod;
use tracing::warn;

use crate::driver::{DeviceHandle, DevicePtr, DriverError};
use crate::runtime::Context;

/// A shared allocation owned by a [`Context`]. It borrows the context, so it
/// is always freed before the context is destroyed.
pub struct SharedBuffer<'c> {
    context: &'c Context,
    ptr: DevicePtr,
    len: usize,
    freed: bool,
}

impl<'c> SharedBuffer<'c> {
    /// Allocates `len` bytes visible to both host and `device`.
    pub fn allocate(
        context: &'c Context,
        device: DeviceHandle,
        len: usize,
        alignment: usize,
    ) -> Result<Self, DriverError> {
        let ptr = context
            .driver()
            .allocate_shared(context.handle(), device, len, alignment)?;
        Ok(Self {
            context,
            ptr,
            len,
            freed: false,
        })
    }

    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sets every byte to `value`.
    pub fn fill(&self, value: u8) -> Result<(), DriverError> {
        self.write_bytes(0, &vec![value; self.len])
    }

    /// Copies `values` to the start of the buffer.
    pub fn write<T: Pod>(&self, values: &[T]) -> Result<(), DriverError> {
        self.write_bytes(0, bytemuck::cast_slice(values))
    }

    /// Reads the first `count` elements of type `T`.
    pub fn read<T: Pod>(&self, count: usize) -> Result<Vec<T>, DriverError> {
        let mut out = vec![T::zeroed(); count];
        self.read_bytes(0, bytemuck::cast_slice_mut(&mut out))?;
        Ok(out)
    }

    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) -> Result<(), DriverError> {
        self.check_range(offset, out.len())?;
        self.context
            .driver()
            .read_shared(self.context.handle(), self.ptr, offset, out)
    }

    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<(), DriverError> {
        self.check_range(offset, data.len())?;
        self.context
            .driver()
            .write_shared(self.context.handle(), self.ptr, offset, data)
    }

    /// Frees the allocation and reports the driver result.
    pub fn free(mut self) -> Result<(), DriverError> {
        self.freed = true;
        self.context.driver().free(self.context.handle(), self.ptr)
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<(), DriverError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(DriverError::InvalidArgument(format!(
                "range {}+{} outside allocation of {} bytes",
                offset, len, self.len
            ))),
        }
    }
}

impl Drop for SharedBuffer<'_> {
    fn drop(&mut self) {
        if !self.freed {
            if let Err(e) = self.context.driver().free(self.context.handle(), self.ptr) {
                warn!("Failed to free shared allocation {:#x}: {}", self.ptr.addr(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::ReferenceDriver;
    use crate::runtime::Runtime;
    use std::sync::Arc;

    #[test]
    fn test_fill_and_read_back() {
        let runtime = Runtime::init(Arc::new(ReferenceDriver::default())).unwrap();
        let device = runtime.default_device().unwrap();
        let context = runtime.create_context().unwrap();

        let buffer = SharedBuffer::allocate(&context, device, 64, 8).unwrap();
        buffer.fill(0x01).unwrap();
        assert!(buffer.read::<u8>(64).unwrap().iter().all(|&b| b == 1));

        buffer.write(&[7u64, 9u64]).unwrap();
        assert_eq!(buffer.read::<u64>(2).unwrap(), vec![7, 9]);
        buffer.free().unwrap();
    }

    #[test]
    fn test_out_of_range_access_is_rejected() {
        let runtime = Runtime::init(Arc::new(ReferenceDriver::default())).unwrap();
        let device = runtime.default_device().unwrap();
        let context = runtime.create_context().unwrap();

        let buffer = SharedBuffer::allocate(&context, device, 16, 8).unwrap();
        assert!(matches!(
            buffer.read::<u64>(3),
            Err(DriverError::InvalidArgument(_))
        ));
    }
}
