//! Accelerator backend traits.

use crate::error::Result;
use std::sync::Arc;

/// Backend-specific storage behind a [`DeviceArray`].
#[derive(Debug)]
pub enum DeviceHandle {
    /// Memory owned by the simulated backend.
    Sim(Vec<f32>),
}

/// An `f32` array resident in accelerator memory.
///
/// Only the backend that allocated an array knows how to move data in and
/// out of it; everything else treats it as opaque.
#[derive(Debug)]
pub struct DeviceArray {
    handle: DeviceHandle,
    len: usize,
}

impl DeviceArray {
    /// Wrap a backend handle holding `len` elements.
    pub fn new(handle: DeviceHandle, len: usize) -> Self {
        Self { handle, len }
    }

    /// Number of `f32` elements.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the array holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.len * std::mem::size_of::<f32>()
    }

    /// Backend handle.
    pub fn handle(&self) -> &DeviceHandle {
        &self.handle
    }

    /// Mutable backend handle.
    pub fn handle_mut(&mut self) -> &mut DeviceHandle {
        &mut self.handle
    }

    /// Simulated device memory, the stand-in for a kernel's view of it.
    pub fn sim_data(&self) -> &[f32] {
        match &self.handle {
            DeviceHandle::Sim(data) => data,
        }
    }

    /// Mutable simulated device memory.
    pub fn sim_data_mut(&mut self) -> &mut [f32] {
        match &mut self.handle {
            DeviceHandle::Sim(data) => data,
        }
    }
}

/// A command queue bound to one device.
///
/// All transfers are synchronous for the caller: when a call returns, the
/// destination holds the data.
pub trait Queue: Send + Sync {
    /// Index of the device this queue submits to.
    fn device(&self) -> usize;

    /// Copy host memory into a device array.
    fn write(&self, src: &[f32], dst: &mut DeviceArray) -> Result<()>;

    /// Copy a device array into host memory.
    fn read(&self, src: &DeviceArray, dst: &mut [f32]) -> Result<()>;

    /// Copy between two device arrays.
    fn copy(&self, src: &DeviceArray, dst: &mut DeviceArray) -> Result<()>;

    /// Block until all submitted work has completed.
    fn finish(&self) -> Result<()> {
        Ok(())
    }
}

/// Shared handle to a command queue.
pub type CommandQueue = Arc<dyn Queue>;

/// An accelerator backend: allocates device memory and hands out queues.
pub trait Backend: Send + Sync {
    /// Human-readable backend name.
    fn name(&self) -> &str;

    /// Number of devices this backend drives.
    fn num_devices(&self) -> usize;

    /// Allocate a zero-initialized array of `len` elements.
    fn allocate(&self, len: usize) -> Result<DeviceArray>;

    /// Command queue for device `index`.
    fn queue(&self, index: usize) -> Result<CommandQueue>;
}
