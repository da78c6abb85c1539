//! Accelerator device abstraction.
//!
//! Buffers keep a device-side copy of their data in a [`DeviceArray`]
//! allocated through a [`Context`]. Data moves between host and device
//! memory through a [`CommandQueue`] bound to one device.
//!
//! Real kernel APIs are outside the scope of this crate; [`SimBackend`]
//! implements the contract with host memory so pipelines run anywhere.
//!
//! ```rust
//! use tomoflow::device::Context;
//!
//! let ctx = Context::sim(2);
//! assert_eq!(ctx.num_devices(), 2);
//! let queue = ctx.queue(1).unwrap();
//! assert_eq!(queue.device(), 1);
//! ```

mod sim;
mod traits;

pub use sim::{SimBackend, SimQueue, TransferStats};
pub use traits::{Backend, CommandQueue, DeviceArray, DeviceHandle, Queue};

use crate::error::Result;
use std::sync::Arc;

/// Shared handle to an accelerator backend.
#[derive(Clone)]
pub struct Context {
    backend: Arc<dyn Backend>,
}

impl Context {
    /// Wrap a backend.
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Context over a fresh [`SimBackend`] with `num_devices` devices.
    pub fn sim(num_devices: usize) -> Self {
        Self::new(Arc::new(SimBackend::new(num_devices)))
    }

    /// Like [`Context::sim`], also returning the backend's transfer counters.
    pub fn sim_with_stats(num_devices: usize) -> (Self, Arc<TransferStats>) {
        let backend = SimBackend::new(num_devices);
        let stats = backend.stats();
        (Self::new(Arc::new(backend)), stats)
    }

    /// Backend name.
    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Number of devices.
    pub fn num_devices(&self) -> usize {
        self.backend.num_devices()
    }

    /// Allocate a zeroed device array.
    pub fn allocate(&self, len: usize) -> Result<DeviceArray> {
        self.backend.allocate(len)
    }

    /// Command queue for device `index`.
    pub fn queue(&self, index: usize) -> Result<CommandQueue> {
        self.backend.queue(index)
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("backend", &self.backend.name())
            .field("devices", &self.backend.num_devices())
            .finish()
    }
}
