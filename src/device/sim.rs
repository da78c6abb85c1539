//! Simulated accelerator backend.
//!
//! Device memory is ordinary heap memory owned by the [`DeviceArray`], but
//! every transfer goes through a [`SimQueue`] and is counted, so the
//! location logic of [`Buffer`](crate::buffer::Buffer) behaves exactly as it
//! would on real hardware. Transfer failures can be injected for testing.

use super::traits::{Backend, CommandQueue, DeviceArray, DeviceHandle, Queue};
use crate::error::{Error, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Transfer counters shared by a backend and all of its queues.
#[derive(Debug, Default)]
pub struct TransferStats {
    host_to_device: AtomicU64,
    device_to_host: AtomicU64,
    device_to_device: AtomicU64,
    fail: AtomicBool,
}

impl TransferStats {
    /// Number of host → device writes.
    pub fn host_to_device(&self) -> u64 {
        self.host_to_device.load(Ordering::Relaxed)
    }

    /// Number of device → host reads.
    pub fn device_to_host(&self) -> u64 {
        self.device_to_host.load(Ordering::Relaxed)
    }

    /// Number of device → device copies.
    pub fn device_to_device(&self) -> u64 {
        self.device_to_device.load(Ordering::Relaxed)
    }

    /// Total number of transfers.
    pub fn total(&self) -> u64 {
        self.host_to_device() + self.device_to_host() + self.device_to_device()
    }

    /// Make every subsequent transfer fail (or succeed again).
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            Err(Error::Transfer("injected transfer failure".into()))
        } else {
            Ok(())
        }
    }
}

/// Backend whose devices live in host memory.
pub struct SimBackend {
    num_devices: usize,
    stats: Arc<TransferStats>,
}

impl SimBackend {
    /// Create a backend with `num_devices` simulated devices.
    pub fn new(num_devices: usize) -> Self {
        Self {
            num_devices,
            stats: Arc::new(TransferStats::default()),
        }
    }

    /// Transfer counters for this backend.
    pub fn stats(&self) -> Arc<TransferStats> {
        self.stats.clone()
    }
}

impl Backend for SimBackend {
    fn name(&self) -> &str {
        "sim"
    }

    fn num_devices(&self) -> usize {
        self.num_devices
    }

    fn allocate(&self, len: usize) -> Result<DeviceArray> {
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|e| Error::AllocationFailed(format!("{} device elements: {}", len, e)))?;
        data.resize(len, 0.0);
        Ok(DeviceArray::new(DeviceHandle::Sim(data), len))
    }

    fn queue(&self, index: usize) -> Result<CommandQueue> {
        // Host-only setups still need a queue to move data off a device
        // array, so device 0 always exists.
        if index > 0 && index >= self.num_devices {
            return Err(Error::setup(format!(
                "no simulated device {} (have {})",
                index, self.num_devices
            )));
        }
        Ok(Arc::new(SimQueue {
            device: index,
            stats: self.stats.clone(),
        }))
    }
}

/// Command queue of a [`SimBackend`] device.
pub struct SimQueue {
    device: usize,
    stats: Arc<TransferStats>,
}

fn check_len(what: &str, src: usize, dst: usize) -> Result<()> {
    if src != dst {
        return Err(Error::Transfer(format!(
            "{} size mismatch: {} elements into {}",
            what, src, dst
        )));
    }
    Ok(())
}

impl Queue for SimQueue {
    fn device(&self) -> usize {
        self.device
    }

    fn write(&self, src: &[f32], dst: &mut DeviceArray) -> Result<()> {
        self.stats.check()?;
        check_len("write", src.len(), dst.len())?;
        dst.sim_data_mut().copy_from_slice(src);
        self.stats.host_to_device.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn read(&self, src: &DeviceArray, dst: &mut [f32]) -> Result<()> {
        self.stats.check()?;
        check_len("read", src.len(), dst.len())?;
        dst.copy_from_slice(src.sim_data());
        self.stats.device_to_host.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn copy(&self, src: &DeviceArray, dst: &mut DeviceArray) -> Result<()> {
        self.stats.check()?;
        check_len("copy", src.len(), dst.len())?;
        dst.sim_data_mut().copy_from_slice(src.sim_data());
        self.stats.device_to_device.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_counts() {
        let backend = SimBackend::new(1);
        let queue = backend.queue(0).unwrap();
        let mut array = backend.allocate(4).unwrap();

        queue.write(&[1.0, 2.0, 3.0, 4.0], &mut array).unwrap();
        let mut host = vec![0.0; 4];
        queue.read(&array, &mut host).unwrap();

        assert_eq!(host, vec![1.0, 2.0, 3.0, 4.0]);
        let stats = backend.stats();
        assert_eq!(stats.host_to_device(), 1);
        assert_eq!(stats.device_to_host(), 1);
        assert_eq!(stats.total(), 2);
    }

    #[test]
    fn test_size_mismatch() {
        let backend = SimBackend::new(1);
        let queue = backend.queue(0).unwrap();
        let mut array = backend.allocate(2).unwrap();
        assert!(matches!(
            queue.write(&[1.0; 3], &mut array),
            Err(Error::Transfer(_))
        ));
    }

    #[test]
    fn test_injected_failure() {
        let backend = SimBackend::new(2);
        let queue = backend.queue(1).unwrap();
        let src = backend.allocate(2).unwrap();
        let mut dst = backend.allocate(2).unwrap();

        backend.stats().set_fail(true);
        assert!(queue.copy(&src, &mut dst).is_err());
        backend.stats().set_fail(false);
        assert!(queue.copy(&src, &mut dst).is_ok());
        assert_eq!(backend.stats().device_to_device(), 1);
    }

    #[test]
    fn test_queue_out_of_range() {
        let backend = SimBackend::new(2);
        assert!(backend.queue(2).is_err());
        // Device 0 is always available, even without devices.
        assert!(SimBackend::new(0).queue(0).is_ok());
    }
}
