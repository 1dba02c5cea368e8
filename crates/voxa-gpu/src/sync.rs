//! Synchronization primitives.

use std::sync::Arc;

use ash::vk;

use crate::device::DeviceApi;
use crate::error::Result;

/// A timeline semaphore: a 64-bit counter shared by the host and the GPU.
pub struct TimelineSemaphore {
    device: Arc<dyn DeviceApi>,
    raw: vk::Semaphore,
}

impl TimelineSemaphore {
    /// Create a timeline starting at `initial_value`.
    pub fn new(device: Arc<dyn DeviceApi>, initial_value: u64) -> Result<Self> {
        // SAFETY: the semaphore is owned by the returned value.
        let raw = unsafe { device.create_semaphore(Some(initial_value))? };
        Ok(Self { device, raw })
    }

    pub fn raw(&self) -> vk::Semaphore {
        self.raw
    }

    /// Current counter value.
    pub fn value(&self) -> Result<u64> {
        // SAFETY: `raw` is a live timeline semaphore.
        Ok(unsafe { self.device.semaphore_counter_value(self.raw)? })
    }

    /// Signal `value` from the host. Must be greater than the current value.
    pub fn set_value(&self, value: u64) -> Result<()> {
        // SAFETY: `raw` is a live timeline semaphore.
        unsafe { self.device.signal_semaphore(self.raw, value)? };
        Ok(())
    }

    /// Block until the counter reaches `value`.
    ///
    /// Returns `false` if `timeout_ns` elapsed first.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_for_value(&self, value: u64, timeout_ns: u64) -> Result<bool> {
        // SAFETY: `raw` is a live timeline semaphore.
        Ok(unsafe { self.device.wait_semaphore(self.raw, value, timeout_ns)? })
    }
}

impl Drop for TimelineSemaphore {
    fn drop(&mut self) {
        // SAFETY: owners only drop semaphores with no pending signal operations.
        unsafe { self.device.destroy_semaphore(self.raw) };
    }
}

/// A binary semaphore, used for swapchain acquire and present.
pub struct BinarySemaphore {
    device: Arc<dyn DeviceApi>,
    raw: vk::Semaphore,
}

impl BinarySemaphore {
    pub fn new(device: Arc<dyn DeviceApi>) -> Result<Self> {
        // SAFETY: the semaphore is owned by the returned value.
        let raw = unsafe { device.create_semaphore(None)? };
        Ok(Self { device, raw })
    }

    pub fn raw(&self) -> vk::Semaphore {
        self.raw
    }
}

impl Drop for BinarySemaphore {
    fn drop(&mut self) {
        // SAFETY: owners only drop semaphores with no pending operations.
        unsafe { self.device.destroy_semaphore(self.raw) };
    }
}
