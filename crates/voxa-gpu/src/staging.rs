//! Pool of host-visible staging buffers.
//!
//! A [`StagingBuffer`] goes back to its pool when dropped, as long as the pool
//! still exists. A pooled buffer is only handed out again once no command
//! list retains it, so an upload still in flight is never overwritten.

use std::ops::Deref;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::Result;
use crate::resource::BufferHandle;

/// Size of each buffer in the default pool.
pub const STAGING_BUFFER_SIZE: u64 = 16 * 1024 * 1024;

type CreateBuffer = dyn Fn(u64) -> Result<BufferHandle> + Send + Sync;

struct PoolInner {
    buffer_size: u64,
    create: Box<CreateBuffer>,
    buffers: Mutex<Vec<BufferHandle>>,
}

/// Hands out reusable staging buffers of a fixed size.
#[derive(Clone)]
pub struct StagingBufferPool {
    inner: Arc<PoolInner>,
}

impl StagingBufferPool {
    /// Create a pool. `create` allocates one buffer of the requested size.
    pub fn new(
        buffer_size: u64,
        create: impl Fn(u64) -> Result<BufferHandle> + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                buffer_size,
                create: Box::new(create),
                buffers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn buffer_size(&self) -> u64 {
        self.inner.buffer_size
    }

    /// Buffers currently sitting in the pool.
    pub fn available(&self) -> usize {
        self.inner.buffers.lock().len()
    }

    /// Take a free buffer from the pool, or allocate a new one.
    pub fn get(&self) -> Result<StagingBuffer> {
        let reused = {
            let mut buffers = self.inner.buffers.lock();
            buffers
                .iter()
                .position(|b| BufferHandle::strong_count(b) == 1)
                .map(|i| buffers.swap_remove(i))
        };

        let buffer = match reused {
            Some(buffer) => buffer,
            None => {
                tracing::debug!(size = self.inner.buffer_size, "Allocating staging buffer");
                (self.inner.create)(self.inner.buffer_size)?
            }
        };

        Ok(StagingBuffer {
            buffer,
            pool: Arc::downgrade(&self.inner),
        })
    }
}

/// A buffer checked out of a [`StagingBufferPool`].
pub struct StagingBuffer {
    buffer: BufferHandle,
    pool: Weak<PoolInner>,
}

impl StagingBuffer {
    pub fn handle(&self) -> &BufferHandle {
        &self.buffer
    }
}

impl Deref for StagingBuffer {
    type Target = BufferHandle;

    fn deref(&self) -> &BufferHandle {
        &self.buffer
    }
}

impl Drop for StagingBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.buffers.lock().push(self.buffer.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, FakeDevice};

    fn pool(device: &Arc<FakeDevice>, size: u64) -> StagingBufferPool {
        let device = Arc::clone(device);
        StagingBufferPool::new(size, move |size| Ok(device.buffer(size)))
    }

    #[test]
    fn dropped_buffer_returns_to_pool() {
        let device = FakeDevice::new();
        let pool = pool(&device, 1024);

        let staging = pool.get().unwrap();
        assert_eq!(staging.size(), 1024);
        let raw = staging.raw();
        assert_eq!(pool.available(), 0);

        drop(staging);
        assert_eq!(pool.available(), 1);

        let again = pool.get().unwrap();
        assert_eq!(again.raw(), raw);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn retained_buffer_is_not_reused() {
        let device = FakeDevice::new();
        let pool = pool(&device, 256);

        let staging = pool.get().unwrap();
        let in_flight = staging.handle().clone();
        drop(staging);
        assert_eq!(pool.available(), 1);

        let fresh = pool.get().unwrap();
        assert_ne!(fresh.raw(), in_flight.raw());

        drop(in_flight);
        drop(fresh);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn buffer_released_when_pool_is_gone() {
        let device = FakeDevice::new();
        let staging = {
            let pool = pool(&device, 64);
            pool.get().unwrap()
        };
        let raw = staging.raw();
        drop(staging);
        assert_eq!(
            device.count(|c| matches!(c, Call::DestroyBuffer(b) if *b == raw)),
            1
        );
    }

    #[test]
    fn default_size_is_sixteen_mebibytes() {
        assert_eq!(STAGING_BUFFER_SIZE, 16 << 20);
    }
}
