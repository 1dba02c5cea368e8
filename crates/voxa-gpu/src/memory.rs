//! GPU memory management.
//!
//! [`GpuAllocator`] wraps gpu-allocator and hands out resource handles whose
//! memory is returned to the allocator when the handle's native object is
//! destroyed.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;

use crate::device::DeviceApi;
use crate::error::{GpuError, Result};
use crate::resource::{BufferHandle, ImageHandle, RawImage};

type SharedAllocator = Arc<Mutex<Option<Allocator>>>;

/// Memory bound to a buffer or image. Freed on drop.
pub struct MemoryBlock {
    allocation: Option<Allocation>,
    allocator: SharedAllocator,
}

impl MemoryBlock {
    pub(crate) fn mapped_ptr(&self) -> Option<*mut u8> {
        self.allocation
            .as_ref()
            .and_then(Allocation::mapped_ptr)
            .map(|p| p.as_ptr().cast::<u8>())
    }
}

impl Drop for MemoryBlock {
    fn drop(&mut self) {
        let Some(allocation) = self.allocation.take() else {
            return;
        };
        match self.allocator.lock().as_mut() {
            Some(allocator) => {
                if let Err(e) = allocator.free(allocation) {
                    tracing::warn!("Failed to free GPU allocation: {e}");
                }
            }
            // The allocator already released every device memory block.
            None => tracing::warn!("GPU allocation outlived the allocator"),
        }
    }
}

/// Buffer creation parameters.
#[derive(Clone, Debug)]
pub struct BufferDesc {
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
    pub name: String,
}

impl BufferDesc {
    /// Device-local buffer.
    pub fn new(size: u64, usage: vk::BufferUsageFlags) -> Self {
        Self {
            size,
            usage,
            location: MemoryLocation::GpuOnly,
            name: "buffer".to_string(),
        }
    }

    /// Host-visible transfer source.
    pub fn staging(size: u64) -> Self {
        Self {
            size,
            usage: vk::BufferUsageFlags::TRANSFER_SRC,
            location: MemoryLocation::CpuToGpu,
            name: "staging buffer".to_string(),
        }
    }

    pub fn location(mut self, location: MemoryLocation) -> Self {
        self.location = location;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// 2D image creation parameters.
#[derive(Clone, Debug)]
pub struct Image2dDesc {
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub aspect: vk::ImageAspectFlags,
    pub name: String,
}

impl Image2dDesc {
    /// Color image usable as a render target and transfer source.
    pub fn color(width: u32, height: u32, format: vk::Format) -> Self {
        Self {
            width,
            height,
            format,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC,
            aspect: vk::ImageAspectFlags::COLOR,
            name: "color image".to_string(),
        }
    }

    /// Depth image usable as a depth attachment.
    pub fn depth(width: u32, height: u32, format: vk::Format) -> Self {
        Self {
            width,
            height,
            format,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            aspect: vk::ImageAspectFlags::DEPTH,
            name: "depth image".to_string(),
        }
    }

    pub fn usage(mut self, usage: vk::ImageUsageFlags) -> Self {
        self.usage = usage;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// GPU memory allocator wrapper.
///
/// Clones share one allocator. [`shutdown`](Self::shutdown) must run before
/// the device is destroyed; [`GpuContext`](crate::GpuContext) does this on drop.
#[derive(Clone)]
pub struct GpuAllocator {
    allocator: SharedAllocator,
    device: Arc<ash::Device>,
}

impl GpuAllocator {
    /// Create a new allocator.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: gpu_allocator::AllocationSizes::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            allocator: Arc::new(Mutex::new(Some(allocator))),
            device,
        })
    }

    fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> Result<MemoryBlock> {
        let allocation = self
            .allocator
            .lock()
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator has been shut down".to_string()))?
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(MemoryBlock {
            allocation: Some(allocation),
            allocator: Arc::clone(&self.allocator),
        })
    }

    /// Create a buffer and bind fresh memory to it.
    pub fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferHandle> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        // SAFETY: the device is alive for as long as the allocator.
        let buffer = unsafe { self.device.create_buffer(&buffer_info, None)? };
        // SAFETY: `buffer` was just created from this device.
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let bound = self
            .allocate(&desc.name, requirements, desc.location, true)
            .and_then(|memory| {
                let allocation = memory
                    .allocation
                    .as_ref()
                    .ok_or_else(|| GpuError::InvalidState("Empty memory block".to_string()))?;
                // SAFETY: the allocation satisfies `requirements` and is unbound.
                unsafe {
                    self.device
                        .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())?;
                }
                Ok(memory)
            });

        let memory = match bound {
            Ok(memory) => memory,
            Err(e) => {
                // SAFETY: the buffer was never handed out.
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let device: Arc<dyn DeviceApi> = self.device.clone();
        // SAFETY: the buffer is exclusively owned by the new handle.
        Ok(unsafe { BufferHandle::from_raw(device, buffer, desc.size, Some(memory), &desc.name) })
    }

    /// Create a device-local 2D image with a matching view.
    ///
    /// The image starts in `UNDEFINED` layout.
    pub fn create_image_2d(&self, desc: &Image2dDesc) -> Result<ImageHandle> {
        let extent = vk::Extent2D {
            width: desc.width,
            height: desc.height,
        };
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        // SAFETY: the device is alive for as long as the allocator.
        let image = unsafe { self.device.create_image(&image_info, None)? };
        // SAFETY: `image` was just created from this device.
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let bound = self
            .allocate(&desc.name, requirements, MemoryLocation::GpuOnly, false)
            .and_then(|memory| {
                let allocation = memory
                    .allocation
                    .as_ref()
                    .ok_or_else(|| GpuError::InvalidState("Empty memory block".to_string()))?;
                // SAFETY: the allocation satisfies `requirements` and is unbound.
                unsafe {
                    self.device
                        .bind_image_memory(image, allocation.memory(), allocation.offset())?;
                }

                let view_info = vk::ImageViewCreateInfo::default()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(desc.format)
                    .subresource_range(
                        vk::ImageSubresourceRange::default()
                            .aspect_mask(desc.aspect)
                            .level_count(1)
                            .layer_count(1),
                    );
                // SAFETY: the image is bound to memory.
                let view = unsafe { self.device.create_image_view(&view_info, None)? };
                Ok((memory, view))
            });

        let (memory, view) = match bound {
            Ok(parts) => parts,
            Err(e) => {
                // SAFETY: the image was never handed out.
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let raw = RawImage {
            image,
            view,
            format: desc.format,
            extent,
            aspect: desc.aspect,
            layout: vk::ImageLayout::UNDEFINED,
        };
        let device: Arc<dyn DeviceApi> = self.device.clone();
        // SAFETY: image and view are exclusively owned by the new handle.
        Ok(unsafe { ImageHandle::from_raw(device, raw, Some(memory), &desc.name) })
    }

    /// Shutdown the allocator, freeing all GPU memory.
    ///
    /// Must be called before the Vulkan device is destroyed. Allocations still
    /// held by handles are reported as leaks.
    pub fn shutdown(&self) {
        if let Some(allocator) = self.allocator.lock().take() {
            drop(allocator);
        }
    }
}
