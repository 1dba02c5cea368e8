//! GPU context management.

use crate::device::DeviceApi;
use crate::error::{GpuError, Result};
use crate::instance::{create_instance, device_name, select_physical_device};
use crate::memory::{BufferDesc, GpuAllocator, Image2dDesc};
use crate::pipeline::{create_graphics_pipeline, GraphicsPipelineConfig};
use crate::queue::GpuQueue;
use crate::resource::{BufferHandle, ImageHandle, PipelineHandle};
use crate::staging::StagingBufferPool;
use crate::sync::{BinarySemaphore, TimelineSemaphore};
use ash::vk;
use std::ffi::CStr;
use std::sync::Arc;

/// Main GPU context holding the Vulkan instance, device and allocator.
///
/// Everything created through the context holds a reference to the device,
/// but the device itself is destroyed when the context drops. Drop queues,
/// swapchains and resource handles first.
pub struct GpuContext {
    entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: Arc<ash::Device>,
    device_name: String,
    allocator: GpuAllocator,
    graphics_queue_family: u32,
    graphics_queue: vk::Queue,
}

impl GpuContext {
    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// The device as the seam command lists and handles record through.
    pub fn device_api(&self) -> Arc<dyn DeviceApi> {
        self.device.clone()
    }

    /// The loaded Vulkan entry points.
    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    /// Get the Vulkan instance handle.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Name of the selected GPU.
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Get the graphics queue family index.
    pub fn graphics_queue_family(&self) -> u32 {
        self.graphics_queue_family
    }

    /// Get access to the GPU allocator.
    pub fn allocator(&self) -> &GpuAllocator {
        &self.allocator
    }

    /// Create a buffer backed by freshly allocated memory.
    pub fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferHandle> {
        self.allocator.create_buffer(desc)
    }

    /// Create a 2D image with a view. The image starts in `UNDEFINED` layout.
    pub fn create_image_2d(&self, desc: &Image2dDesc) -> Result<ImageHandle> {
        self.allocator.create_image_2d(desc)
    }

    pub fn create_timeline_semaphore(&self, initial_value: u64) -> Result<TimelineSemaphore> {
        TimelineSemaphore::new(self.device_api(), initial_value)
    }

    pub fn create_binary_semaphore(&self) -> Result<BinarySemaphore> {
        BinarySemaphore::new(self.device_api())
    }

    /// Wrap the graphics queue.
    ///
    /// A `vkQueue` must be externally synchronized, so keep a single
    /// [`GpuQueue`] per context.
    pub fn create_queue(&self) -> GpuQueue {
        GpuQueue::new(
            self.device_api(),
            self.graphics_queue,
            self.graphics_queue_family,
        )
    }

    /// Pool of host-visible staging buffers of `buffer_size` bytes each.
    pub fn staging_pool(&self, buffer_size: u64) -> StagingBufferPool {
        let allocator = self.allocator.clone();
        StagingBufferPool::new(buffer_size, move |size| {
            allocator.create_buffer(&BufferDesc::staging(size))
        })
    }

    /// Create a graphics pipeline for dynamic rendering.
    ///
    /// # Safety
    /// Shader code must be valid SPIR-V and the descriptor set layouts must
    /// come from this context's device.
    pub unsafe fn create_graphics_pipeline(
        &self,
        config: &GraphicsPipelineConfig,
        descriptor_set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<PipelineHandle> {
        // SAFETY: forwarded from the caller.
        unsafe {
            create_graphics_pipeline(
                &self.device,
                config,
                descriptor_set_layouts,
                push_constant_ranges,
            )
        }
    }

    /// Wait for device to be idle.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_idle(&self) -> Result<()> {
        // SAFETY: the device is alive for as long as the context.
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        // SAFETY: after the idle wait the GPU no longer uses any object.
        unsafe {
            let _ = self.device.device_wait_idle();

            // Shutdown allocator BEFORE destroying device
            // This frees all VkDeviceMemory allocations
            self.allocator.shutdown();

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
        tracing::debug!("Destroyed GPU context");
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "Voxa".to_string(),
            enable_validation: cfg!(debug_assertions),
        }
    }
}

impl GpuContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Build the GPU context.
    pub fn build(self) -> Result<GpuContext> {
        // SAFETY: loading the system Vulkan library has no preconditions we can check.
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;

        // SAFETY: `entry` was just loaded.
        let instance = unsafe { create_instance(&entry, &self.app_name, self.enable_validation) }?;

        // SAFETY: the instance is valid; it is destroyed on every failure path below.
        let selected = unsafe { bootstrap_device(&instance) };
        let (physical_device, graphics_queue_family, device) = match selected {
            Ok(selected) => selected,
            Err(e) => {
                // SAFETY: nothing else was created from the instance.
                unsafe { instance.destroy_instance(None) };
                return Err(e);
            }
        };

        // SAFETY: the physical device comes from this instance.
        let device_name = unsafe { device_name(&instance, physical_device) };
        tracing::info!("Selected GPU: {device_name}");

        // SAFETY: the queue family was requested at device creation.
        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };
        let device = Arc::new(device);

        // SAFETY: all three handles are valid.
        let allocator = match unsafe {
            GpuAllocator::new(&instance, Arc::clone(&device), physical_device)
        } {
            Ok(allocator) => allocator,
            Err(e) => {
                // SAFETY: the device has no children yet.
                unsafe {
                    device.destroy_device(None);
                    instance.destroy_instance(None);
                }
                return Err(e);
            }
        };

        Ok(GpuContext {
            entry,
            instance,
            physical_device,
            device,
            device_name,
            allocator,
            graphics_queue_family,
            graphics_queue,
        })
    }
}

/// Pick the physical device and create the logical device on it.
unsafe fn bootstrap_device(
    instance: &ash::Instance,
) -> Result<(vk::PhysicalDevice, u32, ash::Device)> {
    // SAFETY: forwarded from the caller.
    unsafe {
        let physical_device = select_physical_device(instance)?;
        let graphics_queue_family = find_graphics_queue_family(instance, physical_device)?;
        let device = create_device(instance, physical_device, graphics_queue_family)?;
        Ok((physical_device, graphics_queue_family, device))
    }
}

/// Find the first queue family with graphics support.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn find_graphics_queue_family(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<u32> {
    // SAFETY: forwarded from the caller.
    let queue_families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

    // Graphics queue families also support transfer
    queue_families
        .iter()
        .position(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .and_then(|i| u32::try_from(i).ok())
        .ok_or(GpuError::NoSuitableDevice)
}

/// Required device extensions.
fn required_device_extensions() -> Vec<&'static CStr> {
    vec![ash::khr::swapchain::NAME]
}

/// Create the logical device with one graphics queue.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    graphics_queue_family: u32,
) -> Result<ash::Device> {
    let queue_priority = 1.0_f32;
    let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(graphics_queue_family)
        .queue_priorities(std::slice::from_ref(&queue_priority))];

    let extensions = required_device_extensions();
    let extension_names: Vec<*const i8> = extensions.iter().map(|ext| ext.as_ptr()).collect();

    // Dynamic rendering and submit2 barriers are core in 1.3
    let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default()
        .dynamic_rendering(true)
        .synchronization2(true);

    // Timeline semaphores track GPU completion per submission
    let mut vulkan_1_2_features =
        vk::PhysicalDeviceVulkan12Features::default().timeline_semaphore(true);

    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .push_next(&mut vulkan_1_3_features)
        .push_next(&mut vulkan_1_2_features);

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .push_next(&mut features2);

    // SAFETY: forwarded from the caller.
    let device = unsafe { instance.create_device(physical_device, &device_create_info, None) }
        .map_err(|e| match e {
            vk::Result::ERROR_EXTENSION_NOT_PRESENT => {
                GpuError::ExtensionNotSupported(ash::khr::swapchain::NAME.to_string_lossy().into())
            }
            e => GpuError::from(e),
        })?;

    Ok(device)
}
