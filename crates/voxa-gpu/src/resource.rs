//! Shared-ownership handles for GPU buffers, images and pipelines.
//!
//! A handle is a cheap clone of an `Arc` around the native object. The native
//! object is destroyed when the last clone is dropped, which includes the
//! clones a [`CommandList`](crate::CommandList) keeps for every resource it
//! recorded a command against. That is what keeps in-flight resources alive
//! until the list is reset.

use std::fmt;
use std::sync::Arc;

use ash::vk;
use parking_lot::RwLock;

use crate::device::DeviceApi;
use crate::error::{GpuError, Result};
use crate::memory::MemoryBlock;

/// A GPU buffer. Always accessed through a [`BufferHandle`].
pub struct Buffer {
    device: Arc<dyn DeviceApi>,
    raw: vk::Buffer,
    size: u64,
    // Dropped after the buffer is destroyed.
    memory: Option<MemoryBlock>,
    name: String,
}

impl Drop for Buffer {
    fn drop(&mut self) {
        tracing::trace!(buffer = ?self.raw, name = %self.name, "destroying buffer");
        // SAFETY: the last handle is gone, so no recording or pending command
        // list can still reference the buffer.
        unsafe { self.device.destroy_buffer(self.raw) };
    }
}

/// Shared handle to a [`Buffer`].
#[derive(Clone)]
pub struct BufferHandle(Arc<Buffer>);

impl BufferHandle {
    /// Adopt a native buffer.
    ///
    /// # Safety
    /// `raw` must be a buffer created from `device` with at least `size`
    /// bytes, and nothing else may destroy it.
    pub unsafe fn from_raw(
        device: Arc<dyn DeviceApi>,
        raw: vk::Buffer,
        size: u64,
        memory: Option<MemoryBlock>,
        name: impl Into<String>,
    ) -> Self {
        Self(Arc::new(Buffer {
            device,
            raw,
            size,
            memory,
            name: name.into(),
        }))
    }

    pub fn raw(&self) -> vk::Buffer {
        self.0.raw
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.0.size
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Whether both handles refer to the same buffer.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    /// Number of live handles, including those retained by command lists.
    pub fn strong_count(this: &Self) -> usize {
        Arc::strong_count(&this.0)
    }

    /// Pointer to host-visible memory, if the buffer is mapped.
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.0.memory.as_ref().and_then(MemoryBlock::mapped_ptr)
    }

    /// Write raw bytes at `offset` (buffer must be host-visible).
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        let ptr = self
            .mapped_ptr()
            .ok_or_else(|| GpuError::InvalidState(format!("Buffer '{}' is not mapped", self.name())))?;

        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| GpuError::InvalidState("Offset overflow".to_string()))?;
        if end > self.size() {
            return Err(GpuError::InvalidState(format!(
                "Write of {} bytes at offset {offset} exceeds buffer '{}' ({} bytes)",
                data.len(),
                self.name(),
                self.size()
            )));
        }

        // SAFETY: the mapping covers the whole buffer and the range was checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
        }

        Ok(())
    }

    /// Write plain-old-data values at the start of the buffer.
    pub fn write<T: bytemuck::Pod>(&self, data: &[T]) -> Result<()> {
        self.write_bytes(0, bytemuck::cast_slice(data))
    }
}

impl fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferHandle")
            .field("raw", &self.0.raw)
            .field("size", &self.0.size)
            .field("name", &self.0.name)
            .finish_non_exhaustive()
    }
}

/// Native parts of a 2D image.
#[derive(Clone, Copy, Debug)]
pub struct RawImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub aspect: vk::ImageAspectFlags,
    /// Layout the image is in when adopted.
    pub layout: vk::ImageLayout,
}

/// A 2D GPU image with its view. Always accessed through an [`ImageHandle`].
pub struct Image {
    device: Arc<dyn DeviceApi>,
    raw: RawImage,
    // Swapchain images belong to the swapchain; only the view is ours.
    owns_image: bool,
    layout: RwLock<vk::ImageLayout>,
    memory: Option<MemoryBlock>,
    name: String,
}

impl Drop for Image {
    fn drop(&mut self) {
        tracing::trace!(image = ?self.raw.image, name = %self.name, "destroying image");
        // SAFETY: the last handle is gone.
        unsafe {
            self.device.destroy_image_view(self.raw.view);
            if self.owns_image {
                self.device.destroy_image(self.raw.image);
            }
        }
    }
}

/// Shared handle to an [`Image`].
///
/// The image's current layout is shared by every clone: a transition recorded
/// through one handle is visible through all of them.
#[derive(Clone)]
pub struct ImageHandle(Arc<Image>);

impl ImageHandle {
    /// Adopt a native image and its view. Both are destroyed with the last handle.
    ///
    /// # Safety
    /// `raw.image` and `raw.view` must be created from `device`, and
    /// `raw.layout` must be the layout the image is actually in.
    pub unsafe fn from_raw(
        device: Arc<dyn DeviceApi>,
        raw: RawImage,
        memory: Option<MemoryBlock>,
        name: impl Into<String>,
    ) -> Self {
        Self::new(device, raw, true, memory, name.into())
    }

    /// Wrap a swapchain image. Only the view is destroyed with the last handle.
    ///
    /// # Safety
    /// As for [`ImageHandle::from_raw`]. The swapchain must outlive every handle.
    pub unsafe fn from_swapchain(
        device: Arc<dyn DeviceApi>,
        raw: RawImage,
        name: impl Into<String>,
    ) -> Self {
        Self::new(device, raw, false, None, name.into())
    }

    fn new(
        device: Arc<dyn DeviceApi>,
        raw: RawImage,
        owns_image: bool,
        memory: Option<MemoryBlock>,
        name: String,
    ) -> Self {
        Self(Arc::new(Image {
            device,
            raw,
            owns_image,
            layout: RwLock::new(raw.layout),
            memory,
            name,
        }))
    }

    pub fn raw(&self) -> vk::Image {
        self.0.raw.image
    }

    pub fn view(&self) -> vk::ImageView {
        self.0.raw.view
    }

    pub fn format(&self) -> vk::Format {
        self.0.raw.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.0.raw.extent
    }

    pub fn aspect(&self) -> vk::ImageAspectFlags {
        self.0.raw.aspect
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// The layout as of the most recently recorded transition.
    pub fn layout(&self) -> vk::ImageLayout {
        *self.0.layout.read()
    }

    /// Only command lists move images between layouts.
    pub(crate) fn set_layout(&self, layout: vk::ImageLayout) {
        *self.0.layout.write() = layout;
    }

    /// Whether the image memory is owned by this handle (false for swapchain images).
    pub fn owns_image(&self) -> bool {
        self.0.owns_image
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    pub fn strong_count(this: &Self) -> usize {
        Arc::strong_count(&this.0)
    }

    /// Whether the image has a memory block from the allocator.
    pub fn is_allocated(&self) -> bool {
        self.0.memory.is_some()
    }
}

impl fmt::Debug for ImageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageHandle")
            .field("raw", &self.0.raw.image)
            .field("extent", &self.0.raw.extent)
            .field("layout", &self.layout())
            .field("name", &self.0.name)
            .finish_non_exhaustive()
    }
}

/// A pipeline and its layout. Always accessed through a [`PipelineHandle`].
pub struct Pipeline {
    device: Arc<dyn DeviceApi>,
    raw: vk::Pipeline,
    layout: vk::PipelineLayout,
    bind_point: vk::PipelineBindPoint,
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        tracing::trace!(pipeline = ?self.raw, "destroying pipeline");
        // SAFETY: the last handle is gone.
        unsafe {
            self.device.destroy_pipeline(self.raw);
            self.device.destroy_pipeline_layout(self.layout);
        }
    }
}

/// Shared handle to a [`Pipeline`].
#[derive(Clone)]
pub struct PipelineHandle(Arc<Pipeline>);

impl PipelineHandle {
    /// Adopt a native pipeline and its layout.
    ///
    /// # Safety
    /// Both objects must be created from `device`, and `bind_point` must match
    /// how the pipeline was created.
    pub unsafe fn from_raw(
        device: Arc<dyn DeviceApi>,
        raw: vk::Pipeline,
        layout: vk::PipelineLayout,
        bind_point: vk::PipelineBindPoint,
    ) -> Self {
        Self(Arc::new(Pipeline {
            device,
            raw,
            layout,
            bind_point,
        }))
    }

    pub fn raw(&self) -> vk::Pipeline {
        self.0.raw
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.0.layout
    }

    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        self.0.bind_point
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    pub fn strong_count(this: &Self) -> usize {
        Arc::strong_count(&this.0)
    }
}

impl fmt::Debug for PipelineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineHandle")
            .field("raw", &self.0.raw)
            .field("bind_point", &self.0.bind_point)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, FakeDevice};

    #[test]
    fn buffer_destroyed_with_last_handle() {
        let device = FakeDevice::new();
        let buffer = device.buffer(256);
        let raw = buffer.raw();
        let clone = buffer.clone();
        assert_eq!(BufferHandle::strong_count(&buffer), 2);

        drop(buffer);
        assert_eq!(device.count(|c| matches!(c, Call::DestroyBuffer(_))), 0);

        drop(clone);
        assert_eq!(
            device.count(|c| matches!(c, Call::DestroyBuffer(b) if *b == raw)),
            1
        );
    }

    #[test]
    fn layout_is_shared_between_clones() {
        let device = FakeDevice::new();
        let image = device.image(64, 64);
        let clone = image.clone();
        assert_eq!(clone.layout(), vk::ImageLayout::UNDEFINED);

        image.set_layout(vk::ImageLayout::GENERAL);
        assert_eq!(clone.layout(), vk::ImageLayout::GENERAL);
    }

    #[test]
    fn swapchain_image_only_destroys_view() {
        let device = FakeDevice::new();
        let raw = RawImage {
            image: vk::Handle::from_raw(900),
            view: vk::Handle::from_raw(901),
            format: vk::Format::B8G8R8A8_SRGB,
            extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            aspect: vk::ImageAspectFlags::COLOR,
            layout: vk::ImageLayout::UNDEFINED,
        };
        // SAFETY: fake handles.
        let image = unsafe { ImageHandle::from_swapchain(device.api(), raw, "swapchain image 0") };
        assert!(!image.owns_image());
        drop(image);

        assert_eq!(device.count(|c| matches!(c, Call::DestroyImageView(_))), 1);
        assert_eq!(device.count(|c| matches!(c, Call::DestroyImage(_))), 0);
    }

    #[test]
    fn pipeline_destroys_pipeline_and_layout() {
        let device = FakeDevice::new();
        drop(device.pipeline());
        assert_eq!(device.count(|c| matches!(c, Call::DestroyPipeline(_))), 1);
        assert_eq!(
            device.count(|c| matches!(c, Call::DestroyPipelineLayout(_))),
            1
        );
    }

    #[test]
    fn write_to_unmapped_buffer_fails() {
        let device = FakeDevice::new();
        let buffer = device.buffer(16);
        let err = buffer.write(&[1u32, 2, 3, 4]).unwrap_err();
        assert!(matches!(err, GpuError::InvalidState(_)));
    }
}
