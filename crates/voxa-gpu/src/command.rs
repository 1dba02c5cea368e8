//! Command lists.
//!
//! A [`CommandList`] owns one native command pool and the single primary
//! command buffer allocated from it. Recording follows an explicit state
//! machine:
//!
//! ```text
//!          begin                 begin_rendering
//!   Idle ────────► Recording ◄─────────────────► Rendering
//!    ▲                 │          end_rendering
//!    │ reset           │ end
//!    └──────────── Executable
//! ```
//!
//! Every resource a command is recorded against is cloned into the list and
//! held until [`CommandList::reset`], so nothing the GPU may still read is
//! destroyed while the list is in flight. Calling an operation from the wrong
//! state is a programming error and panics.

use std::sync::Arc;

use ash::vk;

use crate::attachment::{attachment_info, render_area, RenderingInfo};
use crate::device::DeviceApi;
use crate::error::Result;
use crate::resource::{BufferHandle, ImageHandle, PipelineHandle};

/// Initial capacity of the per-list usage and attachment scratch vectors.
const USAGE_CAPACITY: usize = 10;

/// Where a command list is in its record/submit cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordingState {
    /// Nothing recorded since creation or the last reset.
    Idle,
    /// Between `begin` and `end`, outside a render pass.
    Recording,
    /// Between `begin_rendering` and `end_rendering`.
    Rendering,
    /// Ended and ready for submission.
    Executable,
}

impl RecordingState {
    /// Number of open scopes (`begin` and `begin_rendering`).
    pub const fn operations_in_progress(self) -> u32 {
        match self {
            Self::Idle | Self::Executable => 0,
            Self::Recording => 1,
            Self::Rendering => 2,
        }
    }
}

/// Records GPU commands and keeps the resources they touch alive.
pub struct CommandList {
    device: Arc<dyn DeviceApi>,
    pool: vk::CommandPool,
    buffer: vk::CommandBuffer,
    state: RecordingState,
    used_buffers: Vec<BufferHandle>,
    used_images: Vec<ImageHandle>,
    used_pipelines: Vec<PipelineHandle>,
    attachment_scratch: Vec<vk::RenderingAttachmentInfo<'static>>,
}

// SAFETY: the scratch attachments never carry a `p_next` chain, and they are
// cleared before `begin_rendering` returns. Every other field is `Send`.
unsafe impl Send for CommandList {}

impl CommandList {
    /// Create a command list with its own transient pool on `queue_family`.
    pub fn new(device: Arc<dyn DeviceApi>, queue_family: u32) -> Result<Self> {
        // SAFETY: the pool is owned by this list and destroyed in `Drop`.
        let pool = unsafe {
            device.create_command_pool(queue_family, vk::CommandPoolCreateFlags::TRANSIENT)?
        };

        // SAFETY: `pool` was just created from `device`.
        let buffer = match unsafe { device.allocate_command_buffer(pool) } {
            Ok(buffer) => buffer,
            Err(e) => {
                // SAFETY: nothing was allocated from the pool.
                unsafe { device.destroy_command_pool(pool) };
                return Err(e.into());
            }
        };

        tracing::debug!(?pool, ?buffer, queue_family, "Created command list");

        Ok(Self {
            device,
            pool,
            buffer,
            state: RecordingState::Idle,
            used_buffers: Vec::with_capacity(USAGE_CAPACITY),
            used_images: Vec::with_capacity(USAGE_CAPACITY),
            used_pipelines: Vec::with_capacity(USAGE_CAPACITY),
            attachment_scratch: Vec::with_capacity(USAGE_CAPACITY),
        })
    }

    /// The native command buffer.
    pub fn handle(&self) -> vk::CommandBuffer {
        self.buffer
    }

    pub fn state(&self) -> RecordingState {
        self.state
    }

    /// Open scopes: 1 while recording, 2 inside rendering, else 0.
    pub fn operations_in_progress(&self) -> u32 {
        self.state.operations_in_progress()
    }

    /// True until the first `begin` after creation or reset.
    pub fn is_empty(&self) -> bool {
        self.state == RecordingState::Idle
    }

    pub fn used_buffers(&self) -> &[BufferHandle] {
        &self.used_buffers
    }

    pub fn used_images(&self) -> &[ImageHandle] {
        &self.used_images
    }

    pub fn used_pipelines(&self) -> &[PipelineHandle] {
        &self.used_pipelines
    }

    /// Whether `buffer` is held by this list.
    pub fn retains_buffer(&self, buffer: &BufferHandle) -> bool {
        self.used_buffers.iter().any(|b| BufferHandle::ptr_eq(b, buffer))
    }

    /// Whether `image` is held by this list.
    pub fn retains_image(&self, image: &ImageHandle) -> bool {
        self.used_images.iter().any(|i| ImageHandle::ptr_eq(i, image))
    }

    /// Whether `pipeline` is held by this list.
    pub fn retains_pipeline(&self, pipeline: &PipelineHandle) -> bool {
        self.used_pipelines
            .iter()
            .any(|p| PipelineHandle::ptr_eq(p, pipeline))
    }

    #[track_caller]
    fn require(&self, operation: &str, allowed: &[RecordingState]) {
        assert!(
            allowed.contains(&self.state),
            "CommandList::{operation} is not allowed in the {:?} state (expected {allowed:?})",
            self.state
        );
    }

    /// Start recording. The buffer is recorded for one-time submission.
    ///
    /// # Panics
    /// Unless the list is idle. An executed list must be [`reset`](Self::reset) first.
    pub fn begin(&mut self) -> Result<()> {
        self.require("begin", &[RecordingState::Idle]);
        // SAFETY: the buffer is idle, so it is not pending on any queue.
        unsafe {
            self.device
                .begin_command_buffer(self.buffer, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        }
        self.state = RecordingState::Recording;
        Ok(())
    }

    /// Finish recording.
    ///
    /// The recording scope closes even when the native call fails, so a
    /// failed list can still be [`reset`](Self::reset).
    ///
    /// # Panics
    /// Unless the list is recording outside a rendering pass.
    pub fn end(&mut self) -> Result<()> {
        self.require("end", &[RecordingState::Recording]);
        self.state = RecordingState::Executable;
        // SAFETY: the buffer is in the recording state with no open render pass.
        unsafe { self.device.end_command_buffer(self.buffer)? };
        Ok(())
    }

    /// Begin a dynamic rendering pass.
    ///
    /// Attachments are recorded in the layout their images are currently in,
    /// and every attachment image is retained. See
    /// [`render_area`](crate::attachment::render_area) for how the area is chosen.
    pub fn begin_rendering(&mut self, info: &RenderingInfo) {
        self.require("begin_rendering", &[RecordingState::Recording]);

        for color in &info.color_attachments {
            self.attachment_scratch
                .push(attachment_info(color, vk::ResolveModeFlags::NONE));
            self.used_images.push(color.image.clone());
        }

        let depth = info.depth_attachment.as_ref().map(|depth| {
            self.used_images.push(depth.image.clone());
            attachment_info(depth, depth.resolve_mode.unwrap_or_default())
        });
        let stencil = info.stencil_attachment.as_ref().map(|stencil| {
            self.used_images.push(stencil.image.clone());
            attachment_info(stencil, stencil.resolve_mode.unwrap_or_default())
        });

        let mut rendering_info = vk::RenderingInfo::default()
            .render_area(render_area(info))
            .layer_count(1)
            .color_attachments(&self.attachment_scratch);
        if let Some(depth) = depth.as_ref() {
            rendering_info = rendering_info.depth_attachment(depth);
        }
        if let Some(stencil) = stencil.as_ref() {
            rendering_info = rendering_info.stencil_attachment(stencil);
        }

        // SAFETY: the buffer is recording and every view is kept alive by `used_images`.
        unsafe { self.device.cmd_begin_rendering(self.buffer, &rendering_info) };

        self.attachment_scratch.clear();
        self.state = RecordingState::Rendering;
    }

    /// End the current rendering pass.
    pub fn end_rendering(&mut self) {
        self.require("end_rendering", &[RecordingState::Rendering]);
        // SAFETY: a rendering pass is open on this buffer.
        unsafe { self.device.cmd_end_rendering(self.buffer) };
        self.state = RecordingState::Recording;
    }

    /// Bind `pipeline` at its bind point and retain it.
    pub fn bind_pipeline(&mut self, pipeline: &PipelineHandle) {
        self.require(
            "bind_pipeline",
            &[RecordingState::Recording, RecordingState::Rendering],
        );
        // SAFETY: the buffer is recording and the pipeline is retained below.
        unsafe {
            self.device
                .cmd_bind_pipeline(self.buffer, pipeline.bind_point(), pipeline.raw());
        }
        self.used_pipelines.push(pipeline.clone());
    }

    /// Record a non-indexed draw. Counts and offsets are passed through unchecked.
    ///
    /// # Panics
    /// Outside a rendering pass.
    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        self.require("draw", &[RecordingState::Rendering]);
        // SAFETY: a rendering pass is open on this buffer.
        unsafe {
            self.device.cmd_draw(
                self.buffer,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            );
        }
    }

    /// Copy `regions` from `src` into `dst`. Both buffers are retained.
    ///
    /// # Panics
    /// On an empty region list, or if any region reaches past the end of
    /// either buffer.
    pub fn copy_buffer_to_buffer(
        &mut self,
        src: &BufferHandle,
        dst: &BufferHandle,
        regions: &[vk::BufferCopy],
    ) {
        self.require("copy_buffer_to_buffer", &[RecordingState::Recording]);
        assert!(
            !regions.is_empty(),
            "copy_buffer_to_buffer needs at least one region"
        );

        for (i, region) in regions.iter().enumerate() {
            let src_end = region.src_offset.checked_add(region.size);
            assert!(
                src_end.is_some_and(|end| end <= src.size()),
                "copy region {i} reads {} bytes at offset {} past the end of source buffer '{}' ({} bytes)",
                region.size,
                region.src_offset,
                src.name(),
                src.size()
            );
            let dst_end = region.dst_offset.checked_add(region.size);
            assert!(
                dst_end.is_some_and(|end| end <= dst.size()),
                "copy region {i} writes {} bytes at offset {} past the end of destination buffer '{}' ({} bytes)",
                region.size,
                region.dst_offset,
                dst.name(),
                dst.size()
            );
        }

        // SAFETY: regions are in bounds and both buffers are retained below.
        unsafe {
            self.device
                .cmd_copy_buffer(self.buffer, src.raw(), dst.raw(), regions);
        }
        self.used_buffers.push(src.clone());
        self.used_buffers.push(dst.clone());
    }

    /// Transition `image` from its current layout to `new_layout`.
    ///
    /// The barrier is coarse: all commands before it, all
    /// memory reads and writes, against all commands after it. The image's
    /// shared layout is updated immediately so later recordings see the new
    /// layout, and the image is retained.
    pub fn change_image_layout(&mut self, image: &ImageHandle, new_layout: vk::ImageLayout) {
        self.require("change_image_layout", &[RecordingState::Recording]);

        let access = vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE;
        let barrier = vk::ImageMemoryBarrier::default()
            .src_access_mask(access)
            .dst_access_mask(access)
            .old_layout(image.layout())
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image.raw())
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(image.aspect())
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(1),
            );

        // SAFETY: the buffer is recording outside a render pass and the image is retained below.
        unsafe {
            self.device.cmd_pipeline_barrier(
                self.buffer,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[barrier],
            );
        }

        image.set_layout(new_layout);
        self.used_images.push(image.clone());
    }

    /// Set viewport 0.
    pub fn set_viewport(&mut self, viewport: &vk::Viewport) {
        self.require(
            "set_viewport",
            &[RecordingState::Recording, RecordingState::Rendering],
        );
        // SAFETY: the buffer is recording.
        unsafe { self.device.cmd_set_viewport(self.buffer, viewport) };
    }

    /// Set scissor 0.
    pub fn set_scissor(&mut self, scissor: &vk::Rect2D) {
        self.require(
            "set_scissor",
            &[RecordingState::Recording, RecordingState::Rendering],
        );
        // SAFETY: the buffer is recording.
        unsafe { self.device.cmd_set_scissor(self.buffer, scissor) };
    }

    /// Return the list to `Idle` and release every retained resource.
    ///
    /// The caller must know the GPU has finished executing the list;
    /// [`GpuQueue::recycle`](crate::GpuQueue::recycle) does this through timelines.
    ///
    /// # Panics
    /// If a `begin` or `begin_rendering` scope is still open.
    pub fn reset(&mut self) -> Result<()> {
        assert_eq!(
            self.operations_in_progress(),
            0,
            "CommandList::reset with {} operation(s) still in progress ({:?})",
            self.operations_in_progress(),
            self.state
        );

        // SAFETY: the caller guarantees the buffer is no longer pending.
        unsafe {
            self.device
                .reset_command_pool(self.pool, vk::CommandPoolResetFlags::RELEASE_RESOURCES)?;
        }

        self.release_resources();
        Ok(())
    }

    /// Forget recorded work without touching the native pool.
    ///
    /// Used when the pool cannot be reset but the GPU is known to be done with it.
    pub(crate) fn abandon(mut self) {
        tracing::warn!(pool = ?self.pool, state = ?self.state, "Abandoning command list");
        self.release_resources();
    }

    fn release_resources(&mut self) {
        self.used_buffers.clear();
        self.used_images.clear();
        self.used_pipelines.clear();
        self.state = RecordingState::Idle;
    }
}

impl Drop for CommandList {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            assert_eq!(
                self.operations_in_progress(),
                0,
                "CommandList dropped with {} operation(s) still in progress ({:?})",
                self.operations_in_progress(),
                self.state
            );
            assert!(
                self.is_empty(),
                "CommandList dropped while holding recorded work; reset it once the GPU has finished"
            );
        }

        // SAFETY: the list owns both objects and is idle.
        unsafe {
            self.device.free_command_buffer(self.pool, self.buffer);
            self.device.destroy_command_pool(self.pool);
        }
        tracing::debug!(pool = ?self.pool, "Destroyed command list");
    }
}
